use crate::bridge::BridgeRequest;
use crate::config::RunnerSettings;
use crate::orchestration::intent::TaskCard;
use crate::orchestration::plan::Step;
use crate::orchestration::step_runner::StepResult;
use std::fmt::Write as _;

const TRUNCATION_SUFFIX: &str = "\n[output truncated]";

/// Conservative token estimate: one token per four ASCII characters, one per
/// non-ASCII character. Appending text never lowers the estimate.
pub fn estimate_tokens(text: &str) -> u64 {
    let (ascii, other) = text.chars().fold((0u64, 0u64), |(ascii, other), ch| {
        if ch.is_ascii() {
            (ascii + 1, other)
        } else {
            (ascii, other + 1)
        }
    });
    ascii.div_ceil(4) + other
}

/// Renders the prompt for one step: role instructions, the task card, the
/// original request and the most recent prior outputs.
pub fn render_step_prompt(
    base: &BridgeRequest,
    task_card: &TaskCard,
    step: &Step,
    prior: &[StepResult],
    limits: &RunnerSettings,
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Role: {}", step.worker);
    let _ = writeln!(prompt, "{}", step.worker.instructions());
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "## Step");
    let _ = writeln!(prompt, "id: {}", step.id);
    let _ = writeln!(prompt, "summary: {}", step.summary);
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "## Task card");
    let _ = writeln!(prompt, "objective: {}", task_card.objective);
    let _ = writeln!(prompt, "risk: {}", task_card.risk_level);
    if !task_card.inputs.is_empty() {
        let _ = writeln!(prompt, "inputs:");
        for input in &task_card.inputs {
            let _ = writeln!(prompt, "- {input}");
        }
    }
    if !task_card.done_criteria.is_empty() {
        let _ = writeln!(prompt, "done criteria:");
        for criterion in &task_card.done_criteria {
            let _ = writeln!(prompt, "- {criterion}");
        }
    }
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "## Request");
    let _ = writeln!(prompt, "{}", base.text.trim());
    for attachment in &base.attachments {
        let _ = writeln!(prompt, "[file: {attachment}]");
    }

    let window_start = prior.len().saturating_sub(limits.context_steps);
    let window = &prior[window_start..];
    if !window.is_empty() {
        let _ = writeln!(prompt);
        let _ = writeln!(prompt, "## Prior step outputs");
        for result in window {
            let _ = writeln!(prompt, "### {} ({})", result.step_id, result.worker);
            let _ = writeln!(
                prompt,
                "{}",
                truncate_chars(result.text.trim(), limits.context_chars_per_step)
            );
        }
    }
    prompt
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str(TRUNCATION_SUFFIX);
    truncated
}
