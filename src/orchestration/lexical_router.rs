use crate::orchestration::intent::{Intent, IntentType};

/// Turns a raw chat message into an [`Intent`]. The coordinator depends on
/// this seam so a model-backed classifier can replace the lexical one.
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Intent;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexicalRoutingConfig {
    /// Minimum winning score; anything below falls back to chat.
    pub min_score: f32,
    pub status_weight: f32,
    pub leading_verb_boost: f32,
    /// Execute goals with fewer tokens than this ask for clarification.
    pub min_execute_tokens: usize,
}

impl LexicalRoutingConfig {
    pub fn balanced() -> Self {
        Self {
            min_score: 1.0,
            status_weight: 2.0,
            leading_verb_boost: 1.0,
            min_execute_tokens: 2,
        }
    }
}

impl Default for LexicalRoutingConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LexicalClassifier {
    config: LexicalRoutingConfig,
}

impl LexicalClassifier {
    pub fn new(config: LexicalRoutingConfig) -> Self {
        Self { config }
    }
}

impl IntentClassifier for LexicalClassifier {
    fn classify(&self, text: &str) -> Intent {
        let goal = text.trim();
        let body = strip_politeness(goal);
        let tokens = tokenize_with_positions(body);
        if tokens.is_empty() && !body.chars().any(|ch| !ch.is_ascii()) {
            return Intent::new(IntentType::Chat, goal);
        }

        let config = &self.config;
        let mut scored = [
            (IntentType::Execute, score_execute(body, &tokens, config)),
            (IntentType::Status, score_status(body, &tokens, config)),
            (IntentType::Question, score_question(body, &tokens)),
        ];
        // Stable sort keeps execute ahead of status ahead of question on ties.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let (intent_type, score) = scored[0];
        if score < config.min_score {
            return Intent::new(IntentType::Chat, goal);
        }

        let mut intent = Intent::new(intent_type, goal);
        if intent_type == IntentType::Execute {
            intent.constraints = extract_constraints(goal);
            if is_underspecified(body, &tokens, config) {
                intent
                    .clarifications_needed
                    .push("What exactly should be changed, and where?".to_string());
            }
        }
        intent
    }
}

fn tokenize_with_positions(input: &str) -> Vec<(usize, String)> {
    input
        .to_ascii_lowercase()
        .replace('\'', "")
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-')
        .filter(|token| !token.is_empty())
        .enumerate()
        .map(|(index, token)| (index, token.to_string()))
        .collect()
}

fn strip_politeness(text: &str) -> &str {
    let lowered = text.to_ascii_lowercase();
    for prefix in POLITE_PREFIXES {
        if lowered.starts_with(prefix) {
            let rest = &text[prefix.len()..];
            return rest.trim_start_matches([',', ' ']);
        }
    }
    text
}

fn count_hits(tokens: &[(usize, String)], lexicon: &[&str]) -> usize {
    tokens
        .iter()
        .filter(|(_, token)| lexicon.contains(&token.as_str()))
        .count()
}

fn count_cjk_hits(text: &str, markers: &[&str]) -> usize {
    markers.iter().filter(|marker| text.contains(*marker)).count()
}

fn score_execute(body: &str, tokens: &[(usize, String)], config: &LexicalRoutingConfig) -> f32 {
    let mut score = (count_hits(tokens, EXECUTE_INTENT) + count_cjk_hits(body, EXECUTE_CJK)) as f32;
    let leading_verb = tokens
        .first()
        .is_some_and(|(_, token)| EXECUTE_INTENT.contains(&token.as_str()));
    if leading_verb {
        score += config.leading_verb_boost;
    }
    score
}

fn score_status(body: &str, tokens: &[(usize, String)], config: &LexicalRoutingConfig) -> f32 {
    (count_hits(tokens, STATUS_INTENT) + count_cjk_hits(body, STATUS_CJK)) as f32
        * config.status_weight
}

fn score_question(body: &str, tokens: &[(usize, String)]) -> f32 {
    let mut score = count_cjk_hits(body, QUESTION_CJK) as f32;
    if tokens
        .first()
        .is_some_and(|(_, token)| QUESTION_LEADERS.contains(&token.as_str()))
    {
        score += 1.0;
    }
    let trimmed = body.trim_end();
    if trimmed.ends_with('?') || trimmed.ends_with('？') {
        score += 1.0;
    }
    score
}

fn is_underspecified(body: &str, tokens: &[(usize, String)], config: &LexicalRoutingConfig) -> bool {
    let cjk_chars = body.chars().filter(|ch| !ch.is_ascii()).count();
    tokens.len() < config.min_execute_tokens && cjk_chars < 4
}

/// Collects "don't ..." / "without ..." clauses as constraints.
fn extract_constraints(text: &str) -> Vec<String> {
    text.split(['.', ',', ';', '\n', '，', '。', '；'])
        .map(str::trim)
        .filter(|clause| {
            let lowered = clause.to_lowercase();
            CONSTRAINT_LEADERS
                .iter()
                .any(|leader| lowered.starts_with(leader))
                || CONSTRAINT_CJK.iter().any(|leader| clause.starts_with(leader))
        })
        .map(str::to_string)
        .collect()
}

const POLITE_PREFIXES: &[&str] = &[
    "please ",
    "can you ",
    "could you ",
    "would you ",
    "pls ",
];
const EXECUTE_INTENT: &[&str] = &[
    "fix", "implement", "add", "create", "build", "write", "update", "change", "refactor",
    "remove", "delete", "rename", "migrate", "deploy", "run", "make", "generate", "install",
    "upgrade", "reset", "clear", "drop", "rewrite", "move", "bump",
];
const EXECUTE_CJK: &[&str] = &[
    "修复", "实现", "添加", "新增", "创建", "编写", "更新", "修改", "重构", "删除", "部署", "迁移",
    "生成", "清空", "重置",
];
const STATUS_INTENT: &[&str] = &["status", "progress", "eta", "stuck", "running", "far"];
const STATUS_CJK: &[&str] = &["状态", "进度", "进展"];
const QUESTION_LEADERS: &[&str] = &[
    "what", "why", "how", "when", "where", "which", "who", "is", "are", "does", "do", "should",
];
const QUESTION_CJK: &[&str] = &["吗", "什么", "为什么", "怎么", "如何", "哪"];
const CONSTRAINT_LEADERS: &[&str] = &["dont ", "don't ", "do not ", "without ", "never "];
const CONSTRAINT_CJK: &[&str] = &["不要", "别", "不能"];
