use super::transport::{ChatTransport, MessageRef, TransportError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Posted {
        message: MessageRef,
        thread_ts: Option<String>,
        text: String,
    },
    Updated {
        message: MessageRef,
        text: String,
    },
    Deleted {
        message: MessageRef,
    },
}

#[derive(Debug, Clone)]
struct LiveMessage {
    message: MessageRef,
    text: String,
}

#[derive(Debug, Default)]
struct LocalState {
    events: Vec<TransportEvent>,
    live: Vec<LiveMessage>,
}

/// In-process transport for local sessions. Keeps every delivery so callers
/// can render or inspect the conversation.
#[derive(Debug, Default)]
pub struct LocalTransport {
    next_ts: AtomicU64,
    state: Mutex<LocalState>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.lock().events.clone()
    }

    /// Messages still visible in `channel_id`, oldest first, with their
    /// latest text.
    pub fn visible_messages(&self, channel_id: &str) -> Vec<String> {
        self.lock()
            .live
            .iter()
            .filter(|live| live.message.channel_id == channel_id)
            .map(|live| live.text.clone())
            .collect()
    }

    fn post(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<MessageRef, TransportError> {
        let seq = self.next_ts.fetch_add(1, Ordering::SeqCst) + 1;
        let message = MessageRef {
            channel_id: channel_id.to_string(),
            ts: format!("local.{seq:06}"),
        };
        let mut state = self.lock();
        state.live.push(LiveMessage {
            message: message.clone(),
            text: text.to_string(),
        });
        state.events.push(TransportEvent::Posted {
            message: message.clone(),
            thread_ts: thread_ts.map(str::to_string),
            text: text.to_string(),
        });
        Ok(message)
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found(message: &MessageRef) -> TransportError {
    TransportError::MessageNotFound {
        channel_id: message.channel_id.clone(),
        ts: message.ts.clone(),
    }
}

impl ChatTransport for LocalTransport {
    fn post_message(&self, channel_id: &str, text: &str) -> Result<MessageRef, TransportError> {
        self.post(channel_id, None, text)
    }

    fn update_message(&self, message: &MessageRef, text: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        let live = state
            .live
            .iter_mut()
            .find(|live| &live.message == message)
            .ok_or_else(|| not_found(message))?;
        live.text = text.to_string();
        state.events.push(TransportEvent::Updated {
            message: message.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    fn delete_message(&self, message: &MessageRef) -> Result<(), TransportError> {
        let mut state = self.lock();
        let index = state
            .live
            .iter()
            .position(|live| &live.message == message)
            .ok_or_else(|| not_found(message))?;
        state.live.remove(index);
        state.events.push(TransportEvent::Deleted {
            message: message.clone(),
        });
        Ok(())
    }

    fn post_in_thread(
        &self,
        channel_id: &str,
        thread_ts: &str,
        text: &str,
    ) -> Result<MessageRef, TransportError> {
        self.post(channel_id, Some(thread_ts), text)
    }

    fn user_display_name(&self, user_id: &str) -> Option<String> {
        Some(user_id.to_string())
    }

    fn channel_name(&self, channel_id: &str) -> Option<String> {
        Some(format!("local:{channel_id}"))
    }
}
