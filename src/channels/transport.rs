use std::path::{Component, Path, PathBuf};

pub const OUTBOUND_CHUNK_CHARS: usize = 3500;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub channel_id: String,
    pub ts: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel `{channel_id}` is unavailable: {reason}")]
    Unavailable { channel_id: String, reason: String },
    #[error("message `{ts}` not found in channel `{channel_id}`")]
    MessageNotFound { channel_id: String, ts: String },
    #[error("attachment `{id}` could not be resolved: {reason}")]
    Attachment { id: String, reason: String },
}

/// Outbound side of a chat platform.
pub trait ChatTransport: Send + Sync {
    fn post_message(&self, channel_id: &str, text: &str) -> Result<MessageRef, TransportError>;
    fn update_message(&self, message: &MessageRef, text: &str) -> Result<(), TransportError>;
    fn delete_message(&self, message: &MessageRef) -> Result<(), TransportError>;
    fn post_in_thread(
        &self,
        channel_id: &str,
        thread_ts: &str,
        text: &str,
    ) -> Result<MessageRef, TransportError>;

    fn user_display_name(&self, _user_id: &str) -> Option<String> {
        None
    }

    fn channel_name(&self, _channel_id: &str) -> Option<String> {
        None
    }
}

pub trait AttachmentStore: Send + Sync {
    /// Maps an attachment id from an inbound message to a local file.
    fn resolve(&self, attachment_id: &str) -> Result<PathBuf, TransportError>;
}

/// Attachments stored as plain files directly under one directory.
#[derive(Debug, Clone)]
pub struct DirectoryAttachmentStore {
    root: PathBuf,
}

impl DirectoryAttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AttachmentStore for DirectoryAttachmentStore {
    fn resolve(&self, attachment_id: &str) -> Result<PathBuf, TransportError> {
        let mut components = Path::new(attachment_id).components();
        let is_plain_name = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !is_plain_name {
            return Err(TransportError::Attachment {
                id: attachment_id.to_string(),
                reason: "attachment ids must be plain file names".to_string(),
            });
        }
        let path = self.root.join(attachment_id);
        if !path.is_file() {
            return Err(TransportError::Attachment {
                id: attachment_id.to_string(),
                reason: format!("{} does not exist", path.display()),
            });
        }
        Ok(path)
    }
}

pub fn chunk_message(input: &str) -> Vec<String> {
    if input.is_empty() {
        return vec![String::new()];
    }

    let mut out = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;
    for ch in input.chars() {
        if count >= OUTBOUND_CHUNK_CHARS {
            out.push(current);
            current = String::new();
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Posts `text` in platform-sized chunks, into `thread_ts` when given.
/// Stops at the first failing chunk.
pub fn post_chunked(
    transport: &dyn ChatTransport,
    channel_id: &str,
    thread_ts: Option<&str>,
    text: &str,
) -> Result<Vec<MessageRef>, TransportError> {
    chunk_message(text)
        .iter()
        .map(|chunk| match thread_ts {
            Some(thread_ts) => transport.post_in_thread(channel_id, thread_ts, chunk),
            None => transport.post_message(channel_id, chunk),
        })
        .collect()
}
