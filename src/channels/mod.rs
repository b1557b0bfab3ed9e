pub mod local;
pub mod transport;

pub use local::{LocalTransport, TransportEvent};
pub use transport::{
    chunk_message, post_chunked, AttachmentStore, ChatTransport, DirectoryAttachmentStore,
    MessageRef, TransportError, OUTBOUND_CHUNK_CHARS,
};
