pub mod ws;

use anyhow::Result;

/// Prefix the transport uses to report socket failures in-band.
pub const ERROR_SIGNATURE: &str = "Websocket error";

/// One inbound item from a snapshot stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceMessage {
    /// A text frame, expected to hold a snapshot document.
    Text(String),
    /// The transport failed; the stream should be torn down.
    Error(String),
}

impl SourceMessage {
    /// Classify a text frame, treating in-band error reports as transport failures.
    pub fn from_text(text: String) -> Self {
        if is_error_signal(&text) {
            Self::Error(text)
        } else {
            Self::Text(text)
        }
    }
}

/// Whether a text frame is an in-band transport error report.
pub fn is_error_signal(text: &str) -> bool {
    text.starts_with(ERROR_SIGNATURE)
}

/// An open snapshot stream.
pub trait SnapshotStream: Send {
    /// Next inbound item, or `None` once the remote closed the stream.
    ///
    /// Must be cancel safe: it is polled inside `select!`.
    fn next_message(&mut self) -> impl std::future::Future<Output = Option<SourceMessage>> + Send;

    /// Close the stream.
    fn close(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Something that can open snapshot streams.
pub trait SnapshotSource: Send + Sync + 'static {
    type Stream: SnapshotStream + 'static;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> &str;

    /// Open a new stream.
    fn connect(&self) -> impl std::future::Future<Output = Result<Self::Stream>> + Send;
}
