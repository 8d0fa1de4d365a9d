use thiserror::Error;

/// Local failures raised by the sync layer. Remote rejections never surface
/// here; they arrive asynchronously on the job stream.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to connect channel '{topic}': {message}")]
    Connect { topic: String, message: String },
    #[error("channel '{topic}' is not connected")]
    NotConnected { topic: String },
    #[error("failed to publish '{event}': {message}")]
    Publish {
        event: &'static str,
        message: String,
    },
}

/// Outcome of waiting for a correlated reply.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    #[error("timed out waiting for reply")]
    TimedOut,
    #[error("request abandoned before a reply arrived")]
    Abandoned,
}
