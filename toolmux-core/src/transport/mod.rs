//! Transport channels to downstream backends.
//!
//! A [`Channel`] frames and deframes protocol messages over one
//! bidirectional byte stream: the standard streams of a spawned child
//! process ([`stdio`]) or a network endpoint ([`http`]). The two halves are
//! independent objects so a connection can serialize writes through the
//! sink while its read pump owns the stream. A channel is not restartable;
//! reconnecting means constructing a new one. Closing the sink terminates
//! the underlying stream, and for stdio signals the child to exit,
//! escalating to a forced kill after a grace period.

pub mod http;
pub mod stdio;

use async_trait::async_trait;

use crate::error::TransportError;

/// Upper bound on a single frame, enforced before JSON parsing so a
/// misbehaving backend cannot force oversized allocations.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// The write half of a channel.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the stream has already closed,
    /// or [`TransportError::Io`] on a write failure.
    async fn send(&mut self, frame: &str) -> Result<(), TransportError>;

    /// Close the channel, releasing the underlying process or socket.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// The read half of a channel.
///
/// `recv` buffers partial reads internally and never yields a truncated
/// frame; it returns `None` once the underlying stream has closed, after
/// which the channel is finished.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next complete frame, or `None` at end of stream.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
}

/// One framed bidirectional stream to a backend, split into halves.
pub struct Channel {
    /// Write half.
    pub sink: Box<dyn FrameSink>,
    /// Read half.
    pub stream: Box<dyn FrameStream>,
}

/// Reject a frame that exceeds [`MAX_FRAME_BYTES`].
pub(crate) fn check_frame_size(len: usize) -> Result<(), TransportError> {
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::MalformedFrame {
            reason: format!("frame of {len} bytes exceeds maximum of {MAX_FRAME_BYTES}"),
        });
    }
    Ok(())
}
