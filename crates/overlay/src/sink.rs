use bytes::Bytes;

/// Why an enqueue onto a connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    /// The write queue is above its high-water mark; the caller decides
    /// whether to drop or defer.
    Overloaded,
    /// The underlying stream is gone.
    Closed,
}

/// The seam between the overlay and whatever transport carries its frames.
///
/// A sink accepts one encoded packet per call (framing is the transport's
/// concern) and must never block: it either enqueues or fails. `close` is
/// idempotent and only signals the transport; the register entry stays
/// until the transport reports the disconnect back.
pub trait PacketSink: Send + Sync {
    fn send(&self, frame: Bytes) -> Result<(), SinkError>;
    fn close(&self);
}
