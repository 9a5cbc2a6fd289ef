use bytes::Bytes;
#[cfg(test)] use mockall::automock;

/// The layer above the window engine: it consumes delivered payload, and it produces payload
///  for the engine to send (see [crate::engine::WindowEngine::submit]).
///
/// The engine calls these methods while holding its internal lock, so implementations must
///  return promptly and must not call back into the engine.
#[cfg_attr(test, automock)]
pub trait NetworkLayer: Send + Sync + 'static {
    /// Payload of a DATA frame that arrived in sequence. Every payload is delivered exactly
    ///  once, and in the order it was submitted on the other side.
    fn deliver(&self, payload: Bytes);

    /// The peer finished sending. This is called exactly once per connection, and no
    ///  [NetworkLayer::deliver] calls follow it.
    fn end_of_stream(&self);

    /// The send window is full, or all unacknowledged frames are being retransmitted. Further
    ///  submissions block until production is resumed.
    fn pause_production(&self);

    fn resume_production(&self);

    /// The connection failed irrecoverably, no more calls follow
    fn connection_failed(&self, reason: &str);
}
