use std::fmt::Debug;

use crate::transport::Frame;

/// How an inbound frame relates to heartbeating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Beat {
    /// answer to our probe
    Pong,
    /// peer's own probe, proves liveness too; the frame, if any, is written back
    Ping(Option<Frame>),
    /// application data
    Data,
}

/// Protocol specific heartbeat frames.
///
/// An active probe returns a frame from [`ping`](Self::ping) at every tick.
/// A passive probe returns `None`: the peer is the one pinging, the tick only
/// opens a deadline that the peer's next ping must meet.
pub trait HeartbeatProbe: Send + Sync + Debug {
    /// frame written when a probe is due
    fn ping(&self) -> Option<Frame>;

    /// classify an inbound frame, after middleware processing
    fn classify(&self, frame: &Frame) -> Beat;
}

/// Probe of a connection without heartbeating, every inbound frame is data.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentProbe;

impl HeartbeatProbe for SilentProbe {
    fn ping(&self) -> Option<Frame> {
        None
    }

    fn classify(&self, _frame: &Frame) -> Beat {
        Beat::Data
    }
}
