mod close;
mod handle;
mod relay;

pub use close::CloseReason;
pub use handle::*;
pub use relay::{SessionContext, run_session};

use crate::buffer::OverflowPolicy;
use crate::ocpp::DEFAULT_MAX_FRAME_SIZE;
use std::time::Duration;

/// Per-session relay limits, shared by every connection.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_frame_size: usize,
    pub buffer_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// How long a draining session may keep flushing before it is forced closed.
    pub drain_grace: Duration,
    /// Bound on the best-effort flush after a transport error or device close.
    pub flush_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            buffer_capacity: 256,
            overflow_policy: OverflowPolicy::DropOldest,
            drain_grace: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(2),
        }
    }
}
