use crate::ocpp::FrameError;
use crate::session::DrainReason;
use std::fmt;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// The charge point sent a close frame.
    DeviceClosed,
    /// The connection failed or ended without a close handshake.
    TransportError(String),
    /// The charge point sent something that is not a valid OCPP frame.
    Malformed(FrameError),
    Drained(DrainReason),
    /// The grace period ran out before the session finished draining.
    ForceClosed,
    /// Another live session already owns the identifier.
    Duplicate,
    /// The broker subscription could not be set up.
    BrokerUnavailable,
}

impl CloseReason {
    /// Close frame sent to the charge point when the gateway ends the session.
    pub fn close_frame(&self) -> CloseFrame<'static> {
        let (code, reason) = match self {
            CloseReason::DeviceClosed => (CloseCode::Normal, ""),
            CloseReason::TransportError(_) => (CloseCode::Error, "transport error"),
            CloseReason::Malformed(FrameError::TooLarge { .. }) => (CloseCode::Size, "frame too large"),
            CloseReason::Malformed(_) => (CloseCode::Protocol, "malformed OCPP frame"),
            CloseReason::Drained(DrainReason::Evicted) => {
                (CloseCode::Normal, "replaced by a newer connection")
            }
            CloseReason::Drained(DrainReason::Shutdown) => (CloseCode::Away, "gateway shutting down"),
            CloseReason::Drained(DrainReason::BrokerOutage) => {
                (CloseCode::Again, "upstream broker unavailable")
            }
            CloseReason::ForceClosed => (CloseCode::Away, "drain timed out"),
            CloseReason::Duplicate => (CloseCode::Policy, "charge point already connected"),
            CloseReason::BrokerUnavailable => (CloseCode::Again, "upstream broker unavailable"),
        };
        CloseFrame {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::DeviceClosed => f.write_str("closed by charge point"),
            CloseReason::TransportError(error) => write!(f, "transport error: {error}"),
            CloseReason::Malformed(error) => write!(f, "malformed frame: {error}"),
            CloseReason::Drained(reason) => write!(f, "drained ({reason:?})"),
            CloseReason::ForceClosed => f.write_str("force closed"),
            CloseReason::Duplicate => f.write_str("duplicate connection refused"),
            CloseReason::BrokerUnavailable => f.write_str("broker unavailable"),
        }
    }
}
