use thiserror::Error;

use hail_protocol::RideStatus;

/// Rejections raised while dispatching a client message. Each maps to a
/// `server:error` code carried back to the offending connection together
/// with the original envelope id.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("ride {0} is already active")]
    DuplicateRide(String),
    #[error("ride {0} not found")]
    UnknownRide(String),
    #[error("driver {0} is not registered")]
    UnknownActor(String),
    #[error("ride {0} is no longer available")]
    RideUnavailable(String),
    #[error("driver {0} already has an active ride")]
    DriverBusy(String),
    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition { from: RideStatus, to: RideStatus },
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::DuplicateRide(_) => "duplicate_ride",
            DispatchError::UnknownRide(_) => "unknown_ride",
            DispatchError::UnknownActor(_) => "unknown_actor",
            DispatchError::RideUnavailable(_) => "ride_unavailable",
            DispatchError::DriverBusy(_) => "driver_busy",
            DispatchError::InvalidTransition { .. } => "invalid_transition",
        }
    }
}
