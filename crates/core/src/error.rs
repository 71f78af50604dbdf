use thiserror::Error;

use crate::message::MessageId;
use crate::tracker::ClockPhase;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Faults raised by the broker core.
///
/// A missing message or queue is not a fault: those paths report
/// `false`/`0` to the caller instead.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("a {phase} clock is already armed for message {id}")]
    ClockAlreadyArmed { id: MessageId, phase: ClockPhase },

    #[error("{0} lock poisoned")]
    Poisoned(&'static str),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
}
