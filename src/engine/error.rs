use crate::model::{IntervalId, Ms, SubjectKey};

#[derive(Debug)]
pub enum EngineError {
    /// `end <= start`. Raised before anything is touched.
    InvalidRange {
        start: Ms,
        end: Ms,
    },
    IntervalNotFound(IntervalId),
    PresenceNotFound {
        subject: SubjectKey,
        interval_id: IntervalId,
    },
    DuplicateKey {
        subject: SubjectKey,
        interval_id: IntervalId,
    },
    LimitExceeded(&'static str),
    PersistenceFailure(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange { start, end } => {
                write!(f, "invalid range: end {end} is not after start {start}")
            }
            EngineError::IntervalNotFound(id) => write!(f, "not found: {id}"),
            EngineError::PresenceNotFound {
                subject,
                interval_id,
            } => write!(f, "no presence record for {subject} on {interval_id}"),
            EngineError::DuplicateKey {
                subject,
                interval_id,
            } => write!(f, "presence record for {subject} on {interval_id} already exists"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::PersistenceFailure(e) => write!(f, "persistence failure: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::PersistenceFailure(e.to_string())
    }
}
