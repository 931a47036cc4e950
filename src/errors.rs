/// Domain-specific error types for the strategy engine.
/// Every error is local and recoverable. The engine must:
/// - Reject the offending call and keep prior state untouched
/// - Keep the evaluation loop running
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("no strike in range for target delta {target:.4} (chain |delta| spans {min:.4}..{max:.4})")]
    NoStrikeInRange { target: f64, min: f64, max: f64 },

    #[error("duplicate leg: an open {option_type} {strike} leg already exists for {expiry}")]
    DuplicateLeg {
        expiry: chrono::NaiveDate,
        strike: f64,
        option_type: crate::state::OptionType,
    },

    #[error("invalid sample order: {got} is not after {last}")]
    InvalidSampleOrder {
        last: chrono::DateTime<chrono::Utc>,
        got: chrono::DateTime<chrono::Utc>,
    },

    #[error("stale quote for {option_type} {strike} ({age_secs}s old, limit {max_age_secs}s)")]
    StaleQuote {
        strike: f64,
        option_type: crate::state::OptionType,
        age_secs: i64,
        max_age_secs: i64,
    },

    #[error("unknown or closed leg: {0}")]
    UnknownLeg(crate::state::LegId),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("model computation error: {0}")]
    Model(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Parse(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
