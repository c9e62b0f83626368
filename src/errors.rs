use thiserror::Error;

/// Stable error taxonomy surfaced on the health/metrics stream (spec §7).
///
/// Every variant corresponds to one of the `ERR_*` / rejection codes named in
/// the design: callers match on these rather than on message text.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("duplicate commitment")]
    DuplicateCommitment,

    #[error("nonce lock timeout after {timeout_ms}ms")]
    NonceLockTimeout { timeout_ms: u64 },

    #[error("gas price spike on {chain}: {current} > baseline {baseline} x {multiplier}")]
    GasSpike {
        chain: String,
        current: u128,
        baseline: u128,
        multiplier: f64,
    },

    #[error("drawdown halt")]
    DrawdownHalt,

    #[error("expected value too low")]
    LowEv,

    #[error("position size rejected")]
    PositionSize,

    #[error("in-flight cap reached")]
    InFlightCapReached,

    #[error("queue rejected item: {0}")]
    QueueRejected(String),

    #[error("too early to reveal: current block {current}, need {need}")]
    RevealTooEarly { current: u64, need: u64 },

    #[error("execution timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// The stable code string used on the health/metrics stream, independent of the
    /// human-readable `Display` text (which may include dynamic values).
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "ERR_VALIDATION",
            EngineError::DuplicateCommitment => "ERR_DUPLICATE_COMMITMENT",
            EngineError::NonceLockTimeout { .. } => "ERR_NONCE_LOCK_TIMEOUT",
            EngineError::GasSpike { .. } => "ERR_GAS_SPIKE",
            EngineError::DrawdownHalt => "DRAWDOWN_HALT",
            EngineError::LowEv => "LOW_EV",
            EngineError::PositionSize => "POSITION_SIZE",
            EngineError::InFlightCapReached => "DRAWDOWN_HALT",
            EngineError::QueueRejected(_) => "ERR_QUEUE_REJECTED",
            EngineError::RevealTooEarly { .. } => "ERR_REVEAL_TOO_EARLY",
            EngineError::ExecutionTimeout { .. } => "ERR_EXECUTION_TIMEOUT",
            EngineError::Other(_) => "ERR_OTHER",
        }
    }
}

/// Fatal configuration errors, raised only during construction (spec §7 "Fatal configuration").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("queue water marks invalid: low({low}) must be < high({high}) <= max({max})")]
    InvalidWaterMarks { low: usize, high: usize, max: usize },

    #[error("simulation mode disabled in production without an explicit override")]
    SimulationInProductionWithoutOverride,

    #[error("invalid gas price bound for chain {chain}: min({min}) > max({max})")]
    InvalidGasBounds { chain: String, min: u128, max: u128 },

    #[error("{0}")]
    Other(String),
}
