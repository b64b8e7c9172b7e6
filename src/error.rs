use thiserror::Error;

/// Error taxonomy for the trading core.
///
/// The split matters for control flow: `TransientExchange` is the only class
/// the order placer retries, `VersionConflict` is reload-and-reapply, and the
/// divergence errors (`BalanceMismatch`, `DriftExceeded`) always end in a
/// pause rather than a retry.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("order validation failed: {}", .0.join("; "))]
    OrderValidation(Vec<String>),

    #[error("transient exchange error (code {code:?}): {message}")]
    TransientExchange { code: Option<i64>, message: String },

    #[error("exchange error (code {code:?}): {message}")]
    FatalExchange { code: Option<i64>, message: String },

    #[error("version conflict on cycle state {bot_id}: expected {expected}")]
    VersionConflict { bot_id: String, expected: i64 },

    #[error("balance mismatch: internal {internal} vs exchange {exchange} {asset}")]
    BalanceMismatch {
        asset: String,
        internal: String,
        exchange: String,
    },

    #[error("drift exceeded: {0}")]
    DriftExceeded(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BotError {
    /// Binance error codes the order placer treats as retryable.
    pub fn transient_from_code(code: i64, message: impl Into<String>) -> Self {
        match code {
            -1003 | -1001 | -1000 => BotError::TransientExchange {
                code: Some(code),
                message: message.into(),
            },
            _ => BotError::FatalExchange {
                code: Some(code),
                message: message.into(),
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BotError::TransientExchange { .. })
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        // Network failures and timeouts are retryable by definition.
        BotError::TransientExchange {
            code: None,
            message: err.to_string(),
        }
    }
}

pub type BotResult<T> = Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_code_classification() {
        assert!(BotError::transient_from_code(-1003, "rate limited").is_transient());
        assert!(BotError::transient_from_code(-1001, "internal").is_transient());
        assert!(BotError::transient_from_code(-1000, "unknown").is_transient());
        assert!(!BotError::transient_from_code(-2010, "insufficient balance").is_transient());
        assert!(!BotError::transient_from_code(-1121, "invalid symbol").is_transient());
    }
}
