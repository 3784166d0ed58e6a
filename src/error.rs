use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    StoreTimeout,
    StoreConnect(String),
    Store(redis::RedisError),
    InvalidCounterPayload(String),
    RuleEvaluation { rule_id: String, message: String },
    QueueClosed,
    Config(String),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::StoreTimeout => write!(f, "store timeout"),
            GatewayError::StoreConnect(msg) => write!(f, "store connect error: {}", msg),
            GatewayError::Store(e) => write!(f, "store error: {}", e),
            GatewayError::InvalidCounterPayload(msg) => {
                write!(f, "invalid counter payload: {}", msg)
            }
            GatewayError::RuleEvaluation { rule_id, message } => {
                write!(f, "rule evaluation error, rule={}: {}", rule_id, message)
            }
            GatewayError::QueueClosed => write!(f, "maintenance queue closed"),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<redis::RedisError> for GatewayError {
    fn from(e: redis::RedisError) -> Self {
        GatewayError::Store(e)
    }
}
