//! Error types for harrier

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller broke a documented precondition of the iterator contract.
    /// Never a data condition; always a programmer error.
    #[error("iterator contract violation: {0}")]
    ContractViolation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("corrupt posting data: {0}")]
    Corruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Build a `ContractViolation` and surface it loudly in the log. Silently
/// ignoring one of these corrupts merge results downstream, so every call
/// site propagates the returned error with `?`.
pub fn contract_violation(msg: impl Into<String>) -> Error {
    let msg = msg.into();
    log::error!("iterator contract violation: {}", msg);
    Error::ContractViolation(msg)
}

pub type Result<T> = std::result::Result<T, Error>;
