//! Error types for the exit node.
use thiserror::Error;

/// Caller-visible failures. Every error is scoped to one request or handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExitError {
    #[error("{0}")] InvalidKeys(String),
    #[error("client did not provide any keys to register")] NoKeys,
    #[error("unknown handle {0}; register the account set first")] UnknownHandle(String),
    #[error("server error: {0}")] ServerError(String),
    #[error("invalid transaction: {0}")] InvalidTransaction(String),
}

impl ExitError {
    /// Stable kind name, sent to clients alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ExitError::InvalidKeys(_) => "InvalidKeys",
            ExitError::NoKeys => "NoKeys",
            ExitError::UnknownHandle(_) => "UnknownHandle",
            ExitError::ServerError(_) => "ServerError",
            ExitError::InvalidTransaction(_) => "InvalidTransaction",
        }
    }
}

/// Failures reported by the store and ledger collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")] NotFound(String),
    #[error("unavailable: {0}")] Unavailable(String),
    #[error("corrupt record: {0}")] Corrupt(String),
}

impl From<StoreError> for ExitError {
    fn from(e: StoreError) -> Self {
        ExitError::ServerError(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("unknown network: {0}")] UnknownNetwork(String),
    #[error("wrong network: expected {expected}")] WrongNetwork { expected: &'static str },
    #[error("missing separator")] MissingSeparator,
    #[error("invalid length")] InvalidLength,
    #[error("invalid character: {0}")] InvalidCharacter(char),
    #[error("invalid checksum")] InvalidChecksum,
    #[error("invalid version: {0}")] InvalidVersion(u8),
    #[error("invalid padding bits")] InvalidPadding,
    #[error("mixed case")] MixedCase,
}
