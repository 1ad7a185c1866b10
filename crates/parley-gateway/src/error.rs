use thiserror::Error;

/// Failure taxonomy for gateway operations. Authorization and NotFound
/// abort the operation with no partial effects and are silent to the
/// caller; store failures suppress the operation's broadcast and
/// acknowledgment. None of these ever terminates the connection loop.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("caller is not the group creator")]
    Unauthorized,

    #[error("referenced group or user not found")]
    NotFound,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
