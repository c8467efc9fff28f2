use thiserror::Error;

/// Errors produced by the relay.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("controller slot is occupied")]
    RoleConflict,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TetherResult<T> = Result<T, TetherError>;
