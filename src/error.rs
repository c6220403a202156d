#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid BOOTP frame: {0}")]
    Frame(String),

    #[error("Cannot encode frame: {0}")]
    Encode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Daemonization failed: {0}")]
    Daemon(String),
}

pub type Result<T> = std::result::Result<T, Error>;
