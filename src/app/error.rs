use thiserror::Error;

#[derive(Error, Debug)]
pub enum WirefeedError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Unexpected data shape: {0}")]
    DataShape(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WirefeedError {
    /// Network-level failures that the sync engine recovers from locally.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

pub type Result<T> = std::result::Result<T, WirefeedError>;
