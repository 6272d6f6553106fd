use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptionError {
    /// The exiftool backend could not be resolved. Fatal to the whole run;
    /// raised before any worker process is spawned.
    #[error("exiftool backend not available: {hint}")]
    DependencyMissing { hint: String },

    #[error("No description found")]
    EmptyDescription,

    /// The backend refuses to commit metadata to this file format.
    #[error("Metadata write rejected: {0}")]
    WriteRejected(String),

    /// The backend process ran but reported an error.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Result channel between coordinator and a batch worker broke down.
    #[error("Worker channel failed: {0}")]
    Channel(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CaptionError>;
