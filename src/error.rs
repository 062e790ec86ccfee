use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Storage operation failed: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stage '{stage}' is missing a required input: {what}")]
    MissingDependency { stage: &'static str, what: String },

    #[error("Invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("Duplicate key {id:?} in collection {collection}")]
    DuplicateKey { collection: String, id: String },

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Document store lock poisoned")]
    LockPoisoned,

    #[error("Document store connection is closed")]
    ConnectionClosed,

    #[error("Stage {number} ({stage}) failed")]
    StageFailed {
        number: u8,
        stage: &'static str,
        #[source]
        source: Box<EtlError>,
    },

    #[error("Import failed at line {line}: {message}")]
    Import { line: usize, message: String },
}

pub type Result<T> = std::result::Result<T, EtlError>;
