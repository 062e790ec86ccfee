pub mod config;
pub mod constants;
pub mod domain;
pub mod error;
pub mod import;
pub mod logging;
pub mod pipeline;
pub mod storage;

pub use config::Config;
pub use error::{EtlError, Result};
pub use pipeline::{BatchTransformer, RunReport, StageContext};
pub use storage::{DocumentStore, InMemoryStore, SqliteStore};
