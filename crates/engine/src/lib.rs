//! World state engine: wires the store, snapshots, history reconstruction
//! and summarization around one repository, and drives them per tick.

pub mod config;
pub mod manager;

pub use config::{
    ConfigError, DATA_DIR_ENV, EngineConfig, LoggingConfig, RepositoryBackend, RepositoryConfig,
    SummarizationConfig,
};
pub use manager::{EngineError, TickReport, WorldStateManager, open_repository};
