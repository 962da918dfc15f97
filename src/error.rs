//! Error types for webpilot.

/// Top-level error type for the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Process spawn errors — a worker or guard process that could not be
/// started. Fatal only to that launch attempt, never recorded as a task
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Failed to spawn worker {program} for task {task}: {source}")]
    Worker {
        program: String,
        task: String,
        source: std::io::Error,
    },

    #[error("Worker for task {task} started without a captured {stream} pipe")]
    MissingPipe { task: String, stream: &'static str },

    #[error("Guard process {program} failed to start: {source}")]
    Guard {
        program: String,
        source: std::io::Error,
    },
}

/// Task-level request errors, surfaced synchronously to the caller.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {name} not found")]
    NotFound { name: String },

    #[error("Task {name} is disabled")]
    Disabled { name: String },
}

/// Schedule entry validation errors. These are recovered at load time by
/// skipping the offending entry; they never abort a schedule load.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression {expr:?}: {message}")]
    InvalidCron { expr: String, message: String },

    #[error("Unparseable execute_at timestamp {value:?}")]
    InvalidTimestamp { value: String },

    #[error("Entry for task {task} has neither cron nor execute_at")]
    MissingTrigger { task: String },
}

/// Result type alias for the daemon.
pub type Result<T> = std::result::Result<T, Error>;
