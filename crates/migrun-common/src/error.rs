use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("database `{0}` does not exist and creation was not requested")]
    DatabaseMissing(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("migrations directory not found: {0}")]
    MigrationsDirMissing(String),

    #[error("invalid migration file name `{0}`: expected a numeric version prefix")]
    InvalidMigrationName(String),

    #[error("duplicate migration version {version}: `{first}` and `{second}`")]
    DuplicateVersion {
        version: u64,
        first: String,
        second: String,
    },

    #[error("malformed statement in `{file}`: {reason}")]
    MalformedStatement { file: String, reason: String },

    #[error("`{file}` contains {count} statements but multi-statement mode is off")]
    MultipleStatements { file: String, count: usize },

    #[error("migration {version} ({name}) failed: {reason}")]
    MigrationFailed {
        version: u64,
        name: String,
        reason: String,
    },

    #[error("migration {version} ({name}) was changed after it was applied")]
    ChecksumMismatch { version: u64, name: String },

    #[error("migrations are locked by another run (holder {0})")]
    Locked(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}
