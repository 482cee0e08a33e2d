use thiserror::Error;

pub type Result<T> = std::result::Result<T, IkupError>;

#[derive(Error, Debug)]
pub enum IkupError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("database busy: {0}")]
    ResourceBusy(String),

    #[error("unsupported transport: {0}")]
    TransportUnsupported(String),

    #[error("corrupt cache entry: {0}")]
    CacheCorrupt(String),

    #[error("source file gone: {0}")]
    PathGone(String),

    #[error("formula error: {0}")]
    Formula(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("config error: {0}")]
    Config(String),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl IkupError {
    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::InvalidArg(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::ResourceBusy(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportUnsupported(msg.into())
    }

    pub fn cache_corrupt(msg: impl Into<String>) -> Self {
        Self::CacheCorrupt(msg.into())
    }

    pub fn path_gone(msg: impl Into<String>) -> Self {
        Self::PathGone(msg.into())
    }

    pub fn formula(msg: impl Into<String>) -> Self {
        Self::Formula(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Process exit code for this error. Validation problems exit with 2,
    /// operational failures with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            IkupError::InvalidArg(_)
            | IkupError::TransportUnsupported(_)
            | IkupError::Formula(_)
            | IkupError::Config(_)
            | IkupError::Toml(_) => 2,
            _ => 1,
        }
    }
}
