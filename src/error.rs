use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShaperError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Failed to clear remnant of {artifact}: {reason}")]
    RemnantCleanup { artifact: String, reason: String },

    #[error("Failed to compile {artifact}: {reason}")]
    Compile { artifact: String, reason: String },

    #[error("Failed to load {artifact}: {reason}")]
    Load { artifact: String, reason: String },

    #[error("Couldn't attach {artifact} to {container}: {reason}")]
    Attach {
        artifact: String,
        container: String,
        reason: String,
    },

    #[error("empty cgroup for container {container}")]
    CgroupNotFound { container: String },

    #[error("Kubernetes error: {0}")]
    Kubernetes(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShaperError {
    pub fn validation(message: impl Into<String>) -> Self {
        ShaperError::Validation(message.into())
    }

    /// Short label used for logging and metrics
    pub const fn kind(&self) -> &'static str {
        match self {
            ShaperError::Validation(_) => "validation",
            ShaperError::RemnantCleanup { .. } => "remnant_cleanup",
            ShaperError::Compile { .. } => "compile",
            ShaperError::Load { .. } => "load",
            ShaperError::Attach { .. } => "attach",
            ShaperError::CgroupNotFound { .. } => "cgroup_not_found",
            ShaperError::Kubernetes(_) => "kubernetes",
            ShaperError::Config(_) => "config",
            ShaperError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, ShaperError>;
