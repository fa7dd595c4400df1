/// Invalid configuration, reported before any image processing starts.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid pattern size {rows}x{cols} (each dimension must be at least {min})")]
    PatternSize { rows: usize, cols: usize, min: usize },

    #[error("invalid image dimensions (width={width}, height={height})")]
    ImageDimensions { width: usize, height: usize },

    #[error("invalid image buffer length (expected {expected} bytes, got {got})")]
    ImageBuffer { expected: usize, got: usize },

    #[error("invalid parameter `{name}`: {reason}")]
    Parameter { name: &'static str, reason: String },
}

impl ConfigError {
    pub fn parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::Parameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Return `Err(ConfigError::Parameter)` unless `ok` holds.
pub fn ensure(ok: bool, name: &'static str, reason: &str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::parameter(name, reason))
    }
}
