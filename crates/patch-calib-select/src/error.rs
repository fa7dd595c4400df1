use patch_calib_core::ConfigError;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SelectError {
    #[error("candidate pool is empty")]
    EmptyPool,

    #[error("paired culling needs equal lengths (got {left} and {right})")]
    LengthMismatch { left: usize, right: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),
}
