use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Invalid pin id: {0}")]
    InvalidId(u32),
    #[error("Pin {0} already exported (another handle or process owns it)")]
    AlreadyExported(u32),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Direction error: {0}")]
    Direction(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GpioError {
    pub fn io(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        GpioError::Io(format!("{context}: {err}"))
    }
}
