use std::fs;
use std::path::Path;

use crate::error::GpioError;

pub(crate) fn write_attr(path: &Path, contents: &str) -> Result<(), GpioError> {
    fs::write(path, contents).map_err(|e| GpioError::io(format!("write {}", path.display()), e))
}

pub(crate) fn read_attr(path: &Path) -> Result<String, GpioError> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| GpioError::io(format!("read {}", path.display()), e))
}

pub(crate) fn parse_attr<T>(path: &Path) -> Result<T, GpioError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = read_attr(path)?;
    raw.parse()
        .map_err(|e| GpioError::InvalidValue(format!("{}: {raw:?}: {e}", path.display())))
}
