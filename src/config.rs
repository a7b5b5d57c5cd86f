use std::{fmt, fs, path::Path, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::GpioError;

const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";
const DEFAULT_PWM_ROOT: &str = "/sys/class/pwm";

/// Logic level of a pin.
#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Value {
    High,
    Low,
}

impl Value {
    pub fn as_sysfs(&self) -> &'static str {
        match self {
            Value::High => "1",
            Value::Low => "0",
        }
    }
}

impl From<bool> for Value {
    fn from(high: bool) -> Self {
        if high { Value::High } else { Value::Low }
    }
}

impl FromStr for Value {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" => Ok(Value::High),
            "0" => Ok(Value::Low),
            other => Err(GpioError::InvalidValue(format!(
                "expected 0 or 1, got {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::High => f.write_str("HIGH"),
            Value::Low => f.write_str("LOW"),
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_sysfs(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDetect {
    None,
    Rising,
    Falling,
    Both,
}

impl Default for EdgeDetect {
    fn default() -> Self {
        EdgeDetect::None
    }
}

impl EdgeDetect {
    pub fn as_sysfs(&self) -> &'static str {
        match self {
            EdgeDetect::None => "none",
            EdgeDetect::Rising => "rising",
            EdgeDetect::Falling => "falling",
            EdgeDetect::Both => "both",
        }
    }

    /// Whether a `from -> to` level change fires under this mode.
    pub fn matches(&self, from: Value, to: Value) -> bool {
        match (self, from, to) {
            (EdgeDetect::Rising, Value::Low, Value::High) => true,
            (EdgeDetect::Falling, Value::High, Value::Low) => true,
            (EdgeDetect::Both, a, b) => a != b,
            _ => false,
        }
    }
}

impl FromStr for EdgeDetect {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" => Ok(EdgeDetect::None),
            "rising" => Ok(EdgeDetect::Rising),
            "falling" => Ok(EdgeDetect::Falling),
            "both" => Ok(EdgeDetect::Both),
            other => Err(GpioError::InvalidValue(format!("unknown edge mode {other:?}"))),
        }
    }
}

/// Event queue flavour used between the poller and dispatcher threads.
///
/// `Locked` parks the dispatcher on a condition variable and is unbounded
/// unless a capacity is given. `LockFree` uses a fixed ring and busy-polls
/// from the dispatcher, burning a core for roughly half a millisecond less
/// delivery latency. Both drop new events when full.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum QueueConfig {
    Locked {
        #[serde(default)]
        capacity: Option<usize>,
    },
    LockFree {
        capacity: usize,
    },
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig::Locked { capacity: None }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_gpio_root")]
    pub gpio_root: PathBuf,
    #[serde(default = "default_pwm_root")]
    pub pwm_root: PathBuf,
    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_gpio_root() -> PathBuf {
    PathBuf::from(DEFAULT_GPIO_ROOT)
}

fn default_pwm_root() -> PathBuf {
    PathBuf::from(DEFAULT_PWM_ROOT)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gpio_root: default_gpio_root(),
            pwm_root: default_pwm_root(),
            queue: QueueConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GpioError> {
        match self.queue {
            QueueConfig::Locked { capacity: Some(0) } | QueueConfig::LockFree { capacity: 0 } => {
                Err(GpioError::Config("queue capacity must be at least 1".into()))
            }
            _ => Ok(()),
        }
    }
}
