use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::backend::attr::{parse_attr, read_attr, write_attr};
use crate::error::GpioError;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PwmState {
    Disabled,
    Enabled,
}

/// One exported channel of a sysfs `pwmchip`. Unexported on drop.
pub struct Pwm {
    chip_dir: PathBuf,
    channel: u32,
}

impl Pwm {
    pub fn new<P: AsRef<Path>>(root: P, chip: u32, channel: u32) -> Result<Self, GpioError> {
        let root = root.as_ref();
        if !root.exists() {
            return Err(GpioError::Io(format!("{} does not exist", root.display())));
        }
        let chip_dir = root.join(format!("pwmchip{chip}"));
        if !chip_dir.exists() {
            return Err(GpioError::InvalidId(chip));
        }

        let npwm: u32 = parse_attr(&chip_dir.join("npwm"))?;
        if channel >= npwm {
            return Err(GpioError::InvalidId(channel));
        }

        let pwm = Self { chip_dir, channel };
        if pwm.channel_dir().exists() {
            return Err(GpioError::AlreadyExported(channel));
        }
        write_attr(&pwm.chip_dir.join("export"), &channel.to_string())
            .map_err(|e| GpioError::Io(format!("Unable to export pwm{channel}: {e}")))?;
        debug!("exported {}", pwm.name());
        Ok(pwm)
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    fn name(&self) -> String {
        format!(
            "{}/pwm{}",
            self.chip_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            self.channel
        )
    }

    fn channel_dir(&self) -> PathBuf {
        self.chip_dir.join(format!("pwm{}", self.channel))
    }

    fn attr(&self, name: &str) -> PathBuf {
        self.channel_dir().join(name)
    }

    pub fn set_state(&self, state: PwmState) -> Result<(), GpioError> {
        let raw = match state {
            PwmState::Disabled => "0",
            PwmState::Enabled => "1",
        };
        write_attr(&self.attr("enable"), raw)
    }

    pub fn state(&self) -> Result<PwmState, GpioError> {
        match read_attr(&self.attr("enable"))?.as_str() {
            "1" => Ok(PwmState::Enabled),
            _ => Ok(PwmState::Disabled),
        }
    }

    pub fn set_period(&self, period_ns: u64) -> Result<(), GpioError> {
        if period_ns == 0 {
            return Err(GpioError::InvalidValue("PWM period must be positive".into()));
        }
        write_attr(&self.attr("period"), &period_ns.to_string())
    }

    pub fn period(&self) -> Result<u64, GpioError> {
        parse_attr(&self.attr("period"))
    }

    /// Sets the active time per period. Must not exceed the period.
    pub fn set_duty_cycle(&self, duty_ns: u64) -> Result<(), GpioError> {
        let period = self.period()?;
        if duty_ns > period {
            return Err(GpioError::InvalidValue(format!(
                "duty cycle {duty_ns}ns exceeds period {period}ns"
            )));
        }
        write_attr(&self.attr("duty_cycle"), &duty_ns.to_string())
    }

    pub fn duty_cycle(&self) -> Result<u64, GpioError> {
        parse_attr(&self.attr("duty_cycle"))
    }

    pub fn set_duty_percent(&self, percent: f64) -> Result<(), GpioError> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(GpioError::InvalidValue(
                "Pick a value between 0 and 100 for the PWM duty cycle".into(),
            ));
        }
        let period = self.period()?;
        self.set_duty_cycle((period as f64 * percent / 100.0).round() as u64)
    }
}

impl Drop for Pwm {
    fn drop(&mut self) {
        if let Err(e) = write_attr(&self.chip_dir.join("unexport"), &self.channel.to_string()) {
            warn!(
                "Unable to unexport {}: {e}; the channel stays unavailable to new handles",
                self.name()
            );
        }
    }
}
