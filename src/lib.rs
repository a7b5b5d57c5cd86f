mod backend;
mod config;
mod edge;
mod error;
mod gpio;
mod pwm;
mod queue;

pub use config::{AppConfig, Direction, EdgeDetect, QueueConfig, Value};
pub use error::GpioError;
pub use gpio::{
    EdgeCallback, EdgeWaker, EdgeWatch, GpioBackend, GpioManager, GpioPin, WakeReason,
};
pub use pwm::{Pwm, PwmState};

pub use backend::{MockEdgeWaker, MockEdgeWatch, MockGpioBackend, MockOp};
#[cfg(feature = "hardware-gpio")]
pub use backend::{SysfsEdgeWaker, SysfsEdgeWatch, SysfsGpioBackend};
