pub(crate) mod attr;
pub mod mock;
#[cfg(feature = "hardware-gpio")]
pub mod sysfs;

pub use mock::{MockEdgeWaker, MockEdgeWatch, MockGpioBackend, MockOp};
#[cfg(feature = "hardware-gpio")]
pub use sysfs::{SysfsEdgeWaker, SysfsEdgeWatch, SysfsGpioBackend};
