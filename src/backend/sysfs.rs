//! `/sys/class/gpio` backend.
//!
//! Edge waits register the pin's `value` attribute with a [`mio::Poll`] for
//! priority readiness (the kernel raises `POLLPRI`/`POLLERR` on a configured
//! edge) next to a [`mio::Waker`], so one blocking call has exactly two
//! distinguishable wake reasons.

use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use mio::{Events, Interest, Poll, Token, Waker, unix::SourceFd};

use super::attr::{parse_attr, read_attr, write_attr};
use crate::config::{Direction, EdgeDetect, Value};
use crate::error::GpioError;
use crate::gpio::{EdgeWaker, EdgeWatch, GpioBackend, WakeReason};

const SYSFS_EVENTS_CAPACITY: usize = 4;
const SYSFS_POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// `value` holds "0\n" or "1\n".
const SYSFS_VALUE_BUF_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKindReady {
    Value,
    Waker,
    Unknown,
}

impl SourceKindReady {
    const fn to_token(self) -> Token {
        match self {
            Self::Value => Token(0),
            Self::Waker => Token(1),
            Self::Unknown => panic!("Unknown source has no token"),
        }
    }

    const fn from_token(token: Token) -> Self {
        match token.0 {
            0 => Self::Value,
            1 => Self::Waker,
            _ => Self::Unknown,
        }
    }
}

pub struct SysfsGpioBackend {
    root: PathBuf,
}

impl SysfsGpioBackend {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pin_dir(&self, pin_id: u32) -> PathBuf {
        self.root.join(format!("gpio{pin_id}"))
    }

    fn pin_attr(&self, pin_id: u32, attr: &str) -> PathBuf {
        self.pin_dir(pin_id).join(attr)
    }

    /// `[base, base + ngpio)` of every registered gpiochip.
    fn chip_ranges(&self) -> Result<Vec<(u32, u32)>, GpioError> {
        if !self.root.exists() {
            return Err(GpioError::Io(format!("{} does not exist", self.root.display())));
        }
        let entries = fs::read_dir(&self.root)
            .map_err(|e| GpioError::io(format!("read dir {}", self.root.display()), e))?;

        let mut ranges = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| GpioError::io(format!("read dir {}", self.root.display()), e))?;
            if !entry.file_name().to_string_lossy().starts_with("gpiochip") {
                continue;
            }
            let chip = entry.path();
            let base: u32 = parse_attr(&chip.join("base"))?;
            let ngpio: u32 = parse_attr(&chip.join("ngpio"))?;
            ranges.push((base, base.saturating_add(ngpio)));
        }
        Ok(ranges)
    }
}

impl GpioBackend for SysfsGpioBackend {
    type Watch = SysfsEdgeWatch;
    type Waker = SysfsEdgeWaker;

    fn validate_id(&self, pin_id: u32) -> Result<(), GpioError> {
        let valid = self
            .chip_ranges()?
            .iter()
            .any(|(start, end)| (*start..*end).contains(&pin_id));
        if valid {
            Ok(())
        } else {
            Err(GpioError::InvalidId(pin_id))
        }
    }

    fn is_exported(&self, pin_id: u32) -> Result<bool, GpioError> {
        Ok(self.pin_dir(pin_id).exists())
    }

    fn export(&self, pin_id: u32) -> Result<(), GpioError> {
        let path = self.root.join("export");
        fs::write(&path, pin_id.to_string()).map_err(|e| export_error(pin_id, e))?;
        debug!("exported gpio{pin_id}");
        Ok(())
    }

    fn unexport(&self, pin_id: u32) -> Result<(), GpioError> {
        write_attr(&self.root.join("unexport"), &pin_id.to_string())
    }

    fn set_direction(&self, pin_id: u32, direction: Direction) -> Result<(), GpioError> {
        write_attr(&self.pin_attr(pin_id, "direction"), direction.as_sysfs())
    }

    fn read_value(&self, pin_id: u32) -> Result<Value, GpioError> {
        read_attr(&self.pin_attr(pin_id, "value"))?.parse()
    }

    fn write_value(&self, pin_id: u32, value: Value) -> Result<(), GpioError> {
        write_attr(&self.pin_attr(pin_id, "value"), value.as_sysfs())
    }

    fn configure_edge(&self, pin_id: u32, edge: EdgeDetect) -> Result<(), GpioError> {
        write_attr(&self.pin_attr(pin_id, "edge"), edge.as_sysfs())
    }

    fn watch_edges(&self, pin_id: u32) -> Result<(SysfsEdgeWatch, SysfsEdgeWaker), GpioError> {
        let path = self.pin_attr(pin_id, "value");
        let value_file =
            File::open(&path).map_err(|e| GpioError::io(format!("open {}", path.display()), e))?;
        SysfsEdgeWatch::with_source(pin_id, value_file, Interest::PRIORITY)
    }
}

fn export_error(pin_id: u32, e: io::Error) -> GpioError {
    if e.kind() == ErrorKind::ResourceBusy {
        GpioError::AlreadyExported(pin_id)
    } else {
        GpioError::io(format!("Unable to export gpio{pin_id}"), e)
    }
}

/// Blocks on a pin's `value` attribute. `S` is the open attribute in
/// production; anything readable with a pollable descriptor works.
pub struct SysfsEdgeWatch<S = File> {
    pin_id: u32,
    poll: Poll,
    events: Events,
    source: S, // must outlive its registration in `poll`
    buf: [u8; SYSFS_VALUE_BUF_LEN],
}

impl<S: Read + Seek + AsRawFd> SysfsEdgeWatch<S> {
    fn with_source(
        pin_id: u32,
        source: S,
        interest: Interest,
    ) -> Result<(Self, SysfsEdgeWaker), GpioError> {
        let mut watch = Self {
            pin_id,
            poll: Poll::new().map_err(|e| GpioError::io("create mio::Poll", e))?,
            events: Events::with_capacity(SYSFS_EVENTS_CAPACITY),
            source,
            buf: [0; SYSFS_VALUE_BUF_LEN],
        };
        // consume the current state so only later edges report
        watch.read_raw()?;

        let registry = watch.poll.registry();
        registry
            .register(
                &mut SourceFd(&watch.source.as_raw_fd()),
                SourceKindReady::Value.to_token(),
                interest,
            )
            .map_err(|e| GpioError::io(format!("register gpio{pin_id}/value with mio"), e))?;
        let waker = Waker::new(registry, SourceKindReady::Waker.to_token())
            .map_err(|e| GpioError::io("create mio::Waker", e))?;
        Ok((watch, SysfsEdgeWaker(waker)))
    }

    /// Re-reads the attribute from the start into `buf`.
    fn read_raw(&mut self) -> Result<usize, GpioError> {
        self.source
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.source.read(&mut self.buf))
            .map_err(|e| GpioError::io(format!("read gpio{}/value", self.pin_id), e))
    }
}

impl<S: Read + Seek + AsRawFd + Send + 'static> EdgeWatch for SysfsEdgeWatch<S> {
    fn wait_for_edge_or_wake(&mut self) -> Result<WakeReason, GpioError> {
        loop {
            if let Err(e) = self.poll.poll(&mut self.events, Some(SYSFS_POLL_TIMEOUT)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(GpioError::io(format!("poll gpio{}", self.pin_id), e));
            }
            if self.events.is_empty() {
                return Ok(WakeReason::TimedOut);
            }

            let mut edge = false;
            for event in self.events.iter() {
                match SourceKindReady::from_token(event.token()) {
                    SourceKindReady::Waker => return Ok(WakeReason::WakeSignaled),
                    SourceKindReady::Value => edge = true,
                    SourceKindReady::Unknown => {
                        warn!("gpio{}: unknown token {:?}", self.pin_id, event.token())
                    }
                }
            }
            if edge {
                return Ok(WakeReason::EdgeDetected);
            }
        }
    }

    fn read_value(&mut self) -> Result<Value, GpioError> {
        let len = self.read_raw()?;
        std::str::from_utf8(&self.buf[..len])
            .map_err(|e| GpioError::InvalidValue(format!("gpio{}/value: {e}", self.pin_id)))?
            .parse()
    }
}

pub struct SysfsEdgeWaker(Waker);

impl EdgeWaker for SysfsEdgeWaker {
    fn wake(&self) -> Result<(), GpioError> {
        self.0.wake().map_err(|e| GpioError::io("wake mio::Poll", e))
    }
}
