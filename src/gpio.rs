use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::config::{AppConfig, Direction, EdgeDetect, Value};
use crate::edge::EdgeListener;
use crate::error::GpioError;
use crate::queue::EventQueue;

/// User code invoked with each captured transition, always from the
/// dispatcher thread.
pub type EdgeCallback = Box<dyn FnMut(Value) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    EdgeDetected,
    WakeSignaled,
    /// Nothing happened within the source's poll interval. The poller
    /// re-checks its shutdown flag, so a lost wake only delays teardown.
    TimedOut,
}

/// Pin plumbing the handle is built on: export bookkeeping, attribute I/O
/// and a way to block on value changes.
pub trait GpioBackend: Send + Sync + 'static {
    type Watch: EdgeWatch;
    type Waker: EdgeWaker;

    fn validate_id(&self, pin_id: u32) -> Result<(), GpioError>;
    fn is_exported(&self, pin_id: u32) -> Result<bool, GpioError>;
    fn export(&self, pin_id: u32) -> Result<(), GpioError>;
    fn unexport(&self, pin_id: u32) -> Result<(), GpioError>;
    fn set_direction(&self, pin_id: u32, direction: Direction) -> Result<(), GpioError>;
    fn read_value(&self, pin_id: u32) -> Result<Value, GpioError>;
    fn write_value(&self, pin_id: u32, value: Value) -> Result<(), GpioError>;
    fn configure_edge(&self, pin_id: u32, edge: EdgeDetect) -> Result<(), GpioError>;
    /// Opens a value-change source for the pin together with the waker that
    /// interrupts its blocking wait.
    fn watch_edges(&self, pin_id: u32) -> Result<(Self::Watch, Self::Waker), GpioError>;
}

/// Blocking side of an edge source. Owned by the poller thread.
pub trait EdgeWatch: Send + 'static {
    fn wait_for_edge_or_wake(&mut self) -> Result<WakeReason, GpioError>;
    /// Reads the value observed by the most recent edge.
    fn read_value(&mut self) -> Result<Value, GpioError>;
}

/// Loopback signal that makes a pending [`EdgeWatch::wait_for_edge_or_wake`]
/// return [`WakeReason::WakeSignaled`].
pub trait EdgeWaker: Send + Sync + 'static {
    fn wake(&self) -> Result<(), GpioError>;
}

type Claims = Arc<Mutex<FxHashSet<u32>>>;

/// Hands out pin handles and keeps track of which ids this process owns.
pub struct GpioManager<B: GpioBackend> {
    config: Arc<AppConfig>,
    backend: Arc<B>,
    claims: Claims,
}

impl<B: GpioBackend> GpioManager<B> {
    pub fn new(config: Arc<AppConfig>, backend: Arc<B>) -> Self {
        Self {
            config,
            backend,
            claims: Arc::new(Mutex::new(FxHashSet::default())),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Exports `pin_id` and configures its direction.
    pub fn open(&self, pin_id: u32, direction: Direction) -> Result<GpioPin<B>, GpioError> {
        let pin = self.export(pin_id, direction, EdgeDetect::None)?;
        debug!("gpio{pin_id} opened as {}", direction.as_sysfs());
        Ok(pin)
    }

    /// Exports `pin_id` as an input with edge detection and starts the
    /// poller and dispatcher threads. `callback` runs once per captured
    /// transition, in capture order.
    pub fn watch<F>(&self, pin_id: u32, edge: EdgeDetect, callback: F) -> Result<GpioPin<B>, GpioError>
    where
        F: FnMut(Value) + Send + 'static,
    {
        if edge == EdgeDetect::None {
            return Err(GpioError::InvalidState(format!(
                "edge detection on gpio{pin_id} requires rising, falling or both"
            )));
        }
        self.config.validate()?;

        // on any error below, dropping `pin` stops the threads and unexports
        let mut pin = self.export(pin_id, Direction::In, edge)?;
        self.backend.configure_edge(pin_id, edge)?;
        let (watch, waker) = self.backend.watch_edges(pin_id)?;
        let queue = EventQueue::new(&self.config.queue);
        pin.listener = Some(EdgeListener::start(
            pin_id,
            watch,
            waker,
            queue,
            Box::new(callback),
        )?);

        debug!("gpio{pin_id} watching {} edges", edge.as_sysfs());
        Ok(pin)
    }

    fn export(
        &self,
        pin_id: u32,
        direction: Direction,
        edge: EdgeDetect,
    ) -> Result<GpioPin<B>, GpioError> {
        let claim = Claim::acquire(&self.claims, pin_id)?;

        self.backend.validate_id(pin_id)?;
        if self.backend.is_exported(pin_id)? {
            return Err(GpioError::AlreadyExported(pin_id));
        }
        self.backend.export(pin_id)?;

        let pin = GpioPin {
            id: pin_id,
            direction,
            edge,
            backend: self.backend.clone(),
            listener: None,
            _claim: claim,
        };
        self.backend.set_direction(pin_id, direction)?;
        Ok(pin)
    }
}

/// In-process ownership of a pin id, released on drop.
struct Claim {
    claims: Claims,
    pin_id: u32,
}

impl Claim {
    fn acquire(claims: &Claims, pin_id: u32) -> Result<Self, GpioError> {
        if !claims.lock().insert(pin_id) {
            return Err(GpioError::AlreadyExported(pin_id));
        }
        Ok(Self {
            claims: claims.clone(),
            pin_id,
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.pin_id);
    }
}

/// An exported pin. Dropping it stops edge delivery, then unexports.
pub struct GpioPin<B: GpioBackend> {
    id: u32,
    direction: Direction,
    edge: EdgeDetect,
    backend: Arc<B>,
    listener: Option<EdgeListener<B::Waker>>,
    _claim: Claim, // released after unexport
}

impl<B: GpioBackend> GpioPin<B> {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn edge(&self) -> EdgeDetect {
        self.edge
    }

    pub fn set_value(&self, value: Value) -> Result<(), GpioError> {
        if self.direction != Direction::Out {
            return Err(GpioError::Direction(format!(
                "gpio{} is an input and cannot be written",
                self.id
            )));
        }
        self.backend.write_value(self.id, value)
    }

    pub fn value(&self) -> Result<Value, GpioError> {
        self.backend.read_value(self.id)
    }

    /// Events captured but not yet handed to the callback.
    pub fn queued_events(&self) -> usize {
        self.listener.as_ref().map(|l| l.queued()).unwrap_or(0)
    }

    /// Events discarded because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.listener.as_ref().map(|l| l.dropped()).unwrap_or(0)
    }
}

impl<B: GpioBackend> Drop for GpioPin<B> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            drop(listener);
        }
        if let Err(e) = self.backend.unexport(self.id) {
            warn!(
                "Unable to unexport gpio{}: {e}; the pin stays unavailable to new handles",
                self.id
            );
        } else {
            debug!("gpio{} unexported", self.id);
        }
    }
}
