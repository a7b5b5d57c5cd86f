use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{Direction, EdgeDetect, Value};
use crate::error::GpioError;
use crate::gpio::{EdgeWaker, EdgeWatch, GpioBackend, WakeReason};

const MOCK_DEFAULT_PIN_RANGE: Range<u32> = 0..512;
const MOCK_WAIT_TIMEOUT: Duration = Duration::from_millis(50);

type Failures = Arc<Mutex<FxHashSet<MockOp>>>;

/// Operations that can be made to fail on purpose.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Export,
    Unexport,
    SetDirection,
    Read,
    Write,
    ConfigureEdge,
    Watch,
    Wake,
}

/// In-memory pin bank with the same contract as the sysfs backend.
pub struct MockGpioBackend {
    range: Range<u32>,
    pins: RwLock<FxHashMap<u32, Arc<MockLine>>>, // keyed by pin id
    failures: Failures,
    exports: Mutex<FxHashMap<u32, usize>>,
    unexports: Mutex<FxHashMap<u32, usize>>,
    watches_opened: AtomicUsize,
    active_watches: Arc<AtomicUsize>,
}

struct MockLine {
    state: Mutex<MockPinState>,
    changed: Condvar,
}

struct MockPinState {
    exported: bool,
    direction: Direction,
    edge: EdgeDetect,
    level: Value,
    pending: VecDeque<Value>,
}

impl Default for MockGpioBackend {
    fn default() -> Self {
        Self::with_range(MOCK_DEFAULT_PIN_RANGE)
    }
}

impl MockGpioBackend {
    pub fn with_range(range: Range<u32>) -> Self {
        Self {
            range,
            pins: RwLock::new(FxHashMap::default()),
            failures: Arc::new(Mutex::new(FxHashSet::default())),
            exports: Mutex::new(FxHashMap::default()),
            unexports: Mutex::new(FxHashMap::default()),
            watches_opened: AtomicUsize::new(0),
            active_watches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Simulates another owner having exported `pin_id`.
    pub fn mark_exported(&self, pin_id: u32) {
        self.line(pin_id).state.lock().exported = true;
    }

    /// Simulates the outside world driving an input pin to `value`.
    pub fn drive(&self, pin_id: u32, value: Value) -> Result<(), GpioError> {
        let line = self.exported_line(pin_id)?;
        let mut pin = line.state.lock();
        if pin.direction != Direction::In {
            return Err(GpioError::Direction(format!(
                "gpio{pin_id} is an output and cannot be driven externally"
            )));
        }
        let old = pin.level;
        pin.level = value;
        if pin.edge.matches(old, value) {
            pin.pending.push_back(value);
            drop(pin);
            line.changed.notify_all();
        }
        Ok(())
    }

    pub fn fail_on(&self, op: MockOp) {
        self.failures.lock().insert(op);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn export_count(&self, pin_id: u32) -> usize {
        self.exports.lock().get(&pin_id).copied().unwrap_or(0)
    }

    pub fn unexport_count(&self, pin_id: u32) -> usize {
        self.unexports.lock().get(&pin_id).copied().unwrap_or(0)
    }

    /// Edge watches handed out so far.
    pub fn watches_opened(&self) -> usize {
        self.watches_opened.load(Ordering::SeqCst)
    }

    /// Edge watches not yet dropped by their poller thread.
    pub fn active_watches(&self) -> usize {
        self.active_watches.load(Ordering::SeqCst)
    }

    fn check(&self, op: MockOp, pin_id: u32) -> Result<(), GpioError> {
        check_injected(&self.failures, op, pin_id)
    }

    fn line(&self, pin_id: u32) -> Arc<MockLine> {
        if let Some(line) = self.pins.read().get(&pin_id) {
            return line.clone();
        }
        self.pins
            .write()
            .entry(pin_id)
            .or_insert_with(|| {
                Arc::new(MockLine {
                    state: Mutex::new(MockPinState {
                        exported: false,
                        direction: Direction::In,
                        edge: EdgeDetect::None,
                        level: Value::Low,
                        pending: VecDeque::new(),
                    }),
                    changed: Condvar::new(),
                })
            })
            .clone()
    }

    fn exported_line(&self, pin_id: u32) -> Result<Arc<MockLine>, GpioError> {
        let line = self.line(pin_id);
        if !line.state.lock().exported {
            return Err(GpioError::Io(format!("gpio{pin_id} is not exported")));
        }
        Ok(line)
    }
}

impl GpioBackend for MockGpioBackend {
    type Watch = MockEdgeWatch;
    type Waker = MockEdgeWaker;

    fn validate_id(&self, pin_id: u32) -> Result<(), GpioError> {
        if self.range.contains(&pin_id) {
            Ok(())
        } else {
            Err(GpioError::InvalidId(pin_id))
        }
    }

    fn is_exported(&self, pin_id: u32) -> Result<bool, GpioError> {
        Ok(self
            .pins
            .read()
            .get(&pin_id)
            .map(|line| line.state.lock().exported)
            .unwrap_or(false))
    }

    fn export(&self, pin_id: u32) -> Result<(), GpioError> {
        self.check(MockOp::Export, pin_id)?;
        let line = self.line(pin_id);
        let mut pin = line.state.lock();
        if pin.exported {
            return Err(GpioError::AlreadyExported(pin_id));
        }
        pin.exported = true;
        pin.direction = Direction::In;
        pin.edge = EdgeDetect::None;
        pin.pending.clear();
        *self.exports.lock().entry(pin_id).or_default() += 1;
        Ok(())
    }

    fn unexport(&self, pin_id: u32) -> Result<(), GpioError> {
        *self.unexports.lock().entry(pin_id).or_default() += 1;
        self.check(MockOp::Unexport, pin_id)?;
        let line = self.exported_line(pin_id)?;
        let mut pin = line.state.lock();
        pin.exported = false;
        pin.edge = EdgeDetect::None;
        pin.pending.clear();
        Ok(())
    }

    fn set_direction(&self, pin_id: u32, direction: Direction) -> Result<(), GpioError> {
        self.check(MockOp::SetDirection, pin_id)?;
        self.exported_line(pin_id)?.state.lock().direction = direction;
        Ok(())
    }

    fn read_value(&self, pin_id: u32) -> Result<Value, GpioError> {
        self.check(MockOp::Read, pin_id)?;
        Ok(self.exported_line(pin_id)?.state.lock().level)
    }

    fn write_value(&self, pin_id: u32, value: Value) -> Result<(), GpioError> {
        self.check(MockOp::Write, pin_id)?;
        let line = self.exported_line(pin_id)?;
        let mut pin = line.state.lock();
        if pin.direction != Direction::Out {
            return Err(GpioError::Direction(format!(
                "gpio{pin_id} must be an output to set its value"
            )));
        }
        pin.level = value;
        Ok(())
    }

    fn configure_edge(&self, pin_id: u32, edge: EdgeDetect) -> Result<(), GpioError> {
        self.check(MockOp::ConfigureEdge, pin_id)?;
        let line = self.exported_line(pin_id)?;
        let mut pin = line.state.lock();
        if edge != EdgeDetect::None && pin.direction != Direction::In {
            return Err(GpioError::Direction(format!(
                "edge detection on gpio{pin_id} requires an input"
            )));
        }
        pin.edge = edge;
        Ok(())
    }

    fn watch_edges(&self, pin_id: u32) -> Result<(MockEdgeWatch, MockEdgeWaker), GpioError> {
        self.check(MockOp::Watch, pin_id)?;
        let line = self.exported_line(pin_id)?;
        let woken = Arc::new(AtomicBool::new(false));

        self.watches_opened.fetch_add(1, Ordering::SeqCst);
        self.active_watches.fetch_add(1, Ordering::SeqCst);
        let watch = MockEdgeWatch {
            line: line.clone(),
            woken: woken.clone(),
            captured: Value::Low,
            active: self.active_watches.clone(),
        };
        let waker = MockEdgeWaker {
            pin_id,
            line,
            woken,
            failures: self.failures.clone(),
        };
        Ok((watch, waker))
    }
}

fn check_injected(failures: &Failures, op: MockOp, pin_id: u32) -> Result<(), GpioError> {
    if failures.lock().contains(&op) {
        return Err(GpioError::Io(format!("injected {op:?} failure on gpio{pin_id}")));
    }
    Ok(())
}

pub struct MockEdgeWatch {
    line: Arc<MockLine>,
    woken: Arc<AtomicBool>,
    captured: Value,
    active: Arc<AtomicUsize>,
}

impl EdgeWatch for MockEdgeWatch {
    fn wait_for_edge_or_wake(&mut self) -> Result<WakeReason, GpioError> {
        let mut pin = self.line.state.lock();
        loop {
            if self.woken.load(Ordering::Acquire) {
                return Ok(WakeReason::WakeSignaled);
            }
            if let Some(value) = pin.pending.pop_front() {
                self.captured = value;
                return Ok(WakeReason::EdgeDetected);
            }
            if self
                .line
                .changed
                .wait_for(&mut pin, MOCK_WAIT_TIMEOUT)
                .timed_out()
            {
                return Ok(WakeReason::TimedOut);
            }
        }
    }

    fn read_value(&mut self) -> Result<Value, GpioError> {
        Ok(self.captured)
    }
}

impl Drop for MockEdgeWatch {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockEdgeWaker {
    pin_id: u32,
    line: Arc<MockLine>,
    woken: Arc<AtomicBool>,
    failures: Failures,
}

impl EdgeWaker for MockEdgeWaker {
    fn wake(&self) -> Result<(), GpioError> {
        check_injected(&self.failures, MockOp::Wake, self.pin_id)?;
        self.woken.store(true, Ordering::Release);
        // take the lock so a waiter between its flag check and wait sees the notify
        drop(self.line.state.lock());
        self.line.changed.notify_all();
        Ok(())
    }
}
