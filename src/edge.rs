//! Edge notification pipeline.
//!
//! ```text
//! kernel edge ─► poller thread ─► EventQueue ─► dispatcher thread ─► callback
//! ```
//!
//! The poller only blocks on the edge source and captures values; it never
//! runs user code, so a slow callback can only fill the queue, never delay
//! edge detection. Teardown runs the other way: raise the shutdown flag, wake
//! the poller, join it, close the queue, let the dispatcher drain, join it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::error::GpioError;
use crate::gpio::{EdgeCallback, EdgeWaker, EdgeWatch, WakeReason};
use crate::queue::EventQueue;

/// Pause after a failed wait, doubled per consecutive failure up to the cap.
const WAIT_ERROR_BACKOFF_MIN: Duration = Duration::from_millis(1);
const WAIT_ERROR_BACKOFF_MAX: Duration = Duration::from_millis(100);

pub(crate) struct EdgeListener<W: EdgeWaker> {
    pin_id: u32,
    shutdown: Arc<AtomicBool>,
    waker: W,
    queue: Arc<EventQueue>,
    poller: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl<W: EdgeWaker> EdgeListener<W> {
    /// Spawns the dispatcher and poller and returns once both are running.
    pub(crate) fn start<E: EdgeWatch>(
        pin_id: u32,
        watch: E,
        waker: W,
        queue: EventQueue,
        callback: EdgeCallback,
    ) -> Result<Self, GpioError> {
        let mut listener = Self {
            pin_id,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
            queue: Arc::new(queue),
            poller: None,
            dispatcher: None,
        };
        let (ready_tx, ready_rx) = mpsc::sync_channel::<()>(2);

        let queue = listener.queue.clone();
        let ready = ready_tx.clone();
        listener.dispatcher = Some(
            thread::Builder::new()
                .name(format!("gpio{pin_id}-dispatch"))
                .spawn(move || {
                    let _ = ready.send(());
                    dispatch_edges(pin_id, &queue, callback);
                })
                .map_err(|e| GpioError::io(format!("spawn dispatcher for gpio{pin_id}"), e))?,
        );

        let queue = listener.queue.clone();
        let shutdown = listener.shutdown.clone();
        listener.poller = Some(
            thread::Builder::new()
                .name(format!("gpio{pin_id}-poll"))
                .spawn(move || {
                    let _ = ready_tx.send(());
                    poll_edges(pin_id, watch, &shutdown, &queue);
                })
                .map_err(|e| GpioError::io(format!("spawn poller for gpio{pin_id}"), e))?,
        );

        for _ in 0..2 {
            ready_rx.recv().map_err(|_| {
                GpioError::InvalidState(format!("edge worker for gpio{pin_id} exited during startup"))
            })?;
        }
        debug!("gpio{pin_id} edge workers running");
        Ok(listener)
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// If the wake fails the poller still notices the shutdown flag the next
    /// time its watch returns [`WakeReason::TimedOut`].
    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!("wake poller for gpio{}: {e}, waiting for its poll timeout", self.pin_id);
        }
        if let Some(handle) = self.poller.take()
            && handle.join().is_err()
        {
            error!("poller thread for gpio{} panicked", self.pin_id);
        }

        // nothing can be produced from here on
        self.queue.close();
        if let Some(handle) = self.dispatcher.take()
            && handle.join().is_err()
        {
            error!("dispatcher thread for gpio{} panicked", self.pin_id);
        }
        debug!("gpio{} edge workers stopped", self.pin_id);
    }
}

impl<W: EdgeWaker> Drop for EdgeListener<W> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_edges<E: EdgeWatch>(pin_id: u32, mut watch: E, shutdown: &AtomicBool, queue: &EventQueue) {
    let mut backoff = WAIT_ERROR_BACKOFF_MIN;
    while !shutdown.load(Ordering::Acquire) {
        match watch.wait_for_edge_or_wake() {
            Ok(WakeReason::EdgeDetected) => backoff = WAIT_ERROR_BACKOFF_MIN,
            Ok(WakeReason::WakeSignaled) => break,
            Ok(WakeReason::TimedOut) => {
                backoff = WAIT_ERROR_BACKOFF_MIN;
                continue;
            }
            Err(e) => {
                warn!("wait edge events error for gpio{pin_id}: {e}, retrying in {backoff:?}");
                thread::sleep(backoff);
                backoff = (backoff * 2).min(WAIT_ERROR_BACKOFF_MAX);
                continue;
            }
        }

        let value = match watch.read_value() {
            Ok(v) => v,
            Err(e) => {
                warn!("read value error for gpio{pin_id}: {e}");
                continue;
            }
        };
        if let Err(value) = queue.push(value) {
            trace!("event queue for gpio{pin_id} full, dropped {value}");
        }
    }
    debug!("gpio{pin_id} poller exiting");
}

fn dispatch_edges(pin_id: u32, queue: &EventQueue, mut callback: EdgeCallback) {
    let _guard = AbortOnCallbackPanic { pin_id };
    while let Some(value) = queue.pop_wait() {
        callback(value);
    }
    debug!("gpio{pin_id} dispatcher exiting");
}

/// A panicking callback takes the process down rather than silently
/// stopping delivery.
struct AbortOnCallbackPanic {
    pin_id: u32,
}

impl Drop for AbortOnCallbackPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("edge callback for gpio{} panicked, aborting", self.pin_id);
            std::process::abort();
        }
    }
}
