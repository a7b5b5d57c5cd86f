use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sysgpio::{
    AppConfig, Direction, EdgeDetect, GpioError, GpioManager, MockGpioBackend, MockOp,
    QueueConfig, Value,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn manager_with(queue: QueueConfig) -> (GpioManager<MockGpioBackend>, Arc<MockGpioBackend>) {
    let config = Arc::new(AppConfig {
        queue,
        ..AppConfig::default()
    });
    let backend = Arc::new(MockGpioBackend::with_range(0..128));
    (GpioManager::new(config, backend.clone()), backend)
}

fn manager() -> (GpioManager<MockGpioBackend>, Arc<MockGpioBackend>) {
    manager_with(QueueConfig::default())
}

fn collect(rx: &Receiver<Value>, n: usize) -> Vec<Value> {
    (0..n)
        .map(|_| rx.recv_timeout(RECV_TIMEOUT).expect("edge callback was not invoked"))
        .collect()
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + RECV_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn output_round_trip() {
    let (manager, _) = manager();
    let pin = manager.open(17, Direction::Out).unwrap();

    pin.set_value(Value::High).unwrap();
    assert_eq!(pin.value().unwrap(), Value::High);
    pin.set_value(Value::Low).unwrap();
    assert_eq!(pin.value().unwrap(), Value::Low);
}

#[test]
fn writing_an_input_is_a_direction_error() {
    let (manager, _) = manager();
    let pin = manager.open(4, Direction::In).unwrap();

    assert!(matches!(pin.set_value(Value::High), Err(GpioError::Direction(_))));
}

#[test]
fn id_outside_platform_range_is_rejected() {
    let (manager, backend) = manager();

    assert!(matches!(
        manager.open(500, Direction::Out),
        Err(GpioError::InvalidId(500))
    ));
    assert_eq!(backend.export_count(500), 0);
}

#[test]
fn second_handle_for_same_id_fails_until_first_is_dropped() {
    let (manager, backend) = manager();
    let first = manager.open(22, Direction::Out).unwrap();

    assert!(matches!(
        manager.open(22, Direction::In),
        Err(GpioError::AlreadyExported(22))
    ));

    drop(first);
    assert_eq!(backend.unexport_count(22), 1);
    let second = manager.open(22, Direction::In).unwrap();
    assert_eq!(second.direction(), Direction::In);
    assert_eq!(backend.export_count(22), 2);
}

#[test]
fn concurrent_constructions_never_double_export() {
    let (manager, backend) = manager();
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            thread::spawn(move || manager.open(9, Direction::Out).map(|pin| pin.id()))
        })
        .collect();
    let (winners, losers): (Vec<_>, Vec<_>) = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .partition(Result::is_ok);

    for loser in &losers {
        assert!(
            matches!(loser, Err(GpioError::AlreadyExported(9))),
            "unexpected failure: {loser:?}"
        );
    }
    // winners drop their handle before the next may succeed, so exports == winners
    assert!(!winners.is_empty());
    assert_eq!(winners.len() + losers.len(), 8);
    assert_eq!(backend.export_count(9), winners.len());
    assert_eq!(backend.unexport_count(9), winners.len());
}

#[test]
fn pin_owned_elsewhere_fails_without_starting_threads() {
    let (manager, backend) = manager();
    backend.mark_exported(60);

    let res = manager.watch(60, EdgeDetect::Both, |_| {});

    assert!(matches!(res, Err(GpioError::AlreadyExported(60))));
    assert_eq!(backend.export_count(60), 0);
    assert_eq!(backend.watches_opened(), 0);
    // the foreign export is not ours to release
    assert_eq!(backend.unexport_count(60), 0);
}

#[test]
fn both_edges_are_delivered_in_capture_order() {
    let (manager, backend) = manager();
    let (tx, rx) = mpsc::channel();
    let pin = manager
        .watch(60, EdgeDetect::Both, move |v| tx.send(v).unwrap())
        .unwrap();
    assert_eq!(backend.active_watches(), 1);

    for v in [Value::High, Value::Low, Value::High] {
        backend.drive(60, v).unwrap();
    }

    assert_eq!(collect(&rx, 3), vec![Value::High, Value::Low, Value::High]);
    assert_eq!(pin.dropped_events(), 0);
}

#[test]
fn rising_mode_ignores_falling_edges() {
    let (manager, backend) = manager();
    let (tx, rx) = mpsc::channel();
    let _pin = manager
        .watch(5, EdgeDetect::Rising, move |v| tx.send(v).unwrap())
        .unwrap();

    for v in [Value::High, Value::Low, Value::High, Value::Low] {
        backend.drive(5, v).unwrap();
    }

    assert_eq!(collect(&rx, 2), vec![Value::High, Value::High]);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn long_sequence_is_lossless_for_both_queue_kinds() {
    for queue in [
        QueueConfig::default(),
        QueueConfig::LockFree { capacity: 1024 },
    ] {
        let (manager, backend) = manager_with(queue);
        let (tx, rx) = mpsc::channel();
        let pin = manager
            .watch(33, EdgeDetect::Both, move |v| tx.send(v).unwrap())
            .unwrap();

        let expected: Vec<Value> = (0..200).map(|i| Value::from(i % 2 == 0)).collect();
        for v in &expected {
            backend.drive(33, *v).unwrap();
        }

        assert_eq!(collect(&rx, expected.len()), expected);
        assert_eq!(pin.dropped_events(), 0);
    }
}

#[test]
fn slow_callback_never_stalls_capture() {
    let (manager, backend) = manager();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let (tx, rx) = mpsc::channel();
    let pin = manager
        .watch(12, EdgeDetect::Both, move |v| {
            let _ = gate_rx.recv();
            tx.send(v).unwrap();
        })
        .unwrap();

    for v in [Value::High, Value::Low, Value::High, Value::Low] {
        backend.drive(12, v).unwrap();
    }
    // first event is inside the callback, the rest are buffered by the poller
    wait_until(|| pin.queued_events() == 3);

    for _ in 0..4 {
        gate_tx.send(()).unwrap();
    }
    assert_eq!(
        collect(&rx, 4),
        vec![Value::High, Value::Low, Value::High, Value::Low]
    );
}

#[test]
fn shutdown_drains_buffered_events_and_joins_threads() {
    let (manager, backend) = manager();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let pin = manager
        .watch(60, EdgeDetect::Both, move |v| {
            let _ = gate_rx.recv();
            sink.lock().unwrap().push(v);
        })
        .unwrap();

    for v in [Value::High, Value::Low, Value::High] {
        backend.drive(60, v).unwrap();
    }
    wait_until(|| pin.queued_events() == 2);

    let dropper = thread::spawn(move || drop(pin));
    for _ in 0..3 {
        gate_tx.send(()).unwrap();
    }
    dropper.join().unwrap();

    assert_eq!(*log.lock().unwrap(), vec![Value::High, Value::Low, Value::High]);
    assert_eq!(backend.active_watches(), 0);
    assert_eq!(backend.unexport_count(60), 1);
    assert!(!sysgpio::GpioBackend::is_exported(backend.as_ref(), 60).unwrap());
}

#[test]
fn idle_handle_drops_promptly() {
    let (manager, backend) = manager();
    let pin = manager.watch(8, EdgeDetect::Falling, |_| {}).unwrap();

    let started = Instant::now();
    drop(pin);

    assert!(started.elapsed() < RECV_TIMEOUT);
    assert_eq!(backend.active_watches(), 0);
    assert_eq!(backend.watches_opened(), 1);
}

#[test]
fn bounded_queue_drops_under_backpressure_but_keeps_order() {
    for queue in [
        QueueConfig::Locked { capacity: Some(2) },
        QueueConfig::LockFree { capacity: 2 },
    ] {
        let (manager, backend) = manager_with(queue);
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (tx, rx) = mpsc::channel();
        let pin = manager
            .watch(40, EdgeDetect::Both, move |v| {
                let _ = entered_tx.send(());
                let _ = gate_rx.recv();
                tx.send(v).unwrap();
            })
            .unwrap();

        backend.drive(40, Value::High).unwrap();
        entered_rx.recv_timeout(RECV_TIMEOUT).unwrap();
        // the dispatcher is parked in the callback holding the first event
        for v in [Value::Low, Value::High, Value::Low, Value::High] {
            backend.drive(40, v).unwrap();
        }
        wait_until(|| pin.dropped_events() == 2);

        for _ in 0..3 {
            gate_tx.send(()).unwrap();
        }
        assert_eq!(collect(&rx, 3), vec![Value::High, Value::Low, Value::High]);
        drop(gate_tx);
        drop(pin);
        assert!(rx.try_recv().is_err());
    }
}

#[test]
fn failure_after_export_rolls_back() {
    let (manager, backend) = manager();
    backend.fail_on(MockOp::ConfigureEdge);

    let res = manager.watch(3, EdgeDetect::Both, |_| {});
    assert!(matches!(res, Err(GpioError::Io(_))));
    assert_eq!(backend.export_count(3), 1);
    assert_eq!(backend.unexport_count(3), 1);
    assert_eq!(backend.watches_opened(), 0);

    backend.clear_failures();
    let pin = manager.watch(3, EdgeDetect::Both, |_| {}).unwrap();
    assert_eq!(pin.edge(), EdgeDetect::Both);
}

#[test]
fn watch_failure_leaves_no_threads_behind() {
    let (manager, backend) = manager();
    backend.fail_on(MockOp::Watch);

    assert!(manager.watch(3, EdgeDetect::Rising, |_| {}).is_err());
    assert_eq!(backend.active_watches(), 0);
    assert_eq!(backend.unexport_count(3), 1);
}

#[test]
fn unexport_failure_is_not_fatal() {
    let (manager, backend) = manager();
    let pin = manager.watch(21, EdgeDetect::Both, |_| {}).unwrap();
    backend.fail_on(MockOp::Unexport);

    drop(pin);

    assert_eq!(backend.unexport_count(21), 1);
    assert_eq!(backend.active_watches(), 0);
}

#[test]
fn edge_none_is_rejected_before_export() {
    let (manager, backend) = manager();

    assert!(matches!(
        manager.watch(2, EdgeDetect::None, |_| {}),
        Err(GpioError::InvalidState(_))
    ));
    assert_eq!(backend.export_count(2), 0);
}

#[test]
fn zero_capacity_queue_is_a_config_error() {
    let (manager, backend) = manager_with(QueueConfig::LockFree { capacity: 0 });

    assert!(matches!(
        manager.watch(2, EdgeDetect::Both, |_| {}),
        Err(GpioError::Config(_))
    ));
    assert_eq!(backend.export_count(2), 0);
}

#[test]
fn failed_wake_still_releases_the_pin() {
    let (manager, backend) = manager();
    let pin = manager.watch(33, EdgeDetect::Both, |_| {}).unwrap();
    backend.fail_on(MockOp::Wake);

    let started = Instant::now();
    drop(pin);

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(backend.active_watches(), 0);
    assert_eq!(backend.unexport_count(33), 1);
}

const PANIC_CHILD_ENV: &str = "SYSGPIO_PANICKING_CALLBACK_CHILD";

#[test]
fn panicking_callback_aborts_the_process() {
    if std::env::var_os(PANIC_CHILD_ENV).is_some() {
        let (manager, backend) = manager();
        let _pin = manager
            .watch(7, EdgeDetect::Both, |_| panic!("callback failure"))
            .unwrap();
        backend.drive(7, Value::High).unwrap();
        // only reached if the panic was swallowed, which the parent reports
        thread::sleep(RECV_TIMEOUT);
        return;
    }

    let status = Command::new(std::env::current_exe().unwrap())
        .args([
            "panicking_callback_aborts_the_process",
            "--exact",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(PANIC_CHILD_ENV, "1")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();

    assert!(!status.success());
    // killed by SIGABRT rather than a failing test's exit code
    assert_eq!(status.code(), None, "child exited with {status}");
    assert!(status.signal().is_some());
}
