// End-to-end worker behaviour against the simulated axis, on virtual time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{sleep, timeout};

use device_worker::device::sim::{SimConnector, SimDevice};
use device_worker::{
    CommandArgs, CommandOutcome, ConfigError, ConnectionState, DeviceState, Scalar, Shutdown,
    Worker, WorkerConfig, WorkerError, WorkerEvent,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn config() -> WorkerConfig {
    WorkerConfig::new("axis-x", "sim://axis-x").with_attributes(["position", "velocity", "state"])
}

fn float(v: f64) -> CommandArgs {
    CommandArgs::Scalar(Scalar::Float(v))
}

async fn recv(rx: &mut UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
    timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("timed out waiting for a worker event")
        .expect("event channel closed")
}

/// Collect events up to and including the first one matching `done`.
async fn until(
    rx: &mut UnboundedReceiver<WorkerEvent>,
    done: impl Fn(&WorkerEvent) -> bool,
) -> Vec<WorkerEvent> {
    let mut seen = Vec::new();
    loop {
        let event = recv(rx).await;
        let stop = done(&event);
        seen.push(event);
        if stop {
            return seen;
        }
    }
}

fn outcomes(events: &[WorkerEvent]) -> Vec<CommandOutcome> {
    events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::CommandOutcome(o) => Some(o.clone()),
            _ => None,
        })
        .collect()
}

async fn next_outcome(rx: &mut UnboundedReceiver<WorkerEvent>) -> CommandOutcome {
    let events = until(rx, |e| matches!(e, WorkerEvent::CommandOutcome(_))).await;
    outcomes(&events).remove(0)
}

fn is_health(healthy: bool) -> impl Fn(&WorkerEvent) -> bool {
    move |e| matches!(e, WorkerEvent::HealthChanged { healthy: h, .. } if *h == healthy)
}

fn is_connection(connected: bool) -> impl Fn(&WorkerEvent) -> bool {
    move |e| matches!(e, WorkerEvent::ConnectionChanged { connected: c, .. } if *c == connected)
}

async fn wait_invoked(device: &SimDevice, command: &str) {
    timeout(Duration::from_secs(60), async {
        while !device.invocations().iter().any(|n| n == command) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("command never reached the device");
}

/// Start a worker on a fresh simulated device and wait until it is healthy.
async fn started(config: WorkerConfig) -> (Worker, SimDevice, UnboundedReceiver<WorkerEvent>) {
    let device = SimDevice::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut worker = Worker::new(config, Arc::new(SimConnector::new(device.clone())), tx).unwrap();
    worker.start();
    until(&mut rx, is_health(true)).await;
    (worker, device, rx)
}

/// Like [`started`], with the axis already initialised through the worker.
async fn started_initialised(
    config: WorkerConfig,
) -> (Worker, SimDevice, UnboundedReceiver<WorkerEvent>) {
    let (worker, device, mut rx) = started(config).await;
    worker.queue_command("init", CommandArgs::None).unwrap();
    assert!(next_outcome(&mut rx).await.success);
    (worker, device, rx)
}

// ── Command pipeline ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn outcomes_follow_enqueue_order_exactly_once() {
    let (mut worker, device, mut rx) = started(config()).await;

    worker.queue_command("init", CommandArgs::None).unwrap();
    worker.queue_command("moveRelative", float(5.0)).unwrap();
    worker.queue_command("moveRelative", float(-2.0)).unwrap();

    let mut got = Vec::new();
    for _ in 0..3 {
        got.push(next_outcome(&mut rx).await);
    }
    let names: Vec<&str> = got.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, ["init", "moveRelative", "moveRelative"]);
    assert!(got.iter().all(|o| o.success), "{got:?}");
    assert_eq!(got[1].message, "moveRelative ok: 5");
    assert_eq!(device.position(), 3.0);
    assert_eq!(device.invocations(), ["init", "moveRelative", "moveRelative"]);

    assert_eq!(worker.stop().await, Shutdown::Clean);
    let rest = until(&mut rx, is_connection(false)).await;
    assert!(outcomes(&rest).is_empty());
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_immediately_and_keeps_size() {
    let mut cfg = config();
    cfg.max_queue_size = 2;
    let (mut worker, device, mut rx) = started_initialised(cfg).await;
    device.set_command_delay("moveRelative", Duration::from_secs(1));

    worker.queue_command("moveRelative", float(1.0)).unwrap();
    wait_invoked(&device, "moveRelative").await;

    worker.queue_command("setVelocity", float(2.0)).unwrap();
    worker.queue_command("setVelocity", float(3.0)).unwrap();
    assert_eq!(worker.queued_len(), 2);

    let err = worker.queue_command("home", CommandArgs::None).unwrap_err();
    assert_eq!(err, WorkerError::QueueFull { capacity: 2 });
    assert_eq!(worker.queued_len(), 2);

    let rejected = next_outcome(&mut rx).await;
    assert_eq!(rejected.name, "home");
    assert!(!rejected.success);
    assert_eq!(rejected.message, "Queue busy (2 commands pending)");

    let mut rest = Vec::new();
    for _ in 0..3 {
        rest.push(next_outcome(&mut rx).await);
    }
    let names: Vec<&str> = rest.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, ["moveRelative", "setVelocity", "setVelocity"]);
    assert!(rest.iter().all(|o| o.success));
    assert!(!device.invocations().iter().any(|n| n == "home"));

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unhealthy_worker_only_admits_critical_commands() {
    let (mut worker, device, mut rx) = started_initialised(config()).await;

    device.set_attributes_failing(true);
    until(&mut rx, is_health(false)).await;
    assert!(!worker.is_healthy());
    // Zero-success polls without a transport error keep the session.
    assert_eq!(worker.connection_state(), ConnectionState::Connected);

    let first = worker.queue_command("moveRelative", float(1.0));
    let second = worker.queue_command("moveRelative", float(1.0));
    assert!(matches!(first, Err(WorkerError::Unhealthy(_))), "{first:?}");
    assert!(matches!(second, Err(WorkerError::Unhealthy(_))));
    worker.queue_command("stop", CommandArgs::None).unwrap();

    let got = [
        next_outcome(&mut rx).await,
        next_outcome(&mut rx).await,
        next_outcome(&mut rx).await,
    ];
    assert!(!got[0].success && !got[1].success);
    assert!(got[0].message.contains("consecutive failed polls"), "{}", got[0].message);
    assert_eq!(got[2].name, "stop");
    assert!(got[2].success);

    assert_eq!(device.invocations(), ["init", "stop"]);
    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn timeout_drops_session_and_flushes_queue_silently() {
    let (mut worker, device, mut rx) = started_initialised(config()).await;
    device.set_command_delay("moveRelative", Duration::from_secs(10));

    worker.queue_command("moveRelative", float(1.0)).unwrap();
    wait_invoked(&device, "moveRelative").await;
    worker.queue_command("stop", CommandArgs::None).unwrap();
    worker.queue_command("reset", CommandArgs::None).unwrap();

    let events = until(&mut rx, is_connection(false)).await;
    let failed = outcomes(&events);
    assert_eq!(failed.len(), 1, "{failed:?}");
    assert_eq!(failed[0].name, "moveRelative");
    assert!(!failed[0].success);
    assert!(failed[0].message.starts_with("Timeout"), "{}", failed[0].message);

    assert_eq!(worker.queued_len(), 0);
    assert!(!worker.is_healthy());
    assert_ne!(worker.connection_state(), ConnectionState::Connected);

    // The worker reconnects on its own; the flushed commands never run.
    let events = until(&mut rx, is_connection(true)).await;
    assert!(outcomes(&events).is_empty());
    assert_eq!(device.invocations(), ["init", "moveRelative"]);
    assert_eq!(device.connect_count(), 2);

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_command_keeps_session() {
    let (mut worker, device, mut rx) = started(config()).await;

    worker.queue_command("moveRelative", float(1.0)).unwrap();
    let outcome = next_outcome(&mut rx).await;
    assert!(!outcome.success);
    assert_eq!(outcome.message, "Device rejected command: axis not initialised");

    assert_eq!(worker.connection_state(), ConnectionState::Connected);
    assert!(worker.is_healthy());
    assert_eq!(device.connect_count(), 1);
    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn ready_commands_get_one_init_attempt() {
    let cfg = config().with_ready_commands(["moveAbsolute"]);
    let (mut worker, device, mut rx) = started(cfg).await;
    assert_eq!(device.state(), DeviceState::Off);

    worker.queue_command("moveAbsolute", float(7.0)).unwrap();
    let outcome = next_outcome(&mut rx).await;
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(device.invocations(), ["init", "moveAbsolute"]);
    assert_eq!(device.position(), 7.0);

    device.set_state(DeviceState::Fault);
    device.reject_command("init", "interlock open");
    worker.queue_command("moveAbsolute", float(1.0)).unwrap();
    let outcome = next_outcome(&mut rx).await;
    assert!(!outcome.success);
    assert_eq!(outcome.message, "Device rejected command: interlock open");
    assert_eq!(device.position(), 7.0);

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn command_timeout_covers_ready_check_and_init() {
    let cfg = config().with_ready_commands(["moveAbsolute"]);
    let (mut worker, device, mut rx) = started(cfg).await;
    // Each call fits the budget on its own; together they do not.
    device.set_command_delay("init", Duration::from_millis(1400));
    device.set_command_delay("moveAbsolute", Duration::from_millis(1400));

    let begin = tokio::time::Instant::now();
    worker.queue_command("moveAbsolute", float(3.0)).unwrap();
    let outcome = next_outcome(&mut rx).await;
    let elapsed = begin.elapsed();

    assert!(!outcome.success, "{outcome:?}");
    assert!(outcome.message.starts_with("Timeout"), "{}", outcome.message);
    assert!(elapsed <= Duration::from_millis(1600), "took {elapsed:?}");
    assert_eq!(device.invocations(), ["init", "moveAbsolute"]);
    assert_ne!(device.position(), 3.0);

    until(&mut rx, is_connection(false)).await;
    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn health_is_rechecked_when_a_command_is_dequeued() {
    let mut cfg = config();
    cfg.failure_threshold = 1;
    let (mut worker, device, mut rx) = started_initialised(cfg).await;

    // Hold the next poll open long enough to queue behind it.
    device.set_read_delay(Duration::from_secs(1));
    device.set_attributes_failing(true);
    let reads = device.attribute_reads();
    timeout(Duration::from_secs(10), async {
        while device.attribute_reads() == reads {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no poll started");

    // Still healthy at enqueue time; the poll in flight flips it.
    worker.queue_command("moveRelative", float(1.0)).unwrap();
    let events = until(&mut rx, |e| matches!(e, WorkerEvent::CommandOutcome(_))).await;
    assert!(events.iter().any(is_health(false)), "{events:?}");

    let outcome = outcomes(&events).remove(0);
    assert_eq!(outcome.name, "moveRelative");
    assert!(!outcome.success);
    assert!(outcome.message.starts_with("Device unhealthy"), "{}", outcome.message);
    assert_eq!(device.invocations(), ["init"]);
    assert_eq!(device.position(), 0.0);
    assert_eq!(worker.connection_state(), ConnectionState::Connected);

    worker.stop().await;
}

// ── Connection and polling ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn commands_are_refused_while_not_connected() {
    let device = SimDevice::new();
    device.set_online(false);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut worker = Worker::new(config(), Arc::new(SimConnector::new(device.clone())), tx).unwrap();

    // Not started yet.
    assert_eq!(
        worker.queue_command("stop", CommandArgs::None),
        Err(WorkerError::NotConnected)
    );
    let outcome = next_outcome(&mut rx).await;
    assert_eq!(outcome.message, "Device not connected");

    worker.start();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(
        worker.queue_command("stop", CommandArgs::None),
        Err(WorkerError::NotConnected)
    );
    assert_eq!(worker.queued_len(), 0);
    assert_eq!(worker.stop().await, Shutdown::Clean);
}

#[tokio::test(start_paused = true)]
async fn reconnect_attempts_are_throttled_with_backoff() {
    let device = SimDevice::new();
    device.set_online(false);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut worker = Worker::new(config(), Arc::new(SimConnector::new(device.clone())), tx).unwrap();
    worker.start();

    // Attempts at 0s, 3s and 9s (3s, then 6s backoff).
    sleep(Duration::from_secs(10)).await;
    assert_eq!(device.connect_attempts(), 3);
    assert_eq!(worker.connection_state(), ConnectionState::Disconnected);

    device.set_online(true);
    until(&mut rx, is_connection(true)).await;
    assert_eq!(device.connect_attempts(), 4);
    assert_eq!(worker.connection_state(), ConnectionState::Connected);

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn lost_transport_drops_session_after_threshold() {
    let (mut worker, device, mut rx) = started(config()).await;

    device.set_online(false);
    let events = until(&mut rx, is_connection(false)).await;
    assert!(events.iter().any(is_health(false)));
    assert!(!worker.is_healthy());

    device.set_online(true);
    until(&mut rx, is_health(true)).await;
    assert_eq!(worker.connection_state(), ConnectionState::Connected);
    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn cache_holds_polled_values_and_device_status() {
    let (mut worker, _device, mut rx) = started_initialised(config()).await;

    worker.queue_command("moveAbsolute", float(12.5)).unwrap();
    assert!(next_outcome(&mut rx).await.success);

    // One poll interval later the cache reflects the move.
    sleep(Duration::from_secs(1)).await;
    let snap = worker.cached_status().expect("no snapshot yet");
    assert_eq!(
        snap.get("position"),
        Some(&device_worker::AttrValue::Scalar(Scalar::Float(12.5)))
    );
    assert!(snap.get("velocity").is_some());
    // Read during the priming cycle.
    assert!(snap.device_status.is_some());
    assert!(snap.published_at.is_some());

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn device_status_is_read_every_nth_cycle_only() {
    let mut cfg = config();
    cfg.status_every = 4;
    let (mut worker, device, _rx) = started(cfg).await;

    sleep(Duration::from_millis(4250)).await;
    let reads = device.attribute_reads();
    assert!(reads >= 8, "only {reads} polls");
    // Cycles 1, 5, 9, ...
    assert_eq!(device.status_reads(), (reads - 1) / 4 + 1);
    assert!(device.status_reads() < reads);

    worker.stop().await;
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let connector = Arc::new(SimConnector::new(SimDevice::new()));

    let no_attributes = WorkerConfig::new("axis-x", "sim://axis-x");
    let err = Worker::new(no_attributes, connector.clone(), tx.clone()).err();
    assert!(matches!(err, Some(ConfigError::Invalid(_))), "{err:?}");

    let mut spinning = config();
    spinning.poll_interval = Duration::ZERO;
    assert!(Worker::new(spinning, connector, tx).is_err());
}

// ── Shutdown ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stop_exits_cleanly_from_connected_state() {
    let (mut worker, _device, mut rx) = started(config()).await;

    assert_eq!(worker.stop().await, Shutdown::Clean);
    assert!(!worker.is_running());
    assert_eq!(worker.connection_state(), ConnectionState::Stopped);
    until(&mut rx, is_connection(false)).await;

    assert_eq!(
        worker.queue_command("stop", CommandArgs::None),
        Err(WorkerError::ShuttingDown)
    );
}

#[tokio::test(start_paused = true)]
async fn stop_exits_cleanly_while_reconnecting() {
    let device = SimDevice::new();
    device.set_online(false);
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut worker = Worker::new(config(), Arc::new(SimConnector::new(device.clone())), tx).unwrap();
    worker.start();
    sleep(Duration::from_secs(4)).await;

    assert_eq!(worker.stop().await, Shutdown::Clean);
    assert_eq!(worker.connection_state(), ConnectionState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stop_lets_in_flight_command_finish_and_discards_the_rest() {
    let (mut worker, device, mut rx) = started_initialised(config()).await;
    device.set_command_delay("moveRelative", Duration::from_millis(800));

    worker.queue_command("moveRelative", float(1.0)).unwrap();
    wait_invoked(&device, "moveRelative").await;
    worker.queue_command("home", CommandArgs::None).unwrap();

    assert_eq!(worker.stop().await, Shutdown::Clean);
    let events = until(&mut rx, is_connection(false)).await;
    let done = outcomes(&events);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].name, "moveRelative");
    assert!(done[0].success);
    assert!(!device.invocations().iter().any(|n| n == "home"));
}

#[tokio::test(start_paused = true)]
async fn stop_aborts_a_worker_that_misses_the_join_timeout() {
    let mut cfg = config();
    cfg.join_timeout = Duration::from_millis(200);
    let (mut worker, device, mut rx) = started_initialised(cfg).await;
    device.set_command_delay("moveRelative", Duration::from_secs(1));

    worker.queue_command("moveRelative", float(1.0)).unwrap();
    wait_invoked(&device, "moveRelative").await;

    assert_eq!(worker.stop().await, Shutdown::Aborted);
    assert!(!worker.is_running());
    assert_eq!(worker.connection_state(), ConnectionState::Stopped);
    assert!(!worker.is_healthy());

    // The aborted command never reports an outcome.
    let events = until(&mut rx, is_connection(false)).await;
    assert!(outcomes(&events).is_empty(), "{events:?}");
    sleep(Duration::from_secs(2)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(device.position(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn worker_can_be_restarted_after_stop() {
    let (mut worker, _device, mut rx) = started(config()).await;
    worker.stop().await;
    until(&mut rx, is_connection(false)).await;

    worker.start();
    until(&mut rx, is_connection(true)).await;
    assert!(worker.is_running());
    worker.queue_command("stop", CommandArgs::None).unwrap();
    assert!(next_outcome(&mut rx).await.success);
    worker.stop().await;
}
