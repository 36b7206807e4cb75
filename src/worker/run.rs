use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::health::HealthTracker;
use super::queue::Command;
use super::{ConnectionState, Shared, WorkerEvent};
use crate::device::{AttrValue, Connector, DeviceError, DeviceProxy, DeviceState};
use crate::error::WorkerError;

/// Await `fut`, turning an elapsed `limit` into a [`DeviceError::Timeout`].
async fn bounded<T>(
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = Result<T, DeviceError>>,
) -> Result<T, DeviceError> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::timeout(operation, limit)),
    }
}

/// The worker's background loop. Owns the proxy and the health tracker.
pub(super) struct Runner {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
    proxy: Option<Box<dyn DeviceProxy>>,
    health: HealthTracker,
    last_attempt: Option<Instant>,
    connect_failures: u32,
    cycle: u64,
    next_poll: Instant,
}

impl Runner {
    pub(super) fn new(
        shared: Arc<Shared>,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> Self {
        let health = HealthTracker::new(shared.config.failure_threshold);
        Self {
            shared,
            connector,
            cancel,
            proxy: None,
            health,
            last_attempt: None,
            connect_failures: 0,
            cycle: 0,
            next_poll: Instant::now(),
        }
    }

    fn device(&self) -> &str {
        &self.shared.config.device
    }

    /// Main loop: reconnect while disconnected; otherwise drain commands,
    /// poll when due, and idle until the next poll or a new command.
    pub(super) async fn run(mut self) {
        while !self.cancel.is_cancelled() {
            if self.proxy.is_none() {
                if !self.wait_for_reconnect_slot().await {
                    break;
                }
                self.connect().await;
                continue;
            }

            self.drain_commands().await;
            if self.proxy.is_none() || self.cancel.is_cancelled() {
                continue;
            }

            if Instant::now() >= self.next_poll {
                self.poll().await;
                self.next_poll = Instant::now() + self.shared.config.poll_interval;
            }

            if self.proxy.is_some() {
                self.idle().await;
            }
        }

        self.finish();
    }

    /// Reconnect throttle. Doubles per failed attempt up to the configured maximum.
    fn reconnect_delay(&self) -> Duration {
        let config = &self.shared.config;
        let doublings = self.connect_failures.saturating_sub(1).min(16);
        config
            .reconnect_interval
            .saturating_mul(1 << doublings)
            .min(config.max_reconnect_interval)
    }

    /// Returns `false` if a stop was requested while waiting.
    async fn wait_for_reconnect_slot(&mut self) -> bool {
        let Some(last) = self.last_attempt else {
            return true;
        };
        let deadline = last + self.reconnect_delay();

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = sleep_until(deadline) => true,
        }
    }

    async fn connect(&mut self) {
        self.last_attempt = Some(Instant::now());
        self.shared.connection.send_replace(ConnectionState::Connecting);

        let config = &self.shared.config;
        info!("{}: connecting to {}", config.device, config.endpoint);

        let poll_timeout = config.poll_timeout;
        let connector = Arc::clone(&self.connector);
        let endpoint = config.endpoint.clone();
        let attempt = bounded(poll_timeout, "connect", async move {
            let mut proxy = connector.connect(&endpoint).await?;
            proxy.set_timeout(poll_timeout);
            let state = proxy.query_state().await?;
            Ok::<_, DeviceError>((proxy, state))
        });

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            result = attempt => result,
        };

        match result {
            Ok((proxy, state)) => {
                self.connect_failures = 0;
                self.proxy = Some(proxy);
                let change = self.health.on_connected(state);
                self.publish_health(change);
                self.set_connected();
                info!("{}: connected (state {})", self.device(), state);

                self.cycle = 0;
                self.poll().await;
                self.next_poll = Instant::now() + self.shared.config.poll_interval;
            }
            Err(e) => {
                self.connect_failures = self.connect_failures.saturating_add(1);
                self.shared
                    .connection
                    .send_replace(ConnectionState::Disconnected);
                let change = self.health.force_unhealthy(format!("connect failed: {e}"));
                self.publish_health(change);
                warn!(
                    "{}: connection attempt failed: {}. Retrying in {:?}",
                    self.device(),
                    e,
                    self.reconnect_delay()
                );
            }
        }
    }

    fn set_connected(&self) {
        self.shared.gate().connected = true;
        self.shared.connection.send_replace(ConnectionState::Connected);
        self.shared.emit(WorkerEvent::ConnectionChanged {
            device: self.device().to_string(),
            connected: true,
        });
    }

    /// Discard the proxy, force unhealthy, and silently flush the queue.
    fn drop_session(&mut self, reason: &str) {
        if self.proxy.take().is_none() {
            return;
        }

        let change = self.health.force_unhealthy(reason.to_string());
        self.publish_health(change);

        let flushed = {
            let mut gate = self.shared.gate();
            gate.connected = false;
            gate.queue.clear()
        };
        self.shared
            .connection
            .send_replace(ConnectionState::Disconnected);
        self.shared.emit(WorkerEvent::ConnectionChanged {
            device: self.device().to_string(),
            connected: false,
        });
        warn!(
            "{}: session dropped: {} ({} queued command(s) discarded)",
            self.device(),
            reason,
            flushed
        );
    }

    /// Mirror the tracker into the gate and, on a transition, notify.
    fn publish_health(&self, change: Option<bool>) {
        let healthy = self.health.is_healthy();
        {
            let mut gate = self.shared.gate();
            gate.healthy = healthy;
            gate.health_reason = self.health.describe();
        }

        if let Some(healthy) = change {
            self.shared.health.send_replace(healthy);
            self.shared.emit(WorkerEvent::HealthChanged {
                device: self.device().to_string(),
                healthy,
            });
            if healthy {
                info!("{}: health restored", self.device());
            } else {
                warn!("{}: unhealthy: {}", self.device(), self.health.describe());
            }
        }
    }

    /// Run every queued command, in order, before polling.
    async fn drain_commands(&mut self) {
        loop {
            if self.cancel.is_cancelled() || self.proxy.is_none() {
                return;
            }
            let next = self.shared.gate().queue.pop();
            let Some(command) = next else {
                return;
            };

            let name = command.name.clone();
            let result = self.execute(command).await;

            let fatal = match &result {
                Err(e) if e.ends_session() => Some(e.to_string()),
                _ => None,
            };
            if let Err(e) = &result {
                warn!("{}: {} failed: {}", self.device(), name, e);
            }
            self.shared.emit_outcome(
                &name,
                result.map(|reply| match reply {
                    Some(value) => format!("{name} ok: {value}"),
                    None => format!("{name} ok"),
                }),
            );

            if let Some(reason) = fatal {
                self.drop_session(&format!("{name} failed: {reason}"));
                return;
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Result<Option<AttrValue>, WorkerError> {
        if self.cancel.is_cancelled() {
            return Err(WorkerError::ShuttingDown);
        }
        let config = &self.shared.config;
        let Some(proxy) = self.proxy.as_mut() else {
            return Err(WorkerError::NotConnected);
        };

        // Authoritative gate; the enqueue-time check is only advisory.
        if !self.health.is_healthy() && !config.is_critical(&command.name) {
            return Err(WorkerError::Unhealthy(self.health.describe()));
        }

        debug!(
            "{}: executing {} (queued {}ms ago)",
            config.device,
            command.name,
            (chrono::Utc::now() - command.enqueued_at).num_milliseconds()
        );

        // One budget for the whole command, ready check and init included.
        proxy.set_timeout(config.command_timeout);
        let result = bounded(
            config.command_timeout,
            &command.name,
            invoke(&mut **proxy, &command, config),
        )
        .await;
        proxy.set_timeout(config.poll_timeout);

        result.map_err(WorkerError::from)
    }

    /// One poll cycle: batched read, health bookkeeping, and every
    /// `status_every` cycles the auxiliary state/status read.
    async fn poll(&mut self) {
        let config = &self.shared.config;
        let Some(proxy) = self.proxy.as_mut() else {
            return;
        };
        self.cycle += 1;

        let read = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            r = bounded(
                config.poll_timeout,
                "read_attributes",
                proxy.read_attributes(&config.attributes),
            ) => r,
        };

        let (successes, failure) = match read {
            Ok(readings) => {
                let total = readings.len();
                let successes = self.shared.cache.merge_readings(readings);
                if successes < total {
                    debug!(
                        "{}: poll read {}/{} attributes",
                        config.device, successes, total
                    );
                }
                (successes, None)
            }
            Err(e) => {
                debug!("{}: poll failed: {}", config.device, e);
                (0, Some(e))
            }
        };

        let status_due = config.status_every > 0
            && (self.cycle - 1) % u64::from(config.status_every) == 0;
        if successes > 0 && status_due {
            read_device_status(&mut **proxy, &self.shared, &self.cancel).await;
        }

        let change = self.health.record_poll(successes);
        self.publish_health(change);

        if let Some(e) = failure {
            if e.is_connection_fatal() && !self.health.is_healthy() {
                self.drop_session(&format!("poll failed: {e}"));
            }
        }
    }

    /// Sleep until the next poll is due, waking early for queued commands
    /// or a stop request.
    async fn idle(&mut self) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.shared.wake.notified() => {}
            _ = sleep_until(self.next_poll) => {}
        }
    }

    fn finish(&mut self) {
        self.proxy = None;
        let (was_connected, discarded) = {
            let mut gate = self.shared.gate();
            let was_connected = gate.connected;
            gate.connected = false;
            gate.healthy = false;
            gate.stopping = true;
            (was_connected, gate.queue.clear())
        };
        self.shared.connection.send_replace(ConnectionState::Stopped);
        self.shared.health.send_replace(false);
        if was_connected {
            self.shared.emit(WorkerEvent::ConnectionChanged {
                device: self.device().to_string(),
                connected: false,
            });
        }
        if discarded > 0 {
            debug!("{}: {} queued command(s) dropped at stop", self.device(), discarded);
        }
        info!("{}: worker stopped", self.device());
    }
}

/// Ready-state check with one best-effort init attempt, then the command.
/// The caller bounds the whole sequence.
async fn invoke(
    proxy: &mut dyn DeviceProxy,
    command: &Command,
    config: &super::WorkerConfig,
) -> Result<Option<AttrValue>, DeviceError> {
    if config.needs_ready_state(&command.name) {
        let state = proxy.query_state().await?;
        if !state.is_ready() {
            info!(
                "{}: {} needs a ready device (state {}), trying {}",
                config.device, command.name, state, config.init_command
            );
            proxy
                .invoke_command(&config.init_command, &Default::default())
                .await?;
            let state = proxy.query_state().await?;
            if !state.is_ready() {
                return Err(DeviceError::Rejected(format!(
                    "device not ready for {} (state {})",
                    command.name, state
                )));
            }
        }
    }

    proxy.invoke_command(&command.name, &command.args).await
}

/// Low-frequency auxiliary read. Failures are logged only; the regular
/// poll decides health.
async fn read_device_status(
    proxy: &mut dyn DeviceProxy,
    shared: &Shared,
    cancel: &CancellationToken,
) {
    let limit = shared.config.poll_timeout;
    let read = async {
        let state = bounded(limit, "query_state", proxy.query_state()).await;
        let status = bounded(limit, "query_status", proxy.query_status()).await;
        (state, status)
    };

    let (state, status) = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        r = read => r,
    };

    let state: Option<DeviceState> = match state {
        Ok(s) => Some(s),
        Err(e) => {
            debug!("{}: state read failed: {}", shared.config.device, e);
            None
        }
    };
    let status = match status {
        Ok(s) => Some(s),
        Err(e) => {
            debug!("{}: status read failed: {}", shared.config.device, e);
            None
        }
    };
    if state == Some(DeviceState::Fault) || state == Some(DeviceState::Alarm) {
        error!(
            "{}: device reports {}{}",
            shared.config.device,
            state.map(|s| s.to_string()).unwrap_or_default(),
            status.as_deref().map(|s| format!(" ({s})")).unwrap_or_default()
        );
    }
    shared.cache.merge_device_status(state, status);
}
