//! Resilient background worker for one remote-controlled device.
//!
//! A [`Worker`] owns the connection to a single device. Its background task
//! reconnects with a throttle, drains the command queue ahead of polling,
//! polls the configured attributes into a [`StatusCache`], and tracks a
//! health signal that gates non-critical commands. Callers only ever touch
//! the non-blocking surface: [`Worker::queue_command`],
//! [`Worker::cached_status`] and the [`WorkerEvent`] stream.

mod cache;
mod config;
mod health;
mod queue;
mod run;

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{CommandArgs, Connector};
use crate::error::{ConfigError, WorkerError};

pub use cache::{Attribute, StatusCache, StatusSnapshot};
pub use config::{FRAMEWORK_MIN_RECONNECT, WorkerConfig};
pub use health::HealthTracker;
pub use queue::{Command, CommandQueue};

/// Connection state of a worker's device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// Result of one command, emitted exactly once per command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub device: String,
    pub name: String,
    pub success: bool,
    pub message: String,
}

/// Notifications delivered to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    CommandOutcome(CommandOutcome),
    ConnectionChanged { device: String, connected: bool },
    HealthChanged { device: String, healthy: bool },
}

/// How [`Worker::stop`] ended the background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The task observed the stop request and exited in time.
    Clean,
    /// The join timeout elapsed and the task was aborted.
    Aborted,
}

/// Queue plus the flags that decide whether a command may enter it.
/// Kept under one lock so a session drop and an enqueue cannot interleave.
#[derive(Debug)]
struct Gate {
    queue: CommandQueue,
    connected: bool,
    healthy: bool,
    health_reason: String,
    stopping: bool,
}

/// State crossing the boundary between callers and the worker task.
struct Shared {
    config: WorkerConfig,
    gate: Mutex<Gate>,
    wake: Notify,
    cache: StatusCache,
    connection: watch::Sender<ConnectionState>,
    health: watch::Sender<bool>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Shared {
    fn gate(&self) -> MutexGuard<'_, Gate> {
        // The gate holds plain data; a panic elsewhere cannot leave it inconsistent.
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn device(&self) -> &str {
        &self.config.device
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            debug!("{}: event receiver dropped", self.device());
        }
    }

    fn emit_outcome(&self, name: &str, result: Result<String, WorkerError>) {
        let (success, message) = match result {
            Ok(message) => (true, message),
            Err(e) => (false, e.to_string()),
        };
        self.emit(WorkerEvent::CommandOutcome(CommandOutcome {
            device: self.config.device.clone(),
            name: name.to_string(),
            success,
            message,
        }));
    }
}

/// Background worker for a single device.
pub struct Worker {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create a stopped worker. Events for this device are sent on `events`.
    ///
    /// Fails if `config` does not pass [`WorkerConfig::validate`].
    pub fn new(
        config: WorkerConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        let (health, _) = watch::channel(false);
        let gate = Gate {
            queue: CommandQueue::new(config.max_queue_size),
            connected: false,
            healthy: false,
            health_reason: "not connected yet".to_string(),
            stopping: false,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                gate: Mutex::new(gate),
                wake: Notify::new(),
                cache: StatusCache::new(),
                connection,
                health,
                events,
            }),
            connector,
            cancel: CancellationToken::new(),
            handle: None,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    pub fn device(&self) -> &str {
        self.shared.device()
    }

    /// Spawn the background task. Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!("{}: worker already running", self.device());
            return;
        }

        self.cancel = CancellationToken::new();
        self.shared.gate().stopping = false;

        let runner = run::Runner::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.connector),
            self.cancel.clone(),
        );
        self.handle = Some(tokio::spawn(runner.run()));
        info!(
            "{}: worker started ({} attributes, endpoint {})",
            self.device(),
            self.shared.config.attributes.len(),
            self.shared.config.endpoint
        );
    }

    /// Request shutdown and wait up to the join timeout for the task to exit,
    /// aborting it otherwise. Queued commands are discarded; a command already
    /// executing finishes or times out.
    pub async fn stop(&mut self) -> Shutdown {
        self.cancel.cancel();
        let discarded = {
            let mut gate = self.shared.gate();
            gate.stopping = true;
            gate.queue.clear()
        };
        if discarded > 0 {
            debug!(
                "{}: discarded {} queued command(s) on stop",
                self.device(),
                discarded
            );
        }
        self.shared.wake.notify_one();

        let Some(mut handle) = self.handle.take() else {
            return Shutdown::Clean;
        };

        let join_timeout = self.shared.config.join_timeout;
        match tokio::time::timeout(join_timeout, &mut handle).await {
            Ok(_) => Shutdown::Clean,
            Err(_) => {
                warn!(
                    "{}: worker did not stop within {:?}, aborting",
                    self.device(),
                    join_timeout
                );
                handle.abort();
                let was_connected = {
                    let mut gate = self.shared.gate();
                    let was_connected = gate.connected;
                    gate.connected = false;
                    gate.healthy = false;
                    was_connected
                };
                self.shared.connection.send_replace(ConnectionState::Stopped);
                self.shared.health.send_replace(false);
                if was_connected {
                    self.shared.emit(WorkerEvent::ConnectionChanged {
                        device: self.device().to_string(),
                        connected: false,
                    });
                }
                Shutdown::Aborted
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Queue a command for execution. Never blocks on device I/O.
    ///
    /// Rejections (not connected, unhealthy, queue busy, stopping) are
    /// returned immediately and also emitted as a failed outcome; accepted
    /// commands report their outcome later through the event stream.
    pub fn queue_command(
        &self,
        name: impl Into<String>,
        args: CommandArgs,
    ) -> Result<(), WorkerError> {
        let name = name.into();
        let config = &self.shared.config;

        let admitted = {
            let mut gate = self.shared.gate();
            if gate.stopping {
                Err(WorkerError::ShuttingDown)
            } else if !gate.connected {
                Err(WorkerError::NotConnected)
            } else if !gate.healthy && !config.is_critical(&name) {
                Err(WorkerError::Unhealthy(gate.health_reason.clone()))
            } else {
                let capacity = gate.queue.capacity();
                gate.queue
                    .push(Command::new(name.clone(), args))
                    .map_err(|_| WorkerError::QueueFull { capacity })
            }
        };

        match admitted {
            Ok(()) => {
                debug!("{}: queued {}", self.device(), name);
                self.shared.wake.notify_one();
                Ok(())
            }
            Err(e) => {
                warn!("{}: {} rejected: {}", self.device(), name, e);
                self.shared.emit_outcome(&name, Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Latest published status, or `None` before the first successful poll.
    pub fn cached_status(&self) -> Option<Arc<StatusSnapshot>> {
        self.shared.cache.snapshot()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Option<Arc<StatusSnapshot>>> {
        self.shared.cache.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.connection.borrow()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection.subscribe()
    }

    pub fn is_healthy(&self) -> bool {
        *self.shared.health.borrow()
    }

    pub fn queued_len(&self) -> usize {
        self.shared.gate().queue.len()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
