//! Host-driven controller for one plug device.
//!
//! All state lives in a single task: socket events, heartbeat ticks and host
//! commands are multiplexed with `tokio::select!`, so nothing is shared and
//! nothing is locked.

use crate::config::PlugConfig;
use crate::device::{DeviceSession, LinkState, Received, SessionEvent};
use crate::error::{Result, TuyaError};
use crate::plugs::{DeviceModel, PlugSet};
use crate::reconcile::{Command, Reconciler, RequestKind, RequestState, Step};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

const COMMAND_QUEUE: usize = 32;

/// Messages from the host to a running controller.
enum HostCommand {
    Command {
        unit: u32,
        command: String,
        level: u8,
        resp_tx: oneshot::Sender<Result<()>>,
    },
    Heartbeat,
}

pub struct PlugController<M> {
    config: PlugConfig,
    session: DeviceSession,
    requests: Reconciler,
    plugs: PlugSet,
    model: M,
    /// Heartbeats left until the next command cycle.
    run_again: u32,
}

impl<M: DeviceModel> PlugController<M> {
    pub fn new(config: PlugConfig, model: M) -> Result<Self> {
        config.validate()?;
        if !config.has_key() {
            return Err(TuyaError::InvalidConfig(
                "controlling a device needs its local key".into(),
            ));
        }
        let session = DeviceSession::new(&config)?;
        let plugs = PlugSet::from_config(&config);
        for (id, unit) in plugs.units() {
            debug!("Unit {} -> {:?}", id, unit);
        }
        Ok(Self {
            requests: Reconciler::new(config.strict_correlation, config.max_reissues),
            session,
            plugs,
            model,
            run_again: 1,
            config,
        })
    }

    pub fn plugs(&self) -> &PlugSet {
        &self.plugs
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn link_state(&self) -> LinkState {
        self.session.state()
    }

    pub fn request_state(&self) -> RequestState {
        self.requests.state()
    }

    /// Connects; the first command cycle runs once the link is up.
    pub fn on_start(&mut self) {
        info!("Starting plug controller for {}", self.session.id());
        self.run_again = 1;
        self.session.connect();
    }

    pub async fn on_connect(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {
                info!("Device {} connected", self.session.id());
                self.execute().await;
            }
            Err(e) if e.suppresses_reconnect() => {
                warn!(
                    "Device {} not reachable ({}), retrying on heartbeat",
                    self.session.id(),
                    e
                );
            }
            Err(e) => {
                warn!("Connect to {} failed ({}), reconnecting", self.session.id(), e);
                self.session.disconnect();
                self.session.connect();
            }
        }
    }

    pub async fn on_message(&mut self, received: Received) {
        match self.requests.on_received(received) {
            Step::Request(kind) => self.send(kind).await,
            Step::Reconcile(dps) | Step::Observe(dps) => {
                if self.plugs.reconcile(&dps, &mut self.model) {
                    self.run_again = 1;
                }
            }
            Step::Ignore => {}
        }
    }

    /// Validates a host command, records it on the addressed plugs and runs
    /// a command cycle. Rejected commands send nothing.
    pub async fn on_command(&mut self, unit: u32, command: &str, level: u8) -> Result<()> {
        let parsed = Command::parse(command, level)
            .and_then(|cmd| self.plugs.apply(unit, cmd).map(|()| cmd));
        match parsed {
            Ok(cmd) => {
                info!("Unit {} -> {}", unit, cmd);
                self.execute().await;
                Ok(())
            }
            Err(e) => {
                error!("Rejected command '{}' level {} for unit {}: {}", command, level, unit, e);
                Err(e)
            }
        }
    }

    pub async fn on_heartbeat(&mut self) {
        self.run_again = self.run_again.saturating_sub(1);
        if self.run_again == 0 {
            self.execute().await;
        }
    }

    pub fn on_disconnect(&mut self, error: Option<TuyaError>) {
        match error {
            Some(e) => warn!("Device {} disconnected: {}", self.session.id(), e),
            None => info!("Device {} closed the connection", self.session.id()),
        }
        self.requests.reset();
    }

    pub fn on_stop(&mut self) {
        info!("Stopping plug controller for {}", self.session.id());
        self.session.disconnect();
        self.requests.reset();
    }

    /// Command cycle: re-assert pending commands or poll, or get connected.
    async fn execute(&mut self) {
        self.run_again = self.config.poll_every;
        self.requests.start_cycle();
        if self.session.is_connected() {
            let kind = if self.plugs.has_pending() {
                RequestKind::Set
            } else {
                RequestKind::Status
            };
            self.send(kind).await;
        } else if !self.session.is_connecting() {
            self.session.connect();
        }
    }

    async fn send(&mut self, kind: RequestKind) {
        let sent = if kind == RequestKind::Set && self.plugs.has_pending() {
            let payload = self.plugs.merged_payload();
            self.session
                .send_set(&payload)
                .await
                .map(|seqno| (RequestKind::Set, seqno))
        } else {
            self.session
                .send_status()
                .await
                .map(|seqno| (RequestKind::Status, seqno))
        };
        match sent {
            Ok((kind, seqno)) => self.requests.issued(kind, seqno),
            Err(e) => {
                warn!("Could not send {:?} to {}: {}", kind, self.session.id(), e);
                self.requests.reset();
            }
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => self.on_connect(Ok(())).await,
            SessionEvent::ConnectFailed(e) => self.on_connect(Err(e)).await,
            SessionEvent::Received(units) => {
                for unit in units {
                    self.on_message(unit).await;
                }
            }
            SessionEvent::Disconnected(e) => self.on_disconnect(e),
        }
    }

    async fn on_host_command(&mut self, cmd: HostCommand) {
        match cmd {
            HostCommand::Command {
                unit,
                command,
                level,
                resp_tx,
            } => {
                let result = self.on_command(unit, &command, level).await;
                let _ = resp_tx.send(result);
            }
            HostCommand::Heartbeat => self.on_heartbeat().await,
        }
    }

    /// Runs until `cancel` fires or every handle is dropped, then hands the
    /// model back.
    async fn run(mut self, mut rx: mpsc::Receiver<HostCommand>, cancel: CancellationToken) -> M {
        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.on_start();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.session.next_event() => self.on_session_event(event).await,
                _ = heartbeat.tick() => self.on_heartbeat().await,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.on_host_command(cmd).await,
                    None => break,
                },
            }
        }
        self.on_stop();
        self.model
    }
}

impl<M: DeviceModel + Send + 'static> PlugController<M> {
    /// Runs the controller on its own tokio task.
    pub fn spawn(self) -> ControllerHandle<M> {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(rx, cancel.clone()));
        ControllerHandle { tx, cancel, task }
    }
}

/// Host side of a spawned [`PlugController`].
pub struct ControllerHandle<M> {
    tx: mpsc::Sender<HostCommand>,
    cancel: CancellationToken,
    task: JoinHandle<M>,
}

impl<M> ControllerHandle<M> {
    /// Sends a host command (`On`, `Off`, `Set Level`) to a unit and waits
    /// until it has been validated and queued to the device.
    pub async fn command(&self, unit: u32, command: &str, level: u8) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(HostCommand::Command {
                unit,
                command: command.to_string(),
                level,
                resp_tx,
            })
            .await
            .map_err(|_| TuyaError::Offline)?;
        resp_rx.await.map_err(|_| TuyaError::Offline)?
    }

    /// Delivers one extra heartbeat tick.
    pub async fn heartbeat(&self) -> Result<()> {
        self.tx
            .send(HostCommand::Heartbeat)
            .await
            .map_err(|_| TuyaError::Offline)
    }

    /// Stops the controller and returns its model.
    pub async fn stop(self) -> Option<M> {
        self.cancel.cancel();
        self.task.await.ok()
    }
}
