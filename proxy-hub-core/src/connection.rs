use crate::transport::{BrokerSocket, BrokerTransport};
use proxy_hub_common::config::CloudConfig;
use proxy_hub_error::{HubError, HubResult};
use proxy_hub_sdk::{
    ActionEntry, CidGenerator, Inbound, InboundEnvelope, OutboundFrame, RegisterFrame, WireError,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Failed-queue bound; oldest entries are dropped beyond this.
const MAX_FAILED: usize = 200;
/// Backoff attempt counter cap (delay tops out at 1024s).
const MAX_ATTEMPTS: u32 = 10;

/// Commands the hub sends to the connection actor.
#[derive(Debug)]
enum ConnectionCommand {
    Send(OutboundFrame),
    Register { sdid: String, token: String },
    Unregister { sdid: String },
    Close,
}

/// Events the connection actor reports back to the hub.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Socket established; linked devices should re-register.
    Opened,
    /// Socket lost (reconnect is scheduled internally).
    Closed,
    /// The broker rejected this cloud device id with 401; its bindings are
    /// no longer valid.
    UnlinkCloudDevice(String),
    /// Inbound actions addressed to a cloud device id.
    Action {
        ddid: String,
        actions: Vec<ActionEntry>,
    },
}

/// Cheap cloneable handle to the connection actor.
///
/// Commands go over an unbounded channel: enqueueing never blocks, so callers
/// may submit while holding their own locks without coupling to the actor's
/// progress.
#[derive(Clone)]
pub struct CloudConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<ConnectionCommand>,
}

impl CloudConnectionHandle {
    /// Spawn the actor. It dials immediately and keeps reconnecting until
    /// cancelled or told to close.
    pub fn spawn(
        transport: Arc<dyn BrokerTransport>,
        config: &CloudConfig,
        events: mpsc::Sender<ConnectionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = ConnectionActor {
            transport,
            url: config.web_socket_url.clone(),
            stalled_period: Duration::from_millis(config.stalled_connection_period_ms),
            retry_on_transmission_error: config.retry_on_transmission_error,
            events,
            cids: CidGenerator::new(),
            sent: HashMap::new(),
            failed: VecDeque::new(),
            attempt: 0,
            registered: HashSet::new(),
            socket: None,
            retry_deadline: None,
            idle_deadline: None,
            reconnect_deadline: None,
        };
        tokio::spawn(actor.run(cmd_rx, cancel));
        Self { cmd_tx }
    }

    pub fn send(&self, frame: OutboundFrame) -> HubResult<()> {
        self.cmd_tx
            .send(ConnectionCommand::Send(frame))
            .map_err(|_| HubError::ConnectionClosed)
    }

    pub fn register(&self, sdid: String, token: String) -> HubResult<()> {
        self.cmd_tx
            .send(ConnectionCommand::Register { sdid, token })
            .map_err(|_| HubError::ConnectionClosed)
    }

    pub fn unregister(&self, sdid: String) -> HubResult<()> {
        self.cmd_tx
            .send(ConnectionCommand::Unregister { sdid })
            .map_err(|_| HubError::ConnectionClosed)
    }

    pub fn close(&self) -> HubResult<()> {
        self.cmd_tx
            .send(ConnectionCommand::Close)
            .map_err(|_| HubError::ConnectionClosed)
    }
}

/// A frame awaiting its ack. `is_retry` decides which end of the failed
/// queue it re-enters on requeue.
#[derive(Debug)]
struct SentEntry {
    frame: OutboundFrame,
    is_retry: bool,
}

struct ConnectionActor {
    transport: Arc<dyn BrokerTransport>,
    url: String,
    stalled_period: Duration,
    retry_on_transmission_error: bool,
    events: mpsc::Sender<ConnectionEvent>,
    cids: CidGenerator,
    /// In-flight frames keyed by cid.
    sent: HashMap<String, SentEntry>,
    /// Frames awaiting a retry slot, oldest first.
    failed: VecDeque<OutboundFrame>,
    attempt: u32,
    /// Cloud device ids registered on the current socket.
    registered: HashSet<String>,
    socket: Option<Box<dyn BrokerSocket>>,
    retry_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        cancel: CancellationToken,
    ) {
        self.open().await;
        loop {
            let next_deadline = self.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(ConnectionCommand::Close) | None => {
                        self.shutdown().await;
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                frame = Self::next_frame(&mut self.socket), if self.socket.is_some() => {
                    match frame {
                        Some(Ok(text)) => self.on_inbound(text).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "broker socket error");
                            self.on_socket_lost().await;
                        }
                        None => {
                            info!("broker closed the socket");
                            self.on_socket_lost().await;
                        }
                    }
                }
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                    if next_deadline.is_some() =>
                {
                    self.on_deadline().await;
                }
            }
        }
    }

    async fn next_frame(socket: &mut Option<Box<dyn BrokerSocket>>) -> Option<HubResult<String>> {
        match socket.as_mut() {
            Some(s) => s.next().await,
            None => std::future::pending().await,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.retry_deadline, self.idle_deadline, self.reconnect_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    async fn handle_command(&mut self, cmd: ConnectionCommand) {
        match cmd {
            ConnectionCommand::Send(frame) => {
                // Registration is implicit: an unregistered sdid gets a
                // register frame ahead of its telemetry.
                if let OutboundFrame::Telemetry(t) = &frame {
                    if !self.registered.contains(&t.sdid) {
                        let register =
                            OutboundFrame::Register(RegisterFrame::new(t.sdid.clone(), &t.token));
                        self.transmit(register, false).await;
                    }
                }
                self.transmit(frame, false).await;
            }
            ConnectionCommand::Register { sdid, token } => {
                if !self.registered.contains(&sdid) {
                    let frame = OutboundFrame::Register(RegisterFrame::new(sdid, &token));
                    self.transmit(frame, false).await;
                }
            }
            ConnectionCommand::Unregister { sdid } => {
                self.registered.remove(&sdid);
            }
            // Close is intercepted by the run loop.
            ConnectionCommand::Close => {}
        }
    }

    /// Dial the broker. On failure the reconnect timer covers the next try.
    async fn open(&mut self) {
        self.reconnect_deadline = None;
        self.registered.clear();
        self.fold_in_flight();
        match self.transport.connect(&self.url).await {
            Ok(socket) => {
                info!(url = %self.url, "broker connection open");
                self.socket = Some(socket);
                self.attempt = 0;
                self.idle_deadline = Some(Instant::now() + self.stalled_period);
                let _ = self.events.send(ConnectionEvent::Opened).await;
                if let Some(frame) = self.failed.pop_front() {
                    self.transmit(frame, true).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "broker connect failed, retrying later");
                self.reconnect_deadline = Some(Instant::now() + self.stalled_period);
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
        info!("broker connection closed");
    }

    async fn on_socket_lost(&mut self) {
        self.socket = None;
        self.idle_deadline = None;
        self.fold_in_flight();
        let _ = self.events.send(ConnectionEvent::Closed).await;
        self.reconnect_deadline = Some(Instant::now() + self.stalled_period);
    }

    /// Frames still awaiting an ack when the socket dies go back to the
    /// failed queue so the next connection replays them.
    fn fold_in_flight(&mut self) {
        if self.sent.is_empty() {
            return;
        }
        debug!(count = self.sent.len(), "requeuing unacked frames");
        let entries: Vec<SentEntry> = self.sent.drain().map(|(_, e)| e).collect();
        for entry in entries {
            self.add_to_failed(entry.frame, entry.is_retry);
        }
    }

    /// Send a frame, then cascade: every successful send drains one more
    /// entry from the failed queue.
    async fn transmit(&mut self, frame: OutboundFrame, is_retry: bool) {
        let mut pending = Some((frame, is_retry));
        while let Some((frame, is_retry)) = pending.take() {
            if !self.send_one(frame, is_retry).await {
                break;
            }
            pending = self.failed.pop_front().map(|f| (f, true));
        }
    }

    async fn send_one(&mut self, mut frame: OutboundFrame, is_retry: bool) -> bool {
        if self.socket.is_none() {
            self.add_to_failed(frame, is_retry);
            self.schedule_retry();
            return false;
        }
        let cid = match frame.cid() {
            Some(c) => c.to_string(),
            None => {
                let c = self.cids.next();
                frame.set_cid(c.clone());
                c
            }
        };
        let text = match serde_json::to_string(&frame) {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "dropping unserializable frame");
                return false;
            }
        };
        let sdid = frame.sdid().to_string();
        let is_register = frame.is_register();

        // socket presence checked above
        let result = match self.socket.as_mut() {
            Some(socket) => socket.send(text).await,
            None => Err(HubError::ConnectionClosed),
        };
        match result {
            Ok(()) => {
                trace!(cid = %cid, sdid = %sdid, "frame sent");
                self.sent.insert(cid, SentEntry { frame, is_retry });
                if is_register {
                    self.registered.insert(sdid);
                }
                self.attempt = 0;
                true
            }
            Err(e) => {
                warn!(error = %e, sdid = %sdid, "frame transmission failed");
                self.add_to_failed(frame, is_retry);
                self.schedule_retry();
                false
            }
        }
    }

    /// Register frames are regenerated on demand and never requeued. Retried
    /// frames rejoin at the front so device ordering survives a retry.
    fn add_to_failed(&mut self, frame: OutboundFrame, is_retry: bool) {
        if frame.is_register() {
            return;
        }
        if !self.retry_on_transmission_error {
            debug!(sdid = %frame.sdid(), "retry disabled, dropping frame");
            return;
        }
        if is_retry {
            self.failed.push_front(frame);
        } else {
            self.failed.push_back(frame);
        }
        while self.failed.len() > MAX_FAILED {
            self.failed.pop_front();
            warn!("failed queue full, dropped oldest frame");
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry_deadline.is_none() && !self.failed.is_empty() {
            let delay = retry_delay(self.attempt);
            debug!(attempt = self.attempt, delay_secs = delay.as_secs(), "retry scheduled");
            self.retry_deadline = Some(Instant::now() + delay);
        }
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();
        if self.retry_deadline.is_some_and(|d| d <= now) {
            self.retry_deadline = None;
            self.attempt = (self.attempt + 1).min(MAX_ATTEMPTS);
            if let Some(frame) = self.failed.pop_front() {
                self.transmit(frame, true).await;
            }
        }
        if self.idle_deadline.is_some_and(|d| d <= now) {
            self.idle_deadline = None;
            warn!("no broker traffic within the stall window, reconnecting");
            if let Some(mut socket) = self.socket.take() {
                socket.close().await;
            }
            self.fold_in_flight();
            let _ = self.events.send(ConnectionEvent::Closed).await;
            self.open().await;
        }
        if self.reconnect_deadline.is_some_and(|d| d <= now) {
            self.reconnect_deadline = None;
            self.open().await;
        }
    }

    async fn on_inbound(&mut self, text: String) {
        // any inbound traffic proves the socket is alive
        self.idle_deadline = Some(Instant::now() + self.stalled_period);

        let envelope: InboundEnvelope = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "unparseable broker frame");
                return;
            }
        };
        match envelope.classify() {
            Inbound::Ping => {}
            Inbound::Ack { cid, success } => self.on_ack(cid, success),
            Inbound::Error(err) => self.on_error(err).await,
            Inbound::Action { ddid, actions } => {
                let _ = self
                    .events
                    .send(ConnectionEvent::Action { ddid, actions })
                    .await;
            }
            Inbound::Other => debug!(frame = %text, "ignoring unrecognized broker frame"),
        }
    }

    fn on_ack(&mut self, cid: String, success: bool) {
        match self.sent.remove(&cid) {
            Some(_) if success => trace!(cid = %cid, "frame acknowledged"),
            Some(entry) => {
                warn!(cid = %cid, "ack without mid or 200 code, retrying frame");
                self.add_to_failed(entry.frame, entry.is_retry);
                self.schedule_retry();
            }
            None => warn!(cid = %cid, "ack for unknown cid"),
        }
    }

    async fn on_error(&mut self, err: WireError) {
        let entry = err.cid.as_ref().and_then(|c| self.sent.remove(c));
        match err.code {
            401 => {
                if let Some(entry) = entry {
                    let sdid = entry.frame.sdid().to_string();
                    warn!(sdid = %sdid, "broker rejected device credentials");
                    self.registered.remove(&sdid);
                    let _ = self
                        .events
                        .send(ConnectionEvent::UnlinkCloudDevice(sdid))
                        .await;
                }
            }
            409 => debug!(cid = ?err.cid, "duplicate frame reported by broker"),
            429 => {
                // rate-limited frames are dropped, retrying would make it worse
                error!(cid = ?err.cid, "broker rate limit hit, frame dropped");
            }
            code => {
                if let Some(entry) = entry {
                    warn!(code, message = ?err.message, "broker error, retrying frame");
                    self.add_to_failed(entry.frame, entry.is_retry);
                    self.schedule_retry();
                } else {
                    warn!(code, message = ?err.message, "broker error without matching frame");
                }
            }
        }
    }
}

/// Retry backoff: 1, 2, 4, ... seconds, capped at 1024s after ten attempts.
fn retry_delay(attempt: u32) -> Duration {
    let attempt = attempt.min(MAX_ATTEMPTS);
    Duration::from_secs(((1u64 << (attempt + 1)) - 1) / 2 + 1)
}
