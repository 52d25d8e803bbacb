//! Session registry and channel fan-out.
//!
//! All registry and membership state lives in [`HubState`], owned by a single
//! task that drains a bounded mailbox of [`HubCommand`]s. Every mutation and
//! every membership read made by a broadcast happen on that task, in mailbox
//! order, so no lock guards the maps. Callers talk to it via [`HubHandle`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use opus_settings::{ChatPolicy, ServerSettings};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frame::Frame;
use super::session::{Session, SessionId};
use crate::errors::{EnqueueError, GatewayError};
use crate::metrics::names;

/// Hub tuning knobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HubConfig {
    /// Mailbox depth.
    pub mailbox_capacity: usize,
    /// Whether `chat` senders must belong to the target channel.
    pub chat_policy: ChatPolicy,
    /// Drop a channel once its last member leaves.
    pub prune_empty_channels: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
            chat_policy: ChatPolicy::Open,
            prune_empty_channels: false,
        }
    }
}

impl From<&ServerSettings> for HubConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            mailbox_capacity: settings.hub_mailbox_capacity,
            chat_policy: settings.chat_policy,
            prune_empty_channels: settings.prune_empty_channels,
        }
    }
}

/// Outcome of one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions targeted.
    pub recipients: usize,
    /// Frames enqueued.
    pub delivered: usize,
    /// Frames dropped on a full queue.
    pub dropped: usize,
    /// Refused by the chat policy; nothing was sent.
    pub rejected: bool,
}

/// Point-in-time registry summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Registered sessions.
    pub sessions: usize,
    /// Known channels, including empty ones unless pruning is on.
    pub channels: usize,
    /// Frames dropped across all sessions since startup.
    pub dropped: u64,
}

struct Member {
    session: Arc<Session>,
    channels: HashSet<String>,
}

/// Registry and membership maps. Owned by the hub task.
pub struct HubState {
    config: HubConfig,
    sessions: HashMap<SessionId, Member>,
    channels: HashMap<String, HashSet<SessionId>>,
    dropped: u64,
}

impl HubState {
    /// Empty state.
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            channels: HashMap::new(),
            dropped: 0,
        }
    }

    /// Add a session to the registry.
    ///
    /// # Panics
    ///
    /// Ids are generated per connection; a duplicate is a bug, not a runtime
    /// condition.
    pub fn register(&mut self, session: Arc<Session>) {
        let id = session.id().clone();
        assert!(!self.contains(&id), "session {id} registered twice");
        let _ = self.sessions.insert(
            id.clone(),
            Member {
                session,
                channels: HashSet::new(),
            },
        );
        self.record_active();
        metrics::counter!(names::WS_CONNECTIONS_TOTAL).increment(1);
        debug!(session_id = %id, sessions = self.sessions.len(), "session registered");
    }

    /// Remove a session, close its queue and leave every channel. Unknown ids
    /// are ignored.
    pub fn unregister(&mut self, id: &SessionId) {
        let Some(member) = self.sessions.remove(id) else {
            return;
        };
        member.session.outbound().close();
        for channel in &member.channels {
            let now_empty = match self.channels.get_mut(channel) {
                Some(set) => {
                    let _ = set.remove(id);
                    set.is_empty()
                }
                None => false,
            };
            if now_empty && self.config.prune_empty_channels {
                let _ = self.channels.remove(channel);
            }
        }
        self.record_active();
        metrics::counter!(names::WS_DISCONNECTIONS_TOTAL).increment(1);
        debug!(
            session_id = %id,
            left = member.channels.len(),
            sessions = self.sessions.len(),
            "session unregistered"
        );
    }

    /// Subscribe a registered session to `channel`, creating it if needed.
    pub fn join(&mut self, id: &SessionId, channel: &str) {
        if channel.is_empty() {
            debug!(session_id = %id, "ignoring join without channel");
            return;
        }
        let Some(member) = self.sessions.get_mut(id) else {
            debug!(session_id = %id, channel, "join from unregistered session");
            return;
        };
        if member.channels.insert(channel.to_string()) {
            let _ = self
                .channels
                .entry(channel.to_string())
                .or_default()
                .insert(id.clone());
            debug!(session_id = %id, channel, "joined channel");
        }
    }

    /// Fan a frame out to its channel, or to every session when it has none.
    ///
    /// `origin` is the sending session, `None` for server-originated frames.
    /// The frame is serialized once; each target gets a non-blocking enqueue.
    pub fn broadcast(&mut self, frame: &Frame, origin: Option<&SessionId>) -> BroadcastReport {
        let channel = frame.target_channel();

        if let (Some(channel), Some(origin), ChatPolicy::MembersOnly) =
            (channel, origin, self.config.chat_policy)
        {
            let is_member = self
                .channels
                .get(channel)
                .is_some_and(|members| members.contains(origin));
            if !is_member {
                warn!(session_id = %origin, channel, "chat to channel without membership");
                return BroadcastReport {
                    rejected: true,
                    ..BroadcastReport::default()
                };
            }
        }

        let payload = match frame.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, kind = %frame.kind, "failed to serialize broadcast");
                return BroadcastReport::default();
            }
        };

        let mut report = BroadcastReport::default();
        let mut offer = |session: &Session| {
            report.recipients += 1;
            match session.outbound().push(Arc::clone(&payload)) {
                Ok(()) => report.delivered += 1,
                Err(EnqueueError::Full) => {
                    report.dropped += 1;
                    debug!(session_id = %session.id(), "outbound queue full, frame dropped");
                }
                // Torn down but not yet unregistered.
                Err(EnqueueError::Closed) => {}
            }
        };

        match channel {
            None => self.sessions.values().for_each(|m| offer(&m.session)),
            Some(name) => {
                if let Some(members) = self.channels.get(name) {
                    members
                        .iter()
                        .filter_map(|id| self.sessions.get(id))
                        .for_each(|m| offer(&m.session));
                }
            }
        }

        metrics::counter!(names::HUB_BROADCASTS_TOTAL).increment(1);
        if report.dropped > 0 {
            self.dropped += report.dropped as u64;
            metrics::counter!(names::WS_BROADCAST_DROPS_TOTAL).increment(report.dropped as u64);
        }
        debug!(
            channel = channel.unwrap_or("*"),
            recipients = report.recipients,
            dropped = report.dropped,
            "broadcast"
        );
        report
    }

    /// Sorted members of `channel`.
    pub fn members(&self, channel: &str) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .channels
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Registry summary.
    pub fn stats(&self) -> HubStats {
        HubStats {
            sessions: self.sessions.len(),
            channels: self.channels.len(),
            dropped: self.dropped,
        }
    }

    /// Close every session's queue and forget all state.
    pub fn close_all(&mut self) {
        for member in self.sessions.values() {
            member.session.outbound().close();
        }
        let closed = self.sessions.len();
        self.sessions.clear();
        self.channels.clear();
        self.record_active();
        if closed > 0 {
            info!(closed, "closed all sessions");
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_active(&self) {
        metrics::gauge!(names::WS_CONNECTIONS_ACTIVE).set(self.sessions.len() as f64);
    }
}

/// Requests processed by the hub task, in arrival order.
pub enum HubCommand {
    /// Add a session; acknowledged once it is in the registry.
    Register {
        /// Session to add.
        session: Arc<Session>,
        /// Completion signal.
        ack: oneshot::Sender<()>,
    },
    /// Remove a session.
    Unregister {
        /// Session to remove.
        id: SessionId,
    },
    /// Subscribe a session to a channel.
    Join {
        /// Joining session.
        id: SessionId,
        /// Channel name.
        channel: String,
    },
    /// Fan a frame out.
    Broadcast {
        /// Frame to send.
        frame: Frame,
        /// Sending session, `None` when server-originated.
        origin: Option<SessionId>,
    },
    /// Report registry counts.
    Stats {
        /// Reply slot.
        reply: oneshot::Sender<HubStats>,
    },
    /// List a channel's members.
    Members {
        /// Channel name.
        channel: String,
        /// Reply slot.
        reply: oneshot::Sender<Vec<SessionId>>,
    },
    /// Close every session and stop the loop.
    Shutdown {
        /// Completion signal.
        ack: oneshot::Sender<()>,
    },
}

/// Process-wide hub.
pub struct Hub;

impl Hub {
    /// Start the hub task.
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let task = tokio::spawn(run_hub(HubState::new(config), rx));
        (HubHandle { tx }, task)
    }
}

async fn run_hub(mut state: HubState, mut rx: mpsc::Receiver<HubCommand>) {
    info!("hub started");
    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Register { session, ack } => {
                state.register(session);
                let _ = ack.send(());
            }
            HubCommand::Unregister { id } => state.unregister(&id),
            HubCommand::Join { id, channel } => state.join(&id, &channel),
            HubCommand::Broadcast { frame, origin } => {
                let _ = state.broadcast(&frame, origin.as_ref());
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(state.stats());
            }
            HubCommand::Members { channel, reply } => {
                let _ = reply.send(state.members(&channel));
            }
            HubCommand::Shutdown { ack } => {
                state.close_all();
                let _ = ack.send(());
                break;
            }
        }
    }
    state.close_all();
    info!("hub stopped");
}

/// Cloneable client of the hub task.
#[derive(Clone, Debug)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn send(&self, command: HubCommand) -> Result<(), GatewayError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| GatewayError::HubClosed)
    }

    /// Register a session. Returns once it is visible to broadcasts.
    pub async fn register(&self, session: Arc<Session>) -> Result<(), GatewayError> {
        let (ack, done) = oneshot::channel();
        self.send(HubCommand::Register { session, ack }).await?;
        done.await.map_err(|_| GatewayError::HubClosed)
    }

    /// Unregister a session. Safe to call more than once.
    pub async fn unregister(&self, id: SessionId) {
        if self.send(HubCommand::Unregister { id }).await.is_err() {
            debug!("hub gone before unregister");
        }
    }

    /// Subscribe a session to a channel.
    pub async fn join(&self, id: SessionId, channel: impl Into<String>) -> Result<(), GatewayError> {
        self.send(HubCommand::Join {
            id,
            channel: channel.into(),
        })
        .await
    }

    /// Inject a server-originated frame into its channel, or to everyone.
    pub async fn broadcast(&self, frame: Frame) -> Result<(), GatewayError> {
        self.send(HubCommand::Broadcast {
            frame,
            origin: None,
        })
        .await
    }

    /// Fan out a frame sent by `origin`, subject to the chat policy.
    pub async fn relay(&self, origin: SessionId, frame: Frame) -> Result<(), GatewayError> {
        self.send(HubCommand::Broadcast {
            frame,
            origin: Some(origin),
        })
        .await
    }

    /// Registry counts.
    pub async fn stats(&self) -> Result<HubStats, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply }).await?;
        rx.await.map_err(|_| GatewayError::HubClosed)
    }

    /// Members of a channel.
    pub async fn members(&self, channel: impl Into<String>) -> Result<Vec<SessionId>, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Members {
            channel: channel.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| GatewayError::HubClosed)
    }

    /// Close every session and stop the hub.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        let (ack, done) = oneshot::channel();
        self.send(HubCommand::Shutdown { ack }).await?;
        done.await.map_err(|_| GatewayError::HubClosed)
    }
}
