//! The subscription multiplexer.
//!
//! Many [`Subscription`]s share one [`Listener`]. The registry maps each
//! channel to its live subscribers; the number of subscribers is the
//! channel's reference count. A LISTEN is queued when a channel goes from
//! zero to one subscriber and an UNLISTEN when it drops back to zero. Only
//! the run loop drains that queue and talks to the listener, so commands
//! and waits never interleave.
//!
//! # Run loop
//!
//! Each iteration:
//! 1. **Drain** pending channel changes in FIFO order, each bounded by the
//!    command timeout. A completed LISTEN resolves the channel's
//!    `established` signal.
//! 2. **Wait** for the next notification, bounded by the heartbeat window.
//!    The wait token is published in the registry so that `listen` and
//!    `unlisten` can interrupt it and get their change applied right away.
//! 3. **Dispatch** the notification to every subscriber of its channel with
//!    a non-blocking send. A full queue drops the event for that subscriber.
//!
//! A heartbeat expiry or an interrupted wait loops back to step 1. Any
//! other failure, or cancellation of the lifetime token, ends [`Notifier::run`].

use std::collections::{HashMap, VecDeque};
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::errors::{ChangeKind, NotifierError};
use crate::listener::{Listener, Notification};
use crate::subscription::Subscription;

/// Default per-subscription queue capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 2;
/// Default deadline for a single LISTEN/UNLISTEN.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// Default upper bound of one wait cycle.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Notifier tuning.
#[derive(Clone, Debug)]
pub struct NotifierConfig {
    /// Per-subscription event queue capacity (at least 1).
    pub buffer_capacity: usize,
    /// Deadline for each LISTEN/UNLISTEN command.
    pub command_timeout: Duration,
    /// Upper bound of one wait cycle.
    pub heartbeat: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}

/// A live subscriber as seen by the dispatcher.
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
}

struct ChannelEntry {
    subscribers: Vec<Subscriber>,
    established: watch::Receiver<bool>,
}

enum ChannelChange {
    Listen {
        channel: String,
        established: watch::Sender<bool>,
    },
    Unlisten {
        channel: String,
    },
}

struct Registry {
    channels: HashMap<String, ChannelEntry>,
    changes: VecDeque<ChannelChange>,
    wait_cancel: CancellationToken,
}

/// State shared between the notifier handle and its subscriptions.
pub(crate) struct Shared {
    listener: Arc<dyn Listener>,
    config: NotifierConfig,
    state: RwLock<Registry>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl Shared {
    /// Remove subscriber `id` from `channel`, queueing an UNLISTEN when it
    /// was the last one.
    pub(crate) fn withdraw(&self, channel: &str, id: u64) {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let Some(entry) = state.channels.get_mut(channel) else {
            return;
        };
        let before = entry.subscribers.len();
        entry.subscribers.retain(|s| s.id != id);
        let remaining = entry.subscribers.len();
        if remaining == before {
            return;
        }

        if remaining == 0 {
            let _ = state.channels.remove(channel);
            state.changes.push_back(ChannelChange::Unlisten {
                channel: channel.to_owned(),
            });
            state.wait_cancel.cancel();
        }
        debug!(channel, subscription = id, remaining, "removed subscription");
    }

    /// Replace every queued LISTEN with a fresh one for the next run.
    ///
    /// Dropping the old changes closes their `established` signals, so
    /// callers waiting on this run see it end. Each channel that is still
    /// registered but not yet established gets a new signal and a new LISTEN.
    /// Queued UNLISTENs are kept as they are.
    fn rearm_listens(&self) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let before = state.changes.len();
        state
            .changes
            .retain(|change| matches!(change, ChannelChange::Unlisten { .. }));
        let abandoned = before - state.changes.len();

        let mut requeued = 0_usize;
        for (channel, entry) in &mut state.channels {
            if *entry.established.borrow() {
                continue;
            }
            let (established_tx, established_rx) = watch::channel(false);
            entry.established = established_rx;
            state.changes.push_back(ChannelChange::Listen {
                channel: channel.clone(),
                established: established_tx,
            });
            requeued += 1;
        }

        if abandoned > 0 || requeued > 0 {
            debug!(abandoned, requeued, "re-armed pending listens");
        }
    }
}

/// Clears the running flag and re-arms pending listens however `run` exits.
struct RunGuard<'a> {
    shared: &'a Shared,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.shared.rearm_listens();
        self.shared.running.store(false, Ordering::Release);
    }
}

/// Multiplexes channel subscriptions over one [`Listener`].
///
/// Cloning is cheap; clones share the registry and the listener.
#[derive(Clone)]
pub struct Notifier {
    shared: Arc<Shared>,
}

impl Notifier {
    /// Create a notifier over an already connected listener.
    pub fn new(listener: Arc<dyn Listener>, config: NotifierConfig) -> Self {
        let config = NotifierConfig {
            buffer_capacity: config.buffer_capacity.max(1),
            ..config
        };
        Self {
            shared: Arc::new(Shared {
                listener,
                config,
                state: RwLock::new(Registry {
                    channels: HashMap::new(),
                    changes: VecDeque::new(),
                    wait_cancel: CancellationToken::new(),
                }),
                next_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// The effective configuration.
    pub fn config(&self) -> &NotifierConfig {
        &self.shared.config
    }

    /// Register interest in `channel`.
    ///
    /// The first subscriber of a channel queues a LISTEN and interrupts the
    /// in-flight wait so the run loop applies it immediately. Later
    /// subscribers share the channel's existing registration.
    pub fn listen(&self, channel: impl Into<String>) -> Subscription {
        let channel = channel.into();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.config.buffer_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let subscriber = Subscriber {
            id,
            tx,
            dropped: Arc::clone(&dropped),
        };

        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let established = match state.channels.entry(channel.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.subscribers.push(subscriber);
                debug!(
                    channel = %channel,
                    subscription = id,
                    subscribers = entry.subscribers.len(),
                    "added subscription to existing channel"
                );
                entry.established.clone()
            }
            Entry::Vacant(vacant) => {
                let (established_tx, established_rx) = watch::channel(false);
                let _ = vacant.insert(ChannelEntry {
                    subscribers: vec![subscriber],
                    established: established_rx.clone(),
                });
                state.changes.push_back(ChannelChange::Listen {
                    channel: channel.clone(),
                    established: established_tx,
                });
                state.wait_cancel.cancel();
                debug!(channel = %channel, subscription = id, "queued listen for new channel");
                established_rx
            }
        };
        drop(guard);

        Subscription::new(
            id,
            channel,
            rx,
            established,
            dropped,
            Arc::clone(&self.shared),
        )
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.shared
            .state
            .read()
            .channels
            .get(channel)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Number of channels with at least one subscription.
    pub fn channel_count(&self) -> usize {
        self.shared.state.read().channels.len()
    }

    /// Run the loop until a fatal error or until `lifetime` is cancelled.
    ///
    /// Always returns an error: [`NotifierError::Stopped`] after
    /// cancellation, otherwise the failure that ended the loop. There is no
    /// internal reconnect; the caller decides whether to rebuild the listener
    /// and notifier.
    ///
    /// LISTENs still pending when the loop ends are abandoned and their
    /// `established` signals close. Every channel that is still registered
    /// gets a fresh LISTEN queued for the next run, and pending UNLISTENs are
    /// carried over.
    #[tracing::instrument(skip_all, name = "notifier")]
    pub async fn run(&self, lifetime: CancellationToken) -> NotifierError {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return NotifierError::AlreadyRunning;
        }
        let _guard = RunGuard {
            shared: &self.shared,
        };
        info!("notifier run loop started");

        let err = loop {
            if let Err(e) = self.wait_once(&lifetime).await {
                break e;
            }
            if lifetime.is_cancelled() {
                break NotifierError::Stopped;
            }
        };

        match &err {
            NotifierError::Stopped => info!("notifier run loop stopped"),
            other => error!(error = %other, "notifier run loop terminated"),
        }
        err
    }

    async fn wait_once(&self, lifetime: &CancellationToken) -> Result<(), NotifierError> {
        self.process_channel_changes(lifetime).await?;

        let wait_token = {
            let mut state = self.shared.state.write();
            if !state.changes.is_empty() {
                // Changes arrived while draining; apply them before waiting.
                return Ok(());
            }
            let token = lifetime.child_token();
            state.wait_cancel = token.clone();
            token
        };

        let heartbeat = self.shared.config.heartbeat;
        let waited = tokio::time::timeout(
            heartbeat,
            self.shared.listener.wait_for_notification(&wait_token),
        )
        .await;

        let notification = match waited {
            Err(_) => {
                trace!(?heartbeat, "heartbeat elapsed without notification");
                return Ok(());
            }
            Ok(Err(e)) if e.is_interrupted() => {
                if lifetime.is_cancelled() {
                    return Err(NotifierError::Stopped);
                }
                trace!("wait interrupted by channel change");
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(notification)) => notification,
        };

        self.dispatch(&notification);
        Ok(())
    }

    async fn process_channel_changes(
        &self,
        lifetime: &CancellationToken,
    ) -> Result<(), NotifierError> {
        loop {
            let Some(change) = self.shared.state.write().changes.pop_front() else {
                return Ok(());
            };
            match change {
                ChannelChange::Listen {
                    channel,
                    established,
                } => {
                    self.apply(ChangeKind::Listen, &channel, lifetime).await?;
                    let _ = established.send_replace(true);
                    debug!(channel = %channel, "listening on channel");
                }
                ChannelChange::Unlisten { channel } => {
                    if let Err(e) = self.apply(ChangeKind::Unlisten, &channel, lifetime).await {
                        // Keep it for the next run.
                        self.shared
                            .state
                            .write()
                            .changes
                            .push_front(ChannelChange::Unlisten { channel });
                        return Err(e);
                    }
                    debug!(channel = %channel, "stopped listening on channel");
                }
            }
        }
    }

    async fn apply(
        &self,
        kind: ChangeKind,
        channel: &str,
        lifetime: &CancellationToken,
    ) -> Result<(), NotifierError> {
        let timeout = self.shared.config.command_timeout;
        let listener = &self.shared.listener;
        let command = async {
            match kind {
                ChangeKind::Listen => listener.listen(channel).await,
                ChangeKind::Unlisten => listener.unlisten(channel).await,
            }
        };

        let outcome = tokio::select! {
            biased;
            () = lifetime.cancelled() => return Err(NotifierError::Stopped),
            outcome = tokio::time::timeout(timeout, command) => outcome,
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(NotifierError::Command {
                kind,
                channel: channel.to_owned(),
                source,
            }),
            Err(_) => Err(NotifierError::CommandTimeout {
                kind,
                channel: channel.to_owned(),
                timeout,
            }),
        }
    }

    fn dispatch(&self, notification: &Notification) {
        let state = self.shared.state.read();
        let Some(entry) = state.channels.get(&notification.channel) else {
            debug!(
                channel = %notification.channel,
                "notification for channel without subscribers"
            );
            return;
        };

        for subscriber in &entry.subscribers {
            match subscriber.tx.try_send(notification.payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let _ = subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        channel = %notification.channel,
                        subscription = subscriber.id,
                        payload_len = notification.payload.len(),
                        "dropped notification due to full buffer"
                    );
                    debug!(
                        channel = %notification.channel,
                        subscription = subscriber.id,
                        payload = %String::from_utf8_lossy(&notification.payload),
                        "dropped payload"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        channel = %notification.channel,
                        subscription = subscriber.id,
                        "subscriber receiver closed"
                    );
                }
            }
        }
    }
}
