//! A caller's handle on one channel.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};

use crate::errors::NotifierError;
use crate::notifier::Shared;

/// One registered interest in a channel.
///
/// Events arrive through a bounded queue. When the queue is full the
/// dispatcher drops new events for this subscription instead of blocking;
/// [`dropped_count`](Self::dropped_count) reports how many were lost.
///
/// Dropping the subscription withdraws it, as does [`unlisten`](Self::unlisten).
pub struct Subscription {
    id: u64,
    channel: String,
    rx: mpsc::Receiver<Bytes>,
    established: watch::Receiver<bool>,
    dropped: Arc<AtomicU64>,
    withdrawn: bool,
    shared: Arc<Shared>,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        channel: String,
        rx: mpsc::Receiver<Bytes>,
        established: watch::Receiver<bool>,
        dropped: Arc<AtomicU64>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            channel,
            rx,
            established,
            dropped,
            withdrawn: false,
            shared,
        }
    }

    /// Identifier unique within the owning notifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The channel this subscription watches.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Events dropped because this subscription's queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the channel's LISTEN has completed.
    pub fn is_established(&self) -> bool {
        *self.established.borrow()
    }

    /// Wait until the channel's LISTEN has completed.
    ///
    /// Resolves immediately when a co-subscriber already established the
    /// channel. Fails with [`NotifierError::Closed`] if the run loop exits
    /// before the LISTEN is applied.
    pub async fn established(&self) -> Result<(), NotifierError> {
        let mut rx = self.established.clone();
        let _ = rx.wait_for(|ready| *ready).await.map_err(|_| NotifierError::Closed)?;
        Ok(())
    }

    /// Receive the next event. Returns `None` after [`unlisten`](Self::unlisten).
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Receive an event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        match self.rx.try_recv() {
            Ok(payload) => Some(payload),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Borrow the subscription as a stream of events.
    pub fn events(&mut self) -> impl Stream<Item = Bytes> + '_ {
        futures::stream::poll_fn(move |cx| self.rx.poll_recv(cx))
    }

    /// Withdraw this subscription.
    ///
    /// Idempotent. After it returns no further events are delivered and any
    /// queued ones are discarded. When this was the channel's last
    /// subscription, the run loop is woken to issue UNLISTEN.
    pub fn unlisten(&mut self) {
        if self.withdrawn {
            return;
        }
        self.withdrawn = true;
        self.shared.withdraw(&self.channel, self.id);

        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unlisten();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("established", &self.is_established())
            .field("dropped", &self.dropped_count())
            .field("withdrawn", &self.withdrawn)
            .finish_non_exhaustive()
    }
}
