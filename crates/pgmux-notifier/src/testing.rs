//! In-memory [`Listener`] for tests.
//!
//! `MemoryListener` behaves like a single connection: every operation is
//! serialized behind one lock, commands are recorded in order, and events
//! are injected with [`MemoryListener::notify`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::errors::{ListenerError, Result};
use crate::listener::{Listener, Notification};

/// Operation observed by a [`MemoryListener`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `connect` succeeded.
    Connect,
    /// `close` on a live connection.
    Close,
    /// `ping` succeeded.
    Ping,
    /// `listen` succeeded.
    Listen(String),
    /// `unlisten` succeeded.
    Unlisten(String),
}

type Injected = std::result::Result<Notification, ListenerError>;

/// Scriptable in-memory connection.
pub struct MemoryListener {
    connected: AtomicBool,
    commands: Mutex<Vec<Command>>,
    injector: mpsc::UnboundedSender<Injected>,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<Injected>>,
    command_delay: Mutex<Option<Duration>>,
    next_failure: Mutex<Option<String>>,
}

impl Default for MemoryListener {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryListener {
    /// A listener that still needs `connect`.
    pub fn new() -> Self {
        let (injector, inbox) = mpsc::unbounded_channel();
        Self {
            connected: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            injector,
            inbox: AsyncMutex::new(inbox),
            command_delay: Mutex::new(None),
            next_failure: Mutex::new(None),
        }
    }

    /// A listener that is already connected.
    pub fn connected() -> Self {
        let listener = Self::new();
        listener.connected.store(true, Ordering::Release);
        listener
    }

    /// Whether the connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Publish `payload` on `channel`.
    ///
    /// Delivered regardless of registrations, like a server that does not
    /// filter; the notifier ignores channels it has no subscribers for.
    pub fn notify(&self, channel: &str, payload: impl Into<Bytes>) {
        let _ = self.injector.send(Ok(Notification::new(channel, payload)));
    }

    /// Make the next wait fail with a transport error.
    pub fn fail(&self, message: &str) {
        let _ = self
            .injector
            .send(Err(ListenerError::ConnectionLost(message.to_owned())));
    }

    /// Make the next LISTEN or UNLISTEN fail.
    pub fn fail_next_command(&self, message: &str) {
        *self.next_failure.lock() = Some(message.to_owned());
    }

    /// Delay every LISTEN and UNLISTEN by `delay`.
    pub fn set_command_delay(&self, delay: Duration) {
        *self.command_delay.lock() = Some(delay);
    }

    /// Let commands complete immediately again.
    pub fn clear_command_delay(&self) {
        *self.command_delay.lock() = None;
    }

    /// Every successful command so far, oldest first.
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    /// Number of successful LISTENs on `channel`.
    pub fn listen_count(&self, channel: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| matches!(c, Command::Listen(ch) if ch == channel))
            .count()
    }

    /// Number of successful UNLISTENs on `channel`.
    pub fn unlisten_count(&self, channel: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| matches!(c, Command::Unlisten(ch) if ch == channel))
            .count()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ListenerError::NotConnected)
        }
    }

    async fn command(&self, command: Command) -> Result<()> {
        let _inbox = self.inbox.lock().await;
        self.ensure_connected()?;

        let delay = *self.command_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.next_failure.lock().take() {
            return Err(ListenerError::ConnectionLost(message));
        }

        self.commands.lock().push(command);
        Ok(())
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn connect(&self) -> Result<()> {
        let _inbox = self.inbox.lock().await;
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(ListenerError::AlreadyConnected);
        }
        self.commands.lock().push(Command::Connect);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _inbox = self.inbox.lock().await;
        if self.connected.swap(false, Ordering::AcqRel) {
            self.commands.lock().push(Command::Close);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let _inbox = self.inbox.lock().await;
        self.ensure_connected()?;
        self.commands.lock().push(Command::Ping);
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<()> {
        self.command(Command::Listen(channel.to_owned())).await
    }

    async fn unlisten(&self, channel: &str) -> Result<()> {
        self.command(Command::Unlisten(channel.to_owned())).await
    }

    async fn wait_for_notification(&self, cancel: &CancellationToken) -> Result<Notification> {
        let mut inbox = self.inbox.lock().await;
        self.ensure_connected()?;

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ListenerError::Cancelled),
            injected = inbox.recv() => injected.unwrap_or_else(|| {
                Err(ListenerError::ConnectionLost("injector dropped".into()))
            }),
        }
    }
}
