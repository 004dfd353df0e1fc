//! [`Listener`] over a dedicated `tokio-postgres` connection.
//!
//! Pooled connections are unsuitable here: the pool drives each connection
//! itself and discards asynchronous messages, so notifications would never
//! surface. `PgListener` therefore owns its connection and spawns a driver
//! task that polls the message stream and forwards every `NOTIFY` into an
//! internal channel read by [`Listener::wait_for_notification`].

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::{AsyncMessage, Client, Config, Connection, NoTls, Socket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ListenerError, Result};
use crate::listener::{Listener, Notification, quote_identifier};

type Forwarded = std::result::Result<Notification, ListenerError>;

struct PgConnection {
    client: Client,
    notifications: mpsc::UnboundedReceiver<Forwarded>,
    driver: JoinHandle<()>,
}

/// `PostgreSQL` LISTEN/NOTIFY connection.
pub struct PgListener {
    config: Config,
    conn: Mutex<Option<PgConnection>>,
}

impl PgListener {
    /// Create an unconnected listener for the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    /// Create an unconnected listener from a connection string or URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(url.parse()?))
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(ListenerError::NotConnected)?;
        conn.client.batch_execute(sql).await?;
        Ok(())
    }
}

#[async_trait]
impl Listener for PgListener {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Err(ListenerError::AlreadyConnected);
        }

        let (client, connection) = self.config.connect(NoTls).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive_connection(connection, tx));

        *guard = Some(PgConnection {
            client,
            notifications: rx,
            driver,
        });
        info!("listener connected");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let taken = self.conn.lock().await.take();
        let Some(PgConnection {
            client,
            notifications,
            driver,
        }) = taken
        else {
            return Ok(());
        };

        // Dropping the last client makes the connection terminate, which ends
        // the driver task.
        drop(client);
        drop(notifications);
        driver
            .await
            .map_err(|e| ListenerError::ConnectionLost(format!("driver task failed: {e}")))?;
        info!("listener closed");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.execute("SELECT 1").await
    }

    async fn listen(&self, channel: &str) -> Result<()> {
        self.execute(&format!("LISTEN {}", quote_identifier(channel)))
            .await
    }

    async fn unlisten(&self, channel: &str) -> Result<()> {
        self.execute(&format!("UNLISTEN {}", quote_identifier(channel)))
            .await
    }

    async fn wait_for_notification(&self, cancel: &CancellationToken) -> Result<Notification> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(ListenerError::NotConnected)?;

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ListenerError::Cancelled),
            forwarded = conn.notifications.recv() => forwarded.unwrap_or_else(|| {
                Err(ListenerError::ConnectionLost("notification stream ended".into()))
            }),
        }
    }
}

/// Poll the connection until it ends, forwarding notifications.
///
/// A connection error is forwarded once, after which the channel closes.
async fn drive_connection(
    mut connection: Connection<Socket, NoTlsStream>,
    tx: mpsc::UnboundedSender<Forwarded>,
) {
    let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));

    while let Some(message) = messages.next().await {
        match message {
            Ok(AsyncMessage::Notification(n)) => {
                debug!(channel = n.channel(), pid = n.process_id(), "notification received");
                let notification = Notification::new(n.channel(), n.payload().to_owned());
                if tx.send(Ok(notification)).is_err() {
                    return;
                }
            }
            Ok(AsyncMessage::Notice(notice)) => {
                debug!(message = notice.message(), "postgres notice");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "listener connection failed");
                let _ = tx.send(Err(ListenerError::Postgres(e)));
                return;
            }
        }
    }
    debug!("listener connection ended");
}
