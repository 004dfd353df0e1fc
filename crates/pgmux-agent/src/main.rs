//! # pgmux-agent
//!
//! Command-line front end: follows notification channels, serves the
//! event-invalidated user cache, and writes to the `users` table so the
//! change trigger has something to publish.

#![deny(unsafe_code)]

mod users;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pgmux_cache::Cache;
use pgmux_notifier::{Listener, Notifier, NotifierConfig, NotifierError, PgListener};
use pgmux_settings::{NotifierSettings, PgmuxSettings};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::users::{NewUser, User, UserStore};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "pgmux-agent", about = "Multiplexed PostgreSQL LISTEN/NOTIFY client")]
struct Cli {
    /// Settings file (defaults to `~/.pgmux/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every payload published on the given channels.
    Listen {
        /// Channel to follow; repeat for several.
        #[arg(long = "channel", required = true)]
        channels: Vec<String>,
    },

    /// Periodically read a user through the event-invalidated cache.
    WatchUser {
        /// User id.
        #[arg(long)]
        id: Uuid,

        /// Seconds between reads.
        #[arg(long, default_value = "5")]
        interval_secs: u64,
    },

    /// Insert a user.
    CreateUser {
        /// Given name.
        #[arg(long)]
        first_name: String,

        /// Family name.
        #[arg(long)]
        last_name: String,

        /// Contact address.
        #[arg(long)]
        email: String,
    },

    /// Change a user's email.
    SetEmail {
        /// User id.
        #[arg(long)]
        id: Uuid,

        /// New address.
        #[arg(long)]
        email: String,
    },
}

fn notifier_config(settings: &NotifierSettings) -> NotifierConfig {
    NotifierConfig {
        buffer_capacity: settings.buffer_capacity,
        command_timeout: settings.command_timeout(),
        heartbeat: settings.heartbeat(),
    }
}

/// A connected listener with its notifier loop running.
struct Session {
    notifier: Notifier,
    listener: Arc<PgListener>,
    lifetime: CancellationToken,
    run: JoinHandle<NotifierError>,
}

impl Session {
    /// Connect a dedicated listener and start the run loop.
    ///
    /// `lifetime` is cancelled when the loop ends for any reason, so command
    /// loops only have to watch the token.
    async fn start(settings: &PgmuxSettings, lifetime: CancellationToken) -> Result<Self> {
        let listener = Arc::new(
            PgListener::from_url(&settings.database.url).context("Invalid database URL")?,
        );
        listener
            .connect()
            .await
            .context("Failed to connect listener")?;
        listener.ping().await.context("Listener ping failed")?;

        let notifier = Notifier::new(listener.clone(), notifier_config(&settings.notifier));
        let runner = notifier.clone();
        let token = lifetime.clone();
        let run = tokio::spawn(async move {
            let err = runner.run(token.clone()).await;
            token.cancel();
            err
        });

        Ok(Self {
            notifier,
            listener,
            lifetime,
            run,
        })
    }

    /// Stop the loop, release the connection and report how the loop ended.
    async fn finish(self) -> Result<()> {
        self.lifetime.cancel();
        let outcome = self.run.await.context("Notifier task failed")?;
        if let Err(e) = self.listener.close().await {
            warn!(error = %e, "failed to close listener");
        }
        match outcome {
            NotifierError::Stopped => Ok(()),
            err => Err(anyhow::Error::new(err).context("Notifier stopped unexpectedly")),
        }
    }
}

fn print_json(user: &User) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(user)?);
    Ok(())
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    let _ = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutting down..."),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
        token.cancel();
    });
}

async fn listen(settings: &PgmuxSettings, channels: Vec<String>) -> Result<()> {
    let lifetime = CancellationToken::new();
    cancel_on_ctrl_c(lifetime.clone());
    let session = Session::start(settings, lifetime.clone()).await?;

    let mut printers = JoinSet::new();
    for channel in channels {
        let mut sub = session.notifier.listen(channel);
        let token = lifetime.clone();
        let _ = printers.spawn(async move {
            if let Err(e) = sub.established().await {
                warn!(channel = sub.channel(), error = %e, "channel was never established");
                return;
            }
            info!(channel = sub.channel(), "listening");
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    payload = sub.recv() => {
                        let Some(payload) = payload else { break };
                        println!("{}: {}", sub.channel(), String::from_utf8_lossy(&payload));
                    }
                }
            }
        });
    }

    lifetime.cancelled().await;
    let _ = printers.join_all().await;
    session.finish().await
}

async fn watch_user(settings: &PgmuxSettings, id: Uuid, interval: Duration) -> Result<()> {
    let store = UserStore::connect(&settings.database.url, settings.database.max_pool_size)
        .context("Failed to create user store")?;

    let lifetime = CancellationToken::new();
    cancel_on_ctrl_c(lifetime.clone());
    let session = Session::start(settings, lifetime.clone()).await?;

    let cache = Arc::new(Cache::<User, _>::new(store, settings.cache.ttl()));
    let sub = session.notifier.listen(settings.cache.channel.clone());
    if let Err(e) = sub.established().await {
        drop(sub);
        session.finish().await?;
        return Err(e).context("Cache channel was never established");
    }

    let follower = cache.clone();
    let token = lifetime.clone();
    let follow = tokio::spawn(async move { follower.listen(sub, token).await });

    let mut ticker = tokio::time::interval(interval);
    let watched = loop {
        tokio::select! {
            () = lifetime.cancelled() => break Ok(()),
            _ = ticker.tick() => {
                match cache.get(&id).await {
                    Ok(user) => print_json(&user)?,
                    Err(e) => break Err(anyhow::Error::new(e).context("Failed to get user from cache")),
                }
            }
        }
    };

    lifetime.cancel();
    let _ = follow.await;
    let finished = session.finish().await;
    watched.and(finished)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(pgmux_settings::settings_path);
    let settings = pgmux_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    pgmux_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    match cli.command {
        Command::Listen { channels } => listen(&settings, channels).await,
        Command::WatchUser { id, interval_secs } => {
            watch_user(&settings, id, Duration::from_secs(interval_secs.max(1))).await
        }
        Command::CreateUser {
            first_name,
            last_name,
            email,
        } => {
            let store = UserStore::connect(&settings.database.url, settings.database.max_pool_size)
                .context("Failed to create user store")?;
            let user = store
                .create(&NewUser {
                    first_name,
                    last_name,
                    email,
                })
                .await
                .context("Failed to create user")?;
            print_json(&user)
        }
        Command::SetEmail { id, email } => {
            let store = UserStore::connect(&settings.database.url, settings.database.max_pool_size)
                .context("Failed to create user store")?;
            let user = store
                .update_email(id, &email)
                .await
                .context("Failed to update user")?;
            print_json(&user)
        }
    }
}
