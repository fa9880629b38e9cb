//! Persistent broker connection.
//!
//! [`PersistentConnection`] owns the one logical connection a service
//! keeps to the broker. Callers check [`is_connected`], call
//! [`try_connect`] when it is down, and then open a short-lived
//! [`Session`] per operation. Sessions close their channel when dropped,
//! so a channel is released on every exit path.
//!
//! [`is_connected`]: PersistentConnection::is_connected
//! [`try_connect`]: PersistentConnection::try_connect

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::backoff::{next_delay, sleep_or_cancel, BackoffConfig};
use crate::broker::{Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerOptions};

/// Keeps a single broker connection alive across failures.
pub struct PersistentConnection {
    broker: Arc<dyn Broker>,
    options: BrokerOptions,
    backoff: BackoffConfig,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    /// Serializes connection attempts.
    connect_lock: Mutex<()>,
    /// Cancelled by [`close`](Self::close); aborts pending retry waits.
    cancel: CancellationToken,
}

impl PersistentConnection {
    pub fn new(broker: Arc<dyn Broker>, options: BrokerOptions, backoff: BackoffConfig) -> Self {
        Self {
            broker,
            options,
            backoff,
            connection: RwLock::new(None),
            connect_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    /// Broker host this connection targets.
    pub fn host(&self) -> &str {
        &self.options.host
    }

    /// `true` while a live connection exists.
    pub async fn is_connected(&self) -> bool {
        self.connection
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.is_open())
    }

    /// Establish the connection, retrying with exponential backoff.
    ///
    /// Returns immediately when already connected. Transient failures are
    /// retried up to [`BackoffConfig::retry_count`] times; a refused login
    /// stops at once. Exhaustion is logged, never raised: callers check
    /// the return value (or [`is_connected`](Self::is_connected)).
    pub async fn try_connect(&self) -> bool {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected().await {
            return true;
        }

        let max_attempts = self.backoff.max_attempts();
        let mut delay = self.backoff.initial_delay;

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return false;
            }

            match self.establish().await {
                Ok(()) => {
                    tracing::info!(host = %self.options.host, attempt, "Connected to event bus broker");
                    return true;
                }
                Err(e) if !e.is_transient() => {
                    tracing::error!(
                        host = %self.options.host,
                        error = %e,
                        "Broker refused the connection, not retrying",
                    );
                    return false;
                }
                Err(e) => {
                    tracing::warn!(
                        host = %self.options.host,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker connection attempt {attempt} failed",
                    );
                }
            }

            if attempt < max_attempts {
                if !sleep_or_cancel(delay, &self.cancel).await {
                    return false;
                }
                delay = next_delay(delay, &self.backoff);
            }
        }

        tracing::error!(
            host = %self.options.host,
            attempts = max_attempts,
            "Could not connect to event bus broker",
        );
        false
    }

    /// A single connection attempt, without retry.
    ///
    /// Callers that run their own retry policy use this so that attempts
    /// are not multiplied.
    pub async fn connect_once(&self) -> Result<(), BrokerError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected().await {
            return Ok(());
        }
        self.establish().await
    }

    /// Open a short-lived session on the current connection.
    pub async fn open_session(&self) -> Result<Session, ConnectionError> {
        let connection = self
            .connection
            .read()
            .await
            .as_ref()
            .filter(|c| c.is_open())
            .cloned()
            .ok_or(ConnectionError::NotConnected)?;

        let channel = connection.create_channel().await?;
        tracing::trace!(host = %self.options.host, "Opened broker session");
        Ok(Session { channel })
    }

    /// Close the connection and abort pending retry waits.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(connection) = self.connection.write().await.take() {
            connection.close();
            tracing::info!(host = %self.options.host, "Closed event bus broker connection");
        }
    }

    async fn establish(&self) -> Result<(), BrokerError> {
        let connection = self.broker.connect(&self.options).await?;
        *self.connection.write().await = Some(connection);
        Ok(())
    }
}

/// A short-lived broker channel, closed when dropped.
pub struct Session {
    channel: Box<dyn BrokerChannel>,
}

impl Deref for Session {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.channel.close();
    }
}

/// Errors raised by [`PersistentConnection`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// No live connection; call `try_connect` first.
    #[error("No broker connection is available")]
    NotConnected,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ConnectionError {
    /// Whether a later attempt on a fresh connection may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotConnected => true,
            Self::Broker(e) => e.is_transient(),
        }
    }
}
