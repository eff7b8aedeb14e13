//! Network attachment for the edge node.
//!
//! [`ConnectivityManager::ensure_connected`] is called before every trigger
//! request. It always asks the link for its live status, so a silent drop is
//! noticed on the next trigger rather than masked by cached state.

use async_trait::async_trait;
use halo_protocol::Pause;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that can occur while joining the network.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Failed to join network: {0}")]
    JoinFailed(String),

    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A network link the edge node can bring up and inspect.
#[async_trait]
pub trait NetworkLink: Send + Sync {
    /// Current link status, read from the interface.
    async fn is_up(&self) -> bool;

    /// Start joining the network. May return before the link is up.
    async fn join(&self) -> Result<(), LinkError>;
}

/// State of the network attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Brings the link up with a bounded number of spaced checks.
pub struct ConnectivityManager<L> {
    link: L,
    state: ConnectionState,
    max_attempts: u32,
    attempt_interval: Duration,
    pause: Pause,
    failed_connects: u64,
}

impl<L: NetworkLink> ConnectivityManager<L> {
    pub fn new(link: L, max_attempts: u32, attempt_interval: Duration) -> Self {
        Self {
            link,
            state: ConnectionState::Disconnected,
            max_attempts,
            attempt_interval,
            pause: Pause::new(),
            failed_connects: 0,
        }
    }

    pub fn with_pause(mut self, pause: Pause) -> Self {
        self.pause = pause;
        self
    }

    /// Get the last observed connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of connection attempts that ran out of budget.
    pub fn failed_connects(&self) -> u64 {
        self.failed_connects
    }

    /// Make sure the link is up, joining if needed.
    ///
    /// Returns `false` once the attempt budget is spent; the caller decides
    /// when to try again.
    pub async fn ensure_connected(&mut self) -> bool {
        if self.link.is_up().await {
            if self.state != ConnectionState::Connected {
                info!("Network link is up");
            }
            self.state = ConnectionState::Connected;
            return true;
        }

        if self.state == ConnectionState::Connected {
            warn!("Network link dropped");
        }

        self.state = ConnectionState::Connecting;
        info!(max_attempts = self.max_attempts, "Connecting to network");

        if let Err(e) = self.link.join().await {
            warn!(error = %e, "Join request failed, still waiting for link");
        }

        for attempt in 1..=self.max_attempts {
            if self.link.is_up().await {
                self.state = ConnectionState::Connected;
                info!(attempt = attempt, "Connected to network");
                return true;
            }

            debug!(attempt = attempt, "Link not up yet");
            if self.pause.wait(self.attempt_interval).await.is_err() {
                break;
            }
        }

        self.state = ConnectionState::Disconnected;
        self.failed_connects += 1;
        error!(
            attempts = self.max_attempts,
            interval_ms = self.attempt_interval.as_millis() as u64,
            "Failed to connect to network"
        );
        false
    }
}
