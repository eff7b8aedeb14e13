//! The edge control loop.
//!
//! Sensing, the trigger round trip and the servo sweep run one after another
//! on a single task: while an item is being sorted the sensor is not polled.
//! Only one request is ever outstanding, so actuations happen in the order
//! the presences were sent.

use crate::actuator::SortActuator;
use crate::connectivity::NetworkLink;
use crate::sensor::{PresenceInput, SensorMonitor};
use crate::transport::TriggerTransport;
use crate::trigger_client::{TriggerClient, TriggerOutcome};
use futures::StreamExt;
use halo_protocol::Pause;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Counters kept by the control loop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ControllerStats {
    pub presences: u64,
    pub actuations: u64,
    pub dropped: u64,
    pub sensor_errors: u64,
}

/// Runs the sense → trigger → actuate loop until shutdown.
pub struct EdgeController<I, T, A, L> {
    monitor: SensorMonitor<I>,
    client: TriggerClient<T, A, L>,
}

impl<I, T, A, L> EdgeController<I, T, A, L>
where
    I: PresenceInput,
    T: TriggerTransport,
    A: SortActuator,
    L: NetworkLink,
{
    pub fn new(monitor: SensorMonitor<I>, client: TriggerClient<T, A, L>) -> Self {
        Self { monitor, client }
    }

    /// Poll until `shutdown` is cancelled, handling each presence in turn.
    pub async fn run(self, shutdown: CancellationToken) -> ControllerStats {
        let Self { monitor, mut client } = self;
        let mut stats = ControllerStats::default();

        info!(
            poll_interval_ms = monitor.poll_interval().as_millis() as u64,
            "Edge controller started"
        );

        let events = monitor.into_events(Pause::with_token(shutdown.clone()));
        futures::pin_mut!(events);

        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    stats.presences += 1;
                    match client.on_presence(event).await {
                        TriggerOutcome::Actuated { .. } => stats.actuations += 1,
                        TriggerOutcome::Dropped(_) => stats.dropped += 1,
                    }
                }
                Err(_) => stats.sensor_errors += 1,
            }

            if shutdown.is_cancelled() {
                break;
            }
        }

        info!(
            presences = stats.presences,
            actuations = stats.actuations,
            dropped = stats.dropped,
            sensor_errors = stats.sensor_errors,
            "Edge controller stopped"
        );
        stats
    }
}
