//! Turns presence events into classification requests and servo moves.
//!
//! Each [`PresenceEvent`] gets at most one request and at most one actuation.
//! Anything that goes wrong along the way (no link, network error, timeout,
//! error reply, unknown token) is logged and the event is dropped; it is never
//! retried, so a single item can never be sorted twice.

use crate::actuator::SortActuator;
use crate::connectivity::{ConnectivityManager, NetworkLink};
use crate::sensor::PresenceEvent;
use crate::transport::TriggerTransport;
use halo_protocol::{BinIndex, ClassificationRequest, Reply, TokenTable};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Why a presence event did not lead to an actuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The network could not be brought up; no request was sent.
    Offline,
    /// The request failed before a reply arrived.
    Network(String),
    /// No reply within the request timeout.
    Timeout,
    /// The server answered with an error.
    ServerError(String),
    /// The server answered with a token this node does not act on.
    Unrecognized(String),
    /// The servo sweep failed.
    ActuatorFailed(String),
}

/// Result of handling one presence event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Actuated { bin: BinIndex },
    Dropped(DropReason),
}

/// Edge-side orchestrator for one trigger round trip.
pub struct TriggerClient<T, A, L> {
    transport: T,
    actuator: A,
    connectivity: ConnectivityManager<L>,
    tokens: TokenTable,
    request_timeout: Duration,
}

impl<T, A, L> TriggerClient<T, A, L>
where
    T: TriggerTransport,
    A: SortActuator,
    L: NetworkLink,
{
    pub fn new(
        transport: T,
        actuator: A,
        connectivity: ConnectivityManager<L>,
        tokens: TokenTable,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            actuator,
            connectivity,
            tokens,
            request_timeout,
        }
    }

    pub fn connectivity_mut(&mut self) -> &mut ConnectivityManager<L> {
        &mut self.connectivity
    }

    /// Check that the server answers on its root before triggering.
    pub async fn preflight(&self) -> bool {
        match self.transport.probe().await {
            Ok(response) => {
                info!(status = response.status, body = %response.body, "Server reachable");
                true
            }
            Err(e) => {
                error!(error = %e, "Server probe failed");
                false
            }
        }
    }

    /// Handle one presence event end to end.
    #[instrument(skip(self, event), fields(detected_at = %event.detected_at))]
    pub async fn on_presence(&mut self, event: PresenceEvent) -> TriggerOutcome {
        if !self.connectivity.ensure_connected().await {
            warn!("Dropping trigger: network unavailable");
            return TriggerOutcome::Dropped(DropReason::Offline);
        }

        let request = ClassificationRequest::trigger();
        let sent = tokio::time::timeout(self.request_timeout, self.transport.send_trigger(&request));

        // A reply arriving after the timeout is discarded with the future.
        let response = match sent.await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(error = %e, "Dropping trigger: request failed");
                return TriggerOutcome::Dropped(DropReason::Network(e.to_string()));
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Dropping trigger: request timed out"
                );
                return TriggerOutcome::Dropped(DropReason::Timeout);
            }
        };

        match Reply::decode(response.status, &response.body, &self.tokens) {
            Reply::Recognized(command) => {
                info!(bin = command.bin_index, "Sorting item");
                match self.actuator.move_to_bin(command.bin_index).await {
                    Ok(()) => TriggerOutcome::Actuated {
                        bin: command.bin_index,
                    },
                    Err(e) => {
                        error!(bin = command.bin_index, error = %e, "Servo movement failed");
                        TriggerOutcome::Dropped(DropReason::ActuatorFailed(e.to_string()))
                    }
                }
            }
            Reply::Error(message) => {
                warn!(status = response.status, error = %message, "Dropping trigger: server error");
                TriggerOutcome::Dropped(DropReason::ServerError(message))
            }
            Reply::Unknown(token) => {
                warn!(token = %token, "Dropping trigger: unrecognized response");
                TriggerOutcome::Dropped(DropReason::Unrecognized(token))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::MockSortActuator;
    use crate::testing::{ScriptedLink, ScriptedTransport};
    use chrono::Utc;
    use halo_protocol::Label;

    fn event() -> PresenceEvent {
        PresenceEvent {
            detected_at: Utc::now(),
        }
    }

    fn client(
        transport: ScriptedTransport,
        actuator: MockSortActuator,
        link: ScriptedLink,
    ) -> TriggerClient<ScriptedTransport, MockSortActuator, ScriptedLink> {
        TriggerClient::new(
            transport,
            actuator,
            ConnectivityManager::new(link, 3, Duration::from_secs(1)),
            TokenTable::new(&[Label::Paper, Label::Plastic]),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_recognized_token_moves_servo() {
        let transport = ScriptedTransport::new();
        transport.reply(200, "Servo_plastic");

        let mut actuator = MockSortActuator::new();
        actuator
            .expect_move_to_bin()
            .withf(|bin| *bin == 1)
            .times(1)
            .returning(|_| Ok(()));

        let mut client = client(transport.clone(), actuator, ScriptedLink::up());
        assert_eq!(
            client.on_presence(event()).await,
            TriggerOutcome::Actuated { bin: 1 }
        );
        assert_eq!(transport.trigger_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_drops_without_request() {
        let transport = ScriptedTransport::new();
        let mut actuator = MockSortActuator::new();
        actuator.expect_move_to_bin().times(0);

        let mut client = client(transport.clone(), actuator, ScriptedLink::down());
        assert_eq!(
            client.on_presence(event()).await,
            TriggerOutcome::Dropped(DropReason::Offline)
        );
        assert_eq!(transport.trigger_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_discarded() {
        let transport = ScriptedTransport::new();
        transport.delayed_reply(Duration::from_secs(60), 200, "Servo_paper");

        let mut actuator = MockSortActuator::new();
        actuator.expect_move_to_bin().times(0);

        let mut client = client(transport.clone(), actuator, ScriptedLink::up());
        assert_eq!(
            client.on_presence(event()).await,
            TriggerOutcome::Dropped(DropReason::Timeout)
        );

        // Let the would-be reply time elapse; nothing may actuate.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.trigger_count(), 1);
    }

    #[tokio::test]
    async fn test_network_error_is_not_retried() {
        let transport = ScriptedTransport::new();
        transport.fail("connection refused");

        let mut actuator = MockSortActuator::new();
        actuator.expect_move_to_bin().times(0);

        let mut client = client(transport.clone(), actuator, ScriptedLink::up());
        assert!(matches!(
            client.on_presence(event()).await,
            TriggerOutcome::Dropped(DropReason::Network(_))
        ));
        assert_eq!(transport.trigger_count(), 1);
    }

    #[tokio::test]
    async fn test_error_and_unknown_replies_do_not_actuate() {
        let transport = ScriptedTransport::new();
        transport.reply(500, r#"{"error": "Failed to capture frame 1."}"#);
        transport.reply(200, "Servo_metal");
        transport.reply(200, "Servo_glass");

        let mut actuator = MockSortActuator::new();
        actuator.expect_move_to_bin().times(0);

        let mut client = client(transport, actuator, ScriptedLink::up());
        assert_eq!(
            client.on_presence(event()).await,
            TriggerOutcome::Dropped(DropReason::ServerError(
                "Failed to capture frame 1.".to_string()
            ))
        );
        assert_eq!(
            client.on_presence(event()).await,
            TriggerOutcome::Dropped(DropReason::Unrecognized("Servo_metal".to_string()))
        );
        assert_eq!(
            client.on_presence(event()).await,
            TriggerOutcome::Dropped(DropReason::Unrecognized("Servo_glass".to_string()))
        );
    }

    #[tokio::test]
    async fn test_actuator_failure_is_reported() {
        let transport = ScriptedTransport::new();
        transport.reply(200, "Servo_paper");

        let mut actuator = MockSortActuator::new();
        actuator
            .expect_move_to_bin()
            .times(1)
            .returning(|bin| Err(crate::actuator::ActuatorError::InvalidChannel { bin, channels: 0 }));

        let mut client = client(transport, actuator, ScriptedLink::up());
        assert!(matches!(
            client.on_presence(event()).await,
            TriggerOutcome::Dropped(DropReason::ActuatorFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_preflight_reports_reachability() {
        let transport = ScriptedTransport::new();
        let client = client(transport.clone(), MockSortActuator::new(), ScriptedLink::up());
        assert!(client.preflight().await);

        transport.set_reachable(false);
        assert!(!client.preflight().await);
    }
}
