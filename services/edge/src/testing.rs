//! Scripted stand-ins for the edge hardware and the server link.
//!
//! These let the sensing, connectivity and trigger logic run in tests (and
//! in the end-to-end suite) without GPIO, PWM or a Wi-Fi interface.

use crate::actuator::{ActuatorError, PwmOutput};
use crate::connectivity::{LinkError, NetworkLink};
use crate::sensor::{PresenceInput, SensorError};
use crate::transport::{HttpResponse, TransportError, TriggerTransport};
use async_trait::async_trait;
use halo_protocol::ClassificationRequest;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Presence input replaying a fixed script, then reading low forever.
pub struct ScriptedPresence {
    script: VecDeque<Result<bool, SensorError>>,
    reads: Arc<AtomicUsize>,
}

impl ScriptedPresence {
    pub fn new(readings: impl IntoIterator<Item = bool>) -> Self {
        Self::with_results(readings.into_iter().map(Ok).collect())
    }

    pub fn with_results(script: Vec<Result<bool, SensorError>>) -> Self {
        Self {
            script: script.into(),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of reads taken so far.
    pub fn read_count(&self) -> Arc<AtomicUsize> {
        self.reads.clone()
    }
}

#[async_trait]
impl PresenceInput for ScriptedPresence {
    async fn read(&mut self) -> Result<bool, SensorError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.script.pop_front().unwrap_or(Ok(false))
    }
}

/// PWM output that records every duty cycle written to it.
#[derive(Clone, Default)]
pub struct RecordingPwm {
    writes: Arc<Mutex<Vec<u16>>>,
    fail_after: Option<usize>,
}

impl RecordingPwm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output whose writes start failing after `writes` successful ones.
    pub fn failing_after(writes: usize) -> Self {
        Self {
            writes: Arc::default(),
            fail_after: Some(writes),
        }
    }

    pub fn writes(&self) -> Vec<u16> {
        self.writes.lock().clone()
    }

    /// Number of complete sweeps (returns to the lowest written duty).
    pub fn sweep_count(&self) -> usize {
        let writes = self.writes.lock();
        let Some(&rest) = writes.iter().min() else {
            return 0;
        };
        writes
            .windows(2)
            .filter(|w| w[1] == rest && w[0] != rest)
            .count()
    }
}

#[async_trait]
impl PwmOutput for RecordingPwm {
    async fn set_duty_u16(&mut self, duty: u16) -> Result<(), ActuatorError> {
        let mut writes = self.writes.lock();
        if self.fail_after.is_some_and(|limit| writes.len() >= limit) {
            return Err(ActuatorError::Hardware("PWM write rejected".to_string()));
        }
        writes.push(duty);
        Ok(())
    }
}

/// Network link whose status is set by the test.
#[derive(Clone)]
pub struct ScriptedLink {
    up: Arc<AtomicBool>,
    down_checks: Arc<AtomicUsize>,
    joins: Arc<AtomicUsize>,
}

impl ScriptedLink {
    pub fn up() -> Self {
        Self::build(true, 0)
    }

    pub fn down() -> Self {
        Self::build(false, 0)
    }

    /// Link that reports down for the first `checks` status checks.
    pub fn up_after(checks: usize) -> Self {
        Self::build(true, checks)
    }

    fn build(up: bool, down_checks: usize) -> Self {
        Self {
            up: Arc::new(AtomicBool::new(up)),
            down_checks: Arc::new(AtomicUsize::new(down_checks)),
            joins: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn join_count(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkLink for ScriptedLink {
    async fn is_up(&self) -> bool {
        let pending = self
            .down_checks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return false;
        }
        self.up.load(Ordering::SeqCst)
    }

    async fn join(&self) -> Result<(), LinkError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

enum ScriptedReply {
    Response {
        delay: Duration,
        response: HttpResponse,
    },
    Failure(String),
}

/// Transport replaying queued replies in FIFO order.
#[derive(Clone)]
pub struct ScriptedTransport {
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
    triggers: Arc<AtomicUsize>,
    reachable: Arc<AtomicBool>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            replies: Arc::default(),
            triggers: Arc::new(AtomicUsize::new(0)),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn reply(&self, status: u16, body: &str) {
        self.delayed_reply(Duration::ZERO, status, body);
    }

    pub fn delayed_reply(&self, delay: Duration, status: u16, body: &str) {
        self.replies.lock().push_back(ScriptedReply::Response {
            delay,
            response: HttpResponse {
                status,
                body: body.to_string(),
            },
        });
    }

    pub fn fail(&self, message: &str) {
        self.replies
            .lock()
            .push_back(ScriptedReply::Failure(message.to_string()));
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TriggerTransport for ScriptedTransport {
    async fn probe(&self) -> Result<HttpResponse, TransportError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(HttpResponse {
                status: 200,
                body: "ok".to_string(),
            })
        } else {
            Err(TransportError::Unreachable("probe refused".to_string()))
        }
    }

    async fn send_trigger(
        &self,
        _request: &ClassificationRequest,
    ) -> Result<HttpResponse, TransportError> {
        self.triggers.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().pop_front();

        match reply {
            Some(ScriptedReply::Response { delay, response }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(response)
            }
            Some(ScriptedReply::Failure(message)) => Err(TransportError::Unreachable(message)),
            None => Err(TransportError::Unreachable("no scripted reply".to_string())),
        }
    }
}
