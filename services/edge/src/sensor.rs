//! Presence sensing with rising-edge detection.
//!
//! The PIR sensor stays high for as long as an item is in view, so the raw
//! reading is polled on a fixed cadence and only a low → high transition
//! produces a [`PresenceEvent`]. One physical presence yields one trigger no
//! matter how many polls it spans.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use halo_protocol::Pause;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Errors that can occur while reading the presence sensor.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Sensor read failed: {0}")]
    ReadFailed(String),

    #[error("Sensor returned invalid data: {0}")]
    InvalidData(String),

    #[error("Sensor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A detected item, emitted on a rising edge of the sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEvent {
    pub detected_at: DateTime<Utc>,
}

/// A binary presence input (PIR sensor line, mock).
#[async_trait]
pub trait PresenceInput: Send {
    /// Read the current level: `true` when something is in view.
    async fn read(&mut self) -> Result<bool, SensorError>;
}

/// Rising-edge detector over a sequence of raw readings.
///
/// Starts low, so a high first reading after a restart counts as a fresh
/// edge.
#[derive(Debug, Default, Clone)]
pub struct EdgeDetector {
    previous: bool,
}

impl EdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one reading; returns `true` on a low → high transition.
    pub fn observe(&mut self, reading: bool) -> bool {
        let rising = reading && !self.previous;
        self.previous = reading;
        rising
    }
}

/// Polls a [`PresenceInput`] and emits one event per presence.
pub struct SensorMonitor<I> {
    input: I,
    detector: EdgeDetector,
    poll_interval: Duration,
}

impl<I: PresenceInput> SensorMonitor<I> {
    pub fn new(input: I, poll_interval: Duration) -> Self {
        Self {
            input,
            detector: EdgeDetector::new(),
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Take one reading.
    ///
    /// A failed read leaves the edge state untouched, so a presence that
    /// spans a read error is not reported twice.
    pub async fn poll(&mut self) -> Result<Option<PresenceEvent>, SensorError> {
        let reading = self.input.read().await?;
        trace!(reading = reading, "Presence sensor polled");

        if self.detector.observe(reading) {
            let event = PresenceEvent {
                detected_at: Utc::now(),
            };
            debug!(detected_at = %event.detected_at, "Presence detected");
            Ok(Some(event))
        } else {
            Ok(None)
        }
    }

    /// Turn the monitor into an endless stream of presence events.
    ///
    /// The first poll happens immediately; every later poll waits one cadence
    /// after the consumer asks for the next item, so time spent handling an
    /// event is not counted against the cadence. The stream ends when `pause`
    /// is cancelled.
    pub fn into_events(self, pause: Pause) -> impl Stream<Item = Result<PresenceEvent, SensorError>> {
        futures::stream::unfold((self, pause, false), |(mut monitor, pause, started)| async move {
            let mut started = started;
            loop {
                if started && pause.wait(monitor.poll_interval).await.is_err() {
                    debug!("Presence polling cancelled");
                    return None;
                }
                started = true;

                match monitor.poll().await {
                    Ok(Some(event)) => return Some((Ok(event), (monitor, pause, started))),
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "Presence sensor read failed");
                        return Some((Err(e), (monitor, pause, started)));
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedPresence;
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    /// Number of maximal runs of `true` in a reading sequence.
    fn count_runs(readings: &[bool]) -> usize {
        readings
            .iter()
            .enumerate()
            .filter(|&(i, &r)| r && (i == 0 || !readings[i - 1]))
            .count()
    }

    #[test]
    fn test_one_event_per_run_for_every_sequence() {
        // Exhaustive over every reading sequence up to 12 polls.
        for len in 0..=12u32 {
            for bits in 0u32..(1 << len) {
                let readings: Vec<bool> = (0..len).map(|i| bits & (1 << i) != 0).collect();

                let mut detector = EdgeDetector::new();
                let events = readings.iter().filter(|&&r| detector.observe(r)).count();

                assert_eq!(events, count_runs(&readings), "readings: {:?}", readings);
            }
        }
    }

    #[test]
    fn test_long_presence_triggers_once() {
        let mut detector = EdgeDetector::new();
        let events = std::iter::repeat(true)
            .take(1000)
            .filter(|&r| detector.observe(r))
            .count();
        assert_eq!(events, 1);
    }

    #[test]
    fn test_restart_mid_presence_is_a_fresh_edge() {
        let mut before = EdgeDetector::new();
        assert!(before.observe(true));
        assert!(!before.observe(true));

        // No state survives a restart.
        let mut after = EdgeDetector::new();
        assert!(after.observe(true));
    }

    #[tokio::test]
    async fn test_poll_reports_rising_edges() {
        let input = ScriptedPresence::new([false, true, true, false, true]);
        let mut monitor = SensorMonitor::new(input, Duration::from_millis(10));

        let mut events = Vec::new();
        for _ in 0..5 {
            events.push(monitor.poll().await.unwrap().is_some());
        }
        assert_eq!(events, vec![false, true, false, false, true]);
    }

    #[tokio::test]
    async fn test_read_error_keeps_edge_state() {
        let input = ScriptedPresence::with_results(vec![
            Ok(true),
            Err(SensorError::ReadFailed("glitch".to_string())),
            Ok(true),
        ]);
        let mut monitor = SensorMonitor::new(input, Duration::from_millis(10));

        assert!(monitor.poll().await.unwrap().is_some());
        assert!(monitor.poll().await.is_err());
        assert!(monitor.poll().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_stream_paces_polls() {
        let input = ScriptedPresence::new([false, false, true, true, false, true]);
        let reads = input.read_count();
        let monitor = SensorMonitor::new(input, Duration::from_secs(2));

        let token = CancellationToken::new();
        let events = monitor.into_events(Pause::with_token(token.clone()));
        futures::pin_mut!(events);

        let start = tokio::time::Instant::now();
        assert!(events.next().await.unwrap().is_ok());
        // Third reading, two cadences in.
        assert_eq!(start.elapsed(), Duration::from_secs(4));

        assert!(events.next().await.unwrap().is_ok());
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(reads.load(std::sync::atomic::Ordering::SeqCst), 6);

        token.cancel();
        assert!(events.next().await.is_none());
    }
}
