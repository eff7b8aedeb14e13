//! Servo actuation for the sorting flaps.
//!
//! Each bin has one servo on its own PWM channel. Sorting an item is a
//! two-phase sweep: step the duty cycle from rest up to the midpoint, hold,
//! then step back down to rest. Motion is open loop; nothing reads the
//! physical position back.

use crate::config::ActuatorConfig;
use async_trait::async_trait;
use halo_protocol::{BinIndex, Interrupted, Pause};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors that can occur while driving a servo.
#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("Invalid servo channel {bin}: {channels} channels configured")]
    InvalidChannel { bin: BinIndex, channels: usize },

    #[error("PWM hardware error: {0}")]
    Hardware(String),

    #[error("PWM I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sweep interrupted")]
    Interrupted(#[from] Interrupted),
}

/// A PWM output driven with a 16-bit duty cycle.
#[async_trait]
pub trait PwmOutput: Send {
    async fn set_duty_u16(&mut self, duty: u16) -> Result<(), ActuatorError>;
}

/// Anything that can sort an item into a bin.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SortActuator: Send {
    async fn move_to_bin(&mut self, bin: BinIndex) -> Result<(), ActuatorError>;
}

/// Digital model of one servo's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServoState {
    current_duty: u16,
    low: u16,
    high: u16,
}

impl ServoState {
    pub fn new(low: u16, high: u16) -> Self {
        Self {
            current_duty: low,
            low,
            high,
        }
    }

    pub fn current_duty(&self) -> u16 {
        self.current_duty
    }

    pub fn bounds(&self) -> (u16, u16) {
        (self.low, self.high)
    }

    fn clamp(&self, duty: u16) -> u16 {
        duty.clamp(self.low, self.high)
    }
}

/// Timing and shape of one sort sweep.
#[derive(Debug, Clone)]
pub struct SweepProfile {
    pub low: u16,
    pub high: u16,
    pub step: u16,
    pub step_delay: Duration,
    pub hold: Duration,
    pub settle: Duration,
}

impl From<&ActuatorConfig> for SweepProfile {
    fn from(config: &ActuatorConfig) -> Self {
        Self {
            low: config.duty_low,
            high: config.duty_high,
            step: config.step.max(1),
            step_delay: Duration::from_millis(config.step_delay_ms),
            hold: Duration::from_millis(config.hold_ms),
            settle: Duration::from_millis(config.settle_ms),
        }
    }
}

impl SweepProfile {
    /// Duty cycle of the resting position.
    pub fn rest(&self) -> u16 {
        self.low
    }

    /// Duty cycle halfway between the bounds (90°).
    pub fn midpoint(&self) -> u16 {
        ((self.low as u32 + self.high as u32) / 2) as u16
    }

    /// Step size actually used; a zero step moves one unit at a time.
    fn stride(&self) -> usize {
        self.step.max(1) as usize
    }

    /// Duty cycles written on the way out: rest, rest + step, ... below midpoint.
    pub fn forward_steps(&self) -> Vec<u16> {
        (self.low..self.midpoint()).step_by(self.stride()).collect()
    }

    /// Duty cycles written on the way back: midpoint, midpoint - step, ... above rest.
    pub fn return_steps(&self) -> Vec<u16> {
        (self.low + 1..=self.midpoint())
            .rev()
            .step_by(self.stride())
            .collect()
    }

    /// Worst-case duration of one sweep.
    pub fn duration(&self) -> Duration {
        let steps = (self.forward_steps().len() + self.return_steps().len()) as u32;
        self.step_delay * steps + self.hold + self.settle
    }
}

/// One servo and its PWM output.
pub struct ServoChannel {
    name: String,
    output: Box<dyn PwmOutput>,
    state: ServoState,
}

impl ServoChannel {
    pub fn new(name: impl Into<String>, output: Box<dyn PwmOutput>, profile: &SweepProfile) -> Self {
        Self {
            name: name.into(),
            output,
            state: ServoState::new(profile.low, profile.high),
        }
    }

    pub fn state(&self) -> ServoState {
        self.state
    }

    async fn drive(&mut self, duty: u16) -> Result<(), ActuatorError> {
        let duty = self.state.clamp(duty);
        self.output.set_duty_u16(duty).await?;
        self.state.current_duty = duty;
        Ok(())
    }
}

/// Drives one servo per bin through the sort sweep.
pub struct ActuatorDriver {
    channels: Vec<ServoChannel>,
    profile: SweepProfile,
    pause: Pause,
}

impl ActuatorDriver {
    pub fn new(channels: Vec<ServoChannel>, profile: SweepProfile) -> Self {
        Self {
            channels,
            profile,
            pause: Pause::new(),
        }
    }

    /// Bind the sweep's timed waits to a cancellation token.
    pub fn with_pause(mut self, pause: Pause) -> Self {
        self.pause = pause;
        self
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn servo_state(&self, bin: BinIndex) -> Option<ServoState> {
        self.channels.get(bin).map(ServoChannel::state)
    }

    /// Sweep the servo for `bin` out to the midpoint and back to rest.
    #[instrument(skip(self))]
    pub async fn move_to_bin(&mut self, bin: BinIndex) -> Result<(), ActuatorError> {
        let channels = self.channels.len();
        let profile = self.profile.clone();
        let pause = self.pause.clone();
        let channel = self
            .channels
            .get_mut(bin)
            .ok_or(ActuatorError::InvalidChannel { bin, channels })?;

        info!(servo = %channel.name, target = profile.midpoint(), "Moving servo to midpoint");
        for duty in profile.forward_steps() {
            channel.drive(duty).await?;
            pause.wait(profile.step_delay).await?;
        }
        pause.wait(profile.hold).await?;

        info!(servo = %channel.name, target = profile.rest(), "Returning servo to rest");
        for duty in profile.return_steps() {
            channel.drive(duty).await?;
            pause.wait(profile.step_delay).await?;
        }
        channel.drive(profile.rest()).await?;
        pause.wait(profile.settle).await?;

        debug!(servo = %channel.name, duty = channel.state.current_duty, "Servo movement complete");
        Ok(())
    }
}

#[async_trait]
impl SortActuator for ActuatorDriver {
    async fn move_to_bin(&mut self, bin: BinIndex) -> Result<(), ActuatorError> {
        ActuatorDriver::move_to_bin(self, bin).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPwm;

    fn test_profile() -> SweepProfile {
        SweepProfile {
            low: 1638,
            high: 8192,
            step: 100,
            step_delay: Duration::from_millis(20),
            hold: Duration::from_secs(2),
            settle: Duration::from_secs(2),
        }
    }

    fn driver_with(outputs: &[RecordingPwm]) -> ActuatorDriver {
        let profile = test_profile();
        let channels = outputs
            .iter()
            .enumerate()
            .map(|(i, pwm)| ServoChannel::new(format!("servo-{}", i), Box::new(pwm.clone()), &profile))
            .collect();
        ActuatorDriver::new(channels, profile)
    }

    #[test]
    fn test_sweep_shape() {
        let profile = test_profile();
        assert_eq!(profile.midpoint(), 4915);

        let forward = profile.forward_steps();
        assert_eq!(forward.first(), Some(&1638));
        assert!(forward.windows(2).all(|w| w[1] - w[0] == 100));
        assert!(forward.iter().all(|&d| d < profile.midpoint()));

        let back = profile.return_steps();
        assert_eq!(back.first(), Some(&4915));
        assert!(back.windows(2).all(|w| w[0] - w[1] == 100));
        assert!(back.iter().all(|&d| d > profile.rest()));
    }

    #[test]
    fn test_zero_step_moves_one_unit_at_a_time() {
        let profile = SweepProfile {
            low: 100,
            high: 110,
            step: 0,
            ..test_profile()
        };

        assert_eq!(profile.forward_steps(), vec![100, 101, 102, 103, 104]);
        assert_eq!(profile.return_steps(), vec![105, 104, 103, 102, 101]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_to_bin_sweeps_only_that_channel() {
        let outputs = [RecordingPwm::new(), RecordingPwm::new(), RecordingPwm::new()];
        let mut driver = driver_with(&outputs);

        let start = tokio::time::Instant::now();
        driver.move_to_bin(1).await.unwrap();

        assert!(outputs[0].writes().is_empty());
        assert!(outputs[2].writes().is_empty());

        let writes = outputs[1].writes();
        let profile = test_profile();
        assert_eq!(
            writes.len(),
            profile.forward_steps().len() + profile.return_steps().len() + 1
        );
        assert_eq!(writes.iter().max(), Some(&profile.midpoint()));
        assert_eq!(writes.last(), Some(&profile.rest()));
        assert_eq!(driver.servo_state(1).unwrap().current_duty(), profile.rest());
        assert_eq!(start.elapsed(), profile.duration());
    }

    #[tokio::test]
    async fn test_out_of_range_bin_is_rejected_without_motion() {
        let outputs = [RecordingPwm::new(), RecordingPwm::new()];
        let mut driver = driver_with(&outputs);
        assert_eq!(driver.channel_count(), 2);

        let result = driver.move_to_bin(2).await;
        assert!(matches!(
            result,
            Err(ActuatorError::InvalidChannel { bin: 2, channels: 2 })
        ));
        assert!(outputs.iter().all(|pwm| pwm.writes().is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hardware_failure_aborts_sweep() {
        let pwm = RecordingPwm::failing_after(3);
        let mut driver = driver_with(&[pwm.clone()]);

        let result = driver.move_to_bin(0).await;
        assert!(matches!(result, Err(ActuatorError::Hardware(_))));
        assert_eq!(pwm.writes().len(), 3);
    }

    #[test]
    fn test_servo_state_clamps_to_bounds() {
        let state = ServoState::new(1638, 8192);
        assert_eq!(state.clamp(100), 1638);
        assert_eq!(state.clamp(9000), 8192);
        assert_eq!(state.bounds(), (1638, 8192));
    }
}
