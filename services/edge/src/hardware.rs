//! Linux adapters for the edge hardware.
//!
//! - [`SysfsGpioInput`]: PIR sensor on a sysfs GPIO line
//! - [`SysfsPwm`]: servo on a sysfs PWM channel
//! - [`WifiLink`]: interface status from sysfs, joins through `nmcli`

use crate::actuator::{ActuatorError, PwmOutput};
use crate::connectivity::{LinkError, NetworkLink};
use crate::sensor::{PresenceInput, SensorError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

/// Full scale of the 16-bit duty model.
const DUTY_FULL_SCALE: u64 = u16::MAX as u64;

/// PIR sensor on a sysfs GPIO line.
pub struct SysfsGpioInput {
    value_path: PathBuf,
}

impl SysfsGpioInput {
    /// Export `pin` (if needed) and configure it as an input.
    pub async fn open(root: impl AsRef<Path>, pin: u32) -> Result<Self, SensorError> {
        let root = root.as_ref();
        let line = root.join(format!("gpio{}", pin));

        if fs::metadata(&line).await.is_err() {
            debug!(pin = pin, "Exporting GPIO line");
            fs::write(root.join("export"), pin.to_string()).await?;
        }
        fs::write(line.join("direction"), "in").await?;

        info!(pin = pin, "Presence sensor ready");
        Ok(Self {
            value_path: line.join("value"),
        })
    }
}

#[async_trait]
impl PresenceInput for SysfsGpioInput {
    async fn read(&mut self) -> Result<bool, SensorError> {
        let raw = fs::read_to_string(&self.value_path).await?;
        match raw.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(SensorError::InvalidData(other.to_string())),
        }
    }
}

/// Servo on a sysfs PWM channel.
pub struct SysfsPwm {
    duty_path: PathBuf,
    period_ns: u64,
}

impl SysfsPwm {
    /// Export `channel` on `chip` (if needed), set the period and enable it.
    pub async fn open(
        chip: impl AsRef<Path>,
        channel: u32,
        period_ns: u64,
    ) -> Result<Self, ActuatorError> {
        let chip = chip.as_ref();
        let dir = chip.join(format!("pwm{}", channel));

        if fs::metadata(&dir).await.is_err() {
            debug!(channel = channel, "Exporting PWM channel");
            fs::write(chip.join("export"), channel.to_string()).await?;
        }
        fs::write(dir.join("period"), period_ns.to_string()).await?;
        fs::write(dir.join("enable"), "1").await?;

        info!(channel = channel, period_ns = period_ns, "PWM channel ready");
        Ok(Self {
            duty_path: dir.join("duty_cycle"),
            period_ns,
        })
    }

    /// Convert a 16-bit duty value to nanoseconds of the period.
    pub fn duty_to_ns(duty: u16, period_ns: u64) -> u64 {
        duty as u64 * period_ns / DUTY_FULL_SCALE
    }
}

#[async_trait]
impl PwmOutput for SysfsPwm {
    async fn set_duty_u16(&mut self, duty: u16) -> Result<(), ActuatorError> {
        let ns = Self::duty_to_ns(duty, self.period_ns);
        fs::write(&self.duty_path, ns.to_string()).await?;
        Ok(())
    }
}

/// Wi-Fi link managed through NetworkManager.
pub struct WifiLink {
    interface: String,
    ssid: Option<String>,
    password: Option<String>,
    operstate_path: PathBuf,
}

impl WifiLink {
    pub fn new(interface: impl Into<String>, ssid: Option<String>, password: Option<String>) -> Self {
        let interface = interface.into();
        let operstate_path = PathBuf::from(format!("/sys/class/net/{}/operstate", interface));
        Self {
            interface,
            ssid,
            password,
            operstate_path,
        }
    }
}

#[async_trait]
impl NetworkLink for WifiLink {
    async fn is_up(&self) -> bool {
        match fs::read_to_string(&self.operstate_path).await {
            Ok(state) => state.trim() == "up",
            Err(_) => false,
        }
    }

    async fn join(&self) -> Result<(), LinkError> {
        // Without an SSID the link is managed outside this process.
        let Some(ssid) = &self.ssid else {
            return Ok(());
        };

        let mut command = Command::new("nmcli");
        command.args(["device", "wifi", "connect", ssid]);
        if let Some(password) = &self.password {
            command.args(["password", password]);
        }
        command.args(["ifname", &self.interface]);

        let output = command.output().await?;
        if output.status.success() {
            debug!(ssid = %ssid, interface = %self.interface, "Join request accepted");
            Ok(())
        } else {
            Err(LinkError::JoinFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scratch directory standing in for a sysfs class directory.
    struct SysfsDir(PathBuf);

    impl SysfsDir {
        fn new(kind: &str) -> Self {
            let path = std::env::temp_dir().join(format!("halo-{}-{}", kind, uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&path).unwrap();
            Self(path)
        }

        fn read(&self, relative: &str) -> String {
            std::fs::read_to_string(self.0.join(relative)).unwrap()
        }
    }

    impl Drop for SysfsDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[tokio::test]
    async fn test_gpio_exports_missing_line() {
        let root = SysfsDir::new("gpio");

        // Nothing creates gpio17 after the export here, so configuring it fails.
        let result = SysfsGpioInput::open(&root.0, 17).await;

        assert!(matches!(result, Err(SensorError::Io(_))));
        assert_eq!(root.read("export"), "17");
    }

    #[tokio::test]
    async fn test_gpio_reads_exported_line() {
        let root = SysfsDir::new("gpio");
        std::fs::create_dir_all(root.0.join("gpio17")).unwrap();

        let mut input = SysfsGpioInput::open(&root.0, 17).await.unwrap();
        assert_eq!(root.read("gpio17/direction"), "in");
        assert!(!root.0.join("export").exists());

        std::fs::write(root.0.join("gpio17/value"), "1\n").unwrap();
        assert!(input.read().await.unwrap());

        std::fs::write(root.0.join("gpio17/value"), "0\n").unwrap();
        assert!(!input.read().await.unwrap());

        std::fs::write(root.0.join("gpio17/value"), "x\n").unwrap();
        assert!(matches!(input.read().await, Err(SensorError::InvalidData(v)) if v == "x"));
    }

    #[tokio::test]
    async fn test_pwm_exports_missing_channel() {
        let chip = SysfsDir::new("pwm");

        let result = SysfsPwm::open(&chip.0, 1, 20_000_000).await;

        assert!(matches!(result, Err(ActuatorError::Io(_))));
        assert_eq!(chip.read("export"), "1");
    }

    #[tokio::test]
    async fn test_pwm_configures_and_scales_duty() {
        let chip = SysfsDir::new("pwm");
        std::fs::create_dir_all(chip.0.join("pwm0")).unwrap();

        let mut pwm = SysfsPwm::open(&chip.0, 0, 20_000_000).await.unwrap();
        assert_eq!(chip.read("pwm0/period"), "20000000");
        assert_eq!(chip.read("pwm0/enable"), "1");

        pwm.set_duty_u16(8192).await.unwrap();
        assert_eq!(chip.read("pwm0/duty_cycle"), "2500038");
    }

    #[test]
    fn test_duty_scaling_at_50hz() {
        // ~0.5 ms and ~2.5 ms pulses in a 20 ms period.
        assert_eq!(SysfsPwm::duty_to_ns(1638, 20_000_000), 499_885);
        assert_eq!(SysfsPwm::duty_to_ns(8192, 20_000_000), 2_500_038);
        assert_eq!(SysfsPwm::duty_to_ns(u16::MAX, 20_000_000), 20_000_000);
    }

    #[tokio::test]
    async fn test_missing_interface_is_down() {
        let link = WifiLink::new("halo-test-missing0", None, None);
        assert!(!link.is_up().await);
        assert!(link.join().await.is_ok());
    }
}
