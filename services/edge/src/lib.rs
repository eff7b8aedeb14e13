//! HALO Edge - presence sensing and sorting actuation
//!
//! The edge node watches a PIR sensor over the drop chute. When an item
//! appears it asks the classification server what the item is and sweeps the
//! servo of the matching bin.
//!
//! # Architecture
//!
//! ```text
//! PIR ─▶ SensorMonitor ─▶ TriggerClient ──HTTP──▶ server
//!                              │  ▲
//!              ConnectivityManager│
//!                              ▼  │ Servo_<label>
//!                         ActuatorDriver ─▶ PWM servos
//! ```
//!
//! Hardware sits behind small traits ([`PresenceInput`], [`PwmOutput`],
//! [`NetworkLink`], [`TriggerTransport`]) with Linux sysfs/`nmcli` adapters in
//! [`hardware`] and scripted stand-ins in [`testing`].

pub mod actuator;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod hardware;
pub mod sensor;
pub mod testing;
pub mod transport;
pub mod trigger_client;

pub use actuator::{
    ActuatorDriver, ActuatorError, PwmOutput, ServoChannel, ServoState, SortActuator, SweepProfile,
};
pub use config::EdgeConfig;
pub use connectivity::{ConnectionState, ConnectivityManager, LinkError, NetworkLink};
pub use controller::{ControllerStats, EdgeController};
pub use sensor::{EdgeDetector, PresenceEvent, PresenceInput, SensorError, SensorMonitor};
pub use transport::{HttpResponse, ReqwestTransport, TransportError, TriggerTransport};
pub use trigger_client::{DropReason, TriggerClient, TriggerOutcome};
