//! HALO Protocol - shared wire contract for the HALO waste sorter
//!
//! The edge node and the classification server talk over a deliberately small
//! HTTP contract:
//!
//! - edge → server: `POST /run` with `{"value": 1}`
//! - server → edge: the plain text token `Servo_<label>` on success, or
//!   `{"error": "..."}` with a 4xx/5xx status on failure
//!
//! This crate owns everything both sides must agree on:
//!
//! - The classification labels and the tables mapping them to model output
//!   indices, sorting bins and reply tokens
//! - Request parsing/validation and reply decoding, so neither side ever
//!   pattern-matches raw strings past the boundary
//! - [`Pause`], the cancellable timed wait used for every hardware delay
//!
//! # Example
//!
//! ```rust
//! use halo_protocol::{Label, Reply, TokenTable};
//!
//! let table = TokenTable::new(&[Label::Paper, Label::Plastic]);
//! let reply = Reply::decode(200, &Label::Paper.token(), &table);
//! assert_eq!(reply, Reply::Recognized(Label::Paper.command()));
//! ```

pub mod error;
pub mod label;
pub mod timing;
pub mod wire;

pub use error::ProtocolError;
pub use label::{ActuationCommand, BinIndex, Label, TOKEN_PREFIX};
pub use timing::{Interrupted, Pause};
pub use wire::{
    ClassificationRequest, ErrorBody, Reply, TokenTable, INVALID_VALUE_MESSAGE, TRIGGER_VALUE,
};
