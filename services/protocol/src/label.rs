//! Classification labels and the sorting tables derived from them.
//!
//! Three tables hang off [`Label`] and all of them are total over
//! [`Label::ALL`]:
//!
//! | label   | model index | bin | token           |
//! |---------|-------------|-----|-----------------|
//! | metal   | 0           | 2   | `Servo_metal`   |
//! | paper   | 1           | 0   | `Servo_paper`   |
//! | plastic | 2           | 1   | `Servo_plastic` |

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of every actuation reply token.
pub const TOKEN_PREFIX: &str = "Servo_";

/// Index of an actuator channel (one channel per sorting bin).
pub type BinIndex = usize;

/// Waste category produced by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Metal,
    Paper,
    Plastic,
}

impl Label {
    /// Every label, in model output order.
    pub const ALL: [Label; 3] = [Label::Metal, Label::Paper, Label::Plastic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Metal => "metal",
            Label::Paper => "paper",
            Label::Plastic => "plastic",
        }
    }

    /// Position of this label in the classifier's probability vector.
    pub fn model_index(self) -> usize {
        match self {
            Label::Metal => 0,
            Label::Paper => 1,
            Label::Plastic => 2,
        }
    }

    /// Label for a classifier output position.
    pub fn from_model_index(index: usize) -> Option<Label> {
        Label::ALL.into_iter().find(|l| l.model_index() == index)
    }

    /// Sorting bin (actuator channel) this label is routed to.
    pub fn bin_index(self) -> BinIndex {
        match self {
            Label::Paper => 0,
            Label::Plastic => 1,
            Label::Metal => 2,
        }
    }

    /// Label routed to a given bin.
    pub fn from_bin_index(bin: BinIndex) -> Option<Label> {
        Label::ALL.into_iter().find(|l| l.bin_index() == bin)
    }

    /// Reply token sent to the edge node, e.g. `Servo_paper`.
    pub fn token(self) -> String {
        format!("{}{}", TOKEN_PREFIX, self.as_str())
    }

    /// Parse a reply token back into its label.
    pub fn from_token(token: &str) -> Option<Label> {
        token
            .strip_prefix(TOKEN_PREFIX)
            .and_then(|name| name.parse().ok())
    }

    /// Actuation command for this label.
    pub fn command(self) -> ActuationCommand {
        ActuationCommand {
            bin_index: self.bin_index(),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metal" => Ok(Label::Metal),
            "paper" => Ok(Label::Paper),
            "plastic" => Ok(Label::Plastic),
            other => Err(ProtocolError::UnknownLabel(other.to_string())),
        }
    }
}

/// Instruction for the edge actuator to sort into one bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActuationCommand {
    pub bin_index: BinIndex,
}
