//! Enumeration types for the traffic light conductor.

use core::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Lamps
// ---------------------------------------------------------------------------

/// One lamp of a three-aspect signal head.
///
/// The discriminant order is the position of the lamp's level inside an
/// [`OutputState`](crate::OutputState): red first, green last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lamp {
    /// Stop.
    Red,
    /// Prepare to stop, or prepare to go when shown with red.
    Yellow,
    /// Go.
    Green,
}

impl Lamp {
    /// All lamps in output order.
    pub const ALL: [Self; 3] = [Self::Red, Self::Yellow, Self::Green];

    /// Position of this lamp's level within an output state.
    pub const fn index(self) -> usize {
        match self {
            Self::Red => 0,
            Self::Yellow => 1,
            Self::Green => 2,
        }
    }

    /// Lamp at the given output position, if any.
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Red),
            1 => Some(Self::Yellow),
            2 => Some(Self::Green),
            _ => None,
        }
    }

    /// Single-character symbol used when rendering a lit lamp.
    pub const fn symbol(self) -> char {
        match self {
            Self::Red => 'R',
            Self::Yellow => 'Y',
            Self::Green => 'G',
        }
    }
}

// ---------------------------------------------------------------------------
// Pairing roles
// ---------------------------------------------------------------------------

/// Role of a signal unit within a crossing pair.
///
/// Both units of a pair run the same program; the role selects the start
/// phase so that the primary road shows green while the cross road shows
/// red.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The main road of the crossing.
    Primary,
    /// The cross road, running the complementary phase.
    Secondary,
}

impl Role {
    /// The complementary role.
    pub const fn other(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary => f.write_str("secondary"),
        }
    }
}

// ---------------------------------------------------------------------------
// Program variants
// ---------------------------------------------------------------------------

/// Identifier of a program in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramVariant {
    /// Lamp self-test run at startup and between operating cycles.
    Initialization,
    /// Out-of-order pattern: all heads blink yellow.
    Noop,
    /// Normal operation; the payload indexes the catalog's normal programs.
    Normal(usize),
}

impl fmt::Display for ProgramVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialization => f.write_str("initialization"),
            Self::Noop => f.write_str("noop"),
            Self::Normal(index) => write!(f, "normal-{index}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lamp_index_roundtrip() {
        for lamp in Lamp::ALL {
            assert_eq!(Lamp::from_index(lamp.index()), Some(lamp));
        }
        assert_eq!(Lamp::from_index(3), None);
    }

    #[test]
    fn variant_serde_names() {
        let json = serde_json::to_string(&ProgramVariant::Normal(2));
        assert_eq!(json.ok().as_deref(), Some(r#"{"normal":2}"#));
        let noop: Result<ProgramVariant, _> = serde_json::from_str(r#""noop""#);
        assert_eq!(noop.ok(), Some(ProgramVariant::Noop));
    }

    #[test]
    fn role_display() {
        assert_eq!(Role::Primary.to_string(), "primary");
        assert_eq!(Role::Secondary.other().to_string(), "primary");
    }
}
