//! Common Types
//!
//! Identifiers shared by the RLC entities, the bearer multiplexer and the simulator

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical Channel Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Lcid(pub u8);

impl Lcid {
    /// Highest LCID usable by a radio bearer (SRB0..SRB2, DRB1..DRB8)
    pub const MAX: u8 = 10;

    /// Create a new LCID with validation
    pub fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Get the LCID value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Kind of radio bearer mapped on this channel
    pub fn bearer_type(&self) -> BearerType {
        if self.0 <= 2 {
            BearerType::Srb
        } else {
            BearerType::Drb
        }
    }

    /// Default bearer name, e.g. `SRB1` or `DRB1`
    pub fn rb_name(&self) -> String {
        match self.bearer_type() {
            BearerType::Srb => format!("SRB{}", self.0),
            BearerType::Drb => format!("DRB{}", self.0 - 2),
        }
    }
}

impl fmt::Display for Lcid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Radio bearer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum BearerType {
    /// Signalling radio bearer
    Srb = 0,
    /// Data radio bearer
    Drb = 1,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_lcid_validation() {
        assert!(Lcid::new(0).is_some());
        assert!(Lcid::new(10).is_some());
        assert!(Lcid::new(11).is_none());
    }

    #[test]
    fn test_rb_names() {
        assert_eq!(Lcid(1).rb_name(), "SRB1");
        assert_eq!(Lcid(3).rb_name(), "DRB1");
        assert_eq!(Lcid(10).rb_name(), "DRB8");
        assert_eq!(Lcid(2).bearer_type(), BearerType::Srb);
    }

    #[test]
    fn test_bearer_type_from_primitive() {
        assert_eq!(BearerType::from_u8(1), Some(BearerType::Drb));
        assert_eq!(BearerType::from_u8(2), None);
    }
}
