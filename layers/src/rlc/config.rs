//! RLC bearer configuration

use crate::LayerError;
use serde::{Deserialize, Serialize};

/// RLC operating modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RlcMode {
    /// Transparent Mode
    Tm,
    /// Unacknowledged Mode
    Um,
    /// Acknowledged Mode
    #[default]
    Am,
}

/// Acknowledged Mode parameters (TS 36.331 RLC-Config)
///
/// Timer values are in milliseconds. A negative `poll_pdu`/`poll_byte`
/// stands for "infinity".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlcAmConfig {
    /// Poll retransmission timer
    #[serde(default = "default_t_poll_retx")]
    pub t_poll_retx: u32,
    /// PDUs sent before a poll is requested
    #[serde(default = "default_poll_pdu")]
    pub poll_pdu: i32,
    /// Bytes sent before a poll is requested
    #[serde(default = "default_poll_byte")]
    pub poll_byte: i32,
    /// Retransmissions of one PDU before RRC is notified
    #[serde(default = "default_max_retx_thresh")]
    pub max_retx_thresh: u32,
    /// Reordering timer
    #[serde(default = "default_t_reordering")]
    pub t_reordering: u32,
    /// Status prohibit timer
    #[serde(default = "default_t_status_prohibit")]
    pub t_status_prohibit: u32,
}

fn default_t_poll_retx() -> u32 {
    5
}

fn default_poll_pdu() -> i32 {
    4
}

fn default_poll_byte() -> i32 {
    25
}

fn default_max_retx_thresh() -> u32 {
    4
}

fn default_t_reordering() -> u32 {
    5
}

fn default_t_status_prohibit() -> u32 {
    5
}

fn default_tx_queue_length() -> usize {
    128
}

impl Default for RlcAmConfig {
    fn default() -> Self {
        Self {
            t_poll_retx: default_t_poll_retx(),
            poll_pdu: default_poll_pdu(),
            poll_byte: default_poll_byte(),
            max_retx_thresh: default_max_retx_thresh(),
            t_reordering: default_t_reordering(),
            t_status_prohibit: default_t_status_prohibit(),
        }
    }
}

impl RlcAmConfig {
    /// Poll on PDU count enabled
    pub fn poll_pdu_enabled(&self) -> bool {
        self.poll_pdu > 0
    }

    /// Poll on byte count enabled
    pub fn poll_byte_enabled(&self) -> bool {
        self.poll_byte > 0
    }
}

/// RLC bearer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlcConfig {
    /// Operating mode
    #[serde(default)]
    pub mode: RlcMode,
    /// AM parameters
    #[serde(default)]
    pub am: RlcAmConfig,
    /// Capacity of the Tx SDU queue
    #[serde(default = "default_tx_queue_length")]
    pub tx_queue_length: usize,
}

impl Default for RlcConfig {
    fn default() -> Self {
        Self {
            mode: RlcMode::Am,
            am: RlcAmConfig::default(),
            tx_queue_length: default_tx_queue_length(),
        }
    }
}

impl RlcConfig {
    /// Default AM profile for signalling bearers
    pub fn srb() -> Self {
        Self {
            mode: RlcMode::Am,
            am: RlcAmConfig {
                t_poll_retx: 45,
                poll_pdu: -1,
                poll_byte: -1,
                max_retx_thresh: 4,
                t_reordering: 35,
                t_status_prohibit: 0,
            },
            tx_queue_length: default_tx_queue_length(),
        }
    }

    /// Check the parameters an AM entity relies on
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.mode != RlcMode::Am {
            return Err(LayerError::InvalidConfiguration(format!(
                "RLC mode {:?} not supported",
                self.mode
            )));
        }
        if self.tx_queue_length == 0 {
            return Err(LayerError::InvalidConfiguration(
                "tx_queue_length must be non-zero".to_string(),
            ));
        }
        if self.am.t_poll_retx == 0 || self.am.t_reordering == 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "t_poll_retx={} and t_reordering={} must be non-zero",
                self.am.t_poll_retx, self.am.t_reordering
            )));
        }
        if self.am.max_retx_thresh == 0 {
            return Err(LayerError::InvalidConfiguration(
                "max_retx_thresh must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RlcConfig::default();
        assert_eq!(cfg.mode, RlcMode::Am);
        assert_eq!(cfg.am.poll_pdu, 4);
        assert_eq!(cfg.am.poll_byte, 25);
        assert_eq!(cfg.tx_queue_length, 128);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_srb_profile_disables_polling_triggers() {
        let cfg = RlcConfig::srb();
        assert!(!cfg.am.poll_pdu_enabled());
        assert!(!cfg.am.poll_byte_enabled());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let mut cfg = RlcConfig::default();
        cfg.mode = RlcMode::Um;
        assert!(matches!(cfg.validate(), Err(LayerError::InvalidConfiguration(_))));

        let mut cfg = RlcConfig::default();
        cfg.am.t_reordering = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RlcConfig::default();
        cfg.tx_queue_length = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let cfg: RlcConfig = toml::from_str(
            r#"
            tx_queue_length = 16
            [am]
            poll_pdu = -1
            t_status_prohibit = 0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.tx_queue_length, 16);
        assert_eq!(cfg.am.poll_pdu, -1);
        assert_eq!(cfg.am.t_poll_retx, 5);
        assert_eq!(cfg.mode, RlcMode::Am);
    }
}
