//! TOML scenario configuration for the RLC simulator

use anyhow::{anyhow, Context};
use common::types::Lcid;
use interfaces::LinkConfig;
use layers::RlcConfig;
use serde::{Deserialize, Serialize};

/// Complete scenario
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SimConfig {
    /// Bearer configuration used by both peers
    #[serde(default)]
    pub rlc: RlcConfig,
    /// Impairments of both link directions
    #[serde(default)]
    pub link: LinkConfig,
    /// Offered load
    #[serde(default)]
    pub traffic: TrafficConfig,
}

/// Offered load, generated at the transmitting peer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrafficConfig {
    /// Logical channel carrying the traffic
    #[serde(default = "default_lcid")]
    pub lcid: u8,
    /// SDUs to transfer
    #[serde(default = "default_num_sdus")]
    pub num_sdus: usize,
    /// Size of every SDU in bytes
    #[serde(default = "default_sdu_size")]
    pub sdu_size: usize,
    /// Bytes granted to each peer per millisecond
    #[serde(default = "default_grant_size")]
    pub grant_size: usize,
}

fn default_lcid() -> u8 {
    3
}

fn default_num_sdus() -> usize {
    100
}

fn default_sdu_size() -> usize {
    500
}

fn default_grant_size() -> usize {
    200
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            lcid: default_lcid(),
            num_sdus: default_num_sdus(),
            sdu_size: default_sdu_size(),
            grant_size: default_grant_size(),
        }
    }
}

impl TrafficConfig {
    pub fn lcid(&self) -> anyhow::Result<Lcid> {
        Lcid::new(self.lcid).ok_or_else(|| anyhow!("Invalid LCID: {}", self.lcid))
    }
}

impl SimConfig {
    /// Load configuration from TOML file
    pub fn from_toml_file(path: &str) -> anyhow::Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: SimConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.rlc.validate()?;
        self.link.validate()?;
        self.traffic.lcid()?;
        if self.traffic.sdu_size == 0 || self.traffic.sdu_size > layers::rlc::am::MAX_SDU_SIZE {
            return Err(anyhow!("Invalid SDU size: {}", self.traffic.sdu_size));
        }
        // fixed header plus one payload byte
        if self.traffic.grant_size < 3 {
            return Err(anyhow!("Grant of {} bytes is too small", self.traffic.grant_size));
        }
        Ok(())
    }
}
