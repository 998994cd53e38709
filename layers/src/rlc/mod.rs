//! Radio Link Control (RLC) Layer Implementation
//!
//! Acknowledged Mode RLC according to 3GPP TS 36.322, with one entity per
//! logical channel multiplexed by [`RlcLayer`].

pub mod am;
pub mod config;
pub mod sdu_queue;

use crate::LayerError;
use bytes::Bytes;
use common::timers::{TimerHandler, TimerId};
use common::types::Lcid;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use am::RlcAm;
pub use config::{RlcAmConfig, RlcConfig, RlcMode};
pub use sdu_queue::SduQueue;

/// Upper layer receiving reassembled SDUs
pub trait PdcpRlcInterface: Send + Sync {
    /// Hand over one complete SDU, in sequence
    fn deliver_sdu(&self, lcid: Lcid, sdu: Bytes);
}

/// Control plane notified about radio link problems
pub trait RrcRlcInterface: Send + Sync {
    /// A PDU reached the maximum number of retransmissions
    fn max_retx_attempted(&self, lcid: Lcid);

    /// Name used in log messages for the bearer on `lcid`
    fn rb_name(&self, lcid: Lcid) -> String {
        lcid.rb_name()
    }
}

/// Rejected SDU, returned to the caller together with the reason
#[derive(Error, Debug)]
pub enum WriteSduError {
    #[error("transmission disabled")]
    TxDisabled(Bytes),

    #[error("SDU queue full")]
    QueueFull(Bytes),

    #[error("invalid SDU size")]
    InvalidSize(Bytes),

    #[error("no bearer on this LCID")]
    UnknownBearer(Bytes),
}

impl WriteSduError {
    /// Take back the rejected SDU
    pub fn into_sdu(self) -> Bytes {
        match self {
            Self::TxDisabled(sdu)
            | Self::QueueFull(sdu)
            | Self::InvalidSize(sdu)
            | Self::UnknownBearer(sdu) => sdu,
        }
    }
}

/// Per-bearer counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlcBearerMetrics {
    pub num_tx_sdus: u64,
    pub num_tx_sdu_bytes: u64,
    pub num_rx_sdus: u64,
    pub num_rx_sdu_bytes: u64,
    pub num_tx_pdus: u64,
    pub num_tx_pdu_bytes: u64,
    pub num_rx_pdus: u64,
    pub num_rx_pdu_bytes: u64,
    /// SDUs discarded before transmission
    pub num_lost_sdus: u64,
    pub num_retx_pdus: u64,
    /// Received PDUs discarded (duplicate, outside window, malformed)
    pub num_dropped_pdus: u64,
}

impl RlcBearerMetrics {
    /// Add the counters of `other`
    pub fn merge(&mut self, other: &Self) {
        self.num_tx_sdus += other.num_tx_sdus;
        self.num_tx_sdu_bytes += other.num_tx_sdu_bytes;
        self.num_rx_sdus += other.num_rx_sdus;
        self.num_rx_sdu_bytes += other.num_rx_sdu_bytes;
        self.num_tx_pdus += other.num_tx_pdus;
        self.num_tx_pdu_bytes += other.num_tx_pdu_bytes;
        self.num_rx_pdus += other.num_rx_pdus;
        self.num_rx_pdu_bytes += other.num_rx_pdu_bytes;
        self.num_lost_sdus += other.num_lost_sdus;
        self.num_retx_pdus += other.num_retx_pdus;
        self.num_dropped_pdus += other.num_dropped_pdus;
    }
}

/// Common interface of RLC entities
pub trait RlcEntity: Send + Sync {
    fn configure(&self, cfg: &RlcConfig) -> Result<(), LayerError>;
    /// Reset all state and resume operation
    fn reestablish(&self);
    /// Reset all state and refuse new SDUs
    fn stop(&self);
    /// Discard SDUs waiting for transmission
    fn empty_queue(&self);

    fn get_mode(&self) -> RlcMode;
    fn lcid(&self) -> Lcid;
    fn set_lcid(&self, lcid: Lcid);

    fn get_metrics(&self) -> RlcBearerMetrics;
    fn reset_metrics(&self);

    // upper layer
    fn write_sdu(&self, sdu: Bytes, blocking: bool) -> Result<(), WriteSduError>;

    // lower layer
    fn has_data(&self) -> bool;
    fn get_buffer_state(&self) -> usize;
    fn read_pdu(&self, payload: &mut [u8]) -> usize;
    fn write_pdu(&self, payload: &[u8]);

    fn timer_expired(&self, id: TimerId);
}

/// RLC entities of one UE, keyed by logical channel
pub struct RlcLayer {
    pdcp: Arc<dyn PdcpRlcInterface>,
    rrc: Arc<dyn RrcRlcInterface>,
    timers: Arc<TimerHandler>,
    bearers: RwLock<BTreeMap<Lcid, Arc<dyn RlcEntity>>>,
}

impl RlcLayer {
    pub fn new(
        pdcp: Arc<dyn PdcpRlcInterface>,
        rrc: Arc<dyn RrcRlcInterface>,
        timers: Arc<TimerHandler>,
    ) -> Self {
        Self {
            pdcp,
            rrc,
            timers,
            bearers: RwLock::new(BTreeMap::new()),
        }
    }

    fn bearer(&self, lcid: Lcid) -> Option<Arc<dyn RlcEntity>> {
        self.bearers.read().get(&lcid).cloned()
    }

    fn all_bearers(&self) -> Vec<Arc<dyn RlcEntity>> {
        self.bearers.read().values().cloned().collect()
    }

    /// Create and configure the entity for `lcid`
    pub fn add_bearer(&self, lcid: Lcid, cfg: &RlcConfig) -> Result<(), LayerError> {
        if self.has_bearer(lcid) {
            warn!("Bearer on LCID {} already exists", lcid);
            return Err(LayerError::InvalidState(format!("LCID {} already in use", lcid)));
        }

        let entity: Arc<dyn RlcEntity> = match cfg.mode {
            RlcMode::Am => Arc::new(RlcAm::new(
                lcid,
                Arc::clone(&self.pdcp),
                Arc::clone(&self.rrc),
                &self.timers,
            )),
            mode => {
                return Err(LayerError::InvalidConfiguration(format!(
                    "RLC mode {:?} not supported",
                    mode
                )))
            }
        };
        entity.configure(cfg)?;

        let mut bearers = self.bearers.write();
        if bearers.contains_key(&lcid) {
            return Err(LayerError::InvalidState(format!("LCID {} already in use", lcid)));
        }
        bearers.insert(lcid, entity);
        info!("Added {:?} bearer {} on LCID {}", cfg.mode, self.rrc.rb_name(lcid), lcid);
        Ok(())
    }

    /// Stop and remove the entity for `lcid`
    pub fn del_bearer(&self, lcid: Lcid) -> Result<(), LayerError> {
        let entity = self
            .bearers
            .write()
            .remove(&lcid)
            .ok_or_else(|| LayerError::InvalidState(format!("no bearer on LCID {}", lcid)))?;
        entity.stop();
        info!("Deleted bearer on LCID {}", lcid);
        Ok(())
    }

    pub fn has_bearer(&self, lcid: Lcid) -> bool {
        self.bearers.read().contains_key(&lcid)
    }

    /// Logical channels with a configured entity
    pub fn bearers(&self) -> Vec<Lcid> {
        self.bearers.read().keys().copied().collect()
    }

    /// Move the entity on `old` to `new`, which must be free
    pub fn change_lcid(&self, old: Lcid, new: Lcid) -> Result<(), LayerError> {
        let mut bearers = self.bearers.write();
        if bearers.contains_key(&new) {
            return Err(LayerError::InvalidState(format!("LCID {} already in use", new)));
        }
        let entity = bearers
            .remove(&old)
            .ok_or_else(|| LayerError::InvalidState(format!("no bearer on LCID {}", old)))?;
        entity.set_lcid(new);
        bearers.insert(new, entity);
        info!("Moved bearer from LCID {} to LCID {}", old, new);
        Ok(())
    }

    pub fn write_sdu(&self, lcid: Lcid, sdu: Bytes, blocking: bool) -> Result<(), WriteSduError> {
        match self.bearer(lcid) {
            Some(entity) => entity.write_sdu(sdu, blocking),
            None => {
                warn!("Dropping SDU for unknown LCID {}", lcid);
                Err(WriteSduError::UnknownBearer(sdu))
            }
        }
    }

    pub fn read_pdu(&self, lcid: Lcid, payload: &mut [u8]) -> usize {
        self.bearer(lcid).map_or(0, |entity| entity.read_pdu(payload))
    }

    pub fn write_pdu(&self, lcid: Lcid, payload: &[u8]) {
        match self.bearer(lcid) {
            Some(entity) => entity.write_pdu(payload),
            None => warn!("Dropping PDU for unknown LCID {}", lcid),
        }
    }

    pub fn get_buffer_state(&self, lcid: Lcid) -> usize {
        self.bearer(lcid).map_or(0, |entity| entity.get_buffer_state())
    }

    pub fn has_data(&self, lcid: Lcid) -> bool {
        self.bearer(lcid).map_or(false, |entity| entity.has_data())
    }

    pub fn empty_queue(&self, lcid: Lcid) {
        if let Some(entity) = self.bearer(lcid) {
            entity.empty_queue();
        }
    }

    /// Reestablish every bearer
    pub fn reestablish(&self) {
        info!("Reestablishing all bearers");
        for entity in self.all_bearers() {
            entity.reestablish();
        }
    }

    pub fn reestablish_bearer(&self, lcid: Lcid) -> Result<(), LayerError> {
        let entity = self
            .bearer(lcid)
            .ok_or_else(|| LayerError::InvalidState(format!("no bearer on LCID {}", lcid)))?;
        entity.reestablish();
        Ok(())
    }

    /// Stop every bearer
    pub fn stop(&self) {
        for entity in self.all_bearers() {
            entity.stop();
        }
    }

    /// Dispatch an expired timer to the bearer that owns it
    pub fn timer_expired(&self, id: TimerId) {
        debug!("Timer {} expired", id);
        for entity in self.all_bearers() {
            entity.timer_expired(id);
        }
    }

    pub fn get_metrics(&self) -> BTreeMap<Lcid, RlcBearerMetrics> {
        self.bearers
            .read()
            .iter()
            .map(|(lcid, entity)| (*lcid, entity.get_metrics()))
            .collect()
    }

    pub fn reset_metrics(&self) {
        for entity in self.all_bearers() {
            entity.reset_metrics();
        }
    }
}
