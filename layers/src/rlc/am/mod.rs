//! RLC Acknowledged Mode
//!
//! An AM entity pairs a transmitting side and a receiving side. Control
//! PDUs (STATUS) received from the peer are routed to the transmitter,
//! data PDUs to the receiver, and the transmitter pulls STATUS reports
//! from the receiver when it is granted resources.

pub mod pdu;
pub mod rx;
pub mod tx;

use crate::rlc::config::{RlcConfig, RlcMode};
use crate::rlc::{
    PdcpRlcInterface, RlcBearerMetrics, RlcEntity, RrcRlcInterface, WriteSduError,
};
use crate::LayerError;
use bytes::Bytes;
use common::timers::{TimerHandler, TimerId};
use common::types::Lcid;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use pdu::{AmdPduHeader, FramingInfo, Nack, PduError, SoRange, StatusPdu};
pub use rx::RlcAmRx;
pub use tx::RlcAmTx;

/// Sequence number modulus (10-bit SN)
pub const SN_MOD: u16 = 1024;
/// AM window size
pub const WINDOW_SIZE: u16 = 512;
/// Poll every this many PDUs when count based polling is disabled
pub const POLL_PERIODICITY: u16 = 8;
/// Special SOend value meaning "up to the last byte"
pub const SO_END: u16 = 0x7FFF;
/// Largest PDU the transmitter builds
pub const MAX_PDU_SIZE: usize = 12756;
/// Largest SDU accepted for transmission or reassembled on reception
pub const MAX_SDU_SIZE: usize = MAX_PDU_SIZE;

/// Distance of `sn` from `base` in the modulus
#[inline]
pub(crate) fn mod_base(sn: u16, base: u16) -> u16 {
    (sn + SN_MOD - base) % SN_MOD
}

#[inline]
pub(crate) fn inc_sn(sn: u16) -> u16 {
    (sn + 1) % SN_MOD
}

/// Acknowledged Mode RLC entity
pub struct RlcAm {
    rb_name: String,
    cfg: Mutex<RlcConfig>,
    tx: RlcAmTx,
    rx: RlcAmRx,
}

impl RlcAm {
    pub fn new(
        lcid: Lcid,
        pdcp: Arc<dyn PdcpRlcInterface>,
        rrc: Arc<dyn RrcRlcInterface>,
        timers: &Arc<TimerHandler>,
    ) -> Self {
        let rb_name = rrc.rb_name(lcid);
        Self {
            tx: RlcAmTx::new(lcid, rb_name.clone(), rrc, timers),
            rx: RlcAmRx::new(lcid, rb_name.clone(), pdcp, timers),
            cfg: Mutex::new(RlcConfig::default()),
            rb_name,
        }
    }

    pub fn rb_name(&self) -> &str {
        &self.rb_name
    }

    /// Configuration last applied
    pub fn config(&self) -> RlcConfig {
        self.cfg.lock().clone()
    }

    pub fn tx(&self) -> &RlcAmTx {
        &self.tx
    }

    pub fn rx(&self) -> &RlcAmRx {
        &self.rx
    }
}

impl RlcEntity for RlcAm {
    fn configure(&self, cfg: &RlcConfig) -> Result<(), LayerError> {
        if cfg.mode != RlcMode::Am {
            return Err(LayerError::ConfigurationError(format!(
                "{} cannot run in {:?} mode",
                self.rb_name, cfg.mode
            )));
        }
        self.tx.configure(cfg)?;
        self.rx.configure(cfg.am.t_reordering)?;
        *self.cfg.lock() = cfg.clone();
        info!("{} AM entity configured", self.rb_name);
        Ok(())
    }

    fn reestablish(&self) {
        debug!("{} Reestablishing", self.rb_name);
        self.tx.reestablish();
        self.rx.reestablish();
    }

    fn stop(&self) {
        debug!("{} Stopping", self.rb_name);
        self.tx.stop();
        self.rx.stop();
    }

    fn empty_queue(&self) {
        self.tx.empty_queue();
    }

    fn get_mode(&self) -> RlcMode {
        RlcMode::Am
    }

    fn lcid(&self) -> Lcid {
        self.tx.lcid()
    }

    fn set_lcid(&self, lcid: Lcid) {
        self.tx.set_lcid(lcid);
        self.rx.set_lcid(lcid);
    }

    fn get_metrics(&self) -> RlcBearerMetrics {
        let mut metrics = self.tx.get_metrics();
        metrics.merge(&self.rx.get_metrics());
        metrics
    }

    fn reset_metrics(&self) {
        self.tx.reset_metrics();
        self.rx.reset_metrics();
    }

    fn write_sdu(&self, sdu: Bytes, blocking: bool) -> Result<(), WriteSduError> {
        self.tx.write_sdu(sdu, blocking)
    }

    fn has_data(&self) -> bool {
        self.tx.has_data(&self.rx)
    }

    fn get_buffer_state(&self) -> usize {
        self.tx.get_buffer_state(&self.rx)
    }

    fn read_pdu(&self, payload: &mut [u8]) -> usize {
        self.tx.read_pdu(&self.rx, payload)
    }

    fn write_pdu(&self, payload: &[u8]) {
        if payload.is_empty() {
            warn!("{} Dropping empty PDU", self.rb_name);
            return;
        }
        if pdu::is_control_pdu(payload) {
            self.tx.handle_control_pdu(payload);
        } else {
            self.rx.write_pdu(payload);
        }
    }

    fn timer_expired(&self, id: TimerId) {
        self.tx.timer_expired(id);
        self.rx.timer_expired(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl PdcpRlcInterface for Upper {
        fn deliver_sdu(&self, _lcid: Lcid, _sdu: Bytes) {}
    }

    impl RrcRlcInterface for Upper {
        fn max_retx_attempted(&self, _lcid: Lcid) {}

        fn rb_name(&self, lcid: Lcid) -> String {
            lcid.rb_name()
        }
    }

    #[test]
    fn test_sn_arithmetic() {
        assert_eq!(mod_base(5, 1020), 9);
        assert_eq!(mod_base(1020, 1020), 0);
        assert_eq!(inc_sn(1023), 0);
    }

    #[test]
    fn test_timers_released_on_drop() {
        let timers = TimerHandler::new(3);
        let upper = Arc::new(Upper);
        let am = RlcAm::new(Lcid(1), upper.clone(), upper.clone(), &timers);
        assert_eq!(am.rb_name(), "SRB1");
        assert_eq!(timers.nof_timers(), 3);
        assert!(am.configure(&RlcConfig::srb()).is_ok());
        assert_eq!(am.config(), RlcConfig::srb());

        // no timer left for a second entity
        let second = RlcAm::new(Lcid(2), upper.clone(), upper.clone(), &timers);
        assert!(matches!(
            second.configure(&RlcConfig::default()),
            Err(LayerError::ConfigurationError(_))
        ));

        drop(am);
        assert_eq!(timers.nof_timers(), 0);
    }

    #[test]
    fn test_rejects_non_am_mode() {
        let timers = TimerHandler::new(3);
        let upper = Arc::new(Upper);
        let am = RlcAm::new(Lcid(3), upper.clone(), upper, &timers);
        let mut cfg = RlcConfig::default();
        cfg.mode = RlcMode::Um;
        assert!(am.configure(&cfg).is_err());
        assert_eq!(am.get_mode(), RlcMode::Am);
        assert_eq!(am.get_buffer_state(), 0);
    }
}
