//! Closed-loop two-peer simulation
//!
//! The transmitting peer (`enb`) pushes generated SDUs into its AM bearer.
//! Every millisecond both peers are granted `grant_size` bytes, the PDUs
//! they build cross a [`RadioLink`] each way, and the receiving peer
//! (`ue`) answers with STATUS reports over the uplink.

use crate::config::SimConfig;
use anyhow::anyhow;
use bytes::Bytes;
use common::timers::TimerHandler;
use common::types::Lcid;
use interfaces::{LinkOutcome, LinkStats, PduTrace, RadioLink, TraceWriter};
use layers::rlc::am::pdu::{is_control_pdu, AmdPduHeader, StatusPdu};
use layers::{PdcpRlcInterface, RlcBearerMetrics, RlcLayer, RrcRlcInterface, WriteSduError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper layers of one peer: collects delivered SDUs and RRC events
#[derive(Default)]
pub struct PeerUpper {
    delivered: Mutex<Vec<Bytes>>,
    max_retx_events: AtomicU64,
}

impl PeerUpper {
    pub fn max_retx_events(&self) -> u64 {
        self.max_retx_events.load(Ordering::Relaxed)
    }

    fn take_delivered(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.delivered.lock())
    }
}

impl PdcpRlcInterface for PeerUpper {
    fn deliver_sdu(&self, lcid: Lcid, sdu: Bytes) {
        debug!("LCID {}: delivered SDU of {} bytes", lcid, sdu.len());
        self.delivered.lock().push(sdu);
    }
}

impl RrcRlcInterface for PeerUpper {
    fn max_retx_attempted(&self, lcid: Lcid) {
        warn!("LCID {}: maximum retransmissions reached", lcid);
        self.max_retx_events.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub elapsed_ms: u64,
    pub sdus_offered: usize,
    pub sdus_delivered: usize,
    /// Delivered SDUs matched the offered ones in content and order
    pub in_order: bool,
    pub max_retx_events: u64,
    pub tx_metrics: RlcBearerMetrics,
    pub rx_metrics: RlcBearerMetrics,
    pub downlink: LinkStats,
    pub uplink: LinkStats,
}

/// Transmitting and receiving peer plus the two links between them
pub struct Simulation {
    lcid: Lcid,
    grant_size: usize,
    timers: Arc<TimerHandler>,
    enb: RlcLayer,
    ue: RlcLayer,
    enb_upper: Arc<PeerUpper>,
    ue_upper: Arc<PeerUpper>,
    downlink: RadioLink,
    uplink: RadioLink,
    /// SDUs not yet accepted by the transmitter
    pending: VecDeque<Bytes>,
    /// SDUs the receiver has to deliver, in order
    expected: VecDeque<Bytes>,
    sdus_offered: usize,
    sdus_delivered: usize,
    in_order: bool,
    trace: Option<TraceWriter<BufWriter<File>>>,
}

impl Simulation {
    pub fn new(cfg: &SimConfig, seed: u64) -> anyhow::Result<Self> {
        cfg.validate()?;
        let lcid = cfg.traffic.lcid()?;

        // three timers per AM entity
        let timers = TimerHandler::new(8);
        let enb_upper = Arc::new(PeerUpper::default());
        let ue_upper = Arc::new(PeerUpper::default());
        let enb = RlcLayer::new(enb_upper.clone(), enb_upper.clone(), timers.clone());
        let ue = RlcLayer::new(ue_upper.clone(), ue_upper.clone(), timers.clone());
        enb.add_bearer(lcid, &cfg.rlc)?;
        ue.add_bearer(lcid, &cfg.rlc)?;

        let downlink = RadioLink::new("dl", cfg.link.clone(), seed)?;
        let uplink = RadioLink::new("ul", cfg.link.clone(), seed.wrapping_add(1))?;

        let mut rng = StdRng::seed_from_u64(seed);
        let pending: VecDeque<Bytes> = (0..cfg.traffic.num_sdus)
            .map(|_| {
                let mut sdu = vec![0u8; cfg.traffic.sdu_size];
                rng.fill_bytes(&mut sdu);
                Bytes::from(sdu)
            })
            .collect();

        info!(
            "Simulating {} SDUs of {} bytes on LCID {}, grant {} bytes, seed {}",
            cfg.traffic.num_sdus, cfg.traffic.sdu_size, lcid, cfg.traffic.grant_size, seed
        );

        Ok(Self {
            lcid,
            grant_size: cfg.traffic.grant_size,
            timers,
            enb,
            ue,
            enb_upper,
            ue_upper,
            downlink,
            uplink,
            expected: pending.clone(),
            sdus_offered: pending.len(),
            pending,
            sdus_delivered: 0,
            in_order: true,
            trace: None,
        })
    }

    /// Record every PDU sent over either link
    pub fn set_trace(&mut self, trace: TraceWriter<BufWriter<File>>) {
        self.trace = Some(trace);
    }

    pub fn now(&self) -> u64 {
        self.timers.now()
    }

    /// All offered SDUs have been delivered
    pub fn is_complete(&self) -> bool {
        self.expected.is_empty()
    }

    /// Advance the simulation by one millisecond
    ///
    /// Returns `true` once every SDU reached the receiver.
    pub fn step(&mut self) -> anyhow::Result<bool> {
        for id in self.timers.step_all() {
            self.enb.timer_expired(id);
            self.ue.timer_expired(id);
        }
        let now = self.timers.now();

        self.offer_sdus();

        if let Some(pdu) = build_pdu(&self.enb, self.lcid, self.grant_size) {
            let outcome = self.downlink.send(now, pdu.clone());
            record(&mut self.trace, now, &self.downlink, &pdu, outcome)?;
        }
        if let Some(pdu) = build_pdu(&self.ue, self.lcid, self.grant_size) {
            let outcome = self.uplink.send(now, pdu.clone());
            record(&mut self.trace, now, &self.uplink, &pdu, outcome)?;
        }

        for pdu in self.downlink.receive(now) {
            self.ue.write_pdu(self.lcid, &pdu);
        }
        for pdu in self.uplink.receive(now) {
            self.enb.write_pdu(self.lcid, &pdu);
        }

        self.check_delivered();
        Ok(self.is_complete())
    }

    fn offer_sdus(&mut self) {
        while let Some(sdu) = self.pending.pop_front() {
            match self.enb.write_sdu(self.lcid, sdu, false) {
                Ok(()) => {}
                Err(WriteSduError::QueueFull(sdu)) => {
                    self.pending.push_front(sdu);
                    break;
                }
                Err(e) => {
                    warn!("SDU rejected: {}", e);
                    break;
                }
            }
        }
    }

    fn check_delivered(&mut self) {
        for sdu in self.ue_upper.take_delivered() {
            self.sdus_delivered += 1;
            match self.expected.pop_front() {
                Some(expected) if expected == sdu => {}
                _ => {
                    if self.in_order {
                        warn!("SDU {} delivered out of order or corrupted", self.sdus_delivered);
                    }
                    self.in_order = false;
                }
            }
        }
    }

    /// Flush the trace and collect the results
    pub fn finish(mut self) -> anyhow::Result<SimReport> {
        if let Some(trace) = self.trace.as_mut() {
            trace.flush()?;
            info!("Wrote {} trace records", trace.records());
        }

        let tx_metrics = self.enb.get_metrics().remove(&self.lcid);
        let rx_metrics = self.ue.get_metrics().remove(&self.lcid);
        let (tx_metrics, rx_metrics) = tx_metrics
            .zip(rx_metrics)
            .ok_or_else(|| anyhow!("bearer on LCID {} disappeared", self.lcid))?;

        self.enb.stop();
        self.ue.stop();

        Ok(SimReport {
            elapsed_ms: self.timers.now(),
            sdus_offered: self.sdus_offered,
            sdus_delivered: self.sdus_delivered,
            in_order: self.in_order,
            max_retx_events: self.enb_upper.max_retx_events() + self.ue_upper.max_retx_events(),
            tx_metrics,
            rx_metrics,
            downlink: self.downlink.stats().clone(),
            uplink: self.uplink.stats().clone(),
        })
    }
}

fn build_pdu(layer: &RlcLayer, lcid: Lcid, grant_size: usize) -> Option<Bytes> {
    if !layer.has_data(lcid) {
        return None;
    }
    let mut grant = vec![0u8; grant_size];
    let len = layer.read_pdu(lcid, &mut grant);
    if len == 0 {
        return None;
    }
    grant.truncate(len);
    Some(Bytes::from(grant))
}

fn summarize(pdu: &[u8]) -> String {
    if is_control_pdu(pdu) {
        match StatusPdu::unpack(pdu) {
            Ok(status) => status.to_string(),
            Err(e) => format!("[CONTROL {}]", e),
        }
    } else {
        match AmdPduHeader::unpack(pdu) {
            Ok((header, _)) => header.to_string(),
            Err(e) => format!("[DATA {}]", e),
        }
    }
}

fn record(
    trace: &mut Option<TraceWriter<BufWriter<File>>>,
    now: u64,
    link: &RadioLink,
    pdu: &[u8],
    outcome: LinkOutcome,
) -> anyhow::Result<()> {
    if let Some(trace) = trace.as_mut() {
        trace.write(&PduTrace {
            t_ms: now,
            link: link.name().to_string(),
            len: pdu.len(),
            summary: summarize(pdu),
            outcome,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::LinkConfig;

    fn config(num_sdus: usize, link: LinkConfig) -> SimConfig {
        let mut cfg = SimConfig {
            link,
            ..Default::default()
        };
        cfg.traffic.num_sdus = num_sdus;
        cfg.traffic.sdu_size = 300;
        cfg.traffic.grant_size = 120;
        cfg.rlc.am.t_poll_retx = 20;
        cfg.rlc.am.t_reordering = 10;
        cfg.rlc.am.max_retx_thresh = 32;
        cfg
    }

    fn run(sim: &mut Simulation, limit_ms: u64) -> bool {
        while sim.now() < limit_ms {
            if sim.step().unwrap() {
                return true;
            }
        }
        false
    }

    #[test]
    fn test_ideal_link_delivers_everything() {
        let mut sim = Simulation::new(&config(20, LinkConfig::default()), 1).unwrap();
        assert!(run(&mut sim, 1_000));

        let report = sim.finish().unwrap();
        assert_eq!(report.sdus_delivered, 20);
        assert!(report.in_order);
        assert_eq!(report.tx_metrics.num_tx_sdus, 20);
        assert_eq!(report.rx_metrics.num_rx_sdus, 20);
        assert_eq!(report.tx_metrics.num_retx_pdus, 0);
        assert_eq!(report.downlink.dropped, 0);
    }

    #[test]
    fn test_lossy_link_converges() {
        let link = LinkConfig {
            loss_prob: 0.2,
            duplicate_prob: 0.05,
            reorder_prob: 0.1,
            ..Default::default()
        };
        let mut sim = Simulation::new(&config(40, link), 7).unwrap();
        assert!(run(&mut sim, 20_000));

        let report = sim.finish().unwrap();
        assert_eq!(report.sdus_delivered, 40);
        assert!(report.in_order);
        assert!(report.tx_metrics.num_retx_pdus > 0);
        assert!(report.downlink.dropped > 0);
    }

    #[test]
    fn test_dead_link_never_completes() {
        let link = LinkConfig {
            loss_prob: 1.0,
            ..Default::default()
        };
        let mut sim = Simulation::new(&config(5, link), 3).unwrap();
        assert!(!run(&mut sim, 500));

        let report = sim.finish().unwrap();
        assert_eq!(report.sdus_delivered, 0);
        assert_eq!(report.elapsed_ms, 500);
        assert!(report.tx_metrics.num_retx_pdus > 0);
    }

    #[test]
    fn test_summarize_pdus() {
        let header = AmdPduHeader::new(5);
        let mut pdu = header.pack().to_vec();
        pdu.push(0xAB);
        assert!(summarize(&pdu).starts_with("[DATA SN=5"));

        let status = StatusPdu::new(9).pack();
        assert!(summarize(&status).starts_with("[STATUS ACK_SN=9"));
    }
}
