//! AM Transmitting Side
//!
//! Segmentation/concatenation of SDUs into AMD PDUs, the transmission
//! window, polling and ARQ retransmission driven by STATUS reports
//! (TS 36.322 5.1.3.1, 5.2.2, 5.2.1).

use super::pdu::{
    data_header_len, AmdPduHeader, FramingInfo, Nack, StatusPdu, DATA_HEADER_FIXED_LEN,
    MAX_LI_VALUE,
};
use super::rx::RlcAmRx;
use super::{inc_sn, mod_base, MAX_PDU_SIZE, MAX_SDU_SIZE, POLL_PERIODICITY, SN_MOD, SO_END, WINDOW_SIZE};
use crate::rlc::config::{RlcAmConfig, RlcConfig};
use crate::rlc::sdu_queue::SduQueue;
use crate::rlc::{RlcBearerMetrics, RrcRlcInterface, WriteSduError};
use crate::LayerError;
use bytes::{Bytes, BytesMut};
use common::timers::{TimerHandler, TimerId, UniqueTimer};
use common::types::Lcid;
use common::utils::bytes_to_hex;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// A transmitted PDU kept until acknowledged
#[derive(Debug, Clone)]
pub(crate) struct TxPdu {
    /// Header as first sent, without poll
    pub header: AmdPduHeader,
    pub buf: Bytes,
    /// Positively acknowledged beyond a gap
    pub acked: bool,
    pub retx_count: u32,
}

impl TxPdu {
    /// Absolute offsets of the SDU boundaries inside the payload
    fn boundaries(&self) -> Vec<usize> {
        self.header
            .li
            .iter()
            .scan(0usize, |offset, &li| {
                *offset += li as usize;
                Some(*offset)
            })
            .collect()
    }
}

/// Pending retransmission of a PDU or of the byte range `[so_start, so_end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetxRequest {
    pub sn: u16,
    pub is_segment: bool,
    pub so_start: usize,
    pub so_end: usize,
}

impl RetxRequest {
    fn full(sn: u16, len: usize) -> Self {
        Self {
            sn,
            is_segment: false,
            so_start: 0,
            so_end: len,
        }
    }
}

#[derive(Debug)]
struct TxState {
    cfg: RlcAmConfig,
    /// Remainder of a partially transmitted SDU
    tx_sdu: Option<Bytes>,
    tx_window: BTreeMap<u16, TxPdu>,
    retx_queue: VecDeque<RetxRequest>,

    /// Acknowledgement state variable, lower window edge
    vt_a: u16,
    /// Maximum send state variable
    vt_ms: u16,
    /// Send state variable
    vt_s: u16,
    /// Poll send state variable
    poll_sn: u16,

    pdu_without_poll: u32,
    byte_without_poll: u32,

    rng: StdRng,
    metrics: RlcBearerMetrics,
}

impl TxState {
    fn new(cfg: RlcAmConfig, seed: u64) -> Self {
        Self {
            cfg,
            tx_sdu: None,
            tx_window: BTreeMap::new(),
            retx_queue: VecDeque::new(),
            vt_a: 0,
            vt_ms: WINDOW_SIZE,
            vt_s: 0,
            poll_sn: 0,
            pdu_without_poll: 0,
            byte_without_poll: 0,
            rng: StdRng::seed_from_u64(seed),
            metrics: RlcBearerMetrics::default(),
        }
    }

    /// Drop all transmission state, keeping configuration, RNG and metrics
    fn reset(&mut self) -> usize {
        let lost = self.tx_sdu.take().map_or(0, |_| 1);
        self.tx_window.clear();
        self.retx_queue.clear();
        self.vt_a = 0;
        self.vt_ms = WINDOW_SIZE;
        self.vt_s = 0;
        self.poll_sn = 0;
        self.pdu_without_poll = 0;
        self.byte_without_poll = 0;
        lost
    }

    fn window_full(&self) -> bool {
        self.tx_window.len() >= WINDOW_SIZE as usize
    }

    fn retx_queued(&self, req: &RetxRequest) -> bool {
        self.retx_queue.iter().any(|r| r == req)
    }

    /// Bytes needed to send `req` in one go
    fn required_retx_size(&self, req: &RetxRequest) -> usize {
        let Some(pdu) = self.tx_window.get(&req.sn) else {
            return 0;
        };
        if !req.is_segment {
            return pdu.header.packed_len() + pdu.buf.len();
        }
        let n_li = pdu
            .boundaries()
            .iter()
            .filter(|&&b| b > req.so_start && b < req.so_end)
            .count();
        data_header_len(true, n_li) + (req.so_end - req.so_start)
    }
}

/// Transmitting side of an AM entity
pub struct RlcAmTx {
    lcid: AtomicU8,
    rb_name: String,
    rrc: Arc<dyn RrcRlcInterface>,
    tx_sdu_queue: SduQueue,
    tx_enabled: AtomicBool,
    poll_retx_timer: Option<UniqueTimer>,
    status_prohibit_timer: Option<UniqueTimer>,
    state: Mutex<TxState>,
}

impl RlcAmTx {
    pub fn new(
        lcid: Lcid,
        rb_name: String,
        rrc: Arc<dyn RrcRlcInterface>,
        timers: &Arc<TimerHandler>,
    ) -> Self {
        let acquire = |what: &str| match timers.get_unique_timer() {
            Ok(t) => Some(t),
            Err(e) => {
                error!("{} Could not allocate {} timer: {}", rb_name, what, e);
                None
            }
        };
        let poll_retx_timer = acquire("poll retransmit");
        let status_prohibit_timer = acquire("status prohibit");

        let cfg = RlcConfig::default();
        Self {
            lcid: AtomicU8::new(lcid.value()),
            rrc,
            tx_sdu_queue: SduQueue::new(cfg.tx_queue_length),
            tx_enabled: AtomicBool::new(false),
            poll_retx_timer,
            status_prohibit_timer,
            state: Mutex::new(TxState::new(cfg.am, lcid.value() as u64)),
            rb_name,
        }
    }

    pub fn configure(&self, cfg: &RlcConfig) -> Result<(), LayerError> {
        cfg.validate()?;
        let (Some(poll_retx), Some(status_prohibit)) =
            (&self.poll_retx_timer, &self.status_prohibit_timer)
        else {
            return Err(LayerError::ConfigurationError(format!(
                "{} Tx timers not available",
                self.rb_name
            )));
        };

        poll_retx.set(cfg.am.t_poll_retx);
        status_prohibit.set(cfg.am.t_status_prohibit);
        self.tx_sdu_queue.resize(cfg.tx_queue_length);
        self.state.lock().cfg = cfg.am.clone();
        self.tx_enabled.store(true, Ordering::SeqCst);

        info!(
            "{} configured: t_poll_retx={}, poll_pdu={}, poll_byte={}, max_retx_thresh={}, t_status_prohibit={}, queue={}",
            self.rb_name,
            cfg.am.t_poll_retx,
            cfg.am.poll_pdu,
            cfg.am.poll_byte,
            cfg.am.max_retx_thresh,
            cfg.am.t_status_prohibit,
            cfg.tx_queue_length
        );
        Ok(())
    }

    /// Disable transmission and drop all state; blocked writers are released
    pub fn stop(&self) {
        self.tx_enabled.store(false, Ordering::SeqCst);
        for timer in [&self.poll_retx_timer, &self.status_prohibit_timer].into_iter().flatten() {
            timer.stop();
        }
        self.tx_sdu_queue.close();
        let dropped = self.tx_sdu_queue.clear();

        let mut state = self.state.lock();
        let lost = dropped + state.reset();
        state.metrics.num_lost_sdus += lost as u64;
        debug!("{} Tx stopped, {} SDUs discarded", self.rb_name, lost);
    }

    pub fn lcid(&self) -> Lcid {
        Lcid(self.lcid.load(Ordering::SeqCst))
    }

    pub(crate) fn set_lcid(&self, lcid: Lcid) {
        self.lcid.store(lcid.value(), Ordering::SeqCst);
    }

    pub fn reestablish(&self) {
        self.stop();
        self.tx_sdu_queue.open();
        self.tx_enabled.store(true, Ordering::SeqCst);
    }

    /// Discard queued SDUs not yet segmented
    pub fn empty_queue(&self) {
        let dropped = self.tx_sdu_queue.clear();
        self.state.lock().metrics.num_lost_sdus += dropped as u64;
    }

    pub fn write_sdu(&self, sdu: Bytes, blocking: bool) -> Result<(), WriteSduError> {
        if !self.tx_enabled.load(Ordering::SeqCst) {
            debug!("{} Tx disabled, rejecting SDU ({} bytes)", self.rb_name, sdu.len());
            return Err(WriteSduError::TxDisabled(sdu));
        }
        if sdu.is_empty() || sdu.len() > MAX_SDU_SIZE {
            warn!("{} Rejecting SDU of {} bytes", self.rb_name, sdu.len());
            return Err(WriteSduError::InvalidSize(sdu));
        }

        let len = sdu.len();
        if blocking {
            self.tx_sdu_queue.write(sdu).map_err(WriteSduError::TxDisabled)?;
        } else {
            self.tx_sdu_queue.try_write(sdu).map_err(|sdu| {
                if self.tx_sdu_queue.is_closed() {
                    WriteSduError::TxDisabled(sdu)
                } else {
                    WriteSduError::QueueFull(sdu)
                }
            })?;
        }

        let mut state = self.state.lock();
        state.metrics.num_tx_sdus += 1;
        state.metrics.num_tx_sdu_bytes += len as u64;
        debug!(
            "{} Tx SDU ({} bytes), queue={} ({} bytes)",
            self.rb_name,
            len,
            self.tx_sdu_queue.size(),
            self.tx_sdu_queue.size_bytes()
        );
        Ok(())
    }

    pub fn has_data(&self, rx: &RlcAmRx) -> bool {
        self.get_buffer_state(rx) > 0
    }

    /// Bytes the entity would like to send, headers included
    pub fn get_buffer_state(&self, rx: &RlcAmRx) -> usize {
        if !self.tx_enabled.load(Ordering::SeqCst) {
            return 0;
        }

        let mut n_bytes = 0;
        if rx.get_do_status() && !self.status_prohibited() {
            n_bytes += rx.get_status_pdu_length();
        }

        let state = self.state.lock();
        if let Some(req) = state
            .retx_queue
            .iter()
            .find(|r| state.tx_window.contains_key(&r.sn))
        {
            n_bytes += state.required_retx_size(req);
        }

        if !state.window_full() {
            let n_sdus = self.tx_sdu_queue.size() + usize::from(state.tx_sdu.is_some());
            n_bytes += self.tx_sdu_queue.size_bytes();
            n_bytes += state.tx_sdu.as_ref().map_or(0, Bytes::len);
            // LIs for all but the last SDU
            if n_sdus > 1 {
                n_bytes += ((n_sdus - 1) * 3 + 1) / 2;
            }
            if n_sdus > 0 {
                n_bytes += 3;
            }
        }
        n_bytes
    }

    fn status_prohibited(&self) -> bool {
        self.status_prohibit_timer
            .as_ref()
            .map_or(false, UniqueTimer::is_running)
    }

    /// Fill `payload` with the next PDU, returning its size
    ///
    /// Priority is STATUS, then retransmissions, then new data.
    pub fn read_pdu(&self, rx: &RlcAmRx, payload: &mut [u8]) -> usize {
        if !self.tx_enabled.load(Ordering::SeqCst) {
            return 0;
        }

        if rx.get_do_status() && !self.status_prohibited() {
            if let Some(status) = rx.get_status_pdu(payload.len()) {
                let packed = status.pack();
                payload[..packed.len()].copy_from_slice(&packed);
                info!("{} Tx status PDU {}", self.rb_name, status);
                if let Some(timer) = &self.status_prohibit_timer {
                    if timer.duration() > 0 {
                        timer.run();
                    }
                }
                let mut state = self.state.lock();
                state.metrics.num_tx_pdus += 1;
                state.metrics.num_tx_pdu_bytes += packed.len() as u64;
                return packed.len();
            }
        }

        let (len, max_retx_reached) = {
            let mut state = self.state.lock();
            let mut max_retx_reached = false;
            if state.window_full() && state.retx_queue.is_empty() {
                max_retx_reached = self.retransmit_random_pdu(&mut state);
            }

            let mut len = 0;
            if !state.retx_queue.is_empty() {
                len = self.build_retx_pdu(&mut state, payload);
            }
            if len == 0 {
                len = self.build_data_pdu(&mut state, payload);
            }

            if len > 0 {
                state.metrics.num_tx_pdus += 1;
                state.metrics.num_tx_pdu_bytes += len as u64;
                trace!("{} Tx PDU {}", self.rb_name, bytes_to_hex(&payload[..len]));
            }
            (len, max_retx_reached)
        };

        if max_retx_reached {
            self.rrc.max_retx_attempted(self.lcid());
        }
        len
    }

    fn build_data_pdu(&self, state: &mut TxState, payload: &mut [u8]) -> usize {
        if state.tx_sdu.is_none() && self.tx_sdu_queue.is_empty() {
            trace!("{} No data available", self.rb_name);
            return 0;
        }
        if state.window_full() {
            info!("{} Tx window full (vt_a={}, vt_s={})", self.rb_name, state.vt_a, state.vt_s);
            return 0;
        }

        let mut pdu_space = payload.len().min(MAX_PDU_SIZE);
        let mut head_len = DATA_HEADER_FIXED_LEN;
        if pdu_space <= head_len + 1 {
            debug!("{} Grant of {} bytes too small for a data PDU", self.rb_name, payload.len());
            return 0;
        }

        let mut header = AmdPduHeader::new(state.vt_s);
        let mut pdu_buf = BytesMut::with_capacity(pdu_space);
        let mut last_li = 0usize;

        if let Some(mut sdu) = state.tx_sdu.take() {
            let to_move = (pdu_space - head_len).min(sdu.len());
            pdu_buf.extend_from_slice(&sdu.split_to(to_move));
            last_li = to_move;
            pdu_space -= to_move;
            header.fi |= FramingInfo::NOT_START_ALIGNED;
            if !sdu.is_empty() {
                state.tx_sdu = Some(sdu);
            }
        }

        while pdu_space > head_len + 1
            && !self.tx_sdu_queue.is_empty()
            && header.li.len() < WINDOW_SIZE as usize
            && last_li <= MAX_LI_VALUE as usize
        {
            let pushed = last_li > 0;
            if pushed {
                header.li.push(last_li as u16);
            }
            head_len = header.packed_len();
            if head_len >= pdu_space {
                if pushed {
                    header.li.pop();
                }
                break;
            }

            let Some(mut sdu) = self.tx_sdu_queue.read() else {
                if pushed {
                    header.li.pop();
                }
                break;
            };
            let to_move = (pdu_space - head_len).min(sdu.len());
            pdu_buf.extend_from_slice(&sdu.split_to(to_move));
            last_li = to_move;
            pdu_space -= to_move;
            if !sdu.is_empty() {
                state.tx_sdu = Some(sdu);
            }
        }

        if state.tx_sdu.is_some() {
            header.fi |= FramingInfo::NOT_END_ALIGNED;
        }

        state.vt_s = inc_sn(state.vt_s);
        state.pdu_without_poll += 1;
        state.byte_without_poll += (pdu_buf.len() + header.packed_len()) as u32;

        let buf = pdu_buf.freeze();
        state.tx_window.insert(
            header.sn,
            TxPdu {
                header: header.clone(),
                buf: buf.clone(),
                acked: false,
                retx_count: 0,
            },
        );

        self.set_poll(state, &mut header);
        let len = write_pdu(payload, &header, &buf);
        debug!("{} Tx data PDU {} ({} bytes)", self.rb_name, header, len);
        self.debug_state(state);
        len
    }

    fn build_retx_pdu(&self, state: &mut TxState, payload: &mut [u8]) -> usize {
        while let Some(front) = state.retx_queue.front() {
            if state.tx_window.contains_key(&front.sn) {
                break;
            }
            info!("{} SN={} left the tx window, dropping retransmission", self.rb_name, front.sn);
            state.retx_queue.pop_front();
        }

        let Some(retx) = state.retx_queue.front().copied() else {
            return 0;
        };
        let Some(pdu) = state.tx_window.get(&retx.sn) else {
            return 0;
        };
        let nof_bytes = payload.len();

        if !retx.is_segment && state.required_retx_size(&retx) <= nof_bytes {
            let mut header = pdu.header.clone();
            let buf = pdu.buf.clone();
            state.retx_queue.pop_front();
            header.p = false;
            self.set_poll(state, &mut header);
            state.metrics.num_retx_pdus += 1;

            let len = write_pdu(payload, &header, &buf);
            info!("{} Retx PDU {} ({} bytes)", self.rb_name, header, len);
            return len;
        }

        self.build_segment(state, payload, retx)
    }

    /// Resegment the front retransmission request to fit `payload`
    fn build_segment(&self, state: &mut TxState, payload: &mut [u8], retx: RetxRequest) -> usize {
        let Some(pdu) = state.tx_window.get(&retx.sn) else {
            return 0;
        };
        let nof_bytes = payload.len();
        let total = pdu.buf.len();
        let boundaries = pdu.boundaries();
        let inside = |start: usize, end: usize| {
            boundaries
                .iter()
                .copied()
                .filter(move |&b| b > start && b < end)
        };

        let so_start = retx.so_start;
        let mut so_end = retx.so_end;
        loop {
            let n_li = inside(so_start, so_end).count();
            let head_len = data_header_len(true, n_li);
            if nof_bytes > head_len && so_end - so_start <= nof_bytes - head_len {
                break;
            }
            if nof_bytes > head_len {
                so_end = so_start + (nof_bytes - head_len);
            } else if let Some(cut) = inside(so_start, so_end).last() {
                so_end = cut;
            } else {
                debug!(
                    "{} Grant of {} bytes too small for a segment of SN={}",
                    self.rb_name, nof_bytes, retx.sn
                );
                return 0;
            }
        }

        let mut li = Vec::new();
        let mut prev = so_start;
        for b in inside(so_start, so_end) {
            li.push((b - prev) as u16);
            prev = b;
        }

        let mut fi = FramingInfo::empty();
        let start_aligned = (so_start == 0 && pdu.header.fi.is_start_aligned())
            || boundaries.contains(&so_start);
        let end_aligned =
            (so_end == total && pdu.header.fi.is_end_aligned()) || boundaries.contains(&so_end);
        if !start_aligned {
            fi |= FramingInfo::NOT_START_ALIGNED;
        }
        if !end_aligned {
            fi |= FramingInfo::NOT_END_ALIGNED;
        }

        let mut header = AmdPduHeader {
            rf: true,
            fi,
            lsf: so_end == total,
            so: so_start as u16,
            li,
            ..AmdPduHeader::new(retx.sn)
        };
        let data = pdu.buf.slice(so_start..so_end);

        if so_end == retx.so_end {
            state.retx_queue.pop_front();
        } else if let Some(front) = state.retx_queue.front_mut() {
            front.is_segment = true;
            front.so_start = so_end;
        }

        self.set_poll(state, &mut header);
        state.metrics.num_retx_pdus += 1;

        let len = write_pdu(payload, &header, &data);
        info!("{} Retx segment {} ({} bytes)", self.rb_name, header, len);
        len
    }

    fn poll_required(&self, state: &TxState) -> bool {
        let cfg = &state.cfg;
        if cfg.poll_pdu_enabled() && state.pdu_without_poll > cfg.poll_pdu as u32 {
            debug!("{} Poll: pdu_without_poll={}", self.rb_name, state.pdu_without_poll);
            return true;
        }
        if cfg.poll_byte_enabled() && state.byte_without_poll > cfg.poll_byte as u32 {
            debug!("{} Poll: byte_without_poll={}", self.rb_name, state.byte_without_poll);
            return true;
        }
        if self
            .poll_retx_timer
            .as_ref()
            .map_or(false, UniqueTimer::is_expired)
        {
            debug!("{} Poll: t-PollRetransmit expired", self.rb_name);
            return true;
        }
        if state.window_full() {
            debug!("{} Poll: tx window full", self.rb_name);
            return true;
        }
        if self.tx_sdu_queue.is_empty() && state.tx_sdu.is_none() && state.retx_queue.is_empty() {
            debug!("{} Poll: buffers empty", self.rb_name);
            return true;
        }
        // keep the peer reporting when count based polling is off
        !cfg.poll_pdu_enabled() && !cfg.poll_byte_enabled() && state.vt_s % POLL_PERIODICITY == 0
    }

    fn set_poll(&self, state: &mut TxState, header: &mut AmdPduHeader) {
        if !self.poll_required(state) {
            return;
        }
        header.p = true;
        state.poll_sn = (state.vt_s + SN_MOD - 1) % SN_MOD;
        state.pdu_without_poll = 0;
        state.byte_without_poll = 0;
        if let Some(timer) = &self.poll_retx_timer {
            timer.run();
        }
    }

    /// Count a retransmission of `sn`, returning true when the threshold is hit
    fn count_retx(&self, state: &mut TxState, sn: u16) -> bool {
        let max_retx_thresh = state.cfg.max_retx_thresh;
        let Some(pdu) = state.tx_window.get_mut(&sn) else {
            return false;
        };
        pdu.acked = false;
        pdu.retx_count += 1;
        debug!("{} SN={} retx_count={}", self.rb_name, sn, pdu.retx_count);
        if pdu.retx_count == max_retx_thresh {
            warn!(
                "{} SN={} reached max retransmissions ({})",
                self.rb_name, sn, max_retx_thresh
            );
            return true;
        }
        false
    }

    /// Schedule a full retransmission of a window PDU, preferring unacknowledged ones
    fn retransmit_random_pdu(&self, state: &mut TxState) -> bool {
        let mut candidates: Vec<u16> = state
            .tx_window
            .iter()
            .filter(|(_, pdu)| !pdu.acked)
            .map(|(&sn, _)| sn)
            .collect();
        if candidates.is_empty() {
            candidates = state.tx_window.keys().copied().collect();
        }
        if candidates.is_empty() {
            return false;
        }

        let sn = candidates[state.rng.gen_range(0..candidates.len())];
        let Some(len) = state.tx_window.get(&sn).map(|pdu| pdu.buf.len()) else {
            return false;
        };
        let req = RetxRequest::full(sn, len);
        if state.retx_queued(&req) {
            return false;
        }
        info!("{} Scheduling retransmission of SN={}", self.rb_name, sn);
        state.retx_queue.push_back(req);
        self.count_retx(state, sn)
    }

    /// Process a received STATUS PDU
    pub fn handle_control_pdu(&self, payload: &[u8]) {
        let status = match StatusPdu::unpack(payload) {
            Ok(status) => status,
            Err(e) => {
                warn!("{} Dropping malformed status PDU ({} bytes): {}", self.rb_name, payload.len(), e);
                self.state.lock().metrics.num_dropped_pdus += 1;
                return;
            }
        };
        if !status.is_valid() {
            warn!("{} Dropping status PDU that NACKs ACK_SN: {}", self.rb_name, status);
            self.state.lock().metrics.num_dropped_pdus += 1;
            return;
        }

        let max_retx_reached = {
            let mut state = self.state.lock();
            state.metrics.num_rx_pdus += 1;
            state.metrics.num_rx_pdu_bytes += payload.len() as u64;
            self.handle_status(&mut state, &status)
        };

        if max_retx_reached {
            self.rrc.max_retx_attempted(self.lcid());
        }
    }

    fn handle_status(&self, state: &mut TxState, status: &StatusPdu) -> bool {
        info!("{} Rx status PDU {}", self.rb_name, status);

        let base = state.vt_a;
        let ack_rel = mod_base(status.ack_sn, base);
        let vt_s_rel = mod_base(state.vt_s, base);

        // an older report leaves the outstanding poll waiting
        if mod_base(state.poll_sn, base) < ack_rel.min(vt_s_rel) {
            if let Some(timer) = &self.poll_retx_timer {
                timer.stop();
            }
        } else {
            debug!(
                "{} Status does not cover poll_sn={}, t-PollRetransmit keeps running",
                self.rb_name, state.poll_sn
            );
        }
        if !status.nacks.is_empty() {
            state.retx_queue.clear();
        }
        if ack_rel > vt_s_rel {
            warn!(
                "{} ACK_SN={} beyond vt_s={}, limiting to vt_s",
                self.rb_name, status.ack_sn, state.vt_s
            );
        }

        let mut max_retx_reached = false;
        let mut update_vt_a = true;
        let mut sn = base;
        while mod_base(sn, base) < ack_rel && mod_base(sn, base) < vt_s_rel {
            let nacks: Vec<&Nack> = status.nacks.iter().filter(|n| n.nack_sn == sn).collect();
            if !nacks.is_empty() {
                update_vt_a = false;
                max_retx_reached |= self.schedule_nacked(state, sn, &nacks);
            } else if update_vt_a {
                if state.tx_window.remove(&sn).is_some() {
                    trace!("{} SN={} acknowledged", self.rb_name, sn);
                }
                state.vt_a = inc_sn(sn);
                state.vt_ms = (state.vt_a + WINDOW_SIZE) % SN_MOD;
            } else if let Some(pdu) = state.tx_window.get_mut(&sn) {
                pdu.acked = true;
            }
            sn = inc_sn(sn);
        }

        self.debug_state(state);
        max_retx_reached
    }

    fn schedule_nacked(&self, state: &mut TxState, sn: u16, nacks: &[&Nack]) -> bool {
        let Some(len) = state.tx_window.get(&sn).map(|pdu| pdu.buf.len()) else {
            debug!("{} NACK_SN={} not in tx window, ignoring", self.rb_name, sn);
            return false;
        };

        let mut scheduled = false;
        for nack in nacks {
            let req = match nack.so {
                None => RetxRequest::full(sn, len),
                Some(so) => {
                    let mut start = so.start as usize;
                    if start >= len {
                        start = 0;
                    }
                    let end = if so.end == SO_END {
                        len
                    } else {
                        so.end as usize + 1
                    };
                    if start < end && end <= len {
                        RetxRequest {
                            sn,
                            is_segment: start > 0 || end < len,
                            so_start: start,
                            so_end: end,
                        }
                    } else {
                        warn!(
                            "{} NACK_SN={} with invalid range {}:{} for {} bytes, resending PDU",
                            self.rb_name, sn, so.start, so.end, len
                        );
                        RetxRequest::full(sn, len)
                    }
                }
            };
            if !state.retx_queued(&req) {
                debug!(
                    "{} Scheduling retx SN={} [{}:{})",
                    self.rb_name, sn, req.so_start, req.so_end
                );
                state.retx_queue.push_back(req);
                scheduled = true;
            }
        }

        scheduled && self.count_retx(state, sn)
    }

    pub fn timer_expired(&self, id: TimerId) {
        let Some(timer) = &self.poll_retx_timer else {
            return;
        };
        if timer.id() != id {
            return;
        }

        let max_retx_reached = {
            let mut state = self.state.lock();
            if !timer.is_expired() {
                return;
            }
            info!("{} Poll retransmit timer expired (poll_sn={})", self.rb_name, state.poll_sn);
            let idle = state.retx_queue.is_empty()
                && self.tx_sdu_queue.is_empty()
                && state.tx_sdu.is_none();
            if idle || state.window_full() {
                self.retransmit_random_pdu(&mut state)
            } else {
                false
            }
        };

        if max_retx_reached {
            self.rrc.max_retx_attempted(self.lcid());
        }
    }

    pub fn get_metrics(&self) -> RlcBearerMetrics {
        self.state.lock().metrics.clone()
    }

    pub fn reset_metrics(&self) {
        self.state.lock().metrics = RlcBearerMetrics::default();
    }

    fn debug_state(&self, state: &TxState) {
        debug!(
            "{} vt_a={} vt_ms={} vt_s={} poll_sn={} tx_window={} retx_queue={}",
            self.rb_name,
            state.vt_a,
            state.vt_ms,
            state.vt_s,
            state.poll_sn,
            state.tx_window.len(),
            state.retx_queue.len()
        );
    }
}

/// Pack header and data into `payload`, returning the PDU size
fn write_pdu(payload: &mut [u8], header: &AmdPduHeader, data: &[u8]) -> usize {
    let head = header.pack();
    let len = head.len() + data.len();
    payload[..head.len()].copy_from_slice(&head);
    payload[head.len()..len].copy_from_slice(data);
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlc::am::pdu::SoRange;
    use crate::rlc::PdcpRlcInterface;
    use std::sync::atomic::AtomicUsize;

    struct NullPdcp;

    impl PdcpRlcInterface for NullPdcp {
        fn deliver_sdu(&self, _lcid: Lcid, _sdu: Bytes) {}
    }

    #[derive(Default)]
    struct RrcSpy {
        max_retx: AtomicUsize,
    }

    impl RrcRlcInterface for RrcSpy {
        fn max_retx_attempted(&self, _lcid: Lcid) {
            self.max_retx.fetch_add(1, Ordering::SeqCst);
        }

        fn rb_name(&self, lcid: Lcid) -> String {
            lcid.rb_name()
        }
    }

    struct Fixture {
        timers: Arc<TimerHandler>,
        rrc: Arc<RrcSpy>,
        tx: RlcAmTx,
        rx: RlcAmRx,
    }

    fn setup(cfg: RlcConfig) -> Fixture {
        let timers = TimerHandler::new(8);
        let rrc = Arc::new(RrcSpy::default());
        let tx = RlcAmTx::new(Lcid(3), "DRB1".into(), rrc.clone(), &timers);
        let rx = RlcAmRx::new(Lcid(3), "DRB1".into(), Arc::new(NullPdcp), &timers);
        tx.configure(&cfg).unwrap();
        rx.configure(cfg.am.t_reordering).unwrap();
        Fixture { timers, rrc, tx, rx }
    }

    fn write_sdus(f: &Fixture, n: usize, len: usize) {
        for i in 0..n {
            f.tx.write_sdu(Bytes::from(vec![i as u8; len]), false).unwrap();
        }
    }

    fn read(f: &Fixture, grant: usize) -> Vec<u8> {
        let mut buf = vec![0u8; grant];
        let n = f.tx.read_pdu(&f.rx, &mut buf);
        buf.truncate(n);
        buf
    }

    fn header(pdu: &[u8]) -> (AmdPduHeader, Vec<u8>) {
        let (h, len) = AmdPduHeader::unpack(pdu).unwrap();
        (h, pdu[len..].to_vec())
    }

    fn status(f: &Fixture, ack_sn: u16, nacks: Vec<Nack>) {
        f.tx.handle_control_pdu(&StatusPdu { ack_sn, nacks }.pack());
    }

    #[test]
    fn test_buffer_state_counts_headers() {
        let f = setup(RlcConfig::default());
        assert_eq!(f.tx.get_buffer_state(&f.rx), 0);
        assert!(!f.tx.has_data(&f.rx));
        write_sdus(&f, 5, 1);
        assert_eq!(f.tx.get_buffer_state(&f.rx), 14);

        let f = setup(RlcConfig::default());
        write_sdus(&f, 5, 10);
        assert_eq!(f.tx.get_buffer_state(&f.rx), 59);
    }

    #[test]
    fn test_small_grants() {
        let f = setup(RlcConfig::default());
        write_sdus(&f, 1, 1);
        assert!(read(&f, 3).is_empty());
        assert_eq!(f.tx.state.lock().vt_s, 0);

        let pdu = read(&f, 4);
        assert_eq!(pdu.len(), 3);
        let (h, data) = header(&pdu);
        assert_eq!(h.sn, 0);
        assert_eq!(h.fi, FramingInfo::empty());
        assert!(h.p);
        assert_eq!(data, vec![0]);
    }

    #[test]
    fn test_concatenation() {
        let f = setup(RlcConfig::default());
        write_sdus(&f, 5, 1);
        let pdu = read(&f, 13);
        assert_eq!(pdu.len(), 13);
        let (h, data) = header(&pdu);
        assert_eq!(h.li, vec![1, 1, 1, 1]);
        assert_eq!(data, vec![0, 1, 2, 3, 4]);
        assert_eq!(f.tx.get_buffer_state(&f.rx), 0);
    }

    #[test]
    fn test_segmentation_framing_info() {
        let f = setup(RlcConfig::default());
        f.tx.write_sdu(Bytes::from(vec![7u8; 100]), false).unwrap();

        let mut fis = Vec::new();
        let mut total = 0;
        loop {
            let pdu = read(&f, 27);
            if pdu.is_empty() {
                break;
            }
            let (h, data) = header(&pdu);
            fis.push(h.fi);
            total += data.len();
        }
        assert_eq!(total, 100);
        assert_eq!(
            fis,
            vec![
                FramingInfo::NOT_END_ALIGNED,
                FramingInfo::all(),
                FramingInfo::all(),
                FramingInfo::NOT_START_ALIGNED
            ]
        );
    }

    #[test]
    fn test_poll_pdu_and_byte_triggers() {
        let f = setup(RlcConfig::default());
        write_sdus(&f, 10, 1);
        let polled: Vec<u16> = (0..10)
            .map(|_| header(&read(&f, 4)).0)
            .filter(|h| h.p)
            .map(|h| h.sn)
            .collect();
        assert_eq!(polled, vec![4, 9]);
        assert_eq!(f.tx.state.lock().poll_sn, 9);

        let mut cfg = RlcConfig::default();
        cfg.am.poll_pdu = 100;
        let f = setup(cfg);
        write_sdus(&f, 7, 10);
        let polled: Vec<u16> = (0..7)
            .map(|_| header(&read(&f, 13)).0)
            .filter(|h| h.p)
            .map(|h| h.sn)
            .collect();
        // 36 bytes exceed poll_byte=25 on every third PDU, the last empties the buffers
        assert_eq!(polled, vec![2, 5, 6]);
    }

    #[test]
    fn test_poll_periodicity_without_counters() {
        let f = setup(RlcConfig::srb());
        write_sdus(&f, 10, 1);
        let polled: Vec<u16> = (0..10)
            .map(|_| header(&read(&f, 4)).0)
            .filter(|h| h.p)
            .map(|h| h.sn)
            .collect();
        assert_eq!(polled, vec![7, 9]);
    }

    #[test]
    fn test_status_advances_window_and_schedules_retx() {
        let f = setup(RlcConfig::default());
        write_sdus(&f, 5, 1);
        for _ in 0..5 {
            assert_eq!(read(&f, 4).len(), 3);
        }

        status(&f, 5, vec![Nack::full(2)]);
        {
            let state = f.tx.state.lock();
            assert_eq!(state.vt_a, 2);
            assert_eq!(state.vt_ms, 2 + WINDOW_SIZE);
            assert_eq!(state.tx_window.len(), 3);
            assert!(state.tx_window[&3].acked && state.tx_window[&4].acked);
        }
        assert_eq!(f.tx.get_buffer_state(&f.rx), 3);

        let (h, data) = header(&read(&f, 4));
        assert_eq!(h.sn, 2);
        assert!(h.p);
        assert_eq!(data, vec![2]);
        assert_eq!(f.tx.get_metrics().num_retx_pdus, 1);

        status(&f, 5, vec![]);
        let state = f.tx.state.lock();
        assert!(state.tx_window.is_empty());
        assert_eq!(state.vt_a, 5);
    }

    #[test]
    fn test_resegmentation() {
        let f = setup(RlcConfig::default());
        write_sdus(&f, 5, 10);
        for _ in 0..5 {
            assert_eq!(read(&f, 12).len(), 12);
        }
        status(&f, 5, vec![Nack::full(1)]);
        assert_eq!(f.tx.get_buffer_state(&f.rx), 12);

        let pdu = read(&f, 9);
        assert_eq!(pdu.len(), 9);
        let (h, data) = header(&pdu);
        assert!(h.rf);
        assert_eq!((h.sn, h.so, h.lsf), (1, 0, false));
        assert_eq!(h.fi, FramingInfo::NOT_END_ALIGNED);
        assert_eq!(data, vec![1; 5]);
        assert_eq!(f.tx.get_buffer_state(&f.rx), 9);

        let (h, data) = header(&read(&f, 20));
        assert_eq!((h.sn, h.so, h.lsf), (1, 5, true));
        assert_eq!(h.fi, FramingInfo::NOT_START_ALIGNED);
        assert!(h.p);
        assert_eq!(data.len(), 5);
        assert_eq!(f.tx.get_buffer_state(&f.rx), 0);
    }

    #[test]
    fn test_segment_of_concatenated_pdu() {
        let f = setup(RlcConfig::default());
        f.tx.write_sdu(Bytes::from_static(b"abc"), false).unwrap();
        f.tx.write_sdu(Bytes::from_static(b"defg"), false).unwrap();
        let (h, _) = header(&read(&f, 11));
        assert_eq!(h.li, vec![3]);

        // bytes 2..=5 requested
        status(
            &f,
            1,
            vec![Nack {
                nack_sn: 0,
                so: Some(SoRange { start: 2, end: 5 }),
            }],
        );

        // only room for a header without LI
        let (h, data) = header(&read(&f, 6));
        assert_eq!((h.so, h.lsf), (2, false));
        assert!(h.li.is_empty());
        assert_eq!(h.fi, FramingInfo::NOT_START_ALIGNED);
        assert_eq!(data, b"c".to_vec());

        let (h, data) = header(&read(&f, 20));
        assert_eq!((h.so, h.lsf), (3, false));
        assert_eq!(h.fi, FramingInfo::NOT_END_ALIGNED);
        assert_eq!(data, b"def".to_vec());
        assert!(f.tx.state.lock().retx_queue.is_empty());
    }

    #[test]
    fn test_segment_with_li_inside_range() {
        let f = setup(RlcConfig::default());
        f.tx.write_sdu(Bytes::from_static(b"abc"), false).unwrap();
        f.tx.write_sdu(Bytes::from_static(b"defg"), false).unwrap();
        read(&f, 11);
        status(
            &f,
            1,
            vec![Nack {
                nack_sn: 0,
                so: Some(SoRange { start: 2, end: 5 }),
            }],
        );

        let (h, data) = header(&read(&f, 20));
        assert_eq!(h.so, 2);
        assert_eq!(h.li, vec![1]);
        assert_eq!(h.fi, FramingInfo::all());
        assert_eq!(data, b"cdef".to_vec());
    }

    #[test]
    fn test_stale_retx_request_skipped() {
        let f = setup(RlcConfig::default());
        write_sdus(&f, 5, 1);
        for _ in 0..5 {
            read(&f, 4);
        }
        status(&f, 5, vec![Nack::full(2)]);
        status(&f, 5, vec![]);
        assert_eq!(f.tx.state.lock().retx_queue.len(), 1);
        assert_eq!(f.tx.get_buffer_state(&f.rx), 0);
        assert!(read(&f, 10).is_empty());
        assert!(f.tx.state.lock().retx_queue.is_empty());
    }

    #[test]
    fn test_max_retx_notifies_rrc_once() {
        let f = setup(RlcConfig::default());
        write_sdus(&f, 1, 1);
        read(&f, 4);
        for _ in 0..5 {
            status(&f, 1, vec![Nack::full(0)]);
            assert_eq!(read(&f, 4).len(), 3);
        }
        assert_eq!(f.tx.state.lock().tx_window[&0].retx_count, 5);
        assert_eq!(f.rrc.max_retx.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_window_full_stops_new_data() {
        let mut cfg = RlcConfig::default();
        cfg.tx_queue_length = 600;
        let f = setup(cfg);
        write_sdus(&f, WINDOW_SIZE as usize + 1, 1);
        for _ in 0..WINDOW_SIZE {
            assert_eq!(read(&f, 4).len(), 3);
        }
        assert_eq!(f.tx.state.lock().tx_window.len(), WINDOW_SIZE as usize);
        assert_eq!(f.tx.get_buffer_state(&f.rx), 0);

        // window stalled: an old PDU is sent again instead of new data
        let (h, _) = header(&read(&f, 4));
        assert!(h.sn < WINDOW_SIZE);
        assert!(h.p);
        assert_eq!(f.tx.get_metrics().num_retx_pdus, 1);
        assert_eq!(f.tx.state.lock().vt_s, WINDOW_SIZE);
    }

    #[test]
    fn test_poll_retx_expiry_retransmits() {
        let f = setup(RlcConfig::default());
        write_sdus(&f, 2, 1);
        read(&f, 4);
        let (h, _) = header(&read(&f, 4));
        assert!(h.p);

        for _ in 0..5 {
            for id in f.timers.step_all() {
                f.tx.timer_expired(id);
            }
        }
        assert_eq!(f.tx.state.lock().retx_queue.len(), 1);
        let (h, _) = header(&read(&f, 4));
        assert!(h.p);
        assert!(h.sn < 2);
    }

    #[test]
    fn test_older_status_keeps_poll_retx_running() {
        let f = setup(RlcConfig::default());
        write_sdus(&f, 3, 1);
        for _ in 0..3 {
            assert_eq!(read(&f, 4).len(), 3);
        }
        assert_eq!(f.tx.state.lock().poll_sn, 2);
        let timer = f.tx.poll_retx_timer.as_ref().unwrap();
        assert!(timer.is_running());

        // answers an earlier poll, SN=1 and SN=2 still outstanding
        status(&f, 1, vec![]);
        assert!(timer.is_running());
        assert_eq!(f.tx.state.lock().vt_a, 1);
        assert_eq!(f.tx.get_buffer_state(&f.rx), 0);

        for _ in 0..5 {
            for id in f.timers.step_all() {
                f.tx.timer_expired(id);
            }
        }
        let (h, _) = header(&read(&f, 4));
        assert!(h.sn == 1 || h.sn == 2);
        assert!(h.p);
        assert!(timer.is_running());

        status(&f, 3, vec![]);
        assert!(!timer.is_running());
        assert!(f.tx.state.lock().tx_window.is_empty());
    }

    #[test]
    fn test_nack_of_poll_sn_stops_poll_retx() {
        let f = setup(RlcConfig::default());
        write_sdus(&f, 2, 1);
        read(&f, 4);
        read(&f, 4);
        let timer = f.tx.poll_retx_timer.as_ref().unwrap();
        assert!(timer.is_running());

        status(&f, 2, vec![Nack::full(1)]);
        assert!(!timer.is_running());
        assert_eq!(f.tx.state.lock().retx_queue.len(), 1);
    }

    #[test]
    fn test_status_nacking_ack_sn_dropped() {
        let f = setup(RlcConfig::default());
        write_sdus(&f, 2, 1);
        read(&f, 4);
        read(&f, 4);

        status(&f, 2, vec![Nack::full(2)]);
        {
            let state = f.tx.state.lock();
            assert_eq!(state.vt_a, 0);
            assert_eq!(state.tx_window.len(), 2);
            assert!(state.retx_queue.is_empty());
        }
        let metrics = f.tx.get_metrics();
        assert_eq!(metrics.num_dropped_pdus, 1);
        assert_eq!(metrics.num_rx_pdus, 0);
        assert!(f.tx.poll_retx_timer.as_ref().unwrap().is_running());
    }

    #[test]
    fn test_write_sdu_errors() {
        let mut cfg = RlcConfig::default();
        cfg.tx_queue_length = 1;
        let f = setup(cfg);

        assert!(matches!(
            f.tx.write_sdu(Bytes::new(), false),
            Err(WriteSduError::InvalidSize(_))
        ));
        let too_big = Bytes::from(vec![0u8; MAX_SDU_SIZE + 1]);
        assert!(matches!(
            f.tx.write_sdu(too_big, false),
            Err(WriteSduError::InvalidSize(_))
        ));

        f.tx.write_sdu(Bytes::from_static(b"a"), false).unwrap();
        let err = f.tx.write_sdu(Bytes::from_static(b"b"), false).unwrap_err();
        assert!(matches!(err, WriteSduError::QueueFull(_)));
        assert_eq!(err.into_sdu().as_ref(), b"b");

        f.tx.stop();
        assert!(matches!(
            f.tx.write_sdu(Bytes::from_static(b"c"), false),
            Err(WriteSduError::TxDisabled(_))
        ));
        assert_eq!(f.tx.get_metrics().num_lost_sdus, 1);

        f.tx.reestablish();
        assert!(f.tx.write_sdu(Bytes::from_static(b"d"), false).is_ok());
    }
}
