//! AM Receiving Side
//!
//! Receive window, PDU segment collection, SDU reassembly, the
//! t-Reordering timer and STATUS report generation (TS 36.322 5.1.3.2).

use super::pdu::{status_packed_len, AmdPduHeader, FramingInfo, Nack, StatusPdu, STATUS_MIN_LEN};
use super::{inc_sn, mod_base, MAX_PDU_SIZE, MAX_SDU_SIZE, WINDOW_SIZE};
use crate::rlc::{PdcpRlcInterface, RlcBearerMetrics};
use crate::LayerError;
use bytes::{Bytes, BytesMut};
use common::timers::{TimerHandler, TimerId, UniqueTimer};
use common::types::Lcid;
use common::utils::bytes_to_hex;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// A received PDU (or reassembled PDU) waiting in the receive window
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RxPdu {
    pub header: AmdPduHeader,
    pub buf: Bytes,
}

impl RxPdu {
    fn end(&self) -> usize {
        self.header.so as usize + self.buf.len()
    }
}

/// Byte segments received for one SN, ordered by segment offset
#[derive(Debug, Default)]
pub(crate) struct SegmentSet {
    segments: Vec<RxPdu>,
}

impl SegmentSet {
    /// Store a segment and return the rebuilt full PDU once every byte is present
    pub fn add_and_check(&mut self, segment: RxPdu) -> Option<RxPdu> {
        if !self.insert(segment) {
            return None;
        }
        self.drop_covered();
        self.reassemble()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    fn insert(&mut self, segment: RxPdu) -> bool {
        let so = segment.header.so;
        match self.segments.binary_search_by_key(&so, |s| s.header.so) {
            Ok(idx) if segment.buf.len() > self.segments[idx].buf.len() => {
                self.segments[idx] = segment;
                true
            }
            Ok(_) => false,
            Err(idx) => {
                self.segments.insert(idx, segment);
                true
            }
        }
    }

    fn drop_covered(&mut self) {
        let mut covered = 0usize;
        self.segments.retain(|s| {
            if s.end() <= covered {
                return false;
            }
            covered = s.end();
            true
        });
    }

    fn is_complete(&self) -> bool {
        let mut expected = 0usize;
        for s in &self.segments {
            if s.header.so as usize > expected {
                return false;
            }
            expected = expected.max(s.end());
        }
        self.segments.last().map_or(false, |s| s.header.lsf)
    }

    /// Rebuild header and payload of the original PDU
    ///
    /// SDU boundaries are collected in absolute byte offsets from every
    /// segment (its LIs and its FI alignment), so overlapping segments that
    /// were cut at different places still yield one consistent LI table.
    fn reassemble(&self) -> Option<RxPdu> {
        if !self.is_complete() {
            return None;
        }
        let first = self.segments.first()?;
        let last = self.segments.last()?;
        let total = last.end();

        let mut boundaries = BTreeSet::new();
        let mut buf = BytesMut::with_capacity(total);
        for seg in &self.segments {
            let so = seg.header.so as usize;
            let mut offset = so;
            for &li in &seg.header.li {
                offset += li as usize;
                boundaries.insert(offset);
            }
            if seg.header.fi.is_start_aligned() {
                boundaries.insert(so);
            }
            if seg.header.fi.is_end_aligned() {
                boundaries.insert(seg.end());
            }
            if seg.end() > buf.len() {
                let skip = buf.len() - so;
                buf.extend_from_slice(&seg.buf[skip..]);
            }
        }

        let mut li = Vec::new();
        let mut prev = 0usize;
        for &b in boundaries.range(1..total) {
            li.push((b - prev) as u16);
            prev = b;
        }

        let mut fi = FramingInfo::empty();
        if !first.header.fi.is_start_aligned() {
            fi |= FramingInfo::NOT_START_ALIGNED;
        }
        if !last.header.fi.is_end_aligned() {
            fi |= FramingInfo::NOT_END_ALIGNED;
        }

        let header = AmdPduHeader {
            fi,
            li,
            ..AmdPduHeader::new(first.header.sn)
        };
        Some(RxPdu {
            header,
            buf: buf.freeze(),
        })
    }
}

#[derive(Debug)]
struct RxState {
    rx_window: BTreeMap<u16, RxPdu>,
    rx_segments: BTreeMap<u16, SegmentSet>,
    /// SDU under reassembly
    rx_sdu: BytesMut,

    /// Receive state variable, lower window edge
    vr_r: u16,
    /// Maximum acceptable receive state variable
    vr_mr: u16,
    /// t-Reordering state variable
    vr_x: u16,
    /// Maximum STATUS transmit state variable
    vr_ms: u16,
    /// Highest received state variable
    vr_h: u16,

    poll_received: bool,
    do_status: bool,

    metrics: RlcBearerMetrics,
}

impl RxState {
    fn new() -> Self {
        Self {
            rx_window: BTreeMap::new(),
            rx_segments: BTreeMap::new(),
            rx_sdu: BytesMut::new(),
            vr_r: 0,
            vr_mr: WINDOW_SIZE,
            vr_x: 0,
            vr_ms: 0,
            vr_h: 0,
            poll_received: false,
            do_status: false,
            metrics: RlcBearerMetrics::default(),
        }
    }

    fn reset(&mut self) {
        let metrics = std::mem::take(&mut self.metrics);
        *self = Self::new();
        self.metrics = metrics;
    }

    fn rx_mod(&self, sn: u16) -> u16 {
        mod_base(sn, self.vr_r)
    }

    fn in_window(&self, sn: u16) -> bool {
        self.rx_mod(sn) < WINDOW_SIZE
    }

    fn update_vr_h(&mut self, sn: u16) {
        if self.rx_mod(sn) >= self.rx_mod(self.vr_h) {
            self.vr_h = inc_sn(sn);
        }
    }

    fn missing_sns(&self) -> impl Iterator<Item = u16> + '_ {
        let span = self.rx_mod(self.vr_ms);
        (0..span)
            .map(move |i| (self.vr_r + i) % super::SN_MOD)
            .filter(move |sn| !self.rx_window.contains_key(sn))
    }
}

/// Receiving side of an AM entity
pub struct RlcAmRx {
    lcid: AtomicU8,
    rb_name: String,
    pdcp: Arc<dyn PdcpRlcInterface>,
    reordering_timer: Option<UniqueTimer>,
    state: Mutex<RxState>,
}

impl RlcAmRx {
    pub fn new(
        lcid: Lcid,
        rb_name: String,
        pdcp: Arc<dyn PdcpRlcInterface>,
        timers: &Arc<TimerHandler>,
    ) -> Self {
        let reordering_timer = match timers.get_unique_timer() {
            Ok(t) => Some(t),
            Err(e) => {
                error!("{} Could not allocate reordering timer: {}", rb_name, e);
                None
            }
        };
        Self {
            lcid: AtomicU8::new(lcid.value()),
            rb_name,
            pdcp,
            reordering_timer,
            state: Mutex::new(RxState::new()),
        }
    }

    pub fn configure(&self, t_reordering: u32) -> Result<(), LayerError> {
        let timer = self.reordering_timer.as_ref().ok_or_else(|| {
            LayerError::ConfigurationError(format!("{} reordering timer not available", self.rb_name))
        })?;
        timer.set(t_reordering);
        debug!("{} Rx configured t_reordering={}", self.rb_name, t_reordering);
        Ok(())
    }

    /// Cancel the reordering timer and reset all receive state
    pub fn stop(&self) {
        if let Some(timer) = &self.reordering_timer {
            timer.stop();
        }
        self.state.lock().reset();
    }

    pub fn reestablish(&self) {
        self.stop();
    }

    pub fn lcid(&self) -> Lcid {
        Lcid(self.lcid.load(Ordering::SeqCst))
    }

    pub(crate) fn set_lcid(&self, lcid: Lcid) {
        self.lcid.store(lcid.value(), Ordering::SeqCst);
    }

    /// Process one received data PDU
    pub fn write_pdu(&self, payload: &[u8]) {
        trace!("{} Rx PDU {}", self.rb_name, bytes_to_hex(payload));
        let (header, head_len) = match AmdPduHeader::unpack(payload) {
            Ok(h) => h,
            Err(e) => {
                warn!("{} Dropping malformed data PDU ({} bytes): {}", self.rb_name, payload.len(), e);
                self.state.lock().metrics.num_dropped_pdus += 1;
                return;
            }
        };

        let mut delivered = Vec::new();
        {
            let mut state = self.state.lock();
            state.metrics.num_rx_pdus += 1;
            state.metrics.num_rx_pdu_bytes += payload.len() as u64;

            let data = Bytes::copy_from_slice(&payload[head_len..]);
            if data.is_empty() {
                warn!("{} Dropping SN={} without payload", self.rb_name, header.sn);
                state.metrics.num_dropped_pdus += 1;
                return;
            }

            if header.rf {
                self.handle_data_pdu_segment(&mut state, header, data, &mut delivered);
            } else {
                self.handle_data_pdu(&mut state, header, data, &mut delivered);
            }

            for sdu in &delivered {
                state.metrics.num_rx_sdus += 1;
                state.metrics.num_rx_sdu_bytes += sdu.len() as u64;
            }
        }

        for sdu in delivered {
            debug!("{} Delivering SDU ({} bytes)", self.rb_name, sdu.len());
            self.pdcp.deliver_sdu(self.lcid(), sdu);
        }
    }

    /// Window and duplicate check, honouring the poll bit of discarded PDUs
    fn accept_sn(&self, state: &mut RxState, header: &AmdPduHeader) -> bool {
        let sn = header.sn;
        let reason = if !state.in_window(sn) {
            "outside rx window"
        } else if state.rx_window.contains_key(&sn) {
            "duplicate"
        } else {
            return true;
        };

        info!(
            "{} Discarding SN={} ({}) [vr_r={} vr_mr={}]",
            self.rb_name, sn, reason, state.vr_r, state.vr_mr
        );
        if header.p {
            info!("{} Status report requested by discarded SN={}", self.rb_name, sn);
            state.do_status = true;
        }
        state.metrics.num_dropped_pdus += 1;
        false
    }

    fn handle_data_pdu(
        &self,
        state: &mut RxState,
        header: AmdPduHeader,
        data: Bytes,
        delivered: &mut Vec<Bytes>,
    ) {
        let sn = header.sn;
        debug!("{} Rx data PDU {} ({} bytes)", self.rb_name, header, data.len());

        if !self.accept_sn(state, &header) {
            return;
        }

        if header.li_sum() > data.len() {
            warn!(
                "{} Dropping corrupted SN={}: LI sum {} exceeds payload {}",
                self.rb_name,
                sn,
                header.li_sum(),
                data.len()
            );
            state.metrics.num_dropped_pdus += 1;
            return;
        }

        let poll = header.p;
        state.rx_window.insert(sn, RxPdu { header, buf: data });
        state.update_vr_h(sn);

        if sn == state.vr_ms {
            while state.rx_window.contains_key(&state.vr_ms) {
                state.vr_ms = inc_sn(state.vr_ms);
            }
        }

        if poll {
            info!("{} Poll received on SN={}", self.rb_name, sn);
            state.poll_received = true;
            // a poll ahead of vr_ms is answered once t-Reordering settles
            if state.rx_mod(sn) < state.rx_mod(state.vr_ms) {
                state.do_status = true;
            }
        }

        self.reassemble_rx_sdus(state, delivered);
        self.update_reordering_timer(state);
        self.debug_state(state);
    }

    fn handle_data_pdu_segment(
        &self,
        state: &mut RxState,
        header: AmdPduHeader,
        data: Bytes,
        delivered: &mut Vec<Bytes>,
    ) {
        let sn = header.sn;
        debug!("{} Rx data PDU segment {} ({} bytes)", self.rb_name, header, data.len());

        if !self.accept_sn(state, &header) {
            return;
        }

        if header.li_sum() > data.len() || header.so as usize + data.len() > MAX_PDU_SIZE {
            warn!(
                "{} Dropping corrupted segment SN={} SO={} ({} bytes, LI sum {})",
                self.rb_name,
                sn,
                header.so,
                data.len(),
                header.li_sum()
            );
            state.metrics.num_dropped_pdus += 1;
            return;
        }

        state.update_vr_h(sn);
        let poll = header.p;
        let segments = state.rx_segments.entry(sn).or_default();
        let complete = segments.add_and_check(RxPdu { header, buf: data });
        let n_segments = segments.len();
        match complete {
            Some(mut full) => {
                debug!("{} SN={} complete from segments", self.rb_name, sn);
                state.rx_segments.remove(&sn);
                full.header.p = poll;
                self.handle_data_pdu(state, full.header, full.buf, delivered);
            }
            None => {
                debug!("{} SN={} holds {} segments", self.rb_name, sn, n_segments);
                if poll {
                    info!("{} Poll received on segment of SN={}", self.rb_name, sn);
                    state.poll_received = true;
                    if state.rx_mod(sn) < state.rx_mod(state.vr_ms) {
                        state.do_status = true;
                    }
                }
                self.update_reordering_timer(state);
                self.debug_state(state);
            }
        }
    }

    fn reassemble_rx_sdus(&self, state: &mut RxState, delivered: &mut Vec<Bytes>) {
        while let Some(pdu) = state.rx_window.remove(&state.vr_r) {
            self.reassemble_pdu(&mut state.rx_sdu, pdu, delivered);
            state.rx_segments.remove(&state.vr_r);
            state.vr_r = inc_sn(state.vr_r);
            state.vr_mr = inc_sn(state.vr_mr);
        }
    }

    /// Split one in-sequence PDU into SDU pieces
    fn reassemble_pdu(&self, rx_sdu: &mut BytesMut, pdu: RxPdu, delivered: &mut Vec<Bytes>) {
        let RxPdu { header, mut buf } = pdu;
        let sn = header.sn;

        if header.fi.is_start_aligned() && !rx_sdu.is_empty() {
            warn!(
                "{} SN={} starts a new SDU with {} bytes pending - discarding partial SDU",
                self.rb_name,
                sn,
                rx_sdu.len()
            );
            rx_sdu.clear();
        }
        // leading bytes belong to an SDU whose head was discarded
        let mut orphan_head = !header.fi.is_start_aligned() && rx_sdu.is_empty();

        for &li in &header.li {
            let li = li as usize;
            if li > buf.len() {
                error!("{} SN={} LI {} beyond remaining {} bytes", self.rb_name, sn, li, buf.len());
                rx_sdu.clear();
                return;
            }
            let chunk = buf.split_to(li);
            if orphan_head {
                debug!("{} SN={} dropping {} orphan bytes", self.rb_name, sn, chunk.len());
                orphan_head = false;
                continue;
            }
            if rx_sdu.len() + chunk.len() > MAX_SDU_SIZE {
                error!(
                    "{} Reassembly desync at SN={}: SDU would exceed {} bytes",
                    self.rb_name, sn, MAX_SDU_SIZE
                );
                rx_sdu.clear();
                return;
            }
            rx_sdu.extend_from_slice(&chunk);
            delivered.push(rx_sdu.split().freeze());
        }

        if orphan_head {
            debug!("{} SN={} dropping {} orphan bytes", self.rb_name, sn, buf.len());
            return;
        }
        if rx_sdu.len() + buf.len() > MAX_SDU_SIZE {
            error!(
                "{} Reassembly desync at SN={}: SDU would exceed {} bytes",
                self.rb_name, sn, MAX_SDU_SIZE
            );
            rx_sdu.clear();
            return;
        }
        rx_sdu.extend_from_slice(&buf);
        if header.fi.is_end_aligned() && !rx_sdu.is_empty() {
            delivered.push(rx_sdu.split().freeze());
        }
    }

    fn update_reordering_timer(&self, state: &mut RxState) {
        let Some(timer) = &self.reordering_timer else {
            return;
        };

        if timer.is_running() {
            let vr_x_left = !state.in_window(state.vr_x) && state.vr_x != state.vr_mr;
            if state.vr_x == state.vr_r || vr_x_left {
                debug!("{} Stopping reordering timer (vr_x={})", self.rb_name, state.vr_x);
                timer.stop();
            }
        }

        if !timer.is_running() && state.rx_mod(state.vr_h) > state.rx_mod(state.vr_r) {
            debug!("{} Starting reordering timer (vr_h={})", self.rb_name, state.vr_h);
            timer.run();
            state.vr_x = state.vr_h;
        }
    }

    pub fn timer_expired(&self, id: TimerId) {
        let Some(timer) = &self.reordering_timer else {
            return;
        };
        if timer.id() != id {
            return;
        }

        let mut state = self.state.lock();
        if !timer.is_expired() {
            return;
        }
        debug!("{} Reordering timeout - updating vr_ms (was {})", self.rb_name, state.vr_ms);

        let mut vr_ms = state.vr_x;
        while state.rx_window.contains_key(&vr_ms) {
            vr_ms = inc_sn(vr_ms);
        }
        if state.rx_mod(vr_ms) > state.rx_mod(state.vr_ms) {
            state.vr_ms = vr_ms;
        }

        if state.poll_received {
            state.do_status = true;
        }

        if state.rx_mod(state.vr_h) > state.rx_mod(state.vr_ms) {
            timer.run();
            state.vr_x = state.vr_h;
        }
        self.debug_state(&state);
    }

    /// Build a STATUS PDU no larger than `max_len` and clear the pending request
    ///
    /// When not every NACK fits, ACK_SN is set to the first SN that could not
    /// be reported so nothing missing is implicitly acknowledged.
    pub fn get_status_pdu(&self, max_len: usize) -> Option<StatusPdu> {
        if max_len < STATUS_MIN_LEN {
            return None;
        }

        let mut state = self.state.lock();
        let mut status = StatusPdu::new(state.vr_ms);
        let mut truncated_at = None;
        for sn in state.missing_sns() {
            if status_packed_len(status.nacks.iter().chain([Nack::full(sn)].iter())) > max_len {
                truncated_at = Some(sn);
                break;
            }
            status.nacks.push(Nack::full(sn));
        }
        if let Some(sn) = truncated_at {
            debug!(
                "{} Status PDU truncated to {} NACKs to fit {} bytes",
                self.rb_name,
                status.nacks.len(),
                max_len
            );
            status.ack_sn = sn;
        }

        state.do_status = false;
        state.poll_received = false;
        Some(status)
    }

    /// Size of the complete STATUS PDU
    pub fn get_status_pdu_length(&self) -> usize {
        let state = self.state.lock();
        let n_nacks = state.missing_sns().count();
        status_packed_len(&vec![Nack::full(0); n_nacks])
    }

    pub fn get_do_status(&self) -> bool {
        self.state.lock().do_status
    }

    pub fn get_metrics(&self) -> RlcBearerMetrics {
        self.state.lock().metrics.clone()
    }

    pub fn reset_metrics(&self) {
        self.state.lock().metrics = RlcBearerMetrics::default();
    }

    fn debug_state(&self, state: &RxState) {
        debug!(
            "{} vr_r={} vr_mr={} vr_x={} vr_ms={} vr_h={} rx_window={} rx_segments={}",
            self.rb_name,
            state.vr_r,
            state.vr_mr,
            state.vr_x,
            state.vr_ms,
            state.vr_h,
            state.rx_window.len(),
            state.rx_segments.len()
        );
    }
}
