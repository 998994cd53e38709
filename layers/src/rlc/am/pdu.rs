//! AM PDU Codec
//!
//! Bit-exact packing of the AMD PDU header (with optional resegmentation
//! part and LI extension chain) and the STATUS control PDU, as defined in
//! 3GPP TS 36.322 section 6.2.1.

use super::{SN_MOD, SO_END, WINDOW_SIZE};
use bitflags::bitflags;
use bytes::Bytes;
use common::utils::{BitReader, BitWriter};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use std::fmt;
use thiserror::Error;

/// Width of the Length Indicator field in bits
pub const LI_BITS: u8 = 11;
/// Largest value an LI can carry
pub const MAX_LI_VALUE: u16 = (1 << LI_BITS) - 1;
/// Fixed part of a data PDU header in bytes
pub const DATA_HEADER_FIXED_LEN: usize = 2;
/// Additional bytes carried by a segment header (LSF + SO)
pub const SEGMENT_HEADER_EXTRA_LEN: usize = 2;
/// Smallest possible status PDU (ACK_SN only)
pub const STATUS_MIN_LEN: usize = 2;

/// PDU codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PduError {
    #[error("PDU truncated")]
    Truncated,

    #[error("Reserved control PDU type {0}")]
    ReservedControlType(u8),

    #[error("Not a data PDU")]
    NotDataPdu,

    #[error("Not a control PDU")]
    NotControlPdu,

    #[error("Too many length indicators")]
    TooManyLengthIndicators,

    #[error("Invalid length indicator {0}")]
    InvalidLengthIndicator(u16),
}

/// D/C field of the first header octet
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum DcField {
    /// Control PDU
    Control = 0,
    /// Data PDU
    Data = 1,
}

/// CPT field of a control PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ControlPduType {
    /// STATUS PDU
    Status = 0,
}

bitflags! {
    /// Framing Info field
    ///
    /// The empty set means the PDU payload starts and ends on SDU boundaries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FramingInfo: u8 {
        /// Last byte of the payload is not the last byte of an SDU
        const NOT_END_ALIGNED = 0b01;
        /// First byte of the payload is not the first byte of an SDU
        const NOT_START_ALIGNED = 0b10;
    }
}

impl FramingInfo {
    pub fn is_start_aligned(self) -> bool {
        !self.contains(Self::NOT_START_ALIGNED)
    }

    pub fn is_end_aligned(self) -> bool {
        !self.contains(Self::NOT_END_ALIGNED)
    }
}

/// Read the D/C bit of a received PDU
pub fn dc_field(payload: &[u8]) -> Option<DcField> {
    payload.first().and_then(|b| DcField::from_u8(b >> 7))
}

/// True if the buffer holds a control PDU
pub fn is_control_pdu(payload: &[u8]) -> bool {
    dc_field(payload) == Some(DcField::Control)
}

/// Packed size of a data PDU header with `n_li` length indicators
pub fn data_header_len(rf: bool, n_li: usize) -> usize {
    let fixed = if rf {
        DATA_HEADER_FIXED_LEN + SEGMENT_HEADER_EXTRA_LEN
    } else {
        DATA_HEADER_FIXED_LEN
    };
    // each E+LI element is 12 bits, padded to a whole byte
    fixed + (n_li * 12 + 4) / 8
}

/// AMD PDU header
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AmdPduHeader {
    /// Resegmentation flag (PDU segment)
    pub rf: bool,
    /// Polling bit
    pub p: bool,
    /// Framing info
    pub fi: FramingInfo,
    /// Sequence number
    pub sn: u16,
    /// Last segment flag (segments only)
    pub lsf: bool,
    /// Segment offset in bytes (segments only)
    pub so: u16,
    /// Length indicators
    pub li: Vec<u16>,
}

impl AmdPduHeader {
    /// Header for a new, unsegmented data PDU
    pub fn new(sn: u16) -> Self {
        Self {
            sn,
            ..Default::default()
        }
    }

    /// Size of the header once packed
    pub fn packed_len(&self) -> usize {
        data_header_len(self.rf, self.li.len())
    }

    /// Sum of the sized SDU fields
    pub fn li_sum(&self) -> usize {
        self.li.iter().map(|&l| l as usize).sum()
    }

    pub fn pack(&self) -> Bytes {
        let mut w = BitWriter::with_capacity(self.packed_len());
        w.write_bits(DcField::Data as u32, 1);
        w.write_bit(self.rf);
        w.write_bit(self.p);
        w.write_bits(self.fi.bits() as u32, 2);
        w.write_bit(!self.li.is_empty());
        w.write_bits((self.sn % SN_MOD) as u32, 10);

        if self.rf {
            w.write_bit(self.lsf);
            w.write_bits(self.so as u32, 15);
        }

        for (i, &li) in self.li.iter().enumerate() {
            let more = i + 1 < self.li.len();
            w.write_bit(more);
            w.write_bits((li & MAX_LI_VALUE) as u32, LI_BITS);
        }

        w.finish()
    }

    /// Parse a header, returning it with the number of bytes it occupied
    pub fn unpack(payload: &[u8]) -> Result<(Self, usize), PduError> {
        let mut r = BitReader::new(payload);
        let dc = r.read_bits(1).ok_or(PduError::Truncated)?;
        if DcField::from_u32(dc) != Some(DcField::Data) {
            return Err(PduError::NotDataPdu);
        }

        let rf = r.read_bit().ok_or(PduError::Truncated)?;
        let p = r.read_bit().ok_or(PduError::Truncated)?;
        let fi = r.read_bits(2).ok_or(PduError::Truncated)?;
        let mut ext = r.read_bit().ok_or(PduError::Truncated)?;
        let sn = r.read_bits(10).ok_or(PduError::Truncated)? as u16;

        let (lsf, so) = if rf {
            let lsf = r.read_bit().ok_or(PduError::Truncated)?;
            let so = r.read_bits(15).ok_or(PduError::Truncated)? as u16;
            (lsf, so)
        } else {
            (false, 0)
        };

        let mut li = Vec::new();
        while ext {
            if li.len() >= WINDOW_SIZE as usize {
                return Err(PduError::TooManyLengthIndicators);
            }
            ext = r.read_bit().ok_or(PduError::Truncated)?;
            let value = r.read_bits(LI_BITS).ok_or(PduError::Truncated)? as u16;
            if value == 0 {
                return Err(PduError::InvalidLengthIndicator(value));
            }
            li.push(value);
        }
        r.align();

        let header = Self {
            rf,
            p,
            fi: FramingInfo::from_bits_truncate(fi as u8),
            sn,
            lsf,
            so,
            li,
        };
        Ok((header, r.bytes_consumed()))
    }
}

impl fmt::Display for AmdPduHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[DATA SN={} RF={} P={} FI={:02b}",
            self.sn, self.rf as u8, self.p as u8, self.fi.bits()
        )?;
        if self.rf {
            write!(f, " LSF={} SO={}", self.lsf as u8, self.so)?;
        }
        if !self.li.is_empty() {
            write!(f, " LI={:?}", self.li)?;
        }
        write!(f, "]")
    }
}

/// Byte range of a NACKed PDU, `end` inclusive or [`SO_END`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoRange {
    pub start: u16,
    pub end: u16,
}

impl SoRange {
    /// Range from `start` to the end of the PDU
    pub fn to_end(start: u16) -> Self {
        Self { start, end: SO_END }
    }
}

/// One entry of the NACK list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nack {
    pub nack_sn: u16,
    pub so: Option<SoRange>,
}

impl Nack {
    /// NACK for a whole PDU
    pub fn full(nack_sn: u16) -> Self {
        Self { nack_sn, so: None }
    }

    fn packed_bits(&self) -> usize {
        // NACK_SN + E1 + E2, plus SOstart and SOend
        if self.so.is_some() {
            42
        } else {
            12
        }
    }
}

/// STATUS PDU
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusPdu {
    pub ack_sn: u16,
    pub nacks: Vec<Nack>,
}

/// Packed size of a status PDU carrying the given NACKs
pub fn status_packed_len<'a>(nacks: impl IntoIterator<Item = &'a Nack>) -> usize {
    let bits: usize = 15 + nacks.into_iter().map(Nack::packed_bits).sum::<usize>();
    (bits + 7) / 8
}

impl StatusPdu {
    pub fn new(ack_sn: u16) -> Self {
        Self {
            ack_sn,
            nacks: Vec::new(),
        }
    }

    pub fn packed_len(&self) -> usize {
        status_packed_len(&self.nacks)
    }

    /// NACK entry for `sn`, if any
    pub fn nack(&self, sn: u16) -> Option<&Nack> {
        self.nacks.iter().find(|n| n.nack_sn == sn)
    }

    /// A NACK must never name the ACK_SN itself
    pub fn is_valid(&self) -> bool {
        self.nacks.iter().all(|n| n.nack_sn != self.ack_sn)
    }

    pub fn pack(&self) -> Bytes {
        let mut w = BitWriter::with_capacity(self.packed_len());
        w.write_bits(DcField::Control as u32, 1);
        w.write_bits(ControlPduType::Status as u32, 3);
        w.write_bits((self.ack_sn % SN_MOD) as u32, 10);
        w.write_bit(!self.nacks.is_empty());

        for (i, nack) in self.nacks.iter().enumerate() {
            let more = i + 1 < self.nacks.len();
            w.write_bits((nack.nack_sn % SN_MOD) as u32, 10);
            w.write_bit(more);
            w.write_bit(nack.so.is_some());
            if let Some(so) = nack.so {
                w.write_bits(so.start as u32, 15);
                w.write_bits(so.end as u32, 15);
            }
        }

        w.finish()
    }

    pub fn unpack(payload: &[u8]) -> Result<Self, PduError> {
        let mut r = BitReader::new(payload);
        let dc = r.read_bits(1).ok_or(PduError::Truncated)?;
        if DcField::from_u32(dc) != Some(DcField::Control) {
            return Err(PduError::NotControlPdu);
        }
        let cpt = r.read_bits(3).ok_or(PduError::Truncated)?;
        ControlPduType::from_u32(cpt).ok_or(PduError::ReservedControlType(cpt as u8))?;

        let ack_sn = r.read_bits(10).ok_or(PduError::Truncated)? as u16;
        let mut e1 = r.read_bit().ok_or(PduError::Truncated)?;

        let mut nacks = Vec::new();
        while e1 {
            if nacks.len() >= WINDOW_SIZE as usize {
                return Err(PduError::TooManyLengthIndicators);
            }
            let nack_sn = r.read_bits(10).ok_or(PduError::Truncated)? as u16;
            e1 = r.read_bit().ok_or(PduError::Truncated)?;
            let e2 = r.read_bit().ok_or(PduError::Truncated)?;
            let so = if e2 {
                let start = r.read_bits(15).ok_or(PduError::Truncated)? as u16;
                let end = r.read_bits(15).ok_or(PduError::Truncated)? as u16;
                Some(SoRange { start, end })
            } else {
                None
            };
            nacks.push(Nack { nack_sn, so });
        }

        Ok(Self { ack_sn, nacks })
    }
}

impl fmt::Display for StatusPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[STATUS ACK_SN={} N_nack={}", self.ack_sn, self.nacks.len())?;
        for nack in &self.nacks {
            match nack.so {
                Some(so) => write!(f, " NACK_SN={}[{}:{}]", nack.nack_sn, so.start, so.end)?,
                None => write!(f, " NACK_SN={}", nack.nack_sn)?,
            }
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_header_bytes() {
        let mut h = AmdPduHeader::new(0x155);
        h.p = true;
        h.fi = FramingInfo::NOT_END_ALIGNED;
        let packed = h.pack();
        // D/C=1 RF=0 P=1 FI=01 E=0 SN=01 0101 0101
        assert_eq!(packed.as_ref(), &[0b1010_1001, 0x55]);
        assert_eq!(AmdPduHeader::unpack(&packed).unwrap(), (h, 2));
    }

    #[test]
    fn test_li_chain_padding() {
        let mut h = AmdPduHeader::new(3);
        h.li = vec![10];
        let packed = h.pack();
        assert_eq!(packed.len(), 4);
        // E=1 then E=0, LI=10 (000 0000 1010), 4 bits padding
        assert_eq!(packed.as_ref(), &[0x84, 0x03, 0x00, 0xA0]);

        h.li = vec![1, 2];
        let packed = h.pack();
        assert_eq!(packed.len(), 5);
        assert_eq!(AmdPduHeader::unpack(&packed).unwrap().0.li, vec![1, 2]);
    }

    #[test]
    fn test_header_packed_len_matches() {
        for n_li in [0usize, 1, 2, 3, 4, 7, 100, 512] {
            for rf in [false, true] {
                for fi in 0..4u8 {
                    let mut h = AmdPduHeader::new(1023);
                    h.rf = rf;
                    h.lsf = rf;
                    h.so = if rf { 0x7FFE } else { 0 };
                    h.fi = FramingInfo::from_bits_truncate(fi);
                    h.li = (0..n_li).map(|i| (i % 2047) as u16 + 1).collect();
                    let packed = h.pack();
                    assert_eq!(packed.len(), h.packed_len());
                    assert_eq!(packed.len(), data_header_len(rf, n_li));
                    let (parsed, used) = AmdPduHeader::unpack(&packed).unwrap();
                    assert_eq!(used, packed.len());
                    assert_eq!(parsed.fi.bits(), fi);
                    assert_eq!(parsed, h);
                }
            }
        }
    }

    #[test]
    fn test_header_trailing_payload_untouched() {
        let mut h = AmdPduHeader::new(7);
        h.rf = true;
        h.so = 100;
        h.li = vec![5, 6, 7];
        let mut pdu = h.pack().to_vec();
        let head_len = pdu.len();
        pdu.extend_from_slice(&[0xAA; 20]);
        let (parsed, used) = AmdPduHeader::unpack(&pdu).unwrap();
        assert_eq!(used, head_len);
        assert_eq!(parsed.li_sum(), 18);
    }

    #[test]
    fn test_header_decode_failures() {
        assert_eq!(AmdPduHeader::unpack(&[]), Err(PduError::Truncated));
        assert_eq!(AmdPduHeader::unpack(&[0x80]), Err(PduError::Truncated));
        assert_eq!(AmdPduHeader::unpack(&[0x00, 0x00]), Err(PduError::NotDataPdu));
        // E=1 but no LI follows
        assert_eq!(AmdPduHeader::unpack(&[0x84, 0x00]), Err(PduError::Truncated));
        // LI of zero is reserved
        assert_eq!(
            AmdPduHeader::unpack(&[0x84, 0x00, 0x00, 0x00]),
            Err(PduError::InvalidLengthIndicator(0))
        );
    }

    #[test]
    fn test_status_bytes() {
        let status = StatusPdu {
            ack_sn: 5,
            nacks: vec![Nack::full(1)],
        };
        let packed = status.pack();
        assert_eq!(packed.len(), 4);
        assert_eq!(packed.len(), status.packed_len());
        // D/C=0 CPT=000 ACK_SN=0000000101 E1=1 NACK_SN=0000000001 E1=0 E2=0
        assert_eq!(packed.as_ref(), &[0x00, 0x16, 0x00, 0x80]);
        assert_eq!(StatusPdu::unpack(&packed).unwrap(), status);
    }

    #[test]
    fn test_status_round_trip_with_segments() {
        let status = StatusPdu {
            ack_sn: 1023,
            nacks: vec![
                Nack::full(1000),
                Nack {
                    nack_sn: 1001,
                    so: Some(SoRange { start: 0, end: 99 }),
                },
                Nack {
                    nack_sn: 1010,
                    so: Some(SoRange::to_end(12)),
                },
                Nack::full(0),
            ],
        };
        let packed = status.pack();
        assert_eq!(packed.len(), (15 + 12 + 42 + 42 + 12 + 7) / 8);
        assert_eq!(packed.len(), status.packed_len());
        let parsed = StatusPdu::unpack(&packed).unwrap();
        assert_eq!(parsed, status);
        assert!(parsed.is_valid());
        assert_eq!(parsed.nack(1010).and_then(|n| n.so), Some(SoRange::to_end(12)));
    }

    #[test]
    fn test_status_decode_failures() {
        assert_eq!(StatusPdu::unpack(&[0x00]), Err(PduError::Truncated));
        assert_eq!(StatusPdu::unpack(&[0x80, 0x00]), Err(PduError::NotControlPdu));
        assert_eq!(StatusPdu::unpack(&[0x10, 0x00]), Err(PduError::ReservedControlType(1)));
        // E1 set but NACK truncated
        assert_eq!(StatusPdu::unpack(&[0x00, 0x16]), Err(PduError::Truncated));
    }

    #[test]
    fn test_dc_field_dispatch() {
        assert!(is_control_pdu(&[0x00, 0x14]));
        assert!(!is_control_pdu(&[0x80, 0x00]));
        assert!(!is_control_pdu(&[]));
        assert_eq!(dc_field(&[0x80]), Some(DcField::Data));
    }

    #[test]
    fn test_framing_info_alignment() {
        assert!(FramingInfo::empty().is_start_aligned());
        assert!(FramingInfo::NOT_END_ALIGNED.is_start_aligned());
        assert!(!FramingInfo::NOT_END_ALIGNED.is_end_aligned());
        assert!(!FramingInfo::all().is_start_aligned());
        assert_eq!(FramingInfo::all().bits(), 3);
    }

    #[test]
    fn test_header_display() {
        let mut h = AmdPduHeader::new(9);
        h.rf = true;
        h.lsf = true;
        h.so = 40;
        h.li = vec![3];
        assert_eq!(h.to_string(), "[DATA SN=9 RF=1 P=0 FI=00 LSF=1 SO=40 LI=[3]]");
    }
}
