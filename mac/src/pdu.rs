//! MAC PDU Implementation
//!
//! DL-SCH multiplexing, UL-SCH demultiplexing and the random access
//! response PDU according to 3GPP TS 36.321 6.1 and 6.2.

use crate::grants::RarGrant;
use crate::MacError;
use bytes::{BufMut, Bytes, BytesMut};
use common::{Lcid, Rnti, Tti, UnitRange};
use nom::bytes::complete::take;
use nom::number::complete::be_u8;
use nom::IResult;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tracing::trace;

/// LCID of padding in both directions
pub const PADDING_LCID: u8 = 31;

/// Largest SDU a 15-bit length field can describe
const MAX_SDU_LEN: usize = 0x7fff;

/// Transmit power command placed in every RAR grant (0 dB)
const RAR_TPC: u8 = 3;

/// Msg3 subframe offset signalled with the UL delay bit cleared
const MSG3_BASE_DELAY: u32 = 6;

/// Buffer size levels of the BSR index (TS 36.321 Table 6.1.3.1-1), upper
/// bound in bytes
const BSR_TABLE: [u32; 64] = [
    0, 10, 12, 14, 17, 19, 22, 26, 31, 36, 42, 49, 57, 67, 78, 91, 107, 125, 146, 171, 200, 234, 274, 321,
    376, 440, 515, 603, 706, 826, 967, 1132, 1326, 1552, 1817, 2127, 2490, 2915, 3413, 3995, 4677, 5476, 6411,
    7505, 8787, 10287, 12043, 14099, 16507, 19325, 22624, 26487, 31009, 36304, 42502, 49759, 58255, 68201,
    79846, 93479, 109439, 128125, 150000, 150000,
];

/// Power headroom level 0 stands for -23 dB (TS 36.133 9.1.8.4)
const PHR_OFFSET_DB: i8 = 23;

/// DL-SCH control element LCIDs (TS 36.321 Table 6.2.1-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum DlControlLcid {
    ContentionResolution = 28,
    TimingAdvance = 29,
    Padding = 31,
}

/// UL-SCH control element LCIDs (TS 36.321 Table 6.2.1-2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum UlControlLcid {
    PowerHeadroom = 26,
    CRnti = 27,
    TruncatedBsr = 28,
    ShortBsr = 29,
    LongBsr = 30,
    Padding = 31,
}

impl UlControlLcid {
    /// Fixed payload size of the control element
    pub fn payload_size(self) -> usize {
        match self {
            UlControlLcid::PowerHeadroom | UlControlLcid::TruncatedBsr | UlControlLcid::ShortBsr => 1,
            UlControlLcid::CRnti => 2,
            UlControlLcid::LongBsr => 3,
            UlControlLcid::Padding => 0,
        }
    }
}

/// Upper bound in bytes of a BSR buffer size index
pub fn bsr_bytes(index: u8) -> u32 {
    BSR_TABLE[(index & 0x3f) as usize]
}

/// Power headroom in dB of a PHR report
pub fn phr_db(level: u8) -> i8 {
    (level & 0x3f) as i8 - PHR_OFFSET_DB
}

// Downlink

/// One element of a DL-SCH MAC PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlElement {
    /// UE contention resolution identity (first 6 bytes of the CCCH SDU)
    ContentionResolution([u8; 6]),
    /// Timing advance command: TAG id and 6-bit command
    TimingAdvance { tag: u8, command: u8 },
    Sdu { lcid: Lcid, data: Bytes },
}

impl DlElement {
    fn lcid(&self) -> u8 {
        match self {
            DlElement::ContentionResolution(_) => DlControlLcid::ContentionResolution as u8,
            DlElement::TimingAdvance { .. } => DlControlLcid::TimingAdvance as u8,
            DlElement::Sdu { lcid, .. } => lcid.0,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            DlElement::ContentionResolution(_) => 6,
            DlElement::TimingAdvance { .. } => 1,
            DlElement::Sdu { data, .. } => data.len(),
        }
    }

    fn subheader_len(&self, with_length: bool) -> usize {
        match self {
            DlElement::Sdu { data, .. } if with_length => {
                if data.len() < 128 {
                    2
                } else {
                    3
                }
            }
            _ => 1,
        }
    }

    fn put_payload(&self, buf: &mut BytesMut) {
        match self {
            DlElement::ContentionResolution(id) => buf.put_slice(id),
            DlElement::TimingAdvance { tag, command } => buf.put_u8(((tag & 0x3) << 6) | (command & 0x3f)),
            DlElement::Sdu { data, .. } => buf.put_slice(data),
        }
    }
}

/// R/R/E/LCID subheader, followed by F/L when a length is given
fn put_subheader(buf: &mut BytesMut, lcid: u8, extend: bool, len: Option<usize>) {
    buf.put_u8(((extend as u8) << 5) | (lcid & 0x1f));
    match len {
        Some(len) if len < 128 => buf.put_u8(len as u8),
        Some(len) => buf.put_u16(0x8000 | len as u16),
        None => {}
    }
}

/// Multiplex control elements and SDUs into a MAC PDU of exactly `tbs`
/// bytes
///
/// Control elements are placed before SDUs. One or two bytes of padding
/// become padding subheaders in front of the header; more padding gets a
/// trailing padding subheader and every SDU keeps its length field.
pub fn build_dl_pdu(elements: &[DlElement], tbs: usize) -> Result<Bytes, MacError> {
    let mut ordered: Vec<&DlElement> = elements.iter().collect();
    ordered.sort_by_key(|e| matches!(e, DlElement::Sdu { .. }));
    if let Some(e) = ordered.iter().find(|e| e.payload_len() > MAX_SDU_LEN) {
        return Err(MacError::InvalidPdu(format!("SDU of {} bytes too long", e.payload_len())));
    }

    let payload: usize = ordered.iter().map(|e| e.payload_len()).sum();
    let full_header: usize = ordered.iter().map(|e| e.subheader_len(true)).sum();
    let compact_header = match ordered.last() {
        Some(last) => full_header - last.subheader_len(true) + last.subheader_len(false),
        None => 0,
    };

    let compact = compact_header + payload;
    let (front_padding, tail_padding) = if tbs >= compact && tbs - compact <= 2 {
        (tbs - compact, None)
    } else if tbs > full_header + payload {
        (0, Some(tbs - full_header - payload - 1))
    } else {
        return Err(MacError::InvalidPdu(format!(
            "{} bytes of MAC PDU do not fit a TB of {} bytes",
            compact, tbs
        )));
    };

    let nof_subheaders = front_padding + ordered.len() + tail_padding.is_some() as usize;
    let mut buf = BytesMut::with_capacity(tbs);
    let mut written = 0;
    for _ in 0..front_padding {
        written += 1;
        put_subheader(&mut buf, PADDING_LCID, written < nof_subheaders, None);
    }
    for (idx, element) in ordered.iter().enumerate() {
        written += 1;
        let compact_last = idx + 1 == ordered.len() && tail_padding.is_none();
        let len = match element {
            DlElement::Sdu { data, .. } if !compact_last => Some(data.len()),
            _ => None,
        };
        put_subheader(&mut buf, element.lcid(), written < nof_subheaders, len);
    }
    if tail_padding.is_some() {
        put_subheader(&mut buf, PADDING_LCID, false, None);
    }
    for element in &ordered {
        element.put_payload(&mut buf);
    }
    if let Some(n) = tail_padding {
        buf.put_bytes(0, n);
    }
    trace!("DL MAC PDU: {} elements, {} of {} bytes payload", ordered.len(), payload, tbs);
    Ok(buf.freeze())
}

// Uplink

/// One element of a UL-SCH MAC PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UlElement {
    Sdu { lcid: Lcid, data: Bytes },
    /// Short or truncated BSR for one logical channel group
    ShortBsr { lcg: u8, bytes: u32, truncated: bool },
    LongBsr { bytes: [u32; 4] },
    PowerHeadroom { db: i8 },
    CRnti(Rnti),
}

#[derive(Debug, Clone, Copy)]
struct Subheader {
    lcid: u8,
    extend: bool,
    len: Option<usize>,
}

fn subheader(input: &[u8]) -> IResult<&[u8], Subheader> {
    let (input, first) = be_u8(input)?;
    let extend = first & 0x20 != 0;
    let lcid = first & 0x1f;
    // Control elements have a fixed size, the last subheader has no length
    if !extend || UlControlLcid::from_u8(lcid).is_some() {
        return Ok((input, Subheader { lcid, extend, len: None }));
    }
    let (input, high) = be_u8(input)?;
    if high & 0x80 == 0 {
        return Ok((input, Subheader { lcid, extend, len: Some(high as usize) }));
    }
    let (input, low) = be_u8(input)?;
    let len = ((high as usize & 0x7f) << 8) | low as usize;
    Ok((input, Subheader { lcid, extend, len: Some(len) }))
}

fn subheaders(mut input: &[u8]) -> IResult<&[u8], Vec<Subheader>> {
    let mut headers = Vec::new();
    loop {
        let (rest, sh) = subheader(input)?;
        input = rest;
        headers.push(sh);
        if !sh.extend {
            return Ok((input, headers));
        }
    }
}

fn truncated(_: nom::Err<nom::error::Error<&[u8]>>) -> MacError {
    MacError::InvalidPdu("truncated UL MAC PDU".into())
}

/// Split a UL-SCH MAC PDU into its control elements and SDUs; padding is
/// dropped
pub fn parse_ul_pdu(pdu: &Bytes) -> Result<Vec<UlElement>, MacError> {
    let (mut rest, headers) = subheaders(pdu).map_err(truncated)?;
    let mut elements = Vec::with_capacity(headers.len());

    for sh in headers {
        let control = UlControlLcid::from_u8(sh.lcid);
        if control.is_none() && sh.lcid > Lcid::MAX {
            return Err(MacError::InvalidPdu(format!("reserved LCID {}", sh.lcid)));
        }
        let size = match (control, sh.len) {
            (Some(ce), _) => ce.payload_size(),
            (None, Some(len)) => len,
            (None, None) => rest.len(),
        };
        let (tail, body) = take(size)(rest).map_err(truncated)?;
        rest = tail;

        let element = match control {
            None => UlElement::Sdu { lcid: Lcid(sh.lcid), data: pdu.slice_ref(body) },
            Some(UlControlLcid::ShortBsr) | Some(UlControlLcid::TruncatedBsr) => UlElement::ShortBsr {
                lcg: body[0] >> 6,
                bytes: bsr_bytes(body[0]),
                truncated: control == Some(UlControlLcid::TruncatedBsr),
            },
            Some(UlControlLcid::LongBsr) => {
                let bits = (body[0] as u32) << 16 | (body[1] as u32) << 8 | body[2] as u32;
                let mut bytes = [0; 4];
                for (lcg, b) in bytes.iter_mut().enumerate() {
                    *b = bsr_bytes((bits >> (18 - 6 * lcg)) as u8);
                }
                UlElement::LongBsr { bytes }
            }
            Some(UlControlLcid::PowerHeadroom) => UlElement::PowerHeadroom { db: phr_db(body[0]) },
            Some(UlControlLcid::CRnti) => UlElement::CRnti(Rnti(u16::from_be_bytes([body[0], body[1]]))),
            Some(UlControlLcid::Padding) => continue,
        };
        elements.push(element);
    }
    Ok(elements)
}

// Random access response

/// 20-bit UL grant of a MAC RAR (TS 36.213 6.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RarUlGrant {
    pub hopping: bool,
    /// Resource indication value, 10 bits
    pub riv: u16,
    /// Truncated MCS, 4 bits
    pub mcs: u8,
    pub tpc: u8,
    pub ul_delay: bool,
    pub csi_request: bool,
}

impl RarUlGrant {
    pub fn pack(&self) -> u32 {
        (self.hopping as u32) << 19
            | (self.riv as u32 & 0x3ff) << 9
            | (self.mcs as u32 & 0xf) << 5
            | (self.tpc as u32 & 0x7) << 2
            | (self.ul_delay as u32) << 1
            | self.csi_request as u32
    }

    pub fn unpack(bits: u32) -> Self {
        Self {
            hopping: bits >> 19 & 1 != 0,
            riv: (bits >> 9 & 0x3ff) as u16,
            mcs: (bits >> 5 & 0xf) as u8,
            tpc: (bits >> 2 & 0x7) as u8,
            ul_delay: bits >> 1 & 1 != 0,
            csi_request: bits & 1 != 0,
        }
    }
}

/// Resource indication value of a contiguous allocation (TS 36.213 8.1.1)
pub fn riv(nof_prb: u16, range: UnitRange) -> u32 {
    let n = nof_prb as u32;
    let len = range.length as u32;
    let start = range.start as u32;
    if len - 1 <= n / 2 {
        n * (len - 1) + start
    } else {
        n * (n - len + 1) + (n - 1 - start)
    }
}

/// Encode the RAR PDU of `grant`, sent at `rar_tti`, padded to its TBS
pub fn build_rar_pdu(grant: &RarGrant, rar_tti: Tti, cell_nof_prb: u16) -> Result<Bytes, MacError> {
    let tbs = grant.tbs_bytes as usize;
    let mut buf = BytesMut::with_capacity(tbs);
    for (idx, entry) in grant.entries.iter().enumerate() {
        let extend = idx + 1 < grant.entries.len();
        buf.put_u8((extend as u8) << 7 | 1 << 6 | (entry.preamble_id & 0x3f));
    }
    for entry in &grant.entries {
        let riv = riv(cell_nof_prb, entry.msg3_range);
        if riv > 0x3ff || entry.msg3_mcs > 15 {
            return Err(MacError::InvalidPdu(format!(
                "Msg3 grant riv={} mcs={} does not fit a RAR",
                riv, entry.msg3_mcs
            )));
        }
        let ul = RarUlGrant {
            hopping: false,
            riv: riv as u16,
            mcs: entry.msg3_mcs,
            tpc: RAR_TPC,
            ul_delay: entry.msg3_tti.since(rar_tti) > MSG3_BASE_DELAY,
            csi_request: false,
        }
        .pack();
        let ta = entry.timing_advance as u32 & 0x7ff;
        buf.put_u8((ta >> 4) as u8);
        buf.put_u8(((ta & 0xf) << 4) as u8 | (ul >> 16) as u8 & 0xf);
        buf.put_u16(ul as u16);
        buf.put_u16(entry.temp_rnti.0);
    }
    if buf.len() > tbs {
        return Err(MacError::InvalidPdu(format!("RAR of {} bytes exceeds TBS {}", buf.len(), tbs)));
    }
    buf.put_bytes(0, tbs - buf.len());
    Ok(buf.freeze())
}
