//! ECHONET-Lite frame codec.
//!
//! Frame layout (binary, carried as hex inside `SKSENDTO` / `ERXUDP`):
//!
//! ```text
//! 0     2     4       7       10   11   12
//! EHD   TID   SEOJ    DEOJ    ESV  OPC  {EPC PDC EDT[PDC]}*
//! 1081  0001  028801  05FF01  72   01    E7  04  000004A5
//! ```
//!
//! EHD is fixed at 0x1081 for ECHONET-Lite. SEOJ/DEOJ are 3-byte object ids
//! (class group, class, instance). ESV 0x62 is a property read request, 0x72
//! the read response, 0x73 an unsolicited periodic notification. OPC counts
//! the EPC/PDC/EDT triples that follow; a read request carries PDC=0 and no
//! EDT.

use thiserror::Error;

pub const EHD_ECHONET_LITE: u16 = 0x1081;
/// Our side: management group 0x05, controller class 0xFF, instance 1.
pub const SEOJ_CONTROLLER: [u8; 3] = [0x05, 0xFF, 0x01];
/// Peer: housing group 0x02, low-voltage smart meter class 0x88, instance 1.
pub const DEOJ_SMART_METER: [u8; 3] = [0x02, 0x88, 0x01];

pub const ESV_READ_REQUEST: u8 = 0x62;
pub const ESV_READ_RESPONSE: u8 = 0x72;
pub const ESV_NOTIFICATION: u8 = 0x73;

/// Smart meter property codes the B-route worker requests and decodes.
pub mod epc {
    pub const COEFFICIENT: u8 = 0xD3;
    pub const EFFECTIVE_DIGITS: u8 = 0xD7;
    pub const CUMULATIVE_ENERGY: u8 = 0xE0;
    pub const ENERGY_UNIT: u8 = 0xE1;
    pub const INSTANTANEOUS_POWER: u8 = 0xE7;
    pub const SCHEDULED_CUMULATIVE_FWD: u8 = 0xEA;
    pub const SCHEDULED_CUMULATIVE_REV: u8 = 0xEB;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload length does not match the announced DATALEN")]
    InvalidLength,
    #[error("payload is not a valid hex string")]
    InvalidHex,
    #[error("property list runs past the end of the frame")]
    TruncatedProperty,
}

/// One EPC/PDC/EDT triple of a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub epc: u8,
    pub pdc: u8,
    pub edt: Vec<u8>,
}

impl Property {
    /// EDT interpreted as a big-endian unsigned integer. `None` when the EDT
    /// is empty or wider than 64 bits.
    pub fn edt_uint(&self) -> Option<u64> {
        be_uint(&self.edt)
    }
}

/// A decoded ECHONET-Lite frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchonetFrame {
    pub ehd: u16,
    pub tid: u16,
    pub seoj: [u8; 3],
    pub deoj: [u8; 3],
    pub esv: u8,
    pub properties: Vec<Property>,
}

impl EchonetFrame {
    /// Decode a frame from an `ERXUDP` event: `datalen` is the announced
    /// 2-byte length as a hex string, `data` the ASCII-hex payload. Performs
    /// no I/O and no logging; every failure is a typed reason.
    pub fn decode(datalen: &str, data: &str) -> Result<Self, FrameError> {
        let announced = usize::from_str_radix(datalen, 16).map_err(|_| FrameError::InvalidLength)?;
        if data.len() != announced * 2 {
            return Err(FrameError::InvalidLength);
        }
        let bytes = hex_to_bytes(data).ok_or(FrameError::InvalidHex)?;
        if bytes.len() < 12 {
            return Err(FrameError::TruncatedProperty);
        }

        let ehd = u16::from_be_bytes([bytes[0], bytes[1]]);
        let tid = u16::from_be_bytes([bytes[2], bytes[3]]);
        let seoj = [bytes[4], bytes[5], bytes[6]];
        let deoj = [bytes[7], bytes[8], bytes[9]];
        let esv = bytes[10];
        let opc = bytes[11] as usize;

        let mut properties = Vec::with_capacity(opc);
        let mut base = 12;
        for _ in 0..opc {
            if base + 2 > bytes.len() {
                return Err(FrameError::TruncatedProperty);
            }
            let epc = bytes[base];
            let pdc = bytes[base + 1];
            let end = base + 2 + pdc as usize;
            if end > bytes.len() {
                return Err(FrameError::TruncatedProperty);
            }
            properties.push(Property {
                epc,
                pdc,
                edt: bytes[base + 2..end].to_vec(),
            });
            base = end;
        }

        Ok(Self {
            ehd,
            tid,
            seoj,
            deoj,
            esv,
            properties,
        })
    }
}

/// Builds property read request frames. The TID counter lives here and is
/// owned by the single requesting worker; it post-increments modulo 0xFFFF.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    tid: u16,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode an ESV 0x62 read request for the given property codes, ready
    /// for the dongle's binary send path.
    pub fn property_read(&mut self, epcs: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(12 + 2 * epcs.len());
        frame.extend_from_slice(&EHD_ECHONET_LITE.to_be_bytes());
        frame.extend_from_slice(&self.tid.to_be_bytes());
        self.tid = (self.tid + 1) % 0xFFFF;
        frame.extend_from_slice(&SEOJ_CONTROLLER);
        frame.extend_from_slice(&DEOJ_SMART_METER);
        frame.push(ESV_READ_REQUEST);
        frame.push(epcs.len() as u8);
        for &epc in epcs {
            frame.push(epc);
            frame.push(0x00); // PDC of a read request carries no data
        }
        frame
    }
}

/// Big-endian unsigned integer of a byte run. `None` when empty or wider
/// than 64 bits.
pub fn be_uint(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    Some(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

/// True when `s` is non-problematic uppercase hex, as the dongle emits it.
pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

fn hex_to_bytes(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !is_hex(s) {
        return None;
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi << 4 | lo) as u8)
        })
        .collect()
}
