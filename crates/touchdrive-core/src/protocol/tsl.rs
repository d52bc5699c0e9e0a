//! TSL UMD 5.0 wire format and switcher bus state
//!
//! Packet layout (little endian):
//! ```text
//! [0-1]  PBC      byte count of everything after this field
//! [2]    VER      0x00
//! [3]    FLAGS    bit0: UTF-16LE text, bit1: screen control (no display data)
//! [4-5]  SCREEN
//! then one or more display messages:
//! [0-1]  INDEX
//! [2-3]  CONTROL  bits 0-1 program tally, bits 2-3 preview tally, bit 15 control data
//! [4-5]  LENGTH
//! [6..]  TEXT
//! ```
//! Over TCP a packet may additionally be wrapped in DLE/STX (`FE 02`) with
//! `FE` bytes doubled inside; [`TslFramer`] accepts both forms.
//!
//! Carbonite labels carry `sourceIndex:BUS:Label`, which is how the bus a
//! tally belongs to is learned.

use crate::error::DecodeError;
use serde::Serialize;
use std::collections::BTreeMap;

/// Largest packet the protocol allows
pub const MAX_PACKET_SIZE: usize = 2048;

/// Bus used for labels without a Carbonite `index:BUS:` prefix
pub const DEFAULT_BUS: &str = "PGM";

const HEADER_LEN: usize = 6;
const DMSG_HEADER_LEN: usize = 6;
const DLE: u8 = 0xFE;
const STX: u8 = 0x02;
const FLAG_UNICODE: u8 = 0x01;
const FLAG_SCREEN_CONTROL: u8 = 0x02;
const CONTROL_DATA_BIT: u16 = 0x8000;
const BROADCAST_INDEX: u16 = 0xFFFF;

/// Tally bits of a display message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TallyControl(pub u16);

impl TallyControl {
    pub fn program_brightness(&self) -> u8 {
        (self.0 & 0x03) as u8
    }

    pub fn preview_brightness(&self) -> u8 {
        ((self.0 >> 2) & 0x03) as u8
    }

    pub fn is_program(&self) -> bool {
        self.program_brightness() > 0
    }

    pub fn is_preview(&self) -> bool {
        self.preview_brightness() > 0
    }

    pub fn is_control_data(&self) -> bool {
        self.0 & CONTROL_DATA_BIT != 0
    }
}

/// One display message of a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub index: u16,
    pub control: TallyControl,
    pub text: String,
}

/// A decoded TSL 5.0 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TslPacket {
    pub version: u8,
    pub flags: u8,
    pub screen: u16,
    pub messages: Vec<DisplayMessage>,
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

/// Decode a complete packet, PBC field included
pub fn decode_packet(bytes: &[u8]) -> Result<TslPacket, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::TooShort {
            len: bytes.len(),
            min: HEADER_LEN,
        });
    }

    let declared = read_u16(bytes, 0) as usize;
    if declared != bytes.len() - 2 {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: bytes.len() - 2,
        });
    }

    let version = bytes[2];
    if version != 0 {
        return Err(DecodeError::UnknownHeader(format!("version {}", version)));
    }
    let flags = bytes[3];
    let screen = read_u16(bytes, 4);

    let mut packet = TslPacket {
        version,
        flags,
        screen,
        messages: Vec::new(),
    };
    if flags & FLAG_SCREEN_CONTROL != 0 {
        return Ok(packet);
    }

    let mut pos = HEADER_LEN;
    while pos < bytes.len() {
        if bytes.len() - pos < DMSG_HEADER_LEN {
            return Err(DecodeError::TooShort {
                len: bytes.len() - pos,
                min: DMSG_HEADER_LEN,
            });
        }
        let index = read_u16(bytes, pos);
        let control = TallyControl(read_u16(bytes, pos + 2));
        let text_len = read_u16(bytes, pos + 4) as usize;
        let text_start = pos + DMSG_HEADER_LEN;
        let text_end = text_start + text_len;
        if text_end > bytes.len() {
            return Err(DecodeError::LengthMismatch {
                declared: text_len,
                actual: bytes.len() - text_start,
            });
        }
        pos = text_end;

        if control.is_control_data() {
            continue;
        }
        let text = decode_text(&bytes[text_start..text_end], flags & FLAG_UNICODE != 0)?;
        packet.messages.push(DisplayMessage {
            index,
            control,
            text,
        });
    }

    Ok(packet)
}

fn decode_text(raw: &[u8], unicode: bool) -> Result<String, DecodeError> {
    if unicode {
        if raw.len() % 2 != 0 {
            return Err(DecodeError::InvalidText("UTF-16 label"));
        }
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| DecodeError::InvalidText("UTF-16 label"))
    } else {
        std::str::from_utf8(raw)
            .map(|s| s.trim_end_matches('\0').to_string())
            .map_err(|_| DecodeError::InvalidText("UTF-8 label"))
    }
}

/// Build a packet with a single display message (used by tests and tools)
pub fn encode_packet(index: u16, control: TallyControl, text: &str) -> Vec<u8> {
    let text = text.as_bytes();
    let pbc = (HEADER_LEN - 2 + DMSG_HEADER_LEN + text.len()) as u16;
    let mut out = Vec::with_capacity(pbc as usize + 2);
    out.extend_from_slice(&pbc.to_le_bytes());
    out.push(0);
    out.push(0);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&control.0.to_le_bytes());
    out.extend_from_slice(&(text.len() as u16).to_le_bytes());
    out.extend_from_slice(text);
    out
}

/// Splits a TCP byte stream into packets
#[derive(Debug, Default)]
pub struct TslFramer {
    buf: Vec<u8>,
}

impl TslFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete packet, `None` when more bytes are needed.
    ///
    /// On an unusable length the buffer is dropped so the stream can
    /// resynchronize on the next write from the peer.
    pub fn next_packet(&mut self) -> Option<Result<Vec<u8>, DecodeError>> {
        if self.buf.len() >= 2 && self.buf[0] == DLE && self.buf[1] == STX {
            return self.next_wrapped();
        }
        if self.buf.len() < 2 {
            return None;
        }
        let pbc = read_u16(&self.buf, 0) as usize;
        if !(HEADER_LEN - 2..=MAX_PACKET_SIZE).contains(&pbc) {
            let len = self.buf.len();
            self.buf.clear();
            return Some(Err(DecodeError::LengthMismatch {
                declared: pbc,
                actual: len - 2,
            }));
        }
        if self.buf.len() < pbc + 2 {
            return None;
        }
        Some(Ok(self.buf.drain(..pbc + 2).collect()))
    }

    fn next_wrapped(&mut self) -> Option<Result<Vec<u8>, DecodeError>> {
        let mut out = Vec::new();
        let mut i = 2;
        while i < self.buf.len() {
            let byte = self.buf[i];
            if byte == DLE {
                match self.buf.get(i + 1) {
                    None => return None,
                    Some(&DLE) => {
                        out.push(DLE);
                        i += 2;
                    }
                    Some(&STX) => {
                        // A new packet started before this one completed
                        self.buf.drain(..i);
                        return Some(Err(DecodeError::TooShort {
                            len: out.len(),
                            min: HEADER_LEN,
                        }));
                    }
                    Some(_) => {
                        out.push(byte);
                        i += 1;
                    }
                }
            } else {
                out.push(byte);
                i += 1;
            }

            if out.len() >= 2 {
                let pbc = read_u16(&out, 0) as usize;
                if pbc > MAX_PACKET_SIZE {
                    self.buf.drain(..i);
                    return Some(Err(DecodeError::LengthMismatch {
                        declared: pbc,
                        actual: out.len() - 2,
                    }));
                }
                if out.len() == pbc + 2 {
                    self.buf.drain(..i);
                    return Some(Ok(out));
                }
            }
        }
        None
    }
}

/// A label split into its Carbonite parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLabel {
    pub source_index: u16,
    pub bus: String,
    pub label: String,
}

/// Split a UMD text into source index, bus and label.
///
/// `"3:ME1PGM:CAM 3"` gives index 3 on `ME1PGM`; anything without the prefix
/// belongs to [`DEFAULT_BUS`] and keeps the display index.
pub fn parse_label(display_index: u16, text: &str) -> SourceLabel {
    let text = text.trim();
    let mut parts = text.splitn(3, ':');
    if let (Some(idx), Some(bus), Some(label)) = (parts.next(), parts.next(), parts.next()) {
        if let Ok(source_index) = idx.trim().parse::<u16>() {
            if !bus.trim().is_empty() {
                return SourceLabel {
                    source_index,
                    bus: bus.trim().to_string(),
                    label: label.trim().to_string(),
                };
            }
        }
    }
    SourceLabel {
        source_index: display_index,
        bus: DEFAULT_BUS.to_string(),
        label: text.to_string(),
    }
}

/// A source known to the switcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub label: String,
}

/// Current switcher state as reported by tally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusState {
    pub sources: BTreeMap<u16, SourceInfo>,
    pub program: BTreeMap<String, u16>,
    pub preview: BTreeMap<String, u16>,
    /// Bus labels in first-seen order
    pub bus_labels: Vec<String>,
}

/// A program-source change on one bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramChange {
    pub bus: String,
    pub source_index: u16,
    pub source_name: String,
    /// True when the bus had no program source before
    pub first_assignment: bool,
}

impl BusState {
    /// Apply a packet, returning the next snapshot and the buses it touched
    pub fn apply(&self, packet: &TslPacket) -> (BusState, Vec<String>) {
        let mut next = self.clone();
        let mut touched: Vec<String> = Vec::new();

        for msg in &packet.messages {
            if msg.index == BROADCAST_INDEX {
                continue;
            }
            let parsed = parse_label(msg.index, &msg.text);
            next.sources.insert(
                parsed.source_index,
                SourceInfo {
                    label: parsed.label.clone(),
                },
            );
            if !next.bus_labels.contains(&parsed.bus) {
                next.bus_labels.push(parsed.bus.clone());
            }
            if !touched.contains(&parsed.bus) {
                touched.push(parsed.bus.clone());
            }
            if msg.control.is_program() {
                next.program.insert(parsed.bus.clone(), parsed.source_index);
            }
            if msg.control.is_preview() {
                next.preview.insert(parsed.bus.clone(), parsed.source_index);
            }
        }

        (next, touched)
    }

    /// Program changes between `self` (previous) and `next` on the given buses
    pub fn program_changes(&self, next: &BusState, buses: &[String]) -> Vec<ProgramChange> {
        buses
            .iter()
            .filter_map(|bus| {
                let new_index = *next.program.get(bus)?;
                let old_index = self.program.get(bus).copied();
                if old_index == Some(new_index) {
                    return None;
                }
                Some(ProgramChange {
                    bus: bus.clone(),
                    source_index: new_index,
                    source_name: next.source_name(new_index),
                    first_assignment: old_index.is_none(),
                })
            })
            .collect()
    }

    /// Label for a source index, falling back to `Source N`
    pub fn source_name(&self, index: u16) -> String {
        self.sources
            .get(&index)
            .map(|s| s.label.clone())
            .unwrap_or_else(|| format!("Source {}", index))
    }

    /// `BUS: PGM label / PVW label` per bus
    pub fn summary(&self) -> Vec<String> {
        self.bus_labels
            .iter()
            .map(|bus| {
                let pgm = self
                    .program
                    .get(bus)
                    .map(|i| self.source_name(*i))
                    .unwrap_or_else(|| "-".to_string());
                let pvw = self
                    .preview
                    .get(bus)
                    .map(|i| self.source_name(*i))
                    .unwrap_or_else(|| "-".to_string());
                format!("{}: PGM {} / PVW {}", bus, pgm, pvw)
            })
            .collect()
    }
}
