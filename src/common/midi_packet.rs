//! the 13 byte frame that carries one musical event between peers
//!
//! This is the stuff that gets put "on the wire" on every data link.  It is very
//! intentionally simple.  There is no checksum and no version byte; the link delivers
//! whole datagrams or nothing, so the length is the only integrity check we do.
//!
//! All multi-byte fields are little endian.
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 2 | sequence id (u16, wraps) |
//! | 2 | 8 | origin timestamp in msec (f64, sender's synchronized clock) |
//! | 10 | 1 | status byte |
//! | 11 | 1 | data 1 |
//! | 12 | 1 | data 2 |
use byteorder::{ByteOrder, LittleEndian};
use std::{error::Error, fmt};

pub const FRAME_SIZE: usize = 2 + 8 + 1 + 1 + 1;

const SEQ_OFFSET: usize = 0;
const TIMESTAMP_OFFSET: usize = 2;
const STATUS_OFFSET: usize = 10;
const DATA1_OFFSET: usize = 11;
const DATA2_OFFSET: usize = 12;

/// Returned by [`MidiFrame::decode`] when a buffer can't be a frame
#[derive(Debug, PartialEq)]
pub enum FrameError {
    InvalidLength(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::InvalidLength(n) => {
                write!(f, "invalid frame: {} bytes, expected {}", n, FRAME_SIZE)
            }
        }
    }
}

impl Error for FrameError {}

/// One decoded musical event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiFrame {
    pub sequence_id: u16,
    pub origin_timestamp_ms: f64,
    pub status: u8,
    pub data1: u8,
    pub data2: u8,
}

impl MidiFrame {
    /// pack the frame into its wire form
    pub fn to_bytes(&self) -> [u8; FRAME_SIZE] {
        let mut buffer = [0; FRAME_SIZE];
        LittleEndian::write_u16(&mut buffer[SEQ_OFFSET..TIMESTAMP_OFFSET], self.sequence_id);
        LittleEndian::write_f64(
            &mut buffer[TIMESTAMP_OFFSET..STATUS_OFFSET],
            self.origin_timestamp_ms,
        );
        buffer[STATUS_OFFSET] = self.status;
        buffer[DATA1_OFFSET] = self.data1;
        buffer[DATA2_OFFSET] = self.data2;
        buffer
    }
    /// unpack a frame.  Anything that is not exactly [`FRAME_SIZE`] bytes is rejected.
    pub fn decode(buffer: &[u8]) -> Result<MidiFrame, FrameError> {
        if buffer.len() != FRAME_SIZE {
            return Err(FrameError::InvalidLength(buffer.len()));
        }
        Ok(MidiFrame {
            sequence_id: LittleEndian::read_u16(&buffer[SEQ_OFFSET..TIMESTAMP_OFFSET]),
            origin_timestamp_ms: LittleEndian::read_f64(&buffer[TIMESTAMP_OFFSET..STATUS_OFFSET]),
            status: buffer[STATUS_OFFSET],
            data1: buffer[DATA1_OFFSET],
            data2: buffer[DATA2_OFFSET],
        })
    }
    /// the three midi bytes
    pub fn midi_bytes(&self) -> [u8; 3] {
        [self.status, self.data1, self.data2]
    }
    /// human readable version of the midi bytes (used for logs and the status json)
    pub fn describe(&self) -> String {
        let bytes = self.midi_bytes();
        match wmidi::MidiMessage::try_from(&bytes[..]) {
            Ok(msg) => format!("{:?}", msg),
            Err(e) => format!("raw {:?} ({:?})", bytes, e),
        }
    }
}

impl fmt::Display for MidiFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ seq: {}, origin: {:.3}, status: {}, data1: {}, data2: {} }}",
            self.sequence_id, self.origin_timestamp_ms, self.status, self.data1, self.data2
        )
    }
}

/// Encoder side of the codec.  Owns the rolling sequence counter.
///
/// The counter only exists so a receiver can spot gaps.  Nothing else reads it.
pub struct FrameEncoder {
    next_sequence: u16,
}

impl FrameEncoder {
    pub fn new() -> FrameEncoder {
        FrameEncoder { next_sequence: 0 }
    }
    /// the sequence id the next encode will use
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }
    pub fn encode(
        &mut self,
        status: u8,
        data1: u8,
        data2: u8,
        origin_timestamp_ms: f64,
    ) -> [u8; FRAME_SIZE] {
        let frame = MidiFrame {
            sequence_id: self.next_sequence,
            origin_timestamp_ms,
            status,
            data1,
            data2,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        frame.to_bytes()
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// What the [`SequenceTracker`] thought of a sequence id
#[derive(Debug, PartialEq)]
pub enum SequenceStatus {
    First,
    InOrder,
    /// this many frames went missing before this one
    Gap(u16),
    /// older than one we have already seen
    Late,
}

// anything more than half the sequence space ahead is treated as behind
const HALF_SEQUENCE_SPACE: u16 = 0x8000;

/// Receiver side gap detection for one sender
///
/// Uses wrapping arithmetic so 65535 -> 0 is in order.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u16>,
    drops: u64,
    late: u64,
}

impl SequenceTracker {
    pub fn new() -> SequenceTracker {
        SequenceTracker {
            last: None,
            drops: 0,
            late: 0,
        }
    }
    pub fn get_drops(&self) -> u64 {
        self.drops
    }
    pub fn get_late(&self) -> u64 {
        self.late
    }
    pub fn observe(&mut self, seq: u16) -> SequenceStatus {
        let last = match self.last {
            None => {
                self.last = Some(seq);
                return SequenceStatus::First;
            }
            Some(l) => l,
        };
        let ahead = seq.wrapping_sub(last);
        if ahead == 0 || ahead >= HALF_SEQUENCE_SPACE {
            // duplicate or something we already passed
            self.late += 1;
            return SequenceStatus::Late;
        }
        self.last = Some(seq);
        if ahead == 1 {
            SequenceStatus::InOrder
        } else {
            let missing = ahead - 1;
            self.drops += missing as u64;
            SequenceStatus::Gap(missing)
        }
    }
}
