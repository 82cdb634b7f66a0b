//! Fixed-width transaction unit exchanged between ASICs, and the framing
//! model that derives how long each one occupies a link.
//!
//! Mirrors the `QPByte` dataclass of the reference simulator: rather than a
//! payload enum per word type, every field that could plausibly appear on
//! the wire lives on one struct, and `kind` says which subset is valid.
//! This keeps `Fifo<Byte>` and the transfer-ticks accounting below free of
//! a match over variants with differently-shaped payloads.

use std::fmt;

/// Directional neighbor slot. Values line up with the reference's
/// `AsicDirMask` so that `(dir as usize + 2) % 4` continues to mean
/// "the opposite direction", used when a byte crosses a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    North = 0,
    East = 1,
    South = 2,
    West = 3,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::East,
        Direction::South,
        Direction::West,
    ];

    /// The direction a byte arrives at the receiver from, given the
    /// direction it was sent out of by the sender.
    pub fn reverse(self) -> Direction {
        match self {
            Direction::North => Direction::South,
            Direction::East => Direction::West,
            Direction::South => Direction::North,
            Direction::West => Direction::East,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Direction {
        match i {
            0 => Direction::North,
            1 => Direction::East,
            2 => Direction::South,
            3 => Direction::West,
            _ => unreachable!("direction index must be in 0..4, got {i}"),
        }
    }
}

/// 4-bit word-type tag, values kept from the reference `AsicWord` enum
/// since the transfer-ticks popcount is computed over this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordKind {
    Data = 1,
    RegReq = 3,
    RegResp = 4,
    EvtEnd = 5,
}

/// Broadcast command carried alongside a REGREQ, mirroring the `command`
/// string the reference simulator threads through `ProcItem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Interrogate,
    HardInterrogate,
    /// Supplemental: originally `"Calibrate"` in QpixAsic.py — writes a
    /// timestamped REGRESP into the local FIFO instead of pulling hits.
    Calibrate,
}

const N_ONE: u64 = 24;
const N_ZER: u64 = 8;
const N_GAP: u64 = 16;
const N_FIN: u64 = 40;
const N_FRAME_BITS: u32 = 64;
const N_DEFAULT_TICKS: u64 = 1700;

/// A single REGREQ's destination/config payload.
#[derive(Debug, Clone, Copy)]
pub struct RegReqPayload {
    pub dest_row: Option<u32>,
    pub dest_col: Option<u32>,
    pub broadcast: bool,
    pub op_write: bool,
    pub op_read: bool,
    pub request_id: i64,
    pub config: crate::core::config::AsicConfig,
}

/// A fixed-purpose packet transferred between neighbors.
#[derive(Debug, Clone)]
pub struct Byte {
    pub kind: WordKind,
    pub origin_row: Option<u32>,
    pub origin_col: Option<u32>,
    pub timestamp: Option<u32>,
    pub channel_mask: Option<u16>,
    pub reg_req: Option<RegReqPayload>,
    pub reg_resp_config: Option<crate::core::config::AsicConfig>,
    pub evtend_request_id: Option<i64>,
    pub transfer_ticks: u64,
}

impl fmt::Display for Byte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:?},{:?}): {:?}",
            self.origin_row, self.origin_col, self.kind
        )
    }
}

impl Byte {
    pub fn data(origin_row: u32, origin_col: u32, timestamp: u32, channel_mask: u16) -> Byte {
        let mut byte = Byte {
            kind: WordKind::Data,
            origin_row: Some(origin_row),
            origin_col: Some(origin_col),
            timestamp: Some(timestamp),
            channel_mask: Some(channel_mask),
            reg_req: None,
            reg_resp_config: None,
            evtend_request_id: None,
            transfer_ticks: 0,
        };
        byte.transfer_ticks = byte.compute_transfer_ticks();
        byte
    }

    pub fn reg_req(origin_row: Option<u32>, origin_col: Option<u32>, payload: RegReqPayload) -> Byte {
        let mut byte = Byte {
            kind: WordKind::RegReq,
            origin_row,
            origin_col,
            timestamp: None,
            channel_mask: None,
            reg_req: Some(payload),
            reg_resp_config: None,
            evtend_request_id: None,
            transfer_ticks: 0,
        };
        byte.transfer_ticks = byte.compute_transfer_ticks();
        byte
    }

    pub fn reg_resp(
        origin_row: u32,
        origin_col: u32,
        config: crate::core::config::AsicConfig,
    ) -> Byte {
        let mut byte = Byte {
            kind: WordKind::RegResp,
            origin_row: Some(origin_row),
            origin_col: Some(origin_col),
            timestamp: None,
            channel_mask: None,
            reg_req: None,
            reg_resp_config: Some(config),
            evtend_request_id: None,
            transfer_ticks: 0,
        };
        byte.transfer_ticks = byte.compute_transfer_ticks();
        byte
    }

    /// Supplemental: `"Calibrate"` response word, timestamped with the
    /// tick at which the calibration broadcast was received at this ASIC.
    pub fn calibrate_resp(
        origin_row: u32,
        origin_col: u32,
        request_id: i64,
        tick: u32,
    ) -> Byte {
        let mut byte = Byte {
            kind: WordKind::RegResp,
            origin_row: Some(origin_row),
            origin_col: Some(origin_col),
            timestamp: Some(tick),
            channel_mask: None,
            reg_req: None,
            reg_resp_config: None,
            evtend_request_id: Some(request_id),
            transfer_ticks: 0,
        };
        byte.transfer_ticks = byte.compute_transfer_ticks();
        byte
    }

    pub fn evtend(origin_row: u32, origin_col: u32, request_id: i64, tick: u32) -> Byte {
        let mut byte = Byte {
            kind: WordKind::EvtEnd,
            origin_row: Some(origin_row),
            origin_col: Some(origin_col),
            timestamp: Some(tick),
            channel_mask: None,
            reg_req: None,
            reg_resp_config: None,
            evtend_request_id: Some(request_id),
            transfer_ticks: 0,
        };
        byte.transfer_ticks = byte.compute_transfer_ticks();
        byte
    }

    pub fn add_channel(&mut self, channel: u32) {
        let mask = self.channel_mask.get_or_insert(0);
        *mask |= 1u16 << channel;
        self.transfer_ticks = self.compute_transfer_ticks();
    }

    /// §4.2: on-wire duration, computed once at construction (and
    /// recomputed here whenever a channel mask mutates after the fact,
    /// e.g. `add_channel` during hit coalescing).
    fn compute_transfer_ticks(&self) -> u64 {
        let (Some(timestamp), Some(channel_mask)) = (self.timestamp, self.channel_mask) else {
            return N_DEFAULT_TICKS;
        };
        let origin_row = self.origin_row.unwrap_or(0);
        let origin_col = self.origin_col.unwrap_or(0);

        let high_bits = channel_mask.count_ones()
            + timestamp.count_ones()
            + origin_row.count_ones()
            + origin_col.count_ones()
            + (self.kind as u32).count_ones();

        let low_bits = N_FRAME_BITS - high_bits;
        let num_gap = (N_FRAME_BITS as u64 - 1) * N_GAP;
        let num_ones = high_bits as u64 * N_ONE;
        let num_zeros = low_bits as u64 * N_ZER;

        num_ones + num_zeros + num_gap + N_FIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transfer_ticks_used_without_timestamp() {
        let payload = RegReqPayload {
            dest_row: None,
            dest_col: None,
            broadcast: true,
            op_write: false,
            op_read: false,
            request_id: 0,
            config: crate::core::config::AsicConfig::default(),
        };
        let byte = Byte::reg_req(None, None, payload);
        assert_eq!(byte.transfer_ticks, N_DEFAULT_TICKS);
    }

    #[test]
    fn transfer_ticks_depend_on_popcount() {
        let low = Byte::data(0, 0, 0, 0);
        let high = Byte::data(0b1111, 0b1111, 0xFFFF_FFFF, 0xFFFF);
        assert!(high.transfer_ticks > low.transfer_ticks);
    }

    #[test]
    fn reverse_direction_round_trips() {
        for dir in Direction::ALL {
            assert_eq!(dir.reverse().reverse(), dir);
        }
    }
}
