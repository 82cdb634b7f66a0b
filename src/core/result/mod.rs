//! External-facing schemas: the hit-injection tile format and the
//! per-run result record. Neither is a report writer — just the
//! `serde` structs a CLI or a caller embedding this crate serializes
//! to/from JSON. On-disk tabular output is out of scope; this is the
//! in-memory shape that a caller hands to a writer of its own.

use serde::{Deserialize, Serialize};

/// §6: each entry is `[time, channel_mask]`, already tick-local to the
/// ASIC it targets — the tile ingester (out of scope here) has already
/// done the coordinate conversion.
pub type TimeChannelPair = (f64, u16);

/// §6: one row of `hits` is `[asic_x, asic_y, [[time, channel_mask], ...]]` —
/// a heterogeneous JSON array, which serde maps onto a plain tuple.
pub type TileHit = (u32, u32, Vec<TimeChannelPair>);

/// §6 Tile input format. Only `nrows`/`ncols`/`hits` are consumed; the
/// remaining fields are physics-ingestion metadata this crate never reads.
#[derive(Debug, Clone, Deserialize)]
pub struct TileInput {
    pub nrows: u32,
    pub ncols: u32,
    pub hits: Vec<TileHit>,
    #[serde(default)]
    pub energy_deposit: Option<f64>,
    #[serde(default)]
    pub lep_recon: Option<String>,
    #[serde(default)]
    pub axis_x: Option<f64>,
    #[serde(default)]
    pub axis_z: Option<f64>,
    #[serde(default)]
    pub zpos: Option<f64>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl TileInput {
    /// `size=0` is a legal no-op event (§6).
    pub fn is_noop(&self) -> bool {
        self.size == Some(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Push,
    Pull,
}

#[derive(Debug, Clone, Serialize)]
pub struct AsicSummary {
    pub row: u32,
    pub col: u32,
    pub frequency_hz: f64,
    pub start_phase: f64,
    pub final_rel_time: f64,
    pub final_rel_tick: u64,
    pub local_writes: u64,
    pub local_peak: usize,
    pub local_remaining: usize,
    pub local_overflow: bool,
    pub remote_writes: u64,
    pub remote_peak: usize,
    pub remote_remaining: usize,
    pub remote_overflow: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DaqWordType {
    Data,
    RegReq,
    RegResp,
    EvtEnd,
}

/// One entry in the DAQ sink's FIFO, per §6 "per DAQ-FIFO-entry" fields.
#[derive(Debug, Clone, Serialize)]
pub struct DaqEntryRecord {
    pub source_row: Option<u32>,
    pub source_col: Option<u32>,
    pub word_type: DaqWordType,
    pub daq_tick: u32,
    pub source_tick: Option<u32>,
    pub source_wall_time: Option<f64>,
    pub channel_mask: Option<u16>,
}

/// What one `Array::process(target_time)` run produced, handed back to
/// the caller as the single point of output from this crate.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub architecture: Architecture,
    pub routing: String,
    pub total_injected_hits: u64,
    pub asics: Vec<AsicSummary>,
    pub daq_entries: Vec<DaqEntryRecord>,
    /// §4.4.1 supplement: the reference's `self._alert` flag — set when
    /// `process` produces outbound events outside the drain loop's
    /// expected quiescence window.
    pub array_alert: bool,
    pub events_processed: u64,
    pub final_array_clock: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_input_deserializes_reference_shape() {
        let json = r#"{
            "nrows": 2,
            "ncols": 2,
            "hits": [
                [0, 0, [[1.0e-9, 8], [2.0e-9, 32]]],
                [1, 1, [[3.0e-9, 1]]]
            ],
            "size": 1
        }"#;
        let tile: TileInput = serde_json::from_str(json).unwrap();
        assert_eq!(tile.hits.len(), 2);
        assert_eq!(tile.hits[0].2.len(), 2);
        assert!(!tile.is_noop());
    }

    #[test]
    fn zero_size_tile_is_noop() {
        let json = r#"{"nrows":1,"ncols":1,"hits":[],"size":0}"#;
        let tile: TileInput = serde_json::from_str(json).unwrap();
        assert!(tile.is_noop());
    }
}
