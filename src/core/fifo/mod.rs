//! Bounded ordered-write queue with capacity instrumentation.
//!
//! Mirrors `QPFifo` from the reference simulator: writes always succeed,
//! peak/total-write counters accumulate, and crossing `max_depth` flips a
//! sticky `overflow` flag rather than failing the write. Generic over the
//! stored element so the plain per-ASIC FIFO (`Fifo<Byte>`) and the DAQ
//! sink's classifying FIFO below share this bookkeeping.

use std::collections::VecDeque;

use crate::core::byte::{Byte, WordKind};

/// ASIC-side FIFOs are bounded at this depth (§4.3); the DAQ sink's FIFO
/// is effectively unbounded in practice, so it is constructed with `None`.
pub const ASIC_FIFO_DEPTH: usize = 512;

#[derive(Debug, Clone)]
pub struct Fifo<T> {
    data: VecDeque<T>,
    max_depth: Option<usize>,
    peak_size: usize,
    total_writes: u64,
    overflow: bool,
}

impl<T> Fifo<T> {
    pub fn bounded(max_depth: usize) -> Self {
        Fifo {
            data: VecDeque::new(),
            max_depth: Some(max_depth),
            peak_size: 0,
            total_writes: 0,
            overflow: false,
        }
    }

    pub fn unbounded() -> Self {
        Fifo {
            data: VecDeque::new(),
            max_depth: None,
            peak_size: 0,
            total_writes: 0,
            overflow: false,
        }
    }

    pub fn write(&mut self, item: T) {
        self.data.push_back(item);
        self.total_writes += 1;
        if self.data.len() > self.peak_size {
            self.peak_size = self.data.len();
        }
        if let Some(max_depth) = self.max_depth {
            if self.data.len() > max_depth {
                self.overflow = true;
            }
        }
    }

    pub fn read(&mut self) -> Option<T> {
        self.data.pop_front()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn peak_size(&self) -> usize {
        self.peak_size
    }

    pub fn total_writes(&self) -> u64 {
        self.total_writes
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }
}

/// A DAQ-FIFO entry: an incoming byte wrapped with the DAQ's own tick
/// count and the originating ASIC's coordinates at the moment of receipt.
#[derive(Debug, Clone)]
pub struct DaqEntry {
    pub daq_tick: u32,
    pub source_row: Option<u32>,
    pub source_col: Option<u32>,
    pub received_at: f64,
    pub byte: Byte,
}

/// Specialized FIFO at the DAQ sink: classifies every incoming byte by
/// word type and records EVTEND occurrences for calibration, per §4.3.
#[derive(Debug, Clone)]
pub struct DaqFifo {
    inner: Fifo<DaqEntry>,
    data_words: u64,
    evtend_words: u64,
    regreq_words: u64,
    regresp_words: u64,
    /// (row, col, daq_tick, source_tick) per EVTEND received.
    evtend_log: Vec<(Option<u32>, Option<u32>, u32, Option<u32>)>,
}

impl DaqFifo {
    pub fn new() -> Self {
        DaqFifo {
            inner: Fifo::unbounded(),
            data_words: 0,
            evtend_words: 0,
            regreq_words: 0,
            regresp_words: 0,
            evtend_log: Vec::new(),
        }
    }

    pub fn write(&mut self, entry: DaqEntry) {
        match entry.byte.kind {
            WordKind::Data => self.data_words += 1,
            WordKind::EvtEnd => {
                self.evtend_words += 1;
                self.evtend_log.push((
                    entry.source_row,
                    entry.source_col,
                    entry.daq_tick,
                    entry.byte.timestamp,
                ));
            }
            WordKind::RegReq => self.regreq_words += 1,
            WordKind::RegResp => self.regresp_words += 1,
        }
        self.inner.write(entry);
    }

    pub fn read(&mut self) -> Option<DaqEntry> {
        self.inner.read()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DaqEntry> {
        self.inner.iter()
    }

    pub fn data_words(&self) -> u64 {
        self.data_words
    }

    pub fn evtend_words(&self) -> u64 {
        self.evtend_words
    }

    pub fn evtend_log(&self) -> &[(Option<u32>, Option<u32>, u32, Option<u32>)] {
        &self.evtend_log
    }
}

impl Default for DaqFifo {
    fn default() -> Self {
        DaqFifo::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_past_depth_sets_overflow_but_still_succeeds() {
        let mut fifo: Fifo<u32> = Fifo::bounded(2);
        fifo.write(1);
        fifo.write(2);
        assert!(!fifo.overflow());
        fifo.write(3);
        assert!(fifo.overflow());
        assert_eq!(fifo.len(), 3);
    }

    #[test]
    fn read_returns_oldest_first() {
        let mut fifo: Fifo<u32> = Fifo::bounded(4);
        fifo.write(1);
        fifo.write(2);
        assert_eq!(fifo.read(), Some(1));
        assert_eq!(fifo.read(), Some(2));
        assert_eq!(fifo.read(), None);
    }

    #[test]
    fn peak_size_tracks_high_water_mark() {
        let mut fifo: Fifo<u32> = Fifo::bounded(4);
        fifo.write(1);
        fifo.write(2);
        fifo.read();
        fifo.write(3);
        assert_eq!(fifo.peak_size(), 2);
    }

    #[test]
    fn daq_fifo_classifies_evtend_and_logs_tuple() {
        let mut daq = DaqFifo::new();
        daq.write(DaqEntry {
            daq_tick: 7,
            source_row: Some(1),
            source_col: Some(2),
            received_at: 0.0,
            byte: Byte::evtend(1, 2, 9, 3),
        });
        assert_eq!(daq.evtend_words(), 1);
        assert_eq!(daq.evtend_log(), &[(Some(1), Some(2), 7, Some(3))]);
    }
}
