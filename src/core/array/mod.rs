//! Mesh construction, routing topology selection, the interrogation
//! driver, and the DAQ sink — the outermost layer a caller drives.
//!
//! Grounded in `QpixAsicArray` from the reference simulator, with the
//! neighbor wiring expressed as index pairs into an arena (`nodes`)
//! rather than the reference's cyclic object references, per design
//! note §9.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::core::asic::daq::DaqNode;
use crate::core::asic::{AsicNode, AsicState, NodeId, OutboundEvent};
use crate::core::byte::{Byte, Command, Direction};
use crate::core::config::AsicConfig;
use crate::core::error::ArrayError;
use crate::core::event_queue::{EventQueue, QueuedEvent};
use crate::core::result::{Architecture, AsicSummary, DaqEntryRecord, DaqWordType, RunResult, TileInput};

/// Simulated-time epsilon used to order "catch up to just before this
/// event" steps ahead of the event's own delivery, per §4.5's pseudocode.
const EPSILON: f64 = 1e-12;

pub struct Array {
    nrows: u32,
    ncols: u32,
    nodes: Vec<AsicNode>,
    daq: DaqNode,
    queue: EventQueue,
    delta_t: f64,
    array_clock: f64,
    /// §4.4.1 / §7: set whenever `process` observes outbound events
    /// produced outside its own drain loop's expected quiescence window.
    alert: bool,
    routing: String,
    push_enabled: bool,
    send_remote_enabled: bool,
    total_injected_hits: u64,
}

fn standard_normal(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

impl Array {
    pub fn new(
        nrows: u32,
        ncols: u32,
        f_nominal: f64,
        pct_spread: f64,
        remote_timeout: u64,
        seed: u64,
    ) -> Self {
        assert!(nrows > 0 && ncols > 0, "array must have at least one row and column");

        let mut rng = StdRng::seed_from_u64(seed);
        let mut nodes = Vec::with_capacity((nrows * ncols) as usize);
        for row in 0..nrows {
            for col in 0..ncols {
                let freq = f_nominal + f_nominal * pct_spread * standard_normal(&mut rng);
                nodes.push(AsicNode::new(row, col, freq, remote_timeout, &mut rng));
            }
        }

        let mut array = Array {
            nrows,
            ncols,
            nodes,
            daq: DaqNode::new(f_nominal, NodeId::Asic(0), Direction::West),
            queue: EventQueue::new(),
            delta_t: 1e-5,
            array_clock: 0.0,
            alert: false,
            routing: "none".to_string(),
            push_enabled: false,
            send_remote_enabled: false,
            total_injected_hits: 0,
        };
        array.wire_neighbors();
        array
    }

    fn idx(&self, row: u32, col: u32) -> usize {
        (row * self.ncols + col) as usize
    }

    fn in_bounds(&self, row: u32, col: u32) -> bool {
        row < self.nrows && col < self.ncols
    }

    fn wire_neighbors(&mut self) {
        for row in 0..self.nrows {
            for col in 0..self.ncols {
                let i = self.idx(row, col);
                let north = if row > 0 { Some(NodeId::Asic(self.idx(row - 1, col))) } else { None };
                let south = if row + 1 < self.nrows { Some(NodeId::Asic(self.idx(row + 1, col))) } else { None };
                let west = if col > 0 { Some(NodeId::Asic(self.idx(row, col - 1))) } else { None };
                let east = if col + 1 < self.ncols { Some(NodeId::Asic(self.idx(row, col + 1))) } else { None };
                self.nodes[i].links[Direction::North.index()].target = north;
                self.nodes[i].links[Direction::South.index()].target = south;
                self.nodes[i].links[Direction::West.index()].target = west;
                self.nodes[i].links[Direction::East.index()].target = east;
            }
        }

        // §3/§4.7: the DAQ sits on (0,0)'s West link, the edge with no
        // mesh neighbor of its own.
        let corner = self.idx(0, 0);
        self.nodes[corner].links[Direction::West.index()].target = Some(NodeId::Daq);
        self.daq.uplink_target = NodeId::Asic(corner);
        self.daq.uplink_dir = Direction::West;
    }

    // ---- Routing topologies (§4.6) ----

    pub fn route(
        &mut self,
        name: &str,
        _timeout: u64,
        transact: bool,
        pos: Option<usize>,
    ) -> Result<(), ArrayError> {
        let directions: Vec<Direction> = match name {
            "left" => self.left_directions(),
            "snake" => self.snake_directions(),
            "trunk" => {
                if transact {
                    return Err(ArrayError::RelocatingTransactedRoute);
                }
                let pos = pos.ok_or_else(|| ArrayError::UnknownRoute("trunk requires pos".to_string()))?;
                self.trunk_directions(pos)?
            }
            other => return Err(ArrayError::UnknownRoute(other.to_string())),
        };

        self.routing = if name == "trunk" {
            format!("trunk({})", pos.unwrap_or(0))
        } else {
            name.to_string()
        };

        if transact {
            for row in 0..self.nrows {
                for col in 0..self.ncols {
                    let i = self.idx(row, col);
                    let mut cfg = self.nodes[i].config;
                    cfg.direction = directions[i];
                    cfg.manual_route = true;
                    self.write_asic_register(row, col, cfg)?;
                }
            }
        } else {
            for (i, dir) in directions.into_iter().enumerate() {
                self.nodes[i].config.direction = dir;
                self.nodes[i].config.manual_route = true;
            }
        }
        Ok(())
    }

    fn left_directions(&self) -> Vec<Direction> {
        let mut dirs = Vec::with_capacity(self.nodes.len());
        for row in 0..self.nrows {
            for col in 0..self.ncols {
                let dir = if row == 0 && col == 0 {
                    Direction::West
                } else if col == 0 {
                    Direction::North
                } else {
                    Direction::West
                };
                dirs.push(dir);
            }
        }
        dirs
    }

    fn snake_directions(&self) -> Vec<Direction> {
        let mut dirs = Vec::with_capacity(self.nodes.len());
        for row in 0..self.nrows {
            for col in 0..self.ncols {
                let dir = if row == 0 {
                    Direction::West
                } else if row % 2 == 1 {
                    if col + 1 == self.ncols { Direction::North } else { Direction::East }
                } else if col == 0 {
                    Direction::North
                } else {
                    Direction::West
                };
                dirs.push(dir);
            }
        }
        dirs
    }

    fn trunk_directions(&mut self, pos: usize) -> Result<Vec<Direction>, ArrayError> {
        let ncols = self.ncols as usize;
        if pos == 0 || pos + 1 >= ncols {
            return Err(ArrayError::TrunkPositionOutOfRange { pos, ncols });
        }

        let old_corner = self.idx(0, 0);
        if pos != 0 {
            self.nodes[old_corner].links[Direction::West.index()].target = None;
        }
        let new_corner = self.idx(0, pos as u32);
        self.nodes[new_corner].links[Direction::North.index()].target = Some(NodeId::Daq);
        self.daq.uplink_target = NodeId::Asic(new_corner);
        self.daq.uplink_dir = Direction::North;

        let mut dirs = Vec::with_capacity(self.nodes.len());
        for _row in 0..self.nrows {
            for col in 0..self.ncols {
                let col = col as usize;
                let dir = if col < pos {
                    Direction::East
                } else if col > pos {
                    Direction::West
                } else {
                    Direction::North
                };
                dirs.push(dir);
            }
        }
        Ok(dirs)
    }

    // ---- Driver API (§6) ----

    pub fn set_push_state(&mut self, enabled: bool, transact: bool) -> Result<(), ArrayError> {
        self.push_enabled = enabled;
        if transact {
            for row in 0..self.nrows {
                for col in 0..self.ncols {
                    let mut cfg = self.nodes[self.idx(row, col)].config;
                    cfg.push_enable = enabled;
                    self.write_asic_register(row, col, cfg)?;
                }
            }
        } else {
            for node in &mut self.nodes {
                node.config.push_enable = enabled;
            }
        }
        // A pushed ASIC must also be in the send-remote state, so a relay
        // node drains its remote FIFO without waiting on an interrogate.
        self.set_send_remote(enabled, transact)
    }

    pub fn set_send_remote(&mut self, enabled: bool, transact: bool) -> Result<(), ArrayError> {
        self.send_remote_enabled = enabled;
        if transact {
            for row in 0..self.nrows {
                for col in 0..self.ncols {
                    let mut cfg = self.nodes[self.idx(row, col)].config;
                    cfg.send_remote = enabled;
                    self.write_asic_register(row, col, cfg)?;
                }
            }
        } else {
            for node in &mut self.nodes {
                node.config.send_remote = enabled;
            }
        }
        Ok(())
    }

    pub fn write_asic_register(&mut self, row: u32, col: u32, config: AsicConfig) -> Result<(), ArrayError> {
        if !self.in_bounds(row, col) {
            return Err(ArrayError::RegisterTargetOutOfRange { row, col });
        }
        let byte = self.daq.write_register(row, col, config);
        self.schedule_from_daq(byte, None);
        self.drain();
        Ok(())
    }

    pub fn inject_hits(&mut self, row: u32, col: u32, times: &[f64], channel_masks: &[u16]) -> Result<(), ArrayError> {
        if !self.in_bounds(row, col) {
            return Err(ArrayError::HitTargetOutOfRange { row, col });
        }
        let i = self.idx(row, col);
        self.nodes[i].inject_hits(times, channel_masks);
        self.total_injected_hits += times.len() as u64;
        Ok(())
    }

    pub fn inject_tile(&mut self, tile: &TileInput) -> Result<(), ArrayError> {
        if tile.is_noop() {
            return Ok(());
        }
        for (asic_x, asic_y, samples) in &tile.hits {
            let times: Vec<f64> = samples.iter().map(|(t, _)| *t).collect();
            let masks: Vec<u16> = samples.iter().map(|(_, c)| *c).collect();
            self.inject_hits(*asic_x, *asic_y, &times, &masks)?;
        }
        Ok(())
    }

    pub fn interrogate(&mut self, interval: f64, hard: bool) -> u64 {
        let command = if hard { Command::HardInterrogate } else { Command::Interrogate };
        let (byte, command) = self.daq.issue_command(command);
        self.schedule_from_daq(byte, Some(command));
        self.process(self.array_clock + interval)
    }

    /// Supplemental (§4.1.1): issues the Calibrate command twice, matching
    /// the reference `QpixAsicArray.Calibrate`.
    pub fn calibrate(&mut self, interval: f64) -> u64 {
        let (byte1, command1) = self.daq.issue_command(Command::Calibrate);
        self.schedule_from_daq(byte1, Some(command1));
        let (byte2, command2) = self.daq.issue_command(Command::Calibrate);
        self.schedule_from_daq(byte2, Some(command2));
        self.process(self.array_clock + interval)
    }

    pub fn idle_for(&mut self, interval: f64) -> u64 {
        self.process(self.array_clock + interval)
    }

    fn schedule_from_daq(&mut self, byte: Byte, command: Option<Command>) {
        self.queue.push(QueuedEvent {
            target: self.daq.uplink_target,
            source_direction: self.daq.uplink_dir,
            byte,
            completion_time: self.array_clock,
            command,
        });
    }

    // ---- Time advancement (§4.5) ----

    /// Drains the event queue at the current array clock without
    /// stepping it forward — used for transacted configuration writes,
    /// which cost simulated time via byte transfer but not a full tick
    /// of the outer driver loop.
    fn drain(&mut self) {
        while let Some(event) = self.queue.pop() {
            self.catch_up_all(event.completion_time - EPSILON);
            let outbound = self.deliver(&event);
            self.catch_up_all(event.completion_time);
            for out in outbound {
                self.enqueue(out, event.command);
            }
        }
    }

    pub fn process(&mut self, target_time: f64) -> u64 {
        let mut processed_before = self.queue.processed();
        while self.array_clock < target_time {
            let step_target = (self.array_clock + self.delta_t).min(target_time);

            for i in self.eligible_nodes() {
                let was_idle = self.nodes[i].state == AsicState::Idle;
                let outbound = self.nodes[i].process(step_target - EPSILON);
                if !outbound.is_empty() && was_idle {
                    // A quiescent ASIC producing outbound events outside
                    // the drain loop below is the anomaly §7 calls out.
                    self.alert = true;
                    warn!(
                        "ASIC ({},{}) produced outbound events while idle at t={:.3e}",
                        self.nodes[i].row, self.nodes[i].col, step_target
                    );
                }
                for out in outbound {
                    self.enqueue(out, None);
                }
            }

            self.drain();
            self.array_clock = step_target;
        }

        let processed_after = self.queue.processed();
        processed_after - processed_before
    }

    /// §4.5: "the set of ASICs eligible for process may be narrowed ...
    /// as a performance optimization, not a semantic change."
    fn eligible_nodes(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                n.state != AsicState::Idle
                    || (n.config.send_remote && !n.remote_fifo.is_empty())
                    || (n.config.push_enable && n.has_pending_hits())
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn catch_up_all(&mut self, t: f64) {
        for node in &mut self.nodes {
            node.catch_up(t);
        }
    }

    fn enqueue(&mut self, event: OutboundEvent, command: Option<Command>) {
        self.queue.push(QueuedEvent {
            target: event.target,
            source_direction: event.reverse_direction,
            byte: event.byte,
            completion_time: event.completion_time,
            command,
        });
    }

    fn deliver(&mut self, event: &QueuedEvent) -> Vec<OutboundEvent> {
        match event.target {
            NodeId::Daq => {
                self.daq.receive(event.byte.clone(), event.completion_time);
                Vec::new()
            }
            NodeId::Asic(i) => {
                debug!(
                    "delivering {:?} to ASIC ({},{}) from {:?} at t={:.3e}",
                    event.byte.kind, self.nodes[i].row, self.nodes[i].col, event.source_direction, event.completion_time
                );
                self.nodes[i].receive(event.source_direction, event.byte.clone(), event.completion_time, event.command)
            }
        }
    }

    // ---- Result record (§6) ----

    pub fn result(&self) -> RunResult {
        let architecture = if self.push_enabled { Architecture::Push } else { Architecture::Pull };

        let asics = self
            .nodes
            .iter()
            .map(|n| AsicSummary {
                row: n.row,
                col: n.col,
                frequency_hz: n.freq_hz,
                start_phase: n.start_phase(),
                final_rel_time: n.rel_time(),
                final_rel_tick: n.rel_tick(),
                local_writes: n.local_fifo.total_writes(),
                local_peak: n.local_fifo.peak_size(),
                local_remaining: n.local_fifo.len(),
                local_overflow: n.local_fifo.overflow(),
                remote_writes: n.remote_fifo.total_writes(),
                remote_peak: n.remote_fifo.peak_size(),
                remote_remaining: n.remote_fifo.len(),
                remote_overflow: n.remote_fifo.overflow(),
            })
            .collect();

        let daq_entries = self
            .daq
            .fifo
            .iter()
            .map(|entry| DaqEntryRecord {
                source_row: entry.source_row,
                source_col: entry.source_col,
                word_type: match entry.byte.kind {
                    crate::core::byte::WordKind::Data => DaqWordType::Data,
                    crate::core::byte::WordKind::RegReq => DaqWordType::RegReq,
                    crate::core::byte::WordKind::RegResp => DaqWordType::RegResp,
                    crate::core::byte::WordKind::EvtEnd => DaqWordType::EvtEnd,
                },
                daq_tick: entry.daq_tick,
                source_tick: entry.byte.timestamp,
                source_wall_time: Some(entry.received_at),
                channel_mask: entry.byte.channel_mask,
            })
            .collect();

        RunResult {
            architecture,
            routing: self.routing.clone(),
            total_injected_hits: self.total_injected_hits,
            asics,
            daq_entries,
            array_alert: self.alert,
            events_processed: self.queue.processed(),
            final_array_clock: self.array_clock,
        }
    }

    pub fn array_clock(&self) -> f64 {
        self.array_clock
    }

    pub fn nrows(&self) -> u32 {
        self.nrows
    }

    pub fn ncols(&self) -> u32 {
        self.ncols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_mask(bit: u32) -> u16 {
        1u16 << bit
    }

    #[test]
    fn two_by_two_snake_route_ten_hits_each_produces_forty_data_and_four_evtend() {
        // A high nominal frequency keeps each 1ns-spaced hit on its own
        // tick, so none of them coalesce.
        let mut array = Array::new(2, 2, 5_000_000_000.0, 0.0, 15_000, 2);
        array.route("snake", 15_000, false, None).unwrap();

        for row in 0..2 {
            for col in 0..2 {
                let times: Vec<f64> = (1..=10).map(|k| k as f64 * 1e-9).collect();
                let masks: Vec<u16> = (1..=10).map(|_| channel_mask(0)).collect();
                array.inject_hits(row, col, &times, &masks).unwrap();
            }
        }

        array.interrogate(1.0, false);

        let result = array.result();
        let data_count = result.daq_entries.iter().filter(|e| e.word_type == DaqWordType::Data).count();
        let evtend_count = result.daq_entries.iter().filter(|e| e.word_type == DaqWordType::EvtEnd).count();
        assert_eq!(evtend_count, 4);
        assert_eq!(data_count, 40);
        assert!(result.asics.iter().all(|a| !a.local_overflow && !a.remote_overflow));
    }

    #[test]
    fn four_by_four_left_route_ten_interrogations_with_no_hits_yields_only_evtend() {
        let mut array = Array::new(4, 4, 50_000_000.0, 0.05, 15_000, 3);
        array.route("left", 15_000, false, None).unwrap();

        for _ in 0..10 {
            array.interrogate(0.5, true);
        }

        let result = array.result();
        let data_count = result.daq_entries.iter().filter(|e| e.word_type == DaqWordType::Data).count();
        let evtend_count = result.daq_entries.iter().filter(|e| e.word_type == DaqWordType::EvtEnd).count();
        assert_eq!(data_count, 0);
        assert_eq!(evtend_count, 160);
    }

    #[test]
    fn one_by_one_push_mode_thousand_hits_idle_drains_to_daq() {
        let mut array = Array::new(1, 1, 50_000_000.0, 0.0, 15_000, 8);
        array.route("left", 15_000, false, None).unwrap();
        array.set_push_state(true, false).unwrap();

        let mut rng = StdRng::seed_from_u64(9);
        let times: Vec<f64> = (0..1000).map(|_| rng.gen_range(0.0..0.01)).collect();
        let masks: Vec<u16> = (0..1000).map(|_| channel_mask(0)).collect();
        array.inject_hits(0, 0, &times, &masks).unwrap();

        let finish_entries = array.nodes[0]
            .state_history
            .iter()
            .filter(|(s, _, _)| *s == AsicState::Finish)
            .count();

        array.idle_for(0.1);

        let result = array.result();
        let data_count = result.daq_entries.iter().filter(|e| e.word_type == DaqWordType::Data).count();
        let evtend_count = result.daq_entries.iter().filter(|e| e.word_type == DaqWordType::EvtEnd).count();
        let finish_entries_after = array.nodes[0]
            .state_history
            .iter()
            .filter(|(s, _, _)| *s == AsicState::Finish)
            .count();

        assert!(data_count > 0 && data_count <= 1000);
        assert_eq!(result.asics[0].local_remaining, 0);
        assert_eq!(result.asics[0].remote_remaining, 0);
        // §8 universal invariant: EVTEND count at the DAQ equals the number
        // of FINISH-state entries across the run, push-driven or not.
        assert_eq!(evtend_count, finish_entries_after - finish_entries);
        assert_eq!(result.total_injected_hits, 1000);
    }

    #[test]
    fn repeated_request_id_back_to_back_adds_no_further_entries() {
        use crate::core::byte::RegReqPayload;

        let mut array = Array::new(3, 3, 50_000_000.0, 0.0, 15_000, 4);
        array.route("snake", 15_000, false, None).unwrap();

        let payload = RegReqPayload {
            dest_row: None,
            dest_col: None,
            broadcast: true,
            op_write: false,
            op_read: false,
            request_id: 7,
            config: AsicConfig::default(),
        };
        let byte = Byte::reg_req(None, None, payload);
        array.schedule_from_daq(byte.clone(), Some(Command::Interrogate));
        array.process(array.array_clock + 0.2);
        let first = array.result().daq_entries.len();

        array.schedule_from_daq(byte, Some(Command::Interrogate));
        array.process(array.array_clock + 0.2);
        let second = array.result().daq_entries.len();

        assert_eq!(second, first, "a repeated request-id must not produce further FIFO writes");
    }

    #[test]
    fn trunk_route_rejects_transact() {
        let mut array = Array::new(2, 4, 50_000_000.0, 0.0, 15_000, 5);
        let err = array.route("trunk", 15_000, true, Some(2)).unwrap_err();
        assert!(matches!(err, ArrayError::RelocatingTransactedRoute));
    }

    #[test]
    fn trunk_route_rejects_edge_position() {
        let mut array = Array::new(2, 4, 50_000_000.0, 0.0, 15_000, 6);
        let err = array.route("trunk", 15_000, false, Some(0)).unwrap_err();
        assert!(matches!(err, ArrayError::TrunkPositionOutOfRange { .. }));
    }

    #[test]
    fn unknown_route_name_is_a_structured_error() {
        let mut array = Array::new(2, 2, 50_000_000.0, 0.0, 15_000, 7);
        let err = array.route("diagonal", 15_000, false, None).unwrap_err();
        assert!(matches!(err, ArrayError::UnknownRoute(_)));
    }
}
