//! The per-ASIC finite state machine, FIFO pair, and neighbor links.
//!
//! This is the mesh's routing node, modeled on `QPixAsic` from the
//! reference simulator. ASICs are stored in an arena (`Array::nodes`,
//! see `core::array`) and addressed by `NodeId` rather than through
//! cyclic `Rc`/`RefCell` neighbor pointers, per the reference's own
//! design note: a neighbor link is an index pair, not a pointer.

pub mod daq;

use rand::Rng;
use tracing::{debug, warn};

use crate::core::byte::{Byte, Command, Direction, WordKind};
use crate::core::config::AsicConfig;
use crate::core::fifo::{Fifo, ASIC_FIFO_DEPTH};

/// Addresses either a mesh ASIC (by arena index) or the distinguished
/// DAQ sink, matching design note §9: "the DAQ sink is a distinguished
/// index", not a special case bolted onto every neighbor lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeId {
    Asic(usize),
    Daq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsicState {
    Idle,
    TransmitLocal,
    TransmitRemote,
    TransmitReg,
    Finish,
}

/// A byte handed off to a neighbor, ready for the Array to schedule into
/// the event queue at `completion_time`.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub target: NodeId,
    pub reverse_direction: Direction,
    pub byte: Byte,
    pub completion_time: f64,
}

/// Directional pair of busy-until timestamps, owned by the sending node.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeighborLink {
    pub target: Option<NodeId>,
    tx_busy_until: f64,
    rx_busy_until: f64,
}

impl NeighborLink {
    /// Marks tx busy for a send completing at `complete_time` that
    /// occupies the link for `transfer_time`. Returns `true` if the link
    /// was already busy past the point this send would need to start —
    /// the caller must then push the send out to the next free slot.
    fn try_send(&mut self, complete_time: f64, transfer_time: f64) -> bool {
        if self.tx_busy_until > complete_time - transfer_time {
            self.target.is_some()
        } else {
            self.tx_busy_until = complete_time;
            false
        }
    }

    /// §5: receiving on a busy rx line is a non-fatal warning, never a
    /// dropped byte — the byte still lands, the link bookkeeping just
    /// reports the contention.
    fn recv(&mut self, complete_time: f64) -> bool {
        if self.rx_busy_until > complete_time {
            true
        } else {
            self.rx_busy_until = complete_time;
            false
        }
    }
}

pub struct AsicNode {
    pub row: u32,
    pub col: u32,
    pub freq_hz: f64,
    pub period: f64,
    start_phase: f64,
    abs_time: f64,
    rel_tick: u64,
    pub local_fifo: Fifo<Byte>,
    pub remote_fifo: Fifo<Byte>,
    pub links: [NeighborLink; 4],
    last_request_id: i64,
    pub state: AsicState,
    pub state_history: Vec<(AsicState, f64, f64)>,
    pub config: AsicConfig,
    timeout_start: f64,
    /// Injected (time, channel_mask) pairs not yet read into the local
    /// FIFO, kept sorted ascending by time.
    injected: Vec<(f64, u16)>,
    /// Request id of the interrogate currently being serviced, echoed
    /// back in the EVTEND word (`_intID`/`_intTick` in the reference).
    interrogate_request_id: i64,
    interrogate_tick: u32,
    pub rx_busy_warnings: u64,
}

impl AsicNode {
    pub fn new(row: u32, col: u32, freq_hz: f64, remote_timeout: u64, rng: &mut impl Rng) -> Self {
        let period = 1.0 / freq_hz;
        let start_phase = (rng.gen::<f64>() - 0.5) * period;
        AsicNode {
            row,
            col,
            freq_hz,
            period,
            start_phase,
            abs_time: 0.0,
            rel_tick: 0,
            local_fifo: Fifo::bounded(ASIC_FIFO_DEPTH),
            remote_fifo: Fifo::bounded(ASIC_FIFO_DEPTH),
            links: [NeighborLink::default(); 4],
            last_request_id: -1,
            state: AsicState::Idle,
            state_history: vec![(AsicState::Idle, start_phase, 0.0)],
            config: AsicConfig::new(Direction::North, remote_timeout),
            timeout_start: start_phase,
            injected: Vec::new(),
            interrogate_request_id: -1,
            interrogate_tick: 0,
            rx_busy_warnings: 0,
        }
    }

    pub fn abs_time(&self) -> f64 {
        self.abs_time
    }

    pub fn rel_tick(&self) -> u64 {
        self.rel_tick
    }

    /// §3 invariant: `rel_tick` is a pure function of `abs_time` and
    /// `start_phase`.
    fn calc_tick(&self, abs_time: f64) -> u64 {
        let tdiff = abs_time - self.start_phase;
        (tdiff / self.period).floor() as i64 as u64 + 1
    }

    pub fn rel_time(&self) -> f64 {
        self.rel_tick as f64 * self.period + self.start_phase
    }

    pub fn start_phase(&self) -> f64 {
        self.start_phase
    }

    /// Advances this node's local clock without driving any state
    /// transition — used by the Array's driver loop to keep every ASIC's
    /// `abs_time` (and, under push mode, its pending hits) current while
    /// another node's event is being delivered.
    pub fn catch_up(&mut self, target_abs_time: f64) {
        if target_abs_time > self.abs_time {
            self.update_time(target_abs_time, None, 0.0);
        }
    }

    fn change_state(&mut self, new_state: AsicState) {
        // Design note §9: entering TransmitRemote from TransmitRemote
        // itself (looping on a non-empty FIFO) must NOT re-latch
        // timeout_start — only entry from Finish or Idle does.
        if new_state == AsicState::TransmitRemote
            && (self.state == AsicState::Finish || self.state == AsicState::Idle)
            && !self.config.send_remote
        {
            self.timeout_start = self.rel_time();
        }
        if self.state != new_state {
            self.state = new_state;
            self.state_history.push((new_state, self.rel_time(), self.abs_time));
        }
    }

    /// §5: the link-aware time-advancement helper. `link` is
    /// `(direction, is_tx)`; `transfer_time` is the byte duration in
    /// seconds being accounted against that link.
    fn update_time(&mut self, target_abs_time: f64, link: Option<(Direction, bool)>, transfer_time: f64) -> f64 {
        if self.config.push_enable {
            self.read_hits(target_abs_time);
        }

        let mut completion = target_abs_time;
        if let Some((dir, is_tx)) = link {
            let idx = dir.index();
            if is_tx {
                if self.links[idx].try_send(target_abs_time, transfer_time) {
                    completion = self.links[idx].tx_busy_until + transfer_time + self.period;
                    if self.links[idx].try_send(completion, transfer_time) {
                        panic!(
                            "ASIC ({},{}) direction {:?}: link still busy after rescheduling to next free slot",
                            self.row, self.col, dir
                        );
                    }
                }
            } else if self.links[idx].recv(target_abs_time) {
                self.rx_busy_warnings += 1;
                warn!(
                    "ASIC ({},{}): receiving on busy rx link {:?} at t={:.3e}",
                    self.row, self.col, dir, target_abs_time
                );
            }
        }

        if target_abs_time > self.abs_time {
            self.abs_time = completion;
            self.rel_tick = self.calc_tick(self.abs_time);
        }

        completion
    }

    fn timeout(&self) -> bool {
        if self.config.send_remote {
            self.remote_fifo.is_empty()
        } else {
            self.rel_time() - self.timeout_start > self.config.remote_timeout as f64 * self.period
        }
    }

    fn outbound_dir(&self) -> Direction {
        self.config.direction
    }

    fn target_of(&self, dir: Direction) -> NodeId {
        self.links[dir.index()].target.unwrap_or_else(|| {
            panic!(
                "ASIC ({},{}) attempted to send {:?} with no neighbor connected",
                self.row, self.col, dir
            )
        })
    }

    fn send_single(&mut self, byte: Byte, dir: Direction) -> OutboundEvent {
        let transfer_time = self.period * byte.transfer_ticks as f64;
        let completion_time = self.abs_time + transfer_time;
        let send_t = self.update_time(completion_time, Some((dir, true)), transfer_time);
        OutboundEvent {
            target: self.target_of(dir),
            reverse_direction: dir.reverse(),
            byte,
            completion_time: send_t,
        }
    }

    // ---- Hit injection & coalescing (§6) ----

    pub fn inject_hits(&mut self, times: &[f64], channel_masks: &[u16]) {
        assert_eq!(
            times.len(),
            channel_masks.len(),
            "injected times and channels must be the same length"
        );
        if times.is_empty() {
            return;
        }

        let mut combined: Vec<(f64, u16)> = self
            .injected
            .drain(..)
            .chain(times.iter().copied().zip(channel_masks.iter().copied()))
            .collect();
        combined.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("hit times must not be NaN"));

        let mut times: Vec<f64> = combined.iter().map(|(t, _)| *t).collect();
        let mut channels: Vec<u16> = combined.iter().map(|(_, c)| *c).collect();
        self.coalesce(&mut times, &mut channels);

        self.injected = times.into_iter().zip(channels).collect();
    }

    /// §6, §9: merges hits that land on the same tick, with channel
    /// collisions shifted forward by one clock period. Design note §9
    /// calls out the reference's unproven termination bound — this caps
    /// iterations and treats exceeding the cap as a programmer error.
    fn coalesce(&self, times: &mut Vec<f64>, channels: &mut Vec<u16>) {
        const MAX_ITERATIONS: usize = 10_000;
        let mut iterations = 0;
        loop {
            let mut collide_at = Vec::new();
            let mut anchor = 0usize;
            for i in 0..times.len().saturating_sub(1) {
                if self.calc_tick(times[i + 1]) == self.calc_tick(times[anchor]) {
                    collide_at.push(i + 1);
                } else {
                    anchor = i + 1;
                }
            }
            if collide_at.is_empty() {
                break;
            }
            for &k in collide_at.iter().rev() {
                if channels[k] & channels[k - 1] == 0 {
                    times.remove(k);
                    let merged = channels.remove(k);
                    channels[k - 1] |= merged;
                } else {
                    let union = channels[k] | channels[k - 1];
                    let shared = channels[k] & channels[k - 1];
                    channels[k - 1] = union;
                    channels[k] = shared;
                    times[k] += self.period;
                }
            }
            iterations += 1;
            if iterations > MAX_ITERATIONS {
                panic!(
                    "ASIC ({},{}): hit coalescing failed to converge after {MAX_ITERATIONS} iterations",
                    self.row, self.col
                );
            }
        }
    }

    /// Pulls every injected hit at or before `target_time` into the
    /// local FIFO as DATA bytes.
    fn read_hits(&mut self, target_time: f64) -> usize {
        let split = self
            .injected
            .iter()
            .position(|(t, _)| *t > target_time)
            .unwrap_or(self.injected.len());
        let ready: Vec<(f64, u16)> = self.injected.drain(..split).collect();
        let count = ready.len();
        for (time, mask) in ready {
            let tick = self.calc_tick(time) as u32;
            self.local_fifo.write(Byte::data(self.row, self.col, tick, mask));
        }
        count
    }

    pub fn has_pending_hits(&self) -> bool {
        !self.injected.is_empty()
    }

    // ---- FSM: process (§4.1, §4.5) ----

    pub fn process(&mut self, target_time: f64) -> Vec<OutboundEvent> {
        if self.abs_time >= target_time {
            return Vec::new();
        }

        if self.state == AsicState::Idle {
            if self.config.push_enable && !self.local_fifo.is_empty() {
                self.change_state(AsicState::TransmitLocal);
            } else if self.config.send_remote && !self.remote_fifo.is_empty() {
                self.change_state(AsicState::TransmitRemote);
            } else {
                self.update_time(target_time, None, 0.0);
                return Vec::new();
            }
        }

        match self.state {
            AsicState::TransmitLocal => self.process_transmit_local(target_time),
            AsicState::Finish => self.process_finish(),
            AsicState::TransmitRemote => self.process_transmit_remote(target_time),
            AsicState::TransmitReg => self.process_register_response(),
            AsicState::Idle => unreachable!("Idle is handled above before falling through"),
        }
    }

    fn process_transmit_local(&mut self, target_time: f64) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        while self.abs_time < target_time && !self.local_fifo.is_empty() {
            let hit = self.local_fifo.read().expect("checked non-empty above");
            let dir = self.outbound_dir();
            out.push(self.send_single(hit, dir));
        }
        if self.local_fifo.is_empty() {
            self.change_state(AsicState::Finish);
        }
        out
    }

    fn process_finish(&mut self) -> Vec<OutboundEvent> {
        let finish_byte = Byte::evtend(
            self.row,
            self.col,
            self.interrogate_request_id,
            self.interrogate_tick,
        );
        let dir = self.outbound_dir();
        let event = self.send_single(finish_byte, dir);
        self.change_state(AsicState::TransmitRemote);
        vec![event]
    }

    fn process_transmit_remote(&mut self, target_time: f64) -> Vec<OutboundEvent> {
        if self.timeout() {
            self.change_state(AsicState::Idle);
            self.update_time(target_time, None, 0.0);
            return Vec::new();
        }

        if self.remote_fifo.is_empty() {
            let deadline = self.timeout_start + self.config.remote_timeout as f64 * self.period;
            if target_time > deadline {
                self.update_time(deadline, None, 0.0);
                self.change_state(AsicState::Idle);
                assert!(
                    !self.config.send_remote,
                    "ASIC ({},{}): should not time out of TransmitRemote while send_remote is set",
                    self.row, self.col
                );
            } else {
                self.update_time(target_time, None, 0.0);
            }
            return Vec::new();
        }

        let mut out = Vec::new();
        while !self.remote_fifo.is_empty() && !self.timeout() && self.abs_time < target_time {
            let hit = self.remote_fifo.read().expect("checked non-empty above");
            let dir = self.outbound_dir();
            out.push(self.send_single(hit, dir));
        }

        if self.timeout() {
            self.change_state(AsicState::Idle);
        } else {
            self.change_state(AsicState::TransmitRemote);
        }
        out
    }

    fn process_register_response(&mut self) -> Vec<OutboundEvent> {
        let resp = self
            .remote_fifo
            .read()
            .unwrap_or_else(|| panic!("ASIC ({},{}): TransmitReg with nothing queued to send", self.row, self.col));
        let dir = self.outbound_dir();
        let event = self.send_single(resp, dir);
        self.change_state(AsicState::Idle);
        vec![event]
    }

    // ---- FSM: receive (§4.1) ----

    /// Handles one incoming byte. Returns any outbound broadcast
    /// retransmissions generated along the way (§4.1: "Broadcasts are
    /// immediately re-transmitted out of all other connected neighbors
    /// ... and only then is the node's own action on the packet
    /// evaluated").
    pub fn receive(
        &mut self,
        source_dir: Direction,
        byte: Byte,
        in_time: f64,
        command: Option<Command>,
    ) -> Vec<OutboundEvent> {
        if self.links[source_dir.index()].target.is_none() {
            warn!(
                "ASIC ({},{}): receiving data from non-existent connection {:?}",
                self.row, self.col, source_dir
            );
            return Vec::new();
        }

        if byte.kind == WordKind::RegReq {
            let payload = byte.reg_req.expect("RegReq byte must carry a payload");
            if self.last_request_id == payload.request_id {
                // loop prevention: silently drop a request we've already seen.
                return Vec::new();
            }
            return self.receive_reg_req(source_dir, byte, payload, in_time, command);
        }

        // Non-REGREQ bytes are written unconditionally to the remote FIFO;
        // forwarding happens later from TransmitRemote.
        self.remote_fifo.write(byte);
        Vec::new()
    }

    fn receive_reg_req(
        &mut self,
        source_dir: Direction,
        byte: Byte,
        payload: crate::core::byte::RegReqPayload,
        in_time: f64,
        command: Option<Command>,
    ) -> Vec<OutboundEvent> {
        self.last_request_id = payload.request_id;

        if !self.config.manual_route {
            self.config.direction = source_dir;
        }

        let mut out = if payload.broadcast {
            self.broadcast(source_dir, &byte, in_time, command)
        } else {
            Vec::new()
        };

        let targets_this_asic =
            payload.dest_row == Some(self.row) && payload.dest_col == Some(self.col);
        if !(targets_this_asic || payload.broadcast) {
            return out;
        }

        if payload.op_write {
            self.config = payload.config;
        } else if payload.op_read {
            let resp = Byte::reg_resp(self.row, self.col, self.config);
            self.remote_fifo.write(resp);
            self.change_state(AsicState::TransmitReg);
        } else {
            match command {
                Some(Command::Interrogate) | Some(Command::HardInterrogate) => {
                    self.read_hits(in_time);
                    self.interrogate_request_id = payload.request_id;
                    self.interrogate_tick = self.calc_tick(in_time) as u32;
                }
                Some(Command::Calibrate) => {
                    let tick = self.calc_tick(in_time) as u32;
                    self.local_fifo
                        .write(Byte::calibrate_resp(self.row, self.col, payload.request_id, tick));
                }
                None => {}
            }
            if !self.local_fifo.is_empty() || command == Some(Command::HardInterrogate) {
                self.change_state(AsicState::TransmitLocal);
            }
        }

        out.shrink_to_fit();
        out
    }

    fn broadcast(
        &mut self,
        source_dir: Direction,
        byte: &Byte,
        in_time: f64,
        command: Option<Command>,
    ) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        for dir in Direction::ALL {
            if dir == source_dir || self.links[dir.index()].target.is_none() {
                continue;
            }
            let transfer_time = self.period * byte.transfer_ticks as f64;
            let completion = in_time + transfer_time;
            let send_t = self.update_time(completion, Some((dir, true)), transfer_time);
            debug!(
                "ASIC ({},{}) broadcasting {:?} toward {:?} at t={:.3e}",
                self.row, self.col, command, dir, send_t
            );
            out.push(OutboundEvent {
                target: self.target_of(dir),
                reverse_direction: dir.reverse(),
                byte: byte.clone(),
                completion_time: send_t,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn node(rng: &mut StdRng) -> AsicNode {
        AsicNode::new(0, 0, 50_000_000.0, 15_000, rng)
    }

    #[test]
    fn rel_tick_is_pure_function_of_abs_time_and_phase() {
        let mut rng = StdRng::seed_from_u64(1);
        let n = node(&mut rng);
        let t = 12.3456e-6;
        assert_eq!(n.calc_tick(t), n.calc_tick(t));
    }

    #[test]
    fn hit_coalescing_merges_same_tick_disjoint_channels() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut n = node(&mut rng);
        let t = 5.0 * n.period;
        n.inject_hits(&[t, t + 0.1 * n.period], &[1 << 3, 1 << 5]);
        assert_eq!(n.injected.len(), 1);
        assert_eq!(n.injected[0].1, (1 << 3) | (1 << 5));
    }

    #[test]
    fn hit_coalescing_shifts_colliding_channel_to_next_tick() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut n = node(&mut rng);
        let t = 5.0 * n.period;
        n.inject_hits(&[t, t + 0.1 * n.period], &[1 << 3, (1 << 3) | (1 << 7)]);
        assert_eq!(n.injected.len(), 2);
        assert_eq!(n.injected[0].1, (1 << 3) | (1 << 7));
        assert_eq!(n.injected[1].1, 1 << 3);
        assert!(n.injected[1].0 > n.injected[0].0);
    }

    #[test]
    fn timeout_transmit_remote_does_not_reset_on_loopback() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut n = node(&mut rng);
        n.change_state(AsicState::TransmitRemote);
        let latched = n.timeout_start;
        n.change_state(AsicState::TransmitRemote);
        assert_eq!(n.timeout_start, latched);
    }

    #[test]
    fn repeated_request_id_is_dropped_without_writes() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut n = node(&mut rng);
        n.links[Direction::North.index()].target = Some(NodeId::Asic(1));
        let payload = crate::core::byte::RegReqPayload {
            dest_row: None,
            dest_col: None,
            broadcast: true,
            op_write: false,
            op_read: false,
            request_id: 7,
            config: AsicConfig::default(),
        };
        let byte = Byte::reg_req(None, None, payload);
        let out1 = n.receive(Direction::North, byte.clone(), 0.0, Some(Command::Interrogate));
        assert!(!out1.is_empty() || n.local_fifo.is_empty());
        let out2 = n.receive(Direction::North, byte, 0.0, Some(Command::Interrogate));
        assert!(out2.is_empty());
    }
}
