//! The DAQ sink: a distinguished node that masquerades as an ASIC at a
//! configurable edge position but never enters the Idle/TransmitLocal/
//! TransmitRemote/TransmitReg state machine. Grounded in the reference's
//! `DaqNode(QPixAsic)` subclass, which overrides `ReceiveByte` and issues
//! REGREQ broadcasts rather than servicing them.

use tracing::debug;

use crate::core::asic::NodeId;
use crate::core::byte::{Byte, Command, Direction, RegReqPayload};
use crate::core::config::AsicConfig;
use crate::core::fifo::{DaqEntry, DaqFifo};

pub struct DaqNode {
    pub freq_hz: f64,
    pub period: f64,
    abs_time: f64,
    daq_tick: u64,
    pub fifo: DaqFifo,
    next_request_id: i64,
    /// The mesh ASIC this sink is wired to, and the direction at which it
    /// attaches there (§4.7: "exactly one neighbor link of exactly one
    /// mesh ASIC references the DAQ sink").
    pub uplink_target: NodeId,
    pub uplink_dir: Direction,
}

impl DaqNode {
    pub fn new(freq_hz: f64, uplink_target: NodeId, uplink_dir: Direction) -> Self {
        DaqNode {
            freq_hz,
            period: 1.0 / freq_hz,
            abs_time: 0.0,
            daq_tick: 0,
            fifo: DaqFifo::new(),
            next_request_id: 0,
            uplink_target,
            uplink_dir,
        }
    }

    fn calc_tick(&self, abs_time: f64) -> u64 {
        (abs_time / self.period).floor() as i64 as u64 + 1
    }

    /// §4.1 (DaqNode.ReceiveByte): always advances the DAQ's own clock
    /// first, then classifies and stores the byte — it never forwards.
    pub fn receive(&mut self, byte: Byte, in_time: f64) {
        if in_time > self.abs_time {
            self.abs_time = in_time;
            self.daq_tick = self.calc_tick(in_time);
        }
        debug!(
            "DAQ receiving {:?} from ({:?},{:?}) at t={:.3e}",
            byte.kind, byte.origin_row, byte.origin_col, in_time
        );
        self.fifo.write(DaqEntry {
            daq_tick: self.daq_tick as u32,
            source_row: byte.origin_row,
            source_col: byte.origin_col,
            received_at: in_time,
            byte,
        });
    }

    fn next_id(&mut self) -> i64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Builds a broadcast REGREQ carrying `command`, to be scheduled by
    /// the Array onto `uplink_target`/`uplink_dir`.
    pub fn issue_command(&mut self, command: Command) -> (Byte, Command) {
        let payload = RegReqPayload {
            dest_row: None,
            dest_col: None,
            broadcast: true,
            op_write: false,
            op_read: false,
            request_id: self.next_id(),
            config: AsicConfig::default(),
        };
        (Byte::reg_req(None, None, payload), command)
    }

    /// Builds a register write addressed at (row, col). Flagged as a
    /// broadcast so intermediate ASICs relay it toward the target the
    /// same way an interrogate propagates — the mesh has no unicast
    /// routing, only flood-and-match.
    pub fn write_register(&mut self, row: u32, col: u32, config: AsicConfig) -> Byte {
        let payload = RegReqPayload {
            dest_row: Some(row),
            dest_col: Some(col),
            broadcast: true,
            op_write: true,
            op_read: false,
            request_id: self.next_id(),
            config,
        };
        Byte::reg_req(None, None, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_advances_clock_monotonically() {
        let mut daq = DaqNode::new(1.0, NodeId::Asic(0), Direction::West);
        daq.receive(Byte::data(0, 0, 0, 1), 1.0);
        let tick_after_first = daq.daq_tick;
        daq.receive(Byte::data(0, 0, 0, 1), 0.5);
        assert_eq!(daq.daq_tick, tick_after_first);
    }

    #[test]
    fn issue_command_increments_request_id() {
        let mut daq = DaqNode::new(1.0, NodeId::Asic(0), Direction::West);
        let (_, _) = daq.issue_command(Command::Interrogate);
        let (byte, _) = daq.issue_command(Command::Interrogate);
        assert_eq!(byte.reg_req.unwrap().request_id, 1);
    }
}
