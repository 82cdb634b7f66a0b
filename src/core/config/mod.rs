//! Per-ASIC configuration: the only parameters a REGREQ write may mutate.
//!
//! Kept as a plain `Copy` value struct, mirroring the `AsicConfig`
//! dataclass in `QpixAsic.py` — every field here is swapped in as a whole
//! on a register write, never patched field-by-field.

use crate::core::byte::Direction;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AsicConfig {
    /// Outbound direction used when manual routing is enabled, or the
    /// direction most recently learned via reverse-path routing.
    pub direction: Direction,
    /// Ticks an ASIC remains in TransmitRemote before giving up and
    /// returning to Idle, when `send_remote` is not set.
    pub remote_timeout: u64,
    /// Ticks collected before auto-entering TransmitLocal under push mode.
    /// Unused unless `push_enable` is set (kept for parity with the
    /// reference's `pTimeout`, which only the push driver consults).
    pub push_timeout: u64,
    pub manual_route: bool,
    pub send_enable: bool,
    pub receive_enable: bool,
    pub register_enable: bool,
    pub push_enable: bool,
    /// When set, an ASIC forwards remote data from any state and never
    /// times out of TransmitRemote while the FIFO is non-empty.
    pub send_remote: bool,
}

impl Default for AsicConfig {
    fn default() -> Self {
        AsicConfig {
            direction: Direction::North,
            remote_timeout: 15_000,
            push_timeout: 25_000_000,
            manual_route: false,
            send_enable: true,
            receive_enable: true,
            register_enable: true,
            push_enable: false,
            send_remote: false,
        }
    }
}

impl AsicConfig {
    pub fn new(direction: Direction, remote_timeout: u64) -> Self {
        AsicConfig {
            direction,
            remote_timeout,
            ..AsicConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_points_north_and_is_not_manual() {
        let cfg = AsicConfig::default();
        assert_eq!(cfg.direction, Direction::North);
        assert!(!cfg.manual_route);
        assert!(!cfg.send_remote);
    }
}
