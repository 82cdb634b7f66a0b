//! Input-validity errors surfaced to callers of `Array`'s driver API.
//!
//! Programmer errors (a malformed arena, an unconnected link that should
//! never be unconnected) stay `panic!`/`unreachable!` per the reference's
//! own assertions — this enum is only for bad caller input, the kind a CLI
//! user can actually trigger by passing a bad route name or coordinate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArrayError {
    #[error("unknown route topology: {0:?} (expected \"left\", \"snake\", or \"trunk\")")]
    UnknownRoute(String),

    #[error("trunk position {pos} is out of range for a {ncols}-column array")]
    TrunkPositionOutOfRange { pos: usize, ncols: usize },

    #[error("trunk route requires a transact-free relocation of the DAQ uplink")]
    RelocatingTransactedRoute,

    #[error("register target ({row},{col}) is out of range for this array")]
    RegisterTargetOutOfRange { row: u32, col: u32 },

    #[error("tile input hit at ({row},{col}) is out of range for this array")]
    HitTargetOutOfRange { row: u32, col: u32 },
}
