//! Hybrid host/accelerator force computation for 12-6 Lennard-Jones plus real-space Ewald
//! Coulomb interactions.
//!
//! `Device` assigns accelerators to cooperating processes and owns the accelerator-side buffers.
//! `WorkSplit` decides how many owned atoms the host takes each step, and `PairLjCutCoulLong`
//! computes that host fraction on a fixed-size thread pool, optionally through the RESPA shells
//! and a bit-bucketed Coulomb lookup table.

use lin_alg::f64::Vec3;

pub mod buffers;
pub mod comm;
pub mod config;
pub mod device;
pub mod error;
pub mod ewald_table;
pub mod float_bits;
#[cfg(feature = "cuda")]
pub mod gpu;
#[cfg(feature = "mpi")]
pub mod mpi_comm;
pub mod neighbors;
pub mod pair;
pub mod params;
pub mod reduce;
pub mod respa;
pub mod runtime;
pub mod split;
pub mod timing;
pub mod util;

#[cfg(test)]
mod tests;

pub use comm::{Communicator, ReduceOp, SelfComm, ThreadComm};
pub use config::EngineConfig;
pub use device::{Device, DeviceAssignment, GpuMode, Precision};
pub use error::{status_of, ConfigError, DeviceError};
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;
pub use neighbors::NeighList;
pub use pair::{EvalMode, PairLjCutCoulLong};
pub use reduce::EnergyVirial;
pub use respa::RespaCutoffs;
pub use runtime::{DeviceRuntime, HostRuntime};
pub use split::WorkSplit;

/// Coulomb conversion constant for real units: kcal/mol · Å / e².
pub const QQRD2E_REAL: f64 = 332.06371;

/// Per-step atom data, borrowed for one evaluation. Owned atoms come first (`0..nlocal`), ghosts
/// after. Types are 1-based, as they are in coefficient commands.
#[derive(Clone, Copy, Debug)]
pub struct AtomView<'a> {
    pub posits: &'a [Vec3],
    pub charges: &'a [f64],
    pub types: &'a [usize],
    pub nlocal: usize,
}

impl<'a> AtomView<'a> {
    pub fn new(posits: &'a [Vec3], charges: &'a [f64], types: &'a [usize], nlocal: usize) -> Self {
        Self {
            posits,
            charges,
            types,
            nlocal,
        }
    }

    /// Owned plus ghost atoms.
    pub fn nall(&self) -> usize {
        self.posits.len()
    }
}
