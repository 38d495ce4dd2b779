//! Per-thread force accumulation. Each logical thread writes only its own row of a
//! (thread, atom) arena; rows are then summed into the shared force array in ascending thread
//! order, so results don't depend on scheduling.

use std::ops::{AddAssign, Range};

use lin_alg::f64::Vec3;
use rayon::prelude::*;

/// Contiguous owned-list index range for logical thread `tid`. Fixed before the parallel region.
pub fn thread_range(tid: usize, nthreads: usize, inum: usize) -> Range<usize> {
    let idelta = 1 + inum / nthreads;
    let from = (tid * idelta).min(inum);
    let to = (from + idelta).min(inum);
    from..to
}

pub struct ForceArena {
    nthreads: usize,
    nall: usize,
    data: Vec<Vec3>,
}

impl ForceArena {
    pub fn new(nthreads: usize, nall: usize) -> Self {
        Self {
            nthreads,
            nall,
            data: vec![Vec3::new_zero(); nthreads * nall],
        }
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    /// One disjoint mutable row per thread, for use with `par_chunks_mut`-style iteration.
    pub fn rows_mut(&mut self) -> rayon::slice::ChunksMut<'_, Vec3> {
        // `par_chunks_mut` panics on a zero chunk size.
        self.data.par_chunks_mut(self.nall.max(1))
    }

    pub fn row(&self, tid: usize) -> &[Vec3] {
        &self.data[tid * self.nall..(tid + 1) * self.nall]
    }

    /// Adds every row into `f`. Each atom sums its rows from thread 0 upward.
    pub fn merge_into(&self, f: &mut [Vec3]) {
        let nall = self.nall;
        let nthreads = self.nthreads;
        let data = &self.data;

        f[..nall].par_iter_mut().enumerate().for_each(|(i, fi)| {
            for tid in 0..nthreads {
                *fi += data[tid * nall + i];
            }
        });
    }

    pub fn memory_usage(&self) -> usize {
        self.data.len() * std::mem::size_of::<Vec3>()
    }
}

/// Energy and virial tallies from one evaluation. The virial is ordered xx, yy, zz, xy, xz, yz.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EnergyVirial {
    pub evdwl: f64,
    pub ecoul: f64,
    pub virial: [f64; 6],
}

impl EnergyVirial {
    /// Tallies one pair. Without Newton summation, a pair with one ghost atom counts half.
    #[allow(clippy::too_many_arguments)]
    pub fn tally(
        &mut self,
        energy: bool,
        virial: bool,
        scale_i: bool,
        scale_j: bool,
        newton_pair: bool,
        evdwl: f64,
        ecoul: f64,
        fpair: f64,
        del: Vec3,
    ) {
        let weight = if newton_pair {
            1.
        } else {
            0.5 * (scale_i as u8 as f64 + scale_j as u8 as f64)
        };

        if energy {
            self.evdwl += weight * evdwl;
            self.ecoul += weight * ecoul;
        }

        if virial {
            let v = [
                del.x * del.x * fpair,
                del.y * del.y * fpair,
                del.z * del.z * fpair,
                del.x * del.y * fpair,
                del.x * del.z * fpair,
                del.y * del.z * fpair,
            ];
            for (acc, v) in self.virial.iter_mut().zip(v) {
                *acc += weight * v;
            }
        }
    }

    pub fn total_energy(&self) -> f64 {
        self.evdwl + self.ecoul
    }
}

impl AddAssign for EnergyVirial {
    fn add_assign(&mut self, rhs: Self) {
        self.evdwl += rhs.evdwl;
        self.ecoul += rhs.ecoul;
        for (a, b) in self.virial.iter_mut().zip(rhs.virial) {
            *a += b;
        }
    }
}
