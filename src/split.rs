//! Host/accelerator division of the owned atoms for one step.

use crate::neighbors::{NeighList, NeighView};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorkSplit {
    /// Fraction of owned atoms the host threads take. Values outside (0, 1) select the classic
    /// mode, where the accelerator takes all of them.
    pub particle_split: f64,
}

impl Default for WorkSplit {
    fn default() -> Self {
        Self { particle_split: 1. }
    }
}

impl WorkSplit {
    pub fn new(particle_split: f64) -> Self {
        Self { particle_split }
    }

    pub fn is_split(&self) -> bool {
        self.particle_split > 0. && self.particle_split < 1.
    }

    /// Atoms handled by the host threads: `floor(split * nlocal)` in split mode.
    pub fn host_count(&self, nlocal: usize) -> usize {
        if self.is_split() {
            ((self.particle_split * nlocal as f64).floor() as usize).min(nlocal)
        } else {
            0
        }
    }

    /// Atoms left to the accelerator.
    pub fn device_count(&self, nlocal: usize) -> usize {
        nlocal - self.host_count(nlocal)
    }

    /// `(host, accelerator)` views of the owned-atom list. The accelerator takes the leading
    /// entries, the host the rest.
    pub fn partition<'a>(&self, list: &'a NeighList) -> (NeighView<'a>, NeighView<'a>) {
        let n_dev = self.device_count(list.inum());
        let (dev, host) = list.ilist.split_at(n_dev);
        (
            NeighView {
                ilist: host,
                firstneigh: &list.firstneigh,
            },
            NeighView {
                ilist: dev,
                firstneigh: &list.firstneigh,
            },
        )
    }
}
