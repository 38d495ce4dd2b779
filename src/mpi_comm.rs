//! `Communicator` over MPI, for cooperating processes started by an MPI launcher.
//!
//! Hold the `mpi::environment::Universe` for as long as any `MpiComm` lives; dropping it
//! finalizes MPI.

use mpi::{
    collective::SystemOperation,
    datatype::PartitionMut,
    environment,
    topology::{Color, Rank, SimpleCommunicator},
    traits::{Communicator as _, CommunicatorCollectives as _, Root as _},
    Count,
};

use crate::comm::{Communicator, ReduceOp};

pub struct MpiComm {
    comm: SimpleCommunicator,
    name: String,
}

impl MpiComm {
    pub fn new(comm: SimpleCommunicator) -> Self {
        let name = environment::processor_name().unwrap_or_else(|e| {
            log::warn!("Unreadable processor name: {e}");
            "localhost".to_owned()
        });
        Self { comm, name }
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn processor_name(&self) -> String {
        self.name.clone()
    }

    fn all_gather_bytes(&self, data: &[u8]) -> Vec<Vec<u8>> {
        let count = data.len() as Count;
        let mut counts: Vec<Count> = vec![0; self.size()];
        self.comm.all_gather_into(&count, &mut counts[..]);

        let displs: Vec<Count> = counts
            .iter()
            .scan(0, |offset, &c| {
                let d = *offset;
                *offset += c;
                Some(d)
            })
            .collect();
        let total: Count = counts.iter().sum();

        let mut buf = vec![0u8; total as usize];
        {
            let mut partition = PartitionMut::new(&mut buf[..], &counts[..], &displs[..]);
            self.comm.all_gather_varcount_into(data, &mut partition);
        }

        counts
            .iter()
            .zip(&displs)
            .map(|(&c, &d)| buf[d as usize..(d + c) as usize].to_vec())
            .collect()
    }

    fn split(&self, color: usize, key: usize) -> Box<dyn Communicator> {
        let comm = self
            .comm
            .split_by_color_with_key(Color::with_value(color as Rank), key as Rank)
            .unwrap_or_else(|| {
                // Only an undefined color yields no communicator.
                log::warn!("MPI split with color {color} gave no communicator");
                SimpleCommunicator::self_comm()
            });

        Box::new(Self {
            comm,
            name: self.name.clone(),
        })
    }

    fn barrier(&self) {
        self.comm.barrier();
    }

    fn all_reduce(&self, vals: &[f64], op: ReduceOp) -> Vec<f64> {
        let mut result = vec![0.; vals.len()];
        match op {
            ReduceOp::Sum => self
                .comm
                .all_reduce_into(vals, &mut result[..], SystemOperation::sum()),
            ReduceOp::Max => self
                .comm
                .all_reduce_into(vals, &mut result[..], SystemOperation::max()),
        }
        result
    }

    fn broadcast(&self, root: usize, data: &mut Vec<u8>) {
        let root = self.comm.process_at_rank(root as Rank);

        let mut len = data.len() as u64;
        root.broadcast_into(&mut len);
        data.resize(len as usize, 0);
        root.broadcast_into(&mut data[..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// MPI initializes once per process, so every check shares this test. Run under `mpirun`
    /// for more than one rank; a plain `cargo test --features mpi` is a one-rank singleton.
    #[test]
    fn collectives_over_world() {
        let universe = mpi::initialize().unwrap();
        let world = MpiComm::new(universe.world());
        let (rank, size) = (world.rank(), world.size());

        let names = world.all_gather_names(&format!("rank{rank}"));
        assert_eq!(names.len(), size);
        assert_eq!(names[rank], format!("rank{rank}"));

        let sum = world.all_reduce_scalar(rank as f64, ReduceOp::Sum);
        assert_eq!(sum, (size * (size - 1) / 2) as f64);
        let max = world.all_reduce_scalar(rank as f64, ReduceOp::Max);
        assert_eq!(max, (size - 1) as f64);

        let mut data = if rank == 0 { vec![4, 5, 6] } else { Vec::new() };
        world.broadcast(0, &mut data);
        assert_eq!(data, vec![4, 5, 6]);

        let halves = world.split(rank % 2, rank);
        assert_eq!(halves.size(), size / 2 + (size % 2) * (1 - rank % 2));
        let dup = world.duplicate();
        assert_eq!(dup.rank(), rank);
        dup.barrier();
    }
}
