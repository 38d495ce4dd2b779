//! Collective communication between cooperating processes. The accelerator manager only needs a
//! handful of collectives: an all-gather of processor names, communicator splits, sum/max
//! reductions, a broadcast and a barrier.
//!
//! `SelfComm` is the single-process case. `ThreadComm` runs every rank as a thread of one process,
//! which is how we exercise multi-process node layouts without an MPI launcher. Real cooperating
//! processes use `mpi_comm::MpiComm` (feature `mpi`).

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Barrier, Mutex, MutexGuard, PoisonError,
    },
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReduceOp {
    Sum,
    Max,
}

impl ReduceOp {
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Sum => a + b,
            Self::Max => a.max(b),
        }
    }
}

/// MPI-style communicator. Handles stay on the thread that made them; MPI handles may not be
/// movable between threads.
pub trait Communicator {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Name of the node this process runs on.
    fn processor_name(&self) -> String;
    /// Blocking. Every rank contributes `data`; the result is indexed by rank.
    fn all_gather_bytes(&self, data: &[u8]) -> Vec<Vec<u8>>;
    /// Blocking. Ranks with the same `color` form a new communicator, ordered by `(key, rank)`.
    fn split(&self, color: usize, key: usize) -> Box<dyn Communicator>;
    fn barrier(&self);

    fn all_gather_names(&self, name: &str) -> Vec<String> {
        self.all_gather_bytes(name.as_bytes())
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    /// Element-wise reduction, combined in ascending rank order so every rank gets identical bits.
    fn all_reduce(&self, vals: &[f64], op: ReduceOp) -> Vec<f64> {
        let bytes: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        let all = self.all_gather_bytes(&bytes);

        let mut result = decode_f64s(&all[0]);
        for other in &all[1..] {
            for (r, v) in result.iter_mut().zip(decode_f64s(other)) {
                *r = op.apply(*r, v);
            }
        }
        result
    }

    fn all_reduce_scalar(&self, val: f64, op: ReduceOp) -> f64 {
        self.all_reduce(&[val], op)[0]
    }

    /// Replace `data` on every rank with the root's copy.
    fn broadcast(&self, root: usize, data: &mut Vec<u8>) {
        let mine: &[u8] = if self.rank() == root { data } else { &[] };
        let mut all = self.all_gather_bytes(mine);
        *data = std::mem::take(&mut all[root]);
    }

    fn duplicate(&self) -> Box<dyn Communicator> {
        self.split(0, self.rank())
    }
}

fn decode_f64s(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| {
            let mut a = [0; 8];
            a.copy_from_slice(c);
            f64::from_le_bytes(a)
        })
        .collect()
}

fn decode_u64(bytes: &[u8]) -> u64 {
    let mut a = [0; 8];
    a.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(a)
}

/// A communicator containing only this process.
#[derive(Clone, Debug)]
pub struct SelfComm {
    name: String,
}

impl SelfComm {
    pub fn new() -> Self {
        let name = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());
        Self { name }
    }

    pub fn with_name(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }
}

impl Default for SelfComm {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn processor_name(&self) -> String {
        self.name.clone()
    }

    fn all_gather_bytes(&self, data: &[u8]) -> Vec<Vec<u8>> {
        vec![data.to_vec()]
    }

    fn split(&self, _color: usize, _key: usize) -> Box<dyn Communicator> {
        Box::new(self.clone())
    }

    fn barrier(&self) {}
}

struct Group {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<u8>>>,
    /// Sub-groups created by `split`, keyed by (split generation, color), with the number of
    /// members yet to join. An entry is dropped once its last member has joined.
    children: Mutex<HashMap<(u64, usize), (Arc<Group>, usize)>>,
}

impl Group {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![Vec::new(); size]),
            children: Mutex::new(HashMap::new()),
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ranks as threads of one process. Each rank must drive its own `ThreadComm` from its own thread;
/// collectives block until every rank of the group has entered them.
pub struct ThreadComm {
    rank: usize,
    name: String,
    group: Arc<Group>,
    splits: AtomicU64,
}

impl ThreadComm {
    /// One communicator per rank. `names[r]` is the processor name rank `r` reports.
    pub fn group(names: &[&str]) -> Vec<Self> {
        let group = Group::new(names.len());

        names
            .iter()
            .enumerate()
            .map(|(rank, name)| Self {
                rank,
                name: (*name).to_owned(),
                group: group.clone(),
                splits: AtomicU64::new(0),
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        lock(&self.group.slots).len()
    }

    fn processor_name(&self) -> String {
        self.name.clone()
    }

    fn all_gather_bytes(&self, data: &[u8]) -> Vec<Vec<u8>> {
        lock(&self.group.slots)[self.rank] = data.to_vec();
        self.group.barrier.wait();

        let result = lock(&self.group.slots).clone();
        // Nobody may overwrite a slot until every rank has read them all.
        self.group.barrier.wait();

        result
    }

    fn split(&self, color: usize, key: usize) -> Box<dyn Communicator> {
        let generation = self.splits.fetch_add(1, Ordering::Relaxed);

        let mut msg = Vec::with_capacity(16);
        msg.extend_from_slice(&(color as u64).to_le_bytes());
        msg.extend_from_slice(&(key as u64).to_le_bytes());
        let all = self.all_gather_bytes(&msg);

        let mut members: Vec<(u64, usize)> = all
            .iter()
            .enumerate()
            .filter(|(_, m)| decode_u64(m) == color as u64)
            .map(|(r, m)| (decode_u64(&m[8..]), r))
            .collect();
        members.sort_unstable();

        let rank = members
            .iter()
            .position(|&(_, r)| r == self.rank)
            .unwrap_or_default();

        let group = {
            let mut children = lock(&self.group.children);
            let key = (generation, color);
            let (group, pending) = {
                let entry = children
                    .entry(key)
                    .or_insert_with(|| (Group::new(members.len()), members.len()));
                entry.1 -= 1;
                (entry.0.clone(), entry.1)
            };
            if pending == 0 {
                children.remove(&key);
            }
            group
        };

        Box::new(Self {
            rank,
            name: self.name.clone(),
            group,
            splits: AtomicU64::new(0),
        })
    }

    fn barrier(&self) {
        self.group.barrier.wait();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn reductions_and_split() {
        let comms = ThreadComm::group(&["a", "a", "b", "b", "b"]);

        let results: Vec<(f64, f64, usize, usize)> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|c| {
                    s.spawn(move || {
                        let sum = c.all_reduce_scalar(c.rank() as f64, ReduceOp::Sum);
                        let max = c.all_reduce_scalar(c.rank() as f64, ReduceOp::Max);

                        let color = if c.processor_name() == "a" { 0 } else { 1 };
                        let node = c.split(color, 0);
                        (sum, max, node.rank(), node.size())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let expected_node = [(0, 2), (1, 2), (0, 3), (1, 3), (2, 3)];
        for (i, (sum, max, node_rank, node_size)) in results.into_iter().enumerate() {
            assert_eq!(sum, 10.);
            assert_eq!(max, 4.);
            assert_eq!((node_rank, node_size), expected_node[i]);
        }
    }

    #[test]
    fn repeated_splits_release_subgroups() {
        let comms = ThreadComm::group(&["a", "a", "b"]);
        let root = comms[0].group.clone();

        thread::scope(|s| {
            for c in comms {
                s.spawn(move || {
                    for _ in 0..20 {
                        let color = if c.processor_name() == "a" { 0 } else { 1 };
                        let node = c.split(color, c.rank());
                        let dup = node.duplicate();
                        assert_eq!(dup.size(), node.size());
                        dup.barrier();
                    }
                });
            }
        });

        assert!(lock(&root.children).is_empty());
    }

    #[test]
    fn broadcast_from_root() {
        let comms = ThreadComm::group(&["n", "n", "n"]);

        thread::scope(|s| {
            for c in comms {
                s.spawn(move || {
                    let mut data = if c.rank() == 0 {
                        vec![1, 2, 3]
                    } else {
                        Vec::new()
                    };
                    c.broadcast(0, &mut data);
                    assert_eq!(data, vec![1, 2, 3]);
                });
            }
        });
    }

    #[test]
    fn self_comm_is_trivial() {
        let c = SelfComm::with_name("node0");
        assert_eq!(c.all_gather_names("node0"), vec!["node0".to_owned()]);
        assert_eq!(c.all_reduce(&[1.5, -2.], ReduceOp::Max), vec![1.5, -2.]);
        assert_eq!(c.split(3, 0).size(), 1);
    }
}
