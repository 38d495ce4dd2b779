//! Accelerator management: which accelerator each process drives, the lifetime of the
//! accelerator-side atom storage, loading the kernel program and reading the device's
//! capabilities, estimating offload overhead, and the end-of-run timing report.
//!
//! A `Device` is an explicit context; pair styles sharing an accelerator share one `Device`, and
//! its reference count tracks them.

use std::{collections::BTreeSet, time::Instant};

use bincode::{Decode, Encode};
use lin_alg::f64::Vec3;
use log::info;

use crate::{
    buffers::{AtomData, Answer, NeighborBlocks, NeighborData},
    comm::{Communicator, ReduceOp},
    error::DeviceError,
    runtime::DeviceRuntime,
    split::WorkSplit,
    timing::{Timer, TimingReport},
};

/// Repetitions averaged by `estimate_overhead`.
const OVERHEAD_REPS: usize = 10;

/// Where neighbor lists are built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub enum GpuMode {
    /// Lists come from the host; the accelerator only computes forces.
    #[default]
    Force,
    /// The accelerator builds its own lists.
    Neigh,
}

/// Storage precision for positions, and accumulation precision for forces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub enum Precision {
    Single,
    /// Single-precision positions, double-precision accumulation.
    #[default]
    Mixed,
    Double,
}

impl Precision {
    pub fn pos_bytes(self) -> usize {
        match self {
            Self::Single | Self::Mixed => 4,
            Self::Double => 8,
        }
    }

    pub fn acc_bytes(self) -> usize {
        match self {
            Self::Single => 4,
            Self::Mixed | Self::Double => 8,
        }
    }

    pub fn accumulates_double(self) -> bool {
        self.acc_bytes() == 8
    }

    fn label(self) -> &'static str {
        match self {
            Self::Single => "Single Precision",
            Self::Mixed => "Mixed Precision",
            Self::Double => "Double Precision",
        }
    }
}

/// How this process was placed. Built once by `init_device`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceAssignment {
    /// Index of this process's node among the sorted node names.
    pub node_id: usize,
    pub node_rank: usize,
    pub procs_per_node: usize,
    pub device: usize,
    pub procs_per_device: usize,
    /// Device-side timers are only trusted when one process owns the device.
    pub time_device: bool,
}

/// Capabilities read from the capability query kernel, after clamping to the device.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DeviceInfo {
    pub ptx_arch: f64,
    pub num_mem_threads: usize,
    pub warp_size: usize,
    pub suggested_threads_per_atom: usize,
    pub suggested_threads_per_charge: usize,
    pub pppm_max_spline: usize,
    pub pppm_block: usize,
    pub block_pair: usize,
    pub max_shared_types: usize,
    pub block_cell_2d: usize,
    pub block_cell_id: usize,
    pub block_nbor_build: usize,
    pub block_bio_pair: usize,
    pub max_bio_shared_types: usize,
}

/// Storage a pair style asks for in `Device::init`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferRequest {
    pub charge: bool,
    pub rotation: bool,
    pub nlocal: usize,
    pub host_nlocal: usize,
    pub nall: usize,
    pub max_special: usize,
    pub gpu_host: usize,
    pub max_nbors: usize,
    pub cell_size: f64,
    pub pre_cut: bool,
}

/// Index of node `me` among the distinct names, in sorted order.
fn node_id(names: &[String], me: &str) -> usize {
    let nodes: BTreeSet<&str> = names.iter().map(String::as_str).collect();
    nodes.iter().position(|n| *n == me).unwrap_or_default()
}

/// Buffer failures report as allocation failures, whatever the runtime called them.
fn as_alloc(e: DeviceError) -> DeviceError {
    match e {
        DeviceError::AllocationFailed(_) => e,
        other => DeviceError::AllocationFailed(other.to_string()),
    }
}

pub struct Device<R: DeviceRuntime> {
    runtime: R,
    precision: Precision,

    init_count: usize,
    device_init: bool,
    compiled: bool,

    mode: GpuMode,
    first_device: usize,
    last_device: usize,
    split: WorkSplit,
    nthreads: usize,
    threads_per_atom: usize,
    threads_per_charge: usize,

    world: Option<Box<dyn Communicator>>,
    replica: Option<Box<dyn Communicator>>,
    /// Processes sharing this process's device.
    gpu_comm: Option<Box<dyn Communicator>>,
    assignment: Option<DeviceAssignment>,
    info: DeviceInfo,

    pub atom: AtomData,
    /// Transfer counts per step, for overhead estimates.
    data_in_estimate: usize,
    data_out_estimate: usize,
}

impl<R: DeviceRuntime> Device<R> {
    pub fn new(runtime: R, precision: Precision) -> Self {
        Self {
            runtime,
            precision,
            init_count: 0,
            device_init: false,
            compiled: false,
            mode: GpuMode::Force,
            first_device: 0,
            last_device: 0,
            split: WorkSplit::default(),
            nthreads: 1,
            threads_per_atom: 0,
            threads_per_charge: 0,
            world: None,
            replica: None,
            gpu_comm: None,
            assignment: None,
            info: DeviceInfo::default(),
            atom: AtomData::default(),
            data_in_estimate: 0,
            data_out_estimate: 1,
        }
    }

    /// Places this process on an accelerator, and loads the kernel program. Collective over
    /// `world`. Calling again once placed only refreshes the thread settings.
    #[allow(clippy::too_many_arguments)]
    pub fn init_device(
        &mut self,
        world: &dyn Communicator,
        replica: &dyn Communicator,
        first_device: usize,
        last_device: usize,
        mode: GpuMode,
        particle_split: f64,
        nthreads: usize,
        threads_per_atom: usize,
    ) -> Result<(), DeviceError> {
        self.nthreads = nthreads.max(1);
        self.threads_per_atom = threads_per_atom;
        self.threads_per_charge = threads_per_atom;

        if self.device_init {
            if self.compiled {
                self.clamp_threads();
                return Ok(());
            }
            return self.compile_kernels();
        }

        let last_device = last_device.max(first_device);

        let me = world.processor_name();
        let names = world.all_gather_names(&me);
        let node_id = node_id(&names, &me);

        // Nodes may hold different process counts; each divides its own among the devices.
        let node_comm = world.split(node_id, world.rank());
        let node_rank = node_comm.rank();
        let procs_per_node = node_comm.size();

        let procs_per_device = procs_per_node.div_ceil(last_device - first_device + 1);
        let device = node_rank / procs_per_device + first_device;

        let gpu_comm = node_comm.split(device, node_rank);
        let world = world.duplicate();
        let replica = replica.duplicate();

        let available = self.runtime.num_devices();
        if device >= available {
            return Err(DeviceError::DeviceOutOfRange {
                requested: device,
                available,
            });
        }
        self.runtime.set_device(device)?;

        self.assignment = Some(DeviceAssignment {
            node_id,
            node_rank,
            procs_per_node,
            device,
            procs_per_device,
            time_device: procs_per_device == 1,
        });
        self.world = Some(world);
        self.replica = Some(replica);
        self.gpu_comm = Some(gpu_comm);
        self.first_device = first_device;
        self.last_device = last_device;
        self.mode = mode;
        self.split = WorkSplit::new(particle_split);
        self.device_init = true;

        self.compile_kernels()
    }

    fn compile_kernels(&mut self) -> Result<(), DeviceError> {
        if self.compiled {
            return Ok(());
        }

        self.runtime.load_program()?;
        let info = match self.runtime.query_info() {
            Ok(v) => v,
            Err(e) => {
                self.runtime.unload_program();
                return Err(e);
            }
        };

        let ptx_arch = info[0] as f64 / 100.;
        let arch = self.runtime.arch();
        if ptx_arch > arch {
            self.runtime.unload_program();
            return Err(DeviceError::ArchitectureMismatch {
                kernel: ptx_arch,
                device: arch,
            });
        }

        let v = |i: usize| info[i].max(0) as usize;
        let group_size = self.runtime.group_size();
        self.info = DeviceInfo {
            ptx_arch,
            num_mem_threads: v(1),
            warp_size: v(2).max(1),
            suggested_threads_per_atom: v(3),
            suggested_threads_per_charge: v(13),
            pppm_max_spline: v(4),
            pppm_block: v(5),
            block_pair: v(6).min(group_size),
            max_shared_types: v(7),
            block_cell_2d: v(8),
            block_cell_id: v(9),
            block_nbor_build: v(10),
            block_bio_pair: v(11).min(group_size),
            max_bio_shared_types: v(12),
        };
        self.clamp_threads();
        self.compiled = true;
        Ok(())
    }

    /// A request of 0 takes the suggested count; counts above the warp size, or that don't divide
    /// it, are reduced.
    fn clamp_threads(&mut self) {
        let warp = self.info.warp_size;
        let clamp = |requested: usize, suggested: usize| {
            let t = if requested < 1 { suggested } else { requested }.min(warp);
            if t == 0 || warp % t != 0 {
                1
            } else {
                t
            }
        };

        self.threads_per_atom = clamp(self.threads_per_atom, self.info.suggested_threads_per_atom);
        self.threads_per_charge =
            clamp(self.threads_per_charge, self.info.suggested_threads_per_charge);
    }

    /// Sets up atom, answer, and neighbor storage for one pair style, and takes a reference.
    pub fn init(
        &mut self,
        ans: &mut Answer,
        nbor: &mut NeighborData,
        req: &BufferRequest,
    ) -> Result<(), DeviceError> {
        self.check_ready()?;

        self.data_in_estimate = 0;
        self.data_out_estimate = 1;

        let ef_nlocal = self.split.device_count(req.nlocal);
        let gpu_nbor = self.mode == GpuMode::Neigh;
        let bonds = gpu_nbor && req.max_special > 0;

        if self.init_count == 0 {
            self.atom
                .init(
                    &mut self.runtime,
                    req.nall,
                    req.charge,
                    req.rotation,
                    gpu_nbor,
                    bonds,
                    self.precision,
                )
                .map_err(as_alloc)?;
            self.data_in_estimate += 1 + req.charge as usize + req.rotation as usize;
        } else {
            if !self.atom.charge() && req.charge {
                self.data_in_estimate += 1;
            }
            if !self.atom.quat() && req.rotation {
                self.data_in_estimate += 1;
            }
            self.atom
                .add_fields(&mut self.runtime, req.charge, req.rotation, gpu_nbor, bonds)
                .map_err(as_alloc)?;
        }

        ans.init(
            &mut self.runtime,
            ef_nlocal,
            req.charge,
            req.rotation,
            self.precision,
        )
        .map_err(as_alloc)?;

        let blocks = NeighborBlocks {
            cell_2d: self.info.block_cell_2d,
            cell_id: self.info.block_cell_id,
            build: self.info.block_nbor_build,
        };
        nbor.init(
            &mut self.runtime,
            ef_nlocal,
            req.host_nlocal,
            req.max_nbors,
            req.max_special,
            gpu_nbor,
            req.gpu_host,
            req.pre_cut,
            blocks,
        )
        .map_err(as_alloc)?;
        nbor.cell_size(req.cell_size);

        self.init_count += 1;
        Ok(())
    }

    /// Charge-only setup, for long-range solvers sharing the device.
    pub fn init_charges(
        &mut self,
        ans: &mut Answer,
        nlocal: usize,
        nall: usize,
    ) -> Result<(), DeviceError> {
        self.check_ready()?;

        if self.init_count == 0 {
            self.atom
                .init(&mut self.runtime, nall, true, false, false, false, self.precision)
                .map_err(as_alloc)?;
        } else {
            self.atom
                .add_fields(&mut self.runtime, true, false, false, false)
                .map_err(as_alloc)?;
        }

        ans.init(&mut self.runtime, nlocal, true, false, self.precision)
            .map_err(as_alloc)?;

        self.init_count += 1;
        Ok(())
    }

    fn check_ready(&self) -> Result<(), DeviceError> {
        if !self.device_init {
            return Err(DeviceError::NotInitialized);
        }
        if self.precision.accumulates_double() && !self.runtime.double_precision() {
            return Err(DeviceError::PrecisionUnsupported);
        }
        Ok(())
    }

    /// Drops one reference. The last one releases atom storage and the program.
    pub fn clear(&mut self) {
        if self.init_count == 0 {
            return;
        }
        self.init_count -= 1;

        if self.init_count == 0 {
            self.atom.clear(&mut self.runtime);
            if self.compiled {
                self.runtime.unload_program();
                self.compiled = false;
            }
        }
    }

    /// Drops every reference and releases the hardware.
    pub fn clear_device(&mut self) {
        while self.init_count > 0 {
            self.clear();
        }
        if self.compiled {
            self.runtime.unload_program();
            self.compiled = false;
        }
        if self.device_init {
            self.runtime.release();
            self.device_init = false;
            self.assignment = None;
            self.world = None;
            self.replica = None;
            self.gpu_comm = None;
        }
    }

    /// Average seconds for one step's worth of minimal transfers plus `kernel_calls` trivial
    /// kernels, max-reduced over the processes sharing the device. Returns
    /// `(overhead, driver_overhead)`; the driver part excludes the final synchronize.
    pub fn estimate_overhead(&mut self, kernel_calls: usize) -> Result<(f64, f64), DeviceError> {
        let Some(gpu_comm) = &self.gpu_comm else {
            return Err(DeviceError::NotInitialized);
        };
        let rt = &mut self.runtime;

        let n_in = self.data_in_estimate;
        let n_out = self.data_out_estimate;

        let mut bufs = Vec::with_capacity(n_in + kernel_calls + n_out);
        let mut result = Ok((0., 0.));
        for _ in 0..n_in + kernel_calls + n_out {
            match rt.alloc(4) {
                Ok(b) => bufs.push(b),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if result.is_ok() {
            let (data_in, rest) = bufs.split_at(n_in);
            let (kernels, data_out) = rest.split_at(kernel_calls);
            let host_in = [0u8; 4];
            let mut host_out = [0u8; 4];

            let mut time_round_trips = || -> Result<(f64, f64), DeviceError> {
                let mut overhead = 0.;
                let mut driver_overhead = 0.;

                for _ in 0..OVERHEAD_REPS {
                    rt.synchronize()?;
                    gpu_comm.barrier();
                    let wall = Instant::now();
                    rt.synchronize()?;
                    gpu_comm.barrier();
                    let driver = Instant::now();

                    for b in data_in {
                        rt.copy_in(b, &host_in)?;
                    }
                    for b in kernels {
                        rt.launch_zero(b, 1)?;
                    }
                    for b in data_out {
                        rt.copy_out(b, &mut host_out)?;
                    }

                    let driver_time = driver.elapsed().as_secs_f64();
                    rt.synchronize()?;
                    let time = wall.elapsed().as_secs_f64();

                    overhead += gpu_comm.all_reduce_scalar(time, ReduceOp::Max);
                    driver_overhead += gpu_comm.all_reduce_scalar(driver_time, ReduceOp::Max);
                }

                let reps = OVERHEAD_REPS as f64;
                Ok((overhead / reps, driver_overhead / reps))
            };
            result = time_round_trips();
        }

        for b in bufs {
            rt.free(b);
        }
        result
    }

    /// Logs the accelerator banner from the first process of the replica.
    pub fn init_message(&self, name: &str) {
        let (Some(replica), Some(assignment)) = (&self.replica, &self.assignment) else {
            return;
        };
        if replica.rank() != 0 {
            return;
        }

        info!(
            "Using accelerator for {name}: {} proc(s) per device, {} thread(s) per proc",
            assignment.procs_per_device, self.nthreads
        );

        let rt = &self.runtime;
        let last = (self.last_device + 1).min(rt.num_devices());
        for i in self.first_device..last {
            info!(
                "Device {i}: {}, {} cores, {:.2}/{:.2} GB, {:.2} GHZ ({})",
                rt.name(i),
                rt.cores(i),
                rt.free_gigabytes(),
                rt.gigabytes(i),
                rt.clock_rate(i),
                self.precision.label()
            );
        }
    }

    /// Sums timings and takes the peak memory over the replica. The first process of the replica
    /// gets the report; others get `None`, as does a run with no recorded overhead.
    #[allow(clippy::too_many_arguments)]
    pub fn output_times(
        &self,
        time_pair: &Timer,
        ans: &Answer,
        nbor: &NeighborData,
        avg_split: f64,
        max_bytes: usize,
        gpu_overhead: f64,
        driver_overhead: f64,
        threads_per_atom: usize,
    ) -> Option<TimingReport> {
        let replica = self.replica.as_ref()?;

        let single = [
            self.atom.transfer_time() + ans.transfer_time(),
            nbor.time_nbor.total_seconds(),
            nbor.time_kernel.total_seconds(),
            time_pair.total_seconds(),
            self.atom.cast_time() + ans.cast_time(),
            gpu_overhead,
            driver_overhead,
            ans.cpu_idle_time(),
        ];
        let times = replica.all_reduce(&single, ReduceOp::Sum);
        let my_max_bytes = (max_bytes + self.atom.max_gpu_bytes()) as f64;
        let max_bytes = replica.all_reduce_scalar(my_max_bytes, ReduceOp::Max);

        if replica.rank() != 0 || times[5] <= 0. {
            return None;
        }

        let n = replica.size() as f64;
        Some(TimingReport {
            time_device: self.time_device(),
            gpu_nbor: nbor.gpu_nbor(),
            transfer: times[0] / n,
            cast: times[4] / n,
            nbor_copy: times[1] / n,
            nbor_build: times[2] / n,
            force: times[3] / n,
            overhead: times[5] / n,
            avg_split,
            threads_per_atom,
            max_mb: max_bytes / (1024. * 1024.),
            driver: times[6] / n,
            idle: times[7] / n,
        })
    }

    /// Packs and copies this step's atoms into accelerator storage.
    pub fn copy_atoms(
        &mut self,
        posits: &[Vec3],
        types: &[usize],
        charges: &[f64],
    ) -> Result<(), DeviceError> {
        self.atom.copy_in(&mut self.runtime, posits, types, charges)
    }

    pub fn host_memory_usage(&self) -> usize {
        self.atom.host_memory_usage() + 4 * std::mem::size_of::<f64>() + std::mem::size_of::<Self>()
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// For pair styles that manage their own answer and neighbor storage.
    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn assignment(&self) -> Option<&DeviceAssignment> {
        self.assignment.as_ref()
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn is_initialized(&self) -> bool {
        self.device_init
    }

    pub fn init_count(&self) -> usize {
        self.init_count
    }

    pub fn procs_per_device(&self) -> usize {
        self.assignment.map(|a| a.procs_per_device).unwrap_or(1)
    }

    pub fn time_device(&self) -> bool {
        self.assignment.map(|a| a.time_device).unwrap_or_default()
    }

    pub fn gpu_mode(&self) -> GpuMode {
        self.mode
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn split(&self) -> WorkSplit {
        self.split
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    pub fn threads_per_atom(&self) -> usize {
        self.threads_per_atom
    }

    pub fn threads_per_charge(&self) -> usize {
        self.threads_per_charge
    }

    pub fn warp_size(&self) -> usize {
        self.info.warp_size
    }

    pub fn block_pair(&self) -> usize {
        self.info.block_pair
    }

    pub fn world(&self) -> Option<&dyn Communicator> {
        self.world.as_deref()
    }

    pub fn replica(&self) -> Option<&dyn Communicator> {
        self.replica.as_deref()
    }

    pub fn gpu_comm(&self) -> Option<&dyn Communicator> {
        self.gpu_comm.as_deref()
    }
}

impl<R: DeviceRuntime> Drop for Device<R> {
    fn drop(&mut self) {
        self.clear_device();
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, thread};

    use super::*;
    use crate::{
        comm::{SelfComm, ThreadComm},
        error::status_of,
        runtime::{HostRuntime, DEFAULT_INFO},
    };

    fn placed(rt: HostRuntime, precision: Precision) -> Device<HostRuntime> {
        let comm = SelfComm::new();
        let mut dev = Device::new(rt, precision);
        dev.init_device(&comm, &comm, 0, 0, GpuMode::Force, 1., 2, 0)
            .unwrap();
        dev
    }

    fn request(nlocal: usize) -> BufferRequest {
        BufferRequest {
            charge: true,
            nlocal,
            nall: nlocal + nlocal / 2,
            max_nbors: 64,
            cell_size: 12.,
            ..Default::default()
        }
    }

    /// Runs `init_device` on one thread per rank, returning each rank's status and assignment.
    fn place_ranks(
        names: &[&str],
        devices: usize,
        first: usize,
        last: usize,
    ) -> Vec<(i32, Option<DeviceAssignment>)> {
        let comms = ThreadComm::group(names);

        thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|c| {
                    s.spawn(move || {
                        let mut dev =
                            Device::new(HostRuntime::new().devices(devices), Precision::Mixed);
                        let result =
                            dev.init_device(&c, &c, first, last, GpuMode::Force, 1., 1, 0);
                        (status_of(&result), dev.assignment().copied())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn node_ids_sorted_by_name() {
        let names: Vec<String> = ["b", "a", "b", "c", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(node_id(&names, "a"), 0);
        assert_eq!(node_id(&names, "b"), 1);
        assert_eq!(node_id(&names, "c"), 2);
    }

    #[test]
    fn uneven_nodes_stay_in_range() {
        // Node "a" has one process and node "b" two; with a single device, both of b's share it.
        let results = place_ranks(&["a", "b", "b"], 2, 0, 0);

        for (status, assignment) in &results {
            assert_eq!(*status, 0);
            assert_eq!(assignment.unwrap().device, 0);
        }
        let a = results[0].1.unwrap();
        assert_eq!((a.node_id, a.procs_per_node, a.procs_per_device), (0, 1, 1));
        assert!(a.time_device);

        let b = results[2].1.unwrap();
        assert_eq!((b.node_id, b.node_rank, b.procs_per_node, b.procs_per_device), (1, 1, 2, 2));
        assert!(!b.time_device);
    }

    #[test]
    fn larger_later_node_spreads_over_devices() {
        let results = place_ranks(&["a", "b", "b", "b", "b"], 4, 1, 2);
        let devices: Vec<usize> = results.iter().map(|(_, a)| a.unwrap().device).collect();
        assert_eq!(devices, vec![1, 1, 1, 2, 2]);
        assert!(results.iter().all(|(s, _)| *s == 0));
    }

    #[test]
    fn assignment_bounds_and_load() {
        let names = ["n0", "n0", "n0", "n0", "n0", "n1", "n1", "n1", "n1", "n1"];
        let results = place_ranks(&names, 3, 1, 2);

        let mut per_device = BTreeMap::new();
        for (status, assignment) in &results {
            assert_eq!(*status, 0);
            let a = assignment.unwrap();
            assert!((1..=2).contains(&a.device));
            assert_eq!(a.procs_per_device, 3);
            assert!(!a.time_device);
            *per_device.entry((a.node_id, a.device)).or_insert(0) += 1;
        }
        assert!(per_device.values().all(|&n| n <= 3));
        assert_eq!(per_device.len(), 4);
    }

    #[test]
    fn exclusive_timing_with_one_proc_per_device() {
        let results = place_ranks(&["n", "n"], 2, 0, 1);
        let devices: Vec<_> = results.iter().map(|(_, a)| a.unwrap().device).collect();
        assert_eq!(devices, vec![0, 1]);
        assert!(results.iter().all(|(_, a)| a.unwrap().time_device));
    }

    #[test]
    fn too_few_devices() {
        // Two processes per device; the second pair lands on device 1, which doesn't exist.
        let results = place_ranks(&["n", "n", "n", "n"], 1, 0, 1);
        let statuses: Vec<i32> = results.iter().map(|(s, _)| *s).collect();
        assert_eq!(statuses, vec![0, 0, -2, -2]);
        assert!(results[2].1.is_none());

        let comm = SelfComm::new();
        let mut dev = Device::new(HostRuntime::new().devices(0), Precision::Mixed);
        let result = dev.init_device(&comm, &comm, 0, 0, GpuMode::Force, 1., 1, 0);
        assert_eq!(status_of(&result), -2);
        assert!(!dev.is_initialized());
    }

    #[test]
    fn init_device_is_idempotent() {
        let comm = SelfComm::new();
        let mut dev = placed(HostRuntime::new(), Precision::Mixed);
        assert_eq!(dev.runtime().acquisitions(), 1);

        dev.init_device(&comm, &comm, 0, 0, GpuMode::Neigh, 0.5, 4, 8)
            .unwrap();
        assert_eq!(dev.runtime().acquisitions(), 1);
        assert_eq!(dev.nthreads(), 4);
        assert_eq!(dev.threads_per_atom(), 8);
        // Placement settings are from the first call.
        assert_eq!(dev.gpu_mode(), GpuMode::Force);
        assert!(!dev.split().is_split());
    }

    #[test]
    fn capability_clamps() {
        let mut info = DEFAULT_INFO;
        info[6] = 4096;
        let comm = SelfComm::new();

        let mut dev = Device::new(HostRuntime::new().info(info), Precision::Single);
        dev.init_device(&comm, &comm, 0, 0, GpuMode::Force, 1., 1, 0)
            .unwrap();
        assert_eq!(dev.threads_per_atom(), 4);
        assert_eq!(dev.threads_per_charge(), 8);
        assert_eq!(dev.block_pair(), 1024);
        assert_eq!(dev.warp_size(), 32);

        dev.init_device(&comm, &comm, 0, 0, GpuMode::Force, 1., 1, 64)
            .unwrap();
        assert_eq!(dev.threads_per_atom(), 32);
        dev.init_device(&comm, &comm, 0, 0, GpuMode::Force, 1., 1, 3)
            .unwrap();
        assert_eq!(dev.threads_per_atom(), 1);
    }

    #[test]
    fn program_failures() {
        let comm = SelfComm::new();

        let mut dev = Device::new(HostRuntime::new().program_arch(9.0), Precision::Mixed);
        let result = dev.init_device(&comm, &comm, 0, 0, GpuMode::Force, 1., 1, 0);
        assert_eq!(status_of(&result), -4);
        assert!(!dev.runtime().program_loaded());

        let mut dev = Device::new(HostRuntime::new().broken_program(), Precision::Mixed);
        let result = dev.init_device(&comm, &comm, 0, 0, GpuMode::Force, 1., 1, 0);
        assert_eq!(status_of(&result), -4);
    }

    #[test]
    fn buffer_init_statuses() {
        let mut ans = Answer::default();
        let mut nbor = NeighborData::default();

        let mut dev = Device::new(HostRuntime::new(), Precision::Mixed);
        let result = dev.init(&mut ans, &mut nbor, &request(100));
        assert_eq!(status_of(&result), -1);

        let mut dev = placed(HostRuntime::new().double(false), Precision::Double);
        let result = dev.init(&mut ans, &mut nbor, &request(100));
        assert_eq!(status_of(&result), -5);

        let mut dev = placed(HostRuntime::new().double(false), Precision::Single);
        assert!(dev.init(&mut ans, &mut nbor, &request(100)).is_ok());
        ans.clear(dev.runtime_mut());
        nbor.clear(dev.runtime_mut());

        let mut dev = placed(HostRuntime::new().memory_limit(256), Precision::Mixed);
        let result = dev.init(&mut ans, &mut nbor, &request(100));
        assert_eq!(status_of(&result), -3);
    }

    #[test]
    fn reference_counted_clear() {
        let mut dev = placed(HostRuntime::new(), Precision::Mixed);
        let (mut ans_a, mut nbor_a) = (Answer::default(), NeighborData::default());
        let mut ans_b = Answer::default();

        dev.init(&mut ans_a, &mut nbor_a, &request(50)).unwrap();
        dev.init_charges(&mut ans_b, 50, 75).unwrap();
        assert_eq!(dev.init_count(), 2);

        dev.clear();
        assert!(dev.atom.allocated());
        assert!(dev.runtime().program_loaded());

        dev.clear();
        dev.clear();
        assert_eq!(dev.init_count(), 0);
        assert!(!dev.atom.allocated());
        assert!(!dev.runtime().program_loaded());

        ans_a.clear(dev.runtime_mut());
        nbor_a.clear(dev.runtime_mut());
        ans_b.clear(dev.runtime_mut());
        assert_eq!(dev.runtime().bytes_in_use(), 0);

        dev.clear_device();
        assert!(!dev.is_initialized());
        assert_eq!(dev.runtime().current(), None);
    }

    #[test]
    fn answers_sized_for_accelerator_share() {
        let comm = SelfComm::new();
        let mut dev = Device::new(HostRuntime::new(), Precision::Mixed);
        dev.init_device(&comm, &comm, 0, 0, GpuMode::Force, 0.25, 1, 0)
            .unwrap();

        let (mut ans, mut nbor) = (Answer::default(), NeighborData::default());
        dev.init(&mut ans, &mut nbor, &request(100)).unwrap();
        assert_eq!(ans.inum(), 75);
    }

    #[test]
    fn overhead_and_report() {
        let mut dev = placed(HostRuntime::new(), Precision::Mixed);
        assert!(matches!(
            Device::new(HostRuntime::new(), Precision::Mixed).estimate_overhead(1),
            Err(DeviceError::NotInitialized)
        ));

        let (mut ans, mut nbor) = (Answer::default(), NeighborData::default());
        dev.init(&mut ans, &mut nbor, &request(10)).unwrap();

        let (overhead, driver) = dev.estimate_overhead(3).unwrap();
        assert!(overhead >= driver && driver >= 0.);
        assert_eq!(dev.runtime().bytes_in_use(), dev.atom.gpu_bytes() + ans.gpu_bytes() + nbor.gpu_bytes());

        let time_pair = Timer::default();
        assert!(dev
            .output_times(&time_pair, &ans, &nbor, 1., 0, 0., 0., 4)
            .is_none());

        let report = dev
            .output_times(&time_pair, &ans, &nbor, 0.5, 1024 * 1024, 0.25, 0.125, 4)
            .unwrap();
        assert_eq!(report.overhead, 0.25);
        assert!(report.time_device);
        assert!(report.max_mb > 1.);

        dev.init_message("lj/cut/coul/long");
    }
}
