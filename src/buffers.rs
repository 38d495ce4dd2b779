//! Accelerator-side storage for atoms, answers (forces and energies), and neighbor lists. Each
//! exposes `init`, `add_fields`/resizing, `clear`, and byte usage; `Device` owns the atom data,
//! and the pair style owns its answers and neighbor data.

use lin_alg::f64::Vec3;

use crate::{
    device::Precision,
    error::DeviceError,
    neighbors::NeighView,
    runtime::{DeviceBuffer, DeviceRuntime},
    timing::Timer,
};

fn push_real(buf: &mut Vec<u8>, v: f64, single: bool) {
    if single {
        buf.extend_from_slice(&(v as f32).to_ne_bytes());
    } else {
        buf.extend_from_slice(&v.to_ne_bytes());
    }
}

fn read_real(bytes: &[u8], single: bool) -> f64 {
    if single {
        let mut b = [0; 4];
        b.copy_from_slice(&bytes[..4]);
        f32::from_ne_bytes(b) as f64
    } else {
        let mut b = [0; 8];
        b.copy_from_slice(&bytes[..8]);
        f64::from_ne_bytes(b)
    }
}

fn free_slot(rt: &mut dyn DeviceRuntime, slot: &mut Option<DeviceBuffer>) {
    if let Some(buf) = slot.take() {
        rt.free(buf);
    }
}

fn alloc_slot(
    rt: &mut dyn DeviceRuntime,
    slot: &mut Option<DeviceBuffer>,
    bytes: usize,
) -> Result<(), DeviceError> {
    free_slot(rt, slot);
    *slot = Some(rt.alloc(bytes)?);
    Ok(())
}

fn slot_bytes(slots: &[&Option<DeviceBuffer>]) -> usize {
    slots.iter().filter_map(|s| s.as_ref()).map(DeviceBuffer::bytes).sum()
}

#[derive(Debug, Default)]
pub struct AtomData {
    precision: Precision,
    nall: usize,
    charge: bool,
    quat: bool,
    gpu_nbor: bool,
    bonds: bool,

    /// x, y, z, type per atom.
    x: Option<DeviceBuffer>,
    q: Option<DeviceBuffer>,
    quat_buf: Option<DeviceBuffer>,
    /// Cell and particle ids, for neighbor builds on the accelerator.
    cell: Option<DeviceBuffer>,
    /// Atom tags, for special-bond lookups during accelerator neighbor builds.
    tag: Option<DeviceBuffer>,

    staging: Vec<u8>,
    time_transfer: Timer,
    time_cast: Timer,
    max_gpu_bytes: usize,
}

impl AtomData {
    pub fn charge(&self) -> bool {
        self.charge
    }

    pub fn quat(&self) -> bool {
        self.quat
    }

    pub fn allocated(&self) -> bool {
        self.x.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.nall
    }

    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &mut self,
        rt: &mut dyn DeviceRuntime,
        nall: usize,
        charge: bool,
        rot: bool,
        gpu_nbor: bool,
        bonds: bool,
        precision: Precision,
    ) -> Result<(), DeviceError> {
        self.clear(rt);
        self.precision = precision;
        self.nall = nall.max(1);
        self.charge = charge;
        self.quat = rot;
        self.gpu_nbor = gpu_nbor;
        self.bonds = bonds;
        self.alloc_all(rt)
    }

    /// Adds storage for newly requested fields. Fields already present are kept.
    pub fn add_fields(
        &mut self,
        rt: &mut dyn DeviceRuntime,
        charge: bool,
        rot: bool,
        gpu_nbor: bool,
        bonds: bool,
    ) -> Result<(), DeviceError> {
        let real = self.precision.pos_bytes();
        if charge && !self.charge {
            self.charge = true;
            alloc_slot(rt, &mut self.q, self.nall * real)?;
        }
        if rot && !self.quat {
            self.quat = true;
            alloc_slot(rt, &mut self.quat_buf, self.nall * 4 * real)?;
        }
        if gpu_nbor && !self.gpu_nbor {
            self.gpu_nbor = true;
            alloc_slot(rt, &mut self.cell, self.nall * 8)?;
        }
        if bonds && !self.bonds {
            self.bonds = true;
            alloc_slot(rt, &mut self.tag, self.nall * 4)?;
        }
        self.track_max();
        Ok(())
    }

    fn alloc_all(&mut self, rt: &mut dyn DeviceRuntime) -> Result<(), DeviceError> {
        let real = self.precision.pos_bytes();
        let n = self.nall;

        alloc_slot(rt, &mut self.x, n * 4 * real)?;
        if self.charge {
            alloc_slot(rt, &mut self.q, n * real)?;
        }
        if self.quat {
            alloc_slot(rt, &mut self.quat_buf, n * 4 * real)?;
        }
        if self.gpu_nbor {
            alloc_slot(rt, &mut self.cell, n * 8)?;
        }
        if self.bonds {
            alloc_slot(rt, &mut self.tag, n * 4)?;
        }
        self.track_max();
        Ok(())
    }

    fn track_max(&mut self) {
        self.max_gpu_bytes = self.max_gpu_bytes.max(self.gpu_bytes());
    }

    pub fn clear(&mut self, rt: &mut dyn DeviceRuntime) {
        free_slot(rt, &mut self.x);
        free_slot(rt, &mut self.q);
        free_slot(rt, &mut self.quat_buf);
        free_slot(rt, &mut self.cell);
        free_slot(rt, &mut self.tag);
        self.staging = Vec::new();
    }

    /// Packs positions, types and (if enabled) charges in the device precision, and copies them
    /// in. Storage grows by 10% past `nall` when the atom count exceeds it.
    pub fn copy_in(
        &mut self,
        rt: &mut dyn DeviceRuntime,
        posits: &[Vec3],
        types: &[usize],
        charges: &[f64],
    ) -> Result<(), DeviceError> {
        if !self.allocated() {
            return Err(DeviceError::NotInitialized);
        }
        if posits.len() > self.nall {
            self.nall = posits.len() + posits.len() / 10;
            self.alloc_all(rt)?;
        }
        let single = self.precision.pos_bytes() == 4;

        self.time_cast.start();
        self.staging.clear();
        for (p, &t) in posits.iter().zip(types) {
            push_real(&mut self.staging, p.x, single);
            push_real(&mut self.staging, p.y, single);
            push_real(&mut self.staging, p.z, single);
            push_real(&mut self.staging, t as f64, single);
        }
        let x_len = self.staging.len();
        if self.charge {
            for &q in charges {
                push_real(&mut self.staging, q, single);
            }
        }
        self.time_cast.stop();
        self.time_cast.add_to_total();

        self.time_transfer.start();
        if let Some(x) = &self.x {
            rt.copy_in(x, &self.staging[..x_len])?;
        }
        if let Some(q) = &self.q {
            rt.copy_in(q, &self.staging[x_len..])?;
        }
        self.time_transfer.stop();
        self.time_transfer.add_to_total();
        Ok(())
    }

    pub fn gpu_bytes(&self) -> usize {
        slot_bytes(&[&self.x, &self.q, &self.quat_buf, &self.cell, &self.tag])
    }

    pub fn max_gpu_bytes(&self) -> usize {
        self.max_gpu_bytes
    }

    pub fn host_memory_usage(&self) -> usize {
        self.staging.capacity() + std::mem::size_of::<Self>()
    }

    pub fn transfer_time(&self) -> f64 {
        self.time_transfer.total_seconds()
    }

    pub fn cast_time(&self) -> f64 {
        self.time_cast.total_seconds()
    }
}

/// Per-atom forces and, optionally, energies and virials computed on the accelerator.
#[derive(Debug, Default)]
pub struct Answer {
    precision: Precision,
    inum: usize,
    charge: bool,
    rot: bool,
    force: Option<DeviceBuffer>,
    torque: Option<DeviceBuffer>,
    /// evdwl, ecoul (with charge), then six virial terms.
    engv: Option<DeviceBuffer>,

    staging: Vec<u8>,
    time_answer: Timer,
    time_cast: Timer,
    time_idle: Timer,
    max_gpu_bytes: usize,
}

impl Answer {
    pub fn init(
        &mut self,
        rt: &mut dyn DeviceRuntime,
        inum: usize,
        charge: bool,
        rot: bool,
        precision: Precision,
    ) -> Result<(), DeviceError> {
        self.clear(rt);
        self.precision = precision;
        self.inum = inum.max(1);
        self.charge = charge;
        self.rot = rot;

        let acc = precision.acc_bytes();
        alloc_slot(rt, &mut self.force, self.inum * 3 * acc)?;
        if rot {
            alloc_slot(rt, &mut self.torque, self.inum * 3 * acc)?;
        }
        let ev_fields = if charge { 8 } else { 7 };
        alloc_slot(rt, &mut self.engv, self.inum * ev_fields * acc)?;

        self.max_gpu_bytes = self.max_gpu_bytes.max(self.gpu_bytes());
        Ok(())
    }

    pub fn clear(&mut self, rt: &mut dyn DeviceRuntime) {
        free_slot(rt, &mut self.force);
        free_slot(rt, &mut self.torque);
        free_slot(rt, &mut self.engv);
        self.staging = Vec::new();
    }

    pub fn inum(&self) -> usize {
        self.inum
    }

    /// Writes per-atom forces into accelerator memory, the way a force kernel leaves them.
    pub fn store_forces(
        &mut self,
        rt: &mut dyn DeviceRuntime,
        forces: &[Vec3],
    ) -> Result<(), DeviceError> {
        let Some(buf) = &self.force else {
            return Err(DeviceError::NotInitialized);
        };
        if forces.len() > self.inum {
            return Err(DeviceError::AllocationFailed(format!(
                "{} answers for {} slots",
                forces.len(),
                self.inum
            )));
        }
        let single = self.precision.acc_bytes() == 4;
        self.staging.clear();
        for f in forces {
            push_real(&mut self.staging, f.x, single);
            push_real(&mut self.staging, f.y, single);
            push_real(&mut self.staging, f.z, single);
        }
        rt.copy_in(buf, &self.staging)
    }

    /// Waits for the accelerator, copies answers back, and adds them into `f` at the atoms in
    /// `ilist`.
    pub fn get_answers(
        &mut self,
        rt: &mut dyn DeviceRuntime,
        ilist: &[usize],
        f: &mut [Vec3],
    ) -> Result<(), DeviceError> {
        let Some(buf) = &self.force else {
            return Err(DeviceError::NotInitialized);
        };
        if ilist.len() > self.inum {
            return Err(DeviceError::AllocationFailed(format!(
                "{} answers requested from {} slots",
                ilist.len(),
                self.inum
            )));
        }
        if let Some(&i) = ilist.iter().find(|&&i| i >= f.len()) {
            return Err(DeviceError::AllocationFailed(format!(
                "answer for atom {i} with {} force slots",
                f.len()
            )));
        }
        let acc = self.precision.acc_bytes();
        let single = acc == 4;

        self.time_idle.start();
        rt.synchronize()?;
        self.time_idle.stop();
        self.time_idle.add_to_total();

        self.time_answer.start();
        self.staging.resize(ilist.len() * 3 * acc, 0);
        rt.copy_out(buf, &mut self.staging)?;
        self.time_answer.stop();
        self.time_answer.add_to_total();

        self.time_cast.start();
        for (k, &i) in ilist.iter().enumerate() {
            let at = |c: usize| read_real(&self.staging[(3 * k + c) * acc..], single);
            f[i] += Vec3::new(at(0), at(1), at(2));
        }
        self.time_cast.stop();
        self.time_cast.add_to_total();
        Ok(())
    }

    pub fn gpu_bytes(&self) -> usize {
        slot_bytes(&[&self.force, &self.torque, &self.engv])
    }

    pub fn max_gpu_bytes(&self) -> usize {
        self.max_gpu_bytes
    }

    pub fn transfer_time(&self) -> f64 {
        self.time_answer.total_seconds()
    }

    pub fn cast_time(&self) -> f64 {
        self.time_cast.total_seconds()
    }

    pub fn cpu_idle_time(&self) -> f64 {
        self.time_idle.total_seconds()
    }
}

/// Block sizes for accelerator neighbor builds, from the capability query.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeighborBlocks {
    pub cell_2d: usize,
    pub cell_id: usize,
    pub build: usize,
}

#[derive(Debug, Default)]
pub struct NeighborData {
    gpu_nbor: bool,
    gpu_host: usize,
    inum: usize,
    max_nbors: usize,
    max_special: usize,
    pre_cut: bool,
    cell_size: f64,
    blocks: NeighborBlocks,

    dev_nbor: Option<DeviceBuffer>,
    /// Neighbors of the host-side atoms, when those are also built on the accelerator.
    host_nbor: Option<DeviceBuffer>,
    special: Option<DeviceBuffer>,

    staging: Vec<u8>,
    pub time_nbor: Timer,
    pub time_kernel: Timer,
    max_gpu_bytes: usize,
}

impl NeighborData {
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &mut self,
        rt: &mut dyn DeviceRuntime,
        inum: usize,
        host_inum: usize,
        max_nbors: usize,
        max_special: usize,
        gpu_nbor: bool,
        gpu_host: usize,
        pre_cut: bool,
        blocks: NeighborBlocks,
    ) -> Result<(), DeviceError> {
        self.clear(rt);
        self.inum = inum.max(1);
        self.max_nbors = max_nbors.max(1);
        self.max_special = max_special;
        self.gpu_nbor = gpu_nbor;
        self.gpu_host = gpu_host;
        self.pre_cut = pre_cut;
        self.blocks = blocks;
        self.alloc_all(rt, host_inum)
    }

    fn alloc_all(&mut self, rt: &mut dyn DeviceRuntime, host_inum: usize) -> Result<(), DeviceError> {
        // Per atom: neighbor count, then up to `max_nbors` indices.
        alloc_slot(rt, &mut self.dev_nbor, self.inum * (self.max_nbors + 1) * 4)?;
        if self.gpu_nbor && self.gpu_host > 0 && host_inum > 0 {
            alloc_slot(rt, &mut self.host_nbor, host_inum * (self.max_nbors + 1) * 4)?;
        }
        if self.gpu_nbor && self.max_special > 0 {
            alloc_slot(rt, &mut self.special, self.inum * self.max_special * 4)?;
        }
        self.max_gpu_bytes = self.max_gpu_bytes.max(self.gpu_bytes());
        Ok(())
    }

    pub fn cell_size(&mut self, size: f64) {
        self.cell_size = size;
    }

    pub fn gpu_nbor(&self) -> bool {
        self.gpu_nbor
    }

    pub fn clear(&mut self, rt: &mut dyn DeviceRuntime) {
        free_slot(rt, &mut self.dev_nbor);
        free_slot(rt, &mut self.host_nbor);
        free_slot(rt, &mut self.special);
        self.staging = Vec::new();
    }

    /// Copies a host-built list to the accelerator, growing storage when it no longer fits.
    pub fn copy_list(
        &mut self,
        rt: &mut dyn DeviceRuntime,
        list: NeighView<'_>,
    ) -> Result<(), DeviceError> {
        if self.dev_nbor.is_none() {
            return Err(DeviceError::NotInitialized);
        }
        let inum = list.inum();
        let max_nbors = list
            .ilist
            .iter()
            .map(|&i| list.neighbors(i).len())
            .max()
            .unwrap_or(0);
        if inum > self.inum || max_nbors > self.max_nbors {
            self.inum = self.inum.max(inum);
            self.max_nbors = self.max_nbors.max(max_nbors);
            self.alloc_all(rt, 0)?;
        }

        self.time_nbor.start();
        self.staging.clear();
        for &i in list.ilist {
            let neighbors = list.neighbors(i);
            self.staging.extend_from_slice(&(neighbors.len() as u32).to_ne_bytes());
            for &j in neighbors {
                self.staging.extend_from_slice(&(j as u32).to_ne_bytes());
            }
        }
        if let Some(buf) = &self.dev_nbor {
            rt.copy_in(buf, &self.staging)?;
        }
        self.time_nbor.stop();
        self.time_nbor.add_to_total();

        self.time_kernel.start();
        rt.synchronize()?;
        self.time_kernel.stop();
        self.time_kernel.add_to_total();
        Ok(())
    }

    pub fn gpu_bytes(&self) -> usize {
        slot_bytes(&[&self.dev_nbor, &self.host_nbor, &self.special])
    }

    pub fn max_gpu_bytes(&self) -> usize {
        self.max_gpu_bytes
    }

    pub fn host_memory_usage(&self) -> usize {
        self.staging.capacity() + std::mem::size_of::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{neighbors::NeighList, runtime::HostRuntime};

    fn runtime() -> HostRuntime {
        let mut rt = HostRuntime::new();
        rt.set_device(0).unwrap();
        rt
    }

    #[test]
    fn atom_fields_added_once() {
        let mut rt = runtime();
        let mut atom = AtomData::default();
        atom.init(&mut rt, 10, false, false, false, false, Precision::Single)
            .unwrap();
        assert_eq!(atom.gpu_bytes(), 10 * 16);
        assert!(!atom.charge());

        atom.add_fields(&mut rt, true, false, false, false).unwrap();
        atom.add_fields(&mut rt, true, false, false, false).unwrap();
        assert!(atom.charge());
        assert_eq!(atom.gpu_bytes(), 10 * 20);
        assert_eq!(rt.bytes_in_use(), 10 * 20);

        atom.clear(&mut rt);
        assert_eq!(rt.bytes_in_use(), 0);
        assert_eq!(atom.max_gpu_bytes(), 200);
    }

    #[test]
    fn allocation_failure_surfaces() {
        let mut rt = HostRuntime::new().memory_limit(100);
        rt.set_device(0).unwrap();
        let mut atom = AtomData::default();
        let result = atom.init(&mut rt, 10, true, false, false, false, Precision::Double);
        assert!(matches!(result, Err(DeviceError::AllocationFailed(_))));
    }

    #[test]
    fn answers_add_into_listed_atoms() {
        let mut rt = runtime();
        let mut ans = Answer::default();
        ans.init(&mut rt, 2, true, false, Precision::Mixed).unwrap();
        ans.store_forces(&mut rt, &[Vec3::new(1., 2., 3.), Vec3::new(-1., 0., 0.5)])
            .unwrap();

        let mut f = vec![Vec3::new(0., 0., 1.); 4];
        ans.get_answers(&mut rt, &[3, 1], &mut f).unwrap();

        assert_eq!((f[3].x, f[3].y, f[3].z), (1., 2., 4.));
        assert_eq!((f[1].x, f[1].y, f[1].z), (-1., 0., 1.5));
        assert_eq!((f[0].x, f[0].y, f[0].z), (0., 0., 1.));
    }

    #[test]
    fn answers_reject_oversized_lists() {
        let mut rt = runtime();
        let mut ans = Answer::default();
        ans.init(&mut rt, 2, true, false, Precision::Mixed).unwrap();
        ans.store_forces(&mut rt, &[Vec3::new(1., 2., 3.), Vec3::new(-1., 0., 0.5)])
            .unwrap();

        let mut f = vec![Vec3::new_zero(); 4];
        let result = ans.get_answers(&mut rt, &[0, 1, 2], &mut f);
        assert!(matches!(result, Err(DeviceError::AllocationFailed(_))));

        let result = ans.get_answers(&mut rt, &[0, 7], &mut f);
        assert!(matches!(result, Err(DeviceError::AllocationFailed(_))));

        // Nothing was added on failure.
        assert!(f.iter().all(|v| v.x == 0. && v.y == 0. && v.z == 0.));
    }

    #[test]
    fn neighbor_storage_grows() {
        let mut rt = runtime();
        let mut nbor = NeighborData::default();
        nbor.init(&mut rt, 1, 0, 1, 0, false, 0, true, NeighborBlocks::default())
            .unwrap();
        let before = nbor.gpu_bytes();

        let list = NeighList {
            ilist: vec![0, 1],
            firstneigh: vec![vec![1, 2, 3], vec![2]],
        };
        nbor.copy_list(&mut rt, list.view()).unwrap();

        assert!(nbor.gpu_bytes() > before);
        assert!(!nbor.gpu_nbor());
    }
}
