//! The accelerator runtime seam. `Device` drives hardware only through `DeviceRuntime`;
//! `HostRuntime` emulates one or more accelerators in host memory, and `gpu::CudaRuntime`
//! (feature `cuda`) talks to real hardware.

use crate::error::DeviceError;

/// Number of ints written by the capability query kernel.
pub const NUM_INFO: usize = 14;

/// Capability vector reported by the default program build: arch 8.6, 32 memory threads, warp 32,
/// 4 threads per atom, then PPPM, pair, cell, neighbor and bio block sizes, and 8 threads per
/// charge.
pub const DEFAULT_INFO: [i32; NUM_INFO] = [860, 32, 32, 4, 8, 64, 128, 11, 8, 128, 128, 128, 128, 8];

/// Opaque handle to an accelerator-side allocation.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub(crate) id: usize,
    pub(crate) bytes: usize,
}

impl DeviceBuffer {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

pub trait DeviceRuntime: Send {
    fn num_devices(&self) -> usize;
    /// Acquires device `id` for this process.
    fn set_device(&mut self, id: usize) -> Result<(), DeviceError>;
    /// Releases the acquired device, and any allocations still live on it.
    fn release(&mut self);

    fn name(&self, id: usize) -> String;
    fn cores(&self, id: usize) -> usize;
    fn gigabytes(&self, id: usize) -> f64;
    /// Free memory on the acquired device.
    fn free_gigabytes(&self) -> f64;
    /// GHz.
    fn clock_rate(&self, id: usize) -> f64;
    /// Compute capability of the acquired device, e.g. 8.6.
    fn arch(&self) -> f64;
    fn double_precision(&self) -> bool;
    /// Maximum work-group (block) size.
    fn group_size(&self) -> usize;

    /// Loads the kernel program (`kernel_zero`, `kernel_info`).
    fn load_program(&mut self) -> Result<(), DeviceError>;
    fn unload_program(&mut self);
    /// Runs the capability query kernel on one thread and copies its output back.
    fn query_info(&mut self) -> Result<[i32; NUM_INFO], DeviceError>;

    fn alloc(&mut self, bytes: usize) -> Result<DeviceBuffer, DeviceError>;
    fn free(&mut self, buf: DeviceBuffer);
    fn copy_in(&mut self, buf: &DeviceBuffer, data: &[u8]) -> Result<(), DeviceError>;
    fn copy_out(&mut self, buf: &DeviceBuffer, out: &mut [u8]) -> Result<(), DeviceError>;
    /// Dispatches the trivial zeroing kernel over the first `n` ints of `buf`.
    fn launch_zero(&mut self, buf: &DeviceBuffer, n: usize) -> Result<(), DeviceError>;
    fn synchronize(&mut self) -> Result<(), DeviceError>;
}

/// Accelerators emulated in host memory. Useful when no hardware is present, and for testing
/// assignment and buffer lifetimes.
#[derive(Debug)]
pub struct HostRuntime {
    num_devices: usize,
    arch: f64,
    double: bool,
    memory_limit: usize,
    info: [i32; NUM_INFO],
    program_loads: bool,

    current: Option<usize>,
    program_loaded: bool,
    buffers: Vec<Option<Vec<u8>>>,
    bytes_in_use: usize,
    acquisitions: usize,
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self {
            num_devices: 1,
            arch: 8.6,
            double: true,
            memory_limit: 1 << 30,
            info: DEFAULT_INFO,
            program_loads: true,
            current: None,
            program_loaded: false,
            buffers: Vec::new(),
            bytes_in_use: 0,
            acquisitions: 0,
        }
    }
}

impl HostRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn devices(mut self, n: usize) -> Self {
        self.num_devices = n;
        self
    }

    pub fn arch(mut self, arch: f64) -> Self {
        self.arch = arch;
        self
    }

    /// The architecture the program reports through the capability query.
    pub fn program_arch(mut self, arch: f64) -> Self {
        self.info[0] = (arch * 100.).round() as i32;
        self
    }

    pub fn double(mut self, double: bool) -> Self {
        self.double = double;
        self
    }

    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn info(mut self, info: [i32; NUM_INFO]) -> Self {
        self.info = info;
        self
    }

    /// Makes program loading fail, as it would for a corrupt or missing kernel file.
    pub fn broken_program(mut self) -> Self {
        self.program_loads = false;
        self
    }

    /// How many times hardware has been acquired.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use
    }

    pub fn program_loaded(&self) -> bool {
        self.program_loaded
    }

    fn slot(&self, buf: &DeviceBuffer) -> Result<&Vec<u8>, DeviceError> {
        self.buffers
            .get(buf.id)
            .and_then(Option::as_ref)
            .ok_or_else(|| DeviceError::AllocationFailed(format!("stale buffer {}", buf.id)))
    }

    fn slot_mut(&mut self, buf: &DeviceBuffer) -> Result<&mut Vec<u8>, DeviceError> {
        self.buffers
            .get_mut(buf.id)
            .and_then(Option::as_mut)
            .ok_or_else(|| DeviceError::AllocationFailed(format!("stale buffer {}", buf.id)))
    }

    fn require_device(&self) -> Result<(), DeviceError> {
        match self.current {
            Some(_) => Ok(()),
            None => Err(DeviceError::NotInitialized),
        }
    }
}

impl DeviceRuntime for HostRuntime {
    fn num_devices(&self) -> usize {
        self.num_devices
    }

    fn set_device(&mut self, id: usize) -> Result<(), DeviceError> {
        if id >= self.num_devices {
            return Err(DeviceError::DeviceOutOfRange {
                requested: id,
                available: self.num_devices,
            });
        }
        self.current = Some(id);
        self.acquisitions += 1;
        Ok(())
    }

    fn release(&mut self) {
        self.buffers.clear();
        self.bytes_in_use = 0;
        self.program_loaded = false;
        self.current = None;
    }

    fn name(&self, id: usize) -> String {
        format!("Host emulated accelerator {id}")
    }

    fn cores(&self, _id: usize) -> usize {
        rayon::current_num_threads()
    }

    fn gigabytes(&self, _id: usize) -> f64 {
        self.memory_limit as f64 / (1024. * 1024. * 1024.)
    }

    fn free_gigabytes(&self) -> f64 {
        (self.memory_limit - self.bytes_in_use) as f64 / (1024. * 1024. * 1024.)
    }

    fn clock_rate(&self, _id: usize) -> f64 {
        1.
    }

    fn arch(&self) -> f64 {
        self.arch
    }

    fn double_precision(&self) -> bool {
        self.double
    }

    fn group_size(&self) -> usize {
        1024
    }

    fn load_program(&mut self) -> Result<(), DeviceError> {
        self.require_device()?;
        if !self.program_loads {
            return Err(DeviceError::ProgramLoad("kernel_info not found".to_owned()));
        }
        self.program_loaded = true;
        Ok(())
    }

    fn unload_program(&mut self) {
        self.program_loaded = false;
    }

    fn query_info(&mut self) -> Result<[i32; NUM_INFO], DeviceError> {
        if !self.program_loaded {
            return Err(DeviceError::NotInitialized);
        }
        Ok(self.info)
    }

    fn alloc(&mut self, bytes: usize) -> Result<DeviceBuffer, DeviceError> {
        self.require_device()?;
        if self.bytes_in_use + bytes > self.memory_limit {
            return Err(DeviceError::AllocationFailed(format!(
                "{bytes} bytes requested with {} of {} in use",
                self.bytes_in_use, self.memory_limit
            )));
        }
        self.bytes_in_use += bytes;

        let id = match self.buffers.iter().position(Option::is_none) {
            Some(free) => {
                self.buffers[free] = Some(vec![0; bytes]);
                free
            }
            None => {
                self.buffers.push(Some(vec![0; bytes]));
                self.buffers.len() - 1
            }
        };
        Ok(DeviceBuffer { id, bytes })
    }

    fn free(&mut self, buf: DeviceBuffer) {
        if let Some(slot) = self.buffers.get_mut(buf.id) {
            if slot.take().is_some() {
                self.bytes_in_use -= buf.bytes;
            }
        }
    }

    fn copy_in(&mut self, buf: &DeviceBuffer, data: &[u8]) -> Result<(), DeviceError> {
        let dst = self.slot_mut(buf)?;
        if data.len() > dst.len() {
            return Err(DeviceError::AllocationFailed(format!(
                "copy of {} bytes into a {} byte buffer",
                data.len(),
                dst.len()
            )));
        }
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn copy_out(&mut self, buf: &DeviceBuffer, out: &mut [u8]) -> Result<(), DeviceError> {
        let src = self.slot(buf)?;
        let n = out.len().min(src.len());
        out[..n].copy_from_slice(&src[..n]);
        Ok(())
    }

    fn launch_zero(&mut self, buf: &DeviceBuffer, n: usize) -> Result<(), DeviceError> {
        let dst = self.slot_mut(buf)?;
        let n = (n * 4).min(dst.len());
        dst[..n].fill(0);
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        self.require_device()
    }
}
