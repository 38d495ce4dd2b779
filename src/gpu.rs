//! Accelerator runtime on CUDA hardware, via cudarc. The kernel program is a PTX file built from
//! `src/cuda/kernels.cu`, holding `kernel_zero` and `kernel_info`.

use std::{path::PathBuf, sync::Arc};

use cudarc::{
    driver::{
        result, sys::CUdevice_attribute, CudaContext, CudaFunction, CudaModule, CudaSlice,
        CudaStream, DriverError, LaunchConfig, PushKernelArg,
    },
    nvrtc::Ptx,
};

use crate::{
    error::DeviceError,
    runtime::{DeviceBuffer, DeviceRuntime, NUM_INFO},
};

fn alloc_err(e: impl std::fmt::Debug) -> DeviceError {
    DeviceError::AllocationFailed(format!("{e:?}"))
}

struct Program {
    _module: Arc<CudaModule>,
    zero: CudaFunction,
    info: CudaFunction,
}

pub struct CudaRuntime {
    ptx_path: PathBuf,
    ctx: Option<Arc<CudaContext>>,
    stream: Option<Arc<CudaStream>>,
    program: Option<Program>,
    buffers: Vec<Option<CudaSlice<u8>>>,
}

impl CudaRuntime {
    pub fn new(ptx_path: impl Into<PathBuf>) -> Self {
        Self {
            ptx_path: ptx_path.into(),
            ctx: None,
            stream: None,
            program: None,
            buffers: Vec::new(),
        }
    }

    fn stream(&self) -> Result<&Arc<CudaStream>, DeviceError> {
        self.stream.as_ref().ok_or(DeviceError::NotInitialized)
    }

    fn slot(&self, buf: &DeviceBuffer) -> Result<&CudaSlice<u8>, DeviceError> {
        self.buffers
            .get(buf.id)
            .and_then(Option::as_ref)
            .ok_or_else(|| DeviceError::AllocationFailed(format!("stale buffer {}", buf.id)))
    }

    /// Attribute of device `id`, or 0 if it can't be read.
    fn attribute(&self, id: usize, attrib: CUdevice_attribute) -> i32 {
        CudaContext::new(id)
            .and_then(|ctx| ctx.attribute(attrib))
            .unwrap_or_default()
    }
}

impl DeviceRuntime for CudaRuntime {
    fn num_devices(&self) -> usize {
        CudaContext::device_count().unwrap_or_default().max(0) as usize
    }

    fn set_device(&mut self, id: usize) -> Result<(), DeviceError> {
        let ctx = CudaContext::new(id).map_err(|_| DeviceError::DeviceOutOfRange {
            requested: id,
            available: self.num_devices(),
        })?;
        self.stream = Some(ctx.default_stream());
        self.ctx = Some(ctx);
        Ok(())
    }

    fn release(&mut self) {
        self.buffers.clear();
        self.program = None;
        self.stream = None;
        self.ctx = None;
    }

    fn name(&self, id: usize) -> String {
        CudaContext::new(id)
            .and_then(|ctx| ctx.name())
            .unwrap_or_else(|_| format!("CUDA device {id}"))
    }

    fn cores(&self, id: usize) -> usize {
        self.attribute(id, CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT) as usize
    }

    fn gigabytes(&self, id: usize) -> f64 {
        let total = CudaContext::new(id)
            .and_then(|ctx| {
                ctx.bind_to_thread()?;
                result::mem_get_info()
            })
            .map(|(_free, total)| total)
            .unwrap_or_default();
        total as f64 / (1024. * 1024. * 1024.)
    }

    fn free_gigabytes(&self) -> f64 {
        let Some(ctx) = &self.ctx else {
            return 0.;
        };
        let free = ctx
            .bind_to_thread()
            .and_then(|_| result::mem_get_info())
            .map(|(free, _total)| free)
            .unwrap_or_default();
        free as f64 / (1024. * 1024. * 1024.)
    }

    fn clock_rate(&self, id: usize) -> f64 {
        // Reported in kHz.
        self.attribute(id, CUdevice_attribute::CU_DEVICE_ATTRIBUTE_CLOCK_RATE) as f64 / 1.0e6
    }

    fn arch(&self) -> f64 {
        let Some(ctx) = &self.ctx else {
            return 0.;
        };
        let major = ctx
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .unwrap_or_default();
        let minor = ctx
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .unwrap_or_default();
        major as f64 + minor as f64 / 10.
    }

    fn double_precision(&self) -> bool {
        // Every device cudarc supports has double precision.
        true
    }

    fn group_size(&self) -> usize {
        self.ctx
            .as_ref()
            .and_then(|ctx| {
                ctx.attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)
                    .ok()
            })
            .unwrap_or(256) as usize
    }

    fn load_program(&mut self) -> Result<(), DeviceError> {
        let ctx = self.ctx.as_ref().ok_or(DeviceError::NotInitialized)?;
        let load = |e: DriverError| DeviceError::ProgramLoad(format!("{}: {e:?}", self.ptx_path.display()));

        let module = ctx
            .load_module(Ptx::from_file(&self.ptx_path))
            .map_err(load)?;
        let zero = module.load_function("kernel_zero").map_err(load)?;
        let info = module.load_function("kernel_info").map_err(load)?;

        self.program = Some(Program {
            _module: module,
            zero,
            info,
        });
        Ok(())
    }

    fn unload_program(&mut self) {
        self.program = None;
    }

    fn query_info(&mut self) -> Result<[i32; NUM_INFO], DeviceError> {
        let program = self.program.as_ref().ok_or(DeviceError::NotInitialized)?;
        let stream = self.stream()?;

        let mut info_dev = stream.alloc_zeros::<i32>(NUM_INFO).map_err(alloc_err)?;
        let cfg = LaunchConfig {
            grid_dim: (1, 1, 1),
            block_dim: (1, 1, 1),
            shared_mem_bytes: 0,
        };

        let mut launch_args = stream.launch_builder(&program.info);
        launch_args.arg(&mut info_dev);
        unsafe { launch_args.launch(cfg) }
            .map_err(|e| DeviceError::ProgramLoad(format!("kernel_info: {e:?}")))?;

        let info = stream.memcpy_dtov(&info_dev).map_err(alloc_err)?;
        let mut result = [0; NUM_INFO];
        result.copy_from_slice(&info[..NUM_INFO]);
        Ok(result)
    }

    fn alloc(&mut self, bytes: usize) -> Result<DeviceBuffer, DeviceError> {
        let slice = self.stream()?.alloc_zeros::<u8>(bytes).map_err(alloc_err)?;

        let id = match self.buffers.iter().position(Option::is_none) {
            Some(free) => {
                self.buffers[free] = Some(slice);
                free
            }
            None => {
                self.buffers.push(Some(slice));
                self.buffers.len() - 1
            }
        };
        Ok(DeviceBuffer { id, bytes })
    }

    fn free(&mut self, buf: DeviceBuffer) {
        if let Some(slot) = self.buffers.get_mut(buf.id) {
            *slot = None;
        }
    }

    fn copy_in(&mut self, buf: &DeviceBuffer, data: &[u8]) -> Result<(), DeviceError> {
        let stream = self.stream.clone().ok_or(DeviceError::NotInitialized)?;
        let dst = self
            .buffers
            .get_mut(buf.id)
            .and_then(Option::as_mut)
            .ok_or_else(|| DeviceError::AllocationFailed(format!("stale buffer {}", buf.id)))?;
        if data.len() > buf.bytes {
            return Err(DeviceError::AllocationFailed(format!(
                "copy of {} bytes into a {} byte buffer",
                data.len(),
                buf.bytes
            )));
        }

        let mut view = dst.slice_mut(0..data.len());
        stream.memcpy_htod(data, &mut view).map_err(alloc_err)
    }

    fn copy_out(&mut self, buf: &DeviceBuffer, out: &mut [u8]) -> Result<(), DeviceError> {
        let stream = self.stream()?;
        let src = self.slot(buf)?;
        let n = out.len().min(buf.bytes);
        stream
            .memcpy_dtoh(&src.slice(0..n), &mut out[..n])
            .map_err(alloc_err)
    }

    fn launch_zero(&mut self, buf: &DeviceBuffer, n: usize) -> Result<(), DeviceError> {
        let stream = self.stream.clone().ok_or(DeviceError::NotInitialized)?;
        let program = self.program.as_ref().ok_or(DeviceError::NotInitialized)?;
        let mem = self
            .buffers
            .get_mut(buf.id)
            .and_then(Option::as_mut)
            .ok_or_else(|| DeviceError::AllocationFailed(format!("stale buffer {}", buf.id)))?;

        let n = n.min(buf.bytes / 4);
        let numel = n as i32;
        let cfg = LaunchConfig::for_num_elems(n.max(1) as u32);

        let mut launch_args = stream.launch_builder(&program.zero);
        launch_args.arg(mem);
        launch_args.arg(&numel);
        unsafe { launch_args.launch(cfg) }
            .map(|_| ())
            .map_err(|e| DeviceError::ProgramLoad(format!("kernel_zero: {e:?}")))
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        self.stream()?.synchronize().map_err(alloc_err)
    }
}
