//! Runs a few steps of a charged Lennard-Jones lattice, split between host threads and the
//! accelerator, and logs the energies and the accelerator timing report.

use std::{error::Error, path::Path, time::Instant};

use env_logger::Env;
use lin_alg::f64::Vec3;
use lj_coul_accel::{
    buffers::{Answer, NeighborData},
    device::BufferRequest,
    pair::InitContext,
    timing::Timer,
    AtomView, Communicator, Device, DeviceRuntime, EngineConfig, EvalMode, NeighList,
};
use log::{error, info, warn};
use rand::Rng;

#[cfg(feature = "cuda")]
use lj_coul_accel::gpu::CudaRuntime;
#[cfg(not(feature = "cuda"))]
use lj_coul_accel::HostRuntime;
#[cfg(feature = "mpi")]
use lj_coul_accel::MpiComm;
#[cfg(not(feature = "mpi"))]
use lj_coul_accel::SelfComm;

const SAVE_FILE: &str = "config.ljc";
#[cfg(feature = "cuda")]
const PTX_FILE: &str = "./lj_coul_accel.ptx";

/// A cubic lattice with every third site an oxygen-like type 1 (q = -0.8) and the rest a
/// hydrogen-like type 2 (q = +0.4), displaced at random by up to `jitter`.
fn make_lattice(cfg: &EngineConfig) -> (Vec<Vec3>, Vec<f64>, Vec<usize>) {
    let n = cfg.lattice_cells;
    let mut rng = rand::rng();

    let mut posits = Vec::with_capacity(n * n * n);
    let mut charges = Vec::with_capacity(n * n * n);
    let mut types = Vec::with_capacity(n * n * n);

    for i in 0..n {
        for j in 0..n {
            for k in 0..n {
                let mut p = Vec3::new(i as f64, j as f64, k as f64) * cfg.lattice_spacing;
                if cfg.jitter > 0. {
                    p += Vec3::new(
                        rng.random_range(-cfg.jitter..cfg.jitter),
                        rng.random_range(-cfg.jitter..cfg.jitter),
                        rng.random_range(-cfg.jitter..cfg.jitter),
                    );
                }
                posits.push(p);

                if (i + j + k) % 3 == 0 {
                    types.push(1);
                    charges.push(-0.8);
                } else {
                    types.push(2.min(cfg.ntypes()));
                    charges.push(0.4);
                }
            }
        }
    }

    (posits, charges, types)
}

fn run<R: DeviceRuntime>(
    runtime: R,
    world: &dyn Communicator,
    cfg: &EngineConfig,
) -> Result<(), Box<dyn Error>> {
    let mut device = Device::new(runtime, cfg.precision);
    device.init_device(
        world,
        world,
        cfg.first_device,
        cfg.last_device,
        cfg.gpu_mode,
        cfg.particle_split,
        cfg.nthreads,
        cfg.threads_per_atom,
    )?;
    device.init_message("lj/cut/coul/long");

    let (posits, charges, types) = make_lattice(cfg);
    let nlocal = posits.len();

    let mut pair = cfg.build_pair()?;
    let ctx = InitContext {
        has_charge: true,
        g_ewald: Some(cfg.g_ewald),
        respa: cfg.respa()?,
        types: &types,
        comm: world,
    };
    let cutoff = pair.init(&ctx)?;
    info!(
        "{nlocal} atoms, cutoff {cutoff:.2}, etail {:.4}, ptail {:.4}",
        pair.etail, pair.ptail
    );

    let start = Instant::now();
    let list = NeighList::build_half(&posits, nlocal, cutoff, &[]);
    info!(
        "Neighbor list built: {} pairs. Time: {:?}",
        list.num_pairs(),
        start.elapsed()
    );

    let split = device.split();
    let mut ans = Answer::default();
    let mut nbor = NeighborData::default();
    let max_nbors = list.firstneigh.iter().map(Vec::len).max().unwrap_or(0);
    device.init(
        &mut ans,
        &mut nbor,
        &BufferRequest {
            charge: true,
            nlocal,
            host_nlocal: split.host_count(nlocal),
            nall: nlocal,
            max_nbors,
            cell_size: cutoff,
            ..Default::default()
        },
    )?;

    let (overhead, driver_overhead) = device.estimate_overhead(1)?;
    info!("Offload overhead: {overhead:.2e} s, driver {driver_overhead:.2e} s");

    let atoms = AtomView::new(&posits, &charges, &types, nlocal);
    let (host_view, dev_view) = split.partition(&list);
    info!(
        "Split: {} atoms on the host, {} on the accelerator",
        host_view.inum(),
        dev_view.inum()
    );

    let mut time_pair = Timer::default();
    for step in 0..cfg.num_steps {
        let mode = EvalMode::new(true, true);
        let mut f = vec![Vec3::new_zero(); nlocal];

        device.copy_atoms(&posits, &types, &charges)?;
        nbor.copy_list(device.runtime_mut(), dev_view)?;

        // The accelerator's share, emulated with the host kernel. Its atoms' forces round trip
        // through the answer buffers; reactions on the host's atoms are added directly.
        time_pair.start();
        let mut f_dev = vec![Vec3::new_zero(); nlocal];
        let mut ev = pair.compute(mode, &atoms, dev_view, &mut f_dev)?;
        time_pair.stop();
        time_pair.add_to_total();

        let dev_forces: Vec<Vec3> = dev_view.ilist.iter().map(|&i| f_dev[i]).collect();
        ans.store_forces(device.runtime_mut(), &dev_forces)?;
        for &i in host_view.ilist {
            f[i] += f_dev[i];
        }

        ev += pair.compute(mode, &atoms, host_view, &mut f)?;
        ans.get_answers(device.runtime_mut(), dev_view.ilist, &mut f)?;

        let net = f.iter().fold(Vec3::new_zero(), |acc, v| acc + *v);
        info!(
            "Step {step}: evdwl {:.4}, ecoul {:.4}, virial xx {:.4}, |net force| {:.2e}",
            ev.evdwl,
            ev.ecoul,
            ev.virial[0],
            net.magnitude()
        );
    }

    let max_bytes = ans.max_gpu_bytes() + nbor.max_gpu_bytes();
    let avg_split = split.device_count(nlocal) as f64 / nlocal.max(1) as f64;
    if let Some(report) = device.output_times(
        &time_pair,
        &ans,
        &nbor,
        avg_split,
        max_bytes,
        overhead,
        driver_overhead,
        device.threads_per_atom(),
    ) {
        info!("\n{report}");
    }
    info!(
        "Host memory: pair {} bytes, device {} bytes",
        pair.memory_usage(),
        device.host_memory_usage()
    );

    ans.clear(device.runtime_mut());
    nbor.clear(device.runtime_mut());
    device.clear();

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // Dropping the universe finalizes MPI, so it lives until `main` returns.
    #[cfg(feature = "mpi")]
    let Some(universe) = mpi::initialize() else {
        error!("MPI was already initialized");
        std::process::exit(1);
    };
    #[cfg(feature = "mpi")]
    let world = MpiComm::new(universe.world());

    #[cfg(not(feature = "mpi"))]
    let world = SelfComm::new();

    let path = Path::new(SAVE_FILE);
    let cfg = match EngineConfig::load(path) {
        Ok(cfg) => {
            info!("Loaded config from {SAVE_FILE}");
            cfg
        }
        Err(_) => {
            let cfg = EngineConfig::default();
            if world.rank() == 0 {
                if let Err(e) = cfg.save(path) {
                    warn!("Unable to save the default config: {e}");
                }
            }
            cfg
        }
    };

    #[cfg(feature = "cuda")]
    let runtime = CudaRuntime::new(PTX_FILE);

    #[cfg(not(feature = "cuda"))]
    let runtime = HostRuntime::new();

    if let Err(e) = run(runtime, &world, &cfg) {
        error!("{e}");
        std::process::exit(1);
    }
}
