//! Cross-module checks: closed-form forces, RESPA shell sums, thread-count independence, and the
//! host/accelerator split.

use std::{f64::consts::PI, thread};

use lin_alg::f64::Vec3;
use statrs::function::erf::erfc;

use crate::{
    comm::SelfComm,
    neighbors::{NeighList, SpecialFactors},
    pair::{InitContext, PairLjCutCoulLong},
    params::PairSettings,
    respa::RespaCutoffs,
    AtomView, Communicator, EvalMode, ThreadComm, WorkSplit,
};

const G_EWALD: f64 = 0.25;

fn init(p: &mut PairLjCutCoulLong, respa: Option<RespaCutoffs>) {
    let comm = SelfComm::with_name("n");
    let ctx = InitContext {
        has_charge: true,
        g_ewald: Some(G_EWALD),
        respa,
        types: &[],
        comm: &comm,
    };
    p.init(&ctx).unwrap();
}

/// A small charged cluster: a jittered 4×4×4 cube with alternating charges and two types.
fn cluster() -> (Vec<Vec3>, Vec<f64>, Vec<usize>) {
    let mut posits = Vec::new();
    let mut charges = Vec::new();
    let mut types = Vec::new();

    for i in 0..4 {
        for j in 0..4 {
            for k in 0..4 {
                let n = i * 16 + j * 4 + k;
                // Deterministic offsets, so failures reproduce.
                let wobble = Vec3::new(
                    0.13 * ((n * 7) % 5) as f64,
                    -0.11 * ((n * 3) % 4) as f64,
                    0.09 * ((n * 5) % 3) as f64,
                );
                posits.push(Vec3::new(i as f64, j as f64, k as f64) * 3.2 + wobble);
                charges.push(if (i + j + k) % 2 == 0 { 0.6 } else { -0.6 });
                types.push(1 + n % 2);
            }
        }
    }
    (posits, charges, types)
}

fn two_type_pair(nthreads: usize, cut_lj: f64, cut_coul: f64) -> PairLjCutCoulLong {
    let settings = PairSettings::new(cut_lj, Some(cut_coul)).unwrap();
    let mut p = PairLjCutCoulLong::new(2, nthreads, settings).unwrap();
    p.coeff("1", "1", 0.15, 3.1, None).unwrap();
    p.coeff("2", "2", 0.05, 2.6, None).unwrap();
    p
}

fn max_abs(f: &[Vec3]) -> f64 {
    f.iter()
        .flat_map(|v| [v.x.abs(), v.y.abs(), v.z.abs()])
        .fold(0., f64::max)
}

fn assert_forces_close(a: &[Vec3], b: &[Vec3], rel: f64) {
    let tol = rel * max_abs(a).max(1.);
    for (i, (u, v)) in a.iter().zip(b).enumerate() {
        let diff = (u.x - v.x).abs().max((u.y - v.y).abs()).max((u.z - v.z).abs());
        assert!(diff <= tol, "atom {i}: {diff:e} exceeds {tol:e}");
    }
}

#[test]
fn lj_pair_matches_closed_form() {
    let (epsilon, sigma, r) = (0.2, 3.0, 3.4);

    let settings = PairSettings::new(8., None).unwrap();
    let mut p = PairLjCutCoulLong::new(1, 1, settings).unwrap();
    p.coeff("1", "1", epsilon, sigma, None).unwrap();
    init(&mut p, None);

    let posits = vec![Vec3::new(0., 0., 0.), Vec3::new(r, 0., 0.)];
    let charges = [0., 0.];
    let types = [1, 1];
    let atoms = AtomView::new(&posits, &charges, &types, 2);
    let list = NeighList::build_half(&posits, 2, 8., &[]);

    let mut f = vec![Vec3::new_zero(); 2];
    let ev = p
        .compute(EvalMode::ForceEnergy, &atoms, list.view(), &mut f)
        .unwrap();

    let sr6 = (sigma / r).powi(6);
    let force = 24. * epsilon * (2. * sr6 * sr6 - sr6) / r;
    let energy = 4. * epsilon * (sr6 * sr6 - sr6);

    // Repulsive at this range: atom 0 is pushed toward -x.
    assert!((f[0].x + force).abs() < 1e-12 * force.abs());
    assert!((f[1].x - force).abs() < 1e-12 * force.abs());
    assert_eq!(f[0].y, 0.);
    assert!((ev.evdwl - energy).abs() < 1e-12 * energy.abs());
    assert_eq!(ev.ecoul, 0.);
}

#[test]
fn coulomb_pair_matches_erfc() {
    let r = 3.0;

    let settings = PairSettings::new(10., None).unwrap();
    let mut p = PairLjCutCoulLong::new(1, 1, settings).unwrap();
    p.coeff("1", "1", 0., 1., None).unwrap();
    p.ncoultablebits = 0;
    init(&mut p, None);

    let posits = vec![Vec3::new(0., 0., 0.), Vec3::new(0., r, 0.)];
    let charges = [1., -1.];
    let types = [1, 1];
    let atoms = AtomView::new(&posits, &charges, &types, 2);
    let list = NeighList::build_half(&posits, 2, 10., &[]);

    let mut f = vec![Vec3::new_zero(); 2];
    let ev = p
        .compute(EvalMode::ForceEnergy, &atoms, list.view(), &mut f)
        .unwrap();

    let gr = G_EWALD * r;
    let qiqj = -1.;
    let force =
        p.qqrd2e * qiqj * (erfc(gr) / r + 2. * G_EWALD / PI.sqrt() * (-gr * gr).exp()) / r;
    let energy = p.qqrd2e * qiqj * erfc(gr) / r;

    // Attractive: atom 0 is pulled toward +y.
    let expected = -force;
    assert!(f[0].y > 0.);
    assert!((f[0].y - expected).abs() < 1e-6 * expected.abs());
    assert!((ev.ecoul - energy).abs() < 1e-6 * energy.abs());
}

#[test]
fn respa_shells_sum_to_full_force() {
    let cut = RespaCutoffs::new([2.5, 3.5, 5.5, 7.]).unwrap();

    let (posits, charges, types) = cluster();
    let n = posits.len();
    let atoms = AtomView::new(&posits, &charges, &types, n);

    // Plain neighbors and a few special-bond ones, so the factor bookkeeping is covered too.
    let specials = [(0, 1, 1), (0, 4, 2), (5, 6, 3), (20, 21, 3)];
    let list = NeighList::build_half(&posits, n, 9., &specials);

    let mut p = two_type_pair(3, 8., 9.);
    p.special = SpecialFactors::new([0., 0.2, 0.5], [0., 0.3, 0.5]);
    p.ncoultablebits = 0;
    init(&mut p, Some(cut));

    let mut full = vec![Vec3::new_zero(); n];
    p.compute(EvalMode::Force, &atoms, list.view(), &mut full).unwrap();

    let mut shells = vec![Vec3::new_zero(); n];
    p.compute_inner(&atoms, list.view(), &mut shells).unwrap();
    p.compute_middle(&atoms, list.view(), &mut shells).unwrap();
    p.compute_outer(EvalMode::Force, &atoms, list.view(), &mut shells)
        .unwrap();

    assert_forces_close(&full, &shells, 1e-10);
}

#[test]
fn respa_outer_tallies_full_energy() {
    let cut = RespaCutoffs::new([2.5, 3.5, 5.5, 7.]).unwrap();

    let (posits, charges, types) = cluster();
    let n = posits.len();
    let atoms = AtomView::new(&posits, &charges, &types, n);
    let list = NeighList::build_half(&posits, n, 9., &[]);

    let mut p = two_type_pair(2, 8., 9.);
    p.ncoultablebits = 0;
    init(&mut p, Some(cut));

    let mode = EvalMode::ForceEnergyVirial;
    let mut f = vec![Vec3::new_zero(); n];
    let full = p.compute(mode, &atoms, list.view(), &mut f).unwrap();
    let outer = p.compute_outer(mode, &atoms, list.view(), &mut f).unwrap();

    let scale = full.total_energy().abs().max(1.);
    assert!((full.evdwl - outer.evdwl).abs() < 1e-10 * scale);
    assert!((full.ecoul - outer.ecoul).abs() < 1e-10 * scale);
    let vscale = full.virial.iter().fold(1_f64, |m, v| m.max(v.abs()));
    for (a, b) in full.virial.iter().zip(outer.virial) {
        assert!((a - b).abs() < 1e-10 * vscale);
    }
}

#[test]
fn respa_shells_with_tables_match_full() {
    let cut = RespaCutoffs::new([2.5, 3.5, 5.5, 7.]).unwrap();

    let (posits, charges, types) = cluster();
    let n = posits.len();
    let atoms = AtomView::new(&posits, &charges, &types, n);

    let specials = [(0, 1, 1), (0, 4, 2), (5, 6, 3), (20, 21, 3), (40, 44, 3)];
    let list = NeighList::build_half(&posits, n, 9., &specials);

    let mut p = two_type_pair(3, 8., 9.);
    p.special = SpecialFactors::new([0., 0.2, 0.5], [0., 0.3, 0.5]);
    init(&mut p, Some(cut));
    assert!(p.table().is_some_and(|t| t.respa.is_some()));

    let mode = EvalMode::ForceEnergyVirial;
    let mut full = vec![Vec3::new_zero(); n];
    let ev_full = p.compute(mode, &atoms, list.view(), &mut full).unwrap();

    let mut shells = vec![Vec3::new_zero(); n];
    p.compute_inner(&atoms, list.view(), &mut shells).unwrap();
    p.compute_middle(&atoms, list.view(), &mut shells).unwrap();
    let ev_outer = p
        .compute_outer(mode, &atoms, list.view(), &mut shells)
        .unwrap();

    // The outer table column interpolates the switched bare term; the inner shells compute it
    // exactly.
    assert_forces_close(&full, &shells, 5e-5);

    // Both tallies read the same full-force and energy columns.
    let scale = ev_full.total_energy().abs().max(1.);
    assert!((ev_full.evdwl - ev_outer.evdwl).abs() < 1e-10 * scale);
    assert!((ev_full.ecoul - ev_outer.ecoul).abs() < 1e-10 * scale);
    let vscale = ev_full.virial.iter().fold(1_f64, |m, v| m.max(v.abs()));
    for (a, b) in ev_full.virial.iter().zip(ev_outer.virial) {
        assert!((a - b).abs() < 1e-10 * vscale);
    }
}

#[test]
fn thread_count_does_not_change_forces() {
    let (posits, charges, types) = cluster();
    let n = posits.len();
    let atoms = AtomView::new(&posits, &charges, &types, n);
    let list = NeighList::build_half(&posits, n, 9., &[]);

    let mut serial = two_type_pair(1, 8., 9.);
    init(&mut serial, None);
    let mut f1 = vec![Vec3::new_zero(); n];
    let ev1 = serial
        .compute(EvalMode::ForceEnergy, &atoms, list.view(), &mut f1)
        .unwrap();

    for nthreads in [2, 5, 8] {
        let mut threaded = two_type_pair(nthreads, 8., 9.);
        init(&mut threaded, None);
        let mut f_threaded = vec![Vec3::new_zero(); n];
        let evn = threaded
            .compute(EvalMode::ForceEnergy, &atoms, list.view(), &mut f_threaded)
            .unwrap();

        assert_forces_close(&f1, &f_threaded, 1e-12);
        assert!((ev1.total_energy() - evn.total_energy()).abs() < 1e-10 * ev1.total_energy().abs());
    }
}

#[test]
fn split_halves_combine_to_full() {
    let (posits, charges, types) = cluster();
    let n = posits.len();
    let atoms = AtomView::new(&posits, &charges, &types, n);
    let list = NeighList::build_half(&posits, n, 9., &[]);

    let mut p = two_type_pair(4, 8., 9.);
    init(&mut p, None);

    let mode = EvalMode::ForceEnergyVirial;
    let mut full = vec![Vec3::new_zero(); n];
    let ev_full = p.compute(mode, &atoms, list.view(), &mut full).unwrap();

    let split = WorkSplit::new(0.4);
    let (host, dev) = split.partition(&list);
    assert_eq!(host.inum(), split.host_count(n));
    assert_eq!(host.inum() + dev.inum(), n);

    let mut combined = vec![Vec3::new_zero(); n];
    let mut ev = p.compute(mode, &atoms, dev, &mut combined).unwrap();
    ev += p.compute(mode, &atoms, host, &mut combined).unwrap();

    assert_forces_close(&full, &combined, 1e-12);
    assert!((ev.total_energy() - ev_full.total_energy()).abs() < 1e-10 * ev_full.total_energy().abs());
}

#[test]
fn restart_reaches_every_rank() {
    let source = two_type_pair(1, 7.5, 9.);
    let mut bytes = Vec::new();
    source.write_restart(&mut bytes).unwrap();

    let comms = ThreadComm::group(&["a", "a", "b"]);
    let sigmas: Vec<f64> = thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let bytes = &bytes;
                s.spawn(move || {
                    let mut p =
                        PairLjCutCoulLong::new(2, 1, PairSettings::new(1., None).unwrap()).unwrap();
                    let mut reader = bytes.as_slice();
                    let reader: Option<&mut dyn std::io::Read> =
                        (comm.rank() == 0).then_some(&mut reader as &mut dyn std::io::Read);
                    p.read_restart(&comm, reader).unwrap();

                    assert_eq!(p.settings.cut_lj_global, 7.5);
                    assert_eq!(p.cut_coul(), 9.);
                    let params = p.params().unwrap();
                    params.sigma[params.idx(2, 2)]
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(sigmas, vec![2.6; 3]);
}
