//! Host-side 12-6 Lennard-Jones plus real-space Ewald Coulomb pair forces, with the RESPA inner,
//! middle and outer shells.
//!
//! Each evaluation statically splits the owned-atom list into one contiguous range per logical
//! thread, accumulates into that thread's row of a `ForceArena`, then merges the rows into the
//! caller's force array.

use std::io::{self, Read, Write};

use lin_alg::f64::Vec3;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};

use crate::{
    comm::{Communicator, ReduceOp},
    error::ConfigError,
    ewald_table::{erfc_poly, EwaldTable, RespaColumns, EWALD_F, NCOULTABLEBITS_DEFAULT},
    neighbors::{decode_neighbor, NeighView, SpecialFactors},
    params::{PairParams, PairSettings, TypeRange},
    reduce::{thread_range, EnergyVirial, ForceArena},
    respa::{switch_off, switch_on, RespaCutoffs},
    AtomView, QQRD2E_REAL,
};

/// Which tallies an evaluation accumulates alongside forces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EvalMode {
    #[default]
    Force,
    ForceEnergy,
    ForceVirial,
    ForceEnergyVirial,
}

impl EvalMode {
    pub fn new(energy: bool, virial: bool) -> Self {
        match (energy, virial) {
            (false, false) => Self::Force,
            (true, false) => Self::ForceEnergy,
            (false, true) => Self::ForceVirial,
            (true, true) => Self::ForceEnergyVirial,
        }
    }

    pub fn energy(self) -> bool {
        matches!(self, Self::ForceEnergy | Self::ForceEnergyVirial)
    }

    pub fn virial(self) -> bool {
        matches!(self, Self::ForceVirial | Self::ForceEnergyVirial)
    }

    pub fn tallies(self) -> bool {
        self != Self::Force
    }
}

/// Coulomb force and energy for one pair, before division by r².
#[derive(Clone, Copy, Debug, Default)]
struct Coul {
    force: f64,
    energy: f64,
}

/// What the rest of the simulation provides at setup time.
pub struct InitContext<'a> {
    pub has_charge: bool,
    /// Split parameter of the companion long-range solver; `None` if there isn't one.
    pub g_ewald: Option<f64>,
    pub respa: Option<RespaCutoffs>,
    /// Types of owned atoms, for the tail-correction counts.
    pub types: &'a [usize],
    pub comm: &'a dyn Communicator,
}

pub struct PairLjCutCoulLong {
    pool: ThreadPool,
    nthreads: usize,
    ntypes: usize,
    pub settings: PairSettings,
    /// Allocated on the first `coeff`.
    params: Option<PairParams>,
    pub special: SpecialFactors,
    pub newton_pair: bool,
    pub qqrd2e: f64,
    /// 0 disables the lookup table.
    pub ncoultablebits: u32,
    pub tabinner: f64,
    g_ewald: f64,
    cut_coulsq: f64,
    cut_respa: Option<RespaCutoffs>,
    table: Option<EwaldTable>,
    pub etail: f64,
    pub ptail: f64,
    cutforce: f64,
}

impl PairLjCutCoulLong {
    pub fn new(ntypes: usize, nthreads: usize, settings: PairSettings) -> Result<Self, ConfigError> {
        if ntypes == 0 || nthreads == 0 {
            return Err(ConfigError::IllegalArgument(
                "Need at least one atom type and one thread".to_owned(),
            ));
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .build()
            .map_err(|e| ConfigError::ThreadPool(e.to_string()))?;

        Ok(Self {
            pool,
            nthreads,
            ntypes,
            settings,
            params: None,
            special: SpecialFactors::default(),
            newton_pair: true,
            qqrd2e: QQRD2E_REAL,
            ncoultablebits: NCOULTABLEBITS_DEFAULT,
            tabinner: 2_f64.sqrt(),
            g_ewald: 0.,
            cut_coulsq: settings.cut_coul * settings.cut_coul,
            cut_respa: None,
            table: None,
            etail: 0.,
            ptail: 0.,
            cutforce: 0.,
        })
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    pub fn ntypes(&self) -> usize {
        self.ntypes
    }

    pub fn params(&self) -> Option<&PairParams> {
        self.params.as_ref()
    }

    pub fn table(&self) -> Option<&EwaldTable> {
        self.table.as_ref()
    }

    pub fn cut_coul(&self) -> f64 {
        self.settings.cut_coul
    }

    /// Largest combined cutoff over all type pairs, after `init`.
    pub fn cutforce(&self) -> f64 {
        self.cutforce
    }

    /// Global cutoffs. `cut_coul` defaults to the LJ cutoff.
    pub fn set_cutoffs(&mut self, cut_lj_global: f64, cut_coul: Option<f64>) -> Result<(), ConfigError> {
        let new = PairSettings::new(cut_lj_global, cut_coul)?;
        self.settings.cut_lj_global = new.cut_lj_global;
        self.settings.cut_coul = new.cut_coul;

        if let Some(params) = self.params.as_mut() {
            params.reset_cutoffs(cut_lj_global);
        }
        Ok(())
    }

    /// Coefficients for one or more type pairs, e.g. `coeff("1", "2*", 0.2, 3.1, None)`.
    pub fn coeff(
        &mut self,
        itypes: &str,
        jtypes: &str,
        epsilon: f64,
        sigma: f64,
        cut_lj: Option<f64>,
    ) -> Result<(), ConfigError> {
        let irange = TypeRange::parse(itypes, self.ntypes)?;
        let jrange = TypeRange::parse(jtypes, self.ntypes)?;
        let cut_lj = cut_lj.unwrap_or(self.settings.cut_lj_global);

        let ntypes = self.ntypes;
        self.params
            .get_or_insert_with(|| PairParams::new(ntypes))
            .coeff(irange, jrange, epsilon, sigma, cut_lj)?;
        Ok(())
    }

    /// Checks required collaborators, adopts the RESPA cutoffs, and builds the lookup table.
    pub fn init_style(&mut self, ctx: &InitContext) -> Result<(), ConfigError> {
        if !ctx.has_charge {
            return Err(ConfigError::MissingCharge);
        }
        let Some(g_ewald) = ctx.g_ewald else {
            return Err(ConfigError::IncompatibleKspace);
        };

        self.g_ewald = g_ewald;
        self.cut_respa = ctx.respa;
        self.cut_coulsq = self.settings.cut_coul * self.settings.cut_coul;

        self.table = if self.ncoultablebits > 0 {
            Some(EwaldTable::new(
                self.settings.cut_coul,
                g_ewald,
                self.qqrd2e,
                self.tabinner,
                self.ncoultablebits,
                self.cut_respa.as_ref(),
            )?)
        } else {
            None
        };
        Ok(())
    }

    /// `init_style`, then derived coefficients for every type pair and the tail correction.
    /// Returns the largest combined cutoff.
    pub fn init(&mut self, ctx: &InitContext) -> Result<f64, ConfigError> {
        self.init_style(ctx)?;

        let ntypes = self.ntypes;
        let settings = self.settings;
        let respa = self.cut_respa;
        let params = self.params.as_mut().ok_or(ConfigError::CoeffsNotSet)?;

        let counts = if settings.tail_flag {
            let mut local = vec![0.; ntypes + 1];
            for &t in ctx.types {
                if t <= ntypes {
                    local[t] += 1.;
                }
            }
            ctx.comm.all_reduce(&local, ReduceOp::Sum)
        } else {
            Vec::new()
        };

        let mut cutforce: f64 = 0.;
        self.etail = 0.;
        self.ptail = 0.;

        for i in 1..=ntypes {
            for j in i..=ntypes {
                let cut = params.init_one(i, j, &settings, respa.as_ref())?;
                cutforce = cutforce.max(cut);

                if settings.tail_flag {
                    let tail = params.tail(i, j, counts[i], counts[j]);
                    let mult = if i == j { 1. } else { 2. };
                    self.etail += mult * tail.etail;
                    self.ptail += mult * tail.ptail;
                }
            }
        }

        self.cutforce = cutforce;

        log::info!(
            "lj/cut/coul/long: {ntypes} types, cut_coul {:.3}, g_ewald {:.5}, table bits {}, {} threads{}",
            self.settings.cut_coul,
            self.g_ewald,
            self.ncoultablebits,
            self.nthreads,
            if respa.is_some() { ", RESPA" } else { "" },
        );

        Ok(cutforce)
    }

    fn ready_params(&self) -> Result<&PairParams, ConfigError> {
        self.params.as_ref().ok_or(ConfigError::CoeffsNotSet)
    }

    fn ready_respa(&self) -> Result<RespaCutoffs, ConfigError> {
        self.cut_respa
            .ok_or_else(|| ConfigError::RespaOrder("no RESPA cutoffs were set at init".to_owned()))
    }

    /// Runs `per_atom` over the static thread ranges of `list`, then merges forces into `f`.
    fn run_threads<F>(&self, nall: usize, list: NeighView, f: &mut [Vec3], per_atom: F) -> EnergyVirial
    where
        F: Fn(usize, &mut [Vec3], &mut EnergyVirial) + Sync,
    {
        let nthreads = self.nthreads;
        let inum = list.inum();
        let mut arena = ForceArena::new(nthreads, nall);

        let tallies: Vec<EnergyVirial> = self.pool.install(|| {
            arena
                .rows_mut()
                .enumerate()
                .map(|(tid, row)| {
                    let mut ev = EnergyVirial::default();
                    for ii in thread_range(tid, nthreads, inum) {
                        per_atom(list.ilist[ii], row, &mut ev);
                    }
                    ev
                })
                .collect()
        });

        self.pool.install(|| arena.merge_into(f));

        let mut result = EnergyVirial::default();
        for ev in tallies {
            result += ev;
        }
        result
    }

    /// Ewald real-space Coulomb for the full (non-RESPA) force. `qiqj` is the charge product.
    fn coul_full(&self, rsq: f64, qiqj: f64, factor_coul: f64, energy: bool) -> Coul {
        if let Some(table) = self.table.as_ref().filter(|t| rsq > t.tabinnersq) {
            let lk = table.lookup(rsq);

            // RESPA tables carry the outer-level force; the full force is in the virial column.
            let (force, prefactor) = match &table.respa {
                Some(cols) => (cols.virial.at(lk), cols.bare.at(lk)),
                None => (table.force.at(lk), table.coul.at(lk)),
            };

            let mut result = Coul {
                force: qiqj * force,
                energy: if energy { qiqj * table.energy.at(lk) } else { 0. },
            };
            if factor_coul < 1. {
                result.force -= (1. - factor_coul) * qiqj * prefactor;
                result.energy -= (1. - factor_coul) * qiqj * prefactor;
            }
            return result;
        }

        let r = rsq.sqrt();
        let grij = self.g_ewald * r;
        let expm2 = (-grij * grij).exp();
        let erfc = erfc_poly(grij, expm2);
        let prefactor = self.qqrd2e * qiqj / r;

        let mut result = Coul {
            force: prefactor * (erfc + EWALD_F * grij * expm2),
            energy: prefactor * erfc,
        };
        if factor_coul < 1. {
            result.force -= (1. - factor_coul) * prefactor;
            result.energy -= (1. - factor_coul) * prefactor;
        }
        result
    }

    /// Full force, energy and virial over `list`. `f` must cover owned and ghost atoms.
    pub fn compute(
        &self,
        mode: EvalMode,
        atoms: &AtomView,
        list: NeighView,
        f: &mut [Vec3],
    ) -> Result<EnergyVirial, ConfigError> {
        let p = self.ready_params()?;
        let nall = atoms.nall();
        let nlocal = atoms.nlocal;

        let per_atom = |i: usize, f: &mut [Vec3], ev: &mut EnergyVirial| {
            let qtmp = atoms.charges[i];
            let xi = atoms.posits[i];
            let itype = atoms.types[i];
            let mut fi = Vec3::new_zero();

            for &jraw in list.neighbors(i) {
                let (j, group) = decode_neighbor(jraw, nall);
                let factor_coul = self.special.coul[group];
                let factor_lj = self.special.lj[group];

                let del = xi - atoms.posits[j];
                let rsq = del.magnitude_squared();
                let ij = p.idx(itype, atoms.types[j]);

                if rsq >= p.cutsq[ij] {
                    continue;
                }
                let r2inv = 1. / rsq;

                let coul = if rsq < self.cut_coulsq {
                    self.coul_full(rsq, qtmp * atoms.charges[j], factor_coul, mode.energy())
                } else {
                    Coul::default()
                };

                let in_lj = rsq < p.cut_ljsq[ij];
                let r6inv = r2inv * r2inv * r2inv;
                let forcelj = if in_lj {
                    r6inv * (p.lj1[ij] * r6inv - p.lj2[ij])
                } else {
                    0.
                };

                let fpair = (coul.force + factor_lj * forcelj) * r2inv;

                fi += del * fpair;
                if self.newton_pair || j < nlocal {
                    f[j] -= del * fpair;
                }

                if mode.tallies() {
                    let evdwl = if in_lj {
                        factor_lj * (r6inv * (p.lj3[ij] * r6inv - p.lj4[ij]) - p.offset[ij])
                    } else {
                        0.
                    };
                    ev.tally(
                        mode.energy(),
                        mode.virial(),
                        i < nlocal,
                        j < nlocal,
                        self.newton_pair,
                        evdwl,
                        coul.energy,
                        fpair,
                        del,
                    );
                }
            }
            f[i] += fi;
        };

        Ok(self.run_threads(nall, list, f, per_atom))
    }

    /// Innermost RESPA level: bare Coulomb plus LJ, switched off over `[c0, c1]`.
    pub fn compute_inner(
        &self,
        atoms: &AtomView,
        list: NeighView,
        f: &mut [Vec3],
    ) -> Result<(), ConfigError> {
        let p = self.ready_params()?;
        let cut = self.ready_respa()?;
        let nall = atoms.nall();
        let nlocal = atoms.nlocal;
        let cut_in_off_sq = cut.inner_off().powi(2);
        let cut_in_on_sq = cut.inner_on().powi(2);

        let per_atom = |i: usize, f: &mut [Vec3], _: &mut EnergyVirial| {
            let qtmp = atoms.charges[i];
            let xi = atoms.posits[i];
            let itype = atoms.types[i];
            let mut fi = Vec3::new_zero();

            for &jraw in list.neighbors(i) {
                let (j, group) = decode_neighbor(jraw, nall);
                let del = xi - atoms.posits[j];
                let rsq = del.magnitude_squared();
                if rsq >= cut_in_on_sq {
                    continue;
                }

                let mut fpair = self.bare_pair(p, rsq, qtmp * atoms.charges[j], itype, atoms.types[j], group);
                if rsq > cut_in_off_sq {
                    fpair *= switch_off(cut.inner_frac(rsq.sqrt()));
                }

                fi += del * fpair;
                if self.newton_pair || j < nlocal {
                    f[j] -= del * fpair;
                }
            }
            f[i] += fi;
        };

        self.run_threads(nall, list, f, per_atom);
        Ok(())
    }

    /// Middle RESPA level: bare Coulomb plus LJ, switched on over `[c0, c1]` and off over
    /// `[c2, c3]`.
    pub fn compute_middle(
        &self,
        atoms: &AtomView,
        list: NeighView,
        f: &mut [Vec3],
    ) -> Result<(), ConfigError> {
        let p = self.ready_params()?;
        let cut = self.ready_respa()?;
        let nall = atoms.nall();
        let nlocal = atoms.nlocal;
        let cut_in_off_sq = cut.inner_off().powi(2);
        let cut_in_on_sq = cut.inner_on().powi(2);
        let cut_out_on_sq = cut.outer_on().powi(2);
        let cut_out_off_sq = cut.outer_off().powi(2);

        let per_atom = |i: usize, f: &mut [Vec3], _: &mut EnergyVirial| {
            let qtmp = atoms.charges[i];
            let xi = atoms.posits[i];
            let itype = atoms.types[i];
            let mut fi = Vec3::new_zero();

            for &jraw in list.neighbors(i) {
                let (j, group) = decode_neighbor(jraw, nall);
                let del = xi - atoms.posits[j];
                let rsq = del.magnitude_squared();
                if rsq >= cut_out_off_sq || rsq <= cut_in_off_sq {
                    continue;
                }

                let mut fpair = self.bare_pair(p, rsq, qtmp * atoms.charges[j], itype, atoms.types[j], group);
                if rsq < cut_in_on_sq {
                    fpair *= switch_on(cut.inner_frac(rsq.sqrt()));
                }
                if rsq > cut_out_on_sq {
                    fpair *= switch_off(cut.outer_frac(rsq.sqrt()));
                }

                fi += del * fpair;
                if self.newton_pair || j < nlocal {
                    f[j] -= del * fpair;
                }
            }
            f[i] += fi;
        };

        self.run_threads(nall, list, f, per_atom);
        Ok(())
    }

    /// Bare Coulomb plus LJ `fpair`, with special-bond factors, for the inner and middle levels.
    fn bare_pair(&self, p: &PairParams, rsq: f64, qiqj: f64, itype: usize, jtype: usize, group: usize) -> f64 {
        let r2inv = 1. / rsq;
        let forcecoul = self.special.coul[group] * self.qqrd2e * qiqj * r2inv.sqrt();

        let ij = p.idx(itype, jtype);
        let forcelj = if rsq < p.cut_ljsq[ij] {
            let r6inv = r2inv * r2inv * r2inv;
            r6inv * (p.lj1[ij] * r6inv - p.lj2[ij])
        } else {
            0.
        };

        (forcecoul + self.special.lj[group] * forcelj) * r2inv
    }

    /// Outermost RESPA level: Ewald minus bare Coulomb, with bare Coulomb and LJ switched on over
    /// `[c2, c3]`. Energy is the full pair energy; the virial uses the full, unswitched force.
    pub fn compute_outer(
        &self,
        mode: EvalMode,
        atoms: &AtomView,
        list: NeighView,
        f: &mut [Vec3],
    ) -> Result<EnergyVirial, ConfigError> {
        let p = self.ready_params()?;
        let cut = self.ready_respa()?;
        let nall = atoms.nall();
        let nlocal = atoms.nlocal;
        let cut_in_off_sq = cut.outer_on().powi(2);
        let cut_in_on_sq = cut.outer_off().powi(2);

        let table: Option<(&EwaldTable, &RespaColumns)> = self
            .table
            .as_ref()
            .and_then(|t| t.respa.as_ref().map(|cols| (t, cols)));

        let per_atom = |i: usize, f: &mut [Vec3], ev: &mut EnergyVirial| {
            let qtmp = atoms.charges[i];
            let xi = atoms.posits[i];
            let itype = atoms.types[i];
            let mut fi = Vec3::new_zero();

            for &jraw in list.neighbors(i) {
                let (j, group) = decode_neighbor(jraw, nall);
                let factor_coul = self.special.coul[group];
                let factor_lj = self.special.lj[group];

                let del = xi - atoms.posits[j];
                let rsq = del.magnitude_squared();
                let ij = p.idx(itype, atoms.types[j]);

                if rsq >= p.cutsq[ij] {
                    continue;
                }
                let r2inv = 1. / rsq;
                let r6inv = r2inv * r2inv * r2inv;
                let qiqj = qtmp * atoms.charges[j];
                let special_coul = 1. - factor_coul;

                // Outer-level Coulomb force, and the full force and energy for tallies.
                let mut forcecoul = 0.;
                let mut full = Coul::default();

                if rsq < self.cut_coulsq {
                    match table.filter(|(t, _)| rsq > t.tabinnersq) {
                        Some((t, cols)) => {
                            let lk = t.lookup(rsq);
                            forcecoul = qiqj * t.force.at(lk);
                            if factor_coul < 1. {
                                forcecoul -= special_coul * qiqj * t.coul.at(lk);
                            }

                            if mode.tallies() {
                                let bare = qiqj * cols.bare.at(lk);
                                full.force = qiqj * cols.virial.at(lk);
                                full.energy = qiqj * t.energy.at(lk);
                                if factor_coul < 1. {
                                    full.force -= special_coul * bare;
                                    full.energy -= special_coul * bare;
                                }
                            }
                        }
                        None => {
                            let r = rsq.sqrt();
                            let grij = self.g_ewald * r;
                            let expm2 = (-grij * grij).exp();
                            let erfc = erfc_poly(grij, expm2);
                            let prefactor = self.qqrd2e * qiqj / r;

                            forcecoul = prefactor * (erfc + EWALD_F * grij * expm2 - 1.);
                            if rsq > cut_in_off_sq {
                                let s = if rsq < cut_in_on_sq {
                                    switch_on(cut.outer_frac(r))
                                } else {
                                    1.
                                };
                                forcecoul += prefactor * s;
                                if factor_coul < 1. {
                                    forcecoul -= special_coul * prefactor * s;
                                }
                            }

                            full.force = prefactor * (erfc + EWALD_F * grij * expm2);
                            full.energy = prefactor * erfc;
                            if factor_coul < 1. {
                                full.force -= special_coul * prefactor;
                                full.energy -= special_coul * prefactor;
                            }
                        }
                    }
                }

                let in_lj = rsq < p.cut_ljsq[ij];
                let forcelj_full = if in_lj {
                    r6inv * (p.lj1[ij] * r6inv - p.lj2[ij])
                } else {
                    0.
                };
                let forcelj = if in_lj && rsq > cut_in_off_sq {
                    if rsq < cut_in_on_sq {
                        forcelj_full * switch_on(cut.outer_frac(rsq.sqrt()))
                    } else {
                        forcelj_full
                    }
                } else {
                    0.
                };

                let fpair = (forcecoul + factor_lj * forcelj) * r2inv;

                fi += del * fpair;
                if self.newton_pair || j < nlocal {
                    f[j] -= del * fpair;
                }

                if mode.tallies() {
                    let evdwl = if in_lj {
                        factor_lj * (r6inv * (p.lj3[ij] * r6inv - p.lj4[ij]) - p.offset[ij])
                    } else {
                        0.
                    };
                    let fpair_virial = if mode.virial() {
                        (full.force + factor_lj * forcelj_full) * r2inv
                    } else {
                        fpair
                    };

                    ev.tally(
                        mode.energy(),
                        mode.virial(),
                        i < nlocal,
                        j < nlocal,
                        self.newton_pair,
                        evdwl,
                        full.energy,
                        fpair_virial,
                        del,
                    );
                }
            }
            f[i] += fi;
        };

        Ok(self.run_threads(nall, list, f, per_atom))
    }

    /// Energy and `fpair` for a single pair, outside of any neighbor list.
    #[allow(clippy::too_many_arguments)]
    pub fn single(
        &self,
        qi: f64,
        qj: f64,
        itype: usize,
        jtype: usize,
        rsq: f64,
        factor_coul: f64,
        factor_lj: f64,
    ) -> Result<(f64, f64), ConfigError> {
        let p = self.ready_params()?;
        let ij = p.idx(itype, jtype);
        let r2inv = 1. / rsq;

        let coul = if rsq < self.cut_coulsq {
            self.coul_full(rsq, qi * qj, factor_coul, true)
        } else {
            Coul::default()
        };

        let mut eng = coul.energy;
        let mut forcelj = 0.;
        if rsq < p.cut_ljsq[ij] {
            let r6inv = r2inv * r2inv * r2inv;
            forcelj = r6inv * (p.lj1[ij] * r6inv - p.lj2[ij]);
            eng += factor_lj * (r6inv * (p.lj3[ij] * r6inv - p.lj4[ij]) - p.offset[ij]);
        }

        let fforce = (coul.force + factor_lj * forcelj) * r2inv;
        Ok((eng, fforce))
    }

    /// Settings, then per-pair records.
    pub fn write_restart(&self, w: &mut impl Write) -> Result<(), ConfigError> {
        self.settings.write_restart(w)?;
        self.ready_params()?.write_restart(w)?;
        Ok(())
    }

    /// Rank 0 reads from `reader`; every rank receives the same settings and coefficients.
    pub fn read_restart(
        &mut self,
        comm: &dyn Communicator,
        reader: Option<&mut dyn Read>,
    ) -> Result<(), ConfigError> {
        let mut bytes = Vec::new();

        if comm.rank() == 0 {
            let mut reader = reader.ok_or_else(|| {
                ConfigError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "rank 0 needs a restart reader",
                ))
            })?;

            let settings = PairSettings::read_restart(&mut reader, self.settings.tail_flag)?;
            let params = PairParams::read_restart(&mut reader, self.ntypes)?;
            settings.write_restart(&mut bytes)?;
            params.write_restart(&mut bytes)?;
        }

        comm.broadcast(0, &mut bytes);

        let mut slice = bytes.as_slice();
        self.settings = PairSettings::read_restart(&mut slice, self.settings.tail_flag)?;
        self.params = Some(PairParams::read_restart(&mut slice, self.ntypes)?);
        Ok(())
    }

    pub fn memory_usage(&self) -> usize {
        self.params.as_ref().map_or(0, PairParams::memory_usage)
            + self.table.as_ref().map_or(0, EwaldTable::memory_usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{comm::SelfComm, neighbors::NeighList};

    fn pair(nthreads: usize, tables: bool) -> PairLjCutCoulLong {
        let settings = PairSettings::new(8., Some(10.)).unwrap();
        let mut p = PairLjCutCoulLong::new(2, nthreads, settings).unwrap();
        p.coeff("*", "*", 0.2, 3.0, None).unwrap();
        p.coeff("2", "2", 0.1, 2.5, None).unwrap();
        if !tables {
            p.ncoultablebits = 0;
        }
        p
    }

    fn init(p: &mut PairLjCutCoulLong, respa: Option<RespaCutoffs>) {
        let comm = SelfComm::with_name("n");
        let ctx = InitContext {
            has_charge: true,
            g_ewald: Some(0.25),
            respa,
            types: &[],
            comm: &comm,
        };
        p.init(&ctx).unwrap();
    }

    #[test]
    fn init_requires_charge_and_kspace() {
        let comm = SelfComm::with_name("n");
        let mut p = pair(1, true);

        let mut ctx = InitContext {
            has_charge: false,
            g_ewald: Some(0.25),
            respa: None,
            types: &[],
            comm: &comm,
        };
        assert!(matches!(p.init(&ctx), Err(ConfigError::MissingCharge)));

        ctx.has_charge = true;
        ctx.g_ewald = None;
        assert!(matches!(p.init(&ctx), Err(ConfigError::IncompatibleKspace)));

        ctx.g_ewald = Some(0.25);
        assert_eq!(p.init(&ctx).unwrap(), 10.);
    }

    #[test]
    fn eval_mode_flags() {
        assert_eq!(EvalMode::new(true, true), EvalMode::ForceEnergyVirial);
        assert!(!EvalMode::Force.tallies());
        assert!(EvalMode::ForceVirial.virial() && !EvalMode::ForceVirial.energy());
    }

    #[test]
    fn single_matches_compute() {
        let mut p = pair(2, true);
        init(&mut p, None);

        let posits = vec![Vec3::new(0., 0., 0.), Vec3::new(3.3, 0.4, -0.2)];
        let charges = [0.5, -0.8];
        let types = [1, 2];
        let atoms = AtomView::new(&posits, &charges, &types, 2);
        let list = NeighList::build_half(&posits, 2, 12., &[]);

        let mut f = vec![Vec3::new_zero(); 2];
        let ev = p
            .compute(EvalMode::ForceEnergy, &atoms, list.view(), &mut f)
            .unwrap();

        let rsq = (posits[0] - posits[1]).magnitude_squared();
        let (eng, fforce) = p.single(0.5, -0.8, 1, 2, rsq, 1., 1.).unwrap();

        assert!((ev.total_energy() - eng).abs() < 1e-12 * eng.abs());
        let del = posits[0] - posits[1];
        assert!((f[0].x - del.x * fforce).abs() < 1e-12 * fforce.abs());
        // Newton's third law.
        assert!((f[0].y + f[1].y).abs() < 1e-14);
    }

    #[test]
    fn special_bonds_scale_pairs() {
        let mut p = pair(1, false);
        p.special = SpecialFactors::new([0., 0., 0.5], [0., 0., 0.5]);
        init(&mut p, None);

        let posits = vec![Vec3::new(0., 0., 0.), Vec3::new(3.5, 0., 0.)];
        let charges = [1., 1.];
        let types = [1, 1];
        let atoms = AtomView::new(&posits, &charges, &types, 2);

        let plain = NeighList::build_half(&posits, 2, 12., &[]);
        let bonded = NeighList::build_half(&posits, 2, 12., &[(0, 1, 3)]);

        let mut f_plain = vec![Vec3::new_zero(); 2];
        let mut f_bonded = vec![Vec3::new_zero(); 2];
        p.compute(EvalMode::Force, &atoms, plain.view(), &mut f_plain).unwrap();
        p.compute(EvalMode::Force, &atoms, bonded.view(), &mut f_bonded).unwrap();

        let rsq = 3.5 * 3.5;
        let (_, f_half) = p.single(1., 1., 1, 1, rsq, 0.5, 0.5).unwrap();
        assert!((f_bonded[0].x - (-3.5) * f_half).abs() < 1e-12 * f_half.abs());
        assert!(f_plain[0].x != f_bonded[0].x);
    }

    #[test]
    fn ghost_reaction_needs_newton() {
        let mut p = pair(1, false);
        p.newton_pair = false;
        init(&mut p, None);

        // Atom 1 is a ghost.
        let posits = vec![Vec3::new(0., 0., 0.), Vec3::new(4., 0., 0.)];
        let charges = [0., 0.];
        let types = [1, 1];
        let atoms = AtomView::new(&posits, &charges, &types, 1);
        let list = NeighList::build_half(&posits, 1, 12., &[]);

        let mut f = vec![Vec3::new_zero(); 2];
        let ev = p.compute(EvalMode::ForceEnergy, &atoms, list.view(), &mut f).unwrap();
        assert!(f[0].x != 0.);
        assert_eq!(f[1].x, 0.);

        let (eng, _) = p.single(0., 0., 1, 1, 16., 1., 1.).unwrap();
        assert!((ev.evdwl - 0.5 * eng).abs() < 1e-15);
    }

    #[test]
    fn restart_round_trip() {
        let mut p = pair(1, true);
        p.settings.offset_flag = true;

        let mut bytes = Vec::new();
        p.write_restart(&mut bytes).unwrap();

        let mut q = PairLjCutCoulLong::new(2, 1, PairSettings::new(1., None).unwrap()).unwrap();
        let comm = SelfComm::with_name("n");
        let mut reader = bytes.as_slice();
        q.read_restart(&comm, Some(&mut reader)).unwrap();

        assert_eq!(q.settings.cut_lj_global, 8.);
        assert_eq!(q.cut_coul(), 10.);
        assert!(q.settings.offset_flag);
        let params = q.params().unwrap();
        assert_eq!(params.sigma[params.idx(2, 2)], 2.5);
    }

    #[test]
    fn coefficient_errors() {
        let mut p = pair(1, true);
        assert!(p.coeff("3", "1", 0.1, 1., None).is_err());
        assert!(p.coeff("2", "1", 0.1, 1., None).is_err()); // no i <= j pairs
        assert!(p.set_cutoffs(-1., None).is_err());
    }
}
