//! Engine configuration: accelerator placement, the host/accelerator split, and the pair style's
//! cutoffs and coefficients. Saved to disk with Bincode.

use std::{io, path::Path};

use bincode::{Decode, Encode};

use crate::{
    device::{GpuMode, Precision},
    error::ConfigError,
    neighbors::SpecialFactors,
    pair::PairLjCutCoulLong,
    params::{MixRule, PairSettings},
    respa::RespaCutoffs,
    split::WorkSplit,
    util,
};

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct EngineConfig {
    pub first_device: usize,
    pub last_device: usize,
    pub gpu_mode: GpuMode,
    pub precision: Precision,
    /// Host share of the owned atoms. Outside (0, 1), the accelerator takes all of them.
    pub particle_split: f64,
    pub nthreads: usize,
    /// 0 uses the device's suggestion.
    pub threads_per_atom: usize,

    pub cut_lj: f64,
    /// Defaults to `cut_lj`.
    pub cut_coul: Option<f64>,
    /// Ewald splitting parameter, normally set by the long-range solver.
    pub g_ewald: f64,
    /// 0 disables the Coulomb lookup table.
    pub ncoultablebits: u32,
    pub tabinner: f64,
    pub special_coul: [f64; 3],
    pub special_lj: [f64; 3],
    pub respa: Option<RespaCutoffs>,
    pub newton_pair: bool,
    pub mix: MixRule,
    pub offset_flag: bool,
    pub tail_flag: bool,
    /// (epsilon, sigma) for each atom type, starting at type 1.
    pub types: Vec<(f64, f64)>,

    /// Demo system: a jittered cubic lattice of `lattice_cells³` atoms.
    pub lattice_cells: usize,
    pub lattice_spacing: f64,
    pub jitter: f64,
    pub num_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            first_device: 0,
            last_device: 0,
            gpu_mode: GpuMode::Force,
            precision: Precision::Mixed,
            particle_split: 0.3,
            nthreads: 4,
            threads_per_atom: 0,
            cut_lj: 10.,
            cut_coul: None,
            g_ewald: 0.28,
            ncoultablebits: 12,
            tabinner: 2_f64.sqrt(),
            special_coul: [0., 0., 0.5],
            special_lj: [0., 0., 0.5],
            respa: None,
            newton_pair: true,
            mix: MixRule::Geometric,
            offset_flag: false,
            tail_flag: true,
            // Water-like O and H.
            types: vec![(0.1553, 3.166), (0.0, 1.0)],
            lattice_cells: 8,
            lattice_spacing: 3.1,
            jitter: 0.3,
            num_steps: 5,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> io::Result<Self> {
        util::load(path)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        util::save(path, self)
    }

    pub fn ntypes(&self) -> usize {
        self.types.len()
    }

    pub fn split(&self) -> WorkSplit {
        WorkSplit::new(self.particle_split)
    }

    /// Decoded cutoffs skip validation; this re-checks them.
    pub fn respa(&self) -> Result<Option<RespaCutoffs>, ConfigError> {
        self.respa
            .map(|r| RespaCutoffs::new(r.as_array()))
            .transpose()
    }

    pub fn pair_settings(&self) -> Result<PairSettings, ConfigError> {
        let mut settings = PairSettings::new(self.cut_lj, self.cut_coul)?;
        settings.offset_flag = self.offset_flag;
        settings.mix = self.mix;
        settings.tail_flag = self.tail_flag;
        Ok(settings)
    }

    /// A pair style with per-type coefficients set; cross terms are mixed at `init`.
    pub fn build_pair(&self) -> Result<PairLjCutCoulLong, ConfigError> {
        let mut pair = PairLjCutCoulLong::new(self.ntypes(), self.nthreads, self.pair_settings()?)?;
        pair.special = SpecialFactors::new(self.special_coul, self.special_lj);
        pair.newton_pair = self.newton_pair;
        pair.ncoultablebits = self.ncoultablebits;
        pair.tabinner = self.tabinner;

        for (i, &(epsilon, sigma)) in self.types.iter().enumerate() {
            let t = (i + 1).to_string();
            pair.coeff(&t, &t, epsilon, sigma, None)?;
        }
        Ok(pair)
    }
}
