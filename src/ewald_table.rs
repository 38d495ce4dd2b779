//! Linear interpolation tables for the real-space Ewald Coulomb term, bucketed by the bit pattern
//! of the squared separation.
//!
//! Each bin stores the exact value at its representative separation (the lower edge, unless that
//! falls inside the inner radius) and the delta to the next bin. The last bin wraps to bin 0. When
//! the bin holding the largest separations starts below the Coulomb cutoff, its deltas point to an
//! exact value at the cutoff instead, so force and energy have no jump there.

use statrs::function::erf::erfc;

use crate::{
    error::ConfigError,
    float_bits::{value_of, Bitmap},
    respa::{switch_on, RespaCutoffs},
};

// Polynomial approximation of erfc, used on the analytic path.
pub const EWALD_F: f64 = 1.12837917;
pub const EWALD_P: f64 = 0.3275911;
pub const A1: f64 = 0.254829592;
pub const A2: f64 = -0.284496736;
pub const A3: f64 = 1.421413741;
pub const A4: f64 = -1.453152027;
pub const A5: f64 = 1.061405429;

pub const NCOULTABLEBITS_DEFAULT: u32 = 12;

/// erfc(grij), given `expm2 = exp(-grij²)`. Accurate to roughly 1e-7.
#[inline]
pub fn erfc_poly(grij: f64, expm2: f64) -> f64 {
    let t = 1. / (1. + EWALD_P * grij);
    t * (A1 + t * (A2 + t * (A3 + t * (A4 + t * A5)))) * expm2
}

/// Value and delta-to-next-bin for one tabulated quantity.
#[derive(Clone, Debug, Default)]
pub struct TableColumn {
    pub val: Vec<f64>,
    pub delta: Vec<f64>,
}

impl TableColumn {
    fn new(n: usize) -> Self {
        Self {
            val: vec![0.; n],
            delta: vec![0.; n],
        }
    }

    /// Deltas between consecutive bins; the last bin connects to bin 0.
    fn fill_deltas(&mut self) {
        let n = self.val.len();
        for i in 0..n - 1 {
            self.delta[i] = self.val[i + 1] - self.val[i];
        }
        self.delta[n - 1] = self.val[0] - self.val[n - 1];
    }

    #[inline]
    pub fn at(&self, lookup: TableLookup) -> f64 {
        self.val[lookup.index] + lookup.fraction * self.delta[lookup.index]
    }
}

/// Columns only present when RESPA is active.
#[derive(Clone, Debug, Default)]
pub struct RespaColumns {
    /// Full, unswitched force factor, used for the outer-level virial.
    pub virial: TableColumn,
    /// Bare Coulomb `qqrd2e / r`, used to remove special-bond energy.
    pub bare: TableColumn,
}

#[derive(Clone, Copy, Debug)]
pub struct TableLookup {
    pub index: usize,
    pub fraction: f64,
}

/// Exact per-unit-charge-product values at one separation.
#[derive(Clone, Copy, Debug, Default)]
struct Exact {
    force: f64,
    coul: f64,
    energy: f64,
    bare: f64,
    virial: f64,
}

fn exact(rsq: f64, g_ewald: f64, qqrd2e: f64, respa: Option<&RespaCutoffs>) -> Exact {
    let r = rsq.sqrt();
    let grij = g_ewald * r;
    let expm2 = (-grij * grij).exp();
    let derfc = erfc(grij);
    let pre = qqrd2e / r;
    let full = pre * (derfc + EWALD_F * grij * expm2);

    let Some(cut) = respa else {
        return Exact {
            force: full,
            coul: pre,
            energy: pre * derfc,
            ..Default::default()
        };
    };

    // The outer level subtracts bare Coulomb, then switches it back on over [c2, c3].
    let mut result = Exact {
        force: pre * (derfc + EWALD_F * grij * expm2 - 1.),
        coul: 0.,
        energy: pre * derfc,
        bare: pre,
        virial: full,
    };

    if rsq > cut.outer_on().powi(2) {
        if rsq < cut.outer_off().powi(2) {
            let s = switch_on(cut.outer_frac(r));
            result.force += pre * s;
            result.coul = pre * s;
        } else {
            result.force = full;
            result.coul = pre;
        }
    }
    result
}

#[derive(Clone, Debug)]
pub struct EwaldTable {
    pub bitmap: Bitmap,
    /// At or below this squared separation, the analytic form is used instead of the table.
    pub tabinnersq: f64,
    pub rsq: Vec<f64>,
    /// Inverse bin widths.
    pub drsq: Vec<f64>,
    pub force: TableColumn,
    /// Coulomb prefactor removed for special-bond pairs.
    pub coul: TableColumn,
    pub energy: TableColumn,
    pub respa: Option<RespaColumns>,
}

impl EwaldTable {
    pub fn new(
        cut_coul: f64,
        g_ewald: f64,
        qqrd2e: f64,
        tabinner: f64,
        nbits: u32,
        respa: Option<&RespaCutoffs>,
    ) -> Result<Self, ConfigError> {
        let bitmap = Bitmap::new(tabinner, cut_coul, nbits)?;
        let cut_coulsq = cut_coul * cut_coul;
        let tabinnersq = tabinner * tabinner;
        let n = bitmap.ntable();

        let mut rsq = vec![0.; n];
        let mut drsq = vec![0.; n];
        let mut force = TableColumn::new(n);
        let mut coul = TableColumn::new(n);
        let mut energy = TableColumn::new(n);
        let mut respa_cols = respa.map(|_| RespaColumns {
            virial: TableColumn::new(n),
            bare: TableColumn::new(n),
        });

        let mut minrsq = value_of(bitmap.pattern(0, bitmap.maskhi));

        for i in 0..n {
            let mut bits = bitmap.pattern(i, bitmap.masklo);
            if value_of(bits) < tabinnersq {
                bits = bitmap.pattern(i, bitmap.maskhi);
            }
            // The f32 value, square-rooted in double precision.
            let rsq_bin = value_of(bits);
            let v = exact(rsq_bin, g_ewald, qqrd2e, respa);

            rsq[i] = rsq_bin;
            force.val[i] = v.force;
            coul.val[i] = v.coul;
            energy.val[i] = v.energy;
            if let Some(cols) = respa_cols.as_mut() {
                cols.virial.val[i] = v.virial;
                cols.bare.val[i] = v.bare;
            }

            minrsq = minrsq.min(rsq_bin);
        }

        for i in 0..n - 1 {
            drsq[i] = 1. / (rsq[i + 1] - rsq[i]);
        }
        drsq[n - 1] = 1. / (rsq[0] - rsq[n - 1]);

        force.fill_deltas();
        coul.fill_deltas();
        energy.fill_deltas();
        if let Some(cols) = respa_cols.as_mut() {
            cols.virial.fill_deltas();
            cols.bare.fill_deltas();
        }

        // The smallest separation is in bin `itablemin`; the largest, in the bin before it.
        let itablemin = bitmap.index(minrsq);
        let itablemax = if itablemin == 0 { n - 1 } else { itablemin - 1 };

        if value_of(bitmap.pattern(itablemax, bitmap.maskhi)) < cut_coulsq {
            let rsq_cut = cut_coulsq as f32 as f64;
            let v = exact(rsq_cut, g_ewald, qqrd2e, respa);

            drsq[itablemax] = 1. / (rsq_cut - rsq[itablemax]);
            force.delta[itablemax] = v.force - force.val[itablemax];
            coul.delta[itablemax] = v.coul - coul.val[itablemax];
            energy.delta[itablemax] = v.energy - energy.val[itablemax];
            if let Some(cols) = respa_cols.as_mut() {
                cols.virial.delta[itablemax] = v.virial - cols.virial.val[itablemax];
                cols.bare.delta[itablemax] = v.bare - cols.bare.val[itablemax];
            }
        }

        log::debug!(
            "Ewald table built: {n} bins, tabinnersq {minrsq:.6}, itablemin {itablemin}"
        );

        Ok(Self {
            bitmap,
            tabinnersq: minrsq,
            rsq,
            drsq,
            force,
            coul,
            energy,
            respa: respa_cols,
        })
    }

    #[inline]
    pub fn lookup(&self, rsq: f64) -> TableLookup {
        let index = self.bitmap.index(rsq);
        let fraction = (rsq as f32 as f64 - self.rsq[index]) * self.drsq[index];
        TableLookup { index, fraction }
    }

    pub fn ntable(&self) -> usize {
        self.rsq.len()
    }

    pub fn memory_usage(&self) -> usize {
        let ncols = if self.respa.is_some() { 12 } else { 8 };
        ncols * self.ntable() * std::mem::size_of::<f64>()
    }
}
