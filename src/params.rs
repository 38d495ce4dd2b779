//! Per-type-pair Lennard-Jones parameters: explicit coefficients, mixing for unset pairs, derived
//! force and energy coefficients, tail corrections, and the binary restart records.
//!
//! Types are 1-based. Tables are `(ntypes + 1)²`, so `(i, j)` indexes directly; row and column 0
//! are unused.

use std::{
    f64::consts::PI,
    io::{self, Read, Write},
};

use bincode::{Decode, Encode};

use crate::{error::ConfigError, respa::RespaCutoffs};

/// How epsilon, sigma and the LJ cutoff are mixed for pairs without explicit coefficients.
#[derive(Clone, Copy, Debug, PartialEq, Default, Encode, Decode)]
pub enum MixRule {
    #[default]
    Geometric,
    Arithmetic,
    SixthPower,
}

impl MixRule {
    pub fn energy(self, eps1: f64, eps2: f64, sig1: f64, sig2: f64) -> f64 {
        match self {
            Self::Geometric | Self::Arithmetic => (eps1 * eps2).sqrt(),
            Self::SixthPower => {
                2. * (eps1 * eps2).sqrt() * sig1.powi(3) * sig2.powi(3)
                    / (sig1.powi(6) + sig2.powi(6))
            }
        }
    }

    pub fn distance(self, sig1: f64, sig2: f64) -> f64 {
        match self {
            Self::Geometric => (sig1 * sig2).sqrt(),
            Self::Arithmetic => 0.5 * (sig1 + sig2),
            Self::SixthPower => (0.5 * (sig1.powi(6) + sig2.powi(6))).powf(1. / 6.),
        }
    }

    /// Integer code stored in restart files.
    pub fn code(self) -> i32 {
        match self {
            Self::Geometric => 0,
            Self::Arithmetic => 1,
            Self::SixthPower => 2,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, ConfigError> {
        match code {
            0 => Ok(Self::Geometric),
            1 => Ok(Self::Arithmetic),
            2 => Ok(Self::SixthPower),
            _ => Err(ConfigError::IllegalArgument(format!("mix flag {code}"))),
        }
    }
}

/// An inclusive, 1-based range of atom types: `"2"`, `"*"`, `"1*3"`, `"2*"`, or `"*4"`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TypeRange {
    pub lo: usize,
    pub hi: usize,
}

impl TypeRange {
    pub fn parse(s: &str, ntypes: usize) -> Result<Self, ConfigError> {
        let num = |t: &str| {
            t.parse::<usize>()
                .map_err(|_| ConfigError::IllegalArgument(format!("Invalid type range: {s}")))
        };

        let (lo, hi) = match s.split_once('*') {
            None => {
                let n = num(s)?;
                (n, n)
            }
            Some((a, b)) => {
                let lo = if a.is_empty() { 1 } else { num(a)? };
                let hi = if b.is_empty() { ntypes } else { num(b)? };
                (lo, hi)
            }
        };

        if lo < 1 || hi > ntypes || lo > hi {
            return Err(ConfigError::IllegalArgument(format!(
                "Numeric index {s} is out of bounds (1-{ntypes})"
            )));
        }
        Ok(Self { lo, hi })
    }
}

/// Global settings. These are written before the per-pair records in restart files.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PairSettings {
    pub cut_lj_global: f64,
    pub cut_coul: f64,
    pub offset_flag: bool,
    pub mix: MixRule,
    pub tail_flag: bool,
}

impl PairSettings {
    pub fn new(cut_lj_global: f64, cut_coul: Option<f64>) -> Result<Self, ConfigError> {
        let cut_coul = cut_coul.unwrap_or(cut_lj_global);
        if cut_lj_global <= 0. || cut_coul <= 0. {
            return Err(ConfigError::IllegalArgument(
                "Illegal pair_style command: cutoffs must be positive".to_owned(),
            ));
        }

        Ok(Self {
            cut_lj_global,
            cut_coul,
            offset_flag: false,
            mix: MixRule::default(),
            tail_flag: false,
        })
    }

    pub fn write_restart(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&self.cut_lj_global.to_ne_bytes())?;
        w.write_all(&self.cut_coul.to_ne_bytes())?;
        w.write_all(&(self.offset_flag as i32).to_ne_bytes())?;
        w.write_all(&self.mix.code().to_ne_bytes())
    }

    /// Tail correction is not part of the record; it's taken from `tail_flag`.
    pub fn read_restart(r: &mut impl Read, tail_flag: bool) -> Result<Self, ConfigError> {
        let cut_lj_global = read_f64(r)?;
        let cut_coul = read_f64(r)?;
        let offset_flag = read_i32(r)? != 0;
        let mix = MixRule::from_code(read_i32(r)?)?;

        Ok(Self {
            cut_lj_global,
            cut_coul,
            offset_flag,
            mix,
            tail_flag,
        })
    }
}

fn read_f64(r: &mut impl Read) -> io::Result<f64> {
    let mut buf = [0; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_ne_bytes(buf))
}

fn read_i32(r: &mut impl Read) -> io::Result<i32> {
    let mut buf = [0; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

/// Tail-correction contribution of one type pair, from the global type counts.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Tail {
    pub etail: f64,
    pub ptail: f64,
}

#[derive(Clone, Debug)]
pub struct PairParams {
    ntypes: usize,
    pub setflag: Vec<bool>,
    pub epsilon: Vec<f64>,
    pub sigma: Vec<f64>,
    pub cut_lj: Vec<f64>,
    pub cut_ljsq: Vec<f64>,
    /// Combined LJ/Coulomb cutoff, squared.
    pub cutsq: Vec<f64>,
    pub lj1: Vec<f64>,
    pub lj2: Vec<f64>,
    pub lj3: Vec<f64>,
    pub lj4: Vec<f64>,
    pub offset: Vec<f64>,
}

impl PairParams {
    pub fn new(ntypes: usize) -> Self {
        let n = (ntypes + 1) * (ntypes + 1);
        Self {
            ntypes,
            setflag: vec![false; n],
            epsilon: vec![0.; n],
            sigma: vec![0.; n],
            cut_lj: vec![0.; n],
            cut_ljsq: vec![0.; n],
            cutsq: vec![0.; n],
            lj1: vec![0.; n],
            lj2: vec![0.; n],
            lj3: vec![0.; n],
            lj4: vec![0.; n],
            offset: vec![0.; n],
        }
    }

    pub fn ntypes(&self) -> usize {
        self.ntypes
    }

    #[inline]
    pub fn idx(&self, i: usize, j: usize) -> usize {
        i * (self.ntypes + 1) + j
    }

    /// Sets coefficients for every `i <= j` pair in the ranges. Returns the number of pairs set.
    pub fn coeff(
        &mut self,
        irange: TypeRange,
        jrange: TypeRange,
        epsilon: f64,
        sigma: f64,
        cut_lj: f64,
    ) -> Result<usize, ConfigError> {
        let mut count = 0;
        for i in irange.lo..=irange.hi {
            for j in jrange.lo.max(i)..=jrange.hi {
                let ij = self.idx(i, j);
                self.epsilon[ij] = epsilon;
                self.sigma[ij] = sigma;
                self.cut_lj[ij] = cut_lj;
                self.setflag[ij] = true;
                count += 1;
            }
        }

        if count == 0 {
            return Err(ConfigError::IncorrectCoeffs);
        }
        Ok(count)
    }

    /// Resets the LJ cutoff of explicitly set pairs, after a settings change.
    pub fn reset_cutoffs(&mut self, cut_lj_global: f64) {
        for i in 1..=self.ntypes {
            for j in i..=self.ntypes {
                let ij = self.idx(i, j);
                if self.setflag[ij] {
                    self.cut_lj[ij] = cut_lj_global;
                }
            }
        }
    }

    /// Derives coefficients for the `(i, j)` pair and mirrors them to `(j, i)`. Returns the pair's
    /// combined cutoff.
    pub fn init_one(
        &mut self,
        i: usize,
        j: usize,
        settings: &PairSettings,
        respa: Option<&RespaCutoffs>,
    ) -> Result<f64, ConfigError> {
        let ij = self.idx(i, j);
        let ji = self.idx(j, i);

        if !self.setflag[ij] {
            let ii = self.idx(i, i);
            let jj = self.idx(j, j);
            if !self.setflag[ii] || !self.setflag[jj] {
                return Err(ConfigError::CoeffsNotSet);
            }
            let mix = settings.mix;
            self.epsilon[ij] =
                mix.energy(self.epsilon[ii], self.epsilon[jj], self.sigma[ii], self.sigma[jj]);
            self.sigma[ij] = mix.distance(self.sigma[ii], self.sigma[jj]);
            self.cut_lj[ij] = mix.distance(self.cut_lj[ii], self.cut_lj[jj]);
        }

        let eps = self.epsilon[ij];
        let sigma = self.sigma[ij];
        let cut_lj = self.cut_lj[ij];
        let cut = cut_lj.max(settings.cut_coul);

        self.cut_ljsq[ij] = cut_lj * cut_lj;
        self.cutsq[ij] = cut * cut;
        self.lj1[ij] = 48. * eps * sigma.powi(12);
        self.lj2[ij] = 24. * eps * sigma.powi(6);
        self.lj3[ij] = 4. * eps * sigma.powi(12);
        self.lj4[ij] = 4. * eps * sigma.powi(6);

        self.offset[ij] = if settings.offset_flag {
            let ratio = sigma / cut_lj;
            4. * eps * (ratio.powi(12) - ratio.powi(6))
        } else {
            0.
        };

        // Mixed values are mirrored too, so lookups never depend on argument order.
        self.epsilon[ji] = eps;
        self.sigma[ji] = sigma;
        self.cut_lj[ji] = cut_lj;
        self.cut_ljsq[ji] = self.cut_ljsq[ij];
        self.cutsq[ji] = self.cutsq[ij];
        self.lj1[ji] = self.lj1[ij];
        self.lj2[ji] = self.lj2[ij];
        self.lj3[ji] = self.lj3[ij];
        self.lj4[ji] = self.lj4[ij];
        self.offset[ji] = self.offset[ij];

        if let Some(respa) = respa {
            if cut_lj.min(settings.cut_coul) < respa.outer_off() {
                return Err(ConfigError::RespaCutoff);
            }
        }

        Ok(cut)
    }

    /// Long-range LJ correction for the `(i, j)` pair, given the global counts of each type.
    pub fn tail(&self, i: usize, j: usize, count_i: f64, count_j: f64) -> Tail {
        let ij = self.idx(i, j);
        let eps = self.epsilon[ij];
        let sig6 = self.sigma[ij].powi(6);
        let rc3 = self.cut_lj[ij].powi(3);
        let rc6 = rc3 * rc3;
        let rc9 = rc3 * rc6;

        Tail {
            etail: 8. * PI * count_i * count_j * eps * sig6 * (sig6 - 3. * rc6) / (9. * rc9),
            ptail: 16. * PI * count_i * count_j * eps * sig6 * (2. * sig6 - 3. * rc6) / (9. * rc9),
        }
    }

    /// Per-pair restart records: for `i <= j`, row-major, an `i32` flag, then epsilon, sigma and
    /// the LJ cutoff as `f64` when set. Native byte order; there is no format version tag.
    pub fn write_restart(&self, w: &mut impl Write) -> io::Result<()> {
        for i in 1..=self.ntypes {
            for j in i..=self.ntypes {
                let ij = self.idx(i, j);
                w.write_all(&(self.setflag[ij] as i32).to_ne_bytes())?;
                if self.setflag[ij] {
                    w.write_all(&self.epsilon[ij].to_ne_bytes())?;
                    w.write_all(&self.sigma[ij].to_ne_bytes())?;
                    w.write_all(&self.cut_lj[ij].to_ne_bytes())?;
                }
            }
        }
        Ok(())
    }

    pub fn read_restart(r: &mut impl Read, ntypes: usize) -> io::Result<Self> {
        let mut result = Self::new(ntypes);

        for i in 1..=ntypes {
            for j in i..=ntypes {
                let ij = result.idx(i, j);
                result.setflag[ij] = read_i32(r)? != 0;
                if result.setflag[ij] {
                    result.epsilon[ij] = read_f64(r)?;
                    result.sigma[ij] = read_f64(r)?;
                    result.cut_lj[ij] = read_f64(r)?;
                }
            }
        }
        Ok(result)
    }

    pub fn memory_usage(&self) -> usize {
        let n = self.setflag.len();
        11 * n * std::mem::size_of::<f64>() + n * std::mem::size_of::<bool>()
    }
}
