//! RESPA cutoff shells and the smoothstep used to blend forces across them.

use bincode::{Decode, Encode};

use crate::error::ConfigError;

/// Four strictly increasing radii: the inner switching window `[c0, c1]` and the outer switching
/// window `[c2, c3]`.
#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct RespaCutoffs {
    cut: [f64; 4],
}

impl RespaCutoffs {
    pub fn new(cut: [f64; 4]) -> Result<Self, ConfigError> {
        if cut[0] <= 0. {
            return Err(ConfigError::RespaOrder(format!(
                "inner cutoff must be positive; got {}",
                cut[0]
            )));
        }
        for w in cut.windows(2) {
            if w[0] >= w[1] {
                return Err(ConfigError::RespaOrder(format!(
                    "cutoffs must increase strictly: {cut:?}"
                )));
            }
        }

        Ok(Self { cut })
    }

    pub fn as_array(&self) -> [f64; 4] {
        self.cut
    }

    pub fn inner_off(&self) -> f64 {
        self.cut[0]
    }

    pub fn inner_on(&self) -> f64 {
        self.cut[1]
    }

    pub fn outer_on(&self) -> f64 {
        self.cut[2]
    }

    pub fn outer_off(&self) -> f64 {
        self.cut[3]
    }

    /// Position of `r` in the inner window, in `[0, 1]` for `c0 <= r <= c1`.
    pub fn inner_frac(&self, r: f64) -> f64 {
        (r - self.cut[0]) / (self.cut[1] - self.cut[0])
    }

    pub fn outer_frac(&self, r: f64) -> f64 {
        (r - self.cut[2]) / (self.cut[3] - self.cut[2])
    }
}

/// Cubic smoothstep, `x² (3 − 2x)`: 0 at 0, 1 at 1, flat at both ends.
#[inline]
pub fn switch_on(x: f64) -> f64 {
    x * x * (3. - 2. * x)
}

/// `1 − switch_on(x)`, written as `1 + x² (2x − 3)`.
#[inline]
pub fn switch_off(x: f64) -> f64 {
    1. + x * x * (2. * x - 3.)
}

#[inline]
pub fn switch_on_deriv(x: f64) -> f64 {
    6. * x * (1. - x)
}
