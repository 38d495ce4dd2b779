//! Bit-level views of single-precision floats, used to bucket squared separations into lookup-table
//! bins.
//!
//! This assumes the IEEE-754 binary32 layout: 1 sign bit, 8 exponent bits, and 23 stored mantissa
//! bits. Because squared separations are positive, their bit patterns increase monotonically with
//! their values, so masking off the low mantissa bits yields bins that are geometrically finer at
//! small separations.

use crate::error::ConfigError;

/// Significand bits including the implicit leading one.
pub const MANT_DIG: u32 = 24;
pub const EXP_BITS: u32 = 8;

/// The binary32 bit pattern of `x`, rounded to single precision first.
#[inline]
pub fn bits_of(x: f64) -> u32 {
    (x as f32).to_bits()
}

/// The value of a binary32 bit pattern, widened to double.
#[inline]
pub fn value_of(bits: u32) -> f64 {
    f32::from_bits(bits) as f64
}

/// Table masks for a given inner/outer radius range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bitmap {
    /// Selects the exponent and leading mantissa bits that form the bin index.
    pub mask: u32,
    pub shift: u32,
    /// Bits common to the inner radius squared, outside the mask.
    pub masklo: u32,
    /// Bits common to the outer radius squared, outside the mask.
    pub maskhi: u32,
    pub nbits: u32,
}

impl Bitmap {
    /// Splits `nbits` table bits between exponent and mantissa so that `[inner², outer²]` is
    /// covered.
    pub fn new(inner: f64, outer: f64, nbits: u32) -> Result<Self, ConfigError> {
        if nbits > 32 {
            return Err(ConfigError::Table(
                "Too many total bits for bitmapped lookup table".to_owned(),
            ));
        }
        if inner <= 0. {
            return Err(ConfigError::Table(format!(
                "Table inner cutoff must be positive; got {inner}"
            )));
        }
        if inner >= outer {
            log::warn!("Table inner cutoff >= outer cutoff");
        }

        let inner_sq = inner * inner;
        let mut nlowermin: i32 = 1;
        while !(2_f64.powi(nlowermin) <= inner_sq && 2_f64.powi(nlowermin + 1) > inner_sq) {
            if 2_f64.powi(nlowermin) <= inner_sq {
                nlowermin += 1;
            } else {
                nlowermin -= 1;
            }
        }

        let required_range = outer * outer / 2_f64.powi(nlowermin);
        let mut available_range = 2.;
        let mut nexpbits: i32 = 0;
        while available_range < required_range {
            nexpbits += 1;
            available_range = 2_f64.powf(2_f64.powi(nexpbits));
        }

        let nmantbits = nbits as i32 - nexpbits;

        if nexpbits > EXP_BITS as i32 {
            return Err(ConfigError::Table(
                "Too many exponent bits for lookup table".to_owned(),
            ));
        }
        if nmantbits + 1 > MANT_DIG as i32 {
            return Err(ConfigError::Table(
                "Too many mantissa bits for lookup table".to_owned(),
            ));
        }
        if nmantbits < 3 {
            return Err(ConfigError::Table("Too few bits for lookup table".to_owned()));
        }

        let shift = MANT_DIG - (nmantbits as u32 + 1);
        let mask = (((1_u64 << nbits) - 1) << shift) as u32;

        Ok(Self {
            mask,
            shift,
            masklo: bits_of(inner_sq) & !mask,
            maskhi: bits_of(outer * outer) & !mask,
            nbits,
        })
    }

    pub fn ntable(&self) -> usize {
        1 << self.nbits
    }

    /// Bin holding `rsq`.
    #[inline]
    pub fn index(&self, rsq: f64) -> usize {
        ((bits_of(rsq) & self.mask) >> self.shift) as usize
    }

    /// Bit pattern of bin `i` with the given fill for the bits outside the mask.
    #[inline]
    pub fn pattern(&self, i: usize, fill: u32) -> u32 {
        ((i as u32) << self.shift) | fill
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_layout() {
        // 12 bits over [sqrt(2), 10]: rsq spans [2, 100], needing 3 exponent bits.
        let bm = Bitmap::new(2_f64.sqrt(), 10., 12).unwrap();
        assert_eq!(bm.ntable(), 4096);
        assert_eq!(bm.shift, MANT_DIG - 10);
        assert_eq!(bm.mask.count_ones(), 12);

        // Every rsq in range maps to a distinct, increasing-then-wrapping bin.
        let a = bm.index(2.5);
        let b = bm.index(2.6);
        assert!(b > a);
        assert!(bm.index(99.) < bm.ntable());
    }

    #[test]
    fn bin_pattern_round_trips_its_index() {
        let bm = Bitmap::new(2_f64.sqrt(), 12., 12).unwrap();
        for i in [0, 1, 77, 2048, 4095] {
            let rsq = value_of(bm.pattern(i, bm.masklo));
            assert_eq!(bm.index(rsq), i);
        }
    }

    #[test]
    fn bit_count_errors() {
        assert!(Bitmap::new(2_f64.sqrt(), 10., 4).is_err()); // 1 mantissa bit
        assert!(Bitmap::new(2_f64.sqrt(), 10., 30).is_err()); // 27 mantissa bits
        assert!(Bitmap::new(0., 10., 12).is_err());
    }
}
