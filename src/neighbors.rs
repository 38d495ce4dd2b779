//! Neighbor list references consumed by the pair kernels.
//!
//! The list is built elsewhere; we only read it. A neighbor index `j >= nall` is not an atom: it
//! encodes special-bond group `j / nall` for atom `j % nall`.

use std::collections::HashMap;

use lin_alg::f64::Vec3;

/// Scale factors for bonded neighbors. Index 0 is unused by encoded neighbors, and is 1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpecialFactors {
    pub coul: [f64; 4],
    pub lj: [f64; 4],
}

impl SpecialFactors {
    /// Factors for 1-2, 1-3, and 1-4 neighbors.
    pub fn new(coul: [f64; 3], lj: [f64; 3]) -> Self {
        Self {
            coul: [1., coul[0], coul[1], coul[2]],
            lj: [1., lj[0], lj[1], lj[2]],
        }
    }
}

impl Default for SpecialFactors {
    fn default() -> Self {
        Self::new([0.; 3], [0.; 3])
    }
}

#[inline]
pub fn encode_special(j: usize, group: usize, nall: usize) -> usize {
    j + group * nall
}

/// Returns `(atom, group)`; group 0 means an ordinary neighbor.
#[inline]
pub fn decode_neighbor(j: usize, nall: usize) -> (usize, usize) {
    if j < nall {
        (j, 0)
    } else {
        (j % nall, j / nall)
    }
}

/// Owned-atom list, plus per-atom neighbor indices.
#[derive(Clone, Debug, Default)]
pub struct NeighList {
    pub ilist: Vec<usize>,
    /// Indexed by atom, not by position in `ilist`.
    pub firstneigh: Vec<Vec<usize>>,
}

/// A borrowed slice of a neighbor list: a subset of its owned atoms.
#[derive(Clone, Copy, Debug)]
pub struct NeighView<'a> {
    pub ilist: &'a [usize],
    pub firstneigh: &'a [Vec<usize>],
}

impl<'a> NeighView<'a> {
    pub fn inum(&self) -> usize {
        self.ilist.len()
    }

    pub fn neighbors(&self, i: usize) -> &'a [usize] {
        self.firstneigh.get(i).map(Vec::as_slice).unwrap_or_default()
    }
}

impl NeighList {
    pub fn view(&self) -> NeighView<'_> {
        NeighView {
            ilist: &self.ilist,
            firstneigh: &self.firstneigh,
        }
    }

    pub fn inum(&self) -> usize {
        self.ilist.len()
    }

    pub fn num_pairs(&self) -> usize {
        self.firstneigh.iter().map(Vec::len).sum()
    }

    /// Brute-force half list: each pair within `cutoff` once, from its lower index, with owned atoms
    /// as the `i` side. `specials` holds `(i, j, group)` for bonded pairs, in either order.
    pub fn build_half(
        posits: &[Vec3],
        nlocal: usize,
        cutoff: f64,
        specials: &[(usize, usize, usize)],
    ) -> Self {
        let nall = posits.len();
        let cutsq = cutoff * cutoff;

        let mut special_map = HashMap::new();
        for &(a, b, group) in specials {
            special_map.insert((a.min(b), a.max(b)), group);
        }

        let mut firstneigh = vec![Vec::new(); nlocal];
        for (i, neighbors) in firstneigh.iter_mut().enumerate() {
            for j in i + 1..nall {
                if (posits[i] - posits[j]).magnitude_squared() >= cutsq {
                    continue;
                }
                match special_map.get(&(i, j)) {
                    // Group 0 is "excluded entirely"; those pairs are never listed.
                    Some(0) => (),
                    Some(&group) => neighbors.push(encode_special(j, group, nall)),
                    None => neighbors.push(j),
                }
            }
        }

        Self {
            ilist: (0..nlocal).collect(),
            firstneigh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_encoding() {
        let nall = 10;
        assert_eq!(decode_neighbor(3, nall), (3, 0));
        assert_eq!(decode_neighbor(encode_special(3, 2, nall), nall), (3, 2));
        assert_eq!(decode_neighbor(encode_special(9, 3, nall), nall), (9, 3));
    }

    #[test]
    fn half_list() {
        let posits = vec![
            Vec3::new(0., 0., 0.),
            Vec3::new(1., 0., 0.),
            Vec3::new(5., 0., 0.),
            Vec3::new(0., 1.5, 0.), // ghost
        ];
        let list = NeighList::build_half(&posits, 3, 2., &[(1, 0, 2)]);

        assert_eq!(list.inum(), 3);
        assert_eq!(list.firstneigh[0], vec![encode_special(1, 2, 4), 3]);
        assert_eq!(list.firstneigh[1], vec![3]);
        assert!(list.firstneigh[2].is_empty());
        assert_eq!(list.num_pairs(), 3);
    }
}
