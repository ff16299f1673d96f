//! Grouped context polynomials.
//!
//! The PSF varies across the detector as a low-order polynomial of the
//! sample "context" (focal-plane position, and optionally further scalars).
//! Context dimensions are partitioned into groups; each group carries its own
//! maximum total degree, and the full basis is the product of the per-group
//! monomial bases. Term 0 is always the constant term.

use nalgebra::{DMatrix, DVector};

use crate::error::PsfError;
use crate::solve::cholesky_solve;

/// Which reduction a [`PolySpec::lowered`] step performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// The last group's degree was lowered by one.
    DegreeLowered(usize),
    /// The last group reached degree zero and was removed together with its
    /// context dimensions.
    GroupRemoved(usize),
}

/// Immutable polynomial specification: context grouping and per-group degree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolySpec {
    /// Group index for each context dimension.
    groups: Vec<usize>,
    /// Maximum total degree for each group.
    degrees: Vec<usize>,
}

impl PolySpec {
    /// Build a specification from a per-dimension group assignment and a
    /// per-group degree list. Group indices must cover `0..degrees.len()`.
    ///
    /// # Panics
    /// Panics if a group index is out of range or a group has no dimensions.
    pub fn new(groups: Vec<usize>, degrees: Vec<usize>) -> Self {
        for &g in &groups {
            assert!(g < degrees.len(), "group index {g} out of range");
        }
        for g in 0..degrees.len() {
            assert!(
                groups.iter().any(|&gi| gi == g),
                "group {g} has no context dimensions"
            );
        }
        Self { groups, degrees }
    }

    /// A zero-dimensional spec: a single constant term.
    pub fn constant() -> Self {
        Self {
            groups: Vec::new(),
            degrees: Vec::new(),
        }
    }

    /// Number of context dimensions.
    pub fn ndim(&self) -> usize {
        self.groups.len()
    }

    /// Number of context groups.
    pub fn ngroup(&self) -> usize {
        self.degrees.len()
    }

    /// Group assignment per context dimension.
    pub fn groups(&self) -> &[usize] {
        &self.groups
    }

    /// Maximum total degree per group.
    pub fn degrees(&self) -> &[usize] {
        &self.degrees
    }

    /// Number of basis coefficients this specification produces.
    pub fn ncoeff(&self) -> usize {
        (0..self.degrees.len())
            .map(|g| {
                let d = self.groups.iter().filter(|&&gi| gi == g).count();
                binomial(self.degrees[g] + d, d)
            })
            .product()
    }

    /// Produce the next-smaller specification: the last group's degree drops
    /// by one, and a group reaching degree zero is removed along with its
    /// context dimensions. Returns `None` when no group is left to reduce.
    pub fn lowered(&self) -> Option<(PolySpec, Reduction)> {
        let last = self.degrees.len().checked_sub(1)?;
        let mut degrees = self.degrees.clone();
        if degrees[last] > 1 {
            degrees[last] -= 1;
            Some((
                PolySpec {
                    groups: self.groups.clone(),
                    degrees,
                },
                Reduction::DegreeLowered(last),
            ))
        } else {
            degrees.pop();
            let groups = self
                .groups
                .iter()
                .copied()
                .filter(|&g| g != last)
                .collect();
            Some((PolySpec { groups, degrees }, Reduction::GroupRemoved(last)))
        }
    }
}

fn binomial(n: usize, k: usize) -> usize {
    let k = k.min(n - k);
    let mut acc = 1usize;
    for i in 0..k {
        acc = acc * (n - i) / (i + 1);
    }
    acc
}

/// A polynomial basis over normalized context positions, with its term
/// exponents expanded once at construction.
#[derive(Debug, Clone)]
pub struct Poly {
    spec: PolySpec,
    /// Exponent vector (one entry per context dimension) for each term.
    /// Term 0 is all zeros.
    terms: Vec<Vec<usize>>,
}

impl Poly {
    pub fn new(spec: PolySpec) -> Self {
        let ndim = spec.ndim();
        // Per-group monomial exponents in graded order, constant first.
        let mut per_group: Vec<Vec<Vec<usize>>> = Vec::with_capacity(spec.ngroup());
        for g in 0..spec.ngroup() {
            let dims: Vec<usize> = (0..ndim).filter(|&d| spec.groups[d] == g).collect();
            per_group.push(group_exponents(&dims, spec.degrees[g], ndim));
        }

        // Cartesian product across groups, earlier groups varying fastest.
        let mut terms: Vec<Vec<usize>> = vec![vec![0; ndim]];
        for group in &per_group {
            let mut next = Vec::with_capacity(terms.len() * group.len());
            for inner in group {
                for outer in &terms {
                    let mut t = outer.clone();
                    for d in 0..ndim {
                        t[d] += inner[d];
                    }
                    next.push(t);
                }
            }
            terms = next;
        }

        Self { spec, terms }
    }

    pub fn spec(&self) -> &PolySpec {
        &self.spec
    }

    pub fn ncoeff(&self) -> usize {
        self.terms.len()
    }

    pub fn ndim(&self) -> usize {
        self.spec.ndim()
    }

    /// Evaluate all basis terms at a normalized position.
    ///
    /// # Panics
    /// Panics if `pos.len()` differs from the context dimensionality.
    pub fn basis(&self, pos: &[f64]) -> Vec<f64> {
        assert_eq!(pos.len(), self.ndim(), "context dimensionality mismatch");
        self.terms
            .iter()
            .map(|exps| {
                exps.iter()
                    .zip(pos)
                    .fold(1.0, |acc, (&e, &p)| acc * p.powi(e as i32))
            })
            .collect()
    }

    /// Basis matrix (one row per position) for a batch of normalized
    /// positions, computed once per fitting pass and shared by every pixel.
    pub fn basis_matrix(&self, positions: &[Vec<f64>]) -> DMatrix<f64> {
        let nc = self.ncoeff();
        let mut m = DMatrix::zeros(positions.len(), nc);
        for (s, pos) in positions.iter().enumerate() {
            for (c, v) in self.basis(pos).into_iter().enumerate() {
                m[(s, c)] = v;
            }
        }
        m
    }

    /// Weighted least-squares fit of one coefficient vector.
    ///
    /// Solves `(B^T W B) c = B^T W y` over the sample axis of `basis`
    /// (shape: nsamples x ncoeff) by Cholesky factorization.
    pub fn fit(
        &self,
        basis: &DMatrix<f64>,
        values: &[f64],
        weights: &[f64],
    ) -> Result<DVector<f64>, PsfError> {
        let nc = self.ncoeff();
        debug_assert_eq!(basis.ncols(), nc);
        debug_assert_eq!(basis.nrows(), values.len());
        debug_assert_eq!(values.len(), weights.len());

        let mut a = DMatrix::zeros(nc, nc);
        let mut rhs = DVector::zeros(nc);
        for s in 0..values.len() {
            let w = weights[s];
            let y = values[s];
            for i in 0..nc {
                let bi = basis[(s, i)];
                rhs[i] += w * y * bi;
                for j in i..nc {
                    a[(i, j)] += w * bi * basis[(s, j)];
                }
            }
        }
        for i in 0..nc {
            for j in 0..i {
                a[(i, j)] = a[(j, i)];
            }
        }
        cholesky_solve(a, &rhs)
    }
}

/// All exponent vectors (over the full dimension space) for one group's
/// monomials with total degree up to `degree`, graded order, constant first.
fn group_exponents(dims: &[usize], degree: usize, ndim: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    for total in 0..=degree {
        let mut partial = vec![0usize; dims.len()];
        compositions(total, 0, &mut partial, &mut |exps: &[usize]| {
            let mut full = vec![0usize; ndim];
            for (i, &d) in dims.iter().enumerate() {
                full[d] = exps[i];
            }
            out.push(full);
        });
    }
    out
}

/// Enumerate all ways to write `remaining` as an ordered sum over
/// `partial[at..]`, invoking `emit` for each complete assignment.
fn compositions(remaining: usize, at: usize, partial: &mut Vec<usize>, emit: &mut impl FnMut(&[usize])) {
    if at + 1 == partial.len() {
        partial[at] = remaining;
        emit(partial);
        return;
    }
    for v in 0..=remaining {
        partial[at] = v;
        compositions(remaining - v, at + 1, partial, emit);
    }
}
