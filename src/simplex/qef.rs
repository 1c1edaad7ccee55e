//! Quadratic error functions for feature-preserving vertex placement
//!
//! Each accumulator stores the normal equations of a least-squares system of
//! tangent-plane constraints, plus the sample mass point.  Solving minimizes
//! `|Ax - b|^2` about the mass point, with rank-deficient directions dropped
//! below [`EIGENVALUE_CUTOFF`]; see <https://www.mattkeeter.com/projects/qef>
//! for a walkthrough of QEF math and references to primary sources.
use crate::region::Region;
use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use ordered_float::OrderedFloat;

/// Absolute cutoff applied to the singular values of `A^T A` (which are the
/// squared singular values of `A`); directions below it are excluded and the
/// solve falls back toward the mass point along them.
pub const EIGENVALUE_CUTOFF: f64 = 1e-10;

/// Accumulator for weighted (position, normal, value) samples in N dimensions
///
/// `insert` adds the plane constraint of a sample's linearization; `+=`
/// combines accumulators; [`Qef::sub`] restricts the quadratic form to a
/// subspace; [`Qef::solve_bounded`] minimizes under box constraints.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Qef<const N: usize> {
    /// `A^T A` term
    ata: SMatrix<f64, N, N>,

    /// `A^T b` term
    atb: SVector<f64, N>,

    /// `b^T b` term
    btb: f64,

    /// Sum of sample positions
    mass_point: SVector<f64, N>,

    /// Sum of sample values
    mass_value: f64,

    /// Number of samples accumulated
    samples: u32,
}

impl<const N: usize> Default for Qef<N> {
    fn default() -> Self {
        Self {
            ata: SMatrix::zeros(),
            atb: SVector::zeros(),
            btb: 0.0,
            mass_point: SVector::zeros(),
            mass_value: 0.0,
            samples: 0,
        }
    }
}

impl<const N: usize> std::ops::AddAssign for Qef<N> {
    fn add_assign(&mut self, rhs: Self) {
        self.ata += rhs.ata;
        self.atb += rhs.atb;
        self.btb += rhs.btb;
        self.mass_point += rhs.mass_point;
        self.mass_value += rhs.mass_value;
        self.samples += rhs.samples;
    }
}

impl<const N: usize> Qef<N> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of samples accumulated so far
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Mean sample position, or `None` if the accumulator is empty
    pub fn mean(&self) -> Option<SVector<f64, N>> {
        if self.samples == 0 {
            None
        } else {
            Some(self.mass_point / self.samples as f64)
        }
    }

    /// Adds a sample to the accumulator
    ///
    /// The sample is a point `pos` with function value `value` and gradient
    /// `grad`; it contributes the plane constraint `grad . (x - pos) = -value`
    /// (the zero crossing of the local linearization).  A non-finite gradient
    /// or value drops the constraint, leaving position-only inertia.
    pub fn insert(
        &mut self,
        pos: SVector<f64, N>,
        grad: SVector<f64, N>,
        value: f64,
    ) {
        self.mass_point += pos;
        self.mass_value += if value.is_finite() { value } else { 0.0 };
        self.samples += 1;

        if grad.iter().all(|v| v.is_finite()) && value.is_finite() {
            let b = grad.dot(&pos) - value;
            self.ata += grad * grad.transpose();
            self.atb += grad * b;
            self.btb += b * b;
        }
    }

    /// Substitutes fixed values into the quadratic form
    ///
    /// Axes set in `fix` are eliminated at the coordinates given by `at`:
    /// their rows and columns are zeroed, with the cross terms folded into
    /// `atb` and `btb`.  The residual of the reduced form at a reduced
    /// solution equals the residual of the original at the assembled point.
    fn substitute(&self, fix: u8, at: &SVector<f64, N>) -> Self {
        let mut m = SVector::<f64, N>::zeros();
        for a in 0..N {
            if fix & (1 << a) != 0 {
                m[a] = at[a];
            }
        }
        let mut out = *self;
        out.atb = self.atb - self.ata * m;
        out.btb = self.btb - 2.0 * m.dot(&self.atb) + m.dot(&(self.ata * m));
        for a in 0..N {
            if fix & (1 << a) == 0 {
                continue;
            }
            out.atb[a] = 0.0;
            for b in 0..N {
                out.ata[(a, b)] = 0.0;
                out.ata[(b, a)] = 0.0;
            }
        }
        out
    }

    /// Restricts the quadratic form to the given floating-axis subspace
    ///
    /// The complementary axes are fixed at the mean sample position, which
    /// corresponds to minimizing the same quadratic restricted to that
    /// subspace.  Mass terms are unchanged, so projections of projections
    /// behave consistently.
    pub fn sub(&self, floating: u8) -> Self {
        let Some(mean) = self.mean() else {
            return *self;
        };
        let fix = !floating & ((1u8 << N) - 1);
        self.substitute(fix, &mean)
    }

    /// Evaluates `x^T (A^T A) x - 2 x^T (A^T b) + b^T b` at the given point
    fn residual(&self, pos: &SVector<f64, N>) -> f64 {
        pos.dot(&(self.ata * pos)) - 2.0 * pos.dot(&self.atb) + self.btb
    }

    /// Minimizes the quadratic form within the given region
    ///
    /// `floating` selects the axes being solved; the rest are read from the
    /// (collapsed) region bounds.  The unconstrained minimizer is found about
    /// the mass point with a rank-tolerant min-norm solve; if it escapes the
    /// region, the most-violated axis is pinned to its bound and the solve
    /// recurses in the smaller subspace.  Total on any non-empty region, and
    /// the result is componentwise within `[lower, upper]`.
    pub fn solve_bounded(
        &self,
        region: &Region<N>,
        floating: u8,
    ) -> (SVector<f64, N>, f64) {
        debug_assert!(N <= 3);
        let mut pos = SVector::<f64, N>::zeros();
        for a in 0..N {
            if floating & (1 << a) == 0 {
                pos[a] = region.lower[a];
            }
        }

        if floating != 0 {
            let Some(mean) = self.mean() else {
                // No data at all; fall back to the region center
                let c = region.center();
                for a in 0..N {
                    if floating & (1 << a) != 0 {
                        pos[a] = c[a];
                    }
                }
                return (pos, 0.0);
            };

            // Minimize about the mass point, embedding the system in a fixed
            // 3x3 solve; padded axes have zero singular values and drop out
            // below the cutoff, so this is exactly the reduced solve.
            let mut center = SVector::<f64, N>::zeros();
            for a in 0..N {
                if floating & (1 << a) != 0 {
                    center[a] = mean[a];
                }
            }
            let atb = self.atb - self.ata * center;
            let mut ata3 = Matrix3::zeros();
            let mut atb3 = Vector3::zeros();
            for a in 0..N {
                atb3[a] = atb[a];
                for b in 0..N {
                    ata3[(a, b)] = self.ata[(a, b)];
                }
            }
            let svd = nalgebra::linalg::SVD::new(ata3, true, true);
            let sol = svd
                .solve(&atb3, EIGENVALUE_CUTOFF)
                .unwrap_or_else(|_| Vector3::zeros());
            for a in 0..N {
                if floating & (1 << a) != 0 {
                    pos[a] = center[a] + sol[a];
                }
            }

            // If the minimizer escaped the region, pin the most-violated axis
            // at its bound and re-solve in the smaller subspace.
            let worst = (0..N)
                .filter(|a| floating & (1 << a) != 0)
                .filter_map(|a| {
                    if pos[a] < region.lower[a] {
                        Some((a, region.lower[a], region.lower[a] - pos[a]))
                    } else if pos[a] > region.upper[a] {
                        Some((a, region.upper[a], pos[a] - region.upper[a]))
                    } else {
                        None
                    }
                })
                .max_by_key(|&(_, _, amt)| OrderedFloat(amt));
            if let Some((axis, bound, _)) = worst {
                let mut at = SVector::<f64, N>::zeros();
                at[axis] = bound;
                let pinned = self.substitute(1 << axis, &at);
                let mut sub_region = *region;
                sub_region.lower[axis] = bound;
                sub_region.upper[axis] = bound;
                return pinned.solve_bounded(&sub_region, floating & !(1 << axis));
            }
        }

        let err = self.residual(&pos).max(0.0);
        (pos, err)
    }
}

////////////////////////////////////////////////////////////////////////////////
