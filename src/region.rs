//! Axis-aligned evaluation regions
use crate::simplex::types::{CornerIndex, NeighborIndex, FLOATING, HIGH};
use crate::Error;
use nalgebra::{SVector, Vector3};

/// An axis-aligned box in `R^N`, with perpendicular coordinates for the
/// degenerate axes when evaluating a 2D region through the 3D evaluator
///
/// The invariant `lower <= upper` holds componentwise; subspace regions pin
/// individual axes so `lower == upper` is valid on any axis.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Region<const N: usize> {
    pub lower: SVector<f64, N>,
    pub upper: SVector<f64, N>,

    /// Coordinates of the `3 - N` perpendicular axes; only the leading
    /// `3 - N` entries are meaningful.
    pub perp: [f64; 3],
}

impl<const N: usize> Region<N> {
    /// Builds a new region with zeroed perpendicular coordinates
    pub fn new(lower: [f64; N], upper: [f64; N]) -> Self {
        Self {
            lower: SVector::from(lower),
            upper: SVector::from(upper),
            perp: [0.0; 3],
        }
    }

    /// Sets the perpendicular coordinates (used when `N < 3`)
    pub fn with_perp(mut self, perp: &[f64]) -> Self {
        for (i, &p) in perp.iter().take(3 - N).enumerate() {
            self.perp[i] = p;
        }
        self
    }

    /// Validates the region, returning the first offending axis
    pub fn check(&self) -> Result<(), Error> {
        for a in 0..N {
            if !(self.lower[a] <= self.upper[a])
                || !self.lower[a].is_finite()
                || !self.upper[a].is_finite()
            {
                return Err(Error::InvalidRegion(a));
            }
        }
        Ok(())
    }

    /// Returns the position of the given corner
    pub fn corner(&self, i: CornerIndex<N>) -> SVector<f64, N> {
        let mut out = SVector::zeros();
        for a in 0..N {
            out[a] = if i.axis(a) { self.upper[a] } else { self.lower[a] };
        }
        out
    }

    /// Returns the given corner as a 3D evaluation point
    pub fn corner3(&self, i: CornerIndex<N>) -> Vector3<f64> {
        self.point3(&self.corner(i))
    }

    /// Promotes an in-region point to a 3D evaluation point
    pub fn point3(&self, p: &SVector<f64, N>) -> Vector3<f64> {
        let mut out = Vector3::zeros();
        for a in 0..N {
            out[a] = p[a];
        }
        for a in N..3 {
            out[a] = self.perp[a - N];
        }
        out
    }

    /// Lower corner as a 3D point (perpendicular axes pinned)
    pub fn lower3(&self) -> Vector3<f64> {
        self.point3(&self.lower)
    }

    /// Upper corner as a 3D point (perpendicular axes pinned)
    pub fn upper3(&self) -> Vector3<f64> {
        self.point3(&self.upper)
    }

    /// Returns the center of the region
    pub fn center(&self) -> SVector<f64, N> {
        (self.lower + self.upper) / 2.0
    }

    /// Returns the child region for the given corner, bisecting every axis
    ///
    /// Corners and subspaces of the parent align exactly with designated
    /// corners and subspaces of its children.
    pub fn child(&self, i: CornerIndex<N>) -> Self {
        let mid = self.center();
        let mut out = *self;
        for a in 0..N {
            if i.axis(a) {
                out.lower[a] = mid[a];
            } else {
                out.upper[a] = mid[a];
            }
        }
        out
    }

    /// Returns the region of the given subspace
    ///
    /// Floating axes keep their extent; fixed axes collapse to the side
    /// selected by the subspace index.
    pub fn subspace(&self, s: NeighborIndex<N>) -> Self {
        let mut out = *self;
        for a in 0..N {
            match s.digit(a) {
                FLOATING => (),
                HIGH => out.lower[a] = out.upper[a],
                _ => out.upper[a] = out.lower[a],
            }
        }
        out
    }

    /// Length of the main diagonal
    pub fn diagonal(&self) -> f64 {
        (self.upper - self.lower).norm()
    }

    /// Checks whether a point is within the region (with tolerance)
    pub fn contains(&self, p: &SVector<f64, N>, tol: f64) -> bool {
        (0..N).all(|a| p[a] >= self.lower[a] - tol && p[a] <= self.upper[a] + tol)
    }
}

////////////////////////////////////////////////////////////////////////////////
