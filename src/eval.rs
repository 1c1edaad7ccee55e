//! Evaluator capability traits
//!
//! The kernel consumes implicit functions through an opaque capability
//! bundle: interval evaluation (with tape narrowing), batched point and
//! derivative evaluation, and feature queries at non-differentiable points.
//! It never builds evaluators itself; expression trees, tapes, and the
//! machinery behind them live in other crates.
//!
//! Evaluators are thread-*unsafe* by contract: each worker clones its own,
//! sharing only the immutable expression data behind the scenes.  Tapes are
//! explicit values rather than hidden evaluator state because work-stealing
//! construction does not unwind in stack order.
use crate::types::Interval;
use arrayvec::ArrayVec;
use nalgebra::Vector3;
use std::sync::Arc;

/// Number of samples that batched evaluation can process in one pass
pub const ARRAY_SIZE: usize = 256;

/// Maximum number of surface normals reported at a single point
pub const MAX_FEATURES: usize = 16;

/// A function value and its gradient at a sample point
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GradSample {
    pub grad: Vector3<f64>,
    pub value: f64,
}

/// Capability bundle for evaluating an implicit function `f : R^3 -> R`
///
/// 2D regions are evaluated through the same interface, with their
/// perpendicular coordinate supplied by [`Region::point3`](crate::Region).
///
/// Batched calls operate on slots written by [`set`](Evaluator::set); a
/// batch is at most [`ARRAY_SIZE`] samples, and slices returned by `values`
/// / `derivs` / `ambiguous` are valid until the next call on the evaluator.
pub trait Evaluator: Clone + Send {
    /// Handle to a (possibly narrowed) tape for this function
    ///
    /// Interval evaluation may prune clauses that are inactive within a
    /// region; the narrowed handle stays valid for nested regions and is
    /// passed back into every evaluation call.
    type Tape: Clone + Send + Sync;

    /// Returns the unnarrowed tape for the whole function
    fn base_tape(&self) -> Self::Tape;

    /// Evaluates `f` over an axis-aligned box, returning the value range and
    /// a tape narrowed to the clauses active inside the box
    fn interval(
        &mut self,
        lower: Vector3<f64>,
        upper: Vector3<f64>,
        tape: &Self::Tape,
    ) -> (Interval, Self::Tape);

    /// Whether the most recent interval evaluation was arithmetically safe
    ///
    /// Returns `false` after overflow or other floating-point faults; the
    /// caller must then treat the interval result as meaningless.
    fn is_safe(&self) -> bool;

    /// Stores a sample point in the given batch slot
    fn set(&mut self, p: Vector3<f64>, slot: usize);

    /// Evaluates `f` at the first `count` batch slots
    fn values(&mut self, count: usize, tape: &Self::Tape) -> &[f64];

    /// Evaluates `f` and its gradient at the first `count` batch slots
    fn derivs(&mut self, count: usize, tape: &Self::Tape) -> &[GradSample];

    /// Flags batch slots whose derivatives are ambiguous (multiple features
    /// meet at the sample point)
    fn ambiguous(&mut self, count: usize, tape: &Self::Tape) -> &[bool];

    /// Enumerates every one-sided surface normal at a point where the
    /// gradient is ambiguous
    fn features(
        &mut self,
        p: Vector3<f64>,
        tape: &Self::Tape,
    ) -> ArrayVec<Vector3<f64>, MAX_FEATURES>;

    /// Answers a containment query at a point where `f` evaluates to zero
    fn is_inside(&mut self, p: Vector3<f64>, tape: &Self::Tape) -> bool;

    /// Changes a free variable's value, returning `true` if it changed
    ///
    /// Does nothing (and returns `false`) if the variable is not present.
    fn set_var(&mut self, var: u32, value: f64) -> bool;
}

////////////////////////////////////////////////////////////////////////////////

type ValueFn = dyn Fn(Vector3<f64>) -> f64 + Send + Sync;
type GradFn = dyn Fn(Vector3<f64>) -> Vector3<f64> + Send + Sync;
type IntervalFn = dyn Fn(Vector3<f64>, Vector3<f64>) -> Interval + Send + Sync;
type InsideFn = dyn Fn(Vector3<f64>) -> bool + Send + Sync;
type FeaturesFn = dyn Fn(Vector3<f64>) -> ArrayVec<Vector3<f64>, MAX_FEATURES>
    + Send
    + Sync;
type AmbiguousFn = dyn Fn(Vector3<f64>) -> bool + Send + Sync;

/// Closure-backed [`Evaluator`], for tests and simple callers
///
/// Wraps a plain `f : R^3 -> R` with optional analytic gradient, interval,
/// ambiguity, feature, and containment closures.  Missing capabilities fall
/// back to safe defaults: central-difference gradients, an all-spanning
/// interval (which disables pruning and simply subdivides everywhere), no
/// ambiguity, and on-surface points counted as inside.
///
/// ```
/// use trellis::eval::FnShape;
/// let sphere = FnShape::new(|p| p.norm_squared() - 1.0)
///     .with_gradient(|p| 2.0 * p);
/// ```
#[derive(Clone)]
pub struct FnShape {
    f: Arc<ValueFn>,
    grad: Option<Arc<GradFn>>,
    interval_fn: Option<Arc<IntervalFn>>,
    inside_fn: Option<Arc<InsideFn>>,
    features_fn: Option<Arc<FeaturesFn>>,
    ambiguous_fn: Option<Arc<AmbiguousFn>>,

    points: Vec<Vector3<f64>>,
    values_out: Vec<f64>,
    derivs_out: Vec<GradSample>,
    ambig_out: Vec<bool>,
    safe: bool,
}

impl FnShape {
    pub fn new<F: Fn(Vector3<f64>) -> f64 + Send + Sync + 'static>(
        f: F,
    ) -> Self {
        Self {
            f: Arc::new(f),
            grad: None,
            interval_fn: None,
            inside_fn: None,
            features_fn: None,
            ambiguous_fn: None,
            points: vec![Vector3::zeros(); ARRAY_SIZE],
            values_out: vec![0.0; ARRAY_SIZE],
            derivs_out: vec![
                GradSample {
                    grad: Vector3::zeros(),
                    value: 0.0
                };
                ARRAY_SIZE
            ],
            ambig_out: vec![false; ARRAY_SIZE],
            safe: true,
        }
    }

    /// Installs an analytic gradient
    pub fn with_gradient<F>(mut self, g: F) -> Self
    where
        F: Fn(Vector3<f64>) -> Vector3<f64> + Send + Sync + 'static,
    {
        self.grad = Some(Arc::new(g));
        self
    }

    /// Installs an interval evaluator, enabling tree pruning
    pub fn with_interval<F>(mut self, i: F) -> Self
    where
        F: Fn(Vector3<f64>, Vector3<f64>) -> Interval + Send + Sync + 'static,
    {
        self.interval_fn = Some(Arc::new(i));
        self
    }

    /// Installs a containment oracle for points where `f` is exactly zero
    pub fn with_inside<F>(mut self, i: F) -> Self
    where
        F: Fn(Vector3<f64>) -> bool + Send + Sync + 'static,
    {
        self.inside_fn = Some(Arc::new(i));
        self
    }

    /// Installs an ambiguity detector and feature enumerator
    pub fn with_features<A, F>(mut self, ambig: A, features: F) -> Self
    where
        A: Fn(Vector3<f64>) -> bool + Send + Sync + 'static,
        F: Fn(Vector3<f64>) -> ArrayVec<Vector3<f64>, MAX_FEATURES>
            + Send
            + Sync
            + 'static,
    {
        self.ambiguous_fn = Some(Arc::new(ambig));
        self.features_fn = Some(Arc::new(features));
        self
    }

    fn gradient(&self, p: Vector3<f64>) -> Vector3<f64> {
        if let Some(g) = &self.grad {
            (**g)(p)
        } else {
            // Central differences, scaled to the sample's magnitude
            let h = 1e-6 * p.norm().max(1.0);
            let mut out = Vector3::zeros();
            for a in 0..3 {
                let mut lo = p;
                let mut hi = p;
                lo[a] -= h;
                hi[a] += h;
                out[a] = ((*self.f)(hi) - (*self.f)(lo)) / (2.0 * h);
            }
            out
        }
    }
}

impl Evaluator for FnShape {
    type Tape = ();

    fn base_tape(&self) -> Self::Tape {}

    fn interval(
        &mut self,
        lower: Vector3<f64>,
        upper: Vector3<f64>,
        _tape: &Self::Tape,
    ) -> (Interval, Self::Tape) {
        let out = match &self.interval_fn {
            Some(i) => (**i)(lower, upper),
            None => Interval::everything(),
        };
        self.safe = out.is_finite();
        (out, ())
    }

    fn is_safe(&self) -> bool {
        self.safe
    }

    fn set(&mut self, p: Vector3<f64>, slot: usize) {
        self.points[slot] = p;
    }

    fn values(&mut self, count: usize, _tape: &Self::Tape) -> &[f64] {
        assert!(count <= ARRAY_SIZE);
        for i in 0..count {
            self.values_out[i] = (*self.f)(self.points[i]);
        }
        &self.values_out[..count]
    }

    fn derivs(&mut self, count: usize, _tape: &Self::Tape) -> &[GradSample] {
        assert!(count <= ARRAY_SIZE);
        for i in 0..count {
            let p = self.points[i];
            self.derivs_out[i] = GradSample {
                grad: self.gradient(p),
                value: (*self.f)(p),
            };
        }
        &self.derivs_out[..count]
    }

    fn ambiguous(&mut self, count: usize, _tape: &Self::Tape) -> &[bool] {
        assert!(count <= ARRAY_SIZE);
        for i in 0..count {
            self.ambig_out[i] = match &self.ambiguous_fn {
                Some(f) => (**f)(self.points[i]),
                None => false,
            };
        }
        &self.ambig_out[..count]
    }

    fn features(
        &mut self,
        p: Vector3<f64>,
        _tape: &Self::Tape,
    ) -> ArrayVec<Vector3<f64>, MAX_FEATURES> {
        match &self.features_fn {
            Some(f) => (**f)(p),
            None => {
                let mut out = ArrayVec::new();
                out.push(self.gradient(p));
                out
            }
        }
    }

    fn is_inside(&mut self, p: Vector3<f64>, _tape: &Self::Tape) -> bool {
        match &self.inside_fn {
            Some(f) => (**f)(p),
            // A point exactly on the surface of a closed solid counts as
            // inside, so tangent cells still see the crossing
            None => true,
        }
    }

    fn set_var(&mut self, _var: u32, _value: f64) -> bool {
        false
    }
}

////////////////////////////////////////////////////////////////////////////////
