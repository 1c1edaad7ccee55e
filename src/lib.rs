//! Adaptive isosurface extraction for implicit surfaces
//!
//! The crate converts an implicit function `f : R^3 -> R` (with the surface
//! at `f = 0` and the solid at `f < 0`) into a triangle mesh, or a 2D slice
//! of it into contours.  Construction is an interval-pruned N-ary
//! subdivision whose leaves carry one QEF-positioned vertex per topological
//! subspace; extraction walks the dual of that vertex complex.
//!
//! Functions are consumed through the opaque [`eval::Evaluator`] capability
//! bundle; this crate never builds evaluators itself, but
//! [`eval::FnShape`] adapts plain closures for tests and simple callers.
//!
//! ```
//! use trellis::{eval::FnShape, simplex::{Settings, SimplexRoot}, Region};
//!
//! let sphere = FnShape::new(|p| p.norm_squared() - 1.0)
//!     .with_gradient(|p| 2.0 * p);
//! let settings = Settings { min_feature: 0.5, workers: 0, ..Settings::default() };
//! let tree = SimplexRoot::build(
//!     &sphere,
//!     Region::new([-2.0; 3], [2.0; 3]),
//!     settings,
//! )?;
//! let mesh = tree.walk_dual();
//! assert!(!mesh.triangles.is_empty());
//! # Ok::<(), trellis::Error>(())
//! ```
mod error;

pub mod eval;
pub mod region;
pub mod simplex;
pub mod types;

pub use error::Error;
pub use region::Region;
