//! Simplex tree construction and isosurface extraction
//!
//! This module implements adaptive spatial subdivision with per-subspace
//! QEF vertex placement, a simplex-cell variant of
//! [Dual Contouring of Hermite Data](https://www.cs.rice.edu/~jwarren/papers/dualcontour.pdf):
//! every leaf cell carries one vertex per topological subspace (body, faces,
//! edges, corners), shared with its neighbors, and the mesher marches the
//! dual of that vertex complex.
//!
//! The resulting meshes should be
//! - Watertight
//! - Preserving sharp features (corners / edges)
//!
//! However, they are not guaranteed to catch thin features below the
//! sampling resolution, and a surface grazing a cell edge twice can produce
//! locally non-manifold (though still evenly-matched) edges.
//!
//! Here's a full example:
//!
//! ```
//! use trellis::{eval::FnShape, simplex::{Settings, SimplexRoot}, Region};
//!
//! let sphere = FnShape::new(|p| p.norm_squared() - 1.0)
//!     .with_gradient(|p| 2.0 * p);
//! let region = Region::new([-2.0; 3], [2.0; 3]);
//! let settings = Settings {
//!     min_feature: 0.5,
//!     workers: 0,
//!     ..Settings::default()
//! };
//! let tree = SimplexRoot::build(&sphere, region, settings)?;
//! let mesh = tree.walk_dual();
//! assert!(!mesh.triangles.is_empty());
//! # Ok::<(), trellis::Error>(())
//! ```
mod arena;
mod builder;
mod contour;
mod dc;
mod neighbors;
mod qef;
mod tree;
mod worker;

pub mod types;

pub use arena::{ObjectPool, SubspacePool};
pub use builder::{Contours, Mesh};
pub use neighbors::SimplexNeighbors;
pub use qef::{Qef, EIGENVALUE_CUTOFF};
pub use tree::{
    Settings, SimplexLeaf, SimplexRoot, SimplexSubspace, SimplexTree,
    SubspaceData,
};
