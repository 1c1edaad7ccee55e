//! Output containers and accumulation buffers for the dual walk
use nalgebra::{Vector2, Vector3};

/// An indexed triangle mesh
///
/// Vertices are addressed by global subspace index: entry 0 is unused (it
/// holds NaN), and the rest are dense in `[1, U]` after index assignment.
/// Triangles wind counter-clockwise when viewed from outside the solid.
#[derive(Default, Debug)]
pub struct Mesh {
    pub vertices: Vec<Vector3<f64>>,
    pub triangles: Vec<Vector3<u64>>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Indexed line segments from 2D contouring
///
/// Vertices are addressed like [`Mesh::vertices`]; segments are directed so
/// the solid (`f < 0`) lies on their left.
#[derive(Default, Debug)]
pub struct Contours {
    pub vertices: Vec<Vector2<f64>>,
    pub segments: Vec<Vector2<u64>>,
}

impl Contours {
    pub fn new() -> Self {
        Self::default()
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Container used while walking the dual of a 3D tree
#[derive(Default)]
pub(crate) struct MeshBuilder {
    out: Mesh,
}

impl MeshBuilder {
    pub fn take(self) -> Mesh {
        self.out
    }

    /// Records the position of a globally-indexed vertex
    pub fn vertex(&mut self, index: u64, pos: Vector3<f64>) {
        let i = index as usize;
        if i >= self.out.vertices.len() {
            self.out
                .vertices
                .resize(i + 1, Vector3::repeat(f64::NAN));
        }
        self.out.vertices[i] = pos;
    }

    /// Records a triangle, dropping degenerate ones
    ///
    /// Degenerate triangles appear when coarser cells repeat around a shared
    /// edge, collapsing ring vertices together.
    pub fn triangle(&mut self, a: u64, b: u64, c: u64) {
        if a == b || b == c || a == c {
            return;
        }
        self.out.triangles.push(Vector3::new(a, b, c));
    }
}

/// Container used while walking the dual of a 2D tree
#[derive(Default)]
pub(crate) struct ContourBuilder {
    out: Contours,
}

impl ContourBuilder {
    pub fn take(self) -> Contours {
        self.out
    }

    pub fn vertex(&mut self, index: u64, pos: Vector2<f64>) {
        let i = index as usize;
        if i >= self.out.vertices.len() {
            self.out
                .vertices
                .resize(i + 1, Vector2::repeat(f64::NAN));
        }
        self.out.vertices[i] = pos;
    }

    pub fn segment(&mut self, a: u64, b: u64) {
        if a == b {
            return;
        }
        self.out.segments.push(Vector2::new(a, b));
    }
}
