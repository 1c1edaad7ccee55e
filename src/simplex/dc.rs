//! Dual walking of a 3D simplex tree
//!
//! The walk enumerates every interior edge of the leaf complex exactly once
//! via the cell/face/edge recursion, then marches the subspace vertices
//! around each edge.  A sign change between adjacent vertices *on* the edge
//! (corner / edge-interior / corner) marks a surface crossing; each crossing
//! emits a fan from the edge-interior vertex around the ring of body and
//! face vertices of the four surrounding cells.  Ring edges pair up across
//! neighboring crossings, which is what makes the result watertight.
use super::builder::{Mesh, MeshBuilder};
use super::tree::{SimplexLeaf, SimplexRoot, SimplexTree};
use super::types::{CornerIndex, NeighborIndex, FLOATING, HIGH, LOW};
use arrayvec::ArrayVec;

/// Right-handed coordinate frames, as `(t, u, v)` axis indexes
const FRAMES: [(usize, usize, usize); 3] = [(0, 1, 2), (1, 2, 0), (2, 0, 1)];

/// Quadrant of each cell around a shared edge, as the `(u, v)` digits of the
/// edge within that cell's frame
///
/// Cells are ordered right-handed about `+t`: the first sits at `(-u, -v)`,
/// so the edge lies on its high-u / high-v side, and so on around.
const QUADRANTS: [(u8, u8); 4] =
    [(HIGH, HIGH), (LOW, HIGH), (LOW, LOW), (HIGH, LOW)];

impl SimplexRoot<3> {
    /// Walks the dual of the tree, building a triangle mesh
    ///
    /// Indices are (re)assigned first; assignment is deterministic, so
    /// calling [`assign_indices`](SimplexRoot::assign_indices) beforehand is
    /// harmless.
    pub fn walk_dual(&self) -> Mesh {
        self.assign_indices();
        let mut out = MeshBuilder::default();
        self.root().visit_leaves(&mut |cell| {
            if let Some(leaf) = cell.leaf() {
                for sub in &leaf.sub {
                    let i = sub.index();
                    if i != 0 {
                        out.vertex(i, sub.data().vert);
                    }
                }
            }
        });
        dc_cell(
            CellRef {
                node: self.root(),
                depth: 0,
            },
            &mut out,
        );
        out.take()
    }
}

/// A tree node paired with its depth in the walk
#[derive(Copy, Clone)]
struct CellRef<'a> {
    node: &'a SimplexTree<3>,
    depth: u32,
}

impl<'a> CellRef<'a> {
    /// Steps into the given child of a branch; leaves return themselves
    fn child(&self, bits: u8) -> CellRef<'a> {
        if self.node.is_branch() {
            CellRef {
                node: self.node.child_or_self(CornerIndex::new(bits)),
                depth: self.depth + 1,
            }
        } else {
            *self
        }
    }

    fn leaf(&self) -> Option<&'a SimplexLeaf<3>> {
        self.node.leaf()
    }
}

fn sel(on: bool, bit: u8) -> u8 {
    if on {
        bit
    } else {
        0
    }
}

fn dc_cell(c: CellRef, out: &mut MeshBuilder) {
    if !c.node.is_branch() {
        return;
    }
    for i in 0..8 {
        dc_cell(c.child(i), out);
    }

    for &(t, u, v) in &FRAMES {
        let (tb, ub, vb) = (1u8 << t, 1u8 << u, 1u8 << v);
        for p in [0, ub, vb, ub | vb] {
            dc_face((t, u, v), c.child(p), c.child(p | tb), out);
        }
    }

    for &(t, u, v) in &FRAMES {
        let (tb, ub, vb) = (1u8 << t, 1u8 << u, 1u8 << v);
        for i in [false, true] {
            let b = sel(i, tb);
            dc_edge(
                (t, u, v),
                [
                    c.child(b),
                    c.child(b | ub),
                    c.child(b | ub | vb),
                    c.child(b | vb),
                ],
                out,
            );
        }
    }
}

/// Handles two cells sharing a face perpendicular to `t` (`lo` below `hi`)
fn dc_face(
    f: (usize, usize, usize),
    lo: CellRef,
    hi: CellRef,
    out: &mut MeshBuilder,
) {
    if !lo.node.is_branch() && !hi.node.is_branch() {
        return;
    }
    let (t, u, v) = f;
    let (tb, ub, vb) = (1u8 << t, 1u8 << u, 1u8 << v);
    for p in [0, ub, vb, ub | vb] {
        dc_face(f, lo.child(p | tb), hi.child(p), out);
    }
    for i in [false, true] {
        let ui = sel(i, ub);
        dc_edge(
            (u, v, t),
            [
                lo.child(ui | tb),
                lo.child(ui | vb | tb),
                hi.child(ui | vb),
                hi.child(ui),
            ],
            out,
        );
        let vi = sel(i, vb);
        dc_edge(
            (v, t, u),
            [
                lo.child(vi | tb),
                hi.child(vi),
                hi.child(vi | ub),
                lo.child(vi | ub | tb),
            ],
            out,
        );
    }
}

/// Handles four cells sharing an edge along `t`, ordered right-handed
/// about `+t`
fn dc_edge(f: (usize, usize, usize), cs: [CellRef; 4], out: &mut MeshBuilder) {
    if cs.iter().all(|c| !c.node.is_branch()) {
        emit_edge(f, cs, out);
    } else {
        let (t, u, v) = f;
        let (tb, ub, vb) = (1u8 << t, 1u8 << u, 1u8 << v);
        for i in [false, true] {
            let ti = sel(i, tb);
            dc_edge(
                f,
                [
                    cs[0].child(ti | ub | vb),
                    cs[1].child(ti | vb),
                    cs[2].child(ti),
                    cs[3].child(ti | ub),
                ],
                out,
            );
        }
    }
}

/// Emits the triangle fans for one minimal shared edge
fn emit_edge(f: (usize, usize, usize), cs: [CellRef; 4], out: &mut MeshBuilder) {
    let (t, u, v) = f;

    // An empty or filled cell (or an unevaluated one, after an abort) has no
    // subspace data; no crossing can cut such an edge
    let leafs = [cs[0].leaf(), cs[1].leaf(), cs[2].leaf(), cs[3].leaf()];
    if leafs.iter().any(Option::is_none) {
        return;
    }
    let leafs = leafs.map(Option::unwrap);

    // The deepest cell owns the finest copy of the shared edge
    let deepest = (0..4).max_by_key(|&i| cs[i].depth).unwrap();

    let sub_of = |k: usize, dt: u8| -> NeighborIndex<3> {
        let (du, dv) = QUADRANTS[k];
        let mut digits = [0u8; 3];
        digits[t] = dt;
        digits[u] = du;
        digits[v] = dv;
        NeighborIndex::from_digits(&digits)
    };

    let dleaf = leafs[deepest];
    let lo = dleaf.sub[sub_of(deepest, LOW).index()].data();
    let mid_sub = &dleaf.sub[sub_of(deepest, FLOATING).index()];
    let mid = mid_sub.data();
    let hi = dleaf.sub[sub_of(deepest, HIGH).index()].data();

    for (lower_inside, upper_inside) in
        [(lo.inside, mid.inside), (mid.inside, hi.inside)]
    {
        if lower_inside == upper_inside {
            continue;
        }

        // Ring of body and face vertices around the edge, right-handed
        // about +t; a coarse cell appearing twice contributes once
        let mut ring: ArrayVec<u64, 8> = ArrayVec::new();
        for k in 0..4 {
            let kn = (k + 1) % 4;
            ring.push(
                leafs[k].sub[NeighborIndex::<3>::center().index()].index(),
            );
            if std::ptr::eq(cs[k].node, cs[kn].node) {
                continue;
            }
            // Shared face between cells k and k+1, taken from the deeper
            let perp = if k % 2 == 0 { u } else { v };
            let from = if cs[k].depth >= cs[kn].depth { k } else { kn };
            let mut digits = [FLOATING; 3];
            digits[perp] = if perp == u {
                QUADRANTS[from].0
            } else {
                QUADRANTS[from].1
            };
            ring.push(
                leafs[from].sub[NeighborIndex::<3>::from_digits(&digits).index()]
                    .index(),
            );
        }
        let mut ded: ArrayVec<u64, 8> = ArrayVec::new();
        for &r in &ring {
            if ded.last() != Some(&r) {
                ded.push(r);
            }
        }
        while ded.len() > 1 && ded.first() == ded.last() {
            ded.pop();
        }

        // Fan from the edge vertex; the surface faces +t exactly when the
        // inside lies below the crossing
        let m = mid_sub.index();
        let n = ded.len();
        for i in 0..n {
            let (p, q) = (ded[i], ded[(i + 1) % n]);
            if lower_inside {
                out.triangle(m, p, q);
            } else {
                out.triangle(m, q, p);
            }
        }
    }
}
