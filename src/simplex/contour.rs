//! Dual walking of a 2D simplex tree
//!
//! The 2D analogue of the mesher: the walk visits every face-adjacent pair
//! of cells along each axis, checks the subspace vertices on the shared
//! edge for sign changes, and emits a pair of directed segments per
//! crossing, routed through the edge vertex so contour vertices stay on the
//! surface.  Segments are oriented with the solid on their left.
use super::builder::{ContourBuilder, Contours};
use super::tree::{SimplexLeaf, SimplexRoot, SimplexTree};
use super::types::{CornerIndex, NeighborIndex, FLOATING, HIGH, LOW};
use nalgebra::Vector2;

impl SimplexRoot<2> {
    /// Walks the dual of the tree, building contour segments
    ///
    /// Indices are (re)assigned first, exactly as in the 3D `walk_dual`.
    pub fn walk_contours(&self) -> Contours {
        self.assign_indices();
        let mut out = ContourBuilder::default();
        self.root().visit_leaves(&mut |cell| {
            if let Some(leaf) = cell.leaf() {
                for sub in &leaf.sub {
                    let i = sub.index();
                    if i != 0 {
                        let v = sub.data().vert;
                        out.vertex(i, Vector2::new(v[0], v[1]));
                    }
                }
            }
        });
        cell(
            CellRef {
                node: self.root(),
                depth: 0,
            },
            &mut out,
        );
        out.take()
    }
}

#[derive(Copy, Clone)]
struct CellRef<'a> {
    node: &'a SimplexTree<2>,
    depth: u32,
}

impl<'a> CellRef<'a> {
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

    fn leaf(&self) -> Option<&'a SimplexLeaf<2>> {
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

fn cell(c: CellRef, out: &mut ContourBuilder) {
    if !c.node.is_branch() {
        return;
    }
    for i in 0..4 {
        cell(c.child(i), out);
    }
    for t in 0..2 {
        let u = 1 - t;
        let (tb, ub) = (1u8 << t, 1u8 << u);
        for i in [false, true] {
            let p = sel(i, ub);
            face(t, c.child(p), c.child(p | tb), out);
        }
    }
}

/// Handles two cells sharing an edge perpendicular to `t` (`lo` below `hi`)
fn face(t: usize, lo: CellRef, hi: CellRef, out: &mut ContourBuilder) {
    if !lo.node.is_branch() && !hi.node.is_branch() {
        emit_face(t, lo, hi, out);
        return;
    }
    let u = 1 - t;
    let (tb, ub) = (1u8 << t, 1u8 << u);
    for i in [false, true] {
        let ui = sel(i, ub);
        face(t, lo.child(ui | tb), hi.child(ui), out);
    }
}

/// Emits the segments for one minimal shared edge
fn emit_face(t: usize, lo: CellRef, hi: CellRef, out: &mut ContourBuilder) {
    let (Some(lo_leaf), Some(hi_leaf)) = (lo.leaf(), hi.leaf()) else {
        return;
    };
    let u = 1 - t;

    // The deeper cell owns the finest copy of the shared edge; express the
    // edge subspaces in its frame
    let (dleaf, dt) = if lo.depth >= hi.depth {
        (lo_leaf, HIGH)
    } else {
        (hi_leaf, LOW)
    };
    let sub_of = |du: u8| {
        let mut digits = [0u8; 2];
        digits[t] = dt;
        digits[u] = du;
        NeighborIndex::<2>::from_digits(&digits)
    };
    let c_lo = dleaf.sub[sub_of(LOW).index()].data();
    let mid_sub = &dleaf.sub[sub_of(FLOATING).index()];
    let mid = mid_sub.data();
    let c_hi = dleaf.sub[sub_of(HIGH).index()].data();

    let center = NeighborIndex::<2>::center().index();
    let body_lo = lo_leaf.sub[center].index();
    let body_hi = hi_leaf.sub[center].index();
    let m = mid_sub.index();

    for (lower_inside, upper_inside) in
        [(c_lo.inside, mid.inside), (mid.inside, c_hi.inside)]
    {
        if lower_inside == upper_inside {
            continue;
        }
        // Walking lo -> hi crosses the edge in the +t direction; the solid
        // sits on the left of that walk when the crossing's upper (+u)
        // endpoint is inside, mirrored on the y axis where "left of +y"
        // points along -x
        let forward = upper_inside != (t == 1);
        if forward {
            out.segment(body_lo, m);
            out.segment(m, body_hi);
        } else {
            out.segment(body_hi, m);
            out.segment(m, body_lo);
        }
    }
}
