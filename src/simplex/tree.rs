//! Simplex tree construction, collapse, and index assignment
//!
//! The tree is an N-ary subdivision of a [`Region`], pruned by interval
//! evaluation.  Terminal ambiguous cells evaluate a [`SimplexLeaf`]: one
//! shared vertex record per topological subspace, positioned by constrained
//! QEF minimization.  Bottom-up, children whose merged QEFs solve within
//! `max_err` collapse back into coarser leaves.
use crate::{
    eval::{Evaluator, GradSample, ARRAY_SIZE},
    region::Region,
    simplex::{
        arena::ObjectPool,
        neighbors::SimplexNeighbors,
        qef::Qef,
        types::{
            corner_count, subspace_count, CornerIndex, NeighborIndex,
            MAX_CORNERS, MAX_SUBSPACES,
        },
        worker,
    },
    types::IntervalState,
    Error,
};
use arrayvec::ArrayVec;
use nalgebra::{SVector, Vector3};
use once_cell::sync::OnceCell;
use static_assertions::const_assert;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};

// Corner and vertex-sign sampling must fit in a single evaluator batch
const_assert!(MAX_CORNERS <= ARRAY_SIZE);
const_assert!(MAX_SUBSPACES <= ARRAY_SIZE);

////////////////////////////////////////////////////////////////////////////////

/// Settings for building a simplex tree
#[derive(Copy, Clone)]
pub struct Settings<'a> {
    /// Cells whose diagonal is at most this long stop subdividing
    pub min_feature: f64,

    /// Collapse threshold on the maximum per-subspace QEF residual
    /// `|Ax - b|^2` of a merged cell, in units of (function value)²
    ///
    /// Zero disables collapsing entirely.
    pub max_err: f64,

    /// Hard cap on subdivision depth
    pub max_depth: u32,

    /// Number of worker threads; 0 selects the single-threaded builder,
    /// which also performs construction-time neighbor borrowing
    pub workers: usize,

    /// Cooperative cancellation flag, polled at each cell
    ///
    /// Setting it mid-build yields a structurally valid (if incomplete)
    /// tree; extraction remains safe.
    pub abort: Option<&'a AtomicBool>,

    /// Progress callback, invoked from arbitrary workers with approximate
    /// `(completed, total)` cell counts; must be thread-safe
    pub progress: Option<&'a (dyn Fn(u64, u64) + Sync)>,
}

impl Default for Settings<'_> {
    fn default() -> Self {
        Self {
            min_feature: 0.1,
            max_err: 0.0,
            max_depth: 24,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            abort: None,
            progress: None,
        }
    }
}

/// Shared state for a single build
pub(crate) struct BuildCtx<'a> {
    pub settings: Settings<'a>,
    completed: AtomicU64,
    total: AtomicU64,
}

impl<'a> BuildCtx<'a> {
    pub fn new(settings: Settings<'a>) -> Self {
        Self {
            settings,
            completed: AtomicU64::new(0),
            total: AtomicU64::new(1),
        }
    }

    pub fn aborted(&self) -> bool {
        self.settings
            .abort
            .map(|a| a.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Records a finished cell and reports progress
    pub fn cell_done(&self) {
        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(p) = self.settings.progress {
            p(done, self.total.load(Ordering::Relaxed));
        }
    }

    /// Records that a subdivision added `n` pending cells
    pub fn cells_spawned(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Solved state of a subspace: its accumulated samples, chosen vertex, and
/// containment
pub struct SubspaceData<const N: usize> {
    pub qef: Qef<N>,
    pub vert: SVector<f64, N>,
    pub inside: bool,
}

/// Reference-counted, shareable per-subspace vertex record
///
/// The owning leaf writes [`SubspaceData`] exactly once, before the leaf
/// becomes reachable through the neighbor map; afterwards the record is
/// immutable apart from `index`, which a single-threaded pass assigns after
/// construction, and `refcount`, which tracks how many leaves reference it.
pub struct SimplexSubspace<const N: usize> {
    refcount: AtomicU32,
    index: AtomicU64,
    data: OnceCell<SubspaceData<N>>,
}

impl<const N: usize> SimplexSubspace<N> {
    pub(crate) fn new() -> Self {
        Self {
            refcount: AtomicU32::new(1),
            index: AtomicU64::new(0),
            data: OnceCell::new(),
        }
    }

    /// Global vertex number; 0 means unassigned
    pub fn index(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }

    pub(crate) fn set_index(&self, i: u64) {
        self.index.store(i, Ordering::Release);
    }

    /// Solved data, if the owning leaf has finished
    pub fn solved(&self) -> Option<&SubspaceData<N>> {
        self.data.get()
    }

    /// Solved data of a finished subspace
    ///
    /// # Panics
    /// If the owning leaf has not solved this subspace yet
    pub fn data(&self) -> &SubspaceData<N> {
        self.data.get().expect("subspace not yet solved")
    }

    pub(crate) fn solve(&self, data: SubspaceData<N>) {
        if self.data.set(data).is_err() {
            panic!("subspace solved twice");
        }
    }

    /// Adds a leaf reference
    pub(crate) fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::Release);
    }

    /// Drops a leaf reference, returning `true` if this was the last one
    pub(crate) fn release(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Re-arms a pooled subspace with a single reference
    pub(crate) fn activate(&self) {
        debug_assert_eq!(self.refcount.load(Ordering::Relaxed), 0);
        self.refcount.store(1, Ordering::Relaxed);
    }

    pub(crate) fn reset(&mut self) {
        self.refcount = AtomicU32::new(0);
        self.index = AtomicU64::new(0);
        self.data.take();
    }
}

/// Per-leaf vertex storage: one shared subspace record per subspace
pub struct SimplexLeaf<const N: usize> {
    /// 0 for undecomposed leaves, `1 + max(child level)` for collapsed ones
    pub level: u32,

    /// Subspace records, indexed by [`NeighborIndex`]; records may be shared
    /// with neighboring leaves
    pub sub: ArrayVec<Arc<SimplexSubspace<N>>, MAX_SUBSPACES>,
}

impl<const N: usize> SimplexLeaf<N> {
    pub(crate) fn new() -> Self {
        Self {
            level: 0,
            sub: ArrayVec::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.level = 0;
        self.sub.clear();
    }

    /// Drops every subspace reference, returning records whose refcount hits
    /// zero (and then the leaf itself) to the pool
    pub(crate) fn release_to(mut self, pool: &mut ObjectPool<N>) {
        for sub in self.sub.drain(..) {
            if sub.release() {
                pool.next().put(sub);
            }
        }
        pool.put(self);
    }
}

////////////////////////////////////////////////////////////////////////////////

/// A node of the simplex tree: a branch with `2^N` children, or a terminal
/// cell with an optional leaf
pub struct SimplexTree<const N: usize> {
    region: Region<N>,
    state: IntervalState,
    data: TreeData<N>,
}

enum TreeData<const N: usize> {
    Leaf(Option<SimplexLeaf<N>>),
    Branch(Vec<SimplexTree<N>>),
}

impl<const N: usize> SimplexTree<N> {
    pub(crate) fn terminal(
        region: Region<N>,
        state: IntervalState,
        leaf: Option<SimplexLeaf<N>>,
    ) -> Self {
        debug_assert!(leaf.is_none() || state == IntervalState::Ambiguous);
        Self {
            region,
            state,
            data: TreeData::Leaf(leaf),
        }
    }

    pub(crate) fn branch(region: Region<N>, children: Vec<Self>) -> Self {
        debug_assert_eq!(children.len(), corner_count(N));
        Self {
            region,
            state: IntervalState::Ambiguous,
            data: TreeData::Branch(children),
        }
    }

    pub fn region(&self) -> &Region<N> {
        &self.region
    }

    pub fn state(&self) -> IntervalState {
        self.state
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.data, TreeData::Branch(_))
    }

    pub fn children(&self) -> Option<&[SimplexTree<N>]> {
        match &self.data {
            TreeData::Branch(c) => Some(c),
            TreeData::Leaf(_) => None,
        }
    }

    /// Leaf data, present only on ambiguous terminal cells
    pub fn leaf(&self) -> Option<&SimplexLeaf<N>> {
        match &self.data {
            TreeData::Leaf(l) => l.as_ref(),
            TreeData::Branch(_) => None,
        }
    }

    /// Collapse level of this cell (0 unless built by merging children)
    pub fn level(&self) -> u32 {
        self.leaf().map(|l| l.level).unwrap_or(0)
    }

    /// Returns the given child of a branch, or the cell itself for leaves
    pub(crate) fn child_or_self(&self, i: CornerIndex<N>) -> &Self {
        match &self.data {
            TreeData::Branch(c) => &c[i.index()],
            TreeData::Leaf(_) => self,
        }
    }

    pub(crate) fn take_leaf(&mut self) -> Option<SimplexLeaf<N>> {
        match &mut self.data {
            TreeData::Leaf(l) => l.take(),
            TreeData::Branch(_) => None,
        }
    }

    /// Visits every terminal cell of the subtree
    pub fn visit_leaves<'a, F: FnMut(&'a SimplexTree<N>)>(
        &'a self,
        f: &mut F,
    ) {
        match &self.data {
            TreeData::Branch(c) => {
                for child in c {
                    child.visit_leaves(f);
                }
            }
            TreeData::Leaf(_) => f(self),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Owning handle to a built simplex tree
pub struct SimplexRoot<const N: usize> {
    root: SimplexTree<N>,
    /// Whether the build observed a cancellation request; the tree is still
    /// structurally valid, but may be incomplete
    pub aborted: bool,
    pool: ObjectPool<N>,
}

impl<const N: usize> SimplexRoot<N> {
    /// Builds a simplex tree over the given region
    ///
    /// Fails fast on an invalid region or `min_feature`; everything local to
    /// a cell (evaluator faults, degenerate QEFs) is absorbed instead.
    pub fn build<E: Evaluator>(
        eval: &E,
        region: Region<N>,
        settings: Settings,
    ) -> Result<Self, Error> {
        assert!(N >= 1 && N <= 3, "unsupported dimension {N}");
        region.check()?;
        if !(settings.min_feature > 0.0) {
            return Err(Error::InvalidMinFeature(settings.min_feature));
        }

        let ctx = BuildCtx::new(settings);
        let (root, pool) = if settings.workers == 0 {
            let mut pool = ObjectPool::new();
            let mut eval = eval.clone();
            let tape = eval.base_tape();
            let root = recurse(
                &mut eval,
                &tape,
                region,
                0,
                &SimplexNeighbors::empty(),
                &mut pool,
                &ctx,
            );
            (root, pool)
        } else {
            worker::build(eval, region, &ctx)?
        };
        log::debug!(
            "built simplex tree: {} cells, {} subspaces live",
            ctx.completed(),
            pool.subspaces().outstanding(),
        );
        Ok(Self {
            root,
            aborted: ctx.aborted(),
            pool,
        })
    }

    pub fn root(&self) -> &SimplexTree<N> {
        &self.root
    }

    /// Assigns a dense global numbering to every unique subspace vertex
    ///
    /// Indices are assigned in DFS order starting from 1, reusing a
    /// neighbor's index wherever a subspace is shared (by pointer or by
    /// duplication across a thread boundary).  Returns the number of unique
    /// vertices; the assignment is deterministic, so repeated calls yield
    /// identical indices.
    pub fn assign_indices(&self) -> u64 {
        clear_indices(&self.root);
        let mut counter = 1;
        assign_recurse(&self.root, &SimplexNeighbors::empty(), &mut counter);
        counter - 1
    }

    /// Tears the tree down into its object pool and returns the pool for
    /// reuse or inspection
    pub fn recycle(mut self) -> ObjectPool<N> {
        release_tree(&mut self.root, &mut self.pool);
        std::mem::take(&mut self.pool)
    }
}

impl<const N: usize> Drop for SimplexRoot<N> {
    fn drop(&mut self) {
        release_tree(&mut self.root, &mut self.pool);
    }
}

fn release_tree<const N: usize>(
    node: &mut SimplexTree<N>,
    pool: &mut ObjectPool<N>,
) {
    match &mut node.data {
        TreeData::Branch(children) => {
            for c in children {
                release_tree(c, pool);
            }
        }
        TreeData::Leaf(leaf) => {
            if let Some(l) = leaf.take() {
                l.release_to(pool);
            }
        }
    }
}

fn clear_indices<const N: usize>(node: &SimplexTree<N>) {
    if let Some(children) = node.children() {
        for c in children {
            clear_indices(c);
        }
    } else if let Some(leaf) = node.leaf() {
        for sub in &leaf.sub {
            sub.set_index(0);
        }
    }
}

fn assign_recurse<'a, const N: usize>(
    node: &'a SimplexTree<N>,
    neighbors: &SimplexNeighbors<'a, N>,
    counter: &mut u64,
) {
    if let Some(children) = node.children() {
        for i in CornerIndex::<N>::iter() {
            let sub = neighbors.push(i, children);
            assign_recurse(&children[i.index()], &sub, counter);
        }
    } else if let Some(leaf) = node.leaf() {
        for s in NeighborIndex::<N>::iter() {
            // A pointer-shared record may already be numbered this pass
            if leaf.sub[s.index()].index() != 0 {
                continue;
            }
            if let Some(idx) = neighbors.get_index(s) {
                leaf.sub[s.index()].set_index(idx);
            } else {
                leaf.sub[s.index()].set_index(*counter);
                *counter += 1;
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// What to do with a cell after interval evaluation
pub(crate) enum CellAction<T> {
    /// The cell is finished with the given terminal state (and no leaf)
    Done(IntervalState),
    /// The cell is terminal and ambiguous: evaluate a leaf with this tape
    Leaf(T),
    /// The cell should subdivide, recursing with this tape
    Recurse(T),
}

/// Interval-evaluates a cell and decides how to proceed
pub(crate) fn probe_cell<E: Evaluator, const N: usize>(
    eval: &mut E,
    tape: &E::Tape,
    region: &Region<N>,
    depth: u32,
    ctx: &BuildCtx,
) -> CellAction<E::Tape> {
    if ctx.aborted() {
        return CellAction::Done(IntervalState::Ambiguous);
    }

    let (out, sub_tape) = eval.interval(region.lower3(), region.upper3(), tape);
    let mut state = out.state();
    if !eval.is_safe() {
        // Arithmetic fault during interval evaluation: the range is
        // meaningless, so fall through to sampling
        log::trace!("unsafe interval result over {region:?}");
        state = IntervalState::Ambiguous;
    }

    match state {
        IntervalState::Filled | IntervalState::Empty => CellAction::Done(state),
        _ => {
            if region.diagonal() <= ctx.settings.min_feature
                || depth >= ctx.settings.max_depth
            {
                CellAction::Leaf(sub_tape)
            } else {
                CellAction::Recurse(sub_tape)
            }
        }
    }
}

/// Single-threaded recursive construction
pub(crate) fn recurse<E: Evaluator, const N: usize>(
    eval: &mut E,
    tape: &E::Tape,
    region: Region<N>,
    depth: u32,
    neighbors: &SimplexNeighbors<N>,
    pool: &mut ObjectPool<N>,
    ctx: &BuildCtx,
) -> SimplexTree<N> {
    match probe_cell(eval, tape, &region, depth, ctx) {
        CellAction::Done(state) => {
            ctx.cell_done();
            SimplexTree::terminal(region, state, None)
        }
        CellAction::Leaf(t) => {
            let out = eval_leaf(eval, &t, region, neighbors, pool);
            ctx.cell_done();
            out
        }
        CellAction::Recurse(t) => {
            ctx.cells_spawned(corner_count(N) as u64);
            let mut children = Vec::with_capacity(corner_count(N));
            for i in CornerIndex::<N>::iter() {
                let child = {
                    let sub = neighbors.push(i, &children);
                    recurse(eval, &t, region.child(i), depth + 1, &sub, pool, ctx)
                };
                children.push(child);
            }
            let out = collect_children(eval, &t, region, children, pool, ctx);
            ctx.cell_done();
            out
        }
    }
}

/// Converts a 3D gradient sample into an N-dimensional QEF constraint
fn insert_sample<const N: usize>(
    q: &mut Qef<N>,
    pos: SVector<f64, N>,
    grad: Vector3<f64>,
    value: f64,
) {
    let mut g = SVector::<f64, N>::zeros();
    for a in 0..N {
        g[a] = grad[a];
    }
    q.insert(pos, g, value);
}

/// Positions a vertex in every non-borrowed subspace, summing the projected
/// QEFs of each subspace's closure; returns the maximum solve residual
fn solve_subspaces<const N: usize>(
    leaf: Option<&SimplexLeaf<N>>,
    qefs: &[Qef<N>; MAX_SUBSPACES],
    borrowed: &[bool; MAX_SUBSPACES],
    region: &Region<N>,
    verts: &mut [SVector<f64, N>; MAX_SUBSPACES],
) -> f64 {
    let mut max_err: f64 = 0.0;
    for si in (0..subspace_count(N)).rev() {
        if borrowed[si] {
            continue;
        }
        let s = NeighborIndex::<N>::new(si as u16);
        let floating = s.floating();
        let mut q = Qef::<N>::new();
        for r in NeighborIndex::<N>::iter() {
            if s.contains(r) {
                let rq = if borrowed[r.index()] {
                    leaf.unwrap().sub[r.index()].data().qef
                } else {
                    qefs[r.index()]
                };
                q += rq.sub(floating);
            }
        }
        let (vert, err) = q.solve_bounded(&region.subspace(s), floating);
        verts[si] = vert;
        max_err = max_err.max(err);
    }
    max_err
}

/// Batched inside/outside evaluation for freshly-positioned vertices
///
/// Exact zeros defer to the feature evaluator's containment oracle.
fn solve_signs<E: Evaluator, const N: usize>(
    eval: &mut E,
    tape: &E::Tape,
    region: &Region<N>,
    skip: &[bool; MAX_SUBSPACES],
    verts: &[SVector<f64, N>; MAX_SUBSPACES],
) -> [bool; MAX_SUBSPACES] {
    let mut out = [false; MAX_SUBSPACES];
    let mut slots: ArrayVec<usize, MAX_SUBSPACES> = ArrayVec::new();
    for si in 0..subspace_count(N) {
        if !skip[si] {
            eval.set(region.point3(&verts[si]), slots.len());
            slots.push(si);
        }
    }
    let vals: ArrayVec<f64, MAX_SUBSPACES> =
        eval.values(slots.len(), tape).iter().copied().collect();
    for (k, &si) in slots.iter().enumerate() {
        out[si] = if vals[k] == 0.0 {
            eval.is_inside(region.point3(&verts[si]), tape)
        } else {
            vals[k] < 0.0
        };
    }
    out
}

/// Evaluates an ambiguous terminal cell
///
/// Subspaces already owned by a built neighbor of equal size are adopted;
/// the rest are sampled (corners), solved, and classified.  A cell whose
/// vertices are uniformly inside or outside releases its leaf again.
pub(crate) fn eval_leaf<E: Evaluator, const N: usize>(
    eval: &mut E,
    tape: &E::Tape,
    region: Region<N>,
    neighbors: &SimplexNeighbors<N>,
    pool: &mut ObjectPool<N>,
) -> SimplexTree<N> {
    let mut leaf = pool.get();
    leaf.level = 0;
    let mut borrowed = [false; MAX_SUBSPACES];

    // Borrow solved subspaces from neighbors whenever possible
    for s in NeighborIndex::<N>::iter() {
        if let Some((nleaf, ns)) = neighbors.check(s) {
            let sub = nleaf.sub[ns.index()].clone();
            sub.acquire();
            leaf.sub.push(sub);
            borrowed[s.index()] = true;
        } else {
            leaf.sub.push(pool.next().get());
        }
    }

    // Sample every corner that wasn't borrowed, in one batch
    let mut corners: ArrayVec<CornerIndex<N>, MAX_CORNERS> = ArrayVec::new();
    for c in CornerIndex::<N>::iter() {
        if !borrowed[c.neighbor().index()] {
            eval.set(region.corner3(c), corners.len());
            corners.push(c);
        }
    }
    let mut qefs = [Qef::<N>::new(); MAX_SUBSPACES];
    if !corners.is_empty() {
        let ds: ArrayVec<GradSample, MAX_CORNERS> =
            eval.derivs(corners.len(), tape).iter().copied().collect();
        let ambig: ArrayVec<bool, MAX_CORNERS> =
            eval.ambiguous(corners.len(), tape).iter().copied().collect();
        for (k, &c) in corners.iter().enumerate() {
            let s = c.neighbor();
            let pos = region.corner(c);
            if ambig[k] {
                // Multiple features meet here; accumulate one plane per
                // one-sided normal
                for f in eval.features(region.corner3(c), tape) {
                    insert_sample(&mut qefs[s.index()], pos, f, ds[k].value);
                }
            } else {
                insert_sample(&mut qefs[s.index()], pos, ds[k].grad, ds[k].value);
            }
        }
    }

    let mut verts = [SVector::<f64, N>::zeros(); MAX_SUBSPACES];
    solve_subspaces(Some(&leaf), &qefs, &borrowed, &region, &mut verts);
    let inside = solve_signs(eval, tape, &region, &borrowed, &verts);

    for s in 0..subspace_count(N) {
        if !borrowed[s] {
            leaf.sub[s].solve(SubspaceData {
                qef: qefs[s],
                vert: verts[s],
                inside: inside[s],
            });
        }
    }

    // Classify from the subspace vertices.  This is less conclusive than
    // interval arithmetic, but if the model crossed this cell we'd expect at
    // least one vertex to land on either side.
    let mut all_inside = true;
    let mut all_outside = true;
    for s in 0..subspace_count(N) {
        let i = leaf.sub[s].data().inside;
        all_inside &= i;
        all_outside &= !i;
    }

    if all_inside || all_outside {
        // No surface crosses this cell, so the leaf is surplus
        leaf.release_to(pool);
        let state = if all_inside {
            IntervalState::Filled
        } else {
            IntervalState::Empty
        };
        SimplexTree::terminal(region, state, None)
    } else {
        SimplexTree::terminal(region, IntervalState::Ambiguous, Some(leaf))
    }
}

/// Combines `2^N` finished children into their parent
///
/// Uniform empty/filled children collapse to a bare terminal.  Otherwise,
/// when collapsing is enabled, child QEFs are accumulated subspace by
/// subspace (counting each shared subspace from exactly one child) and the
/// parent becomes a leaf if the merged solve stays within `max_err`.
pub(crate) fn collect_children<E: Evaluator, const N: usize>(
    eval: &mut E,
    tape: &E::Tape,
    region: Region<N>,
    mut children: Vec<SimplexTree<N>>,
    pool: &mut ObjectPool<N>,
    ctx: &BuildCtx,
) -> SimplexTree<N> {
    debug_assert_eq!(children.len(), corner_count(N));

    let merged = children
        .iter()
        .map(|c| c.state())
        .fold(IntervalState::Unknown, IntervalState::combine);
    if matches!(merged, IntervalState::Empty | IntervalState::Filled) {
        // All children agree and carry no leaf data; drop them wholesale
        debug_assert!(children.iter().all(|c| c.leaf().is_none()));
        return SimplexTree::terminal(region, merged, None);
    }

    let collapsible = ctx.settings.max_err > 0.0
        && !ctx.aborted()
        && children.iter().all(|c| {
            !c.is_branch()
                && (c.state() != IntervalState::Ambiguous || c.leaf().is_some())
        });
    if collapsible {
        let mut qefs = [Qef::<N>::new(); MAX_SUBSPACES];
        for (i, child) in children.iter().enumerate() {
            // Empty and filled children have released their QEFs; skip them
            let Some(leaf) = child.leaf() else { continue };
            let ci = i as u8;
            for j in NeighborIndex::<N>::iter() {
                let floating = j.floating();
                let pos = j.pos();

                // One star per subspace: a child counts a fixed-low subspace
                // only when the child itself sits on the low side of that
                // axis, so siblings sharing a subspace contribute it once
                let mut valid = true;
                for d in 0..N {
                    let bit = 1u8 << d;
                    if j.fixed() & bit != 0 {
                        valid &= (pos & bit != 0) || (ci & bit == 0);
                    }
                }
                if !valid {
                    continue;
                }

                // Floating axes stay floating; fixed axes stay fixed where
                // the child's corner agrees with the subspace side, and
                // relax to floating otherwise
                let mut floating_out = 0u8;
                let mut pos_out = 0u8;
                for d in 0..N {
                    let bit = 1u8 << d;
                    if floating & bit != 0
                        || (pos & bit != 0) != (ci & bit != 0)
                    {
                        floating_out |= bit;
                    } else {
                        pos_out |= pos & bit;
                    }
                }
                let target = NeighborIndex::<N>::from_pos_and_floating(
                    pos_out,
                    floating_out,
                );
                qefs[target.index()] += leaf.sub[j.index()].data().qef;
            }
        }

        let fresh = [false; MAX_SUBSPACES];
        let mut verts = [SVector::<f64, N>::zeros(); MAX_SUBSPACES];
        let err = solve_subspaces(None, &qefs, &fresh, &region, &mut verts);
        if err <= ctx.settings.max_err {
            let inside = solve_signs(eval, tape, &region, &fresh, &verts);
            let mut leaf = pool.get();
            leaf.level =
                1 + children.iter().map(|c| c.level()).max().unwrap_or(0);
            for s in 0..subspace_count(N) {
                let sub = pool.next().get();
                sub.solve(SubspaceData {
                    qef: qefs[s],
                    vert: verts[s],
                    inside: inside[s],
                });
                leaf.sub.push(sub);
            }
            for child in &mut children {
                if let Some(l) = child.take_leaf() {
                    l.release_to(pool);
                }
            }
            return SimplexTree::terminal(
                region,
                IntervalState::Ambiguous,
                Some(leaf),
            );
        }
    }

    SimplexTree::branch(region, children)
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;
    use crate::eval::FnShape;
    use crate::types::Interval;

    fn sphere(center: [f64; 3], r: f64) -> FnShape {
        let c = Vector3::from(center);
        FnShape::new(move |p| (p - c).norm_squared() - r * r)
            .with_gradient(move |p| 2.0 * (p - c))
            .with_interval(move |lo, up| {
                let mut min = 0.0;
                let mut max = 0.0;
                for a in 0..3 {
                    let (l, u) = (lo[a] - c[a], up[a] - c[a]);
                    let hi = l.abs().max(u.abs());
                    let lo = if l <= 0.0 && u >= 0.0 {
                        0.0
                    } else {
                        l.abs().min(u.abs())
                    };
                    min += lo * lo;
                    max += hi * hi;
                }
                Interval::new(min - r * r, max - r * r)
            })
    }

    #[test]
    fn test_empty_region() {
        let shape = FnShape::new(|_| 1.0)
            .with_interval(|_, _| Interval::new(1.0, 1.0));
        let region = Region::new([-1.0; 3], [1.0; 3]);
        let settings = Settings {
            workers: 0,
            ..Settings::default()
        };
        let out = SimplexRoot::build(&shape, region, settings).unwrap();
        assert_eq!(out.root().state(), IntervalState::Empty);
        assert!(out.root().leaf().is_none());
        assert!(!out.root().is_branch());

        let pool = out.recycle();
        assert_eq!(pool.created(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_single_leaf() {
        // A region small enough to terminate immediately
        let shape = sphere([0.0; 3], 1.0);
        let region = Region::new([0.9, -0.1, -0.1], [1.1, 0.1, 0.1]);
        let settings = Settings {
            min_feature: 1.0,
            workers: 0,
            ..Settings::default()
        };
        let out = SimplexRoot::build(&shape, region, settings).unwrap();
        let leaf = out.root().leaf().expect("expected an ambiguous leaf");
        assert_eq!(leaf.sub.len(), 27);
        assert_eq!(leaf.level, 0);

        // Every vertex stays in its subspace's region, and the body vertex
        // lands on the sphere
        for s in NeighborIndex::<3>::iter() {
            let d = leaf.sub[s.index()].data();
            assert!(
                region.subspace(s).contains(&d.vert, 1e-12),
                "vertex {:?} escapes subspace {s:?}",
                d.vert
            );
        }
        let body = leaf.sub[NeighborIndex::<3>::center().index()].data();
        assert!((body.vert.norm() - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_invalid_inputs() {
        let shape = sphere([0.0; 3], 1.0);
        let bad = Region::new([1.0, 0.0, 0.0], [-1.0, 1.0, 1.0]);
        assert!(matches!(
            SimplexRoot::build(&shape, bad, Settings::default()),
            Err(Error::InvalidRegion(0))
        ));

        let region = Region::new([-1.0; 3], [1.0; 3]);
        let settings = Settings {
            min_feature: 0.0,
            ..Settings::default()
        };
        assert!(matches!(
            SimplexRoot::build(&shape, region, settings),
            Err(Error::InvalidMinFeature(_))
        ));
    }

    #[test]
    fn test_closure_and_containment() {
        let shape = sphere([0.0; 3], 1.0);
        let region = Region::new([-2.0; 3], [2.0; 3]);
        let settings = Settings {
            min_feature: 0.4,
            workers: 0,
            ..Settings::default()
        };
        let out = SimplexRoot::build(&shape, region, settings).unwrap();
        assert!(!out.aborted);

        let mut leaves = 0;
        out.root().visit_leaves(&mut |cell| {
            leaves += 1;
            assert!(cell.state().is_known(), "leaf left UNKNOWN");
            if let Some(leaf) = cell.leaf() {
                assert_eq!(cell.state(), IntervalState::Ambiguous);
                for s in NeighborIndex::<3>::iter() {
                    let d = leaf.sub[s.index()].data();
                    assert!(cell
                        .region()
                        .subspace(s)
                        .contains(&d.vert, 1e-12));
                }
            }
        });
        assert!(leaves > 8);
    }

    #[test]
    fn test_neighbor_sharing() {
        // Single-threaded builds share subspace records across neighbors
        let shape = sphere([0.0; 3], 1.0);
        let region = Region::new([-2.0; 3], [2.0; 3]);
        let settings = Settings {
            min_feature: 0.4,
            workers: 0,
            ..Settings::default()
        };
        let out = SimplexRoot::build(&shape, region, settings).unwrap();

        let mut shared = 0;
        out.root().visit_leaves(&mut |cell| {
            if let Some(leaf) = cell.leaf() {
                for sub in &leaf.sub {
                    if Arc::strong_count(sub) > 1 {
                        shared += 1;
                    }
                }
            }
        });
        assert!(shared > 0, "no subspaces were shared between neighbors");
    }

    #[test]
    fn test_refcount_conservation() {
        let shape = sphere([0.0; 3], 1.0);
        let region = Region::new([-2.0; 3], [2.0; 3]);
        for workers in [0, 4] {
            let settings = Settings {
                min_feature: 0.4,
                workers,
                ..Settings::default()
            };
            let out = SimplexRoot::build(&shape, region, settings).unwrap();
            let pool = out.recycle();
            assert_eq!(
                pool.outstanding(),
                0,
                "leaked leaves with {workers} workers"
            );
            assert_eq!(
                pool.subspaces().outstanding(),
                0,
                "leaked subspaces with {workers} workers"
            );
        }
    }

    #[test]
    fn test_index_assignment() {
        let shape = sphere([0.0; 3], 1.0);
        let region = Region::new([-2.0; 3], [2.0; 3]);
        for workers in [0, 4] {
            let settings = Settings {
                min_feature: 0.4,
                workers,
                ..Settings::default()
            };
            let out = SimplexRoot::build(&shape, region, settings).unwrap();
            let n = out.assign_indices();
            assert!(n > 0);

            // Dense in [1, n], and every ambiguous-leaf subspace is numbered
            let mut seen = vec![false; n as usize + 1];
            out.root().visit_leaves(&mut |cell| {
                if let Some(leaf) = cell.leaf() {
                    for sub in &leaf.sub {
                        let i = sub.index();
                        assert!(i >= 1 && i <= n, "index {i} out of range");
                        seen[i as usize] = true;
                    }
                }
            });
            assert!(seen[1..].iter().all(|&s| s), "indices are not dense");

            // Idempotent
            let first: Vec<u64> = collect_indices(out.root());
            assert_eq!(out.assign_indices(), n);
            assert_eq!(collect_indices(out.root()), first);
        }
    }

    fn collect_indices(root: &SimplexTree<3>) -> Vec<u64> {
        let mut out = vec![];
        root.visit_leaves(&mut |cell| {
            if let Some(leaf) = cell.leaf() {
                out.extend(leaf.sub.iter().map(|s| s.index()));
            }
        });
        out
    }

    #[test]
    fn test_index_consistency_across_sharing() {
        // Duplicated subspaces (worker builds don't share pointers) must
        // still agree on vertex, sign, and index
        let shape = sphere([0.0; 3], 1.0);
        let region = Region::new([-2.0; 3], [2.0; 3]);
        let settings = Settings {
            min_feature: 0.4,
            workers: 4,
            ..Settings::default()
        };
        let out = SimplexRoot::build(&shape, region, settings).unwrap();
        out.assign_indices();

        use std::collections::BTreeMap;
        let mut by_index: BTreeMap<u64, (u64, u64, u64, bool)> = BTreeMap::new();
        out.root().visit_leaves(&mut |cell| {
            if let Some(leaf) = cell.leaf() {
                for sub in &leaf.sub {
                    let d = sub.data();
                    let key = (
                        d.vert[0].to_bits(),
                        d.vert[1].to_bits(),
                        d.vert[2].to_bits(),
                        d.inside,
                    );
                    let prev = by_index.insert(sub.index(), key);
                    if let Some(prev) = prev {
                        assert_eq!(prev, key, "index {} disagrees", sub.index());
                    }
                }
            }
        });
    }

    #[test]
    fn test_abort() {
        let shape = sphere([0.0; 3], 1.0);
        let region = Region::new([-2.0; 3], [2.0; 3]);
        let abort = AtomicBool::new(true);
        let settings = Settings {
            min_feature: 0.01,
            workers: 0,
            abort: Some(&abort),
            ..Settings::default()
        };
        let out = SimplexRoot::build(&shape, region, settings).unwrap();
        assert!(out.aborted);
        let pool = out.recycle();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.subspaces().outstanding(), 0);
    }

    #[test]
    fn test_progress() {
        let shape = sphere([0.0; 3], 1.0);
        let region = Region::new([-2.0; 3], [2.0; 3]);
        let calls = AtomicU64::new(0);
        let progress = |done: u64, total: u64| {
            assert!(done <= total);
            calls.fetch_add(1, Ordering::Relaxed);
        };
        let settings = Settings {
            min_feature: 0.5,
            workers: 0,
            progress: Some(&progress),
            ..Settings::default()
        };
        let _ = SimplexRoot::build(&shape, region, settings).unwrap();
        assert!(calls.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_collapse_flat_plane() {
        // A flat plane is exactly representable, so enabling collapse folds
        // the fine cells back into coarse leaves
        let shape = FnShape::new(|p| p.z)
            .with_gradient(|_| Vector3::new(0.0, 0.0, 1.0))
            .with_interval(|lo, up| Interval::new(lo.z, up.z));
        let region = Region::new([-1.0; 3], [1.0; 3]);

        let flat = Settings {
            min_feature: 0.3,
            max_err: 1e-6,
            workers: 0,
            ..Settings::default()
        };
        let out = SimplexRoot::build(&shape, region, flat).unwrap();
        let mut max_level = 0;
        out.root().visit_leaves(&mut |cell| {
            max_level = max_level.max(cell.level());
        });
        assert!(max_level > 0, "plane did not collapse");
    }
}
