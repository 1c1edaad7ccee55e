//! Multithreaded simplex tree construction
//!
//! Tasks subdivide a cell and evaluate its `2^N` octants.  Finished children
//! land in a per-branch slot array guarded by an atomic countdown; whichever
//! worker completes the last child collects the branch and bubbles the
//! result upward.  This replaces the recursive builder's stack with fan-in
//! continuations while keeping the same ordering guarantees: the slot store
//! happens-before the countdown observation that triggers collection.
//!
//! Task distribution follows `crossbeam-deque`'s global/local topology: the
//! root task enters a shared [`Injector`], each worker subdivides into its
//! own LIFO deque (keeping descent depth-first and cache-warm), and idle
//! workers steal breadth-first from whoever is busiest.  Group lifecycle
//! (launch, idle accounting, shutdown) runs on a single [`Crew`] monitor.
//!
//! Workers never borrow from neighbors here: a neighboring subtree may be
//! mid-construction on another thread, so duplicate subspace records are
//! allowed and unified later by index assignment.
use super::{
    arena::ObjectPool,
    neighbors::SimplexNeighbors,
    tree::{
        collect_children, eval_leaf, probe_cell, BuildCtx, CellAction,
        SimplexTree,
    },
    types::{corner_count, CornerIndex},
};
use crate::{eval::Evaluator, region::Region, Error};
use crossbeam_deque::{Injector, Steal, Stealer, Worker as TaskQueue};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Condvar, Mutex,
};

/// A branch whose children are still being evaluated
struct BranchWait<E: Evaluator, const N: usize> {
    region: Region<N>,
    depth: u32,
    tape: E::Tape,
    pending: AtomicUsize,
    slots: Mutex<Vec<Option<SimplexTree<N>>>>,
    parent: Parent<E, N>,
}

enum Parent<E: Evaluator, const N: usize> {
    /// This branch is the root; its result lands in the shared slot
    Root(Arc<Mutex<Option<SimplexTree<N>>>>),
    /// This branch is the given child of another pending branch
    Branch {
        wait: Arc<BranchWait<E, N>>,
        slot: usize,
    },
}

impl<E: Evaluator, const N: usize> BranchWait<E, N> {
    fn new(
        region: Region<N>,
        depth: u32,
        tape: E::Tape,
        parent: Parent<E, N>,
    ) -> Arc<Self> {
        Arc::new(Self {
            region,
            depth,
            tape,
            pending: AtomicUsize::new(corner_count(N)),
            slots: Mutex::new((0..corner_count(N)).map(|_| None).collect()),
            parent,
        })
    }
}

/// A unit of work: one branch awaiting subdivision
type Task<E, const N: usize> = Arc<BranchWait<E, N>>;

////////////////////////////////////////////////////////////////////////////////

/// Lifecycle phase of the worker group
#[derive(Copy, Clone, Eq, PartialEq)]
enum Phase {
    /// Threads are still spawning; nobody may start
    Launching,
    /// Everyone spawned; work until the queues run dry
    Running,
    /// A spawn failed; every thread backs out without running
    Cancelled,
    /// Every worker went idle at once; construction is finished
    Done,
}

struct CrewState {
    phase: Phase,
    idle: usize,
}

/// Monitor coordinating the worker group
///
/// One mutex + condvar covers the launch gate, idle accounting, and
/// shutdown.  A worker reports idle only after its own deque, the injector,
/// and every steal source came up empty; since a worker holding unfinished
/// work never idles, the group is done exactly when all of them are idle at
/// once.  Sleepers register under the lock before waiting, so a wake posted
/// after a push can never be lost.
struct Crew {
    state: Mutex<CrewState>,
    cvar: Condvar,
    size: usize,
}

impl Crew {
    fn new(size: usize) -> Self {
        Self {
            state: Mutex::new(CrewState {
                phase: Phase::Launching,
                idle: 0,
            }),
            cvar: Condvar::new(),
            size,
        }
    }

    /// Opens (or cancels) the launch gate once spawning has settled
    fn launch(&self, ok: bool) {
        let mut st = self.state.lock().unwrap();
        st.phase = if ok { Phase::Running } else { Phase::Cancelled };
        self.cvar.notify_all();
    }

    /// Blocks until the launch gate opens; `false` means back out
    fn wait_for_launch(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        while st.phase == Phase::Launching {
            st = self.cvar.wait(st).unwrap();
        }
        st.phase == Phase::Running
    }

    /// Wakes idle workers after new tasks became stealable
    fn wake(&self) {
        let st = self.state.lock().unwrap();
        if st.idle > 0 {
            self.cvar.notify_all();
        }
    }

    /// Parks the calling worker until more work may be available
    ///
    /// Returns `false` once every worker is idle simultaneously, meaning
    /// all work is finished.
    fn idle(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        st.idle += 1;
        if st.idle == self.size {
            st.phase = Phase::Done;
            self.cvar.notify_all();
            return false;
        }
        st = self.cvar.wait(st).unwrap();
        if st.phase == Phase::Done {
            return false;
        }
        // Woken for (possibly) new work; spurious wakeups just re-poll the
        // queues and land back here
        st.idle -= 1;
        true
    }
}

////////////////////////////////////////////////////////////////////////////////

struct Worker<'a, 'b, E: Evaluator, const N: usize> {
    eval: E,
    queue: TaskQueue<Task<E, N>>,
    stealers: &'a [Stealer<Task<E, N>>],
    injector: &'a Injector<Task<E, N>>,
    index: usize,
    pool: ObjectPool<N>,
    ctx: &'a BuildCtx<'b>,
    crew: &'a Crew,
}

/// Builds a tree using the work-stealing worker group
pub(crate) fn build<E: Evaluator, const N: usize>(
    eval: &E,
    region: Region<N>,
    ctx: &BuildCtx,
) -> Result<(SimplexTree<N>, ObjectPool<N>), Error> {
    let workers = ctx.settings.workers.max(1);
    let result = Arc::new(Mutex::new(None));

    // Evaluate the root inline, so trivial regions never spin up the group
    let mut root_eval = eval.clone();
    let tape = root_eval.base_tape();
    let mut root_pool = ObjectPool::new();
    let injector = Injector::new();
    match probe_cell(&mut root_eval, &tape, &region, 0, ctx) {
        CellAction::Done(state) => {
            ctx.cell_done();
            return Ok((SimplexTree::terminal(region, state, None), root_pool));
        }
        CellAction::Leaf(t) => {
            let out = eval_leaf(
                &mut root_eval,
                &t,
                region,
                &SimplexNeighbors::empty(),
                &mut root_pool,
            );
            ctx.cell_done();
            return Ok((out, root_pool));
        }
        CellAction::Recurse(t) => {
            ctx.cells_spawned(corner_count(N) as u64);
            injector.push(BranchWait::<E, N>::new(
                region,
                0,
                t,
                Parent::Root(result.clone()),
            ));
        }
    }

    let crew = Crew::new(workers);
    let queues: Vec<TaskQueue<Task<E, N>>> =
        (0..workers).map(|_| TaskQueue::new_lifo()).collect();
    let stealers: Vec<Stealer<Task<E, N>>> =
        queues.iter().map(|q| q.stealer()).collect();

    let pools = std::thread::scope(|s| {
        let mut handles = Vec::with_capacity(workers);
        let mut spawn_err = None;
        for (index, queue) in queues.into_iter().enumerate() {
            let worker = Worker {
                eval: eval.clone(),
                queue,
                stealers: &stealers,
                injector: &injector,
                index,
                pool: ObjectPool::new(),
                ctx,
                crew: &crew,
            };
            match std::thread::Builder::new()
                .name(format!("simplex-{index}"))
                .spawn_scoped(s, move || worker.run())
            {
                Ok(h) => handles.push(h),
                Err(e) => {
                    spawn_err = Some(e);
                    break;
                }
            }
        }

        // Release (or cancel) the group now that spawning has settled
        crew.launch(spawn_err.is_none());
        let pools: Vec<ObjectPool<N>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        match spawn_err {
            Some(e) => Err(Error::from(e)),
            None => Ok(pools),
        }
    })?;

    let mut merged = root_pool;
    for p in pools {
        merged.merge(p);
    }
    let root = result
        .lock()
        .unwrap()
        .take()
        .expect("worker group exited without a result");
    Ok((root, merged))
}

impl<E: Evaluator, const N: usize> Worker<'_, '_, E, N> {
    fn run(mut self) -> ObjectPool<N> {
        if !self.crew.wait_for_launch() {
            return self.pool;
        }
        loop {
            if let Some(task) = self.next_task() {
                if self.process(task) {
                    // New subtasks are stealable; wake anyone who's idle
                    self.crew.wake();
                }
                continue;
            }
            if !self.crew.idle() {
                break;
            }
        }
        self.pool
    }

    /// Pops local work, then drains the injector, then steals from peers
    fn next_task(&self) -> Option<Task<E, N>> {
        self.queue.pop().or_else(|| {
            std::iter::repeat_with(|| {
                self.injector.steal_batch_and_pop(&self.queue).or_else(|| {
                    self.stealers
                        .iter()
                        .enumerate()
                        .filter(|&(i, _)| i != self.index)
                        .map(|(_, s)| s.steal())
                        .collect()
                })
            })
            .find(|s: &Steal<_>| !s.is_retry())
            .and_then(|s| s.success())
        })
    }

    /// Evaluates the `2^N` children of a pending branch, returning whether
    /// any subtasks were pushed
    fn process(&mut self, wait: Task<E, N>) -> bool {
        let mut pushed = false;
        for i in CornerIndex::<N>::iter() {
            let region = wait.region.child(i);
            let depth = wait.depth + 1;
            match probe_cell(&mut self.eval, &wait.tape, &region, depth, self.ctx)
            {
                CellAction::Done(state) => {
                    self.ctx.cell_done();
                    self.complete(
                        SimplexTree::terminal(region, state, None),
                        &wait,
                        i.index(),
                    );
                }
                CellAction::Leaf(t) => {
                    let node = eval_leaf(
                        &mut self.eval,
                        &t,
                        region,
                        &SimplexNeighbors::empty(),
                        &mut self.pool,
                    );
                    self.ctx.cell_done();
                    self.complete(node, &wait, i.index());
                }
                CellAction::Recurse(t) => {
                    self.ctx.cells_spawned(corner_count(N) as u64);
                    self.queue.push(BranchWait::new(
                        region,
                        depth,
                        t,
                        Parent::Branch {
                            wait: wait.clone(),
                            slot: i.index(),
                        },
                    ));
                    pushed = true;
                }
            }
        }
        pushed
    }

    /// Stores a finished child; whoever stores the last one collects the
    /// branch and recurses upward
    fn complete(
        &mut self,
        node: SimplexTree<N>,
        wait: &Arc<BranchWait<E, N>>,
        slot: usize,
    ) {
        let mut node = node;
        let mut wait = wait.clone();
        let mut slot = slot;
        loop {
            wait.slots.lock().unwrap()[slot] = Some(node);
            if wait.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
                return;
            }

            // Last child in: collect this branch
            let children: Vec<SimplexTree<N>> = wait
                .slots
                .lock()
                .unwrap()
                .drain(..)
                .map(|c| c.expect("branch collected with a missing child"))
                .collect();
            let out = collect_children(
                &mut self.eval,
                &wait.tape,
                wait.region,
                children,
                &mut self.pool,
                self.ctx,
            );
            self.ctx.cell_done();

            let (next, next_slot) = match &wait.parent {
                Parent::Root(res) => {
                    *res.lock().unwrap() = Some(out);
                    return;
                }
                Parent::Branch { wait: p, slot: s } => (p.clone(), *s),
            };
            node = out;
            wait = next;
            slot = next_slot;
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
