use std::marker::PhantomData;

use log::trace;

use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::storage::{lock_all, try_vec};
use crate::tensor::Tensor;

// Apply: synchronised strided traversal of 1..3 views
//
// The engine runs a caller-supplied body once per element of each view, in
// lockstep, in lex-major (innermost-fastest) order.
//
// PLANNING:
//
//   Each view is reduced to a list of "runs": maximal groups of adjacent
//   dimensions that step through storage uniformly. Dimension i folds into
//   dimension i+1 when
//
//       stride[i] == stride[i+1] * size[i+1]
//
//   and neither i nor i+1 is the excluded dimension DIM. A fully dense view
//   with no DIM collapses to a single run of n elements (the fast path).
//
//     [4, 3] dense                 → runs [12]          strides [1]
//     [4, 3] transposed            → runs [3][4]        strides [1][3]
//     [3, 3, 3] narrowed from [3, 3, 4] on the last dim
//                                  → runs [9][3]        strides [4][1]
//
// TRAVERSAL:
//
//   Each view keeps its own counters and storage position. The inner loop
//   advances every view by its inner stride until one of them exhausts its
//   innermost run; every exhausted view then carries into its outer runs:
//
//     pos -= inner_len * inner_stride
//     for d = runs-2 down to 0:
//         counter[d] += 1; pos += strides[d]
//         if counter[d] == sizes[d]:
//             d == 0 → done
//             else   → pos -= counter[d] * strides[d]; counter[d] = 0
//         else break
//
//   A view that is a single run (or took the dense fast path) ends the
//   traversal when it is exhausted. Views may have different run structure;
//   only their element counts must agree.
//
// SAFETY MODEL:
//
//   Positions are storage indices, not pointers. Every Tensor satisfies the
//   bounds invariant, so every position the traversal dereferences is inside
//   its storage. The traversal holds the write lock of every distinct
//   storage it touches; views aliasing one buffer share that lock.
//
//   A body must not lock a storage of its own traversal again (to_vec,
//   get, a nested apply). Such calls fail with StorageReentered.

/// Traversal plan for one view: its merged runs plus live loop state.
#[derive(Debug, Clone)]
pub struct ApplyPlan {
    n: usize,
    sizes: Vec<usize>,
    strides: Vec<isize>,
    counter: Vec<usize>,
    start: isize,
    pos: isize,
    index: usize,
    contiguous: bool,
    dim_run: Option<usize>,
}

impl ApplyPlan {
    /// Plan a traversal of `layout`.
    ///
    /// `dim` names a dimension that must stay a run of its own.
    /// `allow_contiguous` enables the single-run fast path for dense views.
    pub fn new(layout: &Layout, dim: Option<usize>, allow_contiguous: bool) -> Result<Self> {
        let rank = layout.rank();
        if let Some(d) = dim {
            if d >= rank {
                return Err(Error::DimOutOfRange { dim: d, rank });
            }
        }
        let n = layout.elem_count();
        let start = layout.offset() as isize;
        if n == 0 {
            return Ok(ApplyPlan {
                n,
                sizes: Vec::new(),
                strides: Vec::new(),
                counter: Vec::new(),
                start,
                pos: start,
                index: 0,
                contiguous: false,
                dim_run: None,
            });
        }

        if allow_contiguous && dim.is_none() && layout.is_contiguous() {
            let plan = ApplyPlan {
                n,
                sizes: vec![n],
                strides: vec![1],
                counter: vec![0],
                start,
                pos: start,
                index: 0,
                contiguous: true,
                dim_run: None,
            };
            trace!("apply plan (dense): n={n}");
            return Ok(plan);
        }

        let size = layout.dims();
        let stride = layout.strides();
        let mergeable = |i: usize| {
            stride[i] == stride[i + 1] * size[i + 1] as isize
                && dim != Some(i)
                && dim != Some(i + 1)
        };

        let mut runs = 1;
        for i in (0..rank - 1).rev() {
            if !mergeable(i) {
                runs += 1;
            }
        }

        let mut counter = try_vec(runs, 0usize)?;
        let mut sizes = try_vec(runs, 0usize)?;
        let mut strides = try_vec(runs, 0isize)?;

        let mut r = runs - 1;
        sizes[r] = size[rank - 1];
        strides[r] = stride[rank - 1];
        let mut dim_run = (dim == Some(rank - 1)).then_some(r);
        for i in (0..rank - 1).rev() {
            if mergeable(i) {
                sizes[r] *= size[i];
            } else {
                r -= 1;
                sizes[r] = size[i];
                strides[r] = stride[i];
            }
            if dim == Some(i) {
                dim_run = Some(r);
            }
        }
        counter.fill(0);

        trace!("apply plan: n={n} sizes={sizes:?} strides={strides:?} dim={dim:?}");
        Ok(ApplyPlan {
            n,
            sizes,
            strides,
            counter,
            start,
            pos: start,
            index: 0,
            contiguous: false,
            dim_run,
        })
    }

    /// Total element count of the view.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of merged runs (0 for an empty view).
    pub fn runs(&self) -> usize {
        self.sizes.len()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    /// Whether the dense single-run fast path was taken.
    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    /// Run index that holds the excluded dimension, if any.
    pub fn dim_run(&self) -> Option<usize> {
        self.dim_run
    }

    pub fn inner_len(&self) -> usize {
        self.sizes.last().copied().unwrap_or(0)
    }

    pub fn inner_stride(&self) -> isize {
        self.strides.last().copied().unwrap_or(0)
    }

    fn dim_index(&self) -> Option<usize> {
        let r = self.dim_run?;
        if r + 1 == self.sizes.len() {
            Some(self.index)
        } else {
            Some(self.counter[r])
        }
    }

    #[inline]
    fn advance(&mut self) {
        self.index += 1;
        self.pos += self.inner_stride();
    }

    /// Carry out of an exhausted innermost run. Returns true when the
    /// traversal of this view is complete.
    fn carry(&mut self) -> bool {
        if self.contiguous || self.sizes.len() == 1 {
            return true;
        }
        let last = self.sizes.len() - 1;
        self.pos -= self.sizes[last] as isize * self.strides[last];
        let mut finished = false;
        for d in (0..last).rev() {
            self.counter[d] += 1;
            self.pos += self.strides[d];
            if self.counter[d] == self.sizes[d] {
                if d == 0 {
                    finished = true;
                    break;
                }
                self.pos -= self.counter[d] as isize * self.strides[d];
                self.counter[d] = 0;
            } else {
                break;
            }
        }
        self.index = 0;
        finished
    }

    /// Position the plan at flat element `start` by modulo/divide over the
    /// run sizes, innermost first.
    pub(crate) fn seek(&mut self, start: usize) {
        let mut quot = start;
        let mut pos = self.start;
        for d in (0..self.sizes.len()).rev() {
            let c = quot % self.sizes[d];
            quot /= self.sizes[d];
            self.counter[d] = c;
            pos += c as isize * self.strides[d];
        }
        if let Some(last) = self.sizes.len().checked_sub(1) {
            self.index = self.counter[last];
            self.counter[last] = 0;
        }
        self.pos = pos;
    }

    /// Carry used inside a parallel segment: wraps every counter instead of
    /// finishing, the segment length bounds the walk.
    fn carry_wrapping(&mut self) {
        if self.sizes.len() <= 1 {
            return;
        }
        let last = self.sizes.len() - 1;
        self.pos -= self.sizes[last] as isize * self.strides[last];
        for d in (0..last).rev() {
            self.counter[d] += 1;
            self.pos += self.strides[d];
            if self.counter[d] == self.sizes[d] {
                self.pos -= self.sizes[d] as isize * self.strides[d];
                self.counter[d] = 0;
            } else {
                break;
            }
        }
        self.index = 0;
    }
}

/// Drive `plans` in lockstep over their whole range, calling `visit` once
/// per element tuple.
pub(crate) fn traverse(plans: &mut [ApplyPlan], mut visit: impl FnMut(&[ApplyPlan])) {
    let Some(first) = plans.first() else {
        return;
    };
    let mut remaining = first.n;
    if remaining == 0 {
        return;
    }
    loop {
        let step = plans
            .iter()
            .map(|p| p.inner_len() - p.index)
            .min()
            .unwrap_or(0)
            .min(remaining);
        for _ in 0..step {
            visit(plans);
            for p in plans.iter_mut() {
                p.advance();
            }
        }
        remaining -= step;
        if remaining == 0 {
            return;
        }
        for p in plans.iter_mut() {
            if p.index == p.inner_len() && p.carry() {
                return;
            }
        }
    }
}

/// Drive `plans` over flat elements `[start, end)`.
pub(crate) fn traverse_range(
    plans: &mut [ApplyPlan],
    start: usize,
    end: usize,
    mut visit: impl FnMut(&[ApplyPlan]),
) {
    for p in plans.iter_mut() {
        p.seek(start);
    }
    let mut remaining = end.saturating_sub(start);
    while remaining > 0 {
        let step = plans
            .iter()
            .map(|p| p.inner_len() - p.index)
            .min()
            .unwrap_or(0)
            .min(remaining);
        for _ in 0..step {
            visit(plans);
            for p in plans.iter_mut() {
                p.advance();
            }
        }
        remaining -= step;
        if remaining > 0 {
            for p in plans.iter_mut() {
                if p.index == p.inner_len() {
                    p.carry_wrapping();
                }
            }
        }
    }
}

// Cursors
//
// A cursor is the body's window onto one view at the current element: the
// element itself, plus where it sits inside the innermost run. Cursors only
// live for one body invocation.

/// Read/write access to the current element of one view.
pub struct Cursor<'a, E> {
    base: *mut E,
    pos: isize,
    index: usize,
    len: usize,
    stride: isize,
    dim_index: Option<usize>,
    _marker: PhantomData<&'a mut E>,
}

impl<'a, E: Element> Cursor<'a, E> {
    pub(crate) fn at(base: *mut E, plan: &ApplyPlan) -> Self {
        Cursor {
            base,
            pos: plan.pos,
            index: plan.index,
            len: plan.inner_len(),
            stride: plan.inner_stride(),
            dim_index: plan.dim_index(),
            _marker: PhantomData,
        }
    }

    pub(crate) fn flat(base: *mut E, offset: isize, index: usize, n: usize) -> Self {
        Cursor {
            base,
            pos: offset + index as isize,
            index,
            len: n,
            stride: 1,
            dim_index: None,
            _marker: PhantomData,
        }
    }

    /// Current element value.
    #[inline]
    pub fn get(&self) -> E {
        // SAFETY: `pos` is a reachable index of a bounds-checked view and the
        // traversal holds the storage lock.
        unsafe { self.base.offset(self.pos).read() }
    }

    /// Overwrite the current element.
    #[inline]
    pub fn set(&mut self, value: E) {
        // SAFETY: as in `get`.
        unsafe { self.base.offset(self.pos).write(value) }
    }

    #[inline]
    pub fn update(&mut self, f: impl FnOnce(E) -> E) {
        let v = self.get();
        self.set(f(v));
    }

    /// Pointer to the current element.
    pub fn as_ptr(&self) -> *mut E {
        self.base.wrapping_offset(self.pos)
    }

    /// Index of the current element inside the innermost run.
    pub fn run_index(&self) -> usize {
        self.index
    }

    /// Length of the innermost run.
    pub fn run_len(&self) -> usize {
        self.len
    }

    /// Storage step between consecutive elements of the innermost run.
    pub fn run_stride(&self) -> isize {
        self.stride
    }

    /// Index along the excluded dimension, when one was given.
    pub fn dim_index(&self) -> Option<usize> {
        self.dim_index
    }

    /// Storage index of the current element.
    pub fn storage_index(&self) -> isize {
        self.pos
    }
}

/// Read-only access to the current element of one view.
pub struct ReadCursor<'a, E> {
    inner: Cursor<'a, E>,
}

impl<'a, E: Element> ReadCursor<'a, E> {
    pub(crate) fn new(inner: Cursor<'a, E>) -> Self {
        ReadCursor { inner }
    }

    #[inline]
    pub fn get(&self) -> E {
        self.inner.get()
    }

    pub fn as_ptr(&self) -> *const E {
        self.inner.as_ptr().cast_const()
    }

    pub fn run_index(&self) -> usize {
        self.inner.run_index()
    }

    pub fn run_len(&self) -> usize {
        self.inner.run_len()
    }

    pub fn run_stride(&self) -> isize {
        self.inner.run_stride()
    }

    pub fn dim_index(&self) -> Option<usize> {
        self.inner.dim_index()
    }

    pub fn storage_index(&self) -> isize {
        self.inner.storage_index()
    }
}

/// Fail with `ApplySizeMismatch` unless every participant has the same
/// element count.
pub(crate) fn check_sizes(layouts: &[&Layout]) -> Result<usize> {
    let n = layouts.first().map(|l| l.elem_count()).unwrap_or(0);
    if layouts.iter().all(|l| l.elem_count() == n) {
        return Ok(n);
    }
    Err(Error::ApplySizeMismatch {
        tensors: layouts
            .iter()
            .enumerate()
            .map(|(i, l)| (format!("tensor{}", i + 1), l.shape().clone(), l.elem_count()))
            .collect(),
    })
}

// Sequential entry points

/// Visit every element of `t`. Never takes the dense fast path, so `run_len`
/// reflects the view's merged run structure.
pub fn apply1<A, F>(t: &Tensor<A>, dim: Option<usize>, mut body: F) -> Result<()>
where
    A: Element,
    F: FnMut(&mut Cursor<'_, A>),
{
    let mut plans = [ApplyPlan::new(t.layout(), dim, false)?];
    let mut stores = [(t.storage().lock_key(), t.storage().traversal_lock())];
    let _guards = lock_all(&mut stores)?;
    let base = t.storage().base_ptr();
    traverse(&mut plans, |p| {
        let mut c = Cursor::at(base, &p[0]);
        body(&mut c);
    });
    Ok(())
}

/// Visit `a` and `b` in lockstep.
pub fn apply2<A, B, F>(a: &Tensor<A>, b: &Tensor<B>, dim: Option<usize>, mut body: F) -> Result<()>
where
    A: Element,
    B: Element,
    F: FnMut(&mut Cursor<'_, A>, &mut Cursor<'_, B>),
{
    check_sizes(&[a.layout(), b.layout()])?;
    let mut plans = [
        ApplyPlan::new(a.layout(), dim, true)?,
        ApplyPlan::new(b.layout(), dim, true)?,
    ];
    let mut stores = [
        (a.storage().lock_key(), a.storage().traversal_lock()),
        (b.storage().lock_key(), b.storage().traversal_lock()),
    ];
    let _guards = lock_all(&mut stores)?;
    let (base_a, base_b) = (a.storage().base_ptr(), b.storage().base_ptr());
    traverse(&mut plans, |p| {
        let mut ca = Cursor::at(base_a, &p[0]);
        let mut cb = Cursor::at(base_b, &p[1]);
        body(&mut ca, &mut cb);
    });
    Ok(())
}

/// Visit `a`, `b` and `c` in lockstep.
pub fn apply3<A, B, C, F>(
    a: &Tensor<A>,
    b: &Tensor<B>,
    c: &Tensor<C>,
    dim: Option<usize>,
    mut body: F,
) -> Result<()>
where
    A: Element,
    B: Element,
    C: Element,
    F: FnMut(&mut Cursor<'_, A>, &mut Cursor<'_, B>, &mut Cursor<'_, C>),
{
    check_sizes(&[a.layout(), b.layout(), c.layout()])?;
    let mut plans = [
        ApplyPlan::new(a.layout(), dim, true)?,
        ApplyPlan::new(b.layout(), dim, true)?,
        ApplyPlan::new(c.layout(), dim, true)?,
    ];
    let mut stores = [
        (a.storage().lock_key(), a.storage().traversal_lock()),
        (b.storage().lock_key(), b.storage().traversal_lock()),
        (c.storage().lock_key(), c.storage().traversal_lock()),
    ];
    let _guards = lock_all(&mut stores)?;
    let (base_a, base_b, base_c) = (
        a.storage().base_ptr(),
        b.storage().base_ptr(),
        c.storage().base_ptr(),
    );
    traverse(&mut plans, |p| {
        let mut ca = Cursor::at(base_a, &p[0]);
        let mut cb = Cursor::at(base_b, &p[1]);
        let mut cc = Cursor::at(base_c, &p[2]);
        body(&mut ca, &mut cb, &mut cc);
    });
    Ok(())
}
