use log::{debug, trace};
use rayon::prelude::*;

use crate::apply::{check_sizes, traverse, traverse_range, ApplyPlan, Cursor, ReadCursor};
use crate::config::ParallelConfig;
use crate::dtype::Element;
use crate::error::Result;
use crate::layout::Layout;
use crate::storage::{lock_all, Held};
use crate::tensor::Tensor;

// Parallel apply
//
// The flat element range [0, n) is cut into T segments:
//
//   segment tid = [tid * (n / T), end)   end = n for the last thread
//
// Each worker positions its own copy of every plan at the segment start
// (modulo/divide over the run sizes) and walks forward, carrying across run
// boundaries, until the segment is used up. When every participant is dense
// the workers skip planning and index the storage directly.
//
// The first tensor is the only one the body may write. Partitioning is only
// sound if its slots are disjoint across segments, so the engine runs on the
// calling thread instead when
//
//   - the config disables parallelism or n is below the threshold
//   - the write target overlaps itself (a stride-0 or overlapping view)
//   - a read participant shares the target's storage through a different
//     layout (a worker could read a slot another worker is writing)
//
// A read participant with the target's exact layout stays parallel: each
// slot is read and written by the same worker.
//
// Workers register the locked storages as held for the duration of their
// segment, so a body that reads one of them fails with StorageReentered
// instead of waiting on the spawning thread.

#[derive(Clone, Copy)]
struct SendPtr<E>(*mut E);

// SAFETY: workers only dereference these pointers inside disjoint segments
// while the spawning thread holds the storage locks.
unsafe impl<E> Send for SendPtr<E> {}
unsafe impl<E> Sync for SendPtr<E> {}

impl<E> SendPtr<E> {
    fn get(self) -> *mut E {
        self.0
    }
}

struct Participant<'a> {
    key: usize,
    layout: &'a Layout,
}

/// Decide whether `out` can be partitioned safely together with `reads`.
fn partition_is_safe(out: &Participant<'_>, reads: &[Participant<'_>]) -> bool {
    if !out.layout.is_non_overlapping() {
        debug!("parallel apply: write target overlaps itself, running sequentially");
        return false;
    }
    for r in reads {
        if r.key == out.key && r.layout != out.layout {
            debug!("parallel apply: read view aliases the write target, running sequentially");
            return false;
        }
    }
    true
}

fn segment(tid: usize, threads: usize, n: usize) -> (usize, usize) {
    let chunk = n / threads;
    let start = tid * chunk;
    let end = if tid == threads - 1 { n } else { start + chunk };
    (start, end)
}

/// Parallel element-wise visit of one tensor.
pub fn par_apply1<A, F>(cfg: &ParallelConfig, t: &Tensor<A>, body: F) -> Result<()>
where
    A: Element,
    F: Fn(&mut Cursor<'_, A>) + Sync,
{
    let n = t.elem_count();
    let out = Participant {
        key: t.storage().lock_key(),
        layout: t.layout(),
    };
    if n == 0 || !cfg.should_parallelize(n) || !partition_is_safe(&out, &[]) {
        let mut plans = [ApplyPlan::new(t.layout(), None, true)?];
        let mut stores = [(t.storage().lock_key(), t.storage().traversal_lock())];
        let _guards = lock_all(&mut stores)?;
        let base = t.storage().base_ptr();
        traverse(&mut plans, |p| body(&mut Cursor::at(base, &p[0])));
        return Ok(());
    }

    let threads = cfg.threads();
    let plan = ApplyPlan::new(t.layout(), None, true)?;
    let mut stores = [(t.storage().lock_key(), t.storage().traversal_lock())];
    let guards = lock_all(&mut stores)?;
    let keys = guards.keys();
    let base = SendPtr(t.storage().base_ptr());
    let offset = t.storage_offset() as isize;
    trace!("par_apply1: n={n} threads={threads}");

    (0..threads).into_par_iter().for_each(|tid| {
        let _held = Held::on_worker(keys);
        let (start, end) = segment(tid, threads, n);
        if plan.is_contiguous() {
            for i in start..end {
                body(&mut Cursor::flat(base.get(), offset, i, n));
            }
        } else {
            let mut plans = [plan.clone()];
            traverse_range(&mut plans, start, end, |p| {
                body(&mut Cursor::at(base.get(), &p[0]))
            });
        }
    });
    Ok(())
}

/// Parallel lockstep visit: writes `out`, reads `a`.
pub fn par_apply2<A, B, F>(cfg: &ParallelConfig, out: &Tensor<A>, a: &Tensor<B>, body: F) -> Result<()>
where
    A: Element,
    B: Element,
    F: Fn(&mut Cursor<'_, A>, &ReadCursor<'_, B>) + Sync,
{
    let n = check_sizes(&[out.layout(), a.layout()])?;
    let target = Participant {
        key: out.storage().lock_key(),
        layout: out.layout(),
    };
    let reads = [Participant {
        key: a.storage().lock_key(),
        layout: a.layout(),
    }];
    let mut plans = [
        ApplyPlan::new(out.layout(), None, true)?,
        ApplyPlan::new(a.layout(), None, true)?,
    ];
    let mut stores = [
        (out.storage().lock_key(), out.storage().traversal_lock()),
        (a.storage().lock_key(), a.storage().traversal_lock()),
    ];
    let (base_o, base_a) = (SendPtr(out.storage().base_ptr()), SendPtr(a.storage().base_ptr()));

    if n == 0 || !cfg.should_parallelize(n) || !partition_is_safe(&target, &reads) {
        let _guards = lock_all(&mut stores)?;
        traverse(&mut plans, |p| {
            body(
                &mut Cursor::at(base_o.get(), &p[0]),
                &ReadCursor::new(Cursor::at(base_a.get(), &p[1])),
            )
        });
        return Ok(());
    }

    let threads = cfg.threads();
    let guards = lock_all(&mut stores)?;
    let keys = guards.keys();
    let dense = plans.iter().all(ApplyPlan::is_contiguous);
    let (off_o, off_a) = (out.storage_offset() as isize, a.storage_offset() as isize);
    trace!("par_apply2: n={n} threads={threads} dense={dense}");

    (0..threads).into_par_iter().for_each(|tid| {
        let _held = Held::on_worker(keys);
        let (start, end) = segment(tid, threads, n);
        if dense {
            for i in start..end {
                body(
                    &mut Cursor::flat(base_o.get(), off_o, i, n),
                    &ReadCursor::new(Cursor::flat(base_a.get(), off_a, i, n)),
                );
            }
        } else {
            let mut local = plans.clone();
            traverse_range(&mut local, start, end, |p| {
                body(
                    &mut Cursor::at(base_o.get(), &p[0]),
                    &ReadCursor::new(Cursor::at(base_a.get(), &p[1])),
                )
            });
        }
    });
    Ok(())
}

/// Parallel lockstep visit: writes `out`, reads `a` and `b`.
pub fn par_apply3<A, B, C, F>(
    cfg: &ParallelConfig,
    out: &Tensor<A>,
    a: &Tensor<B>,
    b: &Tensor<C>,
    body: F,
) -> Result<()>
where
    A: Element,
    B: Element,
    C: Element,
    F: Fn(&mut Cursor<'_, A>, &ReadCursor<'_, B>, &ReadCursor<'_, C>) + Sync,
{
    let n = check_sizes(&[out.layout(), a.layout(), b.layout()])?;
    let target = Participant {
        key: out.storage().lock_key(),
        layout: out.layout(),
    };
    let reads = [
        Participant {
            key: a.storage().lock_key(),
            layout: a.layout(),
        },
        Participant {
            key: b.storage().lock_key(),
            layout: b.layout(),
        },
    ];
    let mut plans = [
        ApplyPlan::new(out.layout(), None, true)?,
        ApplyPlan::new(a.layout(), None, true)?,
        ApplyPlan::new(b.layout(), None, true)?,
    ];
    let mut stores = [
        (out.storage().lock_key(), out.storage().traversal_lock()),
        (a.storage().lock_key(), a.storage().traversal_lock()),
        (b.storage().lock_key(), b.storage().traversal_lock()),
    ];
    let base_o = SendPtr(out.storage().base_ptr());
    let base_a = SendPtr(a.storage().base_ptr());
    let base_b = SendPtr(b.storage().base_ptr());

    if n == 0 || !cfg.should_parallelize(n) || !partition_is_safe(&target, &reads) {
        let _guards = lock_all(&mut stores)?;
        traverse(&mut plans, |p| {
            body(
                &mut Cursor::at(base_o.get(), &p[0]),
                &ReadCursor::new(Cursor::at(base_a.get(), &p[1])),
                &ReadCursor::new(Cursor::at(base_b.get(), &p[2])),
            )
        });
        return Ok(());
    }

    let threads = cfg.threads();
    let guards = lock_all(&mut stores)?;
    let keys = guards.keys();
    let dense = plans.iter().all(ApplyPlan::is_contiguous);
    let offs = [
        out.storage_offset() as isize,
        a.storage_offset() as isize,
        b.storage_offset() as isize,
    ];
    trace!("par_apply3: n={n} threads={threads} dense={dense}");

    (0..threads).into_par_iter().for_each(|tid| {
        let _held = Held::on_worker(keys);
        let (start, end) = segment(tid, threads, n);
        if dense {
            for i in start..end {
                body(
                    &mut Cursor::flat(base_o.get(), offs[0], i, n),
                    &ReadCursor::new(Cursor::flat(base_a.get(), offs[1], i, n)),
                    &ReadCursor::new(Cursor::flat(base_b.get(), offs[2], i, n)),
                );
            }
        } else {
            let mut local = plans.clone();
            traverse_range(&mut local, start, end, |p| {
                body(
                    &mut Cursor::at(base_o.get(), &p[0]),
                    &ReadCursor::new(Cursor::at(base_a.get(), &p[1])),
                    &ReadCursor::new(Cursor::at(base_b.get(), &p[2])),
                )
            });
        }
    });
    Ok(())
}

/// Fold every element of `t` into an `R`.
///
/// Each worker folds its segment starting from `identity`; the partials are
/// then combined with `combine` in segment order, so the result is
/// deterministic for a fixed thread count.
pub fn apply_reduction<E, R, F, C>(
    cfg: &ParallelConfig,
    t: &Tensor<E>,
    identity: R,
    body: F,
    combine: C,
) -> Result<R>
where
    E: Element,
    R: Clone + Send + Sync,
    F: Fn(R, &ReadCursor<'_, E>) -> R + Sync,
    C: Fn(R, R) -> R + Sync,
{
    let n = t.elem_count();
    if n == 0 {
        return Ok(identity);
    }
    let plan = ApplyPlan::new(t.layout(), None, true)?;
    let guard = t.storage().read_guard()?;
    let keys = guard.keys();
    let base = SendPtr(t.storage().base_ptr());

    let fold_range = |start: usize, end: usize| -> R {
        let mut acc = Some(identity.clone());
        let mut plans = [plan.clone()];
        traverse_range(&mut plans, start, end, |p| {
            if let Some(prev) = acc.take() {
                acc = Some(body(prev, &ReadCursor::new(Cursor::at(base.get(), &p[0]))));
            }
        });
        acc.unwrap_or_else(|| identity.clone())
    };

    if !cfg.should_parallelize(n) {
        return Ok(fold_range(0, n));
    }

    let threads = cfg.threads();
    trace!("apply_reduction: n={n} threads={threads}");
    let partials: Vec<R> = (0..threads)
        .into_par_iter()
        .map(|tid| {
            let _held = Held::on_worker(keys);
            let (start, end) = segment(tid, threads, n);
            fold_range(start, end)
        })
        .collect();
    Ok(partials.into_iter().fold(identity, |acc, p| combine(acc, p)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_cover_range() {
        let n = 10_003;
        let threads = 4;
        let mut covered = 0;
        let mut next = 0;
        for tid in 0..threads {
            let (s, e) = segment(tid, threads, n);
            assert_eq!(s, next);
            covered += e - s;
            next = e;
        }
        assert_eq!(covered, n);
        assert_eq!(segment(3, 4, n), (7500, 10_003));
    }

    #[test]
    fn test_partition_rejects_overlapping_target() {
        let base = Layout::contiguous(crate::Shape::from((1, 8)));
        let expanded = base.expand(&crate::Shape::from((4, 8))).unwrap();
        let out = Participant {
            key: 1,
            layout: &expanded,
        };
        assert!(!partition_is_safe(&out, &[]));
    }

    #[test]
    fn test_partition_alias_rules() {
        let l = Layout::contiguous(crate::Shape::from((4, 4)));
        let t = l.transpose(0, 1).unwrap();
        let out = Participant { key: 7, layout: &l };
        let same = Participant { key: 7, layout: &l };
        let transposed = Participant { key: 7, layout: &t };
        let other = Participant { key: 9, layout: &t };
        assert!(partition_is_safe(&out, &[same]));
        assert!(!partition_is_safe(&out, &[transposed]));
        assert!(partition_is_safe(&out, &[other]));
    }
}
