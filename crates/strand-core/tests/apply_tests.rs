// Integration tests for the strided apply engine
//
// These walk real views (transposed, narrowed, stepped, flipped, broadcast)
// through the sequential and parallel entry points and compare against the
// element-by-element reference order from Layout::strided_indices.

use std::sync::atomic::{AtomicUsize, Ordering};

use strand_core::ops;
use strand_core::{
    apply1, apply2, apply3, apply_reduction, par_apply1, par_apply2, par_apply3, ApplyPlan,
    Error, Layout, ParallelConfig, Result, Shape, Tensor,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn arange(n: usize, shape: impl Into<Shape>) -> Result<Tensor<i64>> {
    Tensor::from_vec((0..n as i64).collect(), shape)
}

/// A forced-parallel config: tiny threshold, several partitions.
fn eager_parallel(threads: usize) -> ParallelConfig {
    ParallelConfig::default()
        .with_threshold(1)
        .with_num_threads(threads)
}

// Contiguous and strided copies

#[test]
fn test_contiguous_add() -> Result<()> {
    init_logging();
    let a = Tensor::<f32>::from_vec(vec![1., 2., 3., 4., 5., 6.], (2, 3))?;
    let b = Tensor::<f32>::from_vec(vec![10., 20., 30., 40., 50., 60.], (2, 3))?;
    let c = Tensor::<f32>::zeros((2, 3))?;
    apply3(&a, &b, &c, None, |a, b, c| c.set(a.get() + b.get()))?;
    assert_eq!(c.to_vec()?, vec![11., 22., 33., 44., 55., 66.]);
    Ok(())
}

#[test]
fn test_strided_copy() -> Result<()> {
    let s = arange(16, (4, 4))?;
    let v = s.step(1, 2)?;
    assert_eq!(v.dims(), &[4, 2]);
    assert_eq!(v.strides(), &[4, 2]);
    let d = Tensor::<i64>::zeros((4, 2))?;
    apply2(&d, &v, None, |d, s| d.set(s.get()))?;
    assert_eq!(d.to_vec()?, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    Ok(())
}

#[test]
fn test_size_mismatch_visits_nothing() -> Result<()> {
    let a = Tensor::<f64>::zeros((2, 3))?;
    let b = Tensor::<f64>::zeros((4, 2))?;
    let mut visited = 0;
    let err = apply2(&a, &b, None, |_, _| visited += 1).unwrap_err();
    assert_eq!(visited, 0);
    match err {
        Error::ApplySizeMismatch { tensors } => {
            assert_eq!(tensors.len(), 2);
            assert_eq!(tensors[0].0, "tensor1");
            assert_eq!(tensors[1].2, 8);
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn test_size_mismatch_three_way_message() -> Result<()> {
    let a = Tensor::<f64>::zeros(4)?;
    let b = Tensor::<f64>::zeros(4)?;
    let c = Tensor::<f64>::zeros(5)?;
    let err = apply3(&a, &b, &c, None, |_, _, _| {}).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("tensor1 [4], tensor2 [4] and tensor3 [5]"), "{msg}");
    assert!(msg.contains("4, 4 and 5 elements"), "{msg}");
    Ok(())
}

#[test]
fn test_equal_counts_different_shapes_are_accepted() -> Result<()> {
    // Only element counts must agree; the two views are walked in their own
    // lex-major order.
    let a = arange(6, (2, 3))?;
    let b = Tensor::<i64>::zeros((3, 2))?;
    apply2(&b, &a, None, |b, a| b.set(a.get()))?;
    assert_eq!(b.to_vec()?, (0..6).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_parallel_sum_is_exact() -> Result<()> {
    init_logging();
    let ones = Tensor::<i64>::ones(100_000)?;
    let cfg = ParallelConfig::default().with_num_threads(4);
    for _ in 0..3 {
        let total = apply_reduction(&cfg, &ones, 0i64, |acc, c| acc + c.get(), |a, b| a + b)?;
        assert_eq!(total, 100_000);
    }
    let ones = Tensor::<f32>::ones(100_000)?;
    let first = apply_reduction(&cfg, &ones, 0f32, |acc, c| acc + c.get(), |a, b| a + b)?;
    for _ in 0..3 {
        let again = apply_reduction(&cfg, &ones, 0f32, |acc, c| acc + c.get(), |a, b| a + b)?;
        assert_eq!(first.to_bits(), again.to_bits());
    }
    assert_eq!(first, 100_000.0);
    Ok(())
}

// Traversal invariants

fn visit_order(t: &Tensor<i64>, dim: Option<usize>) -> Result<Vec<isize>> {
    let mut seen = Vec::new();
    apply1(t, dim, |c| seen.push(c.storage_index()))?;
    Ok(seen)
}

fn awkward_views() -> Result<Vec<Tensor<i64>>> {
    let base = arange(60, (3, 4, 5))?;
    Ok(vec![
        base.clone(),
        base.transpose(0, 2)?,
        base.narrow(2, 1, 3)?,
        base.narrow(1, 1, 2)?.transpose(0, 1)?,
        base.permute(&[1, 2, 0])?,
        base.flip(1)?,
        base.step(2, 2)?,
        base.select(1, 2)?,
        base.narrow(0, 1, 1)?,
        base.select(0, 1)?.flip(0)?.step(1, 3)?,
    ])
}

#[test]
fn test_every_dim_visits_each_element_once_in_order() -> Result<()> {
    for view in awkward_views()? {
        let reference: Vec<isize> = view.layout().strided_indices().collect();
        assert_eq!(visit_order(&view, None)?, reference, "{view:?}");
        for d in 0..view.rank() {
            assert_eq!(visit_order(&view, Some(d))?, reference, "{view:?} dim {d}");
        }
    }
    Ok(())
}

#[test]
fn test_lockstep_pairs_match_reference() -> Result<()> {
    let views = awkward_views()?;
    for a in &views {
        for b in &views {
            if a.elem_count() != b.elem_count() {
                continue;
            }
            let ra: Vec<isize> = a.layout().strided_indices().collect();
            let rb: Vec<isize> = b.layout().strided_indices().collect();
            let mut pairs = Vec::new();
            apply2(a, b, None, |x, y| {
                pairs.push((x.storage_index(), y.storage_index()))
            })?;
            let expected: Vec<(isize, isize)> = ra.into_iter().zip(rb).collect();
            assert_eq!(pairs, expected, "{a:?} vs {b:?}");
        }
    }
    Ok(())
}

#[test]
fn test_fast_path_and_nested_path_agree() -> Result<()> {
    let a = arange(24, (2, 3, 4))?;
    let b = Tensor::<i64>::zeros((2, 3, 4))?;
    apply2(&b, &a, None, |b, a| b.set(a.get() * 2))?;
    let c = Tensor::<i64>::zeros((2, 3, 4))?;
    apply2(&c, &a, Some(1), |c, a| c.set(a.get() * 2))?;
    assert_eq!(b.to_vec()?, c.to_vec()?);
    Ok(())
}

#[test]
fn test_merging_never_crosses_excluded_dim() -> Result<()> {
    for view in awkward_views()? {
        for d in 0..view.rank() {
            let plan = ApplyPlan::new(view.layout(), Some(d), true)?;
            let run = plan.dim_run().expect("excluded dim has a run");
            assert_eq!(plan.sizes()[run], view.dims()[d], "{view:?} dim {d}");
            assert_eq!(plan.strides()[run], view.strides()[d], "{view:?} dim {d}");
        }
    }
    Ok(())
}

#[test]
fn test_dim_index_tracks_excluded_dim() -> Result<()> {
    let t = arange(24, (2, 3, 4))?.transpose(1, 2)?;
    for d in 0..3 {
        let mut indices = Vec::new();
        apply1(&t, Some(d), |c| indices.push(c.dim_index()))?;
        let mut expected = Vec::new();
        for i in 0..2 {
            for j in 0..4 {
                for k in 0..3 {
                    expected.push(Some([i, j, k][d]));
                }
            }
        }
        assert_eq!(indices, expected, "dim {d}");
    }
    Ok(())
}

#[test]
fn test_run_cursors() -> Result<()> {
    // [3, 4] narrowed from [3, 6]: three runs of four, stride 1.
    let t = arange(18, (3, 6))?.narrow(1, 1, 4)?;
    let mut runs = Vec::new();
    apply1(&t, None, |c| runs.push((c.run_index(), c.run_len(), c.run_stride())))?;
    assert_eq!(runs.len(), 12);
    assert!(runs.iter().all(|&(_, len, stride)| len == 4 && stride == 1));
    assert_eq!(
        runs.iter().map(|r| r.0).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3]
    );
    Ok(())
}

#[test]
fn test_apply1_never_takes_fast_path() -> Result<()> {
    let t = arange(6, (2, 3))?;
    let mut lens = Vec::new();
    apply1(&t, None, |c| lens.push(c.run_len()))?;
    assert_eq!(lens, vec![6; 6]);
    assert!(!ApplyPlan::new(t.layout(), None, false)?.is_contiguous());
    Ok(())
}

#[test]
fn test_empty_views_never_invoke_body() -> Result<()> {
    let scalar = Tensor::<f64>::zeros(())?;
    let empty = Tensor::<f64>::zeros((3, 0))?;
    let mut calls = 0;
    apply1(&scalar, None, |_| calls += 1)?;
    apply1(&empty, None, |_| calls += 1)?;
    apply2(&scalar, &empty, None, |_, _| calls += 1)?;
    par_apply1(&eager_parallel(4), &empty, |_| panic!("visited empty view"))?;
    assert_eq!(calls, 0);
    Ok(())
}

#[test]
fn test_single_element_view() -> Result<()> {
    let t = arange(12, (3, 4))?.narrow(0, 2, 1)?.narrow(1, 3, 1)?;
    let mut seen = Vec::new();
    apply1(&t, Some(0), |c| seen.push(c.get()))?;
    assert_eq!(seen, vec![11]);
    Ok(())
}

#[test]
fn test_aliased_views_in_place_transpose_add() -> Result<()> {
    // a += a^T on a 3x3 matrix, sequentially: later elements see earlier writes.
    let a = Tensor::<i64>::from_vec(vec![1, 2, 3, 4, 5, 6, 7, 8, 9], (3, 3))?;
    let at = a.transpose(0, 1)?;
    apply2(&a, &at, None, |x, y| {
        let v = x.get() + y.get();
        x.set(v)
    })?;
    assert_eq!(a.to_vec()?, vec![2, 6, 10, 10, 10, 14, 17, 22, 18]);
    Ok(())
}

#[test]
fn test_flip_roundtrip_copy() -> Result<()> {
    let s = arange(10, 10)?;
    let d = Tensor::<i64>::zeros(10)?;
    apply2(&d, &s.flip(0)?, None, |d, s| d.set(s.get()))?;
    assert_eq!(d.to_vec()?, (0..10).rev().collect::<Vec<_>>());
    let back = Tensor::<i64>::zeros(10)?;
    apply2(&back.flip(0)?, &d, None, |b, d| b.set(d.get()))?;
    assert_eq!(back.to_vec()?, s.to_vec()?);
    Ok(())
}

#[test]
fn test_identity_body_and_copy_back_preserve_data() -> Result<()> {
    let v = Tensor::<f64>::randn((3, 4, 5), 21)?.transpose(0, 2)?;
    let before = v.to_vec()?;
    apply1(&v, Some(1), |c| c.set(c.get()))?;
    assert_eq!(v.to_vec()?, before);

    let w = Tensor::<f64>::zeros(v.shape().clone())?;
    apply2(&w, &v, None, |w, v| w.set(v.get()))?;
    apply2(&v, &w, None, |v, w| v.set(w.get()))?;
    let after = v.to_vec()?;
    assert!(before.iter().zip(&after).all(|(a, b)| a.to_bits() == b.to_bits()));
    Ok(())
}

#[test]
fn test_mixed_element_types() -> Result<()> {
    let idx = arange(4, 4)?;
    let out = Tensor::<f32>::zeros(4)?;
    apply2(&out, &idx, None, |o, i| o.set(i.get() as f32 * 0.5))?;
    assert_eq!(out.to_vec()?, vec![0.0, 0.5, 1.0, 1.5]);
    Ok(())
}

#[test]
fn test_plan_for_as_strided_overlap() -> Result<()> {
    // Sliding windows of width 3 over [0..6): overlapping reads are fine.
    let s = arange(6, 6)?;
    let windows = s.as_strided((4, 3), vec![1, 1], 0)?;
    let out = Tensor::<i64>::zeros((4, 3))?;
    apply2(&out, &windows, None, |o, w| o.set(w.get()))?;
    assert_eq!(out.to_vec()?, vec![0, 1, 2, 1, 2, 3, 2, 3, 4, 3, 4, 5]);
    assert!(s.as_strided((4, 3), vec![1, 1], 4).is_err());
    Ok(())
}

// Parallel path

#[test]
fn test_parallel_matches_sequential_on_strided_views() -> Result<()> {
    init_logging();
    for threads in [1, 2, 3, 7] {
        let cfg = eager_parallel(threads);
        for view in awkward_views()? {
            let n = view.elem_count();
            let out = Tensor::<i64>::zeros(n)?;
            par_apply2(&cfg, &out, &view, |o, v| o.set(v.get()))?;
            assert_eq!(out.to_vec()?, view.to_vec()?, "{view:?} threads {threads}");
        }
    }
    Ok(())
}

#[test]
fn test_parallel_writes_into_strided_target() -> Result<()> {
    let base = Tensor::<i64>::zeros((6, 8))?;
    let target = base.transpose(0, 1)?.narrow(0, 2, 5)?;
    let src = arange(30, (5, 6))?;
    par_apply2(&eager_parallel(4), &target, &src, |t, s| t.set(s.get() + 1))?;
    assert_eq!(target.to_vec()?, (1..31).collect::<Vec<_>>());
    // columns outside the narrowed range untouched
    assert_eq!(base.narrow(1, 0, 2)?.to_vec()?, vec![0; 12]);
    Ok(())
}

#[test]
fn test_parallel_three_way() -> Result<()> {
    let a = Tensor::<f64>::randn((64, 97), 3)?;
    let b = Tensor::<f64>::randn((97, 64), 4)?.transpose(0, 1)?;
    let out = Tensor::<f64>::zeros((64, 97))?;
    par_apply3(&eager_parallel(5), &out, &a, &b, |o, x, y| o.set(x.get() * y.get()))?;
    let expected: Vec<f64> = a
        .to_vec()?
        .iter()
        .zip(b.to_vec()?)
        .map(|(x, y)| x * y)
        .collect();
    assert_vec_approx(&out.to_vec()?, &expected, 1e-12);
    Ok(())
}

#[test]
fn test_parallel_in_place_same_layout() -> Result<()> {
    let a = arange(10_000, (100, 100))?;
    let alias = a.clone();
    par_apply2(&eager_parallel(4), &a, &alias, |x, y| x.set(y.get() * 3))?;
    assert_eq!(a.to_vec()?, (0..10_000).map(|v| v * 3).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_parallel_falls_back_for_aliased_transpose() -> Result<()> {
    // Same result as the sequential traversal, since the fallback runs it.
    let seq = Tensor::<i64>::from_vec(vec![1, 2, 3, 4, 5, 6, 7, 8, 9], (3, 3))?;
    apply2(&seq, &seq.transpose(0, 1)?, None, |x, y| {
        let v = x.get() + y.get();
        x.set(v)
    })?;
    let par = Tensor::<i64>::from_vec(vec![1, 2, 3, 4, 5, 6, 7, 8, 9], (3, 3))?;
    par_apply2(&eager_parallel(4), &par, &par.transpose(0, 1)?, |x, y| {
        let v = x.get() + y.get();
        x.set(v)
    })?;
    assert_eq!(par.to_vec()?, seq.to_vec()?);
    Ok(())
}

#[test]
fn test_parallel_falls_back_for_broadcast_target() -> Result<()> {
    let cell = Tensor::<i64>::zeros(1)?;
    let broadcast = cell.expand(5000)?;
    par_apply1(&eager_parallel(4), &broadcast, |c| c.update(|v| v + 1))?;
    assert_eq!(cell.to_vec()?, vec![5000]);
    Ok(())
}

#[test]
fn test_parallel_visits_each_element_once() -> Result<()> {
    let t = Tensor::<u32>::zeros((50, 300))?.transpose(0, 1)?;
    let calls = AtomicUsize::new(0);
    par_apply1(&eager_parallel(6), &t, |c| {
        calls.fetch_add(1, Ordering::Relaxed);
        c.update(|v| v + 1);
    })?;
    assert_eq!(calls.load(Ordering::Relaxed), 15_000);
    assert!(t.to_vec()?.iter().all(|&v| v == 1));
    Ok(())
}

#[test]
fn test_reduction_over_strided_view() -> Result<()> {
    let t = arange(10_000, (100, 100))?.transpose(0, 1)?.narrow(0, 10, 50)?;
    let expected: i64 = t.to_vec()?.iter().sum();
    for threads in [1, 3, 8] {
        let got = apply_reduction(&eager_parallel(threads), &t, 0i64, |a, c| a + c.get(), |a, b| a + b)?;
        assert_eq!(got, expected);
    }
    Ok(())
}

#[test]
fn test_reduction_below_threshold_runs_inline() -> Result<()> {
    let t = Tensor::<f64>::ones(10)?;
    let cfg = ParallelConfig::default();
    let total = apply_reduction(&cfg, &t, 0.0, |a, c| a + c.get(), |a, b| a + b)?;
    assert_eq!(total, 10.0);
    Ok(())
}

#[test]
fn test_ops_use_engine_on_views() -> Result<()> {
    let a = Tensor::<f64>::randn((40, 150), 11)?;
    let at = a.transpose(0, 1)?;
    let dense = at.contiguous()?;
    assert!(dense.is_contiguous());
    assert_vec_approx(&dense.to_vec()?, &at.to_vec()?, 1e-15);
    let doubled = ops::add(&at, &at)?;
    let expected: Vec<f64> = at.to_vec()?.iter().map(|v| v * 2.0).collect();
    assert_vec_approx(&doubled.to_vec()?, &expected, 1e-12);
    Ok(())
}

#[test]
fn test_layout_reference_iterator_is_exact_size() {
    let l = Layout::contiguous(Shape::from((3, 5))).transpose(0, 1).unwrap();
    assert_eq!(l.strided_indices().len(), 15);
}

// Re-entrant access

#[test]
fn test_body_reading_its_own_storage_fails() -> Result<()> {
    let a = Tensor::<f32>::from_vec(vec![1., 2., 3.], 3)?;
    let alias = a.clone();
    let mut inner = Vec::new();
    apply1(&a, None, |c| {
        inner.push(alias.to_vec());
        c.set(c.get() * 2.);
    })?;
    assert_eq!(inner.len(), 3);
    assert!(inner.iter().all(|r| matches!(r, Err(Error::StorageReentered))));
    assert_eq!(alias.to_vec()?, vec![2., 4., 6.]);
    Ok(())
}

#[test]
fn test_nested_apply_on_other_storage_runs() -> Result<()> {
    let a = Tensor::<i64>::from_vec(vec![1, 2], 2)?;
    let b = Tensor::<i64>::from_vec(vec![10, 20], 2)?;
    let other = Tensor::<i64>::zeros(2)?;
    let mut nested = Vec::new();
    apply2(&a, &b, None, |x, y| {
        x.set(x.get() + y.get());
        nested.push(apply1(&other, None, |o| o.set(o.get() + 1)).is_ok());
        nested.push(apply1(&b, None, |_| {}).is_ok());
    })?;
    assert_eq!(nested, vec![true, false, true, false]);
    assert_eq!(a.to_vec()?, vec![11, 22]);
    assert_eq!(other.to_vec()?, vec![2, 2]);
    Ok(())
}

#[test]
fn test_parallel_body_reading_target_fails() -> Result<()> {
    let t = Tensor::<f64>::zeros(64)?;
    let alias = t.clone();
    let refused = AtomicUsize::new(0);
    par_apply1(&eager_parallel(4), &t, |c| {
        if matches!(alias.get(&[0]), Err(Error::StorageReentered)) {
            refused.fetch_add(1, Ordering::Relaxed);
        }
        c.set(1.0);
    })?;
    assert_eq!(refused.load(Ordering::Relaxed), 64);
    assert_eq!(t.to_vec()?, vec![1.0; 64]);
    Ok(())
}
