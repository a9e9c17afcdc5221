use crate::apply::apply1;
use crate::config::ParallelConfig;
use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::parallel::{apply_reduction, par_apply1, par_apply2, par_apply3};
use crate::shape::Shape;
use crate::tensor::Tensor;

// Element-wise kernels built on the apply engine
//
// In-place kernels (trailing underscore) write through the first argument
// and bump its storage version so that autograd notices the mutation.
// Out-of-place kernels allocate a dense result.
//
// All of them go through the parallel entry points with the process-wide
// ParallelConfig; small tensors fall back to the calling thread there.

fn same_shape(a: &Shape, b: &Shape) -> Result<()> {
    if a != b {
        return Err(Error::ShapeMismatch {
            expected: a.clone(),
            got: b.clone(),
        });
    }
    Ok(())
}

/// dst[i] = src[i]. Only element counts must agree.
pub fn copy_<E: Element>(dst: &Tensor<E>, src: &Tensor<E>) -> Result<()> {
    par_apply2(&ParallelConfig::global(), dst, src, |d, s| d.set(s.get()))?;
    dst.storage().bump_version();
    Ok(())
}

/// Set every element to `value`.
pub fn fill_<E: Element>(t: &Tensor<E>, value: E) -> Result<()> {
    par_apply1(&ParallelConfig::global(), t, |c| c.set(value))?;
    t.storage().bump_version();
    Ok(())
}

/// dst += alpha * src
pub fn add_<E: Element>(dst: &Tensor<E>, src: &Tensor<E>, alpha: E) -> Result<()> {
    same_shape(dst.shape(), src.shape())?;
    par_apply2(&ParallelConfig::global(), dst, src, |d, s| {
        d.update(|v| v + alpha * s.get())
    })?;
    dst.storage().bump_version();
    Ok(())
}

/// t *= alpha
pub fn scale_<E: Element>(t: &Tensor<E>, alpha: E) -> Result<()> {
    par_apply1(&ParallelConfig::global(), t, |c| c.update(|v| v * alpha))?;
    t.storage().bump_version();
    Ok(())
}

fn binary<E, F>(a: &Tensor<E>, b: &Tensor<E>, f: F) -> Result<Tensor<E>>
where
    E: Element,
    F: Fn(E, E) -> E + Sync,
{
    same_shape(a.shape(), b.shape())?;
    let out = Tensor::zeros_like(a)?;
    par_apply3(&ParallelConfig::global(), &out, a, b, |o, x, y| {
        o.set(f(x.get(), y.get()))
    })?;
    Ok(out)
}

pub fn add<E: Element>(a: &Tensor<E>, b: &Tensor<E>) -> Result<Tensor<E>> {
    binary(a, b, |x, y| x + y)
}

pub fn sub<E: Element>(a: &Tensor<E>, b: &Tensor<E>) -> Result<Tensor<E>> {
    binary(a, b, |x, y| x - y)
}

pub fn mul<E: Element>(a: &Tensor<E>, b: &Tensor<E>) -> Result<Tensor<E>> {
    binary(a, b, |x, y| x * y)
}

/// Sum of all elements.
pub fn sum_all<E: Element>(t: &Tensor<E>) -> Result<E> {
    apply_reduction(
        &ParallelConfig::global(),
        t,
        E::zero(),
        |acc, c| acc + c.get(),
        |a, b| a + b,
    )
}

/// Sum over every dimension except `dim`; result has `size(dim)` entries.
///
/// Walks the tensor with `dim` excluded from run merging and buckets each
/// element by its index along `dim`.
pub fn sum_except_dim<E: Element>(t: &Tensor<E>, dim: usize) -> Result<Vec<E>> {
    let len = t.size(dim)?;
    let mut acc = vec![E::zero(); len];
    apply1(t, Some(dim), |c| {
        if let Some(k) = c.dim_index() {
            acc[k] = acc[k] + c.get();
        }
    })?;
    Ok(acc)
}

/// out[n, c, ...] += bias[c] for an `[N, C, ...]` tensor.
///
/// The bias is broadcast with a stride-0 view; no expanded copy is made.
pub fn add_channel_bias_<E: Element>(out: &Tensor<E>, bias: &Tensor<E>) -> Result<()> {
    if out.rank() < 2 {
        return Err(Error::RankMismatch {
            expected: 2,
            got: out.rank(),
        });
    }
    let channels = out.dims()[1];
    if bias.dims() != [channels] {
        return Err(Error::ShapeMismatch {
            expected: Shape::from(channels),
            got: bias.shape().clone(),
        });
    }
    let mut view = bias.unsqueeze(0)?;
    for _ in 2..out.rank() {
        view = view.unsqueeze(view.rank())?;
    }
    let broadcast = view.expand(out.shape().clone())?;
    par_apply2(&ParallelConfig::global(), out, &broadcast, |o, b| {
        o.update(|v| v + b.get())
    })?;
    out.storage().bump_version();
    Ok(())
}
