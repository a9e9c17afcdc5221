use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::ops;
use crate::shape::Shape;
use crate::storage::{Device, Storage};

// Tensor: a typed strided view over shared storage
//
// A Tensor<E> is nothing more than (storage, layout):
//
//   - storage: Arc'd flat buffer of E, shared by every view derived from it
//   - layout:  shape + signed strides + offset into that buffer
//
// Cloning is cheap (one Arc increment plus the small layout vectors).
// Transpose, narrow, permute, flip, expand and friends only build a new
// layout; the apply engine is what actually walks the elements.
//
// BOUNDS INVARIANT:
//
//   For every logical index, offset + Σ index[i] * stride[i] lies inside
//   the storage. Every constructor either builds a layout that satisfies
//   this by construction or checks it with `Layout::storage_span`. The
//   apply engine relies on it to dereference without per-element checks.

/// An n-dimensional strided view over a shared element buffer.
#[derive(Clone)]
pub struct Tensor<E: Element> {
    storage: Storage<E>,
    layout: Layout,
}

impl<E: Element> std::fmt::Debug for Tensor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(shape={}, strides={:?}, offset={}, dtype={}, device={})",
            self.layout.shape(),
            self.layout.strides(),
            self.layout.offset(),
            E::DTYPE,
            self.storage.device(),
        )
    }
}

impl<E: Element> Tensor<E> {
    // Construction

    /// Wrap storage with a layout, checking that every reachable index is
    /// inside the buffer.
    pub fn from_parts(storage: Storage<E>, layout: Layout) -> Result<Self> {
        if let Some((min, max)) = layout.storage_span() {
            if min < 0 || max >= storage.len() as isize {
                return Err(Error::ViewOutOfBounds {
                    min,
                    max,
                    len: storage.len(),
                });
            }
        }
        Ok(Tensor { storage, layout })
    }

    fn with_layout(&self, layout: Layout) -> Self {
        Tensor {
            storage: self.storage.clone(),
            layout,
        }
    }

    /// A dense tensor where every element is `val`.
    pub fn full(shape: impl Into<Shape>, val: E) -> Result<Self> {
        Self::full_on(shape, val, Device::Cpu)
    }

    /// Like [`Tensor::full`], tagged with `device`.
    pub fn full_on(shape: impl Into<Shape>, val: E, device: Device) -> Result<Self> {
        let shape = shape.into();
        let storage = Storage::try_alloc(shape.elem_count(), val, device)?;
        Ok(Tensor {
            storage,
            layout: Layout::contiguous(shape),
        })
    }

    pub fn zeros(shape: impl Into<Shape>) -> Result<Self> {
        Self::full(shape, E::zero())
    }

    pub fn ones(shape: impl Into<Shape>) -> Result<Self> {
        Self::full(shape, E::one())
    }

    /// Zeros with the same shape and device as `other`.
    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::full_on(other.shape().clone(), E::zero(), other.device())
    }

    /// Build a dense tensor from row-major data.
    pub fn from_vec(data: Vec<E>, shape: impl Into<Shape>) -> Result<Self> {
        Self::from_vec_on(data, shape, Device::Cpu)
    }

    /// Like [`Tensor::from_vec`], tagged with `device`.
    pub fn from_vec_on(data: Vec<E>, shape: impl Into<Shape>, device: Device) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got: data.len(),
            });
        }
        Ok(Tensor {
            storage: Storage::from_vec(data, device),
            layout: Layout::contiguous(shape),
        })
    }

    pub fn from_slice(data: &[E], shape: impl Into<Shape>) -> Result<Self> {
        Self::from_vec(data.to_vec(), shape)
    }

    /// Uniform values in [0, 1) from a seeded generator.
    pub fn rand(shape: impl Into<Shape>, seed: u64) -> Result<Self> {
        let shape = shape.into();
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..shape.elem_count())
            .map(|_| E::from_f64(rng.gen::<f64>()))
            .collect();
        Self::from_vec(data, shape)
    }

    /// Standard normal values from a seeded generator.
    pub fn randn(shape: impl Into<Shape>, seed: u64) -> Result<Self> {
        let shape = shape.into();
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..shape.elem_count())
            .map(|_| {
                let v: f64 = StandardNormal.sample(&mut rng);
                E::from_f64(v)
            })
            .collect();
        Self::from_vec(data, shape)
    }

    /// Dense copy tagged with another device.
    pub fn to_device(&self, device: Device) -> Result<Self> {
        if device == self.device() {
            return Ok(self.clone());
        }
        let data = self.to_vec()?;
        Ok(Tensor {
            storage: Storage::from_vec(data, device),
            layout: Layout::contiguous(self.shape().clone()),
        })
    }

    // Accessors

    pub fn storage(&self) -> &Storage<E> {
        &self.storage
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.layout.dims()
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    /// Extent of dimension `i`.
    pub fn size(&self, i: usize) -> Result<usize> {
        self.shape().dim(i)
    }

    pub fn strides(&self) -> &[isize] {
        self.layout.strides()
    }

    /// Stride of dimension `i`, in elements.
    pub fn stride(&self, i: usize) -> Result<isize> {
        self.layout
            .strides()
            .get(i)
            .copied()
            .ok_or(Error::DimOutOfRange {
                dim: i,
                rank: self.rank(),
            })
    }

    pub fn storage_offset(&self) -> usize {
        self.layout.offset()
    }

    /// Number of elements (0 for a zero-dimension view).
    pub fn elem_count(&self) -> usize {
        self.layout.elem_count()
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    pub fn dtype(&self) -> DType {
        E::DTYPE
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    /// Version counter of the underlying storage.
    pub fn version(&self) -> u64 {
        self.storage.version()
    }

    /// Pointer to the first element of the view.
    ///
    /// Dereferencing it is only sound while no traversal writes the storage.
    pub fn data_ptr(&self) -> *const E {
        self.storage
            .base_ptr()
            .wrapping_add(self.layout.offset())
            .cast_const()
    }

    // Views

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        Ok(self.with_layout(self.layout.transpose(dim0, dim1)?))
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        Ok(self.with_layout(self.layout.narrow(dim, start, len)?))
    }

    pub fn step(&self, dim: usize, step: usize) -> Result<Self> {
        Ok(self.with_layout(self.layout.step(dim, step)?))
    }

    pub fn permute(&self, order: &[usize]) -> Result<Self> {
        Ok(self.with_layout(self.layout.permute(order)?))
    }

    pub fn flip(&self, dim: usize) -> Result<Self> {
        Ok(self.with_layout(self.layout.flip(dim)?))
    }

    pub fn expand(&self, target: impl Into<Shape>) -> Result<Self> {
        Ok(self.with_layout(self.layout.expand(&target.into())?))
    }

    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        Ok(self.with_layout(self.layout.unsqueeze(dim)?))
    }

    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        Ok(self.with_layout(self.layout.squeeze(dim)?))
    }

    pub fn select(&self, dim: usize, index: usize) -> Result<Self> {
        Ok(self.with_layout(self.layout.select(dim, index)?))
    }

    /// Arbitrary strided view over the same storage, bounds checked.
    pub fn as_strided(
        &self,
        shape: impl Into<Shape>,
        strides: Vec<isize>,
        offset: usize,
    ) -> Result<Self> {
        let layout = self.layout.as_strided(shape.into(), strides, offset)?;
        Self::from_parts(self.storage.clone(), layout)
    }

    /// Reshape. Views the same storage when contiguous, copies otherwise.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        let current = self.elem_count();
        let target = new_shape.elem_count();
        if current != target {
            return Err(Error::ReshapeElementMismatch {
                src: current,
                dst: target,
                dst_shape: new_shape,
            });
        }
        let tensor = self.contiguous()?;
        let strides = new_shape.stride_contiguous();
        let layout = Layout::new(new_shape, strides, tensor.storage_offset())?;
        Ok(tensor.with_layout(layout))
    }

    /// A dense row-major tensor with the same values. Returns a clone when
    /// the view is already contiguous.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let dst = Self::full_on(self.shape().clone(), E::zero(), self.device())?;
        ops::copy_(&dst, self)?;
        Ok(dst)
    }

    // Data extraction

    /// All elements in lex-major order.
    pub fn to_vec(&self) -> Result<Vec<E>> {
        let _guard = self.storage.read_guard()?;
        Ok(self
            .layout
            .strided_indices()
            .map(|idx| self.storage.read_at(idx as usize))
            .collect())
    }

    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        Ok(self.to_vec()?.into_iter().map(Element::to_f64).collect())
    }

    /// Element at a multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Result<E> {
        if index.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: index.len(),
            });
        }
        for (d, (&i, &size)) in index.iter().zip(self.dims()).enumerate() {
            if i >= size {
                return Err(Error::NarrowOutOfBounds {
                    dim: d,
                    start: i,
                    len: 1,
                    dim_size: size,
                });
            }
        }
        let _guard = self.storage.read_guard()?;
        Ok(self.storage.read_at(self.layout.flat_index(index) as usize))
    }

    /// The single value of a one-element tensor.
    pub fn to_scalar(&self) -> Result<E> {
        if self.elem_count() != 1 {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(1),
                got: self.shape().clone(),
            });
        }
        let values = self.to_vec()?;
        values
            .first()
            .copied()
            .ok_or_else(|| Error::msg("to_scalar: empty tensor"))
    }
}
