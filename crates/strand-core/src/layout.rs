use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout: How a view's logical indices map into its storage
//
// The Layout decouples the *logical* shape of a view from how its elements
// sit in the storage buffer:
//
//   storage index = offset + Σ index[i] * stride[i]
//
// Strides are counted in ELEMENTS, not bytes, and are signed:
//
//   - positive:  the usual case ([2,3] contiguous → strides [3,1])
//   - zero:      a broadcast dimension (every index reads the same slot)
//   - negative:  a flipped dimension (offset points at the last element)
//
// Transpose, narrow, permute, flip, expand, select only rewrite the layout;
// no element moves. Whether a layout is still "contiguous" decides which
// path the apply engine takes.

/// Layout describes how a view's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<isize>,
    /// Index of the first element (logical index [0, 0, ...]) in storage.
    offset: usize,
}

impl Layout {
    /// A dense row-major layout starting at storage index 0.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Create a layout with explicit strides and offset.
    pub fn new(shape: Shape, strides: Vec<isize>, offset: usize) -> Result<Self> {
        if strides.len() != shape.rank() {
            return Err(Error::RankMismatch {
                expected: shape.rank(),
                got: strides.len(),
            });
        }
        Ok(Layout {
            shape,
            strides,
            offset,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    fn check_dim(&self, dim: usize) -> Result<()> {
        if dim >= self.rank() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: self.rank(),
            });
        }
        Ok(())
    }

    /// Whether strides follow dense row-major order on every dimension of
    /// extent > 1. Unit dimensions may carry any stride; the offset is not
    /// considered.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1isize;
        for (&size, &stride) in self.dims().iter().zip(self.strides.iter()).rev() {
            if size != 1 {
                if stride != expected {
                    return false;
                }
                expected *= size as isize;
            }
        }
        true
    }

    /// Smallest and largest storage index this layout can reach.
    /// `None` for an empty layout.
    pub fn storage_span(&self) -> Option<(isize, isize)> {
        if self.elem_count() == 0 {
            return None;
        }
        let mut min = self.offset as isize;
        let mut max = self.offset as isize;
        for (&size, &stride) in self.dims().iter().zip(self.strides.iter()) {
            let reach = (size as isize - 1) * stride;
            if reach < 0 {
                min += reach;
            } else {
                max += reach;
            }
        }
        Some((min, max))
    }

    /// True when no two logical indices share a storage slot.
    pub fn is_non_overlapping(&self) -> bool {
        let mut dims: Vec<(usize, usize)> = self
            .dims()
            .iter()
            .zip(self.strides.iter())
            .filter(|(&size, _)| size > 1)
            .map(|(&size, &stride)| (size, stride.unsigned_abs()))
            .collect();
        dims.sort_by_key(|&(_, stride)| stride);
        let mut span = 0usize;
        for (size, stride) in dims {
            if stride <= span {
                return false;
            }
            span += (size - 1) * stride;
        }
        true
    }

    /// Swap two dimensions.
    ///
    /// Example: [2, 3, 4] transpose(0, 2) → [4, 3, 2]
    ///          strides [12, 4, 1]         → [1, 4, 12]
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        self.check_dim(dim0.max(dim1))?;
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.strides.clone();
        new_dims.swap(dim0, dim1);
        new_strides.swap(dim0, dim1);
        Ok(Layout {
            shape: Shape::new(new_dims),
            strides: new_strides,
            offset: self.offset,
        })
    }

    /// Reorder all dimensions: new dim i is old dim `order[i]`.
    pub fn permute(&self, order: &[usize]) -> Result<Layout> {
        let rank = self.rank();
        if order.len() != rank {
            return Err(Error::RankMismatch {
                expected: rank,
                got: order.len(),
            });
        }
        let mut seen = vec![false; rank];
        for &d in order {
            self.check_dim(d)?;
            if seen[d] {
                return Err(Error::msg(format!("permute: dim {d} repeated in {order:?}")));
            }
            seen[d] = true;
        }
        let dims = order.iter().map(|&d| self.dims()[d]).collect();
        let strides = order.iter().map(|&d| self.strides[d]).collect();
        Ok(Layout {
            shape: Shape::new(dims),
            strides,
            offset: self.offset,
        })
    }

    /// Narrow (slice) along a dimension.
    ///
    /// Example: shape [4, 6], narrow(dim=1, start=2, len=3)
    /// → shape [4, 3], offset += 2 * stride[1]
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        self.check_dim(dim)?;
        let dim_size = self.dims()[dim];
        if start + len > dim_size {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        let mut new_dims = self.dims().to_vec();
        new_dims[dim] = len;
        let new_offset = self.offset as isize + start as isize * self.strides[dim];
        Ok(Layout {
            shape: Shape::new(new_dims),
            strides: self.strides.clone(),
            offset: new_offset as usize,
        })
    }

    /// Take every `step`-th index along `dim`, i.e. `t[.., ::step, ..]`.
    pub fn step(&self, dim: usize, step: usize) -> Result<Layout> {
        self.check_dim(dim)?;
        if step == 0 {
            return Err(Error::msg("step must be positive"));
        }
        let mut new_dims = self.dims().to_vec();
        new_dims[dim] = new_dims[dim].div_ceil(step);
        let mut strides = self.strides.clone();
        strides[dim] *= step as isize;
        Ok(Layout {
            shape: Shape::new(new_dims),
            strides,
            offset: self.offset,
        })
    }

    /// Reverse the order of indices along `dim` by negating its stride.
    pub fn flip(&self, dim: usize) -> Result<Layout> {
        self.check_dim(dim)?;
        let size = self.dims()[dim];
        let mut strides = self.strides.clone();
        let offset = if size == 0 {
            self.offset
        } else {
            (self.offset as isize + (size as isize - 1) * strides[dim]) as usize
        };
        strides[dim] = -strides[dim];
        Ok(Layout {
            shape: self.shape.clone(),
            strides,
            offset,
        })
    }

    /// Broadcast unit dimensions (and new leading dimensions) to `target`
    /// with stride 0.
    pub fn expand(&self, target: &Shape) -> Result<Layout> {
        let src = self.dims();
        let dst = target.dims();
        if dst.len() < src.len() {
            return Err(Error::msg(format!(
                "expand: target {target} has fewer dims than source {}",
                self.shape
            )));
        }
        let lead = dst.len() - src.len();
        let mut strides = vec![0isize; dst.len()];
        for i in 0..src.len() {
            if src[i] == dst[lead + i] {
                strides[lead + i] = self.strides[i];
            } else if src[i] != 1 {
                return Err(Error::msg(format!(
                    "expand: cannot broadcast {} to {target} (dim {i}: {} vs {})",
                    self.shape,
                    src[i],
                    dst[lead + i]
                )));
            }
        }
        Ok(Layout {
            shape: target.clone(),
            strides,
            offset: self.offset,
        })
    }

    /// A view with explicit shape, strides and offset over the same storage.
    pub fn as_strided(&self, shape: Shape, strides: Vec<isize>, offset: usize) -> Result<Layout> {
        Layout::new(shape, strides, offset)
    }

    /// Insert a unit dimension at `dim`.
    pub fn unsqueeze(&self, dim: usize) -> Result<Layout> {
        if dim > self.rank() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: self.rank() + 1,
            });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        let stride = if dim < self.rank() {
            strides[dim] * dims[dim] as isize
        } else {
            1
        };
        dims.insert(dim, 1);
        strides.insert(dim, stride);
        Ok(Layout {
            shape: Shape::new(dims),
            strides,
            offset: self.offset,
        })
    }

    /// Remove a unit dimension at `dim`.
    pub fn squeeze(&self, dim: usize) -> Result<Layout> {
        self.check_dim(dim)?;
        if self.dims()[dim] != 1 {
            return Err(Error::msg(format!(
                "squeeze: dim {dim} has size {}, expected 1",
                self.dims()[dim]
            )));
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.remove(dim);
        strides.remove(dim);
        Ok(Layout {
            shape: Shape::new(dims),
            strides,
            offset: self.offset,
        })
    }

    /// Fix `dim` at `index` and drop it.
    pub fn select(&self, dim: usize, index: usize) -> Result<Layout> {
        let narrowed = self.narrow(dim, index, 1)?;
        narrowed.squeeze(dim)
    }

    /// Storage index of a multi-dimensional index:
    /// offset + Σ index[i] * stride[i]
    pub fn flat_index(&self, index: &[usize]) -> isize {
        let mut flat = self.offset as isize;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx as isize * self.strides[i];
        }
        flat
    }

    /// Iterator over the storage index of every element, in lex-major
    /// (innermost-fastest) order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

// StridedIter: reference element-by-element walk
//
// Walks one multi-index at a time with no run merging. The apply engine is
// required to visit storage in exactly this order, so tests compare against
// it.

/// Iterator that yields storage indices for each element of a Layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<isize>,
    offset: isize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            offset: layout.offset() as isize,
            remaining: layout.elem_count(),
            started: false,
        }
    }

    fn flat_index(&self) -> isize {
        let mut idx = self.offset;
        for i in 0..self.current.len() {
            idx += self.current[i] as isize * self.strides[i];
        }
        idx
    }

    /// Advance the multi-dimensional index by one (rightmost dimension first).
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = isize;

    fn next(&mut self) -> Option<isize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_layout() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert!(layout.is_contiguous());
        assert_eq!(layout.strides(), &[3, 1]);
        assert_eq!(layout.offset(), 0);
    }

    #[test]
    fn test_unit_dims_ignored_for_contiguity() {
        let layout = Layout::new(Shape::from((2, 1, 3)), vec![3, 99, 1], 5).unwrap();
        assert!(layout.is_contiguous());
    }

    #[test]
    fn test_transpose_indices() {
        // [[0, 1, 2],
        //  [3, 4, 5]] read column-major: 0, 3, 1, 4, 2, 5
        let layout = Layout::contiguous(Shape::from((2, 3)));
        let transposed = layout.transpose(0, 1).unwrap();
        assert!(!transposed.is_contiguous());
        let indices: Vec<isize> = transposed.strided_indices().collect();
        assert_eq!(indices, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_narrow() {
        let layout = Layout::contiguous(Shape::from((4, 6)));
        let narrowed = layout.narrow(1, 2, 3).unwrap();
        assert_eq!(narrowed.dims(), &[4, 3]);
        assert_eq!(narrowed.offset(), 2);
        assert_eq!(narrowed.strides(), &[6, 1]);
        assert!(layout.narrow(1, 5, 3).is_err());
    }

    #[test]
    fn test_flip_uses_negative_stride() {
        let layout = Layout::contiguous(Shape::from(4));
        let flipped = layout.flip(0).unwrap();
        assert_eq!(flipped.strides(), &[-1]);
        assert_eq!(flipped.offset(), 3);
        let indices: Vec<isize> = flipped.strided_indices().collect();
        assert_eq!(indices, vec![3, 2, 1, 0]);
        assert_eq!(flipped.storage_span(), Some((0, 3)));
    }

    #[test]
    fn test_expand_and_overlap() {
        let layout = Layout::contiguous(Shape::from((1, 3)));
        let expanded = layout.expand(&Shape::from((4, 3))).unwrap();
        assert_eq!(expanded.strides(), &[0, 1]);
        assert!(!expanded.is_non_overlapping());
        assert!(layout.is_non_overlapping());
        assert!(layout.transpose(0, 1).unwrap().is_non_overlapping());
    }

    #[test]
    fn test_step_and_select() {
        let layout = Layout::contiguous(Shape::from((4, 4)));
        let every_other = layout.step(1, 2).unwrap();
        assert_eq!(every_other.dims(), &[4, 2]);
        assert_eq!(every_other.strides(), &[4, 2]);
        let row = layout.select(0, 2).unwrap();
        assert_eq!(row.dims(), &[4]);
        assert_eq!(row.offset(), 8);
    }

    #[test]
    fn test_flat_index() {
        let layout = Layout::contiguous(Shape::from((2, 3, 4)));
        assert_eq!(layout.flat_index(&[1, 2, 3]), 23);
        assert_eq!(layout.flat_index(&[0, 0, 0]), 0);
    }
}
