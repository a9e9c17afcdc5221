//! # strand-core
//!
//! Strided tensor views and the apply engine that walks them.
//!
//! This crate provides:
//! - [`Tensor`]: a typed strided view over shared, versioned [`Storage`]
//! - [`Shape`] / [`Layout`]: extents, signed strides and offset
//! - [`apply1`] / [`apply2`] / [`apply3`]: lockstep element traversal over
//!   merged contiguous runs, with an optional excluded dimension
//! - [`par_apply1`] / [`par_apply2`] / [`par_apply3`] / [`apply_reduction`]
//!  : the partitioned variants, driven by a [`ParallelConfig`]
//! - [`ops`]: element-wise kernels built on the engine
// - DType / Element: supported scalar types
// - Shape, Layout: view geometry
// - Storage: Arc'd buffer + version counter + traversal lock
// - Tensor: storage + layout
// - apply: planning, cursors, sequential traversal
// - parallel: partitioned traversal and reductions

pub mod apply;
pub mod config;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod ops;
pub mod parallel;
pub mod shape;
pub mod storage;
pub mod tensor;

pub use apply::{apply1, apply2, apply3, ApplyPlan, Cursor, ReadCursor};
pub use config::{ParallelConfig, PARALLEL_THRESHOLD};
pub use dtype::{DType, Element, FloatElement};
pub use error::{Error, Result};
pub use layout::{Layout, StridedIter};
pub use parallel::{apply_reduction, par_apply1, par_apply2, par_apply3};
pub use shape::Shape;
pub use storage::{try_vec, Device, Storage};
pub use tensor::Tensor;
