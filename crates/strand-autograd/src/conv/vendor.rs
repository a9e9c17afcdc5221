// Vendor accelerator: pluggable device convolution kernels
//
// Device kernels live outside this crate. An accelerator registers itself in
// the BackendContext and is handed dense f64 host buffers plus a geometry;
// failures come back as a raw status code and surface as
// Error::Backend { backend, status }.
//
// ALGORITHM SELECTION (per pass, per geometry):
//
//   deterministic  keep only algorithms marked reproducible; none left is
//                  an error
//   benchmark      time every candidate once, remember the fastest in the
//                  context's AlgorithmCache
//   otherwise      first candidate the accelerator lists

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::debug;
use strand_core::{try_vec, Element, Error, FloatElement, Result};

use super::geometry::ConvGeometry;

/// Status reported when no algorithm satisfies the request.
pub const STATUS_NOT_SUPPORTED: i32 = 9;

/// Raw result of an accelerator call: a status code on failure.
pub type Status<T = ()> = std::result::Result<T, i32>;

/// The three convolution primitives an accelerator provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvPass {
    Forward,
    BackwardInput,
    BackwardWeight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlgorithmId(pub u32);

/// One algorithm an accelerator offers for a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmInfo {
    pub id: AlgorithmId,
    /// Bitwise reproducible across runs.
    pub deterministic: bool,
}

/// Device convolution kernels.
///
/// Buffers are dense, row-major and laid out as described by the geometry:
/// image `[N, C_img, D, H, W]`, weight `[C_out, C_img/G, kD, kH, kW]`,
/// output `[N, C_out, oD, oH, oW]`.
pub trait ConvAccelerator: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this accelerator can run the geometry at all.
    fn supports(&self, geometry: &ConvGeometry) -> bool;

    /// Candidate algorithms for a pass, in preference order.
    fn algorithms(&self, pass: ConvPass, geometry: &ConvGeometry) -> Vec<AlgorithmInfo>;

    /// Time one algorithm, in arbitrary units. Only called in benchmark mode.
    fn benchmark(&self, pass: ConvPass, geometry: &ConvGeometry, algo: AlgorithmId) -> Status<f64>;

    fn forward(
        &self,
        geometry: &ConvGeometry,
        algo: AlgorithmId,
        image: &[f64],
        weight: &[f64],
        out: &mut [f64],
    ) -> Status;

    fn backward_input(
        &self,
        geometry: &ConvGeometry,
        algo: AlgorithmId,
        grad_out: &[f64],
        weight: &[f64],
        grad_image: &mut [f64],
    ) -> Status;

    fn backward_weight(
        &self,
        geometry: &ConvGeometry,
        algo: AlgorithmId,
        image: &[f64],
        grad_out: &[f64],
        grad_weight: &mut [f64],
    ) -> Status;
}

/// Benchmark results shared by every convolution using one context.
///
/// Keyed by pass, geometry and whether only deterministic algorithms were
/// eligible: the winner of a restricted run says nothing about the
/// unrestricted one and the other way round.
#[derive(Debug, Default)]
pub struct AlgorithmCache {
    entries: Mutex<HashMap<(ConvPass, bool, ConvGeometry), AlgorithmId>>,
}

impl AlgorithmCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        pass: ConvPass,
        deterministic: bool,
        geometry: &ConvGeometry,
    ) -> Option<AlgorithmId> {
        let entries = self.entries.lock().ok()?;
        entries.get(&(pass, deterministic, geometry.clone())).copied()
    }

    pub fn insert(
        &self,
        pass: ConvPass,
        deterministic: bool,
        geometry: &ConvGeometry,
        algo: AlgorithmId,
    ) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert((pass, deterministic, geometry.clone()), algo);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// The accelerator a convolution was dispatched to, with its algorithm
/// choices. Kept by the backward node so every pass uses the same device
/// path.
pub struct VendorState {
    accelerator: Arc<dyn ConvAccelerator>,
    cache: Arc<AlgorithmCache>,
    benchmark: bool,
    deterministic: bool,
    chosen: HashMap<(ConvPass, ConvGeometry), AlgorithmId>,
}

impl fmt::Debug for VendorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VendorState")
            .field("accelerator", &self.accelerator.name())
            .field("benchmark", &self.benchmark)
            .field("deterministic", &self.deterministic)
            .field("chosen", &self.chosen.len())
            .finish()
    }
}

fn backend_error(accelerator: &dyn ConvAccelerator, status: i32) -> Error {
    Error::Backend {
        backend: accelerator.name().to_string(),
        status,
    }
}

fn to_f64<E: FloatElement>(data: &[E]) -> Vec<f64> {
    data.iter().map(|&v| Element::to_f64(v)).collect()
}

fn store<E: FloatElement>(src: &[f64], dst: &mut [E]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = *d + E::from_f64(s);
    }
}

impl VendorState {
    pub fn new(
        accelerator: Arc<dyn ConvAccelerator>,
        cache: Arc<AlgorithmCache>,
        benchmark: bool,
        deterministic: bool,
    ) -> Self {
        VendorState {
            accelerator,
            cache,
            benchmark,
            deterministic,
            chosen: HashMap::new(),
        }
    }

    pub fn accelerator(&self) -> &Arc<dyn ConvAccelerator> {
        &self.accelerator
    }

    fn algorithm(&mut self, pass: ConvPass, geometry: &ConvGeometry) -> Result<AlgorithmId> {
        let key = (pass, geometry.clone());
        if let Some(&algo) = self.chosen.get(&key) {
            return Ok(algo);
        }
        let acc = self.accelerator.as_ref();
        let mut candidates = acc.algorithms(pass, geometry);
        if self.deterministic {
            candidates.retain(|a| a.deterministic);
        }
        let Some(first) = candidates.first() else {
            return Err(backend_error(acc, STATUS_NOT_SUPPORTED));
        };

        let algo = if self.benchmark {
            match self.cache.get(pass, self.deterministic, geometry) {
                Some(hit) if candidates.iter().any(|c| c.id == hit) => hit,
                _ => {
                    let mut best = (f64::INFINITY, first.id);
                    for c in &candidates {
                        let t = acc
                            .benchmark(pass, geometry, c.id)
                            .map_err(|s| backend_error(acc, s))?;
                        if t < best.0 {
                            best = (t, c.id);
                        }
                    }
                    self.cache.insert(pass, self.deterministic, geometry, best.1);
                    best.1
                }
            }
        } else {
            first.id
        };
        debug!("{} {:?}: algorithm {:?}", acc.name(), pass, algo);
        self.chosen.insert(key, algo);
        Ok(algo)
    }

    /// out += conv(image, weight)
    pub fn forward<E: FloatElement>(
        &mut self,
        g: &ConvGeometry,
        image: &[E],
        weight: &[E],
        out: &mut [E],
    ) -> Result<()> {
        let algo = self.algorithm(ConvPass::Forward, g)?;
        let mut buf = try_vec(out.len(), 0.0)?;
        self.accelerator
            .forward(g, algo, &to_f64(image), &to_f64(weight), &mut buf)
            .map_err(|s| backend_error(self.accelerator.as_ref(), s))?;
        store(&buf, out);
        Ok(())
    }

    /// grad_image += adjoint of conv w.r.t. the image
    pub fn backward_input<E: FloatElement>(
        &mut self,
        g: &ConvGeometry,
        grad_out: &[E],
        weight: &[E],
        grad_image: &mut [E],
    ) -> Result<()> {
        let algo = self.algorithm(ConvPass::BackwardInput, g)?;
        let mut buf = try_vec(grad_image.len(), 0.0)?;
        self.accelerator
            .backward_input(g, algo, &to_f64(grad_out), &to_f64(weight), &mut buf)
            .map_err(|s| backend_error(self.accelerator.as_ref(), s))?;
        store(&buf, grad_image);
        Ok(())
    }

    /// grad_weight += adjoint of conv w.r.t. the weight
    pub fn backward_weight<E: FloatElement>(
        &mut self,
        g: &ConvGeometry,
        image: &[E],
        grad_out: &[E],
        grad_weight: &mut [E],
    ) -> Result<()> {
        let algo = self.algorithm(ConvPass::BackwardWeight, g)?;
        let mut buf = try_vec(grad_weight.len(), 0.0)?;
        self.accelerator
            .backward_weight(g, algo, &to_f64(image), &to_f64(grad_out), &mut buf)
            .map_err(|s| backend_error(self.accelerator.as_ref(), s))?;
        store(&buf, grad_weight);
        Ok(())
    }
}
