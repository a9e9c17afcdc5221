// BackendContext: which convolution kernels may be used
//
// Mirrors the way ParallelConfig works in strand-core: a plain struct with
// builder methods, passed explicitly where it matters, with a process-wide
// default for everything else.
//
//   cudnn_enabled   allow the registered vendor accelerator
//   benchmark       let the accelerator time its algorithms once per geometry
//   deterministic   restrict the accelerator to reproducible algorithms
//   mkldnn_enabled  allow the batch-parallel host kernels
//   nnpack_enabled  allow the direct spatial host kernels

use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use crate::conv::vendor::{AlgorithmCache, ConvAccelerator};

/// Backend flags and registered accelerator for convolutions.
#[derive(Clone)]
pub struct BackendContext {
    pub cudnn_enabled: bool,
    pub benchmark: bool,
    pub deterministic: bool,
    pub mkldnn_enabled: bool,
    pub nnpack_enabled: bool,
    accelerator: Option<Arc<dyn ConvAccelerator>>,
    algorithm_cache: Arc<AlgorithmCache>,
}

impl Default for BackendContext {
    fn default() -> Self {
        BackendContext {
            cudnn_enabled: true,
            benchmark: false,
            deterministic: false,
            mkldnn_enabled: true,
            nnpack_enabled: true,
            accelerator: None,
            algorithm_cache: Arc::new(AlgorithmCache::new()),
        }
    }
}

impl fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendContext")
            .field("cudnn_enabled", &self.cudnn_enabled)
            .field("benchmark", &self.benchmark)
            .field("deterministic", &self.deterministic)
            .field("mkldnn_enabled", &self.mkldnn_enabled)
            .field("nnpack_enabled", &self.nnpack_enabled)
            .field("accelerator", &self.accelerator.as_ref().map(|a| a.name().to_string()))
            .field("cached_algorithms", &self.algorithm_cache.len())
            .finish()
    }
}

fn global_slot() -> &'static RwLock<BackendContext> {
    static GLOBAL: OnceLock<RwLock<BackendContext>> = OnceLock::new();
    GLOBAL.get_or_init(|| RwLock::new(BackendContext::default()))
}

impl BackendContext {
    /// Host GEMM and depthwise kernels only.
    pub fn portable() -> Self {
        BackendContext {
            cudnn_enabled: false,
            mkldnn_enabled: false,
            nnpack_enabled: false,
            ..Self::default()
        }
    }

    /// Snapshot of the process-wide context.
    pub fn global() -> Self {
        match global_slot().read() {
            Ok(ctx) => ctx.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the process-wide context.
    pub fn set_global(ctx: BackendContext) {
        match global_slot().write() {
            Ok(mut slot) => *slot = ctx,
            Err(poisoned) => *poisoned.into_inner() = ctx,
        }
    }

    pub fn with_cudnn_enabled(mut self, enabled: bool) -> Self {
        self.cudnn_enabled = enabled;
        self
    }

    pub fn with_benchmark(mut self, benchmark: bool) -> Self {
        self.benchmark = benchmark;
        self
    }

    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn with_mkldnn_enabled(mut self, enabled: bool) -> Self {
        self.mkldnn_enabled = enabled;
        self
    }

    pub fn with_nnpack_enabled(mut self, enabled: bool) -> Self {
        self.nnpack_enabled = enabled;
        self
    }

    /// Register a device accelerator.
    pub fn with_accelerator(mut self, accelerator: Arc<dyn ConvAccelerator>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    pub fn accelerator(&self) -> Option<&Arc<dyn ConvAccelerator>> {
        self.accelerator.as_ref()
    }

    pub fn algorithm_cache(&self) -> &Arc<AlgorithmCache> {
        &self.algorithm_cache
    }
}
