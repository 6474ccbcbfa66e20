use std::{
    fmt,
    ops::Deref,
    sync::{Arc, Mutex},
};

use kornia_image::{Image, allocator::CpuAllocator};

use crate::{ProgressReporter, Result};

/// Raw RGB8 output of one model invocation.
pub type GeneratedImage = Image<u8, 3, CpuAllocator>;

/// Where a model executes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionDevice {
    Cpu,
    /// A GPU, identified by its ordinal.
    Cuda(usize),
    /// Execution is delegated to a remote service.
    Remote(String),
}

impl fmt::Display for ExecutionDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionDevice::Cpu => write!(f, "cpu"),
            ExecutionDevice::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            ExecutionDevice::Remote(endpoint) => write!(f, "remote:{endpoint}"),
        }
    }
}

/// A text-to-image capability.
///
/// Generation takes `&self`: a loaded model is never mutated, so one handle
/// can be shared by the session and the engine worker.
pub trait TextToImage {
    /// Produces a fresh image for `prompt`.
    fn generate(&self, prompt: &str, progress: &ProgressReporter) -> Result<GeneratedImage>;

    /// The device the model was loaded onto.
    fn device(&self) -> ExecutionDevice;
}

/// Loaded, ready-to-use reference to a model.
pub struct ModelHandle<T> {
    model: Arc<T>,
}

impl<T> ModelHandle<T> {
    pub fn new(model: T) -> Self {
        Self {
            model: Arc::new(model),
        }
    }

    /// Returns true when both handles point at the same loaded model.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.model, &other.model)
    }
}

impl<T> Clone for ModelHandle<T> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
        }
    }
}

impl<T> Deref for ModelHandle<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.model
    }
}

type LoadFn<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

/// Builds a model on first use and hands out the same handle afterwards.
///
/// Constructed once at startup and passed to whoever needs the model.
pub struct ModelLoader<T> {
    load: LoadFn<T>,
    cached: Mutex<Option<ModelHandle<T>>>,
}

impl<T: TextToImage> ModelLoader<T> {
    pub fn new(load: impl Fn() -> Result<T> + Send + Sync + 'static) -> Self {
        Self {
            load: Box::new(load),
            cached: Mutex::new(None),
        }
    }

    /// Returns the loaded model, loading it if this is the first call.
    ///
    /// A failed load is returned to the caller and nothing is cached.
    pub fn ensure_model_loaded(&self) -> Result<ModelHandle<T>> {
        let mut cached = self.cached.lock().unwrap();
        if let Some(handle) = cached.as_ref() {
            return Ok(handle.clone());
        }

        log::info!("Loading model");
        let handle = ModelHandle::new((self.load)()?);
        log::info!("Model loaded on {}", handle.device());

        *cached = Some(handle.clone());
        Ok(handle)
    }

    pub fn is_loaded(&self) -> bool {
        self.cached.lock().unwrap().is_some()
    }
}
