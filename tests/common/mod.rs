#![allow(dead_code)]

use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
    mpsc,
};

use kornia_image::{Image, ImageSize, allocator::CpuAllocator};
use kornia_imagine::{
    ImagineError, ProgressReporter, Result,
    model::{ExecutionDevice, GeneratedImage, TextToImage},
};

/// Paints a gradient whose colour depends on the prompt and on how many
/// images were generated before.
pub struct GradientModel {
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub calls: AtomicUsize,
}

impl GradientModel {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            steps: 4,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextToImage for GradientModel {
    fn generate(&self, prompt: &str, progress: &ProgressReporter) -> Result<GeneratedImage> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        progress.start(self.steps);
        for _ in 0..self.steps {
            progress.advance();
        }

        let tint = (prompt.len() + call * 37) as u8;
        let mut data = Vec::with_capacity(self.width * self.height * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                data.extend_from_slice(&[
                    (x * 255 / self.width) as u8,
                    (y * 255 / self.height) as u8,
                    tint,
                ]);
            }
        }

        let size = ImageSize {
            width: self.width,
            height: self.height,
        };
        Ok(Image::new(size, data, CpuAllocator)?)
    }

    fn device(&self) -> ExecutionDevice {
        ExecutionDevice::Cpu
    }
}

/// Always fails after reporting half of its steps.
pub struct FailingModel;

impl TextToImage for FailingModel {
    fn generate(&self, _prompt: &str, progress: &ProgressReporter) -> Result<GeneratedImage> {
        progress.start(10);
        for _ in 0..5 {
            progress.advance();
        }
        Err(ImagineError::Generation("the model ran out of memory".into()))
    }

    fn device(&self) -> ExecutionDevice {
        ExecutionDevice::Cpu
    }
}

/// Blocks every generation until the test releases it.
pub struct GatedModel {
    inner: GradientModel,
    release: Mutex<mpsc::Receiver<()>>,
}

impl GatedModel {
    pub fn new(width: usize, height: usize) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let model = Self {
            inner: GradientModel::new(width, height),
            release: Mutex::new(rx),
        };
        (model, tx)
    }
}

impl TextToImage for GatedModel {
    fn generate(&self, prompt: &str, progress: &ProgressReporter) -> Result<GeneratedImage> {
        progress.start(2);
        progress.advance();
        self.release
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| ImagineError::Generation("gate dropped".into()))?;
        self.inner.generate(prompt, progress)
    }

    fn device(&self) -> ExecutionDevice {
        ExecutionDevice::Cpu
    }
}
