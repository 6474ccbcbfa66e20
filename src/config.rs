use std::{fmt, path::PathBuf, str::FromStr};

use crate::{ImagineError, Result};

// defaults for the server
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;

// defaults for the model
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:7860";
pub const DEFAULT_MODEL_ID: &str = "CompVis/stable-diffusion-v1-4";
pub const DEFAULT_STEPS: usize = 50;
pub const DEFAULT_WIDTH: usize = 512;
pub const DEFAULT_HEIGHT: usize = 512;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;

/// Prompt shown in the text area when the page loads.
pub const DEFAULT_PROMPT: &str = "A futuristic urban hospital using AI-powered robots to assist in surgeries, \
reducing errors, and providing personalized care to patients from all socioeconomic backgrounds, \
while maintaining strict patient privacy and equitable access to healthcare.";

/// Which text-to-image backend to load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// A txt2img HTTP service.
    #[default]
    Remote,
    /// Stable Diffusion run in-process with candle.
    Diffusion,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "remote" => Ok(BackendKind::Remote),
            "diffusion" => Ok(BackendKind::Diffusion),
            other => Err(format!(
                "unknown backend `{other}`, expected `remote` or `diffusion`"
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Remote => write!(f, "remote"),
            BackendKind::Diffusion => write!(f, "diffusion"),
        }
    }
}

/// Device selection, applied once when the model is loaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DevicePreference {
    /// Use an accelerator when one is available, the CPU otherwise.
    #[default]
    Auto,
    Cpu,
}

/// What to do with prompts that are empty or only whitespace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PromptPolicy {
    #[default]
    RejectEmpty,
    PassThrough,
}

impl PromptPolicy {
    pub fn check(&self, prompt: &str) -> Result<()> {
        match self {
            PromptPolicy::RejectEmpty if prompt.trim().is_empty() => Err(ImagineError::EmptyPrompt),
            _ => Ok(()),
        }
    }
}

/// Settings used to load and run a model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
    pub backend: BackendKind,
    /// Base url of the txt2img service, remote backend only.
    pub endpoint: String,
    /// Hugging Face repository holding the diffusion weights.
    pub model_id: String,
    /// Local directory with the diffusion weights, takes precedence over `model_id`.
    pub weights_dir: Option<PathBuf>,
    pub steps: usize,
    pub width: usize,
    pub height: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
    pub device: DevicePreference,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            weights_dir: None,
            steps: DEFAULT_STEPS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: None,
            device: DevicePreference::default(),
        }
    }
}

impl ModelConfig {
    /// Checks values that would otherwise only fail deep inside a backend.
    pub fn validate(&self) -> Result<()> {
        if self.steps == 0 {
            return Err(ImagineError::ModelLoad("steps must be at least 1".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ImagineError::ModelLoad(format!(
                "invalid image size {}x{}",
                self.width, self.height
            )));
        }
        if let Some(seed) = self.seed {
            i64::try_from(seed).map_err(|_| {
                ImagineError::ModelLoad(format!("seed {seed} is larger than {}", i64::MAX))
            })?;
        }
        if self.backend == BackendKind::Diffusion && (self.width % 8 != 0 || self.height % 8 != 0)
        {
            return Err(ImagineError::ModelLoad(format!(
                "diffusion image size must be a multiple of 8, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Address the HTTP server binds to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
