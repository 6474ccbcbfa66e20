//! Text-to-image backends selectable at startup.

pub mod remote;
pub use remote::RemoteModel;

#[cfg(feature = "diffusion")]
pub mod diffusion;
#[cfg(feature = "diffusion")]
pub use diffusion::DiffusionModel;

use crate::{
    ProgressReporter, Result,
    config::{BackendKind, ModelConfig},
    model::{ExecutionDevice, GeneratedImage, ModelLoader, TextToImage},
};

/// The backend picked by [`ModelConfig::backend`].
pub enum Backend {
    Remote(RemoteModel),
    #[cfg(feature = "diffusion")]
    Diffusion(DiffusionModel),
}

impl Backend {
    /// Loads the configured backend. Errors are fatal to the caller.
    pub fn load(config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        log::info!("Loading {} backend", config.backend);

        match config.backend {
            BackendKind::Remote => Ok(Backend::Remote(RemoteModel::new(config)?)),
            #[cfg(feature = "diffusion")]
            BackendKind::Diffusion => Ok(Backend::Diffusion(DiffusionModel::load(config)?)),
            #[cfg(not(feature = "diffusion"))]
            BackendKind::Diffusion => Err(crate::ImagineError::ModelLoad(
                "the diffusion backend requires building with the `diffusion` feature".into(),
            )),
        }
    }

    /// A loader that builds this backend from `config` on first use.
    pub fn loader(config: ModelConfig) -> ModelLoader<Self> {
        ModelLoader::new(move || Backend::load(&config))
    }
}

impl TextToImage for Backend {
    fn generate(&self, prompt: &str, progress: &ProgressReporter) -> Result<GeneratedImage> {
        match self {
            Backend::Remote(model) => model.generate(prompt, progress),
            #[cfg(feature = "diffusion")]
            Backend::Diffusion(model) => model.generate(prompt, progress),
        }
    }

    fn device(&self) -> ExecutionDevice {
        match self {
            Backend::Remote(model) => model.device(),
            #[cfg(feature = "diffusion")]
            Backend::Diffusion(model) => model.device(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImagineError;

    #[test]
    fn test_loader_caches_remote_backend() {
        let loader = Backend::loader(ModelConfig::default());
        assert!(!loader.is_loaded());

        let first = loader.ensure_model_loaded().unwrap();
        let second = loader.ensure_model_loaded().unwrap();
        assert!(crate::model::ModelHandle::ptr_eq(&first, &second));
        assert!(matches!(first.device(), ExecutionDevice::Remote(_)));
    }

    #[test]
    fn test_invalid_config_fails_to_load() {
        let config = ModelConfig {
            steps: 0,
            ..Default::default()
        };
        assert!(matches!(
            Backend::load(&config),
            Err(ImagineError::ModelLoad(_))
        ));
    }

    #[cfg(not(feature = "diffusion"))]
    #[test]
    fn test_diffusion_requires_feature() {
        let config = ModelConfig {
            backend: BackendKind::Diffusion,
            ..Default::default()
        };
        assert!(matches!(
            Backend::load(&config),
            Err(ImagineError::ModelLoad(_))
        ));
    }
}
