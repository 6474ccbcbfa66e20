use std::path::PathBuf;

use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, StableDiffusionConfig, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
};
use kornia_image::{Image, ImageSize, allocator::CpuAllocator};
use tokenizers::Tokenizer;

use crate::{
    ImagineError, ProgressReporter, Result,
    config::{DevicePreference, ModelConfig},
    model::{ExecutionDevice, GeneratedImage, TextToImage},
};

const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const PAD_TOKEN: &str = "<|endoftext|>";
const VAE_SCALE: f64 = 0.18215;

/// Stable Diffusion v1.x run in-process.
///
/// Progress advances once per denoising step and once more for the VAE decode.
pub struct DiffusionModel {
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    device: Device,
    execution_device: ExecutionDevice,
    steps: usize,
    width: usize,
    height: usize,
    guidance_scale: f64,
    seed: Option<u64>,
}

enum WeightFile {
    Tokenizer,
    Clip,
    Unet,
    Vae,
}

impl WeightFile {
    fn path_in_repo(&self) -> &'static str {
        match self {
            WeightFile::Tokenizer => "tokenizer.json",
            WeightFile::Clip => "text_encoder/model.safetensors",
            WeightFile::Unet => "unet/diffusion_pytorch_model.safetensors",
            WeightFile::Vae => "vae/diffusion_pytorch_model.safetensors",
        }
    }
}

fn load_error(e: impl std::fmt::Display) -> ImagineError {
    ImagineError::ModelLoad(e.to_string())
}

fn weight_path(config: &ModelConfig, file: WeightFile) -> Result<PathBuf> {
    if let Some(dir) = &config.weights_dir {
        let path = dir.join(file.path_in_repo());
        if !path.exists() {
            return Err(load_error(format!("missing weights file {}", path.display())));
        }
        return Ok(path);
    }

    let repo = match file {
        WeightFile::Tokenizer => TOKENIZER_REPO,
        _ => config.model_id.as_str(),
    };
    log::debug!("Fetching {} from {}", file.path_in_repo(), repo);

    let api = hf_hub::api::sync::Api::new().map_err(load_error)?;
    api.model(repo.to_string())
        .get(file.path_in_repo())
        .map_err(load_error)
}

fn select_device(preference: DevicePreference) -> Result<(Device, ExecutionDevice)> {
    match preference {
        DevicePreference::Cpu => Ok((Device::Cpu, ExecutionDevice::Cpu)),
        DevicePreference::Auto => {
            let device = Device::cuda_if_available(0)?;
            let execution_device = if device.is_cuda() {
                ExecutionDevice::Cuda(0)
            } else {
                ExecutionDevice::Cpu
            };
            Ok((device, execution_device))
        }
    }
}

impl DiffusionModel {
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let (device, execution_device) = select_device(config.device)?;
        log::info!("Loading {} on {}", config.model_id, execution_device);

        let sd_config =
            StableDiffusionConfig::v1_5(None, Some(config.height), Some(config.width));

        let tokenizer =
            Tokenizer::from_file(weight_path(config, WeightFile::Tokenizer)?).map_err(load_error)?;
        let text_model = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            weight_path(config, WeightFile::Clip)?,
            &device,
            DType::F32,
        )?;
        let unet = sd_config.build_unet(
            weight_path(config, WeightFile::Unet)?,
            &device,
            4,
            false,
            DType::F32,
        )?;
        let vae = sd_config.build_vae(weight_path(config, WeightFile::Vae)?, &device, DType::F32)?;

        Ok(Self {
            sd_config,
            tokenizer,
            text_model,
            unet,
            vae,
            device,
            execution_device,
            steps: config.steps,
            width: config.width,
            height: config.height,
            guidance_scale: config.guidance_scale,
            seed: config.seed,
        })
    }

    fn embed(&self, text: &str) -> Result<Tensor> {
        let max_len = self.sd_config.clip.max_position_embeddings;
        let pad_id = self
            .tokenizer
            .token_to_id(PAD_TOKEN)
            .ok_or_else(|| ImagineError::Generation(format!("tokenizer has no {PAD_TOKEN}")))?;

        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| ImagineError::Generation(e.to_string()))?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            log::warn!("Prompt truncated to {max_len} tokens");
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, pad_id);

        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }
}

/// Converts a decoded `(1, 3, h, w)` tensor in `[-1, 1]` to interleaved rgb8.
fn to_image(decoded: &Tensor, width: usize, height: usize) -> Result<GeneratedImage> {
    let pixels = decoded
        .affine(0.5, 0.5)?
        .clamp(0f32, 1f32)?
        .affine(255., 0.)?
        .to_dtype(DType::U8)?
        .to_device(&Device::Cpu)?
        .squeeze(0)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;

    Ok(Image::new(ImageSize { width, height }, pixels, CpuAllocator)?)
}

impl TextToImage for DiffusionModel {
    fn generate(&self, prompt: &str, progress: &ProgressReporter) -> Result<GeneratedImage> {
        if let Some(seed) = self.seed {
            self.device.set_seed(seed)?;
        }

        let mut scheduler = self.sd_config.build_scheduler(self.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        progress.start(timesteps.len() + 1);

        let text_embeddings = Tensor::cat(&[self.embed("")?, self.embed(prompt)?], 0)?;

        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, self.height / 8, self.width / 8),
            &self.device,
        )?;
        let mut latents = latents.affine(scheduler.init_noise_sigma(), 0.)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            let model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let model_input = scheduler.scale_model_input(model_input, timestep)?;

            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = noise_pred.chunk(2, 0)?;
            let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
            let guided = uncond.add(&text.sub(uncond)?.affine(self.guidance_scale, 0.)?)?;

            latents = scheduler.step(&guided, timestep, &latents)?;

            log::trace!("Denoising step {}/{}", index + 1, timesteps.len());
            progress.advance();
        }

        let decoded = self.vae.decode(&latents.affine(1. / VAE_SCALE, 0.)?)?;
        let image = to_image(&decoded, self.width, self.height)?;
        progress.advance();

        Ok(image)
    }

    fn device(&self) -> ExecutionDevice {
        self.execution_device.clone()
    }
}
