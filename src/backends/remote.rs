use std::time::Duration;

use base64::{Engine, prelude::BASE64_STANDARD};
use serde::{Deserialize, Serialize};

use crate::{
    ImagineError, ProgressReporter, Result, codec,
    config::ModelConfig,
    model::{ExecutionDevice, GeneratedImage, TextToImage},
};

const TXT2IMG_PATH: &str = "/sdapi/v1/txt2img";

#[derive(Debug, Serialize)]
struct Txt2ImgRequest<'a> {
    prompt: &'a str,
    steps: usize,
    width: usize,
    height: usize,
    cfg_scale: f64,
    // -1 asks the service for a random seed
    seed: i64,
}

#[derive(Debug, Deserialize)]
struct Txt2ImgResponse {
    images: Vec<String>,
}

/// Generates through a txt2img HTTP service.
///
/// The service owns the weights and the accelerator; this side only sends
/// the prompt and decodes the PNG it gets back. The client is blocking and
/// is only used from the engine's worker thread.
pub struct RemoteModel {
    client: reqwest::blocking::Client,
    url: String,
    endpoint: String,
    steps: usize,
    width: usize,
    height: usize,
    guidance_scale: f64,
    // -1 when no seed was configured
    seed: i64,
}

impl RemoteModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(None::<Duration>)
            .build()?;
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let seed = match config.seed {
            Some(seed) => i64::try_from(seed).map_err(|_| {
                ImagineError::ModelLoad(format!("seed {seed} does not fit in i64"))
            })?,
            None => -1,
        };

        Ok(Self {
            client,
            url: format!("{endpoint}{TXT2IMG_PATH}"),
            endpoint,
            steps: config.steps,
            width: config.width,
            height: config.height,
            guidance_scale: config.guidance_scale,
            seed,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl TextToImage for RemoteModel {
    fn generate(&self, prompt: &str, progress: &ProgressReporter) -> Result<GeneratedImage> {
        progress.start(1);

        let request = Txt2ImgRequest {
            prompt,
            steps: self.steps,
            width: self.width,
            height: self.height,
            cfg_scale: self.guidance_scale,
            seed: self.seed,
        };

        log::debug!("Posting prompt to {}", self.url);

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()?
            .error_for_status()?
            .json::<Txt2ImgResponse>()?;

        let encoded = response
            .images
            .into_iter()
            .next()
            .ok_or_else(|| ImagineError::Generation("service returned no images".into()))?;

        let image = codec::decode(&BASE64_STANDARD.decode(encoded.trim())?)?;

        if image.width() != self.width || image.height() != self.height {
            log::warn!(
                "Requested {}x{} but the service returned {}x{}",
                self.width,
                self.height,
                image.width(),
                image.height()
            );
        }

        progress.advance();
        Ok(image)
    }

    fn device(&self) -> ExecutionDevice {
        ExecutionDevice::Remote(self.endpoint.clone())
    }
}
