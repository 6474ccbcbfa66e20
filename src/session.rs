use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use kornia_image::ImageSize;
use serde::{Deserialize, Serialize};

use crate::{
    ImagineEngine, ImagineEngineResult, ImagineEngineState, ImagineError, ImagineModel, Progress,
    ProgressReporter, RequestMetadata, Result,
    codec::{self, EncodedArtifact},
    config::PromptPolicy,
    model::{ModelHandle, TextToImage},
};

/// A prompt scheduled on the engine.
pub struct GenerationRequest {
    pub prompt: String,
}

pub struct GenerationMetadata {
    pub prompt: String,
}

impl RequestMetadata for GenerationRequest {
    type Metadata = GenerationMetadata;

    fn metadata(&self) -> Self::Metadata {
        GenerationMetadata {
            prompt: self.prompt.clone(),
        }
    }
}

/// What the worker hands back for a successful request. The pixel buffer is
/// dropped once encoded.
#[derive(Debug)]
pub struct GenerationOutput {
    pub size: ImageSize,
    pub artifact: EncodedArtifact,
}

/// Engine model that generates with the shared handle and encodes the result.
pub struct ImageGenerator<T> {
    handle: ModelHandle<T>,
}

impl<T> ImageGenerator<T> {
    pub fn new(handle: ModelHandle<T>) -> Self {
        Self { handle }
    }
}

impl<T: TextToImage> ImagineModel for ImageGenerator<T> {
    type Request = GenerationRequest;
    type Response = GenerationOutput;
    type Error = ImagineError;

    fn run(
        &mut self,
        request: Self::Request,
        progress: &ProgressReporter,
    ) -> Result<Self::Response> {
        let image = self.handle.generate(&request.prompt, progress)?;
        let artifact = codec::encode(&image)?;
        Ok(GenerationOutput {
            size: image.size(),
            artifact,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Generating,
    Done,
    Failed,
}

/// Serializable view of a session, as reported to the page.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub status: SessionPhase,
    pub id: Option<u64>,
    pub prompt: Option<String>,
    pub step: usize,
    pub total_steps: usize,
    pub percent: u8,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

enum SessionStatus {
    Idle,
    Generating {
        id: u64,
        prompt: String,
        scheduled_at: Instant,
    },
    Done {
        id: u64,
        prompt: String,
        duration: Duration,
        output: Arc<GenerationOutput>,
    },
    Failed {
        id: u64,
        prompt: String,
        message: String,
    },
}

/// Drives one prompt at a time through the engine: idle, generating, then done or failed.
///
/// The model call happens on the engine's worker thread. The session only
/// schedules requests and picks up finished ones when polled, so none of its
/// methods wait on the model except [`GenerationSession::wait_for_completion`].
pub struct GenerationSession<T: TextToImage + Send + Sync + 'static> {
    engine: ImagineEngine<ImageGenerator<T>>,
    handle: ModelHandle<T>,
    policy: PromptPolicy,
    status: Mutex<SessionStatus>,
}

impl<T: TextToImage + Send + Sync + 'static> GenerationSession<T> {
    pub fn new(handle: ModelHandle<T>, policy: PromptPolicy) -> Self {
        Self {
            engine: ImagineEngine::new(ImageGenerator::new(handle.clone())),
            handle,
            policy,
            status: Mutex::new(SessionStatus::Idle),
        }
    }

    /// The model this session generates with.
    pub fn model(&self) -> &ModelHandle<T> {
        &self.handle
    }

    /// Starts generating an image for `prompt`.
    ///
    /// Fails with [`ImagineError::Busy`] while a previous request is still
    /// running and with [`ImagineError::EmptyPrompt`] when the policy rejects
    /// the prompt.
    pub fn submit(&self, prompt: &str) -> Result<u64> {
        let mut status = self.status.lock().unwrap();
        self.collect(&mut status);

        if let SessionStatus::Generating { id, .. } = &*status {
            log::debug!("Request {id} is still generating");
            return Err(ImagineError::Busy);
        }

        self.policy.check(prompt)?;

        let id = self.engine.schedule_inference(GenerationRequest {
            prompt: prompt.to_string(),
        })?;

        log::info!("Scheduled request {id}");

        *status = SessionStatus::Generating {
            id,
            prompt: prompt.to_string(),
            scheduled_at: Instant::now(),
        };

        Ok(id)
    }

    /// Picks up a finished request, if any, and returns the current view.
    pub fn poll(&self) -> SessionSnapshot {
        let mut status = self.status.lock().unwrap();
        self.collect(&mut status);
        self.snapshot(&status)
    }

    /// Polls until the current request finishes or `timeout` elapses.
    pub fn wait_for_completion(&self, timeout: Duration) -> SessionSnapshot {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.poll();
            if snapshot.status != SessionPhase::Generating || Instant::now() >= deadline {
                return snapshot;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// The artifact of the last successful request.
    pub fn present(&self) -> Option<Arc<GenerationOutput>> {
        let mut status = self.status.lock().unwrap();
        self.collect(&mut status);
        match &*status {
            SessionStatus::Done { output, .. } => Some(output.clone()),
            _ => None,
        }
    }

    fn collect(&self, status: &mut SessionStatus) {
        let SessionStatus::Generating {
            id,
            prompt,
            scheduled_at,
        } = status
        else {
            return;
        };

        match self.engine.try_poll_response() {
            ImagineEngineResult::Success(response) => {
                if response.id != *id {
                    log::warn!(
                        "Dropping response {} while waiting for {}",
                        response.id,
                        id
                    );
                    return;
                }
                *status = match response.response {
                    Ok(output) => {
                        log::info!(
                            "Request {} finished in {:?} ({}x{}, {} bytes)",
                            response.id,
                            response.duration,
                            output.size.width,
                            output.size.height,
                            output.artifact.bytes().len()
                        );
                        SessionStatus::Done {
                            id: response.id,
                            prompt: response.request_metadata.prompt,
                            duration: response.duration,
                            output: Arc::new(output),
                        }
                    }
                    Err(e) => {
                        log::warn!("Request {} failed: {e}", response.id);
                        SessionStatus::Failed {
                            id: response.id,
                            prompt: response.request_metadata.prompt,
                            message: e.to_string(),
                        }
                    }
                };
            }
            ImagineEngineResult::Empty(_) => {
                log::trace!(
                    "Request {id} still generating after {:?}",
                    scheduled_at.elapsed()
                );
            }
            ImagineEngineResult::Error(message) => {
                let failed = SessionStatus::Failed {
                    id: *id,
                    prompt: std::mem::take(prompt),
                    message,
                };
                *status = failed;
            }
        }
    }

    fn snapshot(&self, status: &SessionStatus) -> SessionSnapshot {
        let idle = SessionSnapshot {
            status: SessionPhase::Idle,
            id: None,
            prompt: None,
            step: 0,
            total_steps: 0,
            percent: 0,
            width: None,
            height: None,
            duration_ms: None,
            error: None,
        };

        match status {
            SessionStatus::Idle => idle,
            SessionStatus::Generating { id, prompt, .. } => {
                // Until the worker picks the request up it still holds the previous run's progress
                let progress = match self.engine.state() {
                    ImagineEngineState::Processing => self.engine.progress(),
                    ImagineEngineState::Idle => Progress::default(),
                };
                SessionSnapshot {
                    status: SessionPhase::Generating,
                    id: Some(*id),
                    prompt: Some(prompt.clone()),
                    ..with_progress(idle, progress)
                }
            }
            SessionStatus::Done {
                id,
                prompt,
                duration,
                output,
            } => SessionSnapshot {
                status: SessionPhase::Done,
                id: Some(*id),
                prompt: Some(prompt.clone()),
                width: Some(output.size.width),
                height: Some(output.size.height),
                duration_ms: Some(duration.as_millis() as u64),
                ..with_progress(idle, self.finished_progress())
            },
            SessionStatus::Failed {
                id,
                prompt,
                message,
            } => SessionSnapshot {
                status: SessionPhase::Failed,
                id: Some(*id),
                prompt: Some(prompt.clone()),
                error: Some(message.clone()),
                ..with_progress(idle, self.finished_progress())
            },
        }
    }

    // A finished request always reads as complete, whatever the model reported.
    fn finished_progress(&self) -> Progress {
        let progress = self.engine.progress();
        if progress.is_complete() {
            progress
        } else if progress.total_steps > 0 {
            Progress {
                step: progress.total_steps,
                total_steps: progress.total_steps,
            }
        } else {
            Progress::finished()
        }
    }
}

fn with_progress(snapshot: SessionSnapshot, progress: Progress) -> SessionSnapshot {
    SessionSnapshot {
        step: progress.step,
        total_steps: progress.total_steps,
        percent: progress.percent(),
        ..snapshot
    }
}
