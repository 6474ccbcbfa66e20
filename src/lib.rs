use std::{
    sync::{Arc, Mutex, mpsc},
    thread::JoinHandle,
    time::{Duration, Instant},
};

pub mod backends;
pub mod codec;
pub mod config;
pub mod error;
pub mod model;
pub mod server;
pub mod session;

pub use error::{ImagineError, Result};

// Type alias to simplify complex types
type EngineReceiver<M> = Arc<
    Mutex<
        mpsc::Receiver<
            ImagineEngineResponse<
                <<M as ImagineModel>::Request as RequestMetadata>::Metadata,
                <M as ImagineModel>::Response,
                <M as ImagineModel>::Error,
            >,
        >,
    >,
>;

/// Trait for implementing models that can be driven by the [`ImagineEngine`].
///
/// The engine moves the model to its worker thread and calls [`ImagineModel::run`]
/// once per scheduled request.
pub trait ImagineModel {
    /// The request type that the model accepts.
    type Request;
    /// The response type that the model returns.
    type Response;
    /// The error type that can be returned by a run.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Runs the model on the given request, reporting progress as it goes.
    fn run(
        &mut self,
        request: Self::Request,
        progress: &ProgressReporter,
    ) -> std::result::Result<Self::Response, Self::Error>;
}

/// Represents the current state of the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum ImagineEngineState {
    /// The engine is idle and ready to accept new requests.
    Idle,
    /// The engine is currently running the model.
    Processing,
}

impl ImagineEngineState {
    /// Returns the state as a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImagineEngineState::Idle => "idle",
            ImagineEngineState::Processing => "processing",
        }
    }
}

/// Trait for extracting lightweight metadata from requests.
///
/// The engine keeps the metadata next to the response so that callers can
/// tell which prompt produced it without holding on to the request itself.
pub trait RequestMetadata {
    /// The lightweight metadata type that represents the request.
    type Metadata: Send + 'static;

    /// Extracts lightweight metadata from the request.
    fn metadata(&self) -> Self::Metadata;
}

/// Progress of the request currently being processed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    /// Number of completed steps.
    pub step: usize,
    /// Total number of steps announced by the model, zero when unknown.
    pub total_steps: usize,
}

impl Progress {
    /// A progress value that is complete.
    pub fn finished() -> Self {
        Self {
            step: 1,
            total_steps: 1,
        }
    }

    /// Completion in percent, in `0..=100`.
    pub fn percent(&self) -> u8 {
        if self.total_steps == 0 {
            return 0;
        }
        let step = self.step.min(self.total_steps);
        (step * 100 / self.total_steps) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.total_steps > 0 && self.step >= self.total_steps
    }
}

/// Shared handle through which a model reports how far along a run is.
#[derive(Clone, Debug, Default)]
pub struct ProgressReporter {
    inner: Arc<Mutex<Progress>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announces the number of steps of the current run and resets the counter.
    pub fn start(&self, total_steps: usize) {
        *self.inner.lock().unwrap() = Progress {
            step: 0,
            total_steps,
        };
    }

    /// Marks one more step as completed. Never goes past the announced total.
    pub fn advance(&self) {
        let mut progress = self.inner.lock().unwrap();
        if progress.step < progress.total_steps {
            progress.step += 1;
        }
    }

    /// Returns the current progress.
    pub fn snapshot(&self) -> Progress {
        *self.inner.lock().unwrap()
    }

    fn reset(&self) {
        *self.inner.lock().unwrap() = Progress::default();
    }
}

/// Internal request wrapper used by the engine to track requests.
pub struct ImagineEngineRequest<Req> {
    /// Unique identifier for this request.
    pub id: u64,
    /// The actual request data to be processed by the model.
    pub request: Req,
}

/// Response returned by the engine containing the model's outcome and telemetry data.
pub struct ImagineEngineResponse<Metadata, Res, Err> {
    /// Unique identifier matching the original request.
    pub id: u64,
    /// Timestamp when the run started.
    pub start_time: Instant,
    /// Total time taken by the run.
    pub duration: Duration,
    /// Lightweight metadata extracted from the original request.
    pub request_metadata: Metadata,
    /// The model's result for this request.
    pub response: std::result::Result<Res, Err>,
}

/// Result type returned when polling for responses.
pub enum ImagineEngineResult<M: ImagineModel + Send + 'static>
where
    M::Request: RequestMetadata,
{
    /// A run finished, successfully or not.
    Success(
        ImagineEngineResponse<<M::Request as RequestMetadata>::Metadata, M::Response, M::Error>,
    ),
    /// No result available yet, with current engine state.
    Empty(ImagineEngineState),
    /// The engine itself failed.
    Error(String),
}

/// Engine that runs a model on a dedicated thread.
///
/// Requests are queued through a channel and picked up by the worker thread,
/// which owns the model. Callers never block on a run: they poll for the
/// response and read the progress reported by the model in the meantime.
/// A failing run is delivered as an error response and the worker keeps
/// serving later requests.
pub struct ImagineEngine<M: ImagineModel + Send + 'static>
where
    M::Error: Send + 'static,
    M::Request: Send + RequestMetadata + 'static,
    M::Response: Send + 'static,
{
    state: Arc<Mutex<ImagineEngineState>>,
    progress: ProgressReporter,
    req_tx: Option<mpsc::Sender<ImagineEngineRequest<M::Request>>>,
    rep_rx: EngineReceiver<M>,
    worker_handle: Option<JoinHandle<()>>,
    id_counter: Arc<Mutex<u64>>,
}

impl<M: ImagineModel + Send + 'static> ImagineEngine<M>
where
    M::Error: Send + 'static,
    M::Request: Send + RequestMetadata + 'static,
    M::Response: Send + 'static,
{
    /// Creates a new engine with the given model.
    ///
    /// The model is moved to a background thread that processes requests in
    /// the order they were scheduled.
    pub fn new(mut model: M) -> Self {
        let (req_tx, req_rx) = mpsc::channel::<ImagineEngineRequest<M::Request>>();
        let (rep_tx, rep_rx) = mpsc::channel::<
            ImagineEngineResponse<<M::Request as RequestMetadata>::Metadata, M::Response, M::Error>,
        >();
        let state = Arc::new(Mutex::new(ImagineEngineState::Idle));
        let progress = ProgressReporter::new();

        let worker_handle = std::thread::spawn({
            let state = state.clone();
            let progress = progress.clone();
            move || {
                while let Ok(req) = req_rx.recv() {
                    log::debug!("Starting request {}", req.id);

                    // Extract lightweight metadata before consuming the request
                    let request_metadata = req.request.metadata();

                    // A processing engine never shows the previous run's progress
                    progress.reset();
                    *state.lock().unwrap() = ImagineEngineState::Processing;
                    let start_time = Instant::now();

                    let response = model.run(req.request, &progress);

                    match &response {
                        Ok(_) => log::debug!("Request {} completed", req.id),
                        Err(e) => log::error!("Request {} failed: {e}", req.id),
                    }

                    let duration = start_time.elapsed();
                    *state.lock().unwrap() = ImagineEngineState::Idle;

                    let _ = rep_tx.send(ImagineEngineResponse {
                        id: req.id,
                        start_time,
                        duration,
                        request_metadata,
                        response,
                    });
                }
                log::debug!("Request channel closed, worker exiting");
            }
        });

        Self {
            state,
            progress,
            req_tx: Some(req_tx),
            rep_rx: Arc::new(Mutex::new(rep_rx)),
            worker_handle: Some(worker_handle),
            id_counter: Arc::new(Mutex::new(0)),
        }
    }

    /// Returns the current state of the engine.
    pub fn state(&self) -> ImagineEngineState {
        self.state.lock().unwrap().clone()
    }

    /// Returns the progress reported by the model for the current run.
    pub fn progress(&self) -> Progress {
        self.progress.snapshot()
    }

    /// Attempts to retrieve a finished response without blocking.
    pub fn try_poll_response(&self) -> ImagineEngineResult<M> {
        match self.rep_rx.lock().unwrap().try_recv() {
            Ok(response) => ImagineEngineResult::Success(response),
            Err(mpsc::TryRecvError::Empty) => ImagineEngineResult::Empty(self.state()),
            Err(mpsc::TryRecvError::Disconnected) => {
                log::error!("Response channel disconnected");
                ImagineEngineResult::Error("Response channel disconnected".to_string())
            }
        }
    }

    /// Waits up to `timeout` for a finished response.
    pub fn poll_response_timeout(&self, timeout: Duration) -> ImagineEngineResult<M> {
        match self.rep_rx.lock().unwrap().recv_timeout(timeout) {
            Ok(response) => ImagineEngineResult::Success(response),
            Err(mpsc::RecvTimeoutError::Timeout) => ImagineEngineResult::Empty(self.state()),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::error!("Response channel disconnected");
                ImagineEngineResult::Error("Response channel disconnected".to_string())
            }
        }
    }

    /// Schedules a request for processing on the worker thread.
    ///
    /// Returns the id assigned to the request, or an error once the engine
    /// has been stopped.
    pub fn schedule_inference(&self, request: M::Request) -> Result<u64> {
        let Some(tx) = &self.req_tx else {
            return Err(ImagineError::EngineStopped);
        };

        let id = {
            let mut counter = self.id_counter.lock().unwrap();
            *counter += 1;
            *counter
        };

        tx.send(ImagineEngineRequest { id, request })
            .map_err(|_| ImagineError::EngineStopped)?;

        Ok(id)
    }

    /// Stops the engine and shuts down the worker thread.
    ///
    /// Closes the request channel and waits for the worker to finish the
    /// requests already queued.
    pub fn stop(&mut self) {
        self.req_tx.take();
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

impl<M: ImagineModel + Send + 'static> Drop for ImagineEngine<M>
where
    M::Error: Send + 'static,
    M::Request: Send + RequestMetadata + 'static,
    M::Response: Send + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("echo refused: {0}")]
    struct EchoError(String);

    struct EchoModel;

    struct EchoRequest(String);

    impl RequestMetadata for EchoRequest {
        type Metadata = String;

        fn metadata(&self) -> Self::Metadata {
            self.0.clone()
        }
    }

    impl ImagineModel for EchoModel {
        type Request = EchoRequest;
        type Response = usize;
        type Error = EchoError;

        fn run(
            &mut self,
            request: Self::Request,
            progress: &ProgressReporter,
        ) -> std::result::Result<Self::Response, Self::Error> {
            progress.start(request.0.len());
            for _ in request.0.chars() {
                progress.advance();
            }
            if request.0 == "fail" {
                return Err(EchoError(request.0));
            }
            Ok(request.0.len())
        }
    }

    fn wait(engine: &ImagineEngine<EchoModel>) -> ImagineEngineResponse<String, usize, EchoError> {
        match engine.poll_response_timeout(Duration::from_secs(5)) {
            ImagineEngineResult::Success(response) => response,
            _ => panic!("expected a response"),
        }
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(Progress::default().percent(), 0);
        let half = Progress {
            step: 5,
            total_steps: 10,
        };
        assert_eq!(half.percent(), 50);
        assert!(!half.is_complete());
        assert_eq!(Progress::finished().percent(), 100);
    }

    #[test]
    fn test_reporter_never_exceeds_total() {
        let reporter = ProgressReporter::new();
        reporter.start(2);
        reporter.advance();
        reporter.advance();
        reporter.advance();
        assert_eq!(reporter.snapshot().step, 2);
        assert!(reporter.snapshot().is_complete());
    }

    #[test]
    fn test_engine_assigns_increasing_ids() {
        let engine = ImagineEngine::new(EchoModel);
        let first = engine.schedule_inference(EchoRequest("ab".into())).unwrap();
        let second = engine.schedule_inference(EchoRequest("abc".into())).unwrap();
        assert!(second > first);

        let response = wait(&engine);
        assert_eq!(response.id, first);
        assert_eq!(response.request_metadata, "ab");
        assert_eq!(response.response.unwrap(), 2);

        let response = wait(&engine);
        assert_eq!(response.id, second);
        assert_eq!(response.response.unwrap(), 3);
    }

    #[test]
    fn test_engine_survives_failed_run() {
        let engine = ImagineEngine::new(EchoModel);
        engine.schedule_inference(EchoRequest("fail".into())).unwrap();
        assert!(wait(&engine).response.is_err());

        engine.schedule_inference(EchoRequest("ok".into())).unwrap();
        assert_eq!(wait(&engine).response.unwrap(), 2);
    }

    #[test]
    fn test_engine_reports_model_progress() {
        let engine = ImagineEngine::new(EchoModel);
        engine.schedule_inference(EchoRequest("four".into())).unwrap();
        wait(&engine);
        assert_eq!(
            engine.progress(),
            Progress {
                step: 4,
                total_steps: 4
            }
        );
        assert_eq!(engine.state(), ImagineEngineState::Idle);
    }

    #[test]
    fn test_schedule_after_stop_fails() {
        let mut engine = ImagineEngine::new(EchoModel);
        engine.stop();
        assert!(matches!(
            engine.schedule_inference(EchoRequest("late".into())),
            Err(ImagineError::EngineStopped)
        ));
        assert!(matches!(
            engine.try_poll_response(),
            ImagineEngineResult::Error(_)
        ));
    }

    #[test]
    fn test_empty_poll_reports_state() {
        let engine = ImagineEngine::new(EchoModel);
        assert!(matches!(
            engine.try_poll_response(),
            ImagineEngineResult::Empty(ImagineEngineState::Idle)
        ));
    }
}
