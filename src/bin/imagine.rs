use argh::FromArgs;
use kornia_imagine::{
    backends::Backend,
    config::{
        BackendKind, DEFAULT_ENDPOINT, DEFAULT_GUIDANCE_SCALE, DEFAULT_HEIGHT, DEFAULT_HOST,
        DEFAULT_MODEL_ID, DEFAULT_PORT, DEFAULT_PROMPT, DEFAULT_STEPS, DEFAULT_WIDTH,
        DevicePreference, ModelConfig, PromptPolicy, ServerConfig,
    },
    server,
    session::{GenerationSession, SessionPhase},
};
use std::{path::PathBuf, sync::Arc, time::Duration};

#[derive(FromArgs)]
/// Imagine turns text prompts into images.
struct ImagineArgs {
    /// backend to generate with: "remote" or "diffusion"
    #[argh(option, default = "BackendKind::Remote")]
    backend: BackendKind,

    /// base url of the txt2img service used by the remote backend
    #[argh(option, default = "DEFAULT_ENDPOINT.to_string()")]
    endpoint: String,

    /// hugging face repository with the diffusion weights
    #[argh(option, default = "DEFAULT_MODEL_ID.to_string()")]
    model_id: String,

    /// local directory with the diffusion weights
    #[argh(option)]
    weights_dir: Option<PathBuf>,

    /// number of denoising steps
    #[argh(option, default = "DEFAULT_STEPS")]
    steps: usize,

    /// width of the generated image
    #[argh(option, default = "DEFAULT_WIDTH")]
    width: usize,

    /// height of the generated image
    #[argh(option, default = "DEFAULT_HEIGHT")]
    height: usize,

    /// classifier-free guidance scale
    #[argh(option, default = "DEFAULT_GUIDANCE_SCALE")]
    guidance_scale: f64,

    /// seed for reproducible images
    #[argh(option)]
    seed: Option<u64>,

    /// run on the cpu even when an accelerator is available
    #[argh(switch)]
    cpu: bool,

    /// forward empty prompts to the model instead of rejecting them
    #[argh(switch)]
    allow_empty_prompt: bool,

    #[argh(subcommand)]
    command: ImagineCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ImagineCommands {
    Serve(ServeCommand),
    Generate(GenerateCommand),
}

#[derive(FromArgs)]
/// Serve the generator page
#[argh(subcommand, name = "serve")]
struct ServeCommand {
    /// the host to run the server on
    #[argh(option, default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,
}

#[derive(FromArgs)]
/// Generate a single image and write it to disk
#[argh(subcommand, name = "generate")]
struct GenerateCommand {
    /// the prompt to use
    #[argh(option, default = "DEFAULT_PROMPT.to_string()")]
    prompt: String,

    /// where to write the png
    #[argh(option, short = 'o', default = "PathBuf::from(\"generated_image.png\")")]
    output: PathBuf,
}

impl ImagineArgs {
    fn model_config(&self) -> ModelConfig {
        ModelConfig {
            backend: self.backend,
            endpoint: self.endpoint.clone(),
            model_id: self.model_id.clone(),
            weights_dir: self.weights_dir.clone(),
            steps: self.steps,
            width: self.width,
            height: self.height,
            guidance_scale: self.guidance_scale,
            seed: self.seed,
            device: if self.cpu {
                DevicePreference::Cpu
            } else {
                DevicePreference::Auto
            },
        }
    }

    fn prompt_policy(&self) -> PromptPolicy {
        if self.allow_empty_prompt {
            PromptPolicy::PassThrough
        } else {
            PromptPolicy::RejectEmpty
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ImagineArgs = argh::from_env();

    // load the model before anything else, a failure here is fatal
    let loader = Backend::loader(args.model_config());
    let handle = loader.ensure_model_loaded()?;
    let session = Arc::new(GenerationSession::new(handle, args.prompt_policy()));

    match args.command {
        ImagineCommands::Serve(serve) => {
            let config = ServerConfig {
                host: serve.host,
                port: serve.port,
            };
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_server(config, session.clone()))?;
        }
        ImagineCommands::Generate(generate) => {
            session.submit(&generate.prompt)?;

            let snapshot = loop {
                let snapshot = session.wait_for_completion(Duration::from_secs(1));
                if snapshot.status != SessionPhase::Generating {
                    break snapshot;
                }
                log::info!("Generating image... {}%", snapshot.percent);
            };

            match session.present() {
                Some(output) => {
                    std::fs::write(&generate.output, output.artifact.bytes())?;
                    log::info!(
                        "Wrote {}x{} image to {}",
                        output.size.width,
                        output.size.height,
                        generate.output.display()
                    );
                }
                None => {
                    let message = snapshot
                        .error
                        .unwrap_or_else(|| "generation did not produce an image".to_string());
                    return Err(message.into());
                }
            }
        }
    }

    Ok(())
}

async fn run_server(
    config: ServerConfig,
    session: Arc<GenerationSession<Backend>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config.addr();
    let app = server::router(session);

    log::info!("🚀 Starting the server");
    log::info!("🔥 Listening on: {}", addr);
    log::info!("🔧 Press Ctrl+C to stop the server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
