use argh::FromArgs;
use kornia_imagine::server::GenerateRequest;
use std::path::PathBuf;

// defaults for the client
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 3000;

#[derive(FromArgs)]
/// Imagine client for scheduling generations and fetching images
struct ClientArgs {
    /// the host to connect to
    #[argh(option, default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// command to execute: "generate", "progress" or "download"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    Generate(GenerateCommand),
    Progress(ProgressCommand),
    Download(DownloadCommand),
}

#[derive(FromArgs)]
/// Schedule a generation for a prompt
#[argh(subcommand, name = "generate")]
struct GenerateCommand {
    /// the prompt to use
    #[argh(option)]
    prompt: String,
}

#[derive(FromArgs)]
/// Check the progress of the current generation
#[argh(subcommand, name = "progress")]
struct ProgressCommand {}

#[derive(FromArgs)]
/// Download the last generated image
#[argh(subcommand, name = "download")]
struct DownloadCommand {
    /// where to write the png
    #[argh(option, short = 'o', default = "PathBuf::from(\"generated_image.png\")")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: ClientArgs = argh::from_env();

    let client = reqwest::Client::new();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    match args.command {
        ClientCommands::Generate(generate_command) => {
            let response = client
                .post(format!("http://{}/generate", addr))
                .json(&GenerateRequest {
                    prompt: generate_command.prompt,
                })
                .send()
                .await?;

            let result = response.json::<serde_json::Value>().await?;
            println!("Result: {}", serde_json::to_string_pretty(&result)?);
        }
        ClientCommands::Progress(_) => {
            let response = client
                .get(format!("http://{}/progress", addr))
                .send()
                .await?;

            let result = response.json::<serde_json::Value>().await?;
            println!("Result: {}", serde_json::to_string_pretty(&result)?);
        }
        ClientCommands::Download(download_command) => {
            let response = client
                .get(format!("http://{}/download", addr))
                .send()
                .await?
                .error_for_status()?;

            let bytes = response.bytes().await?;
            std::fs::write(&download_command.output, &bytes)?;
            println!(
                "Saved {} bytes to {}",
                bytes.len(),
                download_command.output.display()
            );
        }
    }

    Ok(())
}
