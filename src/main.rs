use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use outpost::agent::Agent;
use outpost::capture::{CaptureProvider, CommandCaptureProvider, GzipTranscoder};
use outpost::config::{load_agent_config, AgentConfig};
use outpost::controller::{encode_payload, ControllerClient, UploadMetadata, UploadTarget};
use outpost::identity::{system_active, DeviceIdentity};

#[derive(Parser)]
#[command(name = "outpost")]
#[command(about = "Device agent for remote capture, configuration sync, and approval-gated recording")]
#[command(version)]
struct Cli {
    /// Configuration directory (default: /etc/outpost/config if it exists,
    /// otherwise the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent control loop (continuous capture and config sync)
    Agent {
        /// Metrics endpoint port override
        #[arg(short, long)]
        port: Option<u16>,
        /// Capture period override (milliseconds)
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Perform a single capture/upload round and exit
    Capture,
    /// Print the collected device identity
    Identity {
        /// Emit JSON instead of plain text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    // Config directory precedence: CLI argument, then the system-wide
    // directory if it exists, then the user config directory.
    let config_dir = cli.config.unwrap_or_else(default_config_dir);

    match cli.command {
        Commands::Agent { port, interval_ms } => run_agent(&config_dir, port, interval_ms).await,
        Commands::Capture => run_capture_once(&config_dir).await,
        Commands::Identity { json } => print_identity(json),
    }
}

fn default_config_dir() -> PathBuf {
    let system_config = PathBuf::from("/etc/outpost/config");
    if system_config.exists() {
        system_config
    } else {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("outpost")
    }
}

fn load_config_or_default(config_dir: &PathBuf) -> AgentConfig {
    load_agent_config(config_dir).unwrap_or_else(|err| {
        info!(error = %err, dir = %config_dir.display(), "no agent config loaded, using defaults");
        AgentConfig::default()
    })
}

async fn run_agent(
    config_dir: &PathBuf,
    port: Option<u16>,
    interval_ms: Option<u64>,
) -> anyhow::Result<()> {
    let mut config = load_config_or_default(config_dir);
    if let Some(port) = port {
        config.metrics_port = port;
    }
    if let Some(interval_ms) = interval_ms {
        config.capture_interval_ms = interval_ms;
    }

    info!(
        server = %config.server_address,
        interval_ms = config.capture_interval_ms,
        metrics_port = config.metrics_port,
        "agent configuration loaded"
    );

    let mut agent = Agent::new(config)?;
    agent.start().await?;
    println!("Agent started. Press Ctrl+C to stop.");
    agent.run_event_loop().await
}

async fn run_capture_once(config_dir: &PathBuf) -> anyhow::Result<()> {
    let config = load_config_or_default(config_dir);
    let provider = CommandCaptureProvider::from_settings(&config.capture)?;
    let transcoder = GzipTranscoder::new(config.capture.compression_level);
    let client = ControllerClient::new()?;
    let identity = DeviceIdentity::collect();

    let frames = provider.capture().await?;
    println!("Captured {} frame(s)", frames.len());

    let metadata = UploadMetadata {
        device_id: identity.mac_address.clone(),
        user_id: config.user_id.clone().unwrap_or_default(),
        username: identity.username.clone(),
        local_ip: identity.local_ip.clone(),
        active: system_active(config.capture.activity_cpu_threshold),
        registered: true,
        captured_at: chrono::Utc::now().to_rfc3339(),
    };
    let payload = encode_payload(&frames, &transcoder, metadata)?;
    let target = UploadTarget::from_config(&config);
    client.upload_captures(&target, &payload).await?;
    println!(
        "Uploaded {} image(s) to {}",
        payload.count,
        target.upload_url()
    );
    Ok(())
}

fn print_identity(json: bool) -> anyhow::Result<()> {
    let identity = DeviceIdentity::collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&identity)?);
    } else {
        println!("mac address: {}", identity.mac_address);
        println!("hostname:    {}", identity.hostname);
        println!("username:    {}", identity.username);
        println!("local ip:    {}", identity.local_ip);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_agent_with_overrides() {
        let cli = Cli::try_parse_from([
            "outpost",
            "--verbose",
            "agent",
            "--port",
            "9100",
            "--interval-ms",
            "250",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(!cli.debug);
        match cli.command {
            Commands::Agent { port, interval_ms } => {
                assert_eq!(port, Some(9100));
                assert_eq!(interval_ms, Some(250));
            }
            _ => panic!("expected agent subcommand"),
        }
    }

    #[test]
    fn test_cli_parses_identity_json() {
        let cli = Cli::try_parse_from(["outpost", "identity", "--json"]).unwrap();
        match cli.command {
            Commands::Identity { json } => assert!(json),
            _ => panic!("expected identity subcommand"),
        }
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["outpost"]).is_err());
    }

    #[test]
    fn test_default_config_dir_is_absolute_or_local() {
        let dir = default_config_dir();
        assert!(!dir.as_os_str().is_empty());
    }
}
