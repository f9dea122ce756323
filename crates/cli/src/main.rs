use clap::{Parser, Subcommand};
use relay::channels::{ChannelClient, ConsoleChannel};
use relay::dispatch::{DispatchPipeline, DispatchReport, SingleFlightGuard};
use relay::exec::ProcessExecutor;
use relay::task::ExternalTaskRunner;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
#[command(name = "relay-bot")]
#[command(about = "Relay chat mentions to a local text-generation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config.json.
    Init {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Connect to Discord and relay mentions to the external task. Serves health over HTTP.
    Run {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Health port (default from config or 15152)
        #[arg(long, short)]
        port: Option<u16>,

        /// Accept messages from the designated automated test caller.
        #[arg(long)]
        test_mode: bool,
    },

    /// Talk to the external task through the dispatch pipeline from this terminal.
    Chat {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("relay-bot {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run {
            config,
            port,
            test_mode,
        }) => {
            if let Err(e) = run_relay(config, port, test_mode).await {
                log::error!("relay failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config }) => {
            if let Err(e) = run_chat(config).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(relay::config::default_config_path);
    let dir = relay::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_relay(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    test_mode: bool,
) -> anyhow::Result<()> {
    let (mut config, path) = relay::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    if test_mode {
        config.dispatch.test_mode = true;
    }
    log::info!(
        "starting relay on {}:{} (config {})",
        config.gateway.bind,
        config.gateway.port,
        path.display()
    );
    relay::gateway::run_gateway(config).await
}

async fn run_chat(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = relay::config::load_config(config_path)?;
    let console = Arc::new(ConsoleChannel::new("you"));
    let runner = ExternalTaskRunner::new(Arc::new(ProcessExecutor::from_config(&config.task)));
    let pipeline = relay::gateway::build_pipeline(
        &config,
        console.self_id(),
        Arc::new(SingleFlightGuard::new()),
        runner,
        console.clone() as Arc<dyn ChannelClient>,
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        report(&pipeline, console.inbound(input)).await;
    }

    Ok(())
}

async fn report(pipeline: &DispatchPipeline, message: relay::channels::InboundMessage) {
    match pipeline.handle(message).await {
        DispatchReport::Failed {
            error,
            notified: false,
            ..
        } => eprintln!("chat error: {}", error),
        other => log::debug!("chat: {:?}", other),
    }
}
