use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keel_kube::KubeProvider;
use keel_tunnel::{CancelBroadcaster, Frame, InvokeError, Invoker, RelayError, Route, SignalGuard};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;

use config::{KeelConfig, ResolvedConfig};

/// Keel - invoke and stream to platform apps through pod tunnels
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(about = "Reach platform apps inside the cluster through port-forward tunnels")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.config/keel/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Kubeconfig context
    #[arg(long, global = true)]
    context: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Call a method on an app and print the response body
    Invoke {
        /// App id (the `dapr.io/app-id` label)
        app_id: String,

        /// Method path, e.g. `status` or `v1/entities`
        method: String,

        /// Request body, sent as application/json
        #[arg(short, long)]
        data: Option<String>,

        /// HTTP verb (GET without data, POST with it)
        #[arg(short = 'X', long)]
        verb: Option<String>,

        /// Always go through a tunnel, even inside the cluster
        #[arg(long)]
        tunnel: bool,
    },

    /// Open a WebSocket to an app and print every frame it sends
    Stream {
        app_id: String,

        /// Path on the app's own port
        path: String,

        /// Text sent once the stream is open
        #[arg(short, long, default_value = "")]
        data: String,
    },

    /// Forward a local port to a pod port until interrupted
    Forward {
        pod: String,

        #[arg(short, long, default_value = "default")]
        namespace: String,

        /// Port inside the pod
        #[arg(short = 'p', long)]
        remote_port: u16,

        /// Local port (0 picks a free one)
        #[arg(short, long, default_value_t = 0)]
        local_port: u16,
    },
}

#[tokio::main]
async fn main() {
    // kube's rustls transport needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env();
    for target in ["keel", "keel_tunnel", "keel_kube"] {
        filter = filter.add_directive(format!("{}={}", target, level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ResolvedConfig> {
    let path = cli.config.clone().unwrap_or_else(KeelConfig::default_path);
    let file = KeelConfig::load(&path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;

    let mut resolved = file.resolve()?;
    if let Some(context) = &cli.context {
        resolved.context = Some(context.clone());
    }
    Ok(resolved)
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli)?;

    if let Commands::Invoke { tunnel: true, .. } = &cli.command {
        config.route = Route::Tunnel;
    }

    let broadcaster = CancelBroadcaster::new();
    let _guard = SignalGuard::install(broadcaster.clone());

    let provider = Arc::new(KubeProvider::new(config.kube_options()));
    let invoker = Invoker::new(provider, config.invoker_settings())?.with_broadcaster(broadcaster);

    match cli.command {
        Commands::Invoke {
            app_id,
            method,
            data,
            verb,
            ..
        } => {
            let payload = data.unwrap_or_default();
            let verb = verb.unwrap_or_else(|| default_verb(&payload).to_string());
            let body = invoker
                .invoke(&app_id, &method, payload.as_bytes(), &verb)
                .await?;
            println!("{}", body);
        }

        Commands::Stream {
            app_id,
            path,
            data,
        } => {
            let cancel = CancellationToken::new();
            let _registration = invoker.broadcaster().register({
                let cancel = cancel.clone();
                move || cancel.cancel()
            });

            let result = invoker
                .stream_via_tunnel(&app_id, &path, &data, &cancel, print_frame)
                .await;

            match result {
                Ok(_) => {}
                Err(InvokeError::Relay(e @ RelayError::StreamClosed { .. })) => {
                    tracing::debug!("{}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Forward {
            pod,
            namespace,
            remote_port,
            local_port,
        } => {
            let mut tunnel = invoker
                .forward(&namespace, &pod, remote_port, local_port)
                .await?;

            if let Some(ports) = tunnel.ports() {
                println!("Forwarding from {} -> {}", ports.local_addr(), ports.remote);
            }

            tunnel.closed().await;
        }
    }

    Ok(())
}

fn default_verb(payload: &str) -> &'static str {
    if payload.is_empty() {
        "GET"
    } else {
        "POST"
    }
}

fn print_frame(frame: Frame) {
    match frame {
        Frame::Text(text) => println!("{}", text),
        Frame::Binary(bytes) => println!("{:?}", bytes.as_ref()),
        Frame::Control(_) => {}
    }
}
