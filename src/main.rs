use clap::{Parser, Subcommand};
use tracing::error;

use portless::config::Settings;
use portless::daemon::{self, TlsOptions};
use portless::hostname::display_url;
use portless::routes::RouteStore;
use portless::state::StateDir;
use portless::{certs, runner};

#[derive(Parser)]
#[command(
    name = "portless",
    about = "Stable name.localhost URLs for local dev servers",
    subcommand_value_name = "COMMAND"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the proxy daemon
    Proxy {
        #[command(subcommand)]
        action: ProxyCommand,
    },
    /// List registered apps
    List,
    /// Install the local CA into the platform trust store
    Trust,
    /// Run a command under a name: portless <name> <cmd> [args...] [--force]
    #[command(external_subcommand)]
    Run(Vec<String>),
}

#[derive(Subcommand)]
enum ProxyCommand {
    /// Start the proxy daemon
    Start {
        /// Proxy listen port
        #[arg(short, long)]
        port: Option<u16>,
        /// Terminate TLS with the managed local CA
        #[arg(long)]
        https: bool,
        /// Use this PEM certificate instead of the managed tree
        #[arg(long, requires = "key")]
        cert: Option<std::path::PathBuf>,
        /// Private key for --cert
        #[arg(long, requires = "cert")]
        key: Option<std::path::PathBuf>,
        /// Force plain HTTP even when HTTPS is configured elsewhere
        #[arg(long, conflicts_with = "https")]
        no_tls: bool,
        /// Stay in the foreground instead of daemonizing
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the running proxy daemon
    Stop,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("portless=info")),
        )
        .init();

    let settings = Settings::from_env();
    let cli = Cli::parse();

    let code = match run(cli.command, settings).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("portless: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(command: Command, mut settings: Settings) -> anyhow::Result<i32> {
    match command {
        Command::Proxy { action } => match action {
            ProxyCommand::Start {
                port,
                https,
                cert,
                key,
                no_tls,
                foreground,
            } => {
                if let Some(port) = port {
                    settings.proxy_port = port;
                }
                let enabled = !no_tls && (https || settings.https || cert.is_some());
                let tls = TlsOptions { enabled, cert, key };

                if foreground {
                    daemon::run_foreground(&settings, tls).await?;
                } else {
                    daemon::start_detached(&settings, &tls).await?;
                    let scheme_port = settings.proxy_port;
                    println!(
                        "proxy running on {}",
                        display_url("localhost", scheme_port, enabled)
                    );
                }
                Ok(0)
            }
            ProxyCommand::Stop => {
                daemon::stop(&settings).await?;
                Ok(0)
            }
        },
        Command::List => {
            list_apps(&settings).await;
            Ok(0)
        }
        Command::Trust => {
            let state = StateDir::locate(settings.proxy_port, settings.state_dir.as_deref());
            state.ensure()?;
            let manager = certs::CertManager::new(&state);
            manager.ensure_materialized()?;
            certs::install_trust(&manager.ca_cert_path())?;
            if certs::verify_trust(&manager.ca_cert_path())? {
                println!("CA is trusted by this system");
            } else {
                println!("CA installed, but could not be verified in the trust store");
            }
            Ok(0)
        }
        Command::Run(mut args) => {
            // A trailing --force belongs to portless, not the child command.
            let force = match args.last().map(String::as_str) {
                Some("--force") => {
                    args.pop();
                    true
                }
                _ => false,
            };
            if args.is_empty() {
                anyhow::bail!("usage: portless <name> <cmd> [args...] [--force]");
            }
            let name = args.remove(0);
            let code = runner::run_app(&settings, &name, &args, force).await?;
            Ok(code)
        }
    }
}

async fn list_apps(settings: &Settings) {
    let (state, port, tls) = match daemon::discover(settings).await {
        Some(location) => (location.state, location.port, location.tls),
        None => {
            let state = StateDir::locate(settings.proxy_port, settings.state_dir.as_deref());
            (state, settings.proxy_port, settings.https)
        }
    };

    let routes = RouteStore::new(state).load_and_gc();
    if routes.is_empty() {
        println!("No apps registered.");
        return;
    }
    for route in routes {
        println!(
            "{:<40} {:<28} pid {}",
            display_url(&route.hostname, port, tls),
            format!("127.0.0.1:{}", route.port),
            route.pid
        );
    }
}
