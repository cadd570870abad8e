#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leadbridge::config::Config;
use leadbridge::store::AppConfig;
use leadbridge::transport::AuthState;
use leadbridge::{daemon, phone, session};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// WhatsApp to CRM lead bridge.
#[derive(Parser, Debug)]
#[command(name = "leadbridge")]
#[command(version)]
#[command(about = "Files WhatsApp conversations under CRM leads.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the WhatsApp session, ingestion, heartbeat and HTTP gateway
    Daemon {
        /// Port to listen on (use 0 for random available port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
    },

    /// Show configuration, stored credentials and last daemon health
    Status,

    /// Unlink this device by wiping stored WhatsApp credentials
    Logout,

    /// Show or change the stored app config (lead auto-save and default tag)
    AppConfig {
        /// Create leads for unknown numbers
        #[arg(long)]
        auto_save: Option<bool>,

        /// Tag applied to newly created leads (empty string clears it)
        #[arg(long)]
        default_trigger: Option<String>,
    },

    /// Print the canonical form of a phone number
    Normalize {
        /// Phone number in any common format
        phone: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    if let Commands::Normalize { phone } = &cli.command {
        println!("{}", phone::normalize(phone)?);
        return Ok(());
    }

    let config = Config::load_or_init()?;

    match cli.command {
        Commands::Daemon { port, host } => {
            let port = port.unwrap_or(config.gateway.port);
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            if port == 0 {
                info!("Starting leadbridge daemon on {host} (random port)");
            } else {
                info!("Starting leadbridge daemon on {host}:{port}");
            }
            daemon::run(config, host, port).await
        }

        Commands::Status => print_status(&config).await,

        Commands::Logout => {
            let auth = AuthState::new(config.auth_dir());
            let removed = session::logout(&auth)?;
            println!("Removed {removed} credential entries from {}", auth.dir().display());
            println!("Restart the daemon to pair again.");
            Ok(())
        }

        Commands::AppConfig {
            auto_save,
            default_trigger,
        } => {
            let store = leadbridge::store::create_store(&config)?;
            let mut app = store.app_config().await?.unwrap_or_default();
            if auto_save.is_some() || default_trigger.is_some() {
                if let Some(flag) = auto_save {
                    app.auto_save_leads = flag;
                }
                if let Some(tag) = default_trigger {
                    app.default_trigger = Some(tag).filter(|t| !t.trim().is_empty());
                }
                store.put_app_config(&app).await?;
                println!("App config updated.");
            }
            print_app_config(&app);
            Ok(())
        }

        Commands::Normalize { .. } => Ok(()),
    }
}

fn print_app_config(app: &AppConfig) {
    println!("auto_save_leads: {}", app.auto_save_leads);
    println!(
        "default_trigger: {}",
        app.default_trigger.as_deref().unwrap_or("(NuevoLead)")
    );
}

async fn print_status(config: &Config) -> Result<()> {
    println!("leadbridge status");
    println!();
    println!("Version:     {}", env!("CARGO_PKG_VERSION"));
    println!("Data dir:    {}", config.data_dir.display());
    println!("Config:      {}", config.config_path.display());
    println!("Session id:  {}", config.session.session_id);
    println!("Transport:   {}", config.session.transport);
    println!(
        "Gateway:     http://{}:{}",
        config.gateway.host, config.gateway.port
    );
    println!();

    let auth = AuthState::new(config.auth_dir());
    match auth.load_credentials()? {
        Some(creds) => println!(
            "Credentials: paired as {}",
            creds
                .me
                .as_deref()
                .map_or_else(|| "(unknown)".to_string(), session::phone_from_jid)
        ),
        None => println!("Credentials: not paired ({})", auth.dir().display()),
    }

    let store = leadbridge::store::create_store(config)?;
    println!(
        "Store:       {} ({})",
        store.name(),
        if store.health_check().await { "ok" } else { "unreachable" }
    );
    match store.server_status(&config.session.session_id).await? {
        Some(server) => println!(
            "Last status: {} at {}",
            server.status,
            server.last_seen.to_rfc3339()
        ),
        None => println!("Last status: never reported"),
    }

    let state_path = daemon::state_file_path(config);
    match std::fs::read_to_string(&state_path) {
        Ok(raw) => {
            let state: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", state_path.display()))?;
            println!();
            println!("Daemon health (written {}):", state["written_at"].as_str().unwrap_or("?"));
            if let Some(components) = state["components"].as_object() {
                for (name, component) in components {
                    println!(
                        "  {name:<10} {}",
                        component["status"].as_str().unwrap_or("unknown")
                    );
                }
            }
        }
        Err(_) => println!("Daemon:      no state file at {}", state_path.display()),
    }
    Ok(())
}
