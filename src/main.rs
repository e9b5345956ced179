use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use pingora::server::configuration::Opt;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trino_gateway::config::{Config, ConfigError, ManagementConfig};
use trino_gateway::Gateway;

#[derive(Parser)]
#[command(name = "trino-gateway")]
#[command(about = "A routing gateway for fleets of Trino clusters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate example configuration files
    Config {
        /// Management mode (remote or static)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

// Pingora owns its runtimes, so main stays synchronous.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_gateway(config)?,
        Commands::Config { mode, output } => generate_config(mode, output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

fn run_gateway(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        ports = ?config.gateway.ports,
        "Starting trino-gateway"
    );

    let mut gateway = Gateway::new(config);
    gateway
        .initialize(Some(Opt::default()))
        .map_err(|e| anyhow!("Failed to initialize gateway: {}", e))?;

    gateway
        .run()
        .map_err(|e| anyhow!("Failed to run gateway: {}", e))
}

fn generate_config(mode: String, output: PathBuf) -> anyhow::Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, &mode).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  trino-gateway run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    let config = match Config::load_from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    };

    println!("✓ Configuration file is valid");
    println!("  Listeners: {}", config.listen_addrs().join(", "));
    println!(
        "  Default routing group: {}",
        config.gateway.default_routing_group
    );
    println!(
        "  External address: {}://{}",
        config.gateway.external_scheme.as_str(),
        config.gateway.external_hostname
    );

    match &config.management {
        ManagementConfig::Remote { url, .. } => {
            println!("  Management API: {}", url);
        }
        ManagementConfig::Static {
            backends,
            groups,
            policies,
        } => {
            println!("  Static catalog: {} backends", backends.len());
            for (i, backend) in backends.iter().enumerate() {
                println!("    {}: {} ({})", i + 1, backend.id, backend.base_url());
            }
            println!("  Routing groups: {}", groups.len());
            println!("  Policies: {}", policies.len());
        }
    }

    if config.monitor.enabled {
        println!(
            "  Health monitor: every {}s, probe timeout {}s",
            config.monitor.interval_sec, config.monitor.probe_timeout_sec
        );
    } else {
        println!("  Health monitor: disabled");
    }

    Ok(())
}

fn show_version() {
    println!("trino-gateway v{}", env!("CARGO_PKG_VERSION"));
    println!("A routing gateway for fleets of Trino clusters");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Policy based routing by port, host, client tags and connection properties");
    println!("  • Query id stickiness for follow-up protocol requests");
    println!("  • Cron scheduled health and load monitoring of Trino clusters");
    println!("  • Prometheus metrics");
}

/// RUST_LOG takes precedence over the configured level
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!(level = %config.logging.level, format = %config.logging.format, "Logging initialized");
    Ok(())
}
