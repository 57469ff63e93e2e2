use async_trait::async_trait;
use clap::{Parser, Subcommand};
use shell_loader::{
    config::ShellConfig,
    event_bus::BoxError,
    shell::{ModuleFetcher, ShellContext},
    Error,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file; the built-in module set is used when it does not exist
    #[arg(short, long, default_value = "shell.json")]
    config: PathBuf,

    /// Enable debug mode
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the dependency-respecting load order
    Order,
    /// Mount every module with a simulated fetcher and report the outcome
    Simulate {
        /// Simulated fetch latency per module
        #[arg(long, default_value_t = 50)]
        delay_ms: u64,

        /// Modules whose fetch fails
        #[arg(long)]
        fail: Vec<String>,

        /// Only preload critical modules
        #[arg(long)]
        critical_only: bool,

        /// Override the dependency timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

struct SimulatedFetcher {
    delay: Duration,
    failing: Vec<String>,
}

#[async_trait]
impl ModuleFetcher for SimulatedFetcher {
    async fn fetch(&self, name: &str) -> Result<(), BoxError> {
        debug!("Fetching remote entry for {}", name);
        tokio::time::sleep(self.delay).await;
        if self.failing.iter().any(|f| f == name) {
            return Err(format!("remote entry for {} unavailable", name).into());
        }
        Ok(())
    }
}

fn load_config(path: &Path) -> Result<ShellConfig, Error> {
    if path.exists() {
        Ok(ShellConfig::from_file(path)?)
    } else {
        info!("{} not found, using built-in modules", path.display());
        Ok(ShellConfig::builtin())
    }
}

async fn run(cli: &Cli) -> Result<(), Error> {
    let mut config = load_config(&cli.config)?;
    if let Command::Simulate {
        timeout_ms: Some(timeout_ms),
        ..
    } = &cli.command
    {
        config.dependency_timeout = Duration::from_millis(*timeout_ms);
    }
    info!("config loaded.");
    debug!("config: {:?}", config);

    let shell = ShellContext::new(config)?;

    match &cli.command {
        Command::Order => {
            for (i, name) in shell.load_order().iter().enumerate() {
                let deps = shell.graph().dependencies_of(name);
                if deps.is_empty() {
                    println!("{:>2}. {}", i + 1, name);
                } else {
                    println!("{:>2}. {} (after {})", i + 1, name, deps.join(", "));
                }
            }
        }
        Command::Simulate {
            delay_ms,
            fail,
            critical_only,
            ..
        } => {
            let fetcher = Arc::new(SimulatedFetcher {
                delay: Duration::from_millis(*delay_ms),
                failing: fail.clone(),
            });
            let result = if *critical_only {
                shell.preload_critical(fetcher).await
            } else {
                shell.mount_all(fetcher).await
            };

            for name in shell.graph().modules() {
                let loader = shell.loader();
                match loader.get_error(name) {
                    Some(e) => println!("{:<16} {:<10} {}", name, loader.status(name), e),
                    None => println!("{:<16} {}", name, loader.status(name)),
                }
            }

            shell.teardown();
            result?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
