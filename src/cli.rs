//! Command-line framing: a default `serve` action plus a `config` subcommand
//! group (`show`, `validate`, `path`), mirroring the teacher's own
//! `Commands::Config` shape but with gateway-specific subcommand bodies —
//! there's no `--reset`/`--edit` here, nothing generates or opens a config
//! file, since the gateway has no bundled theme/TUI config to scaffold.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{Config, VERSION};
use crate::routing::build_routing_table;

#[derive(Parser)]
#[command(name = "llm-gateway")]
#[command(version = VERSION)]
#[command(about = "Protocol-translating LLM API gateway", long_about = None)]
pub struct Cli {
    /// Path to a config file, overriding the default lookup location.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway (also the default action with no subcommand).
    Serve,
    /// Inspect configuration without starting the listener.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration with provenance comments.
    Show,
    /// Run the Route Preprocessor against the loaded config and report errors.
    Validate,
    /// Print the resolved config file path.
    Path,
}

/// Outcome of dispatching a CLI invocation. `Exit` means the process should
/// stop now with the given code; `Serve` means proceed to `main`'s server
/// startup with the loaded config.
pub enum Dispatch {
    Exit(i32),
    Serve(Config),
}

pub fn dispatch() -> Dispatch {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        None | Some(Commands::Serve) => match Config::from_env_with_override(config_path) {
            Ok(config) => Dispatch::Serve(config),
            Err(e) => {
                eprintln!("config error: {e}");
                Dispatch::Exit(2)
            }
        },
        Some(Commands::Config { action }) => match action {
            ConfigAction::Path => {
                handle_config_path();
                Dispatch::Exit(0)
            }
            ConfigAction::Show => match Config::from_env_with_override(config_path) {
                Ok(config) => {
                    handle_config_show(&config, config_path);
                    Dispatch::Exit(0)
                }
                Err(e) => {
                    eprintln!("config error: {e}");
                    Dispatch::Exit(2)
                }
            },
            ConfigAction::Validate => Dispatch::Exit(handle_config_validate(config_path)),
        },
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => {
            eprintln!("error: could not determine config path");
        }
    }
}

fn handle_config_show(config: &Config, explicit_path: Option<&std::path::Path>) {
    print!("{}", config.to_toml());

    match explicit_path {
        Some(path) => println!("# source: {} (--config)", path.display()),
        None => match Config::config_path() {
            Some(path) if path.exists() => println!("# source: {}", path.display()),
            _ => println!("# source: defaults (no config file)"),
        },
    }
}

/// Runs the Route Preprocessor against the loaded config and reports a
/// `ConfigError` to stderr without binding a port. Exit code 1 on failure,
/// matching the Route Preprocessor's fail-closed contract.
fn handle_config_validate(explicit_path: Option<&std::path::Path>) -> i32 {
    let config = match Config::from_env_with_override(explicit_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e}");
            return 2;
        }
    };

    match build_routing_table(&config.providers, &config.routing.routes) {
        Ok(table) => {
            println!("config is valid: {} route(s) configured", table.route_names().len());
            0
        }
        Err(e) => {
            eprintln!("config error: {e}");
            1
        }
    }
}
