mod install;
mod test_cmd;

use std::path::{Path, PathBuf};

use anyhow::Result;
use console::style;

use crate::core::engine::CheckinEngine;
use crate::core::history::HistoryStore;
use crate::core::terminal::{self, print_error};
use crate::core::transport::ServerClient;
use crate::platform::{NativePlatform, Platform};

pub const DEFAULT_SERVER: &str = "https://vigilhq.com";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Settings {
    pub server: String,
    pub history: PathBuf,
    pub level: String,
    pub verbose: bool,
    pub force: bool,
    pub show_version: bool,
    pub show_help: bool,
    /// Positional arguments in order: command and/or client key.
    pub rest: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            history: NativePlatform::data_dir().join("history.json"),
            level: "info".to_string(),
            verbose: false,
            force: false,
            show_version: false,
            show_help: false,
            rest: Vec::new(),
        }
    }
}

pub(crate) fn parse_args(args: &[String]) -> Settings {
    let mut settings = Settings::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    settings.server = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--data" | "-d" => {
                if i + 1 < args.len() {
                    settings.history = PathBuf::from(&args[i + 1]);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--level" | "-l" => {
                if i + 1 < args.len() {
                    settings.level = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                settings.verbose = true;
                i += 1;
            }
            "--force" | "-F" => {
                settings.force = true;
                i += 1;
            }
            "--version" | "-V" => {
                settings.show_version = true;
                i += 1;
            }
            "--help" | "-h" => {
                settings.show_help = true;
                i += 1;
            }
            other => {
                settings.rest.push(other.to_string());
                i += 1;
            }
        }
    }
    settings
}

fn print_help() {
    terminal::print_banner();
    println!("{}", style("Usage:").bold());
    println!("  Normal checkin with server:");
    println!("    vigil [OPTIONS] CLIENT_KEY");
    println!("    vigil [OPTIONS] run CLIENT_KEY");
    println!("  Install:");
    println!("    vigil            (no arguments)");
    println!("    vigil [OPTIONS] install");
    println!("  Local plugin testing:");
    println!("    vigil [OPTIONS] test PATH_TO_PLUGIN [opt1=val1 opt2=val2 ...]");
    println!();
    println!("{}", style("Options:").bold());
    println!("  -s, --server URL    Server to report to (default: {})", DEFAULT_SERVER);
    println!("  -d, --data FILE     Data file used to track history");
    println!("  -l, --level LEVEL   Log level: trace, debug, info, warn, error");
    println!("  -v, --verbose       Log to stdout");
    println!("  -F, --force         Checkin regardless of last checkin time");
    println!("  -V, --version       Print the version");
    println!("  -h, --help          Show this message");
    println!();
    println!("This client is meant to be installed and invoked through cron");
    println!("or any other scheduler. Example:");
    println!("  vigil --verbose 6ecad322-0d17-4cb8-9b2c-a12c4541853f");
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let settings = parse_args(&args);

    if settings.show_version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if settings.show_help || settings.rest.first().map(String::as_str) == Some("help") {
        print_help();
        return Ok(());
    }

    crate::logging::init(settings.verbose, &settings.level);

    match settings.rest.first().map(String::as_str) {
        None | Some("install") => install::run_install(&settings).await,
        Some("test") => test_cmd::run_test(&settings).await,
        Some("run") => match settings.rest.get(1) {
            Some(key) => run_checkin(&settings, key).await,
            None => {
                print_error("Error: 'run' needs a CLIENT_KEY.");
                print_help();
                Ok(())
            }
        },
        Some(key) => run_checkin(&settings, key).await,
    }
}

async fn run_checkin(settings: &Settings, client_key: &str) -> Result<()> {
    let client = ServerClient::new(&settings.server, client_key)?;
    let history = HistoryStore::load(&settings.history)?;
    let lock_dir = settings
        .history
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| NativePlatform::data_dir());

    let mut engine = CheckinEngine::new(client, history, lock_dir, settings.force);
    engine.run_pass().await?;
    Ok(())
}
