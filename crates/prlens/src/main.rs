//! # prlens
//!
//! Relays an agent runtime's event stream to per-session SSE consumers,
//! parses agent-authored review directives, and can watch a session from
//! the terminal.

#![deny(unsafe_code)]

mod serve;
mod watch;

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use prlens_settings::PrlensSettings;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// PR review event relay.
#[derive(Parser, Debug)]
#[command(name = "prlens", version, about = "PR review event relay")]
struct Cli {
    /// Settings file (defaults to `~/.prlens/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server (default).
    Serve(ServeArgs),
    /// Parse a message file and print the segments as JSON (`-` for stdin).
    Parse {
        /// File to parse.
        file: PathBuf,
    },
    /// Attach to a session through a running server and print its stream.
    Watch(WatchArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Host to bind.
    #[arg(long)]
    host: Option<String>,
    /// Port to bind.
    #[arg(long)]
    port: Option<u16>,
    /// Agent runtime base URL.
    #[arg(long)]
    upstream_url: Option<String>,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Session to watch.
    session: String,
    /// prlens server URL (defaults to the configured bind address).
    #[arg(long)]
    server: Option<String>,
    /// Send this message once attached.
    #[arg(long)]
    message: Option<String>,
    /// Agent mode for `--message`.
    #[arg(long, requires = "message")]
    agent: Option<String>,
}

fn load(config: Option<&Path>) -> Result<PrlensSettings> {
    let settings = match config {
        Some(path) => prlens_settings::load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => prlens_settings::load_settings().context("failed to load settings")?,
    };
    Ok(settings)
}

fn apply_serve_args(settings: &mut PrlensSettings, args: &ServeArgs) -> Result<()> {
    if let Some(host) = &args.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(url) = &args.upstream_url {
        settings.upstream.base_url = url.trim_end_matches('/').to_string();
    }
    settings.validate().context("invalid settings")?;
    Ok(())
}

fn read_input(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut content = String::new();
        let _ = std::io::stdin()
            .read_to_string(&mut content)
            .context("failed to read stdin")?;
        return Ok(content);
    }
    std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load(cli.config.as_deref())?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(prlens_settings::settings_path);

    let command = cli.command.unwrap_or(Command::Serve(ServeArgs::default()));
    if let Command::Serve(args) = &command {
        apply_serve_args(&mut settings, args)?;
    }
    let _ = prlens_core::logging::init_logging(&settings.logging.level, settings.logging.json);
    prlens_settings::init_settings(settings);
    let settings = prlens_settings::get_settings();

    match command {
        Command::Serve(_) => serve::run(&settings, config_path).await,
        Command::Parse { file } => {
            let content = read_input(&file)?;
            let parsed = prlens_tokens::parse(&content);
            println!("{}", serde_json::to_string_pretty(&parsed)?);
            Ok(())
        }
        Command::Watch(args) => watch::run(&settings, args).await,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_is_default() {
        let cli = Cli::try_parse_from(["prlens"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn serve_flags_override_settings() {
        let cli = Cli::try_parse_from([
            "prlens",
            "serve",
            "--port",
            "9000",
            "--upstream-url",
            "http://10.0.0.2:4096/",
        ])
        .unwrap();
        let Some(Command::Serve(args)) = cli.command else {
            panic!("expected serve");
        };
        let mut settings = PrlensSettings::default();
        apply_serve_args(&mut settings, &args).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.upstream.base_url, "http://10.0.0.2:4096");
        assert_eq!(settings.server.host, "127.0.0.1");
    }

    #[test]
    fn empty_upstream_url_is_rejected() {
        let args = ServeArgs {
            upstream_url: Some("/".into()),
            ..ServeArgs::default()
        };
        let mut settings = PrlensSettings::default();
        assert!(apply_serve_args(&mut settings, &args).is_err());
    }

    #[test]
    fn watch_agent_requires_message() {
        assert!(Cli::try_parse_from(["prlens", "watch", "ses_1", "--agent", "plan"]).is_err());
        let cli =
            Cli::try_parse_from(["prlens", "watch", "ses_1", "--message", "hi", "--agent", "plan"])
                .unwrap();
        assert!(matches!(cli.command, Some(Command::Watch(ref w)) if w.session == "ses_1"));
    }

    #[test]
    fn config_file_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"server": {{"port": 5555}}}}"#).unwrap();
        let settings = load(Some(file.path())).unwrap();
        assert_eq!(settings.server.port, 5555);
        assert_eq!(settings.router.queue_capacity, 100);
    }

    #[test]
    fn read_input_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[[file:a.rs]]").unwrap();
        assert_eq!(read_input(file.path()).unwrap(), "[[file:a.rs]]");
        assert!(read_input(Path::new("/definitely/not/here.md")).is_err());
    }
}
