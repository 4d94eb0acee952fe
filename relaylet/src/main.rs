use std::path::PathBuf;
use std::process;

use anyhow::Context;
use relaylet::{HubConfig, UnixHost};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_SOCKET_NAME: &str = "relaylet.sock";

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let socket = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: relayletd [--socket <path>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --socket <path>  Hub socket path [default: $TMPDIR/{DEFAULT_SOCKET_NAME}]");
            eprintln!("  -h, --help       Print this help");
            process::exit(if msg.is_empty() { 0 } else { 2 });
        }
    };

    init_tracing();

    if let Err(e) = run(socket) {
        tracing::error!("relayletd failed: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<PathBuf, String> {
    let mut socket = std::env::temp_dir().join(DEFAULT_SOCKET_NAME);

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--socket" => {
                i += 1;
                socket = PathBuf::from(args.get(i).ok_or("--socket requires a value")?);
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(socket)
}

/// Logs go to stderr; `LOG_FORMAT=json` selects structured output.
fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    let _ = tracing_subscriber::registry()
        .with(log_filter())
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .try_init();
}

/// `RUST_LOG` wins. Otherwise `RELAYLET_LOG` sets one level for the library
/// and the daemon.
fn log_filter() -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        return EnvFilter::from_default_env();
    }
    let level = std::env::var("RELAYLET_LOG")
        .ok()
        .and_then(|value| parse_level(&value))
        .unwrap_or("info");
    EnvFilter::new(format!("relaylet={level},relayletd={level}"))
}

fn parse_level(value: &str) -> Option<&'static str> {
    match value.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

#[tokio::main]
async fn run(socket: PathBuf) -> anyhow::Result<()> {
    let host = UnixHost::bind(&socket)
        .with_context(|| format!("failed to bind hub socket at {}", socket.display()))?;

    let config = HubConfig::new()
        .on_connected(|id| tracing::info!(%id, "Context connected"))
        .on_disconnected(|id| tracing::info!(%id, "Context disconnected"))
        .on_warning(|warning| tracing::debug!(%warning, "Relay warning observed"));
    let hub = host.init_background_hub(config)?;

    tracing::info!(socket = %host.path().display(), "relayletd listening");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received");
    hub.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("relayletd")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn socket_defaults_to_temp_dir() {
        assert_eq!(
            parse_args(&args(&[])).unwrap(),
            std::env::temp_dir().join("relaylet.sock")
        );
    }

    #[test]
    fn socket_flag_overrides_default() {
        assert_eq!(
            parse_args(&args(&["--socket", "/run/hub.sock"])).unwrap(),
            PathBuf::from("/run/hub.sock")
        );
    }

    #[test]
    fn bad_arguments_are_reported() {
        assert_eq!(
            parse_args(&args(&["--socket"])).unwrap_err(),
            "--socket requires a value"
        );
        assert_eq!(parse_args(&args(&["--port", "1"])).unwrap_err(), "unknown flag: --port");
        assert_eq!(parse_args(&args(&["-h"])).unwrap_err(), "");
    }

    #[test]
    fn log_levels_are_case_insensitive() {
        assert_eq!(parse_level("DEBUG"), Some("debug"));
        assert_eq!(parse_level(" warning "), Some("warn"));
        assert_eq!(parse_level("loud"), None);
    }
}
