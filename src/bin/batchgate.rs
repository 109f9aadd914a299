use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use batchgate::{router, Engine, EngineConfig, OpenAiUpstream, ProxyState, ProxyStats};

const USAGE: &str = "usage: batchgate [-port <int>] [-max-hold-batch <duration>] [-max-batch-size <int>] [-max-batch-mb <int>]";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
struct CliArgs {
    port: u16,
    max_hold: Duration,
    max_batch_size: usize,
    max_batch_mb: usize,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            port: 3030,
            max_hold: Duration::from_secs(4),
            max_batch_size: 1000,
            max_batch_mb: 25,
        }
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs, String> {
    let mut parsed = CliArgs::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-port" | "--port" => {
                parsed.port = parse_value(&next_value(&mut args, &arg)?, &arg)?;
            }
            "-max-hold-batch" | "--max-hold-batch" => {
                parsed.max_hold = parse_duration(&next_value(&mut args, &arg)?)?;
            }
            "-max-batch-size" | "--max-batch-size" => {
                parsed.max_batch_size = parse_value(&next_value(&mut args, &arg)?, &arg)?;
            }
            "-max-batch-mb" | "--max-batch-mb" => {
                parsed.max_batch_mb = parse_value(&next_value(&mut args, &arg)?, &arg)?;
            }
            "-h" | "-help" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("unknown flag: {other}\n{USAGE}")),
        }
    }
    Ok(parsed)
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{USAGE}"))
}

fn parse_value<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value {value:?} for {flag}"))
}

/// Parses durations written the way the flags expect them: one or more
/// `<number><unit>` segments, e.g. `200ms`, `4s`, `1m30s`, `1.5h`.
fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    let mut chars = trimmed.chars().peekable();
    let mut total_seconds = 0f64;
    let mut segments = 0;

    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() || *c == '.' {
                number.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }

        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration: {input:?}"))?;
        let factor = match unit.as_str() {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("invalid duration unit {unit:?} in {input:?}")),
        };
        total_seconds += value * factor;
        segments += 1;
    }

    if segments == 0 {
        return Err(format!("invalid duration: {input:?}"));
    }
    Ok(Duration::from_secs_f64(total_seconds))
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };
    run(args).await
}

async fn run(args: CliArgs) -> ExitCode {
    info!(
        max_hold_batch = ?args.max_hold,
        max_batch_size = args.max_batch_size,
        max_batch_mb = args.max_batch_mb,
        "starting server"
    );

    let config = EngineConfig {
        max_batch_size: args.max_batch_size,
        max_batch_bytes: args.max_batch_mb * 1024 * 1024,
        max_hold: args.max_hold,
        ..EngineConfig::default()
    };
    let stats = Arc::new(ProxyStats::default());
    let upstream = Arc::new(OpenAiUpstream::new());
    let engine = Arc::new(Engine::new(upstream, config, stats));
    let app = router(ProxyState::new(engine.clone()));

    let listener = match TcpListener::bind(("0.0.0.0", args.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind port {}: {err}", args.port);
            return ExitCode::FAILURE;
        }
    };
    info!("server is running on :{}", args.port);

    let token = engine.shutdown_token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
    });

    shutdown_signal().await;
    info!("shutting down server");
    engine.shutdown().await;

    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => {
            info!("server exiting");
            ExitCode::SUCCESS
        }
        Ok(Ok(Err(err))) => {
            error!("server error: {err}");
            ExitCode::FAILURE
        }
        Ok(Err(err)) => {
            error!("server task failed: {err}");
            ExitCode::FAILURE
        }
        Err(_) => {
            error!("server forced to shut down after the grace period");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
