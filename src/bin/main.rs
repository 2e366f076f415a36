use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use crosspulse::{
    BridgeError, CallContext, CallRequest, Endpoint, EndpointConfig, HandlerError, PeerCommand,
};
use serde_json::{Number, Value, json};

/// Bidirectional line-delimited JSON RPC over stdio
#[derive(Parser)]
#[command(name = "crosspulse")]
#[command(version)]
#[command(about = "Bidirectional line-delimited JSON RPC over stdio")]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/crosspulse/crosspulse.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the built-in methods on stdin/stdout until stdin closes
    Listen,
    /// Spawn a peer, make one call, and print the JSON result
    Call {
        /// Peer program to spawn
        #[arg(long)]
        peer: String,

        /// Argument passed to the peer program (repeatable)
        #[arg(long = "peer-arg", allow_hyphen_values = true)]
        peer_args: Vec<String>,

        /// Method to call on the peer
        method: String,

        /// Positional arguments; each is parsed as JSON, or taken as a string
        #[arg(allow_negative_numbers = true)]
        args: Vec<String>,

        /// Named argument as KEY=JSON (repeatable)
        #[arg(long = "kwarg", value_parser = parse_kwarg)]
        kwargs: Vec<(String, Value)>,

        /// Override the configured call timeout
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the protocol; env_logger writes to stderr
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Listen => listen(config).await,
        Commands::Call {
            peer,
            peer_args,
            method,
            args,
            kwargs,
            timeout_ms,
        } => {
            let command = PeerCommand::new(peer).args(peer_args);
            let mut request = CallRequest::new(method).args(args.iter().map(|raw| parse_json_arg(raw)));
            for (key, value) in kwargs {
                request = request.kwarg(key, value);
            }
            if let Some(ms) = timeout_ms {
                request = request.timeout(Duration::from_millis(ms));
            }
            call(config, &command, request).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EndpointConfig, BridgeError> {
    match path {
        Some(path) => EndpointConfig::load(path),
        None => EndpointConfig::discover(),
    }
}

async fn listen(config: EndpointConfig) -> Result<(), BridgeError> {
    let endpoint = Endpoint::new(config);
    register_builtins(&endpoint);
    endpoint.listen()?;
    // Every call read before stdin closed gets its reply
    endpoint.finished().await;
    endpoint.disconnect().await
}

async fn call(
    config: EndpointConfig,
    command: &PeerCommand,
    request: CallRequest,
) -> Result<(), BridgeError> {
    let endpoint = Endpoint::new(config);
    register_builtins(&endpoint);
    endpoint.connect(command)?;

    let result = endpoint.invoke(request).await;
    if let Err(e) = endpoint.disconnect().await {
        log::warn!(target: "crosspulse::cli", "Error while disconnecting: {}", e);
    }

    let value = result?;
    println!("{}", value);
    Ok(())
}

/// A JSON literal if it parses as one, otherwise the raw text as a string.
fn parse_json_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_kwarg(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=JSON, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    Ok((key.to_string(), parse_json_arg(value)))
}

/// Demo methods served by both subcommands.
///
/// - `echo(x)` returns `x`; with zero or several arguments, the argument list
/// - `add(a, b, ...)` sums numbers (integers stay integers unless they overflow)
/// - `square(x)`
/// - `methods()` lists registered method names
/// - `sleep(ms)` waits, then returns `ms`
/// - `relay(method, args...)` calls `method` back on the peer
fn register_builtins(endpoint: &Endpoint) {
    let registry = endpoint.registry().clone();

    endpoint
        .register("echo", |ctx: CallContext| {
            let (mut args, _kwargs) = ctx.into_parts();
            Ok(if args.len() == 1 {
                args.remove(0)
            } else {
                Value::Array(args)
            })
        })
        .register("add", |ctx: CallContext| add(&numbers(&ctx)?))
        .register("square", |ctx: CallContext| {
            if ctx.args().len() != 1 {
                return Err(HandlerError::new("square expects exactly one argument"));
            }
            square(&numbers(&ctx)?[0])
        })
        .register("methods", move |_ctx: CallContext| Ok(registry.names()))
        .register_async("sleep", |ctx: CallContext| async move {
            let ms: u64 = ctx.arg(0)?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, HandlerError>(ms)
        })
        .register_async("relay", |ctx: CallContext| async move {
            let method: String = ctx.arg(0)?;
            let args = ctx.args()[1..].to_vec();
            ctx.caller()
                .call(&method, args)
                .await
                .map_err(|e| HandlerError::new(format!("relay to '{}' failed: {}", method, e)))
        });
}

fn numbers(ctx: &CallContext) -> Result<Vec<Number>, HandlerError> {
    ctx.args()
        .iter()
        .enumerate()
        .map(|(index, value)| match value {
            Value::Number(n) => Ok(n.clone()),
            other => Err(HandlerError::new(format!(
                "argument {} is not a number: {}",
                index, other
            ))),
        })
        .collect()
}

fn add(numbers: &[Number]) -> Result<Value, HandlerError> {
    let integer_sum = numbers
        .iter()
        .map(Number::as_i64)
        .try_fold(0_i64, |acc, n| acc.checked_add(n?));
    if let Some(sum) = integer_sum {
        return Ok(json!(sum));
    }

    let sum: f64 = numbers.iter().filter_map(Number::as_f64).sum();
    Ok(json!(sum))
}

fn square(n: &Number) -> Result<Value, HandlerError> {
    if let Some(product) = n.as_i64().and_then(|x| x.checked_mul(x)) {
        return Ok(json!(product));
    }
    let x = n
        .as_f64()
        .ok_or_else(|| HandlerError::new(format!("cannot square {}", n)))?;
    Ok(json!(x * x))
}
