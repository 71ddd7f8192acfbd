use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, warn};
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wfcall::config::{Config, Settings, USER_AGENT};
use wfcall::http::{HttpClient, PoolConfig, RetryPolicy};
use wfcall::runtime::{RealRuntime, Runtime};
use wfcall::workflow::{
    DEFAULT_IDENTITY, DeliveryMode, Fields, InvocationResult, WorkflowRequest,
};

/// wfcall - resilient workflow runner
///
/// Submit a long-running workflow over HTTP, retrying timeouts, gateway
/// timeouts and transient network errors with exponential backoff.
///
/// The API key is read from the WFCALL_API_KEY environment variable unless
/// --api-key is given.
///
/// Examples:
///   wfcall invoke --url https://dify.example.com/v1/workflows/run -i repo=owner/repo
#[derive(Parser, Debug)]
#[command(author, version = env!("WFCALL_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a workflow once and print its result
    Invoke(InvokeArgs),
}

#[derive(clap::Args, Debug)]
pub struct InvokeArgs {
    /// Workflow run endpoint
    #[arg(long, env = "WFCALL_URL", value_name = "URL")]
    pub url: String,

    /// API key (defaults to WFCALL_API_KEY)
    #[arg(long = "api-key", value_name = "KEY")]
    pub api_key: Option<String>,

    /// Workflow input; VALUE is parsed as JSON when possible, otherwise taken as a string
    #[arg(short = 'i', long = "input", value_name = "KEY=VALUE")]
    pub inputs: Vec<String>,

    /// JSON file with an object of inputs; --input entries override it
    #[arg(long = "inputs-file", value_name = "PATH")]
    pub inputs_file: Option<PathBuf>,

    /// Response delivery mode: streaming or blocking
    #[arg(short = 'm', long, default_value = "streaming", value_name = "MODE")]
    pub mode: DeliveryMode,

    /// Identity sent as the workflow user
    #[arg(long, env = "WFCALL_USER", default_value = DEFAULT_IDENTITY)]
    pub user: String,

    /// Exit with an error instead of printing an empty result when the run fails
    #[arg(long)]
    pub strict: bool,

    /// Retries after the first attempt
    #[arg(long = "max-retries", default_value_t = 5)]
    pub max_retries: u32,

    /// First backoff delay in seconds
    #[arg(long = "base-delay", value_name = "SECONDS", default_value = "10", value_parser = parse_seconds)]
    pub base_delay: Duration,

    /// Upper bound for one backoff delay in seconds
    #[arg(long = "max-delay", value_name = "SECONDS", default_value = "600", value_parser = parse_seconds)]
    pub max_delay: Duration,

    /// Per-attempt timeout in seconds
    #[arg(long, value_name = "SECONDS", default_value = "900", value_parser = parse_seconds)]
    pub timeout: Duration,

    /// Idle connections kept open per host
    #[arg(long = "pool-idle", default_value_t = 10)]
    pub pool_idle: usize,

    /// Requests allowed in flight through the connection pool
    #[arg(long = "pool-max", default_value_t = 20)]
    pub pool_max: usize,
}

impl InvokeArgs {
    fn settings(&self) -> Settings {
        Settings {
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            identity: self.user.clone(),
            policy: RetryPolicy::new(self.max_retries, self.base_delay, self.max_delay),
            timeout: self.timeout,
            pool: PoolConfig {
                max_idle_per_host: self.pool_idle,
                max_connections: self.pool_max,
            },
        }
    }
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", s))?;
    Duration::try_from_secs_f64(secs).map_err(|_| format!("'{}' is not a valid duration", s))
}

/// Parses `KEY=VALUE`, reading VALUE as JSON when it is valid JSON.
fn parse_input(pair: &str) -> Result<(String, Value)> {
    let Some((key, raw)) = pair.split_once('=') else {
        bail!("Invalid input '{}'. Expected KEY=VALUE.", pair);
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("Invalid input '{}'. The key is empty.", pair);
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn build_inputs<R: Runtime>(
    runtime: &R,
    inputs_file: Option<&Path>,
    pairs: &[String],
) -> Result<Fields> {
    let mut inputs = match inputs_file {
        Some(path) => {
            let content = runtime.read_to_string(path)?;
            match serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse inputs file {:?}", path))?
            {
                Value::Object(map) => map,
                _ => bail!("Inputs file {:?} must contain a JSON object", path),
            }
        }
        None => Fields::new(),
    };

    for pair in pairs {
        let (key, value) = parse_input(pair)?;
        inputs.insert(key, value);
    }
    Ok(inputs)
}

fn render(result: &InvocationResult) -> Result<String> {
    match result {
        InvocationResult::Text(text) => Ok(text.clone()),
        InvocationResult::Outputs(outputs) => {
            serde_json::to_string_pretty(outputs).context("Failed to render workflow outputs")
        }
    }
}

async fn invoke<R: Runtime + 'static>(runtime: R, args: InvokeArgs) -> Result<()> {
    let inputs = build_inputs(&runtime, args.inputs_file.as_deref(), &args.inputs)?;
    let request = WorkflowRequest::new(inputs, args.mode, args.user.clone());
    let settings = args.settings();
    let strict = args.strict;

    // The client is closed on every exit path, failed strict runs included.
    HttpClient::scoped(settings.pool, USER_AGENT, HeaderMap::new(), |http| async move {
        let config = Config::with_http(runtime, settings, http)?;

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling workflow invocation...");
                on_interrupt.cancel();
            }
        });

        let result = if strict {
            config.client.invoke(&request, &cancel).await?
        } else {
            config.client.invoke_or_empty(&request, &cancel).await
        };
        debug!("Workflow result is empty: {}", result.is_empty());

        println!("{}", render(&result)?);
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let runtime = RealRuntime;

    match cli.command {
        Commands::Invoke(args) => invoke(runtime, args).await?,
    }
    Ok(())
}
