use anyhow::Context;
use clap::Parser;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::SystemConfig;
use ratekeeper::policy::{PolicyMetadata, RateLimitPolicy, RequestAction, RequestContext, ResponseContext};
use ratekeeper::ratelimit::LimiterFactory;

/// Replay synthetic traffic through a rate limit policy.
#[derive(Parser, Debug)]
#[command(name = "ratekeeper", version)]
#[command(about = "Ratekeeper - API gateway rate limit policy", long_about = None)]
struct Args {
    /// System configuration (YAML); defaults and RATEKEEPER__* variables apply
    #[arg(short, long)]
    system: Option<PathBuf>,

    /// Route parameters (YAML)
    #[arg(short, long)]
    route: PathBuf,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value = "10")]
    requests: u32,

    /// Pause between requests, e.g. "100ms"
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "0s")]
    interval: Duration,

    /// Request header as NAME=VALUE (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(HeaderName, HeaderValue)>,

    /// Upstream response header as NAME=VALUE (repeatable)
    #[arg(long = "response-header", value_parser = parse_header)]
    response_headers: Vec<(HeaderName, HeaderValue)>,

    /// Upstream response body (JSON)
    #[arg(long)]
    response_body: Option<String>,

    #[arg(long, default_value = "default")]
    route_name: String,

    #[arg(long, default_value = "default")]
    api_name: String,

    #[arg(long, default_value = "v1")]
    api_version: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn parse_header(raw: &str) -> Result<(HeaderName, HeaderValue), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", raw))?;
    let name = HeaderName::try_from(name.trim()).map_err(|e| e.to_string())?;
    let value = HeaderValue::try_from(value.trim()).map_err(|e| e.to_string())?;
    Ok((name, value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }

    info!("Starting Ratekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let system = SystemConfig::load(args.system.as_deref()).context("loading system configuration")?;
    info!(backend = ?system.backend, algorithm = ?system.algorithm, "Configuration loaded");

    let route = std::fs::read_to_string(&args.route)
        .with_context(|| format!("reading route parameters from {}", args.route.display()))?;
    let params: serde_json::Value = serde_yaml::from_str(&route).context("parsing route parameters")?;

    let metadata = PolicyMetadata {
        route_name: args.route_name.clone(),
        api_name: args.api_name.clone(),
        api_version: args.api_version.clone(),
    };
    let factory = LimiterFactory::default();
    let policy = RateLimitPolicy::activate(&params, &system, metadata, &factory).await?;

    tokio::select! {
        _ = replay(&policy, &args) => {}
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl+C, stopping replay"),
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
            }
        }
    }

    policy.close().await?;
    factory.cache().close_all().await?;
    info!("Ratekeeper stopped");
    Ok(())
}

async fn replay(policy: &RateLimitPolicy, args: &Args) {
    let mut forwarded = 0u32;

    for i in 1..=args.requests {
        let mut ctx = RequestContext::new(Method::GET, "/");
        for (name, value) in &args.headers {
            ctx.headers.append(name.clone(), value.clone());
        }

        match policy.on_request(&mut ctx).await {
            RequestAction::Forward => {
                forwarded += 1;
                let mut response = ResponseContext::new(StatusCode::OK);
                for (name, value) in &args.response_headers {
                    response.headers.append(name.clone(), value.clone());
                }
                response.body = args.response_body.as_ref().map(|body| body.clone().into_bytes());

                let action = policy.on_response(&mut ctx, &response).await;
                println!("#{} {}", i, StatusCode::OK);
                for (name, value) in &action.headers_to_add {
                    println!("    {}: {}", name, value.to_str().unwrap_or("<binary>"));
                }
            }
            RequestAction::Respond(rejection) => {
                println!("#{} {}", i, rejection.status);
                for (name, value) in &rejection.headers {
                    println!("    {}: {}", name, value.to_str().unwrap_or("<binary>"));
                }
                println!("    {}", String::from_utf8_lossy(&rejection.body));
            }
        }

        if !args.interval.is_zero() {
            tokio::time::sleep(args.interval).await;
        }
    }

    info!(sent = args.requests, forwarded = forwarded, "Replay finished");
}
