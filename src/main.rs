use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use http::StatusCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{Limiter, MemoryStore, Request, Response};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Request admission engine")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load settings and compile the rules they reference
    Check {
        #[arg(long)]
        config: String,
    },
    /// Evaluate a request against the rules using an in-memory store
    Simulate {
        #[arg(long)]
        config: String,
        #[arg(long)]
        path: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        ip: Option<IpAddr>,
        /// Request parameter as name=value
        #[arg(long = "param", value_parser = parse_pair)]
        params: Vec<(String, String)>,
        /// Request header as name=value
        #[arg(long = "header", value_parser = parse_pair)]
        headers: Vec<(String, String)>,
        /// How many times to send the request
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// Print decisions as JSON lines
        #[arg(long)]
        json: bool,
    },
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got `{}`", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    match cli.command {
        Command::Check { config } => {
            let config = TurnstileConfig::from_file(&config)
                .with_context(|| format!("failed to load {}", config))?;
            let rules = config.load_rules()?.compile()?;
            info!(rules = rules.len(), store = ?config.store.kind, "Configuration is valid");
            println!("ok: {} rule(s)", rules.len());
        }
        Command::Simulate {
            config,
            path,
            host,
            ip,
            params,
            headers,
            repeat,
            json,
        } => {
            if repeat == 0 {
                bail!("--repeat must be at least 1");
            }
            let config = TurnstileConfig::from_file(&config)
                .with_context(|| format!("failed to load {}", config))?;
            let limiter = Limiter::from_config(&config, Arc::new(MemoryStore::new()))?;

            let mut request = Request::get(path);
            if let Some(host) = host {
                request = request.with_host(host);
            }
            if let Some(ip) = ip {
                request = request.with_remote_addr(ip);
            }
            for (name, value) in params {
                request = request.with_param(name, value);
            }
            for (name, value) in &headers {
                request = request.with_header(name, value);
            }

            for attempt in 1..=repeat {
                let decision = limiter.decide(&request).await;
                if json {
                    let line = serde_json::json!({
                        "attempt": attempt,
                        "rule": decision.context.rule.map(|rule| rule.index),
                        "identity": decision.context.identity,
                        "decision": decision.outcome,
                    });
                    println!("{}", line);
                } else {
                    println!("#{} {:?}", attempt, decision.outcome);
                }
            }

            let response = limiter
                .call(request, |_| async { Response::new(StatusCode::OK, "") })
                .await;
            info!(
                attempt = repeat + 1,
                status = %response.status,
                "Counted one more request through the full call path"
            );
        }
    }

    Ok(())
}
