use std::io::Read;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "cinder", about = "Cinder: burn-after-reading secrets", version)]
struct Cli {
    /// Cinder server URL (default: http://localhost:8080 or $CINDER_SERVER)
    #[arg(long, env = "CINDER_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Cinder HTTP server
    Serve {
        /// Port to listen on (default: $CINDER_PORT or 8080)
        #[arg(long, env = "CINDER_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $CINDER_HOST or 0.0.0.0)
        #[arg(long, env = "CINDER_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Store a secret and print its one-time link
    Create {
        /// Secret content, or `-` to read it from stdin
        content: String,
        /// Expire after this long, e.g. 30m, 1h, 7d (rounded up to whole minutes)
        #[arg(long)]
        ttl: Option<String>,
    },
    /// Reveal a secret. This burns it: the link stops working afterwards.
    Open {
        /// Secret id or a full one-time link
        target: String,
    },
    /// Delete all expired secrets immediately
    Cleanup,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("CINDER_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,
        Commands::Create { content, ttl } => cmd_create(&cli.server, &content, ttl.as_deref()).await,
        Commands::Open { target } => cmd_open(&cli.server, &target).await,
        Commands::Cleanup => cmd_cleanup(&cli.server).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = cinder_server::ServerConfig {
        host,
        port,
        master_key: cinder_server::server::resolve_master_key()?,
        ..cinder_server::ServerConfig::from_env()?
    };

    cinder_server::run(cfg).await
}

async fn cmd_create(server: &str, content: &str, ttl: Option<&str>) -> Result<()> {
    let ttl_minutes = ttl.map(parse_ttl_minutes).transpose()?;

    let content = if content == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read secret from stdin")?;
        buf
    } else {
        content.to_owned()
    };

    let client = Client::new();
    let body = serde_json::json!({
        "content": content,
        "ttl_minutes": ttl_minutes,
    });

    let base = server.trim_end_matches('/');
    let resp = client
        .post(format!("{base}/secrets"))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json = read_json(resp).await?;
    if !status.is_success() {
        anyhow::bail!("server returned {status}: {}", error_message(&json));
    }

    let url = json["url"].as_str().context("response is missing url")?;
    if url.starts_with('/') {
        println!("{base}{url}");
    } else {
        println!("{url}");
    }
    if let Some(exp) = json["expires_at"].as_i64() {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        eprintln!("expires in {}", format_duration((exp - now).max(0) as u64));
    }
    Ok(())
}

async fn cmd_open(server: &str, target: &str) -> Result<()> {
    let id = secret_id(target);
    let client = Client::new();
    let resp = client
        .get(format!("{}/secrets/{}", server.trim_end_matches('/'), id))
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json = read_json(resp).await?;

    if status.is_success() {
        let content = json["content"].as_str().unwrap_or("");
        println!("{content}");
    } else {
        anyhow::bail!("{}", error_message(&json));
    }
    Ok(())
}

async fn cmd_cleanup(server: &str) -> Result<()> {
    let client = Client::new();
    let resp = client
        .post(format!("{}/cleanup", server.trim_end_matches('/')))
        .send()
        .await
        .context("HTTP request failed")?;

    if resp.status().is_success() {
        let json: Value = resp.json().await?;
        let n = json["deleted"].as_u64().unwrap_or(0);
        println!("deleted {n} expired secret(s)");
    } else {
        let status = resp.status();
        anyhow::bail!("server returned {status}");
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Read a response body as JSON. A body that is not JSON (a proxy error page,
/// say) is kept as a string so its text still reaches the user.
async fn read_json(resp: reqwest::Response) -> Result<Value> {
    let text = resp.text().await.context("read response body")?;
    Ok(parse_body(&text))
}

fn parse_body(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.trim().to_owned()))
}

fn error_message(body: &Value) -> String {
    match body {
        Value::String(text) if !text.is_empty() => text.clone(),
        _ => match (body["error"].as_str(), body["field"].as_str()) {
            (Some(error), Some(field)) if !error.contains(field) => format!("{error} ({field})"),
            (Some(error), _) => error.to_owned(),
            (None, _) => "unknown error".to_owned(),
        },
    }
}

/// Parse human duration strings like "1h", "30m", "7d" into whole minutes, rounding up.
fn parse_ttl_minutes(s: &str) -> Result<i64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    let minutes = d.as_secs().div_ceil(60);
    if minutes == 0 {
        anyhow::bail!("ttl must be at least one minute");
    }
    i64::try_from(minutes).context("ttl too large")
}

/// Accept either a bare id or a link ending in `/secrets/<id>`.
fn secret_id(target: &str) -> &str {
    let trimmed = target.trim().trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn format_duration(secs: u64) -> String {
    if secs >= 86400 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
