//! fede-cli — operator CLI for the Fede HTTP API
//!
//! # Subcommands
//! - `chat <message> [--session <id>] [--category <c>] [--json]` — one chat turn
//! - `ingest --title <t> --content <c> [...]` or `ingest --file <item.json>`
//! - `reembed [--limit <n>]`   — embed knowledge items still missing a vector
//! - `footers [--json]`        — list footer templates with usage
//! - `pick-footer [--phrase <p>]` — select and render one footer
//! - `status`                  — show server health

use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8767";
const USER_ID_HEADER: &str = "x-user-id";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "fede-cli", version, about = "Fede knowledge and chat CLI")]
struct Cli {
    /// Fede HTTP server URL (overrides FEDE_HTTP_URL env var)
    #[arg(long, env = "FEDE_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Caller id sent as x-user-id on user-scoped routes
    #[arg(long, env = "FEDE_USER_ID")]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send one chat message
    Chat {
        message: String,

        /// Continue an existing session
        #[arg(long)]
        session: Option<String>,

        /// Category hint for ranking
        #[arg(long)]
        category: Option<String>,

        /// Print the raw JSON reply
        #[arg(long)]
        json: bool,
    },

    /// Ingest a knowledge item
    Ingest {
        /// JSON file with the full item; other flags are ignored when set
        #[arg(long)]
        file: Option<String>,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        content: Option<String>,

        /// article, book, video, methodology, tip or course
        #[arg(long = "type", default_value = "article")]
        content_type: String,

        #[arg(long, default_value = "general")]
        category: String,

        /// Comma-separated tags
        #[arg(long, default_value = "")]
        tags: String,

        /// 1 (low) to 10 (high)
        #[arg(long)]
        priority: Option<i32>,
    },

    /// Embed knowledge items whose embedding is still missing
    Reembed {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// List footer templates
    Footers {
        #[arg(long)]
        json: bool,
    },

    /// Select and render one footer
    PickFooter {
        /// Key phrase substituted for {frase}
        #[arg(long)]
        phrase: Option<String>,
    },

    /// Show Fede server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub title: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub category: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub success: bool,
    pub message: String,
    pub session_id: String,
    #[serde(default)]
    pub is_out_of_scope: Option<bool>,
    #[serde(default)]
    pub escalation: Option<bool>,
    #[serde(default)]
    pub degraded: Option<bool>,
    #[serde(default)]
    pub sources: Option<Vec<SourceRef>>,
    pub processing_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FooterRow {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub footer_type: String,
    pub probability: i32,
    pub is_active: bool,
    pub usage_count: i64,
}

// ============================================================================
// Formatting (pure, tested)
// ============================================================================

pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn ingest_body(
    title: &str,
    content: &str,
    content_type: &str,
    category: &str,
    tags: &str,
    priority: Option<i32>,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "title": title,
        "content": content,
        "contentType": content_type,
        "category": category,
        "tags": parse_tags(tags),
    });
    if let (Some(p), Some(obj)) = (priority, body.as_object_mut()) {
        obj.insert("priority".to_string(), serde_json::json!(p));
    }
    body
}

/// Human-readable chat reply: message, flags, then sources.
pub fn format_reply(reply: &ChatReply) -> String {
    let mut out = reply.message.clone();
    let mut flags = Vec::new();
    if reply.is_out_of_scope == Some(true) {
        flags.push("out of scope");
    }
    if reply.escalation == Some(true) {
        flags.push("ESCALATION");
    }
    if reply.degraded == Some(true) {
        flags.push("degraded");
    }
    if !reply.success {
        flags.push("failed");
    }
    out.push_str(&format!(
        "\n\n[session {} | {} ms{}{}]",
        reply.session_id,
        reply.processing_time,
        if flags.is_empty() { "" } else { " | " },
        flags.join(", ")
    ));
    if let Some(sources) = reply.sources.as_ref().filter(|s| !s.is_empty()) {
        out.push_str("\nSources:");
        for s in sources {
            out.push_str(&format!("\n  - {} ({}, {})", s.title, s.content_type, s.category));
        }
    }
    out
}

pub fn format_footers(rows: &[FooterRow]) -> String {
    let mut out = format!("{:<38} {:<20} {:<18} {:>5} {:>7} {}\n", "ID", "NAME", "TYPE", "PROB", "USES", "ACTIVE");
    for r in rows {
        let name: String = r.name.chars().take(20).collect();
        out.push_str(&format!(
            "{:<38} {:<20} {:<18} {:>5} {:>7} {}\n",
            r.id,
            name,
            r.footer_type,
            r.probability,
            r.usage_count,
            if r.is_active { "yes" } else { "no" }
        ));
    }
    out
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Send a request, exiting with the server's error body on a non-2xx status.
fn send(req: reqwest::blocking::RequestBuilder, url: &str) -> anyhow::Result<reqwest::blocking::Response> {
    let resp = match req.send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("fede-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("fede-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }
    Ok(resp)
}

fn require_user(user: Option<&str>) -> anyhow::Result<&str> {
    user.ok_or_else(|| anyhow::anyhow!("--user (or FEDE_USER_ID) is required for chat"))
}

fn do_chat(
    server: &str,
    user: Option<&str>,
    message: &str,
    session: Option<&str>,
    category: Option<&str>,
    json_output: bool,
) -> anyhow::Result<()> {
    let user = require_user(user)?;
    let url = format!("{}/chat", server);
    let body = serde_json::json!({
        "message": message,
        "sessionId": session,
        "category": category,
    });
    let resp = send(client(60)?.post(&url).header(USER_ID_HEADER, user).json(&body), &url)?;

    if json_output {
        let value: serde_json::Value = resp.json()?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        let reply: ChatReply = resp.json()?;
        println!("{}", format_reply(&reply));
    }
    Ok(())
}

fn do_ingest(server: &str, body: serde_json::Value) -> anyhow::Result<()> {
    let url = format!("{}/knowledge", server);
    let resp = send(client(60)?.post(&url).json(&body), &url)?;
    let value: serde_json::Value = resp.json()?;
    println!(
        "Ingested {} (embedded: {})",
        value["item"]["id"].as_str().unwrap_or("?"),
        value["embedded"].as_bool().unwrap_or(false)
    );
    if let Some(err) = value["embeddingError"].as_str() {
        eprintln!("Embedding failed, run `fede-cli reembed` later: {}", err);
    }
    Ok(())
}

fn do_reembed(server: &str, limit: usize) -> anyhow::Result<()> {
    let url = format!("{}/knowledge/reembed", server);
    let resp = send(client(300)?.post(&url).json(&serde_json::json!({ "limit": limit })), &url)?;
    let value: serde_json::Value = resp.json()?;
    println!(
        "Processed {}, embedded {}, failed {}",
        value["processed"], value["embedded"], value["failed"]
    );
    Ok(())
}

fn do_footers(server: &str, json_output: bool) -> anyhow::Result<()> {
    let url = format!("{}/footers", server);
    let resp = send(client(10)?.get(&url), &url)?;
    if json_output {
        let value: serde_json::Value = resp.json()?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        let rows: Vec<FooterRow> = resp.json()?;
        print!("{}", format_footers(&rows));
    }
    Ok(())
}

fn do_pick_footer(server: &str, phrase: Option<&str>) -> anyhow::Result<()> {
    let url = format!("{}/footers/select", server);
    let resp = send(client(10)?.post(&url).json(&serde_json::json!({ "keyPhrase": phrase })), &url)?;
    let value: serde_json::Value = resp.json()?;
    println!("{}", value["text"].as_str().unwrap_or(""));
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client(10)?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Fede server:  {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:      {}", body["version"].as_str().unwrap_or("?"));
            println!("Store:        {}", body["store"].as_str().unwrap_or("?"));
            println!("Knowledge:    {} active", body["activeKnowledge"]);
            println!("Sessions:     {} live", body["liveSessions"]);
            if let Some(pg) = body["postgresql"].as_str() {
                println!("PostgreSQL:   {}", pg);
                println!("pgvector:     {}", body["pgvector"].as_str().unwrap_or("?"));
            }
        }
        Ok(r) => {
            eprintln!("fede-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("fede-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn run(cli: Cli) -> anyhow::Result<()> {
    let server = cli.server.trim_end_matches('/').to_string();
    let user = cli.user.as_deref();

    match cli.command {
        Commands::Chat {
            message,
            session,
            category,
            json,
        } => do_chat(&server, user, &message, session.as_deref(), category.as_deref(), json),
        Commands::Ingest {
            file,
            title,
            content,
            content_type,
            category,
            tags,
            priority,
        } => {
            let body = match file {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(&path)?)?,
                None => {
                    let title = title.ok_or_else(|| anyhow::anyhow!("--title is required"))?;
                    let content = content.ok_or_else(|| anyhow::anyhow!("--content is required"))?;
                    ingest_body(&title, &content, &content_type, &category, &tags, priority)
                }
            };
            do_ingest(&server, body)
        }
        Commands::Reembed { limit } => do_reembed(&server, limit),
        Commands::Footers { json } => do_footers(&server, json),
        Commands::PickFooter { phrase } => do_pick_footer(&server, phrase.as_deref()),
        Commands::Status => do_status(&server),
    }
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("fede-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
