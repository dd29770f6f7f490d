//! Command-line client for the Pathfinder HTTP API
//!
//! # Subcommands
//! - `status`                                  - show server health
//! - `realms [--json]`                         - list realms
//! - `synthesize <realm_id>`                   - simple synthesis
//! - `advanced <realm_id> [--source <id>]...`  - start an advanced synthesis job
//! - `job <job_id>`                            - show a synthesis job
//! - `process-queue <realm_id>`                - run the batch queue for a realm
//! - `migrate reflections [--realm-id <id>]` / `migrate texts`

use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use reqwest::Method;
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "pathfinder-cli", version, about = "Pathfinder API client")]
struct Cli {
    /// Pathfinder HTTP server URL (overrides PATHFINDER_HTTP_URL env var)
    #[arg(long, env = "PATHFINDER_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show Pathfinder server status
    Status,

    /// List realms
    Realms,

    /// Run simple synthesis for a realm
    Synthesize { realm_id: String },

    /// Start an advanced synthesis job for a realm
    Advanced {
        realm_id: String,

        /// Restrict to these content sources (default: all sources of the realm)
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Record the job as `incremental` (the full four-stage pipeline still runs)
        #[arg(long)]
        incremental: bool,
    },

    /// Show a synthesis job
    Job { job_id: String },

    /// Process the realm's pending batch queue
    ProcessQueue { realm_id: String },

    /// Convert legacy rows into content sources
    Migrate {
        #[command(subcommand)]
        from: MigrateFrom,
    },
}

#[derive(Debug, Subcommand)]
enum MigrateFrom {
    /// Answered reflections
    Reflections {
        #[arg(long)]
        realm_id: Option<String>,
    },
    /// Uploaded texts
    Texts,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RealmRow {
    pub id: String,
    pub name: String,
    pub current_version: i32,
    pub quality_score: Option<f64>,
    pub last_synthesis_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JobRow {
    pub id: String,
    pub status: String,
    pub synthesis_type: String,
    pub error_message: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub result_prompt: Option<String>,
}

/// One line per realm: short id, name, version and quality.
pub fn format_realm_line(realm: &RealmRow) -> String {
    let short_id: String = realm.id.chars().take(8).collect();
    let quality = realm
        .quality_score
        .map(|q| format!("{:.0}%", q * 100.0))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  v{:<3} {:>5}  {}",
        short_id, realm.current_version, quality, realm.name
    )
}

pub fn format_job(job: &JobRow) -> String {
    let mut out = format!(
        "Job:     {}\nStatus:  {}\nType:    {}",
        job.id, job.status, job.synthesis_type
    );
    if let Some(ms) = job.processing_time_ms {
        out.push_str(&format!("\nTime:    {} ms", ms));
    }
    if let Some(err) = &job.error_message {
        out.push_str(&format!("\nError:   {}", err));
    }
    if let Some(prompt) = &job.result_prompt {
        let preview: String = prompt.chars().take(300).collect();
        out.push_str(&format!("\n\n{}", preview));
    }
    out
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout_secs: u64) -> anyhow::Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Send a request and return the JSON body, exiting on transport or HTTP errors.
fn call(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<serde_json::Value>,
) -> anyhow::Result<serde_json::Value> {
    let mut req = client.request(method, url);
    if let Some(body) = body {
        req = req.json(&body);
    }

    let resp = match req.send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("pathfinder-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body: serde_json::Value = resp.json().unwrap_or_default();
        let message = body["error"].as_str().unwrap_or("unknown error");
        eprintln!("pathfinder-cli: server returned {}: {}", status, message);
        std::process::exit(1);
    }

    Ok(resp.json()?)
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn do_status(server: &str, json: bool) -> anyhow::Result<()> {
    let client = client(10)?;
    let url = format!("{}/health", server);

    match client.get(&url).send() {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            if json {
                return print_json(&body);
            }
            println!("Pathfinder server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:           {}", body["version"].as_str().unwrap_or("?"));
            println!("PostgreSQL:        {}", body["postgresql"].as_str().unwrap_or("?"));
            println!("Model:             {}", body["llm"]["model"].as_str().unwrap_or("?"));
        }
        Ok(r) => {
            eprintln!("pathfinder-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("pathfinder-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn do_realms(server: &str, json: bool) -> anyhow::Result<()> {
    let body = call(&client(10)?, Method::GET, &format!("{}/realms", server), None)?;
    if json {
        return print_json(&body);
    }

    let realms: Vec<RealmRow> = serde_json::from_value(body)?;
    if realms.is_empty() {
        eprintln!("No realms yet");
        return Ok(());
    }
    for realm in &realms {
        println!("{}", format_realm_line(realm));
    }
    Ok(())
}

fn do_synthesize(server: &str, realm_id: &str, json: bool) -> anyhow::Result<()> {
    // Synthesis waits on the model, so allow well past the server's LLM timeout.
    let url = format!("{}/realms/{}/synthesize", server, realm_id);
    let body = call(&client(180)?, Method::POST, &url, None)?;
    if json {
        return print_json(&body);
    }
    println!("Version {}:\n", body["version_number"]);
    println!("{}", body["synthesized_prompt"].as_str().unwrap_or(""));
    Ok(())
}

/// Body for `POST /realms/{id}/synthesize/advanced`.
fn advanced_request(sources: Vec<String>, incremental: bool) -> serde_json::Value {
    serde_json::json!({
        "content_source_ids": sources,
        "synthesis_type": if incremental { "incremental" } else { "full" },
    })
}

fn do_advanced(
    server: &str,
    realm_id: &str,
    sources: Vec<String>,
    incremental: bool,
    json: bool,
) -> anyhow::Result<()> {
    let url = format!("{}/realms/{}/synthesize/advanced", server, realm_id);
    let request = advanced_request(sources, incremental);
    let body = call(&client(30)?, Method::POST, &url, Some(request))?;
    if json {
        return print_json(&body);
    }
    println!(
        "Started job {} (about {}s). Check with: pathfinder-cli job {}",
        body["job_id"].as_str().unwrap_or("?"),
        body["estimated_completion_seconds"],
        body["job_id"].as_str().unwrap_or("?"),
    );
    Ok(())
}

fn do_job(server: &str, job_id: &str, json: bool) -> anyhow::Result<()> {
    let url = format!("{}/synthesis-jobs/{}", server, job_id);
    let body = call(&client(10)?, Method::GET, &url, None)?;
    if json {
        return print_json(&body);
    }
    let job: JobRow = serde_json::from_value(body)?;
    println!("{}", format_job(&job));
    Ok(())
}

fn do_process_queue(server: &str, realm_id: &str, json: bool) -> anyhow::Result<()> {
    let url = format!("{}/realms/{}/process-batch-queue", server, realm_id);
    let body = call(&client(180)?, Method::POST, &url, None)?;
    if json {
        return print_json(&body);
    }
    println!(
        "{} ({} pending)",
        body["message"].as_str().unwrap_or(""),
        body["pending_count"]
    );
    Ok(())
}

fn do_migrate(server: &str, from: MigrateFrom, json: bool) -> anyhow::Result<()> {
    let url = match from {
        MigrateFrom::Reflections { realm_id: Some(id) } => {
            format!("{}/content-sources/migrate-from-reflections?realm_id={}", server, id)
        }
        MigrateFrom::Reflections { realm_id: None } => {
            format!("{}/content-sources/migrate-from-reflections", server)
        }
        MigrateFrom::Texts => format!("{}/content-sources/migrate-from-texts", server),
    };
    let body = call(&client(60)?, Method::POST, &url, None)?;
    if json {
        return print_json(&body);
    }
    println!(
        "Migrated {}, skipped {}",
        body["migrated_count"], body["skipped_count"]
    );
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();
    let json = cli.json;

    let result = match cli.command {
        Commands::Status => do_status(&server, json),
        Commands::Realms => do_realms(&server, json),
        Commands::Synthesize { realm_id } => do_synthesize(&server, &realm_id, json),
        Commands::Advanced {
            realm_id,
            sources,
            incremental,
        } => do_advanced(&server, &realm_id, sources, incremental, json),
        Commands::Job { job_id } => do_job(&server, &job_id, json),
        Commands::ProcessQueue { realm_id } => do_process_queue(&server, &realm_id, json),
        Commands::Migrate { from } => do_migrate(&server, from, json),
    };

    if let Err(e) = result {
        eprintln!("pathfinder-cli: {}", e);
        std::process::exit(1);
    }
}
