//! pbxctl - admin CLI for the PBX's HTTP control surface.
//!
//! Talks to the bearer-token-authenticated admin API (§6) over `reqwest`;
//! the core only guarantees the operations below exist, so this client
//! stays intentionally narrow rather than mirroring a full REST schema.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pbxctl")]
#[command(about = "Redfire PBX admin control tool")]
#[command(version = redfire_pbx::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Admin API host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Admin API port
    #[arg(long, default_value = "8081")]
    port: u16,

    /// Bearer token for the admin API
    #[arg(long, env = "REDFIRE_PBX_ADMIN_TOKEN")]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show overall PBX status
    Status,
    /// List registered extensions
    Extensions,
    /// List active calls
    Calls,
    /// End a call by call-id
    EndCall { call_id: String },
    /// Transfer a call to a new destination
    Transfer { call_id: String, destination: String },
    /// Put a call on hold
    Hold { call_id: String },
    /// Resume a held call
    Resume { call_id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let base_url = format!("http://{}:{}", cli.host, cli.port);
    let client = reqwest::Client::new();

    let result = match cli.command {
        Commands::Status => get(&client, &base_url, "/api/v1/status", cli.token.as_deref()).await,
        Commands::Extensions => get(&client, &base_url, "/api/v1/extensions", cli.token.as_deref()).await,
        Commands::Calls => get(&client, &base_url, "/api/v1/calls", cli.token.as_deref()).await,
        Commands::EndCall { call_id } => {
            delete(&client, &base_url, &format!("/api/v1/calls/{call_id}"), cli.token.as_deref()).await
        }
        Commands::Transfer { call_id, destination } => {
            post(
                &client,
                &base_url,
                &format!("/api/v1/calls/{call_id}/transfer"),
                cli.token.as_deref(),
                serde_json::json!({ "destination": destination }),
            )
            .await
        }
        Commands::Hold { call_id } => {
            post(&client, &base_url, &format!("/api/v1/calls/{call_id}/hold"), cli.token.as_deref(), serde_json::json!({})).await
        }
        Commands::Resume { call_id } => {
            post(&client, &base_url, &format!("/api/v1/calls/{call_id}/resume"), cli.token.as_deref(), serde_json::json!({})).await
        }
    };

    match result {
        Ok(body) => println!("{body}"),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

fn authed(builder: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(t) => builder.bearer_auth(t),
        None => builder,
    }
}

async fn get(client: &reqwest::Client, base_url: &str, path: &str, token: Option<&str>) -> Result<String, reqwest::Error> {
    let request = authed(client.get(format!("{base_url}{path}")), token);
    request.send().await?.text().await
}

async fn delete(client: &reqwest::Client, base_url: &str, path: &str, token: Option<&str>) -> Result<String, reqwest::Error> {
    let request = authed(client.delete(format!("{base_url}{path}")), token);
    request.send().await?.text().await
}

async fn post(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    token: Option<&str>,
    body: serde_json::Value,
) -> Result<String, reqwest::Error> {
    let request = authed(client.post(format!("{base_url}{path}")), token).json(&body);
    request.send().await?.text().await
}
