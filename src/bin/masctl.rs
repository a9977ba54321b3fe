//! `masctl`: an operator CLI over the control-plane HTTP API — registry,
//! task, and feedback inspection from a terminal instead of a dashboard.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"), about = "Operator CLI for mas-core's control plane")]
struct Args {
    /// Base URL of the control-plane API.
    #[arg(long, default_value = "http://127.0.0.1:8080", global = true)]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process liveness/readiness.
    Health,
    #[command(subcommand)]
    Agents(AgentsCommand),
    #[command(subcommand)]
    Tasks(TasksCommand),
    #[command(subcommand)]
    Feedback(FeedbackCommand),
}

#[derive(Subcommand)]
enum AgentsCommand {
    List,
    Get { agent_id: String },
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        kind: String,
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
    Deregister { agent_id: String },
}

#[derive(Subcommand)]
enum TasksCommand {
    Submit {
        #[arg(long)]
        capability: String,
        /// JSON payload, defaults to `{}`.
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long, default_value = "normal")]
        priority: String,
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    Status { task_id: String },
    Cancel { task_id: String },
}

#[derive(Subcommand)]
enum FeedbackCommand {
    Submit {
        #[arg(long)]
        conversation_id: String,
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long)]
        rating: u8,
        #[arg(long)]
        success: bool,
        #[arg(long)]
        notes: Option<String>,
    },
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    Summary {
        #[arg(long)]
        agent_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();

    let (method, path, body): (reqwest::Method, String, Option<Value>) = match args.command {
        Command::Health => (reqwest::Method::GET, "/health".to_string(), None),
        Command::Agents(AgentsCommand::List) => (reqwest::Method::GET, "/agents".to_string(), None),
        Command::Agents(AgentsCommand::Get { agent_id }) => {
            (reqwest::Method::GET, format!("/agents/{agent_id}"), None)
        }
        Command::Agents(AgentsCommand::Register { name, kind, capabilities }) => (
            reqwest::Method::POST,
            "/agents".to_string(),
            Some(serde_json::json!({ "name": name, "kind": kind, "capabilities": capabilities })),
        ),
        Command::Agents(AgentsCommand::Deregister { agent_id }) => {
            (reqwest::Method::DELETE, format!("/agents/{agent_id}"), None)
        }
        Command::Tasks(TasksCommand::Submit { capability, payload, priority, idempotency_key }) => {
            let payload: Value = serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            (
                reqwest::Method::POST,
                "/tasks".to_string(),
                Some(serde_json::json!({
                    "capability": capability,
                    "payload": payload,
                    "priority": priority,
                    "idempotency_key": idempotency_key,
                })),
            )
        }
        Command::Tasks(TasksCommand::Status { task_id }) => {
            (reqwest::Method::GET, format!("/tasks/{task_id}"), None)
        }
        Command::Tasks(TasksCommand::Cancel { task_id }) => {
            (reqwest::Method::POST, format!("/tasks/{task_id}/cancel"), None)
        }
        Command::Feedback(FeedbackCommand::Submit { conversation_id, agent_id, rating, success, notes }) => (
            reqwest::Method::POST,
            "/feedback".to_string(),
            Some(serde_json::json!({
                "conversation_id": conversation_id,
                "agent_id": agent_id,
                "rating": rating,
                "success": success,
                "notes": notes,
            })),
        ),
        Command::Feedback(FeedbackCommand::Recent { limit }) => {
            (reqwest::Method::GET, format!("/feedback/recent?limit={limit}"), None)
        }
        Command::Feedback(FeedbackCommand::Summary { agent_id }) => {
            let query = agent_id.map(|id| format!("?agent_id={id}")).unwrap_or_default();
            (reqwest::Method::GET, format!("/feedback/summary{query}"), None)
        }
    };

    let url = format!("{}{path}", args.base_url);
    let mut request = client.request(method, &url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await.with_context(|| format!("calling {url}"))?;
    let status = response.status();
    let text = response.text().await.context("reading response body")?;

    if let Ok(value) = serde_json::from_str::<Value>(&text) {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{text}");
    }

    if !status.is_success() {
        bail!("request failed: {status}");
    }
    Ok(())
}
