//! Monitoring CLI (spec.md §6.6): `login -> poll /grid/overview and /nodes
//! -> render`, once or on an interval.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};

use crate::model::grid::GridSnapshot;
use crate::model::node::NodeSummary;

#[derive(Parser, Debug)]
#[command(name = "scada-cli", about = "Polls and renders grid state from the Master's REST surface")]
pub struct CliArgs {
    #[arg(long, env = "SCADA_BASE_URL", default_value = "http://127.0.0.1:9000")]
    pub base_url: String,

    #[arg(long, env = "SCADA_USERNAME")]
    pub username: String,

    #[arg(long, env = "SCADA_PASSWORD")]
    pub password: String,

    /// Poll once and exit instead of polling forever.
    #[arg(long)]
    pub once: bool,

    #[arg(long, default_value_t = 5)]
    pub interval_secs: u64,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    kind: String,
    message: String,
}

/// `0` success, `1` transport error, `2` auth error (spec.md §6.6).
pub async fn run(args: CliArgs) -> ExitCode {
    let client = match reqwest::Client::builder().timeout(Duration::from_secs(10)).build() {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "failed to build http client");
            return ExitCode::from(1);
        }
    };

    let token = match login(&client, &args).await {
        Ok(token) => token,
        Err(code) => return code,
    };

    loop {
        match poll_once(&client, &args.base_url, &token).await {
            Ok(()) => {}
            Err(code) => return code,
        }
        if args.once {
            return ExitCode::SUCCESS;
        }
        tokio::time::sleep(Duration::from_secs(args.interval_secs)).await;
    }
}

async fn login(client: &reqwest::Client, args: &CliArgs) -> Result<String, ExitCode> {
    let response = client
        .post(format!("{}/auth/login", args.base_url))
        .json(&serde_json::json!({ "username": args.username, "password": args.password }))
        .send()
        .await
        .map_err(|err| {
            error!(error = %err, "login request failed");
            ExitCode::from(1)
        })?;

    if !response.status().is_success() {
        let envelope: Option<ErrorEnvelope> = response.json().await.ok();
        if let Some(envelope) = envelope {
            error!(kind = %envelope.error.kind, message = %envelope.error.message, "login rejected");
        }
        return Err(ExitCode::from(2));
    }

    let body: LoginResponse = response.json().await.map_err(|err| {
        error!(error = %err, "login response was not valid json");
        ExitCode::from(1)
    })?;
    Ok(body.access_token)
}

async fn poll_once(client: &reqwest::Client, base_url: &str, token: &str) -> Result<(), ExitCode> {
    let grid: GridSnapshot = get_json(client, base_url, "/grid/overview", token).await?;
    let nodes: Vec<NodeSummary> = get_json(client, base_url, "/nodes", token).await?;
    render(&grid, &nodes);
    Ok(())
}

async fn get_json<T: for<'de> Deserialize<'de>>(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    token: &str,
) -> Result<T, ExitCode> {
    let response = client
        .get(format!("{base_url}{path}"))
        .bearer_auth(token)
        .send()
        .await
        .map_err(|err| {
            error!(error = %err, path, "request failed");
            ExitCode::from(1)
        })?;

    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Err(ExitCode::from(2));
    }
    if !response.status().is_success() {
        error!(status = %response.status(), path, "unexpected response");
        return Err(ExitCode::from(1));
    }

    response.json().await.map_err(|err| {
        error!(error = %err, path, "response was not valid json");
        ExitCode::from(1)
    })
}

fn render(grid: &GridSnapshot, nodes: &[NodeSummary]) {
    info!(
        frequency_hz = grid.system_frequency_hz,
        generation_mw = grid.total_generation_mw,
        load_mw = grid.total_load_mw,
        losses_mw = grid.grid_losses_mw,
        online = grid.nodes_online,
        offline = grid.nodes_offline,
        "grid overview"
    );
    for node in nodes {
        info!(node_id = %node.node_id, kind = ?node.kind, link_state = ?node.link_state, "node");
    }
}
