//! Long-running orchestrator speaking JSON lines on stdio.
//!
//! Each stdin line is one request; each stdout line is one response.
//! Results are written as they complete, not in submission order.

mod error;

use std::path::PathBuf;

use clap::Parser;
use log::{debug, info, warn};
use sandpit_core::{
    config::SandpitConfig,
    dispatch::{Cancellation, Dispatcher},
    state::SubmissionState,
    submission::{Limits, SourceFile, Submission},
    ExecutionResult,
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
    task::JoinSet,
};

use crate::error::Result;

#[derive(Parser)]
#[command(version, author = "Kanari", about = "sandpit orchestrator daemon (JSON lines on stdio)")]
struct Opts {
    /// sandpit.yaml; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Request {
    Submit(SubmitRequest),
    Cancel { id: String },
    Status { id: String },
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    id: String,
    language: String,
    #[serde(default)]
    sources: Vec<SourceFile>,
    /// Shorthand for a single unnamed source.
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    stdin: String,
    #[serde(default)]
    limits: Option<Limits>,
}

impl SubmitRequest {
    fn into_submission(self, defaults: Limits) -> Submission {
        let mut sources = self.sources;
        if let Some(source) = self.source {
            sources.insert(0, SourceFile::unnamed(source));
        }
        Submission {
            id: self.id,
            language: self.language,
            sources,
            stdin: self.stdin,
            limits: self.limits.unwrap_or(defaults),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Response {
    Result(ExecutionResult),
    Cancelled {
        id: String,
        outcome: Cancellation,
    },
    Status {
        id: String,
        state: Option<SubmissionState>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let opts: Opts = Opts::parse();

    let config = match &opts.config {
        Some(path) => SandpitConfig::from_file(&path.to_string_lossy())?,
        None => SandpitConfig::default(),
    };
    let defaults = config.defaults;
    info!(
        "sandpit daemon using {:?} backend, {} slots",
        config.sandbox.backend, config.pool.slots
    );
    let dispatcher = Dispatcher::from_config(config);

    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
    let writer = tokio::spawn(async move {
        let mut out = io::stdout();
        while let Some(response) = rx.recv().await {
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            out.write_all(&line).await?;
            out.flush().await?;
        }
        Ok::<(), error::Error>(())
    });

    let mut waiters = JoinSet::new();
    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("unreadable request: {}", e);
                let _ = tx.send(Response::Error {
                    id: None,
                    message: format!("invalid request: {}", e),
                });
                continue;
            }
        };
        debug!("request {:?}", request);

        match request {
            Request::Submit(request) => {
                let submission = request.into_submission(defaults);
                let id = submission.id.clone();
                match dispatcher.submit(submission) {
                    Ok(ticket) => {
                        let tx = tx.clone();
                        waiters.spawn(async move {
                            if let Some(result) = ticket.wait().await {
                                let _ = tx.send(Response::Result(result));
                            }
                        });
                    }
                    Err(e) => {
                        let _ = tx.send(Response::Error {
                            id: Some(id),
                            message: e.to_string(),
                        });
                    }
                }
            }
            Request::Cancel { id } => {
                let outcome = dispatcher.cancel(&id);
                let _ = tx.send(Response::Cancelled { id, outcome });
            }
            Request::Status { id } => {
                let state = dispatcher.status(&id);
                let _ = tx.send(Response::Status { id, state });
            }
            Request::Shutdown => {
                info!("shutdown requested");
                dispatcher.shutdown();
                break;
            }
        }
    }

    // Every accepted submission gets its result line before exit.
    while waiters.join_next().await.is_some() {}
    drop(tx);
    writer.await??;
    info!("sandpit daemon stopped");
    Ok(())
}
