//! Thin HTTP front end over the run engine and run database (spec.md §6
//! "Controller HTTP API"). JSON shaping of the full surface is out of scope;
//! this implements enough of the table to exercise the system end to end.
//!
//! Grounded on the node's own `server.rs` for the hyper accept-loop shape.

use crate::run_engine::{submit, PipelineReq};
use crate::state::ControllerState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tubular_core::{fs_tree, git};

pub async fn serve(state: Arc<ControllerState>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "controller listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| handle(Arc::clone(&state), req));
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                error!(%err, "connection error");
            }
        });
    }
}

fn query_map(req: &Request<Incoming>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn json<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response is valid")
}

fn bad_request(msg: &str) -> Response<Full<Bytes>> {
    json(StatusCode::BAD_REQUEST, &serde_json::json!({ "msg": msg }))
}

fn not_found(msg: &str) -> Response<Full<Bytes>> {
    json(StatusCode::NOT_FOUND, &serde_json::json!({ "msg": msg }))
}

async fn handle(
    state: Arc<ControllerState>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let q = query_map(&req);

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/api/pipelines") => {
            let Some(branch) = q.get("branch") else {
                return Ok(bad_request("branch is required"));
            };
            match state.db.list_pipelines_for_branch(branch) {
                Ok(rows) => json(StatusCode::OK, &rows.into_iter().map(|r| {
                    serde_json::json!({
                        "path": r.path,
                        "last_start_ms": r.last_start_ms,
                        "last_status": r.last_status.to_string(),
                    })
                }).collect::<Vec<_>>()),
                Err(e) => bad_request(&e.to_string()),
            }
        }
        (&Method::POST, "/api/pipelines") => {
            let Ok(collected) = req.into_body().collect().await else {
                return Ok(bad_request("could not read body"));
            };
            match serde_json::from_slice::<PipelineReq>(&collected.to_bytes()) {
                Ok(pipeline_req) => {
                    submit(Arc::clone(&state), pipeline_req);
                    json(StatusCode::CREATED, &serde_json::json!({ "msg": "enqueued" }))
                }
                Err(e) => bad_request(&format!("invalid PipelineReq: {e}")),
            }
        }
        (&Method::GET, "/api/runs") => {
            let Some(pipeline_path) = q.get("pipelinePath") else {
                return Ok(bad_request("pipelinePath is required"));
            };
            match state.db.get_or_create_pipeline_id(pipeline_path).and_then(|id| state.db.runs(id)) {
                Ok(runs) => json(StatusCode::OK, &runs.into_iter().map(|r| {
                    serde_json::json!({
                        "branch": r.branch,
                        "run_num": r.run_num,
                        "start_ms": r.start_ms,
                        "duration_ms": r.duration_ms,
                        "status": r.status.to_string(),
                    })
                }).collect::<Vec<_>>()),
                Err(e) => bad_request(&e.to_string()),
            }
        }
        (&Method::GET, "/api/runs_stats") => match state.db.last50_statuses() {
            Ok(statuses) => {
                let mut counts: HashMap<String, u64> = HashMap::new();
                for s in statuses {
                    *counts.entry(s.to_string()).or_insert(0) += 1;
                }
                json(StatusCode::OK, &counts)
            }
            Err(e) => bad_request(&e.to_string()),
        },
        (&Method::GET, "/api/node_status") => {
            let statuses: HashMap<String, String> = state
                .node_table()
                .into_iter()
                .map(|(name, node)| (name, node.status().to_string()))
                .collect();
            json(StatusCode::OK, &statuses)
        }
        (&Method::GET, "/api/branches") => {
            let url = state.pipeline_repo.read().expect("pipeline repo identity poisoned").url.clone();
            match git::ls_branches(&url) {
                Ok(branches) => json(StatusCode::OK, &branches),
                Err(e) => bad_request(&e.to_string()),
            }
        }
        (&Method::GET, "/api/archive_list") | (&Method::GET, "/api/output_list") => {
            let Some(dir) = artifact_dir(&state, &q, path.ends_with("archive_list")) else {
                return Ok(bad_request("pipelinePath, branch and run are required"));
            };
            match fs_tree::list(&dir) {
                Ok(tree) => json(StatusCode::OK, &tree),
                Err(e) => not_found(&e.to_string()),
            }
        }
        (&Method::GET, "/api/archive") | (&Method::GET, "/api/output") => {
            let Some(dir) = artifact_dir(&state, &q, path.ends_with("archive")) else {
                return Ok(bad_request("pipelinePath, branch and run are required"));
            };
            let Some(file) = q.get("file") else {
                return Ok(bad_request("file is required"));
            };
            match tokio::fs::read(dir.join(file)).await {
                Ok(bytes) => Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/octet-stream")
                    .body(Full::new(Bytes::from(bytes)))
                    .expect("static response is valid"),
                Err(e) => not_found(&e.to_string()),
            }
        }
        (&Method::GET, "/api/run") => {
            let (Some(pipeline_path), Some(run)) = (q.get("pipeline"), q.get("run")) else {
                return Ok(bad_request("pipeline and run are required"));
            };
            let Ok(run_num) = run.parse::<i64>() else {
                return Ok(bad_request("run must be an integer"));
            };
            match state.db.get_or_create_pipeline_id(pipeline_path).and_then(|id| state.db.run_meta(id, run_num)) {
                Ok(meta) => Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json")
                    .body(Full::new(Bytes::from(meta)))
                    .expect("static response is valid"),
                Err(e) => not_found(&e.to_string()),
            }
        }
        _ => not_found("not found"),
    };

    Ok(response)
}

/// Resolves `<branchRoot>/archive|output/<pipelineName>.<runNum>` from query
/// params, used by both `/api/archive_list` and `/api/output_list`.
fn artifact_dir(state: &Arc<ControllerState>, q: &HashMap<String, String>, archive: bool) -> Option<std::path::PathBuf> {
    let pipeline_path = q.get("pipelinePath")?;
    let branch = q.get("branch")?;
    let run = q.get("run")?;
    let repo_url = state.pipeline_repo.read().expect("pipeline repo identity poisoned").url.clone();
    let branch_root = state.branch_root(&repo_url, branch);
    let name = tubular_core::models::pipeline::derive_name(pipeline_path);
    let sub = if archive { "archive" } else { "output" };
    Some(branch_root.join(sub).join(format!("{name}.{run}")))
}
