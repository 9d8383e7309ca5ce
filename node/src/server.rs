//! The node's HTTP front end: `/status`, `/queue`, `/archive`, `/output`
//! (spec.md §6 "Node HTTP API").
//!
//! Grounded on `examples/original_source/tubular/node/node_main.py`'s role as the
//! process entry point wiring a `NodeWorker` up to an HTTP listener; built with
//! `hyper`, already a direct dependency of the teacher's `gofer` binary.

use crate::worker::NodeWorker;
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
use tubular_core::wire::{BusyResponse, NodeStatusResponse, TaskRequest};

pub async fn serve(worker: Arc<NodeWorker>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "node listening");
    serve_on(listener, worker).await
}

/// Runs the accept loop on an already-bound listener. Split out from [`serve`] so
/// tests can bind an ephemeral port (`127.0.0.1:0`) and read back the real address
/// before handing the listener off here.
pub async fn serve_on(listener: TcpListener, worker: Arc<NodeWorker>) -> anyhow::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let worker = Arc::clone(&worker);

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| handle(Arc::clone(&worker), req));
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

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response is valid")
}

fn plain_status(status: StatusCode, msg: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(msg.to_string())))
        .expect("static response is valid")
}

async fn handle(
    worker: Arc<NodeWorker>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/status") => {
            let update_config = query_map(&req)
                .get("updateConfig")
                .map(|v| v == "true")
                .unwrap_or(false);
            let (status, task_status) = worker.status(update_config);
            json_response(StatusCode::OK, &NodeStatusResponse { status, task_status })
        }
        (&Method::POST, "/queue") => {
            let Ok(collected) = req.into_body().collect().await else {
                return Ok(plain_status(StatusCode::BAD_REQUEST, "could not read body"));
            };
            let bytes = collected.to_bytes();
            let task_req: TaskRequest = match serde_json::from_slice(&bytes) {
                Ok(t) => t,
                Err(e) => {
                    return Ok(plain_status(
                        StatusCode::BAD_REQUEST,
                        &format!("invalid TaskRequest: {e}"),
                    ))
                }
            };
            match worker.queue_task(task_req) {
                Ok(()) => plain_status(StatusCode::OK, "queued"),
                Err(_busy) => json_response(
                    StatusCode::CONFLICT,
                    &BusyResponse {
                        msg: "node is already running a task".to_string(),
                    },
                ),
            }
        }
        (&Method::GET, "/archive") => return Ok(serve_artifact(&worker, &req, true).await),
        (&Method::GET, "/output") => return Ok(serve_artifact(&worker, &req, false).await),
        _ => plain_status(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn serve_artifact(
    worker: &Arc<NodeWorker>,
    req: &Request<Incoming>,
    archive: bool,
) -> Response<Full<Bytes>> {
    let q = query_map(req);
    let (Some(repo_url), Some(branch), Some(task_path)) =
        (q.get("repo_url"), q.get("branch"), q.get("task_path"))
    else {
        return plain_status(
            StatusCode::BAD_REQUEST,
            "repo_url, branch and task_path query params are required",
        );
    };

    let task_req = TaskRequest {
        repo_url: repo_url.clone(),
        branch: branch.clone(),
        task_path: task_path.clone(),
        args: HashMap::new(),
    };

    let path_result = if archive {
        worker.archive_path(&task_req)
    } else {
        worker.output_path(&task_req)
    };

    let path = match path_result {
        Ok(p) => p,
        Err(e) => return plain_status(StatusCode::NOT_FOUND, &e.to_string()),
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/zip")
            .body(Full::new(Bytes::from(bytes)))
            .expect("static response is valid"),
        Err(e) => plain_status(StatusCode::NOT_FOUND, &e.to_string()),
    }
}
