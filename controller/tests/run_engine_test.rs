//! End-to-end exercise of the scheduler and run engine against a fake node, the
//! way `gofer`'s own HTTP-level tests drive a real listener instead of mocking
//! the transport.
//!
//! The fake node is a minimal hand-rolled `hyper` service (no dependency on the
//! `tubular-node` crate) that answers `/queue`, `/status`, `/archive` and
//! `/output` just well enough for `NodeConnection` to dispatch one task and
//! download its terminal artifacts.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tubular_controller::node_connection::NodeConnection;
use tubular_controller::run_engine::{submit, PipelineReq};
use tubular_controller::scheduler::Scheduler;
use tubular_controller::state::{ControllerState, PipelineRepoIdentity};
use tubular_controller::storage::Db;
use tubular_core::models::{NodeStatus, PipelineStatus};
use tubular_core::wire::NodeStatusResponse;

struct FakeNode {
    queued: AtomicBool,
    archive_zip: Vec<u8>,
    output_zip: Vec<u8>,
}

async fn handle_fake_node(
    node: Arc<FakeNode>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    let body = |status: StatusCode, bytes: Vec<u8>| {
        Response::builder()
            .status(status)
            .body(Full::new(Bytes::from(bytes)))
            .expect("static response is valid")
    };

    let response = match (method.as_str(), path.as_str()) {
        ("POST", "/queue") => {
            node.queued.store(true, Ordering::SeqCst);
            body(StatusCode::OK, b"queued".to_vec())
        }
        ("GET", "/status") => {
            let task_status = if node.queued.load(Ordering::SeqCst) {
                PipelineStatus::Success
            } else {
                PipelineStatus::NotRun
            };
            let resp = NodeStatusResponse {
                status: NodeStatus::Idle,
                task_status,
            };
            body(StatusCode::OK, serde_json::to_vec(&resp).unwrap())
        }
        ("GET", "/archive") => body(StatusCode::OK, node.archive_zip.clone()),
        ("GET", "/output") => body(StatusCode::OK, node.output_zip.clone()),
        _ => body(StatusCode::NOT_FOUND, b"not found".to_vec()),
    };

    Ok(response)
}

/// Binds an ephemeral port synchronously (so the caller can use the real address
/// immediately) and serves `node` on a dedicated OS thread with its own tiny
/// tokio runtime, mirroring the "one management thread per external resource"
/// shape the controller itself uses for the scheduler and trigger engine.
fn spawn_fake_node(node: Arc<FakeNode>) -> SocketAddr {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind fake node");
    std_listener.set_nonblocking(true).expect("nonblocking");
    let addr = std_listener.local_addr().expect("local addr");

    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().expect("fake node runtime");
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(std_listener).expect("tokio listener");
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => continue,
                };
                let io = TokioIo::new(stream);
                let node = Arc::clone(&node);
                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req| handle_fake_node(Arc::clone(&node), req));
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });
    });

    addr
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git must be installed to run this test");
    assert!(status.success(), "git {args:?} failed");
}

/// Creates a one-commit git repo with a single pipeline, one stage, one task
/// with no node-tag constraints, and an archive step.
fn init_pipeline_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-q"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "user.name", "test"]);

    std::fs::write(
        dir.join("build.yaml"),
        r#"
display: "Build"
stages:
  - display: "Stage 1"
    tasks:
      - task1
"#,
    )
    .unwrap();
    std::fs::write(
        dir.join("task1.yaml"),
        r#"
display: "Task 1"
steps:
  - type: exec
    target: "echo hi"
  - type: archive
    target: out.txt
"#,
    )
    .unwrap();

    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", "initial"]);
    git(dir, &["branch", "-M", "main"]);
}

fn build_zip(entry_name: &str, contents: &[u8]) -> Vec<u8> {
    let scratch = tempfile::tempdir().unwrap();
    let src_dir = scratch.path().join("src");
    std::fs::create_dir_all(&src_dir).unwrap();
    std::fs::write(src_dir.join(entry_name), contents).unwrap();

    let zip_path = scratch.path().join("out.zip");
    tubular_core::archive_zip::zip_directory(&src_dir, &zip_path).unwrap();
    std::fs::read(&zip_path).unwrap()
}

#[test]
fn submitted_pipeline_run_completes_against_a_fake_node() {
    let repo_dir = tempfile::tempdir().unwrap();
    init_pipeline_repo(repo_dir.path());

    let fake_node = Arc::new(FakeNode {
        queued: AtomicBool::new(false),
        archive_zip: build_zip("out.txt", b"archived output\n"),
        output_zip: build_zip("task1.log", b"log line\n"),
    });
    let node_addr = spawn_fake_node(fake_node);

    let workspace = tempfile::tempdir().unwrap();
    let db_path = workspace.path().join("tubular.db");
    let db = Db::new(&db_path.to_string_lossy()).unwrap();

    let mut nodes = HashMap::new();
    let node = NodeConnection::new("fake", &node_addr.ip().to_string(), node_addr.port(), Default::default());
    nodes.insert(node.name.clone(), node);

    let scheduler = Scheduler::new(nodes);
    let state = ControllerState::new(
        db,
        Arc::clone(&scheduler),
        workspace.path().to_path_buf(),
        PipelineRepoIdentity {
            url: repo_dir.path().to_string_lossy().to_string(),
            default_branch: "main".to_string(),
        },
    );

    let scheduler_handle = {
        let scheduler = Arc::clone(&scheduler);
        std::thread::spawn(move || scheduler.run_loop())
    };

    submit(
        Arc::clone(&state),
        PipelineReq {
            branch: String::new(),
            pipeline_path: "build.yaml".to_string(),
            args: Vec::new(),
        },
    );

    let pipeline_id = state.db.get_or_create_pipeline_id("build.yaml").unwrap();
    let run = wait_for_finalized_run(&state, pipeline_id);

    assert_eq!(run.status, PipelineStatus::Success);
    assert_eq!(run.run_num, 1);

    let repo_url = repo_dir.path().to_string_lossy().to_string();
    let archive_dir = state.branch_root(&repo_url, "main").join("archive").join("build.1");
    assert_eq!(
        std::fs::read_to_string(archive_dir.join("out.txt")).unwrap(),
        "archived output\n"
    );

    scheduler.shutdown();
    let _ = scheduler_handle.join();
}

fn wait_for_finalized_run(state: &Arc<ControllerState>, pipeline_id: i64) -> tubular_controller::storage::Run {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(runs) = state.db.runs(pipeline_id) {
            if let Some(run) = runs.into_iter().find(|r| r.status != PipelineStatus::Running) {
                return run;
            }
        }
        if Instant::now() > deadline {
            panic!("run for pipeline {pipeline_id} never finalized");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
