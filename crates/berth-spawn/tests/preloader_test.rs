// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Preloader client tests against an in-process fake preloader.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use berth_protocol::control::{self, ControlRequest, ControlResponse};
use berth_spawn::{ErrorCategory, Preloader, SpawnErrorKind, SpawnerConfig, StartupArgs, WORK_DIR_ENV};
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

const FORKED_WORKER: &str = r#"
dir="$BERTH_SPAWN_WORK_DIR"
printf '{"sockets":[{"name":"main","address":"unix:/tmp/forked.sock","protocol":"session","concurrency":0}]}' > "$dir/response/properties.json"
printf 1 > "$dir/response/finish"
exec sleep 30
"#;

/// How the fake preloader answers a spawn command
#[derive(Clone)]
enum Reply {
    /// Start `/bin/sh -c script` for the work directory and report its PID
    Run(&'static str),
    /// Send this raw line
    Raw(&'static str),
}

struct FakePreloader {
    _dir: TempDir,
    socket: PathBuf,
    children: Arc<Mutex<Vec<Child>>>,
}

impl FakePreloader {
    fn start(reply: Reply) -> Self {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("preloader.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let children = Arc::new(Mutex::new(Vec::new()));

        let spawned = children.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let line = control::read_line(&mut reader, control::MAX_LINE_SIZE)
                    .await
                    .unwrap()
                    .unwrap();
                let ControlRequest::Spawn { work_dir } = control::decode_line(&line).unwrap();

                let response = match reply.clone() {
                    Reply::Run(script) => {
                        let child = Command::new("/bin/sh")
                            .args(["-c", script])
                            .env(WORK_DIR_ENV, &work_dir)
                            .stdin(Stdio::null())
                            .spawn()
                            .unwrap();
                        let pid = child.id() as i32;
                        spawned.lock().unwrap().push(child);
                        control::encode_line(&ControlResponse::Ok { pid }).unwrap()
                    }
                    Reply::Raw(line) => format!("{line}\n").into_bytes(),
                };
                write_half.write_all(&response).await.unwrap();
            }
        });

        Self {
            _dir: dir,
            socket,
            children,
        }
    }

    fn reap(&self) {
        for mut child in self.children.lock().unwrap().drain(..) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn config(spawn_dir: &TempDir) -> SpawnerConfig {
    SpawnerConfig::default().with_spawn_dir(spawn_dir.path())
}

#[tokio::test]
async fn test_spawn_through_preloader() {
    let spawn_dir = TempDir::new().unwrap();
    let fake = FakePreloader::start(Reply::Run(FORKED_WORKER));
    let preloader = Preloader::connect(&fake.socket, config(&spawn_dir));

    let mut process = preloader.spawn(&StartupArgs::new()).await.unwrap();

    assert!(process.pid() > 0);
    assert_eq!(process.sockets()[0].concurrency, 0);
    assert!(process.input().is_some());
    assert!(!process.has_exited());
    assert!(std::fs::read_dir(spawn_dir.path()).unwrap().next().is_none());

    drop(process);
    fake.reap();
}

#[tokio::test]
async fn test_forked_worker_premature_exit() {
    let spawn_dir = TempDir::new().unwrap();
    let fake = FakePreloader::start(Reply::Run("exit 0"));
    let preloader = Preloader::connect(&fake.socket, config(&spawn_dir));

    // The fake preloader is the parent, so exit is only visible once it reaps.
    let reaper = {
        let children = fake.children.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                for child in children.lock().unwrap().iter_mut() {
                    let _ = child.try_wait();
                }
            }
        })
    };

    let err = tokio::time::timeout(Duration::from_secs(10), preloader.spawn(&StartupArgs::new()))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, SpawnErrorKind::PrematureExit);
    assert_eq!(err.exit_code, None);

    reaper.abort();
    fake.reap();
}

#[tokio::test]
async fn test_forked_worker_spawn_timeout() {
    let spawn_dir = TempDir::new().unwrap();
    let fake = FakePreloader::start(Reply::Run("exec sleep 30"));
    let preloader = Preloader::connect(&fake.socket, config(&spawn_dir));

    let err = preloader
        .spawn_with_timeout(&StartupArgs::new(), Duration::from_millis(300))
        .await
        .unwrap_err();
    assert_eq!(err.kind, SpawnErrorKind::Timeout);
    assert_eq!(err.category, ErrorCategory::Timeout);
    assert!(std::fs::read_dir(spawn_dir.path()).unwrap().next().is_none());

    fake.reap();
}

#[tokio::test]
async fn test_preloader_error_response() {
    let spawn_dir = TempDir::new().unwrap();
    let fake = FakePreloader::start(Reply::Raw(r#"{"result":"error","message":"out of memory"}"#));
    let preloader = Preloader::connect(&fake.socket, config(&spawn_dir));

    let err = preloader.spawn(&StartupArgs::new()).await.unwrap_err();
    assert_eq!(err.kind, SpawnErrorKind::Error);
    assert!(err.summary.contains("out of memory"));
    assert!(std::fs::read_dir(spawn_dir.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn test_preloader_invalid_pid() {
    let spawn_dir = TempDir::new().unwrap();
    let fake = FakePreloader::start(Reply::Raw(r#"{"result":"ok","pid":0}"#));
    let preloader = Preloader::connect(&fake.socket, config(&spawn_dir));

    let err = preloader.spawn(&StartupArgs::new()).await.unwrap_err();
    assert_eq!(err.kind, SpawnErrorKind::Internal);
    assert!(err.summary.contains("invalid PID"));
}

#[tokio::test]
async fn test_preloader_garbage_response() {
    let spawn_dir = TempDir::new().unwrap();
    let fake = FakePreloader::start(Reply::Raw("hello there"));
    let preloader = Preloader::connect(&fake.socket, config(&spawn_dir));

    let err = preloader.spawn(&StartupArgs::new()).await.unwrap_err();
    assert_eq!(err.kind, SpawnErrorKind::Internal);
    assert!(err.problem_description.unwrap().contains("hello there"));
}

#[tokio::test]
async fn test_preloader_unreachable() {
    let spawn_dir = TempDir::new().unwrap();
    let preloader = Preloader::connect(spawn_dir.path().join("missing.sock"), config(&spawn_dir));

    let err = preloader.spawn(&StartupArgs::new()).await.unwrap_err();
    assert_eq!(err.kind, SpawnErrorKind::Internal);
    assert!(err.summary.contains("Cannot connect"));
}
