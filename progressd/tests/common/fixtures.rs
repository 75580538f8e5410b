use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::routing::get;
use progress_common::ProgressConfig;
use progressd::DaemonContext;
use progressd::fetch::PassingSetSource;
use progressd::mirror::RepositoryMirror;
use tempfile::TempDir;

pub const SERVER_SECRET: &str = "server-secret";
pub const SUITE_SECRET: &str = "suite-secret";

/// A daemon context rooted in a temp dir.
pub struct TestDaemon {
    pub dir: TempDir,
    pub context: DaemonContext,
}

impl TestDaemon {
    pub fn config_in(dir: &Path) -> ProgressConfig {
        let mut config = ProgressConfig::default();
        config.database.path = dir.join("stats.db");
        config.git.checkout_dir = dir.join("sytest");
        config.manifest_url = "http://127.0.0.1:9/testfile".to_string();
        for source in &mut config.webhooks {
            source.secret = match source.name.as_str() {
                "server" => SERVER_SECRET.to_string(),
                _ => SUITE_SECRET.to_string(),
            };
        }
        config
    }

    pub fn new(mirror: Arc<dyn RepositoryMirror>, fetcher: Arc<dyn PassingSetSource>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Self::config_in(dir.path());
        Self::with_config(dir, config, mirror, fetcher)
    }

    pub fn with_config(
        dir: TempDir,
        config: ProgressConfig,
        mirror: Arc<dyn RepositoryMirror>,
        fetcher: Arc<dyn PassingSetSource>,
    ) -> Self {
        let context = DaemonContext::with_sources(config, mirror, fetcher).unwrap();
        Self { dir, context }
    }

    pub fn router(&self) -> Router {
        progressd::http_api::create_router(self.context.http_state())
    }
}

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args([
            "-c",
            "user.name=Progress Test",
            "-c",
            "user.email=progress@example.invalid",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .output()
        .expect("git should run");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Serve a mutable manifest at `/testfile` on an ephemeral port.
pub async fn serve_manifest(body: &str) -> (String, Arc<Mutex<String>>) {
    let manifest = Arc::new(Mutex::new(body.to_string()));
    let shared = manifest.clone();
    let router = Router::new().route(
        "/testfile",
        get(move || {
            let shared = shared.clone();
            async move { shared.lock().unwrap().clone() }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (format!("http://{addr}/testfile"), manifest)
}
