//! Shared harness for the integration tests: a scripted stand-in for the
//! nginx binary plus a stub_status endpoint.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use balancer_studio::apply::ApplyCoordinator;
use balancer_studio::config::{NginxConfig, RenderOptions};
use balancer_studio::db::Database;
use balancer_studio::model::{
    EntityDraft, EntityId, ProxyHostDraft, UpstreamDraft, UpstreamServerDraft,
};
use balancer_studio::process::ProcessController;
use balancer_studio::queue::ChangeQueue;
use balancer_studio::store::EntityStore;
use balancer_studio::validate::Validator;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Behaves like `nginx -t -q -c FILE` and `nginx -s reload`.
///
/// The check rejects any file mentioning `reject-me`. Reloads are logged to
/// `reload.log` as start/end pairs; `fail_reloads` holds a count of reloads
/// to fail and `slow_reload` makes each reload take 300ms.
const FAKE_NGINX: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
case "$1" in
  -t)
    file="$4"
    if grep -q reject-me "$file"; then
      echo "nginx: [emerg] unknown directive \"reject-me\" in $file:1" >&2
      exit 1
    fi
    exit 0
    ;;
  -s)
    echo "start" >> "$dir/reload.log"
    if [ -f "$dir/slow_reload" ]; then
      sleep 0.3
    fi
    if [ -f "$dir/fail_reloads" ]; then
      n=$(cat "$dir/fail_reloads")
      if [ "$n" -gt 0 ]; then
        echo $((n - 1)) > "$dir/fail_reloads"
        echo "end" >> "$dir/reload.log"
        echo "nginx: [emerg] bind() to 0.0.0.0:443 failed (98: Address in use)" >&2
        exit 1
      fi
    fi
    echo "end" >> "$dir/reload.log"
    exit 0
    ;;
esac
echo "unsupported arguments: $*" >&2
exit 2
"#;

const STUB_STATUS: &str = "Active connections: 3 \nserver accepts handled requests\n 10 10 42 \nReading: 0 Writing: 1 Waiting: 2 \n";

pub struct FakeNginx {
    dir: TempDir,
    script: PathBuf,
    status_addr: SocketAddr,
}

impl FakeNginx {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("nginx.sh");
        std::fs::write(&script, FAKE_NGINX).unwrap();

        // The test process stands in for the nginx master
        std::fs::write(dir.path().join("nginx.pid"), std::process::id().to_string()).unwrap();

        let status_addr = start_status_server().await;

        Self {
            dir,
            script,
            status_addr,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("nginx.conf")
    }

    pub fn nginx_config(&self) -> NginxConfig {
        NginxConfig {
            config_path: self.config_path().to_string_lossy().into_owned(),
            staging_dir: Some(self.dir.path().join("staging").to_string_lossy().into_owned()),
            test_command: format!("/bin/sh {} -t -q -c {{config}}", self.script.display()),
            reload_command: format!("/bin/sh {} -s reload", self.script.display()),
            pid_file: Some(self.dir.path().join("nginx.pid").to_string_lossy().into_owned()),
            status_url: Some(format!("http://{}/nginx_status", self.status_addr)),
            validate_timeout_secs: 5,
            reload_timeout_secs: 3,
            ack_poll_interval_ms: 20,
        }
    }

    pub fn fail_next_reloads(&self, count: u32) {
        std::fs::write(self.dir.path().join("fail_reloads"), count.to_string()).unwrap();
    }

    pub fn slow_reloads(&self) {
        std::fs::write(self.dir.path().join("slow_reload"), "").unwrap();
    }

    /// Lines of the reload log, "start" and "end" per reload
    pub fn reload_log(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("reload.log"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn reload_count(&self) -> usize {
        self.reload_log().iter().filter(|l| *l == "start").count()
    }
}

async fn start_status_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let _ = socket.read(&mut buf).await;
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            STUB_STATUS.len(),
                            STUB_STATUS
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// The full apply pipeline wired to a fake nginx and an in-memory store
pub struct Studio {
    pub db: Arc<Database>,
    pub coordinator: Arc<ApplyCoordinator>,
    pub queue: Arc<ChangeQueue>,
    shutdown_tx: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
}

impl Studio {
    pub fn new(nginx: &FakeNginx, debounce: Duration) -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let config = nginx.nginx_config();
        let coordinator = ApplyCoordinator::new(
            db.clone(),
            Validator::new(&config).unwrap(),
            ProcessController::new(&config).unwrap(),
            RenderOptions::default(),
            config.config_path(),
        );
        let queue = ChangeQueue::new(coordinator.clone(), debounce);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            db,
            coordinator,
            queue,
            shutdown_tx,
            worker: None,
        }
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn the queue worker
    pub fn start_worker(&mut self) {
        let queue = self.queue.clone();
        self.worker = Some(tokio::spawn(queue.run(self.shutdown_rx())));
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(worker) = self.worker.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
        }
    }

    pub fn add_upstream(&self, name: &str, servers: &[(&str, u16)]) -> EntityId {
        let servers = servers
            .iter()
            .map(|(host, port)| UpstreamServerDraft {
                host: host.to_string(),
                port: *port,
                weight: 1,
                max_fails: 3,
                status: Default::default(),
            })
            .collect();
        self.db
            .create(EntityDraft::Upstream(UpstreamDraft {
                name: name.to_string(),
                algorithm: Default::default(),
                description: String::new(),
                servers: Some(servers),
            }))
            .unwrap()
            .value
            .id()
    }

    pub fn add_host(&self, domain: &str, port: u16) -> EntityId {
        self.db
            .create(EntityDraft::ProxyHost(host_draft(domain, port)))
            .unwrap()
            .value
            .id()
    }
}

pub fn host_draft(domain: &str, port: u16) -> ProxyHostDraft {
    ProxyHostDraft {
        domain_names: vec![domain.to_string()],
        forward_host: "10.0.0.5".to_string(),
        forward_port: port,
        ssl_enabled: false,
        certificate_id: None,
        enabled: true,
    }
}
