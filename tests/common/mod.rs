//! Shared test infrastructure: spawns the real server binary via
//! `CARGO_BIN_EXE_...` against a local-filesystem backend and a generated
//! config document, rather than calling handlers in-process.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(21000);

pub struct TestServer {
    process: Child,
    port: u16,
    _config_dir: TempDir,
    _data_dir: TempDir,
}

impl TestServer {
    /// Start a server whose configuration document is exactly `datasets`
    /// (a JSON array of dataset objects matching the on-disk schema).
    pub async fn start(datasets: Value) -> Self {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let config_dir = TempDir::new().expect("tempdir");
        let data_dir = TempDir::new().expect("tempdir");

        let config_path = config_dir.path().join("config.json");
        let doc = json!({ "datasets": datasets });
        tokio::fs::write(&config_path, serde_json::to_vec(&doc).unwrap())
            .await
            .expect("write config");

        let process = Command::new(env!("CARGO_BIN_EXE_objectstorage-datalayer"))
            .env("CONFIG_LOCATION", format!("file://{}", config_path.display()))
            .env("LOCALSTORAGE_ROOT", data_dir.path())
            .env("SERVER_PORT", port.to_string())
            .env("RUST_LOG", "objectstorage_datalayer=warn")
            .spawn()
            .expect("failed to start server");

        let mut server = TestServer {
            process,
            port,
            _config_dir: config_dir,
            _data_dir: data_dir,
        };
        server.wait_ready().await;
        server
    }

    async fn wait_ready(&mut self) {
        let addr = format!("127.0.0.1:{}", self.port);
        for _ in 0..100 {
            if std::net::TcpStream::connect(&addr).is_ok() {
                sleep(Duration::from_millis(50)).await;
                return;
            }
            if let Ok(Some(status)) = self.process.try_wait() {
                panic!("server exited before becoming ready: {status}");
            }
            sleep(Duration::from_millis(50)).await;
        }
        let _ = self.process.kill();
        panic!("timed out waiting for server on {addr}");
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}
