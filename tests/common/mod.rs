//! Integration test harness: spawns a daemon on a loopback port and
//! drives it with a line-based IRC client.

#![allow(dead_code)]

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// A daemon instance running on its own thread (the daemon is
/// single-task; the thread carries its current-thread runtime).
pub struct TestServer {
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
    pub port: u16,
}

impl TestServer {
    pub async fn spawn(port: u16) -> TestServer {
        Self::spawn_with(port, "").await
    }

    /// `extra` is appended to the generated TOML config; top-level keys
    /// only, since the loopback exemption table follows it.
    pub async fn spawn_with(port: u16, extra: &str) -> TestServer {
        let config_text = format!(
            r#"
            name = "test.example.com"
            server_id = "00{port}"
            bind_client = ["tcp:{port}"]
            storage_path = "{tmp}/modircd-test-{port}.json"
            {extra}

            [max_connection_exempt]
            "127.0.0.1" = 100
            "#,
            tmp = std::env::temp_dir().display(),
        );
        let config: modircd::config::Config =
            toml::from_str(&config_text).expect("test config parses");
        config.validate().expect("test config is valid");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let thread = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime builds");
            rt.block_on(modircd::run(config, String::new(), Some(shutdown_rx)))
                .expect("daemon runs");
        });

        // Wait for the listener to come up.
        for _ in 0..100 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        TestServer {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
            port,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A line-based IRC test client.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(port: u16) -> TestClient {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect to test server");
        let (read_half, write_half) = stream.into_split();
        TestClient {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("send line");
        self.writer.flush().await.expect("flush");
    }

    /// One line, stripped of CRLF. `None` on timeout or close.
    pub async fn recv(&mut self) -> Option<String> {
        let mut line = String::new();
        match timeout(Duration::from_secs(5), self.reader.read_line(&mut line)).await {
            Ok(Ok(0)) | Err(_) => None,
            Ok(Ok(_)) => Some(line.trim_end().to_string()),
            Ok(Err(_)) => None,
        }
    }

    /// Read lines until one matches, answering PINGs along the way.
    pub async fn expect<F: Fn(&str) -> bool>(&mut self, what: &str, pred: F) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            let Some(line) = self.recv().await else {
                panic!("connection closed while waiting for {what}");
            };
            if line.contains("PING") && line.starts_with("PING") {
                let token = line.split(':').next_back().unwrap_or("x").to_string();
                self.send(&format!("PONG :{token}")).await;
                continue;
            }
            if pred(&line) {
                return line;
            }
        }
        panic!("timed out waiting for {what}");
    }

    /// NICK/USER handshake; returns every line up to the MOTD terminator.
    pub async fn register(&mut self, nick: &str) -> Vec<String> {
        self.send(&format!("NICK {nick}")).await;
        self.send(&format!("USER {nick} 0 * :{nick} test")).await;
        let mut burst = Vec::new();
        loop {
            let Some(line) = self.recv().await else {
                panic!("connection closed during registration");
            };
            let done = line.contains(" 376 ") || line.contains(" 422 ");
            burst.push(line);
            if done {
                return burst;
            }
        }
    }

    pub async fn join(&mut self, channel: &str) {
        self.send(&format!("JOIN {channel}")).await;
        let what = format!("JOIN {channel} confirmation");
        self.expect(&what, |line| line.contains("JOIN") && line.contains(channel))
            .await;
        // Drain the NAMES burst.
        self.expect("end of NAMES", |line| line.contains(" 366 ")).await;
    }
}
