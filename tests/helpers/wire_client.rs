//! Raw line client for E2E tests.
//!
//! Spawns the crosspulse binary and talks to it line by line over its
//! stdin/stdout, without going through the library.

// Shared across test binaries; not every binary uses every method.
#![allow(dead_code)]

use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Path of the binary under test.
///
/// `CARGO_BIN_EXE_crosspulse` is set by Cargo for integration tests.
pub fn binary() -> &'static str {
    env!("CARGO_BIN_EXE_crosspulse")
}

pub struct WireClient {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<String>,
}

impl WireClient {
    /// Spawn `crosspulse listen`.
    pub fn listen() -> Self {
        let mut child = Command::new(binary())
            .arg("listen")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to spawn crosspulse binary");

        let stdin = child.stdin.take().expect("Failed to get stdin");
        let stdout = child.stdout.take().expect("Failed to get stdout");

        // Reader thread so receives can time out instead of hanging the test
        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Self {
            child,
            stdin: Some(stdin),
            lines,
        }
    }

    pub fn send_line(&mut self, line: &str) {
        let stdin = self.stdin.as_mut().expect("stdin already closed");
        writeln!(stdin, "{}", line).expect("Failed to write line");
        stdin.flush().expect("Failed to flush stdin");
    }

    pub fn send(&mut self, message: &Value) {
        self.send_line(&message.to_string());
    }

    /// Next line from the binary, parsed as JSON.
    pub fn receive(&mut self) -> Value {
        let line = self
            .lines
            .recv_timeout(REPLY_TIMEOUT)
            .expect("No line received in time");
        serde_json::from_str(&line).unwrap_or_else(|e| panic!("Invalid JSON {:?}: {}", line, e))
    }

    /// Whether any line arrives within `wait`.
    pub fn receive_within(&mut self, wait: Duration) -> Option<Value> {
        self.lines
            .recv_timeout(wait)
            .ok()
            .map(|line| serde_json::from_str(&line).expect("Invalid JSON"))
    }

    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Poll until the process exits or `timeout` passes.
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait().expect("try_wait failed") {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }
}

impl Drop for WireClient {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
