//! Oracle backed by an external command.
//!
//! The request document is written to the child's stdin; its stdout is the
//! raw response.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use super::{DecisionOracle, OracleRequest};
use crate::config::OracleConfig;
use crate::error::OracleError;

const STDERR_CHARS: usize = 300;

pub struct CommandOracle {
    program: String,
    args: Vec<String>,
}

impl CommandOracle {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(cfg: &OracleConfig) -> Result<Self> {
        let (program, args) = cfg
            .command
            .split_first()
            .ok_or_else(|| anyhow!("oracle.command must be a non-empty array"))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

fn feed<W: Write + Send + 'static>(pipe: Option<W>, body: Vec<u8>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    thread::spawn(move || {
        if let Err(err) = pipe.write_all(&body) {
            warn!(error = %err, "oracle command closed stdin early");
        }
    });
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

impl DecisionOracle for CommandOracle {
    fn decide(&mut self, request: &OracleRequest, timeout: Duration) -> Result<String, OracleError> {
        let body = serde_json::to_vec(&request.to_json())
            .map_err(|err| OracleError::Transport(format!("encode request: {err}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| OracleError::Transport(format!("spawn {}: {err}", self.program)))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        // Frames are larger than a pipe buffer; the deadline must not wait on the child reading.
        feed(child.stdin.take(), body);

        let status = child
            .wait_timeout(timeout)
            .map_err(|err| OracleError::Transport(err.to_string()))?;
        let Some(status) = status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(OracleError::Timeout(timeout.as_secs()));
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(OracleError::Transport(format!(
                "{} exited with {}: {}",
                self.program,
                status.code().unwrap_or(1),
                stderr.trim().chars().take(STDERR_CHARS).collect::<String>()
            )));
        }
        let text = String::from_utf8_lossy(&stdout).into_owned();
        if text.trim().is_empty() {
            return Err(OracleError::Empty);
        }
        debug!(program = %self.program, chars = text.len(), "oracle command responded");
        Ok(text)
    }

    fn describe(&self) -> String {
        format!("command {}", self.program)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::annotations::AnnotationStore;

    fn request() -> OracleRequest {
        OracleRequest::new("goal", Vec::new(), &AnnotationStore::in_memory(), 8, None, vec![1, 2])
    }

    fn sh(script: &str) -> CommandOracle {
        CommandOracle::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn returns_stdout_after_reading_request() {
        let mut oracle = sh(r#"cat >/dev/null; printf '{"tool":"done","justification":"ok"}'"#);
        let out = oracle.decide(&request(), Duration::from_secs(10)).unwrap();
        assert_eq!(out, r#"{"tool":"done","justification":"ok"}"#);
    }

    #[test]
    fn request_document_reaches_stdin() {
        let mut oracle = sh("cat");
        let out = oracle.decide(&request(), Duration::from_secs(10)).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["goal"], "goal");
        assert_eq!(doc["current_png_base64"], "AQI=");
    }

    #[test]
    fn slow_command_times_out() {
        let mut oracle = sh("sleep 5");
        let err = oracle.decide(&request(), Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, OracleError::Timeout(_)));
    }

    #[test]
    fn timeout_holds_when_command_ignores_a_large_request() {
        let mut oracle = sh("sleep 5");
        let big = OracleRequest::new(
            "goal",
            Vec::new(),
            &AnnotationStore::in_memory(),
            8,
            None,
            vec![7u8; 2_000_000],
        );
        let started = Instant::now();
        let err = oracle.decide(&big, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, OracleError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn non_zero_exit_is_transport_error() {
        let mut oracle = sh("cat >/dev/null; echo boom >&2; exit 3");
        let err = oracle.decide(&request(), Duration::from_secs(10)).unwrap_err();
        match err {
            OracleError::Transport(message) => assert!(message.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
