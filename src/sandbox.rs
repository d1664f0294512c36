//! Adapter for the sandboxed execution environment. The sandbox is opaque:
//! it can run processes, execute shell commands, and accept a TCP WebSocket
//! on an internal port. Everything here goes through its small control API.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use crate::Config;

pub(crate) const READINESS_POLLS: usize = 30;

#[derive(Debug)]
pub(crate) struct ExecResult {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) exit_code: i64,
}

impl ExecResult {
    pub(crate) fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Clone)]
pub(crate) struct SandboxHandle {
    base_url: String,
    ws_url: String,
}

impl SandboxHandle {
    pub(crate) fn from_config(config: &Config) -> SandboxHandle {
        SandboxHandle {
            base_url: config.sandbox_base_url.trim_end_matches('/').to_string(),
            ws_url: config.uplink_ws_url(),
        }
    }

    pub(crate) fn ws_url(&self) -> &str {
        &self.ws_url
    }

    fn agent(timeout_secs: u64) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(timeout_secs))
            .timeout_write(Duration::from_secs(timeout_secs))
            .build()
    }

    /// Ask the sandbox to start (or confirm) its workload. Best effort; the
    /// readiness poll is what actually gates progress.
    pub(crate) fn wake(&self) {
        let url = format!("{}/wake", self.base_url);
        if let Err(err) = Self::agent(30).post(&url).send_json(serde_json::json!({})) {
            eprintln!("[sandbox] wake: {err}");
        }
    }

    /// Run a shell command inside the sandbox.
    pub(crate) fn exec(&self, command: &str, timeout_secs: u64) -> Result<ExecResult, String> {
        let url = format!("{}/exec", self.base_url);
        let payload = serde_json::json!({
            "command": command,
            "timeout": timeout_secs,
        });
        let response = Self::agent(timeout_secs + 10)
            .post(&url)
            .set("content-type", "application/json")
            .send_json(payload)
            .map_err(|e| format!("sandbox exec failed: {e}"))?;
        let body: serde_json::Value = response
            .into_json()
            .map_err(|e| format!("sandbox exec response: {e}"))?;
        Ok(ExecResult {
            stdout: body
                .get("stdout")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            stderr: body
                .get("stderr")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            exit_code: body.get("exit_code").and_then(|v| v.as_i64()).unwrap_or(-1),
        })
    }

    /// Poll `echo ready` until the sandbox answers, up to READINESS_POLLS
    /// attempts at one-second intervals.
    pub(crate) fn wait_ready(&self) -> Result<(), String> {
        for attempt in 1..=READINESS_POLLS {
            match self.exec("echo ready", 5) {
                Ok(result) if result.stdout.contains("ready") => return Ok(()),
                Ok(_) | Err(_) if attempt < READINESS_POLLS => {
                    thread::sleep(Duration::from_secs(1));
                }
                Ok(result) => {
                    return Err(format!(
                        "sandbox unavailable: readiness probe returned '{}'",
                        result.stdout.trim()
                    ))
                }
                Err(err) => return Err(format!("sandbox unavailable: {err}")),
            }
        }
        Err("sandbox unavailable: readiness polls exhausted".to_string())
    }

    /// Install environment secrets (API keys, tokens) for sandbox processes.
    pub(crate) fn install_secrets(&self, vars: &HashMap<String, String>) -> Result<(), String> {
        if vars.is_empty() {
            return Ok(());
        }
        let url = format!("{}/env", self.base_url);
        Self::agent(30)
            .post(&url)
            .set("content-type", "application/json")
            .send_json(serde_json::json!({ "vars": vars }))
            .map(|_| ())
            .map_err(|e| format!("sandbox env install failed: {e}"))
    }
}

/// Quote a value for safe interpolation into a sandbox shell command.
pub(crate) fn shell_quote(value: &str) -> String {
    shlex::try_quote(value)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| format!("'{}'", value.replace('\'', "'\\''")))
}
