//! Client for the reasoning engine's session API (served from inside the
//! sandbox). The orchestrator holds at most one live session id at a time;
//! this client only speaks the wire contract: create, prompt, get, abort.
//!
//! A prompt call returns when the session goes idle, so callers treat the
//! return as the idle event.

use std::thread;
use std::time::Duration;

use crate::{jitter_ratio, Config, EnginePart, EnginePromptResponse};

pub(crate) struct EngineClient {
    base_url: String,
    model: String,
    prompt_timeout: Duration,
    control_timeout: Duration,
}

impl EngineClient {
    pub(crate) fn from_config(config: &Config) -> EngineClient {
        EngineClient {
            base_url: config.engine_base_url.trim_end_matches('/').to_string(),
            model: config.engine_model.clone(),
            prompt_timeout: Duration::from_secs(config.engine_timeout_secs),
            control_timeout: Duration::from_secs(30),
        }
    }

    fn agent(&self, timeout: Duration) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build()
    }

    /// POST /session → {id}. One retry on transport errors.
    pub(crate) fn session_create(
        &self,
        title: &str,
        directory: Option<&str>,
    ) -> Result<String, String> {
        let mut payload = serde_json::json!({ "title": title });
        if let Some(dir) = directory {
            payload["directory"] = serde_json::json!(dir);
        }
        let url = format!("{}/session", self.base_url);
        let agent = self.agent(self.control_timeout);

        for attempt in 0..2 {
            match agent
                .post(&url)
                .set("content-type", "application/json")
                .send_json(payload.clone())
            {
                Ok(response) => {
                    let body: serde_json::Value = response
                        .into_json()
                        .map_err(|e| format!("engine create response: {e}"))?;
                    return body
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .ok_or_else(|| "engine create response missing id".to_string());
                }
                Err(ureq::Error::Status(code, response)) => {
                    let text = response.into_string().unwrap_or_default();
                    return Err(format!("engine unavailable: create failed {code}: {text}"));
                }
                Err(err) => {
                    if attempt == 0 {
                        let delay = 0.5 * (1.0 + jitter_ratio());
                        thread::sleep(Duration::from_secs_f64(delay));
                        continue;
                    }
                    return Err(format!("engine unavailable: {err}"));
                }
            }
        }
        unreachable!("retry loop returns")
    }

    /// POST /session/{id}/prompt with `system` then `dynamic+trigger` parts.
    /// Blocks until the engine finishes the turn. Returns the concatenated
    /// text parts in order.
    pub(crate) fn session_prompt(
        &self,
        session_id: &str,
        directory: Option<&str>,
        parts: Vec<EnginePart>,
    ) -> Result<String, String> {
        let mut payload = serde_json::json!({
            "body": { "model": self.model, "parts": parts },
        });
        if let Some(dir) = directory {
            payload["directory"] = serde_json::json!(dir);
        }
        let url = format!("{}/session/{}/prompt", self.base_url, session_id);
        let response = self
            .agent(self.prompt_timeout)
            .post(&url)
            .set("content-type", "application/json")
            .send_json(payload)
            .map_err(|e| match e {
                ureq::Error::Status(404, _) => "engine session missing".to_string(),
                other => format!("engine unavailable: {other}"),
            })?;
        let body: EnginePromptResponse = response
            .into_json()
            .map_err(|e| format!("engine prompt response: {e}"))?;
        Ok(extract_text(&body.parts))
    }

    /// GET /session/{id}. None when the engine no longer knows the session.
    pub(crate) fn session_get(&self, session_id: &str) -> Option<serde_json::Value> {
        let url = format!("{}/session/{}", self.base_url, session_id);
        match self.agent(self.control_timeout).get(&url).call() {
            Ok(response) => response.into_json().ok().filter(|v: &serde_json::Value| !v.is_null()),
            Err(_) => None,
        }
    }

    /// POST /session/{id}/abort. Best effort: the orchestrator proceeds
    /// either way and a second abort of the same session is harmless.
    pub(crate) fn session_abort(&self, session_id: &str) -> bool {
        let url = format!("{}/session/{}/abort", self.base_url, session_id);
        match self.agent(self.control_timeout).post(&url).send_json(serde_json::json!({})) {
            Ok(_) => true,
            Err(ureq::Error::Status(code, _)) => {
                eprintln!("[engine] abort of {session_id} returned {code}");
                false
            }
            Err(err) => {
                eprintln!("[engine] abort of {session_id} failed: {err}");
                false
            }
        }
    }
}

/// Text parts in order, joined with newlines. Non-text parts are skipped.
pub(crate) fn extract_text(parts: &[EnginePart]) -> String {
    let texts: Vec<&str> = parts
        .iter()
        .filter(|p| p.part_type == "text")
        .filter_map(|p| p.text.as_deref())
        .filter(|t| !t.is_empty())
        .collect();
    texts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_joins_in_order() {
        let parts = vec![
            EnginePart::text_part("first"),
            EnginePart {
                part_type: "tool_use".into(),
                text: None,
            },
            EnginePart::text_part("second"),
        ];
        assert_eq!(extract_text(&parts), "first\nsecond");
    }

    #[test]
    fn test_extract_text_empty() {
        assert_eq!(extract_text(&[]), "");
        let only_tools = vec![EnginePart {
            part_type: "step".into(),
            text: None,
        }];
        assert_eq!(extract_text(&only_tools), "");
    }
}
