//! Outbound chat sink (Telegram). Long texts are chunked below the platform
//! limit; each send tries Markdown first and falls back to plain text when
//! the platform rejects the formatting. Without a bot token the sink is a
//! logged no-op so headless runs don't fail.

use std::time::Duration;

use crate::Config;

const TELEGRAM_CHUNK_CHARS: usize = 3_900;
const SEND_TIMEOUT_MS: u64 = 120_000;

#[derive(Clone)]
pub(crate) struct Outbound {
    base_url: Option<String>,
    owner_chat_id: Option<i64>,
}

impl Outbound {
    pub(crate) fn from_config(config: &Config) -> Outbound {
        let base_url = config.telegram_bot_token.as_ref().map(|token| {
            match std::env::var("TELEGRAM_API_BASE") {
                Ok(base) => format!("{base}/bot{token}"),
                Err(_) => format!("https://api.telegram.org/bot{token}"),
            }
        });
        Outbound {
            base_url,
            owner_chat_id: config.owner_chat_id,
        }
    }

    /// A sink that drops everything. Used by tests and tool contexts that
    /// must never reach the network.
    #[cfg(test)]
    pub(crate) fn disabled() -> Outbound {
        Outbound {
            base_url: None,
            owner_chat_id: None,
        }
    }

    fn agent() -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(SEND_TIMEOUT_MS))
            .timeout_read(Duration::from_millis(SEND_TIMEOUT_MS))
            .timeout_write(Duration::from_millis(SEND_TIMEOUT_MS))
            .build()
    }

    /// Send `text`, defaulting to the owner chat when no chat id is given.
    pub(crate) fn send(
        &self,
        text: &str,
        chat_id: Option<i64>,
        reply_to: Option<i64>,
    ) -> Result<(), String> {
        let Some(base_url) = &self.base_url else {
            eprintln!("[outbound] no bot token configured; dropping message");
            return Ok(());
        };
        let Some(chat_id) = chat_id.or(self.owner_chat_id) else {
            eprintln!("[outbound] no chat id and no owner configured; dropping message");
            return Ok(());
        };

        let agent = Self::agent();
        let url = format!("{base_url}/sendMessage");
        for (i, chunk) in split_text_chunks(text, TELEGRAM_CHUNK_CHARS).iter().enumerate() {
            let mut payload = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "Markdown"
            });
            if i == 0 {
                if let Some(mid) = reply_to {
                    payload["reply_to_message_id"] = serde_json::json!(mid);
                    payload["allow_sending_without_reply"] = serde_json::json!(true);
                }
            }
            let response = agent
                .post(&url)
                .set("content-type", "application/json")
                .send_json(payload);
            if response.is_err() {
                // Markdown rejected or transient failure: retry once, plain
                let mut plain = serde_json::json!({
                    "chat_id": chat_id,
                    "text": chunk
                });
                if i == 0 {
                    if let Some(mid) = reply_to {
                        plain["reply_to_message_id"] = serde_json::json!(mid);
                        plain["allow_sending_without_reply"] = serde_json::json!(true);
                    }
                }
                agent
                    .post(&url)
                    .set("content-type", "application/json")
                    .send_json(plain)
                    .map_err(|e| format!("telegram send failed: {e}"))?;
            }
        }
        Ok(())
    }

    pub(crate) fn send_typing(&self, chat_id: Option<i64>) {
        let Some(base_url) = &self.base_url else { return };
        let Some(chat_id) = chat_id.or(self.owner_chat_id) else {
            return;
        };
        let payload = serde_json::json!({"chat_id": chat_id, "action": "typing"});
        let _ = Self::agent()
            .post(&format!("{base_url}/sendChatAction"))
            .set("content-type", "application/json")
            .send_json(payload);
    }
}

pub(crate) fn split_text_chunks(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;
    for ch in text.chars() {
        if count >= max_chars {
            chunks.push(current);
            current = String::new();
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}
