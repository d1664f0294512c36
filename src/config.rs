use std::path::PathBuf;

use crate::{env_i64, env_optional, env_u64, env_usize};

pub(crate) const DEFAULT_COMPACT_THRESHOLD: usize = 50_000;

/// Runtime configuration, resolved from the environment once at startup.
/// Values are opaque secrets or plain knobs; nothing here is persisted.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) db_path: PathBuf,

    // Chat platform
    pub(crate) telegram_bot_token: Option<String>,
    pub(crate) owner_chat_id: Option<i64>,
    pub(crate) webhook_secret: Option<String>,
    pub(crate) allowed_user_ids: Vec<i64>,
    pub(crate) intake_bind: String,
    pub(crate) intake_port: u16,

    // Sandbox + engine
    pub(crate) sandbox_base_url: String,
    pub(crate) sandbox_ws_port: u16,
    pub(crate) engine_base_url: String,
    pub(crate) engine_model: String,
    pub(crate) fast_model: String,
    pub(crate) anthropic_api_key: Option<String>,
    pub(crate) anthropic_base_url: String,

    // Embedder
    pub(crate) embedder_url: Option<String>,
    pub(crate) embedder_api_key: Option<String>,
    pub(crate) embedder_model: String,

    // Web tools
    pub(crate) brave_api_key: Option<String>,
    pub(crate) render_url: Option<String>,

    // GitHub App (coding tasks)
    pub(crate) github_client_id: Option<String>,
    pub(crate) github_private_key_pem: Option<String>,
    pub(crate) github_installation_id: Option<String>,

    // Bridge ports (inside the sandbox)
    pub(crate) bridge_http_port: u16,
    pub(crate) bridge_ws_port: u16,

    // Knobs
    pub(crate) compact_threshold: usize,
    pub(crate) ambient_interval_mins: u64,
    pub(crate) engine_timeout_secs: u64,
    pub(crate) mcp_timeout_secs: u64,
    pub(crate) web_timeout_secs: u64,
    pub(crate) embed_timeout_secs: u64,
    pub(crate) stale_hours: i64,
}

impl Config {
    pub(crate) fn from_env() -> Config {
        let allowed_user_ids = env_optional("OUTPOST_ALLOWED_USERS")
            .map(|raw| {
                raw.split(',')
                    .filter_map(|part| part.trim().parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default();

        Config {
            db_path: PathBuf::from(
                env_optional("OUTPOST_DB").unwrap_or_else(|| "./outpost.sqlite".to_string()),
            ),
            telegram_bot_token: env_optional("TELEGRAM_BOT_TOKEN"),
            owner_chat_id: env_optional("OUTPOST_OWNER_CHAT_ID").and_then(|v| v.parse().ok()),
            webhook_secret: env_optional("OUTPOST_WEBHOOK_SECRET"),
            allowed_user_ids,
            intake_bind: env_optional("OUTPOST_BIND").unwrap_or_else(|| "0.0.0.0".to_string()),
            intake_port: env_u64("OUTPOST_PORT", 8787) as u16,
            sandbox_base_url: env_optional("SANDBOX_BASE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:7000".to_string()),
            sandbox_ws_port: env_u64("SANDBOX_WS_PORT", 7781) as u16,
            engine_base_url: env_optional("ENGINE_BASE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:4096".to_string()),
            engine_model: env_optional("ENGINE_MODEL")
                .unwrap_or_else(|| "claude-sonnet-4-5".to_string()),
            fast_model: env_optional("OUTPOST_FAST_MODEL")
                .unwrap_or_else(|| "claude-haiku-4-5".to_string()),
            anthropic_api_key: env_optional("ANTHROPIC_API_KEY"),
            anthropic_base_url: env_optional("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".to_string()),
            embedder_url: env_optional("EMBEDDER_URL"),
            embedder_api_key: env_optional("EMBEDDER_API_KEY"),
            embedder_model: env_optional("EMBEDDER_MODEL")
                .unwrap_or_else(|| "bge-base-en-v1.5".to_string()),
            brave_api_key: env_optional("BRAVE_API_KEY"),
            render_url: env_optional("OUTPOST_RENDER_URL"),
            github_client_id: env_optional("GITHUB_CLIENT_ID"),
            github_private_key_pem: env_optional("GITHUB_PRIVATE_KEY_PEM"),
            github_installation_id: env_optional("GITHUB_INSTALLATION_ID"),
            bridge_http_port: env_u64("BRIDGE_HTTP_PORT", 7780) as u16,
            bridge_ws_port: env_u64("BRIDGE_WS_PORT", 7781) as u16,
            compact_threshold: env_usize("OUTPOST_COMPACT_THRESHOLD", DEFAULT_COMPACT_THRESHOLD),
            ambient_interval_mins: env_u64("OUTPOST_AMBIENT_INTERVAL_MINS", 0),
            engine_timeout_secs: env_u64("OUTPOST_ENGINE_TIMEOUT_SECS", 600),
            mcp_timeout_secs: env_u64("OUTPOST_MCP_TIMEOUT_SECS", 30),
            web_timeout_secs: env_u64("OUTPOST_WEB_TIMEOUT_SECS", 30),
            embed_timeout_secs: env_u64("OUTPOST_EMBED_TIMEOUT_SECS", 10),
            stale_hours: env_i64("OUTPOST_CODING_STALE_HOURS", 24),
        }
    }

    /// Host part of the sandbox base URL, for deriving the uplink address.
    pub(crate) fn sandbox_host(&self) -> String {
        url::Url::parse(&self.sandbox_base_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub(crate) fn uplink_ws_url(&self) -> String {
        format!("ws://{}:{}/", self.sandbox_host(), self.sandbox_ws_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_host_and_ws_url() {
        let mut cfg = Config::from_env();
        cfg.sandbox_base_url = "http://10.1.2.3:7000".to_string();
        cfg.sandbox_ws_port = 7781;
        assert_eq!(cfg.sandbox_host(), "10.1.2.3");
        assert_eq!(cfg.uplink_ws_url(), "ws://10.1.2.3:7781/");
    }
}
