use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── Triggers ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TriggerKind {
    Message,
    Alarm,
    Ambient,
}

impl TriggerKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Alarm => "alarm",
            Self::Ambient => "ambient",
        }
    }

    pub(crate) fn from_db_str(s: &str) -> Self {
        match s {
            "alarm" => Self::Alarm,
            "ambient" => Self::Ambient,
            _ => Self::Message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TriggerSource {
    Telegram,
    Web,
    Api,
}

impl TriggerSource {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Web => "web",
            Self::Api => "api",
        }
    }

    pub(crate) fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "telegram" => Some(Self::Telegram),
            "web" => Some(Self::Web),
            "api" => Some(Self::Api),
            _ => None,
        }
    }
}

/// Fired-reminder details carried by a synthetic alarm trigger.
#[derive(Debug, Clone)]
pub(crate) struct ReminderFire {
    pub(crate) id: String,
    pub(crate) description: String,
}

/// One unit of work for the coordinator: a user message, a due reminder,
/// or an ambient tick.
#[derive(Debug, Clone)]
pub(crate) struct Trigger {
    pub(crate) kind: TriggerKind,
    pub(crate) payload: String,
    pub(crate) source: Option<TriggerSource>,
    pub(crate) chat_id: Option<i64>,
    pub(crate) reminder: Option<ReminderFire>,
    pub(crate) received_at: i64,
}

impl Trigger {
    pub(crate) fn message(payload: String, source: TriggerSource, chat_id: Option<i64>, now: i64) -> Self {
        Trigger {
            kind: TriggerKind::Message,
            payload,
            source: Some(source),
            chat_id,
            reminder: None,
            received_at: now,
        }
    }

    pub(crate) fn alarm(fire: ReminderFire, payload: String, now: i64) -> Self {
        Trigger {
            kind: TriggerKind::Alarm,
            payload,
            source: None,
            chat_id: None,
            reminder: Some(fire),
            received_at: now,
        }
    }

    pub(crate) fn ambient(now: i64) -> Self {
        Trigger {
            kind: TriggerKind::Ambient,
            payload: String::new(),
            source: None,
            chat_id: None,
            reminder: None,
            received_at: now,
        }
    }
}

// ── Stored entities ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    User,
    Assistant,
}

impl Role {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub(crate) fn from_db_str(s: &str) -> Self {
        match s {
            "assistant" => Self::Assistant,
            _ => Self::User,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Message {
    pub(crate) id: String,
    pub(crate) role: Role,
    pub(crate) content: String,
    pub(crate) timestamp: i64,
    pub(crate) trigger: TriggerKind,
    pub(crate) source: Option<TriggerSource>,
}

#[derive(Debug, Clone)]
pub(crate) struct JournalEntry {
    pub(crate) id: String,
    pub(crate) timestamp: i64,
    pub(crate) topic: String,
    pub(crate) content: String,
}

#[derive(Debug, Clone)]
pub(crate) struct StateFile {
    pub(crate) name: String,
    pub(crate) content: String,
    pub(crate) updated_at: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct Topic {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) content: String,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
}

/// A reminder holds exactly one of `cron_expression` (recurring) or
/// `scheduled_time` (one-shot). `Store::save_reminder` enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Reminder {
    pub(crate) id: String,
    pub(crate) description: String,
    pub(crate) payload: String,
    #[serde(default)]
    pub(crate) cron_expression: Option<String>,
    #[serde(default)]
    pub(crate) scheduled_time: Option<i64>,
    pub(crate) created_at: i64,
}

impl Reminder {
    pub(crate) fn is_recurring(&self) -> bool {
        self.cron_expression.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Summary {
    pub(crate) id: String,
    pub(crate) timestamp: i64,
    pub(crate) content: String,
    pub(crate) notes: Option<String>,
    pub(crate) key_decisions: Vec<String>,
    pub(crate) open_threads: Vec<String>,
    pub(crate) learned_patterns: Vec<String>,
    pub(crate) from_timestamp: i64,
    pub(crate) to_timestamp: i64,
    pub(crate) message_count: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct CodingTaskState {
    pub(crate) repo_url: String,
    pub(crate) branch: String,
    pub(crate) session_id: Option<String>,
    pub(crate) last_task: String,
    pub(crate) last_timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub(crate) struct ConversationStats {
    pub(crate) count: usize,
    pub(crate) approx_tokens: usize,
    pub(crate) needs_compaction: bool,
}

// ── Tool execution ───────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct ToolExecution {
    pub(crate) output: String,
    pub(crate) details: serde_json::Value,
    pub(crate) is_error: bool,
}

impl ToolExecution {
    pub(crate) fn text(output: impl Into<String>) -> Self {
        ToolExecution {
            output: output.into(),
            details: serde_json::Value::Null,
            is_error: false,
        }
    }
}

// ── Coordinator events ───────────────────────────────────────────────────

/// Everything the coordinator actor can receive over its single channel.
pub(crate) enum Event {
    Trigger(Trigger),
    /// A schedule_* tool mutated the reminder set; recompute the alarm.
    Reschedule,
    Completion(TurnCompletion),
}

/// Sent by the turn worker thread when an engine round trip finishes.
pub(crate) struct TurnCompletion {
    pub(crate) trigger: Trigger,
    pub(crate) session_id: Option<String>,
    pub(crate) result: Result<String, String>,
}

// ── Engine wire types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EnginePart {
    #[serde(rename = "type")]
    pub(crate) part_type: String,
    #[serde(default)]
    pub(crate) text: Option<String>,
}

impl EnginePart {
    pub(crate) fn text_part(text: impl Into<String>) -> Self {
        EnginePart {
            part_type: "text".to_string(),
            text: Some(text.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct EnginePromptResponse {
    #[serde(default)]
    pub(crate) parts: Vec<EnginePart>,
}

// ── Uplink frames ────────────────────────────────────────────────────────

/// One frame on the inverted-WebSocket bridge, either direction.
/// Bridge → orchestrator carries `request`; the reply carries `response`
/// or `error`. Headers ride along untouched (the bridge is stateless with
/// respect to MCP session ids).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UplinkFrame {
    pub(crate) request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) request: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub(crate) headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) http_method: Option<String>,
}

impl UplinkFrame {
    pub(crate) fn request(
        request_id: String,
        request: serde_json::Value,
        headers: HashMap<String, String>,
        http_method: &str,
    ) -> Self {
        UplinkFrame {
            request_id,
            request: Some(request),
            response: None,
            error: None,
            headers,
            status: None,
            http_method: Some(http_method.to_string()),
        }
    }

    pub(crate) fn response(request_id: String, response: serde_json::Value) -> Self {
        UplinkFrame {
            request_id,
            request: None,
            response: Some(response),
            error: None,
            headers: HashMap::new(),
            status: None,
            http_method: None,
        }
    }

    pub(crate) fn error(request_id: String, error: impl Into<String>) -> Self {
        UplinkFrame {
            request_id,
            request: None,
            response: None,
            error: Some(error.into()),
            headers: HashMap::new(),
            status: None,
            http_method: None,
        }
    }
}
