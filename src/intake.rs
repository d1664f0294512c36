//! Trigger intake: the chat-platform webhook. Verifies the shared secret
//! with a constant-time compare, enforces the user allow-list, handles the
//! /clear command inline, and turns everything else into message triggers
//! for the coordinator. The platform retries on non-200, so every handled
//! request answers 200; only a bad secret earns a 401.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::mpsc;
use std::sync::Arc;

use serde::Deserialize;
use tiny_http::{Method, Response, Server};

use crate::{
    constant_time_eq, now_ms, AllowedUrls, Config, Event, Outbound, Store, Trigger, TriggerSource,
};

pub(crate) const SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";
const DEDUP_WINDOW: usize = 64;

// ── Platform update shapes ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WebhookUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<IncomingMessage>,
    #[serde(default)]
    edited_message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    chat: IncomingChat,
    #[serde(default)]
    from: Option<IncomingUser>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IncomingChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct IncomingUser {
    id: i64,
}

#[derive(Debug, PartialEq)]
pub(crate) struct ParsedUpdate {
    pub(crate) update_id: i64,
    pub(crate) chat_id: i64,
    pub(crate) user_id: Option<i64>,
    pub(crate) text: String,
}

pub(crate) fn parse_update(body: &str) -> Option<ParsedUpdate> {
    let update: WebhookUpdate = serde_json::from_str(body).ok()?;
    let message = update.message.or(update.edited_message)?;
    let text = message.text?.trim().to_string();
    if text.is_empty() {
        return None;
    }
    Some(ParsedUpdate {
        update_id: update.update_id,
        chat_id: message.chat.id,
        user_id: message.from.map(|u| u.id),
        text,
    })
}

pub(crate) fn is_clear_command(text: &str) -> bool {
    let head = text.trim().split_whitespace().next().unwrap_or("");
    head == "/clear" || head.starts_with("/clear@")
}

// ── Redelivery dedup ─────────────────────────────────────────────────────

/// Ring of recently seen update ids; platforms redeliver updates whose 200
/// came back slowly.
pub(crate) struct UpdateDedup {
    seen: VecDeque<i64>,
}

impl UpdateDedup {
    pub(crate) fn new() -> UpdateDedup {
        UpdateDedup {
            seen: VecDeque::with_capacity(DEDUP_WINDOW),
        }
    }

    /// True when this id was already processed.
    pub(crate) fn check_and_insert(&mut self, update_id: i64) -> bool {
        if self.seen.contains(&update_id) {
            return true;
        }
        if self.seen.len() >= DEDUP_WINDOW {
            self.seen.pop_front();
        }
        self.seen.push_back(update_id);
        false
    }
}

// ── Server loop ──────────────────────────────────────────────────────────

pub(crate) fn run_intake(
    config: Arc<Config>,
    events: mpsc::Sender<Event>,
    allowed_urls: AllowedUrls,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.intake_bind, config.intake_port);
    let server = Server::http(&addr)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("server: {e}")))?;
    eprintln!("[intake] webhook listening on http://{addr}");
    if config.webhook_secret.is_none() {
        eprintln!("[intake] WARNING: no webhook secret configured; accepting unsigned updates");
    }

    let outbound = Outbound::from_config(&config);
    let mut dedup = UpdateDedup::new();

    for mut request in server.incoming_requests() {
        if *request.method() != Method::Post {
            let _ = request.respond(Response::from_string("ok"));
            continue;
        }

        if let Some(expected) = &config.webhook_secret {
            let presented = request
                .headers()
                .iter()
                .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(SECRET_HEADER))
                .map(|h| h.value.as_str().to_string())
                .unwrap_or_default();
            if !constant_time_eq(expected, &presented) {
                eprintln!("[intake] webhook secret mismatch; rejecting");
                let _ = request.respond(Response::from_string("unauthorized").with_status_code(401));
                continue;
            }
        }

        let mut body = String::new();
        if request.as_reader().read_to_string(&mut body).is_err() {
            let _ = request.respond(Response::from_string("ok"));
            continue;
        }

        let Some(update) = parse_update(&body) else {
            let _ = request.respond(Response::from_string("ok"));
            continue;
        };

        if dedup.check_and_insert(update.update_id) {
            let _ = request.respond(Response::from_string("ok"));
            continue;
        }

        if !config.allowed_user_ids.is_empty() {
            let permitted = update
                .user_id
                .map(|id| config.allowed_user_ids.contains(&id))
                .unwrap_or(false);
            if !permitted {
                eprintln!(
                    "[intake] ignoring update from disallowed user {:?}",
                    update.user_id
                );
                let _ = request.respond(Response::from_string("ok"));
                continue;
            }
        }

        if is_clear_command(&update.text) {
            match Store::open(&config.db_path) {
                Ok(store) => match store.clear_messages() {
                    Ok(deleted) => {
                        eprintln!("[intake] /clear dropped {deleted} messages");
                        let _ = outbound.send("Conversation cleared.", Some(update.chat_id), None);
                    }
                    Err(err) => eprintln!("[intake] /clear failed: {err}"),
                },
                Err(err) => eprintln!("[intake] /clear store open failed: {err}"),
            }
            let _ = request.respond(Response::from_string("ok"));
            continue;
        }

        // URLs the user pasted become fetchable for this process lifetime
        allowed_urls.register_from_text(&update.text);

        let trigger = Trigger::message(
            update.text,
            TriggerSource::Telegram,
            Some(update.chat_id),
            now_ms(),
        );
        if events.send(Event::Trigger(trigger)).is_err() {
            eprintln!("[intake] coordinator channel closed; exiting");
            break;
        }
        let _ = request.respond(Response::from_string("ok"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_message() {
        let body = r#"{
            "update_id": 42,
            "message": {
                "chat": {"id": 777},
                "from": {"id": 101, "first_name": "Ada"},
                "text": "My name is Ada."
            }
        }"#;
        let parsed = parse_update(body).unwrap();
        assert_eq!(parsed.update_id, 42);
        assert_eq!(parsed.chat_id, 777);
        assert_eq!(parsed.user_id, Some(101));
        assert_eq!(parsed.text, "My name is Ada.");
    }

    #[test]
    fn test_parse_update_edited_and_empty() {
        let edited = r#"{"update_id": 1, "edited_message": {"chat": {"id": 5}, "text": "fixed"}}"#;
        assert_eq!(parse_update(edited).unwrap().text, "fixed");

        assert!(parse_update(r#"{"update_id": 2}"#).is_none());
        assert!(parse_update(r#"{"update_id": 3, "message": {"chat": {"id": 5}, "text": "  "}}"#).is_none());
        assert!(parse_update("not json").is_none());
    }

    #[test]
    fn test_parse_update_tolerates_unknown_fields() {
        let body = r#"{
            "update_id": 9,
            "message": {
                "message_id": 55,
                "date": 1700000000,
                "chat": {"id": 1, "type": "private"},
                "from": {"id": 2, "is_bot": false, "username": "ada"},
                "text": "hi",
                "entities": [{"type": "bold", "offset": 0, "length": 2}]
            }
        }"#;
        let parsed = parse_update(body).unwrap();
        assert_eq!(parsed.text, "hi");
        assert_eq!(parsed.user_id, Some(2));
    }

    #[test]
    fn test_is_clear_command() {
        assert!(is_clear_command("/clear"));
        assert!(is_clear_command("  /clear  "));
        assert!(is_clear_command("/clear@outpost_bot"));
        assert!(!is_clear_command("/clearly not"));
        assert!(!is_clear_command("please /clear"));
    }

    #[test]
    fn test_update_dedup_ring() {
        let mut dedup = UpdateDedup::new();
        assert!(!dedup.check_and_insert(1));
        assert!(dedup.check_and_insert(1));
        for id in 2..(2 + DEDUP_WINDOW as i64) {
            assert!(!dedup.check_and_insert(id));
        }
        // id 1 was evicted by the window rollover
        assert!(!dedup.check_and_insert(1));
    }
}
