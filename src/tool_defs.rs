//! Declarative tool descriptors advertised over MCP. Names and field names
//! are wire-stable; the dispatcher validates arguments against the
//! `required` lists declared here.

use serde_json;

pub(crate) fn tool_definitions_json() -> Vec<serde_json::Value> {
    vec![
        serde_json::json!({
            "name": "journal_write",
            "description": "Append an observation to the journal. Entries are permanent and searchable by meaning.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "topic": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["topic", "content"]
            }
        }),
        serde_json::json!({
            "name": "journal_search",
            "description": "Semantic search over journal entries.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "k": { "type": "integer" }
                },
                "required": ["query"]
            }
        }),
        serde_json::json!({
            "name": "topic_write",
            "description": "Create or overwrite a named topic (a distilled piece of knowledge).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["name", "content"]
            }
        }),
        serde_json::json!({
            "name": "topic_get",
            "description": "Read one topic by name.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" }
                },
                "required": ["name"]
            }
        }),
        serde_json::json!({
            "name": "topic_list",
            "description": "List all topic names with their last-updated times.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        serde_json::json!({
            "name": "topic_search",
            "description": "Semantic search over topics.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "k": { "type": "integer" }
                },
                "required": ["query"]
            }
        }),
        serde_json::json!({
            "name": "state_read",
            "description": "Read a state file (identity, today, user, or any custom name).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" }
                },
                "required": ["name"]
            }
        }),
        serde_json::json!({
            "name": "state_write",
            "description": "Overwrite a state file. State files are injected into every prompt.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["name", "content"]
            }
        }),
        serde_json::json!({
            "name": "schedule_recurring",
            "description": "Schedule a recurring reminder from a 5-field cron expression (minute hour dom month dow, 0=Sunday).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "id": { "type": "string" },
                    "description": { "type": "string" },
                    "cron": { "type": "string" },
                    "payload": { "type": "string" }
                },
                "required": ["description", "cron"]
            }
        }),
        serde_json::json!({
            "name": "schedule_once",
            "description": "Schedule a one-shot reminder at an ISO datetime (UTC unless an offset is given).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "id": { "type": "string" },
                    "description": { "type": "string" },
                    "datetime": { "type": "string" },
                    "payload": { "type": "string" }
                },
                "required": ["description", "datetime"]
            }
        }),
        serde_json::json!({
            "name": "cancel_reminder",
            "description": "Cancel a reminder by id. Cancelling an unknown id is harmless.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "id": { "type": "string" }
                },
                "required": ["id"]
            }
        }),
        serde_json::json!({
            "name": "list_reminders",
            "description": "List all pending reminders.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        serde_json::json!({
            "name": "send_telegram",
            "description": "Send a message to the user on Telegram. The only way alarm/ambient turns can reach the user.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "message": { "type": "string" },
                    "chat_id": { "type": "integer" }
                },
                "required": ["message"]
            }
        }),
        serde_json::json!({
            "name": "save_conversation_summary",
            "description": "Compact the conversation: write a summary and atomically prune the absorbed messages.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "summary": { "type": "string" },
                    "notes": { "type": "string" },
                    "key_decisions": { "type": "array", "items": { "type": "string" } },
                    "open_threads": { "type": "array", "items": { "type": "string" } },
                    "learned_patterns": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["summary"]
            }
        }),
        serde_json::json!({
            "name": "get_recent_summaries",
            "description": "Fetch the most recent conversation summaries (default 3, max 20).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "count": { "type": "integer" }
                }
            }
        }),
        serde_json::json!({
            "name": "web_search",
            "description": "Web search. Result URLs become fetchable with fetch_page.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "count": { "type": "integer" }
                },
                "required": ["query"]
            }
        }),
        serde_json::json!({
            "name": "news_search",
            "description": "News search. Result URLs become fetchable with fetch_page.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "count": { "type": "integer" }
                },
                "required": ["query"]
            }
        }),
        serde_json::json!({
            "name": "fetch_page",
            "description": "Fetch a page. Only URLs from user messages or prior search results are allowed.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "url": { "type": "string" },
                    "wait_for_js": { "type": "boolean" }
                },
                "required": ["url"]
            }
        }),
        serde_json::json!({
            "name": "run_coding_task",
            "description": "Delegate a coding task on a git repository to a sandboxed coding session. Continues recent work on the same repo when that makes sense.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "repo_url": { "type": "string" },
                    "task": { "type": "string" }
                },
                "required": ["repo_url", "task"]
            }
        }),
    ]
}

/// Required argument names for a tool, straight from the advertised schema.
pub(crate) fn required_fields(name: &str) -> Option<Vec<String>> {
    tool_definitions_json().into_iter().find_map(|tool| {
        if tool.get("name").and_then(|v| v.as_str()) != Some(name) {
            return None;
        }
        let required = tool
            .get("inputSchema")
            .and_then(|s| s.get("required"))
            .and_then(|r| r.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Some(required)
    })
}

pub(crate) fn is_known_tool(name: &str) -> bool {
    required_fields(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_stable_names_present() {
        let names: Vec<String> = tool_definitions_json()
            .iter()
            .filter_map(|t| t.get("name").and_then(|v| v.as_str()).map(String::from))
            .collect();
        for expected in [
            "journal_write",
            "journal_search",
            "topic_write",
            "topic_get",
            "topic_list",
            "topic_search",
            "state_read",
            "state_write",
            "schedule_recurring",
            "schedule_once",
            "cancel_reminder",
            "list_reminders",
            "send_telegram",
            "save_conversation_summary",
            "get_recent_summaries",
            "web_search",
            "news_search",
            "fetch_page",
            "run_coding_task",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn test_required_fields_lookup() {
        assert_eq!(
            required_fields("journal_write").unwrap(),
            vec!["topic".to_string(), "content".to_string()]
        );
        assert!(required_fields("topic_list").unwrap().is_empty());
        assert!(required_fields("no_such_tool").is_none());
        assert!(is_known_tool("fetch_page"));
        assert!(!is_known_tool("fetch_pages"));
    }

    #[test]
    fn test_every_tool_has_object_schema() {
        for tool in tool_definitions_json() {
            let schema = tool.get("inputSchema").expect("inputSchema");
            assert_eq!(schema.get("type").and_then(|v| v.as_str()), Some("object"));
            assert!(tool.get("description").and_then(|v| v.as_str()).is_some());
        }
    }
}
