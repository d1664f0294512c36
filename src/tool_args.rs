//! Typed argument structs for each tool, plus the validation step that runs
//! before dispatch: arguments must be an object carrying every field the
//! advertised schema marks required.

use serde::Deserialize;

use crate::required_fields;

#[derive(Debug, Deserialize)]
pub(crate) struct JournalWriteArgs {
    pub(crate) topic: String,
    pub(crate) content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchArgs {
    pub(crate) query: String,
    #[serde(default)]
    pub(crate) k: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TopicWriteArgs {
    pub(crate) name: String,
    pub(crate) content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NameArgs {
    pub(crate) name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StateWriteArgs {
    pub(crate) name: String,
    pub(crate) content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScheduleRecurringArgs {
    #[serde(default)]
    pub(crate) id: Option<String>,
    pub(crate) description: String,
    pub(crate) cron: String,
    #[serde(default)]
    pub(crate) payload: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScheduleOnceArgs {
    #[serde(default)]
    pub(crate) id: Option<String>,
    pub(crate) description: String,
    pub(crate) datetime: String,
    #[serde(default)]
    pub(crate) payload: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CancelReminderArgs {
    pub(crate) id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SendTelegramArgs {
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) chat_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SaveSummaryArgs {
    pub(crate) summary: String,
    #[serde(default)]
    pub(crate) notes: Option<String>,
    #[serde(default)]
    pub(crate) key_decisions: Vec<String>,
    #[serde(default)]
    pub(crate) open_threads: Vec<String>,
    #[serde(default)]
    pub(crate) learned_patterns: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RecentSummariesArgs {
    #[serde(default)]
    pub(crate) count: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WebSearchArgs {
    pub(crate) query: String,
    #[serde(default)]
    pub(crate) count: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FetchPageArgs {
    pub(crate) url: String,
    #[serde(default)]
    pub(crate) wait_for_js: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RunCodingTaskArgs {
    pub(crate) repo_url: String,
    pub(crate) task: String,
}

/// Check `args` against the advertised schema for `name`: must be a JSON
/// object, and every `required` field must be present and non-null.
pub(crate) fn validate_args(name: &str, args: &serde_json::Value) -> Result<(), String> {
    let required = required_fields(name).ok_or_else(|| format!("unknown tool: {name}"))?;
    let object = args
        .as_object()
        .ok_or_else(|| format!("invalid arguments for {name}: expected an object"))?;
    for field in &required {
        match object.get(field) {
            None | Some(serde_json::Value::Null) => {
                return Err(format!("invalid arguments for {name}: missing required field '{field}'"));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Deserialize args into the tool's typed struct with a readable error.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(
    name: &str,
    args: serde_json::Value,
) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid arguments for {name}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_required_fields() {
        let ok = serde_json::json!({"topic": "t", "content": "c"});
        assert!(validate_args("journal_write", &ok).is_ok());

        let missing = serde_json::json!({"topic": "t"});
        let err = validate_args("journal_write", &missing).unwrap_err();
        assert!(err.contains("content"));

        let null_field = serde_json::json!({"topic": "t", "content": null});
        assert!(validate_args("journal_write", &null_field).is_err());

        let not_object = serde_json::json!("string");
        assert!(validate_args("journal_write", &not_object).is_err());
    }

    #[test]
    fn test_validate_unknown_tool() {
        let err = validate_args("bogus", &serde_json::json!({})).unwrap_err();
        assert!(err.contains("unknown tool"));
    }

    #[test]
    fn test_optional_fields_default() {
        let args: ScheduleRecurringArgs = parse_args(
            "schedule_recurring",
            serde_json::json!({"description": "d", "cron": "* * * * *"}),
        )
        .unwrap();
        assert!(args.id.is_none());
        assert!(args.payload.is_none());

        let args: SaveSummaryArgs =
            parse_args("save_conversation_summary", serde_json::json!({"summary": "s"})).unwrap();
        assert!(args.key_decisions.is_empty());
    }

    #[test]
    fn test_parse_args_type_error() {
        let result: Result<SendTelegramArgs, String> = parse_args(
            "send_telegram",
            serde_json::json!({"message": "hi", "chat_id": "not a number"}),
        );
        assert!(result.unwrap_err().contains("send_telegram"));
    }
}
