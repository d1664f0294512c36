//! Prompt assembly. Two deliverables per turn: a system prompt that stays
//! byte-identical while the identity file is unchanged (downstream prompt
//! caching depends on that), and a dynamic context envelope of ordered
//! sections rebuilt from the store every time.

use chrono::{TimeZone, Utc};

use crate::{Config, Store, Trigger, TriggerKind};

pub(crate) const RECENT_JOURNAL_COUNT: usize = 40;
pub(crate) const RECENT_CONVERSATION_COUNT: usize = 30;
pub(crate) const MESSAGE_TRUNCATE_CHARS: usize = 5_000;

/// State-file names injected into every envelope.
pub(crate) const RESERVED_STATE_FILES: &[&str] = &["identity", "today", "user"];

const DEFAULT_IDENTITY: &str = "You are Outpost, a persistent personal assistant. You have a durable \
memory store, a scheduler, and messaging tools. You act on behalf of one \
person and maintain continuity across conversations.";

const OPERATING_PRINCIPLES: &str = "\
## Operating principles

- Your memory tools are the only durable record. Journal observations worth \
keeping; distill stable knowledge into topics; keep state files current.
- Use save_conversation_summary when asked to compact; never discard \
information silently.
- Schedule follow-ups with schedule_once / schedule_recurring instead of \
promising to remember.
- Replies to alarm and ambient turns are not delivered anywhere. Use \
send_telegram when the user should see something.
- Be concise. Prefer doing over narrating.";

/// Identity file (or the default) plus the fixed principles block.
/// Stable across invocations while the identity file is unchanged.
pub(crate) fn system_prompt(store: &Store) -> String {
    let identity = store
        .read_state_file("identity")
        .ok()
        .flatten()
        .map(|f| f.content)
        .unwrap_or_else(|| DEFAULT_IDENTITY.to_string());
    format!("{identity}\n\n{OPERATING_PRINCIPLES}")
}

/// The ordered dynamic sections: time, context status, state files, recent
/// journal, last summary, recent conversation.
pub(crate) fn dynamic_context(store: &Store, config: &Config, now_ms: i64) -> String {
    let mut out = String::new();

    let now = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .unwrap_or_else(Utc::now);
    out.push_str("<current_time>\n");
    out.push_str(&format!(
        "{}\n{}\n",
        now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        now.format("%A, %B %-d %Y, %H:%M UTC")
    ));
    out.push_str("</current_time>\n\n");

    let stats = store
        .conversation_stats(config.compact_threshold)
        .unwrap_or(crate::ConversationStats {
            count: 0,
            approx_tokens: 0,
            needs_compaction: false,
        });
    out.push_str("<context_status>\n");
    out.push_str(&format!(
        "messages: {} | approx tokens: {} | threshold: {} | needs compaction: {}\n",
        stats.count, stats.approx_tokens, config.compact_threshold, stats.needs_compaction
    ));
    out.push_str("</context_status>\n\n");

    out.push_str("<state_files>\n");
    for name in RESERVED_STATE_FILES {
        let content = store
            .read_state_file(name)
            .ok()
            .flatten()
            .map(|f| f.content)
            .unwrap_or_else(|| "(empty)".to_string());
        out.push_str(&format!("<file name=\"{name}\">\n{content}\n</file>\n"));
    }
    out.push_str("</state_files>\n\n");

    out.push_str(&format!("<recent_journal count=\"{RECENT_JOURNAL_COUNT}\">\n"));
    let mut journal = store.recent_journal(RECENT_JOURNAL_COUNT).unwrap_or_default();
    journal.reverse(); // oldest first within the block
    if journal.is_empty() {
        out.push_str("(none)\n");
    }
    for entry in &journal {
        out.push_str(&format!(
            "[{}] {}: {}\n",
            crate::format_ms_iso(entry.timestamp),
            entry.topic,
            entry.content.replace('\n', " ")
        ));
    }
    out.push_str("</recent_journal>\n\n");

    out.push_str("<last_summary>\n");
    match store.latest_summary().ok().flatten() {
        Some(summary) => {
            out.push_str(&summary.content);
            out.push('\n');
            if !summary.open_threads.is_empty() {
                out.push_str(&format!("Open threads: {}\n", summary.open_threads.join("; ")));
            }
        }
        None => out.push_str("(none)\n"),
    }
    out.push_str("</last_summary>\n\n");

    out.push_str("<recent_conversation>\n");
    let conversation = store
        .recent_messages(RECENT_CONVERSATION_COUNT)
        .unwrap_or_default();
    if conversation.is_empty() {
        out.push_str("(empty)\n");
    }
    for message in &conversation {
        out.push_str(&format!(
            "{}: {}\n",
            message.role.as_str(),
            crate::truncate_chars(&message.content, MESSAGE_TRUNCATE_CHARS)
        ));
    }
    out.push_str("</recent_conversation>\n");

    out
}

/// Trigger-specific tail appended after the envelope.
pub(crate) fn trigger_section(trigger: &Trigger) -> String {
    match trigger.kind {
        TriggerKind::Message => format!("User message: {}", trigger.payload),
        TriggerKind::Alarm => {
            let description = trigger
                .reminder
                .as_ref()
                .map(|r| r.description.as_str())
                .unwrap_or("(no description)");
            format!(
                "<reminder>\ndescription: {}\npayload: {}\n</reminder>\n\
                 This is a scheduled reminder firing, not a user message. Your reply is NOT \
                 delivered to the chat. If the user should be notified, call send_telegram.",
                description, trigger.payload
            )
        }
        TriggerKind::Ambient => "Ambient tick: no user input. Review state and act if something \
                                 needs attention. Your reply is NOT delivered to the chat and is \
                                 logged only; keep it brief. Use send_telegram if the user should \
                                 see something."
            .to_string(),
    }
}

const COMPACTION_NOTICE: &str = "\
The conversation buffer has crossed the compaction threshold. Call \
save_conversation_summary now with a faithful summary (key decisions, open \
threads, learned patterns); the absorbed messages will be pruned atomically.";

/// Full prompt tail for one turn: envelope, trigger section, and the
/// compaction request when the buffer is over threshold.
pub(crate) fn build_user_prompt(
    store: &Store,
    config: &Config,
    trigger: &Trigger,
    now_ms: i64,
) -> String {
    let mut prompt = dynamic_context(store, config, now_ms);
    prompt.push('\n');
    prompt.push_str(&trigger_section(trigger));
    let needs_compaction = store
        .conversation_stats(config.compact_threshold)
        .map(|s| s.needs_compaction)
        .unwrap_or(false);
    if needs_compaction {
        prompt.push_str("\n\n");
        prompt.push_str(COMPACTION_NOTICE);
    }
    prompt
}
