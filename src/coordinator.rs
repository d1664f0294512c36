//! Trigger & session coordinator. One logical actor: a single loop owns
//! all coordination state, receives triggers/completions/reschedule
//! notices over one channel, and doubles as the scheduler's alarm clock
//! through its receive timeout.
//!
//! At most one reasoning session is ever active. A trigger arriving while
//! a turn is in flight aborts the engine session (best effort); when the
//! abort lands, the next turn reuses the same session id so the engine
//! keeps the interrupted context. Queued triggers coalesce rather than
//! pile up.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::{
    build_user_prompt, new_id, now_ms, system_prompt, AllowedUrls, Config, EngineClient,
    EnginePart, Event, Message, Outbound, Role, SandboxHandle, Scheduler, Store, Trigger,
    TriggerKind, TurnCompletion,
};

const IDLE_POLL_MS: i64 = 30_000;

/// Everything a turn worker needs; assembled on the actor thread so prompt
/// reads see one consistent snapshot.
pub(crate) struct TurnRequest {
    pub(crate) trigger: Trigger,
    pub(crate) system: String,
    pub(crate) user: String,
    pub(crate) reuse_session: Option<String>,
}

type TurnRunner = Box<dyn Fn(TurnRequest) + Send>;

pub(crate) struct Coordinator {
    config: Arc<Config>,
    store: Store,
    scheduler: Scheduler,
    outbound: Outbound,
    current_session_id: Option<String>,
    is_processing: bool,
    /// Session id to reuse for the next turn after a successful abort.
    reuse_session: Option<String>,
    queued: Vec<Trigger>,
    runner: TurnRunner,
}

impl Coordinator {
    pub(crate) fn new(
        config: Arc<Config>,
        events_tx: mpsc::Sender<Event>,
    ) -> Result<Coordinator, Box<dyn std::error::Error>> {
        let store = Store::open(&config.db_path)?;
        let outbound = Outbound::from_config(&config);
        let runner_config = config.clone();
        let runner: TurnRunner = Box::new(move |request| {
            let config = runner_config.clone();
            let events = events_tx.clone();
            thread::spawn(move || run_turn_worker(config, events, request));
        });
        Ok(Coordinator {
            config,
            store,
            scheduler: Scheduler::new(),
            outbound,
            current_session_id: None,
            is_processing: false,
            reuse_session: None,
            queued: Vec::new(),
            runner,
        })
    }

    #[cfg(test)]
    fn with_runner(
        config: Arc<Config>,
        store: Store,
        outbound: Outbound,
        runner: TurnRunner,
    ) -> Coordinator {
        Coordinator {
            config,
            store,
            scheduler: Scheduler::new(),
            outbound,
            current_session_id: None,
            is_processing: false,
            reuse_session: None,
            queued: Vec::new(),
            runner,
        }
    }

    /// The actor loop. Never returns while the channel is open.
    pub(crate) fn run(mut self, events_rx: mpsc::Receiver<Event>) {
        // catch-up pass: clean out reminders that expired while down and
        // install the first alarm
        self.alarm_pass();

        let mut last_health_check = std::time::Instant::now();
        let health_interval = Duration::from_secs(300);

        loop {
            if last_health_check.elapsed() >= health_interval {
                last_health_check = std::time::Instant::now();
                if let Ok(meta) = std::fs::metadata(&self.config.db_path) {
                    let size_mb = meta.len() / 1_000_000;
                    if size_mb > 200 {
                        eprintln!("[coordinator] WARNING: store size {size_mb}MB keeps growing; consider compaction");
                    }
                }
            }

            let timeout = self.recv_timeout_ms();
            match events_rx.recv_timeout(Duration::from_millis(timeout as u64)) {
                Ok(Event::Trigger(trigger)) => self.handle_trigger(trigger),
                Ok(Event::Reschedule) => {
                    if let Err(err) = self.scheduler.reschedule(&self.store, now_ms()) {
                        eprintln!("[coordinator] reschedule failed: {err}");
                    }
                }
                Ok(Event::Completion(completion)) => self.handle_completion(completion),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    eprintln!("[coordinator] event channel closed; shutting down");
                    return;
                }
            }

            if self
                .scheduler
                .next_alarm()
                .is_some_and(|at| at <= now_ms())
            {
                self.alarm_pass();
            }
        }
    }

    fn recv_timeout_ms(&self) -> i64 {
        match self.scheduler.next_alarm() {
            Some(at) => (at - now_ms()).clamp(10, IDLE_POLL_MS),
            None => IDLE_POLL_MS,
        }
    }

    fn alarm_pass(&mut self) {
        let now = now_ms();
        let mut fired = Vec::new();
        let result = self
            .scheduler
            .on_alarm(&self.store, now, &mut |trigger| fired.push(trigger));
        if let Err(err) = result {
            eprintln!("[coordinator] alarm pass failed: {err}");
        }
        for trigger in fired {
            self.handle_trigger(trigger);
        }
    }

    pub(crate) fn handle_trigger(&mut self, trigger: Trigger) {
        // user messages land in the store at arrival, before any engine
        // call, so interleaved triggers keep their order
        if trigger.kind == TriggerKind::Message {
            let message = Message {
                id: new_id(),
                role: Role::User,
                content: trigger.payload.clone(),
                timestamp: trigger.received_at,
                trigger: trigger.kind,
                source: trigger.source,
            };
            if let Err(err) = crate::with_retry(|| self.store.append_message(&message)) {
                eprintln!("[coordinator] user message append failed: {err}");
            }
            self.outbound.send_typing(trigger.chat_id);
        }

        if self.is_processing {
            // preemption: abort the live session; on success the next turn
            // reuses its id so the engine keeps the interrupted context
            if let Some(session_id) = self.current_session_id.clone() {
                if self.reuse_session.is_none() {
                    let engine = EngineClient::from_config(&self.config);
                    if engine.session_abort(&session_id) {
                        self.reuse_session = Some(session_id);
                    }
                }
            }
            coalesce(&mut self.queued, trigger);
            return;
        }

        self.start_turn(trigger);
    }

    fn start_turn(&mut self, trigger: Trigger) {
        let now = now_ms();
        let system = system_prompt(&self.store);
        let user = build_user_prompt(&self.store, &self.config, &trigger, now);
        let request = TurnRequest {
            trigger,
            system,
            user,
            reuse_session: self.reuse_session.take(),
        };
        self.is_processing = true;
        (self.runner)(request);
    }

    pub(crate) fn handle_completion(&mut self, completion: TurnCompletion) {
        // release the processing flag on every path, first thing
        self.is_processing = false;
        if let Some(session_id) = &completion.session_id {
            self.current_session_id = Some(session_id.clone());
        }

        let interrupted = !self.queued.is_empty();
        match completion.result {
            Ok(text) => {
                let text = text.trim().to_string();
                if !text.is_empty() && !interrupted {
                    let message = Message {
                        id: new_id(),
                        role: Role::Assistant,
                        content: text.clone(),
                        timestamp: now_ms(),
                        trigger: completion.trigger.kind,
                        source: completion.trigger.source,
                    };
                    if let Err(err) = crate::with_retry(|| self.store.append_message(&message)) {
                        eprintln!("[coordinator] assistant append failed: {err}");
                    }
                    match completion.trigger.kind {
                        TriggerKind::Message => {
                            if let Err(err) =
                                self.outbound.send(&text, completion.trigger.chat_id, None)
                            {
                                eprintln!("[coordinator] outbound send failed: {err}");
                            }
                        }
                        // alarm/ambient replies are log-only; the engine
                        // reaches the user through send_telegram
                        TriggerKind::Alarm | TriggerKind::Ambient => {
                            eprintln!(
                                "[coordinator] {} turn finished: {}",
                                completion.trigger.kind.as_str(),
                                crate::truncate_chars(&text, 200)
                            );
                        }
                    }
                } else if interrupted {
                    eprintln!("[coordinator] interrupted turn output held for merged turn");
                }
            }
            Err(err) => {
                eprintln!("[coordinator] turn failed: {err}");
                if completion.trigger.kind == TriggerKind::Message && !interrupted {
                    let _ = self
                        .outbound
                        .send("[No response]", completion.trigger.chat_id, None);
                }
            }
        }

        if let Some(next) = take_next(&mut self.queued) {
            self.start_turn(next);
        }
    }

    #[cfg(test)]
    fn is_processing(&self) -> bool {
        self.is_processing
    }
}

// ── Queue coalescing ─────────────────────────────────────────────────────

/// Fold a trigger into the wait queue. Consecutive user messages merge by
/// concatenation (content is never dropped); consecutive alarm/ambient
/// triggers of the same kind collapse last-write-wins.
pub(crate) fn coalesce(queued: &mut Vec<Trigger>, trigger: Trigger) {
    if let Some(last) = queued.last_mut() {
        if last.kind == trigger.kind && last.source == trigger.source {
            match trigger.kind {
                TriggerKind::Message => {
                    last.payload.push_str("\n\n");
                    last.payload.push_str(&trigger.payload);
                    last.chat_id = trigger.chat_id.or(last.chat_id);
                    last.received_at = trigger.received_at;
                    return;
                }
                TriggerKind::Alarm | TriggerKind::Ambient => {
                    *last = trigger;
                    return;
                }
            }
        }
    }
    queued.push(trigger);
}

pub(crate) fn take_next(queued: &mut Vec<Trigger>) -> Option<Trigger> {
    if queued.is_empty() {
        None
    } else {
        Some(queued.remove(0))
    }
}

// ── Turn worker ──────────────────────────────────────────────────────────

/// One engine round trip on its own thread. Always posts a completion,
/// panics included, so the actor can never be left processing.
fn run_turn_worker(config: Arc<Config>, events: mpsc::Sender<Event>, request: TurnRequest) {
    let trigger = request.trigger.clone();
    let reuse = request.reuse_session.clone();

    let outcome = catch_unwind(AssertUnwindSafe(|| execute_turn(&config, request)));
    let (session_id, result) = match outcome {
        Ok(Ok((session_id, text))) => (Some(session_id), Ok(text)),
        Ok(Err((session_id, err))) => (session_id.or(reuse), Err(err)),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "turn worker panicked".to_string());
            (reuse, Err(format!("turn panicked: {message}")))
        }
    };

    if events
        .send(Event::Completion(TurnCompletion {
            trigger,
            session_id,
            result,
        }))
        .is_err()
    {
        eprintln!("[worker] coordinator gone; completion dropped");
    }
}

type TurnError = (Option<String>, String);

fn execute_turn(config: &Config, request: TurnRequest) -> Result<(String, String), TurnError> {
    let sandbox = SandboxHandle::from_config(config);
    sandbox.wake();
    sandbox.wait_ready().map_err(|e| (None, e))?;

    let mut secrets = HashMap::new();
    if let Some(key) = &config.anthropic_api_key {
        secrets.insert("ANTHROPIC_API_KEY".to_string(), key.clone());
    }
    if let Some(token) = crate::env_optional("GITHUB_TOKEN") {
        secrets.insert("GITHUB_TOKEN".to_string(), token);
    }
    if let Err(err) = sandbox.install_secrets(&secrets) {
        eprintln!("[worker] secret install failed: {err}");
    }

    let engine = EngineClient::from_config(config);
    let session_id = match request.reuse_session {
        Some(session_id) => session_id,
        None => engine
            .session_create("outpost turn", None)
            .map_err(|e| (None, e))?,
    };

    let text = engine
        .session_prompt(
            &session_id,
            None,
            vec![
                EnginePart::text_part(request.system),
                EnginePart::text_part(request.user),
            ],
        )
        .map_err(|e| (Some(session_id.clone()), e))?;
    Ok((session_id, text))
}

// ── Serve entry point ────────────────────────────────────────────────────

/// Wire everything together and run the actor loop on this thread.
pub(crate) fn run_serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let (events_tx, events_rx) = mpsc::channel::<Event>();
    let allowed_urls = AllowedUrls::new();

    {
        let config = config.clone();
        let events_tx = events_tx.clone();
        let allowed_urls = allowed_urls.clone();
        thread::spawn(move || {
            if let Err(err) = crate::run_intake(config, events_tx, allowed_urls) {
                eprintln!("[serve] intake exited: {err}");
            }
        });
    }

    {
        let config = config.clone();
        let events_tx = events_tx.clone();
        let allowed_urls = allowed_urls.clone();
        thread::spawn(move || crate::run_uplink(config, allowed_urls, events_tx));
    }

    if config.ambient_interval_mins > 0 {
        let interval = Duration::from_secs(config.ambient_interval_mins * 60);
        let events_tx = events_tx.clone();
        thread::spawn(move || loop {
            thread::sleep(interval);
            if events_tx.send(Event::Trigger(Trigger::ambient(now_ms()))).is_err() {
                break;
            }
        });
    }

    let coordinator = Coordinator::new(config, events_tx)?;
    coordinator.run(events_rx);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TriggerSource;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn temp_db_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("outpost_test");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("test_coord_{}_{name}.sqlite", std::process::id()))
    }

    fn message_trigger(text: &str, at: i64) -> Trigger {
        Trigger::message(text.to_string(), TriggerSource::Telegram, Some(7), at)
    }

    fn fixture(name: &str) -> (Coordinator, Arc<Mutex<Vec<TurnRequest>>>, PathBuf) {
        let path = temp_db_path(name);
        let _ = std::fs::remove_file(&path);
        let store = Store::open(&path).unwrap();
        let runs: Arc<Mutex<Vec<TurnRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = runs.clone();
        let runner: TurnRunner = Box::new(move |request| {
            sink.lock().unwrap().push(request);
        });
        let coordinator = Coordinator::with_runner(
            Arc::new(Config::from_env()),
            store,
            Outbound::disabled(),
            runner,
        );
        (coordinator, runs, path)
    }

    #[test]
    fn test_coalesce_concatenates_user_messages() {
        let mut queued = Vec::new();
        coalesce(&mut queued, message_trigger("first", 1));
        coalesce(&mut queued, message_trigger("second", 2));
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].payload, "first\n\nsecond");
        assert_eq!(queued[0].received_at, 2);
    }

    #[test]
    fn test_coalesce_ambient_last_write_wins() {
        let mut queued = Vec::new();
        coalesce(&mut queued, Trigger::ambient(1));
        coalesce(&mut queued, Trigger::ambient(2));
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].received_at, 2);
    }

    #[test]
    fn test_coalesce_keeps_distinct_kinds() {
        let mut queued = Vec::new();
        coalesce(&mut queued, message_trigger("msg", 1));
        coalesce(&mut queued, Trigger::ambient(2));
        coalesce(&mut queued, message_trigger("more", 3));
        assert_eq!(queued.len(), 3);
    }

    #[test]
    fn test_trigger_appends_user_message_and_starts_turn() {
        let (mut coordinator, runs, path) = fixture("start");
        coordinator.handle_trigger(message_trigger("My name is Ada.", 100));

        assert!(coordinator.is_processing());
        let stored = coordinator.store.all_messages().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "My name is Ada.");
        assert_eq!(stored[0].role, Role::User);

        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].user.contains("User message: My name is Ada."));
        assert!(runs[0].system.contains("Operating principles"));
        assert!(runs[0].reuse_session.is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_busy_trigger_is_queued_not_run() {
        let (mut coordinator, runs, path) = fixture("busy");
        coordinator.handle_trigger(message_trigger("search the web for X", 100));
        assert_eq!(runs.lock().unwrap().len(), 1);

        coordinator.handle_trigger(message_trigger("cancel, search for Y", 300));
        // still one run; second trigger waits
        assert_eq!(runs.lock().unwrap().len(), 1);
        assert_eq!(coordinator.queued.len(), 1);
        // both user messages persisted in arrival order
        let stored = coordinator.store.all_messages().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].content, "search the web for X");
        assert_eq!(stored[1].content, "cancel, search for Y");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_completion_clears_processing_and_delivers() {
        let (mut coordinator, _runs, path) = fixture("complete");
        let trigger = message_trigger("hello", 100);
        coordinator.handle_trigger(trigger.clone());
        assert!(coordinator.is_processing());

        coordinator.handle_completion(TurnCompletion {
            trigger,
            session_id: Some("s1".into()),
            result: Ok("hi Ada".into()),
        });
        assert!(!coordinator.is_processing());
        assert_eq!(coordinator.current_session_id.as_deref(), Some("s1"));

        let stored = coordinator.store.all_messages().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].role, Role::Assistant);
        assert_eq!(stored[1].content, "hi Ada");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_completion_failure_clears_processing() {
        let (mut coordinator, _runs, path) = fixture("fail");
        let trigger = message_trigger("hello", 100);
        coordinator.handle_trigger(trigger.clone());

        coordinator.handle_completion(TurnCompletion {
            trigger,
            session_id: None,
            result: Err("engine unavailable: boom".into()),
        });
        assert!(!coordinator.is_processing());
        // no assistant message on failure
        assert_eq!(coordinator.store.all_messages().unwrap().len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_queued_turn_starts_after_completion_with_session_reuse() {
        let (mut coordinator, runs, path) = fixture("chain");
        let first = message_trigger("task one", 100);
        coordinator.handle_trigger(first.clone());
        coordinator.handle_trigger(message_trigger("task two", 200));
        assert_eq!(coordinator.queued.len(), 1);

        // simulate a successful abort having been recorded
        coordinator.reuse_session = Some("s9".into());
        coordinator.handle_completion(TurnCompletion {
            trigger: first,
            session_id: Some("s9".into()),
            result: Ok("partial".into()),
        });

        // interrupted output is not delivered or persisted
        let stored = coordinator.store.all_messages().unwrap();
        assert!(stored.iter().all(|m| m.role == Role::User));

        // the queued trigger started a new turn reusing the session
        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].reuse_session.as_deref(), Some("s9"));
        assert!(runs[1].user.contains("task two"));
        assert!(coordinator.is_processing());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_alarm_completion_is_log_only() {
        let (mut coordinator, _runs, path) = fixture("alarm");
        let trigger = Trigger::alarm(
            crate::ReminderFire {
                id: "r1".into(),
                description: "water".into(),
            },
            "drink water".into(),
            100,
        );
        coordinator.handle_trigger(trigger.clone());
        coordinator.handle_completion(TurnCompletion {
            trigger,
            session_id: Some("s1".into()),
            result: Ok("done".into()),
        });
        // assistant reply recorded with the alarm trigger kind
        let stored = coordinator.store.all_messages().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].trigger, TriggerKind::Alarm);
        assert!(!coordinator.is_processing());
        std::fs::remove_file(&path).ok();
    }
}
