//! Single next-fire alarm over the reminder set. The scheduler owns no
//! durable state; reminders live in the store, and `reschedule` recomputes
//! the one installed alarm from scratch after every mutation or firing.

use crate::{CronExpr, Reminder, ReminderFire, Store, StoreResult, Trigger};

/// A due reminder may fire up to this late, and never earlier than this
/// before its time.
pub(crate) const FIRE_WINDOW_MS: i64 = 60_000;
/// One-shots further past due than this are dropped without firing.
pub(crate) const MISS_WINDOW_MS: i64 = 60_000;

pub(crate) struct Scheduler {
    next_alarm: Option<i64>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Scheduler { next_alarm: None }
    }

    /// The currently installed wall-clock alarm, if any.
    pub(crate) fn next_alarm(&self) -> Option<i64> {
        self.next_alarm
    }

    /// Earliest upcoming fire time for one reminder. One-shots keep their
    /// scheduled time even when it is already past, so the next alarm pass
    /// can clean them up. Unparseable cron rows are skipped (they can only
    /// appear if the store predates stricter validation).
    fn next_fire_time(reminder: &Reminder, now: i64) -> Option<i64> {
        if let Some(at) = reminder.scheduled_time {
            return Some(at);
        }
        let expr = reminder.cron_expression.as_deref()?;
        match CronExpr::parse(expr) {
            Ok(parsed) => parsed.next_after(now),
            Err(err) => {
                eprintln!("[scheduler] reminder {} has bad cron: {err}", reminder.id);
                None
            }
        }
    }

    /// Recompute and install the single alarm: the minimum next fire time
    /// across all reminders. An empty set clears the alarm. Calling twice
    /// with no intervening mutation installs the same alarm.
    pub(crate) fn reschedule(&mut self, store: &Store, now: i64) -> StoreResult<Option<i64>> {
        let reminders = store.list_reminders()?;
        let next = reminders
            .iter()
            .filter_map(|r| Self::next_fire_time(r, now))
            .min();
        self.next_alarm = next;
        Ok(next)
    }

    /// Alarm handler. Scans the full reminder set:
    ///   - one-shots past the miss window are deleted without firing;
    ///   - reminders inside the fire window are dispatched as synthetic
    ///     alarm triggers, one-shots being deleted *before* dispatch so a
    ///     crashed dispatch can't double-fire them;
    ///   - everything else is left alone.
    /// Ends by reinstalling the alarm for whatever remains.
    pub(crate) fn on_alarm(
        &mut self,
        store: &Store,
        now: i64,
        dispatch: &mut dyn FnMut(Trigger),
    ) -> StoreResult<()> {
        for reminder in store.list_reminders()? {
            let fire_at = if reminder.is_recurring() {
                // Evaluate from the window's left edge so the just-due
                // minute is seen; next_after is strictly greater.
                match reminder
                    .cron_expression
                    .as_deref()
                    .and_then(|expr| CronExpr::parse(expr).ok())
                    .and_then(|expr| expr.next_after(now - FIRE_WINDOW_MS))
                {
                    Some(t) => t,
                    None => continue,
                }
            } else {
                match reminder.scheduled_time {
                    Some(t) => t,
                    None => continue,
                }
            };

            if !reminder.is_recurring() && fire_at < now - MISS_WINDOW_MS {
                eprintln!(
                    "[scheduler] dropping missed one-shot {} ({}ms late)",
                    reminder.id,
                    now - fire_at
                );
                store.delete_reminder(&reminder.id)?;
                continue;
            }

            if (fire_at - now).abs() <= FIRE_WINDOW_MS {
                if !reminder.is_recurring() {
                    store.delete_reminder(&reminder.id)?;
                }
                dispatch(Trigger::alarm(
                    ReminderFire {
                        id: reminder.id.clone(),
                        description: reminder.description.clone(),
                    },
                    reminder.payload.clone(),
                    now,
                ));
            }
        }
        self.reschedule(store, now)?;
        Ok(())
    }
}
