// ABOUTME: Per-session subscriber reference counts and their delayed-stop timers
// ABOUTME: The last unsubscribe arms a timer; a new subscriber before it fires disarms it

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Entry {
    count: usize,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a subscriber, cancelling any pending stop timer. Returns the new count.
    pub fn add(&self, session_id: &str) -> usize {
        let mut entries = self.lock();
        let entry = entries.entry(session_id.to_string()).or_default();
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        entry.count += 1;
        entry.count
    }

    /// Remove a subscriber. Returns the new count; never goes below zero.
    pub fn remove(&self, session_id: &str) -> usize {
        let mut entries = self.lock();
        let entry = entries.entry(session_id.to_string()).or_default();
        entry.count = entry.count.saturating_sub(1);
        entry.count
    }

    pub fn count(&self, session_id: &str) -> usize {
        self.lock().get(session_id).map(|e| e.count).unwrap_or(0)
    }

    /// Arm the stop timer, replacing (and cancelling) an older one.
    pub fn arm_timer(&self, session_id: &str, timer: JoinHandle<()>) {
        let mut entries = self.lock();
        let entry = entries.entry(session_id.to_string()).or_default();
        if let Some(previous) = entry.timer.replace(timer) {
            previous.abort();
        }
    }

    pub fn has_timer(&self, session_id: &str) -> bool {
        self.lock()
            .get(session_id)
            .map(|e| e.timer.is_some())
            .unwrap_or(false)
    }

    /// Called by a fired timer. Returns whether the session is still idle, in which case
    /// the timer is disarmed and its entry dropped.
    pub fn fire(&self, session_id: &str) -> bool {
        let mut entries = self.lock();
        match entries.get(session_id) {
            Some(entry) if entry.count == 0 => {
                entries.remove(session_id);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Drop all local state for a session, cancelling its timer.
    pub fn forget(&self, session_id: &str) {
        if let Some(entry) = self.lock().remove(session_id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    pub fn clear(&self) {
        let drained: Vec<Entry> = self.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }
}
