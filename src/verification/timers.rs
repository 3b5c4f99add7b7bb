//! Approval timeouts.
//!
//! One tokio task per pending case sleeps until the case deadline and then
//! reports on a channel. Whoever owns the receiving end decides what expiry
//! means; the scheduler itself never touches a case.

use crate::model::CaseId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub case_id: CaseId,
    /// The persisted deadline this timer was armed for
    pub deadline: DateTime<Utc>,
}

pub type TimerEvents = mpsc::UnboundedReceiver<TimerFired>;

pub struct TimerScheduler {
    sender: mpsc::UnboundedSender<TimerFired>,
    active: Mutex<HashMap<CaseId, JoinHandle<()>>>,
}

impl TimerScheduler {
    pub fn new() -> (Self, TimerEvents) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                active: Mutex::new(HashMap::new()),
            },
            receiver,
        )
    }

    /// Arm (or re-arm) the timer for `case_id`. A case never has more than one
    /// timer: arming again replaces the previous one. Deadlines in the past
    /// fire on the next tick.
    pub fn arm(&self, case_id: &str, deadline: DateTime<Utc>) {
        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
        self.schedule(
            TimerFired {
                case_id: case_id.to_string(),
                deadline,
            },
            Instant::now() + remaining,
        );
        log::debug!(
            "Armed approval timer for case {case_id}, deadline {}",
            deadline.to_rfc3339()
        );
    }

    /// Deliver `fired` again after `delay`, keeping its original deadline.
    /// Used when an expiry could not be handled because the case was busy.
    pub fn retry(&self, fired: TimerFired, delay: std::time::Duration) {
        log::debug!(
            "Retrying approval timer for case {} in {}ms",
            fired.case_id,
            delay.as_millis()
        );
        self.schedule(fired, Instant::now() + delay);
    }

    fn schedule(&self, fired: TimerFired, wake_at: Instant) {
        let case_id = fired.case_id.clone();
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(wake_at).await;
            log::debug!("Approval timer for case {} expired", fired.case_id);
            if let Err(e) = sender.send(fired) {
                log::warn!("Timer event dropped, no receiver: {e}");
            }
        });

        let mut active = match self.active.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = active.insert(case_id, handle) {
            previous.abort();
        }
    }

    /// Returns whether a timer was still pending.
    pub fn cancel(&self, case_id: &str) -> bool {
        let mut active = match self.active.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };
        match active.remove(case_id) {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_armed(&self, case_id: &str) -> bool {
        let active = match self.active.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };
        active
            .get(case_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn armed_count(&self) -> usize {
        let active = match self.active.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.values().filter(|h| !h.is_finished()).count()
    }

    pub fn cancel_all(&self) {
        let mut active = match self.active.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, handle) in active.drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
