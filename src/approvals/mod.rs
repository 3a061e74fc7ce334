use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info};
use ulid::Ulid;

use crate::models::event::NotificationEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApprovalId(Ulid);

impl ApprovalId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ApprovalId {
    type Err = ulid::DecodeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(raw.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Pending,
    Allow,
    Deny,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allow,
    Deny,
    TimedOut,
    /// A newer request for the same session replaced this one.
    Superseded,
}

impl Outcome {
    pub fn decision(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::TimedOut | Self::Superseded => "timed_out",
        }
    }

    pub fn reason(self) -> Option<&'static str> {
        match self {
            Self::Superseded => Some("superseded"),
            _ => None,
        }
    }
}

impl From<Decision> for Outcome {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Allow => Self::Allow,
            Decision::Deny => Self::Deny,
        }
    }
}

impl From<Decision> for Resolution {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Allow => Self::Allow,
            Decision::Deny => Self::Deny,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub id: ApprovalId,
    pub event: NotificationEvent,
    pub created_at: Instant,
    pub deadline: Instant,
    pub resolution: Resolution,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub removed: usize,
}

// The watch channel is created with the entry, so a decision that lands
// before anyone waits is still seen by the waiter.
struct Entry {
    approval: PendingApproval,
    outcome_tx: watch::Sender<Option<Outcome>>,
    settled_at: Option<Instant>,
}

impl Entry {
    /// Moves a pending entry to a terminal state. Terminal entries never move.
    fn settle(&mut self, resolution: Resolution, outcome: Outcome, now: Instant) -> bool {
        if self.approval.resolution != Resolution::Pending {
            return false;
        }
        self.approval.resolution = resolution;
        self.settled_at = Some(now);
        self.outcome_tx.send_replace(Some(outcome));
        true
    }
}

#[derive(Default)]
struct Table {
    entries: HashMap<ApprovalId, Entry>,
    by_session: HashMap<String, ApprovalId>,
    closed: bool,
}

impl Table {
    fn forget_session(&mut self, id: ApprovalId, session_id: &str) {
        if self.by_session.get(session_id) == Some(&id) {
            self.by_session.remove(session_id);
        }
    }
}

pub struct ApprovalRegistry {
    timeout: Duration,
    grace: Duration,
    table: Mutex<Table>,
}

impl ApprovalRegistry {
    pub fn new(timeout: Duration, grace: Duration) -> Self {
        Self {
            timeout,
            grace,
            table: Mutex::new(Table::default()),
        }
    }

    pub fn create(&self, event: NotificationEvent) -> PendingApproval {
        let now = Instant::now();
        let approval = PendingApproval {
            id: ApprovalId::new(),
            event,
            created_at: now,
            deadline: now + self.timeout,
            resolution: Resolution::Pending,
        };

        let mut table = self.table();
        let session_id = approval.event.session_id.clone();
        if let Some(previous) = table.by_session.get(&session_id).copied()
            && let Some(entry) = table.entries.get_mut(&previous)
            && entry.settle(Resolution::TimedOut, Outcome::Superseded, now)
        {
            info!(approval_id = %previous, session_id = %session_id, "approval superseded");
        }

        let (outcome_tx, _) = watch::channel(None);
        let mut entry = Entry {
            approval,
            outcome_tx,
            settled_at: None,
        };
        if table.closed {
            entry.settle(Resolution::TimedOut, Outcome::TimedOut, now);
            debug!(approval_id = %entry.approval.id, "registry closed, approval expired on arrival");
        } else {
            debug!(approval_id = %entry.approval.id, "approval registered");
        }
        let approval = entry.approval.clone();
        table.entries.insert(approval.id, entry);
        table.by_session.insert(session_id, approval.id);
        approval
    }

    /// Records an operator decision. Returns whether anything changed; stale,
    /// duplicate and unknown ids are silent no-ops.
    pub fn resolve(&self, id: ApprovalId, decision: Decision) -> bool {
        let mut table = self.table();
        let Some(entry) = table.entries.get_mut(&id) else {
            debug!(approval_id = %id, "resolve for unknown approval ignored");
            return false;
        };
        let changed = entry.settle(decision.into(), decision.into(), Instant::now());
        if changed {
            info!(approval_id = %id, decision = ?decision, "approval resolved");
        } else {
            debug!(approval_id = %id, "approval already settled");
        }
        changed
    }

    pub fn expire(&self, id: ApprovalId) -> bool {
        let mut table = self.table();
        table
            .entries
            .get_mut(&id)
            .is_some_and(|entry| entry.settle(Resolution::TimedOut, Outcome::TimedOut, Instant::now()))
    }

    /// Releases every waiter with `timed_out`. Approvals created afterwards
    /// are settled as `timed_out` on arrival.
    pub fn close(&self) -> usize {
        let now = Instant::now();
        let mut table = self.table();
        table.closed = true;
        table
            .entries
            .values_mut()
            .map(|entry| entry.settle(Resolution::TimedOut, Outcome::TimedOut, now))
            .filter(|settled| *settled)
            .count()
    }

    /// Suspends until the approval settles or `deadline` passes, then consumes
    /// the entry. Dropping this future leaves the entry to the sweep.
    pub async fn await_resolution(&self, id: ApprovalId, deadline: Instant) -> Outcome {
        let mut outcome_rx = {
            let table = self.table();
            match table.entries.get(&id) {
                Some(entry) => entry.outcome_tx.subscribe(),
                None => return Outcome::TimedOut,
            }
        };

        let _ = tokio::time::timeout_at(deadline, outcome_rx.wait_for(Option::is_some)).await;
        self.consume(id)
    }

    fn consume(&self, id: ApprovalId) -> Outcome {
        let mut table = self.table();
        let Some(mut entry) = table.entries.remove(&id) else {
            return Outcome::TimedOut;
        };
        if entry.settle(Resolution::TimedOut, Outcome::TimedOut, Instant::now()) {
            info!(approval_id = %id, "approval timed out");
        }
        table.forget_session(id, &entry.approval.event.session_id);
        let outcome = *entry.outcome_tx.borrow();
        outcome.unwrap_or(Outcome::TimedOut)
    }

    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut table = self.table();
        let mut report = SweepReport::default();

        for (id, entry) in table.entries.iter_mut() {
            if entry.approval.deadline <= now
                && entry.settle(Resolution::TimedOut, Outcome::TimedOut, now)
            {
                info!(approval_id = %id, "approval expired by sweep");
                report.expired += 1;
            }
        }

        let grace = self.grace;
        let before = table.entries.len();
        table
            .entries
            .retain(|_, entry| entry.settled_at.is_none_or(|settled| settled + grace > now));
        report.removed = before - table.entries.len();

        if report.removed > 0 {
            let Table {
                entries,
                by_session,
                ..
            } = &mut *table;
            by_session.retain(|_, id| entries.contains_key(id));
        }
        report
    }

    pub fn get(&self, id: ApprovalId) -> Option<PendingApproval> {
        self.table()
            .entries
            .get(&id)
            .map(|entry| entry.approval.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.table()
            .entries
            .values()
            .filter(|entry| entry.approval.resolution == Resolution::Pending)
            .count()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn spawn_sweeper(registry: Arc<ApprovalRegistry>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = registry.sweep(Instant::now());
            if report != SweepReport::default() {
                debug!(expired = report.expired, removed = report.removed, "approval sweep");
            }
        }
    })
}
