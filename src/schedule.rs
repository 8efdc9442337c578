//! Cooperative work schedule
//!
//! Besides socket I/O, the proactor runs user work between poll cycles.
//! An entry is either *permanent* (re-invoked on every dispatch until
//! explicitly removed) or *deadline-bounded*: it runs on each dispatch
//! while its deadline lies in the future, gets one final invocation if
//! the deadline passes before it ever ran, and is then removed. An
//! expiration of zero therefore means "run once on the next dispatch,
//! then remove".
//!
//! Entries execute in insertion order, permanent and deadline-bounded
//! mixed. Dispatch is serialised by an internal lock, so entries never
//! run concurrently with each other even when both the poll thread and
//! the optional work executor drain the schedule.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::completion::run_safely;

/// Expiration sentinel marking a work entry as permanent
///
/// Pass as the `expiration_ms` of
/// [`add_work`](crate::SocketProactor::add_work) to keep the entry on the
/// schedule until it is removed explicitly.
pub const PERMANENT_COMPLETION_HANDLER: i64 = -1;

/// Scheduled user work; re-invocable until its entry is removed.
pub(crate) type Work = Box<dyn FnMut() + Send + 'static>;

struct WorkEntry {
    work: Work,
    /// `None` marks a permanent entry.
    expires_at: Option<Instant>,
    ran: bool,
}

impl std::fmt::Debug for WorkEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkEntry")
            .field("permanent", &self.expires_at.is_none())
            .field("ran", &self.ran)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct DispatchOutcome {
    pub(crate) invoked: usize,
    pub(crate) last_ok: bool,
}

/// The schedule: an ordered list of work entries plus the dispatch lock.
#[derive(Debug, Default)]
pub(crate) struct WorkSchedule {
    entries: Mutex<VecDeque<WorkEntry>>,
    dispatch: Mutex<()>,
}

impl WorkSchedule {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds an entry. Negative `expiration_ms` marks it permanent; any
    /// other value is a deadline of now + `expiration_ms`. `pos` inserts
    /// at the given index (clamped), `None` appends.
    pub(crate) fn add(&self, work: Work, expiration_ms: i64, pos: Option<usize>) {
        let expires_at = if expiration_ms < 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(expiration_ms as u64))
        };
        let entry = WorkEntry {
            work,
            expires_at,
            ran: false,
        };
        let mut entries = self.entries.lock().unwrap();
        match pos {
            Some(pos) => {
                let len = entries.len();
                entries.insert(pos.min(len), entry)
            }
            None => entries.push_back(entry),
        }
    }

    /// Drops all entries.
    pub(crate) fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Drops the first `count` deadline-bounded entries (all if negative).
    /// Returns how many were removed.
    pub(crate) fn remove_scheduled(&self, count: i64) -> usize {
        self.remove_matching(count, |entry| entry.expires_at.is_some())
    }

    /// Drops the first `count` permanent entries (all if negative).
    /// Returns how many were removed.
    pub(crate) fn remove_permanent(&self, count: i64) -> usize {
        self.remove_matching(count, |entry| entry.expires_at.is_none())
    }

    fn remove_matching(&self, count: i64, matches: impl Fn(&WorkEntry) -> bool) -> usize {
        let limit = if count < 0 { usize::MAX } else { count as usize };
        let mut removed = 0;
        self.entries.lock().unwrap().retain(|entry| {
            if removed < limit && matches(entry) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Number of deadline-bounded entries.
    pub(crate) fn scheduled(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.expires_at.is_some())
            .count()
    }

    /// Number of permanent entries.
    pub(crate) fn permanent(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.expires_at.is_none())
            .count()
    }

    /// Runs due entries in insertion order.
    ///
    /// With `expired_only`, only deadline entries whose deadline has
    /// passed are invoked (once, if never executed) and removed. Otherwise
    /// every permanent entry and every not-yet-expired deadline entry is
    /// invoked, an already-expired entry gets its final invocation if it
    /// never ran, and deadline entries whose deadline has passed by the
    /// end of their invocation leave the schedule. With `handle_one`,
    /// dispatch stops after the first invocation.
    pub(crate) fn dispatch(&self, handle_one: bool, expired_only: bool) -> DispatchOutcome {
        let _serial = self.dispatch.lock().unwrap();
        let mut taken = std::mem::take(&mut *self.entries.lock().unwrap());
        let now = Instant::now();
        let mut kept: VecDeque<WorkEntry> = VecDeque::with_capacity(taken.len());
        let mut invoked = 0;
        let mut last_ok = false;

        while let Some(mut entry) = taken.pop_front() {
            if handle_one && invoked > 0 {
                kept.push_back(entry);
                continue;
            }
            let expired = entry.expires_at.is_some_and(|deadline| deadline <= now);
            let run_it = if expired {
                !entry.ran
            } else {
                !expired_only
            };
            if run_it {
                last_ok = run_safely("scheduled work entry", || (entry.work)());
                invoked += 1;
                entry.ran = true;
            }
            let drop_it = entry
                .expires_at
                .is_some_and(|deadline| deadline <= Instant::now());
            if !drop_it {
                kept.push_back(entry);
            }
        }

        // Entries appended while dispatch ran sit in the list already;
        // survivors re-enter ahead of them, preserving insertion order.
        let mut entries = self.entries.lock().unwrap();
        for entry in kept.into_iter().rev() {
            entries.push_front(entry);
        }
        DispatchOutcome { invoked, last_ok }
    }

    /// Blocks until one entry has been invoked. Returns 1 if the entry
    /// returned normally, 0 if it panicked (the panic is trapped).
    pub(crate) fn run_one_blocking(&self, max_backoff: Duration) -> usize {
        let mut backoff = Backoff::new(max_backoff);
        loop {
            let outcome = self.dispatch(true, false);
            if outcome.invoked > 0 {
                return usize::from(outcome.last_ok);
            }
            backoff.grow();
            thread::sleep(backoff.wait());
        }
    }
}
