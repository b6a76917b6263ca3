//! Session bookkeeping on top of the session pool.
//!
//! Once a session has been started in this process, the newest busy record of
//! the pool is the current session. It keeps receiving activity updates after
//! it has been delivered, so delivery never compacts it away; it is resent with
//! every batch until a newer session replaces it.
//!
//! Sessions restored from a previous run are closed. They may already carry
//! server-clock timestamps, so no local activity is ever written into them.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::model::{RecordKind, Session, Timestamped};
use crate::pool::RecordPool;
use crate::time::TimeEstimate;

pub struct SessionBook {
    pool: RecordPool<Session>,
    area: i32,
    ab_mode: String,
    session_count: i64,
    /// A session was started by this process and is the newest record
    current_open: bool,
}

impl SessionBook {
    pub fn new(capacity: usize, ceiling: usize, ab_mode: &str) -> Self {
        Self {
            pool: RecordPool::with_capacity(RecordKind::Session, capacity, ceiling),
            area: 0,
            ab_mode: ab_mode.to_string(),
            session_count: 0,
            current_open: false,
        }
    }

    pub fn pool(&self) -> &RecordPool<Session> {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut RecordPool<Session> {
        &mut self.pool
    }

    /// The session this process started, if any.
    pub fn current(&self) -> Option<&Session> {
        if self.current_open {
            self.pool.last()
        } else {
            None
        }
    }

    fn current_mut(&mut self) -> Option<&mut Session> {
        if self.current_open {
            self.pool.last_mut()
        } else {
            None
        }
    }

    /// Number of the most recently started session.
    pub fn session_count(&self) -> i64 {
        self.session_count
    }

    pub fn area(&self) -> i32 {
        self.area
    }

    pub fn ab_mode(&self) -> &str {
        &self.ab_mode
    }

    /// Pick up area, A/B mode and numbering from restored records.
    ///
    /// The restored sessions stay closed until [`start_session`](Self::start_session).
    pub fn sync_from_pool(&mut self) {
        self.current_open = false;
        if let Some(last) = self.pool.last() {
            self.area = last.area();
            self.session_count = last.session_count();
            if !last.ab_mode().is_empty() {
                self.ab_mode.clear();
                self.ab_mode.push_str(last.ab_mode());
            }
        }
    }

    /// Open a new session at `now`.
    ///
    /// When the registration service reported a session count that directly
    /// follows ours (or restarts at 1) the session is numbered by it. Otherwise
    /// the previous number is incremented and the session flagged unregistered.
    pub fn start_session(&mut self, now: DateTime<Utc>, server_count: Option<i64>) -> &Session {
        let (count, unregistered) = match server_count {
            Some(n) if n == self.session_count + 1 || n == 1 => (n, false),
            _ => (self.session_count + 1, true),
        };
        self.session_count = count;
        self.current_open = true;

        let session = self.pool.allocate();
        session.begin(now, count, unregistered);
        session.set_area(self.area);
        session.set_ab_mode(&self.ab_mode);

        debug!(
            session_count = count,
            unregistered = unregistered,
            "Session started"
        );
        session
    }

    /// Touch the current session's last-activity time.
    ///
    /// A session that was already moved onto server time gets the server
    /// time for `now` directly, so it never needs a second reconciliation.
    /// Without an estimate such a session is left as is.
    pub fn register_activity(&mut self, now: DateTime<Utc>, estimate: Option<&TimeEstimate>) {
        let Some(session) = self.current_mut() else {
            return;
        };

        let ts = match (session.is_validated(), estimate) {
            (false, _) => now,
            (true, Some(estimate)) => estimate.to_server(now),
            (true, None) => {
                debug!("No server time for a validated session, activity not recorded");
                return;
            }
        };
        session.set_last_activity(ts);
    }

    pub fn set_area(&mut self, area: i32) {
        self.area = area;
        if let Some(session) = self.current_mut() {
            session.set_area(area);
        }
    }

    pub fn set_ab_mode(&mut self, ab_mode: &str) {
        self.ab_mode.clear();
        self.ab_mode.push_str(ab_mode);
        if let Some(session) = self.current_mut() {
            session.set_ab_mode(ab_mode);
        }
    }

    /// Drop delivered sessions after a successful send, keeping the current one.
    ///
    /// Returns how many sessions were removed.
    pub fn settle_delivered(&mut self) -> usize {
        let delivered = self.pool.in_flight();
        // If nothing newer was started during the send, the current session
        // was part of the batch and must stay.
        let removable = if self.current_open && delivered == self.pool.busy_count() {
            delivered.saturating_sub(1)
        } else {
            delivered
        };
        self.pool.compact(removable);
        self.pool.release_in_flight();
        removable
    }
}
