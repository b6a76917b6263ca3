//! Scripted [`Transport`] used by the unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::error::{DeliveryError, ProtocolError, TransportError};
use crate::model::RecordKind;
use crate::transport::{
    Batch, DeliveryReport, RegistrationRequest, RegistrationResponse, Transport,
};

/// One call to [`Transport::send_batch`], successful or not.
#[derive(Debug, Clone)]
pub(crate) struct SentBatch {
    pub kind: RecordKind,
    pub user_id: i64,
    pub record_count: usize,
    pub body: String,
    pub delivered: bool,
    pub at: Instant,
}

impl SentBatch {
    pub fn json(&self) -> Vec<serde_json::Value> {
        serde_json::from_str(&self.body).unwrap()
    }
}

pub(crate) struct ScriptedTransport {
    failing_kinds: Mutex<HashSet<RecordKind>>,
    send_delay: Mutex<Duration>,
    sent: Mutex<Vec<SentBatch>>,
    times: Mutex<VecDeque<Option<DateTime<Utc>>>>,
    fallback_time: Mutex<Option<DateTime<Utc>>>,
    time_calls: AtomicUsize,
    user_ids: Mutex<VecDeque<i64>>,
    registration_failures: AtomicUsize,
    session_count: Mutex<i64>,
    registrations: Mutex<Vec<RegistrationRequest>>,
    tester: Mutex<Option<bool>>,
    tester_lookups: Mutex<Vec<i64>>,
    country: Mutex<Option<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            failing_kinds: Mutex::new(HashSet::new()),
            send_delay: Mutex::new(Duration::ZERO),
            sent: Mutex::new(Vec::new()),
            times: Mutex::new(VecDeque::new()),
            fallback_time: Mutex::new(None),
            time_calls: AtomicUsize::new(0),
            user_ids: Mutex::new(VecDeque::new()),
            registration_failures: AtomicUsize::new(0),
            session_count: Mutex::new(1),
            registrations: Mutex::new(Vec::new()),
            tester: Mutex::new(Some(false)),
            tester_lookups: Mutex::new(Vec::new()),
            country: Mutex::new(None),
        }
    }

    pub fn fail_kind(&self, kind: RecordKind) {
        lock(&self.failing_kinds).insert(kind);
    }

    pub fn recover_kind(&self, kind: RecordKind) {
        lock(&self.failing_kinds).remove(&kind);
    }

    /// Hold every batch upload for `delay` before answering.
    pub fn set_send_delay(&self, delay: Duration) {
        *lock(&self.send_delay) = delay;
    }

    pub fn sent(&self) -> Vec<SentBatch> {
        lock(&self.sent).clone()
    }

    pub fn delivered(&self, kind: RecordKind) -> Vec<SentBatch> {
        lock(&self.sent)
            .iter()
            .filter(|b| b.kind == kind && b.delivered)
            .cloned()
            .collect()
    }

    /// Queue network time answers; `None` is a failed fetch.
    pub fn push_times(&self, times: impl IntoIterator<Item = Option<DateTime<Utc>>>) {
        lock(&self.times).extend(times);
    }

    /// Answer used once the queued times run out.
    pub fn set_network_time(&self, time: DateTime<Utc>) {
        *lock(&self.fallback_time) = Some(time);
    }

    pub fn time_calls(&self) -> usize {
        self.time_calls.load(Ordering::SeqCst)
    }

    /// Queue registration answers; the default answer is `-1`.
    pub fn push_user_ids(&self, ids: &[i64]) {
        lock(&self.user_ids).extend(ids.iter().copied());
    }

    /// Make the next `n` registration calls fail at the transport level.
    pub fn fail_registrations(&self, n: usize) {
        self.registration_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_session_count(&self, count: i64) {
        *lock(&self.session_count) = count;
    }

    pub fn registration_calls(&self) -> usize {
        lock(&self.registrations).len()
    }

    pub fn registration_requests(&self) -> Vec<RegistrationRequest> {
        lock(&self.registrations).clone()
    }

    /// Tester flag answer; `None` makes the lookup fail.
    pub fn set_tester(&self, tester: Option<bool>) {
        *lock(&self.tester) = tester;
    }

    /// User ids the tester flag was looked up for.
    pub fn tester_lookups(&self) -> Vec<i64> {
        lock(&self.tester_lookups).clone()
    }

    pub fn set_country(&self, country: &str) {
        *lock(&self.country) = Some(country.to_string());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_batch(&self, batch: &Batch) -> Result<DeliveryReport, DeliveryError> {
        let delay = *lock(&self.send_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let delivered = !lock(&self.failing_kinds).contains(&batch.kind);
        lock(&self.sent).push(SentBatch {
            kind: batch.kind,
            user_id: batch.user_id,
            record_count: batch.record_count,
            body: batch.body.clone(),
            delivered,
            at: Instant::now(),
        });

        if delivered {
            Ok(DeliveryReport {
                status_code: 200,
                attempts: 1,
            })
        } else {
            Err(ProtocolError::Status {
                code: 503,
                message: "scripted failure".to_string(),
            }
            .into())
        }
    }

    async fn network_time(&self) -> Result<DateTime<Utc>, DeliveryError> {
        self.time_calls.fetch_add(1, Ordering::SeqCst);
        let next = match lock(&self.times).pop_front() {
            Some(queued) => queued,
            None => *lock(&self.fallback_time),
        };
        next.ok_or_else(|| TransportError::Request("scripted time failure".to_string()).into())
    }

    async fn register_identity(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationResponse, DeliveryError> {
        lock(&self.registrations).push(request.clone());

        let pending_failures = self.registration_failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.registration_failures
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(TransportError::Request("scripted registration failure".to_string()).into());
        }

        let user_id = lock(&self.user_ids).pop_front().unwrap_or(-1);
        Ok(RegistrationResponse {
            user_id,
            session_count: *lock(&self.session_count),
            is_user_new: None,
        })
    }

    async fn fetch_tester(&self, user_id: i64) -> Result<bool, DeliveryError> {
        lock(&self.tester_lookups).push(user_id);
        let tester = *lock(&self.tester);
        tester.ok_or_else(|| TransportError::Request("scripted tester failure".to_string()).into())
    }

    async fn fetch_country(&self) -> Result<Option<String>, DeliveryError> {
        Ok(lock(&self.country).clone())
    }
}
