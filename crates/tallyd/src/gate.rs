//! Cooldown-gated attendance recording and presence queries.

use crate::clock::Clock;
use crate::model::{
    fallback_name, AttendanceEvent, AttendanceStats, EmployeeStatus, EventType,
    NewAttendanceEvent, OfficeStatus,
};
use crate::store::{AttendanceStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_core::RecognitionStatus;

/// Decides whether a recognized employee produces a new entry event.
///
/// Writes for one employee are serialized in-process, so a cooldown check
/// and the append that follows it cannot interleave with another snapshot
/// of the same person.
pub struct AttendanceGate {
    store: Arc<dyn AttendanceStore>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl AttendanceGate {
    pub fn new(store: Arc<dyn AttendanceStore>, clock: Arc<dyn Clock>, cooldown: Duration) -> Self {
        Self {
            store,
            clock,
            cooldown,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn employee_lock(&self, employee_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(employee_id).or_default().clone()
    }

    /// True when the employee has no event newer than the cooldown.
    ///
    /// Store failures deny the entry.
    pub async fn can_accept(&self, employee_id: i64) -> bool {
        match self.store.latest_event_for(employee_id).await {
            Ok(latest) => self.cooldown_elapsed(latest.as_ref()),
            Err(e) => {
                tracing::warn!(employee_id, error = %e, "cooldown lookup failed, denying entry");
                false
            }
        }
    }

    fn cooldown_elapsed(&self, latest: Option<&AttendanceEvent>) -> bool {
        let Some(latest) = latest else {
            return true;
        };
        // Negative elapsed time (event in the future) keeps the gate shut.
        match (self.clock.utc() - latest.timestamp).to_std() {
            Ok(elapsed) => elapsed >= self.cooldown,
            Err(_) => false,
        }
    }

    pub async fn record_entry(
        &self,
        employee_id: i64,
        confidence: f32,
        trace_id: &str,
    ) -> Result<AttendanceEvent, StoreError> {
        let lock = self.employee_lock(employee_id);
        let _guard = lock.lock().await;
        self.append(employee_id, EventType::Entry, confidence, trace_id).await
    }

    /// Manual exit; bypasses the cooldown and always has confidence 1.0.
    pub async fn record_exit(
        &self,
        employee_id: i64,
        trace_id: &str,
    ) -> Result<AttendanceEvent, StoreError> {
        let lock = self.employee_lock(employee_id);
        let _guard = lock.lock().await;
        self.append(employee_id, EventType::Exit, 1.0, trace_id).await
    }

    /// Check the cooldown and record an entry as one step.
    ///
    /// `Ok(None)` means the cooldown rejected the entry.
    pub async fn accept_entry(
        &self,
        employee_id: i64,
        confidence: f32,
        trace_id: &str,
    ) -> Result<Option<AttendanceEvent>, StoreError> {
        let lock = self.employee_lock(employee_id);
        let _guard = lock.lock().await;

        if !self.can_accept(employee_id).await {
            tracing::debug!(employee_id, trace_id, "entry within cooldown, skipped");
            return Ok(None);
        }

        self.append(employee_id, EventType::Entry, confidence, trace_id)
            .await
            .map(Some)
    }

    async fn append(
        &self,
        employee_id: i64,
        event_type: EventType,
        confidence: f32,
        trace_id: &str,
    ) -> Result<AttendanceEvent, StoreError> {
        let event = self
            .store
            .append_attendance_event(NewAttendanceEvent {
                employee_id: Some(employee_id),
                event_type,
                timestamp: self.clock.utc(),
                confidence,
                trace_id: trace_id.to_string(),
                status: RecognitionStatus::Match,
            })
            .await?;

        tracing::info!(
            employee_id,
            event = event_type.as_str(),
            confidence,
            trace_id,
            event_id = event.id,
            "attendance recorded"
        );
        Ok(event)
    }

    pub async fn employee_status(&self, employee_id: i64) -> Result<EmployeeStatus, StoreError> {
        let latest = self.store.latest_event_for(employee_id).await?;
        let name = self
            .store
            .employee_name(employee_id)
            .await?
            .unwrap_or_else(|| fallback_name(employee_id));
        Ok(EmployeeStatus::new(employee_id, name, latest.as_ref()))
    }

    /// Everyone whose latest event is an entry.
    pub async fn office_status(&self) -> Result<OfficeStatus, StoreError> {
        let latest = self.store.latest_event_per_employee().await?;
        let names = self.store.employee_names().await?;
        let total_employees = self.store.active_employee_count().await?;

        let mut present_employees: Vec<EmployeeStatus> = latest
            .iter()
            .filter(|(_, event)| event.event_type == EventType::Entry)
            .map(|(&id, event)| {
                let name = names.get(&id).cloned().unwrap_or_else(|| fallback_name(id));
                EmployeeStatus::new(id, name, Some(event))
            })
            .collect();
        present_employees.sort_by_key(|s| s.employee_id);

        Ok(OfficeStatus {
            present_count: present_employees.len(),
            total_employees,
            present_employees,
        })
    }

    /// Events in `[from, to)`, newest first.
    pub async fn history(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        employee_id: Option<i64>,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        self.store.events_between(from, to, employee_id).await
    }

    /// Days present and hours worked by one employee in `[from, to)`.
    pub async fn stats(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        employee_id: i64,
    ) -> Result<AttendanceStats, StoreError> {
        let events = self.store.events_between(from, to, Some(employee_id)).await?;
        let name = self
            .store
            .employee_name(employee_id)
            .await?
            .unwrap_or_else(|| fallback_name(employee_id));
        Ok(AttendanceStats::from_events(employee_id, name, &events))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::model::PresenceState;
    use crate::store::SqliteStore;
    use async_trait::async_trait;

    const COOLDOWN: Duration = Duration::from_secs(300);

    async fn gate_with_store() -> (Arc<AttendanceGate>, Arc<SqliteStore>, Arc<ManualClock>) {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new());
        let gate = Arc::new(AttendanceGate::new(store.clone(), clock.clone(), COOLDOWN));
        (gate, store, clock)
    }

    /// Store whose every call fails.
    pub(crate) struct BrokenStore;

    fn broken() -> StoreError {
        StoreError::Io(std::io::Error::other("disk on fire"))
    }

    #[async_trait]
    impl AttendanceStore for BrokenStore {
        async fn load_all_active_embeddings(
            &self,
        ) -> Result<Vec<tally_core::PersonEmbedding>, StoreError> {
            Err(broken())
        }
        async fn append_attendance_event(
            &self,
            _: NewAttendanceEvent,
        ) -> Result<AttendanceEvent, StoreError> {
            Err(broken())
        }
        async fn latest_event_for(&self, _: i64) -> Result<Option<AttendanceEvent>, StoreError> {
            Err(broken())
        }
        async fn latest_event_per_employee(
            &self,
        ) -> Result<HashMap<i64, AttendanceEvent>, StoreError> {
            Err(broken())
        }
        async fn active_employee_count(&self) -> Result<usize, StoreError> {
            Err(broken())
        }
        async fn employee_name(&self, _: i64) -> Result<Option<String>, StoreError> {
            Err(broken())
        }
        async fn employee_names(&self) -> Result<HashMap<i64, String>, StoreError> {
            Err(broken())
        }
        async fn events_between(
            &self,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
            _: Option<i64>,
        ) -> Result<Vec<AttendanceEvent>, StoreError> {
            Err(broken())
        }
    }

    #[tokio::test]
    async fn test_cooldown_blocks_then_allows() {
        let (gate, store, clock) = gate_with_store().await;
        let ada = store.insert_employee("Ada", true).await.unwrap();

        assert!(gate.can_accept(ada).await);
        assert!(gate.accept_entry(ada, 0.9, "t1").await.unwrap().is_some());

        clock.advance(Duration::from_secs(120));
        assert!(!gate.can_accept(ada).await);
        assert!(gate.accept_entry(ada, 0.9, "t2").await.unwrap().is_none());

        clock.advance(Duration::from_secs(180));
        assert!(gate.can_accept(ada).await);
        assert!(gate.accept_entry(ada, 0.9, "t3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cooldown_is_per_employee() {
        let (gate, store, _clock) = gate_with_store().await;
        let ada = store.insert_employee("Ada", true).await.unwrap();
        let grace = store.insert_employee("Grace", true).await.unwrap();

        gate.record_entry(ada, 0.8, "a").await.unwrap();
        assert!(!gate.can_accept(ada).await);
        assert!(gate.can_accept(grace).await);
    }

    #[tokio::test]
    async fn test_exit_restarts_cooldown() {
        let (gate, store, clock) = gate_with_store().await;
        let ada = store.insert_employee("Ada", true).await.unwrap();

        gate.record_entry(ada, 0.8, "in").await.unwrap();
        clock.advance(Duration::from_secs(400));
        let exit = gate.record_exit(ada, "manual").await.unwrap();
        assert_eq!(exit.confidence, 1.0);
        assert_eq!(exit.event_type, EventType::Exit);
        assert!(!gate.can_accept(ada).await);
    }

    #[tokio::test]
    async fn test_concurrent_accepts_record_one_entry() {
        let (gate, store, clock) = gate_with_store().await;
        let ada = store.insert_employee("Ada", true).await.unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|i| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.accept_entry(ada, 0.9, &format!("t{i}")).await })
            })
            .collect();

        let mut accepted = 0;
        for attempt in attempts {
            if attempt.await.unwrap().unwrap().is_some() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);

        let day = chrono::Duration::days(1);
        let now = clock.utc();
        let all = store.events_between(now - day, now + day, Some(ada)).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_record_for_unknown_employee_fails() {
        let (gate, store, _clock) = gate_with_store().await;
        assert!(matches!(
            gate.record_entry(999, 0.9, "ghost").await,
            Err(StoreError::Database(_))
        ));
        assert!(gate.record_exit(999, "ghost").await.is_err());
        assert!(store.latest_event_for(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_failure_denies_entry() {
        let gate = AttendanceGate::new(Arc::new(BrokenStore), Arc::new(ManualClock::new()), COOLDOWN);
        assert!(!gate.can_accept(1).await);
        assert!(gate.accept_entry(1, 0.9, "t").await.unwrap().is_none());
        assert!(gate.record_entry(1, 0.9, "t").await.is_err());
    }

    #[tokio::test]
    async fn test_presence_transitions() {
        let (gate, store, clock) = gate_with_store().await;
        let ada = store.insert_employee("Ada Lovelace", true).await.unwrap();

        let status = gate.employee_status(ada).await.unwrap();
        assert_eq!(status.state, PresenceState::Unknown);
        assert_eq!(status.employee_name, "Ada Lovelace");
        assert!(status.last_event.is_none());

        gate.record_entry(ada, 0.8, "in").await.unwrap();
        let status = gate.employee_status(ada).await.unwrap();
        assert_eq!(status.state, PresenceState::InOffice);
        assert_eq!(status.last_event_time, Some(clock.utc()));

        clock.advance(Duration::from_secs(60));
        gate.record_exit(ada, "out").await.unwrap();
        let status = gate.employee_status(ada).await.unwrap();
        assert_eq!(status.state, PresenceState::Left);
        assert_eq!(status.last_event, Some(EventType::Exit));
    }

    #[tokio::test]
    async fn test_unknown_employee_gets_fallback_name() {
        let (gate, _store, _clock) = gate_with_store().await;
        let status = gate.employee_status(77).await.unwrap();
        assert_eq!(status.employee_name, "Employee #77");
    }

    #[tokio::test]
    async fn test_office_status_counts_present() {
        let (gate, store, clock) = gate_with_store().await;
        let ada = store.insert_employee("Ada", true).await.unwrap();
        let grace = store.insert_employee("Grace", true).await.unwrap();
        store.insert_employee("Linus", true).await.unwrap();
        store.insert_employee("Former", false).await.unwrap();

        gate.record_entry(ada, 0.9, "a").await.unwrap();
        gate.record_entry(grace, 0.9, "g").await.unwrap();
        clock.advance(Duration::from_secs(10));
        gate.record_exit(grace, "g-out").await.unwrap();

        let office = gate.office_status().await.unwrap();
        assert_eq!(office.present_count, 1);
        assert_eq!(office.total_employees, 3);
        assert_eq!(office.present_employees[0].employee_id, ada);
        assert_eq!(office.present_employees[0].employee_name, "Ada");
    }

    #[tokio::test]
    async fn test_history_filters_by_employee() {
        let (gate, store, clock) = gate_with_store().await;
        let ada = store.insert_employee("Ada", true).await.unwrap();
        let grace = store.insert_employee("Grace", true).await.unwrap();

        let start = clock.utc();
        gate.record_entry(ada, 0.9, "a").await.unwrap();
        clock.advance(Duration::from_secs(30));
        gate.record_entry(grace, 0.9, "b").await.unwrap();
        clock.advance(Duration::from_secs(30));
        gate.record_exit(ada, "c").await.unwrap();
        let end = clock.utc() + chrono::Duration::seconds(1);

        let all = gate.history(start, end, None).await.unwrap();
        let traces: Vec<_> = all.iter().map(|e| e.trace_id.as_str()).collect();
        assert_eq!(traces, vec!["c", "b", "a"]);

        let one = gate.history(start, end, Some(ada)).await.unwrap();
        assert_eq!(one.len(), 2);
    }

    #[tokio::test]
    async fn test_stats_counts_days_and_hours() {
        let (gate, store, clock) = gate_with_store().await;
        let ada = store.insert_employee("Ada", true).await.unwrap();

        let start = clock.utc();
        gate.record_entry(ada, 0.9, "mon-in").await.unwrap();
        clock.advance(Duration::from_secs(8 * 3600));
        gate.record_exit(ada, "mon-out").await.unwrap();
        clock.advance(Duration::from_secs(17 * 3600));
        gate.record_entry(ada, 0.9, "tue-in").await.unwrap();
        let end = clock.utc() + chrono::Duration::days(1);

        let stats = gate.stats(start, end, ada).await.unwrap();
        assert_eq!(stats.employee_name, "Ada");
        assert_eq!(stats.total_days, 2);
        assert_eq!(stats.total_hours, 8.0);
        assert_eq!(stats.avg_arrival_time.as_deref(), Some("09:30"));
        assert_eq!(stats.avg_departure_time.as_deref(), Some("17:00"));

        let nobody = gate.stats(start, end, 999).await.unwrap();
        assert_eq!(nobody.employee_name, "Employee #999");
        assert_eq!(nobody.total_days, 0);
    }
}
