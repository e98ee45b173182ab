//! libSQL backend: durable implementation of every storage collaborator.
//!
//! One connection is shared by all operations. Claims and outcome writes are
//! single conditional statements, and a rate-counter acquire is one
//! immediate transaction, so each stays atomic across router processes
//! pointed at the same database file.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, Value, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::approval::store::{check_claim, check_patch};
use crate::approval::{Approval, ApprovalPatch, ApprovalStatus, ApprovalStore, ClaimLease};
use crate::browser::{BrowserJob, JobStore};
use crate::error::StoreError;
use crate::ledger::{Event, EventLedger, EventSubject, EventType};
use crate::policy::{ChannelCaps, DncEntry, DncSet, DncSource, RateLimitCounter, RateSnapshot, WindowKeys};
use crate::store::migrations;

/// Column order used by `row_to_approval`.
const APPROVAL_COLUMNS: &str = "id, channel, target, payload, status, attempts, last_error, version, \
     next_attempt_at, job_ref, lease_claimant, lease_until, archived, created_at, updated_at";

const TERMINAL_STATUSES: &str = "('sent', 'failed', 'rejected', 'sent_manual')";
const TERMINAL_JOB_STATES: &str = "('SUCCEEDED', 'FAILED', 'CANCELLED')";

/// libSQL-backed store.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Serializes rate-counter transactions on the shared connection.
    counter_lock: Mutex<()>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// In-memory database, for tests.
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            counter_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Add or replace a suppression entry.
    pub async fn add_dnc(&self, entry: &DncEntry) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO dnc_entries (identity, channel, reason) VALUES (?1, ?2, ?3)
                 ON CONFLICT (identity, channel) DO UPDATE SET reason = excluded.reason",
                params![entry.identity.trim().to_lowercase(), entry.channel.clone(), entry.reason.clone()],
            )
            .await
            .map_err(|e| db_err("add_dnc", e))?;
        Ok(())
    }

    async fn fetch_approval(&self, id: Uuid) -> Result<Option<Approval>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| db_err("get_approval", e))?;

        match rows.next().await.map_err(|e| db_err("get_approval", e))? {
            Some(row) => Ok(Some(row_to_approval(&row)?)),
            None => Ok(None),
        }
    }

    /// Replace the mutable columns of `next` if the stored version is still `expected`.
    async fn compare_and_swap(&self, next: &Approval, expected: u64) -> Result<(), StoreError> {
        let (claimant, until) = match &next.lease {
            Some(lease) => (Value::Text(lease.claimant.clone()), Value::Text(ts(lease.until))),
            None => (Value::Null, Value::Null),
        };
        let affected = self
            .conn()
            .execute(
                "UPDATE approvals SET payload = ?1, status = ?2, attempts = ?3, last_error = ?4,
                     version = ?5, next_attempt_at = ?6, job_ref = ?7, lease_claimant = ?8,
                     lease_until = ?9, updated_at = ?10
                 WHERE id = ?11 AND version = ?12",
                params![
                    serde_json::to_string(&next.payload)?,
                    next.status.as_str(),
                    i64::from(next.attempts),
                    opt_text(next.last_error.as_deref()),
                    next.version as i64,
                    opt_text(next.next_attempt_at.map(ts).as_deref()),
                    opt_text(next.job_ref.map(|j| j.to_string()).as_deref()),
                    claimant,
                    until,
                    ts(next.updated_at),
                    next.id.to_string(),
                    expected as i64,
                ],
            )
            .await
            .map_err(|e| db_err("update_approval", e))?;

        if affected == 0 {
            return Err(StoreError::conflict(
                "approval",
                next.id,
                format!("version {expected} replaced concurrently"),
            ));
        }
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp encoding. Fixed width, so text order is time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

/// Map a libSQL failure onto the storage taxonomy. Busy, locked, I/O, and
/// open failures mean the backend is unreachable right now.
fn db_err(op: &str, e: libsql::Error) -> StoreError {
    match e {
        libsql::Error::ConnectionFailed(reason) => StoreError::Unavailable(format!("{op}: {reason}")),
        libsql::Error::SqliteFailure(code, reason) if matches!(code & 0xff, 5 | 6 | 10 | 14) => {
            StoreError::Unavailable(format!("{op}: {reason}"))
        }
        other => StoreError::Query(format!("{op}: {other}")),
    }
}

fn row_err(op: &str) -> impl Fn(libsql::Error) -> StoreError + '_ {
    move |e| StoreError::Query(format!("{op} row parse: {e}"))
}

/// Column order matches `APPROVAL_COLUMNS`.
fn row_to_approval(row: &libsql::Row) -> Result<Approval, StoreError> {
    let err = row_err("approval");
    let id: String = row.get(0).map_err(&err)?;
    let payload: String = row.get(3).map_err(&err)?;
    let status: String = row.get(4).map_err(&err)?;
    let attempts: i64 = row.get(5).map_err(&err)?;
    let version: i64 = row.get(7).map_err(&err)?;
    let next_attempt_at: Option<String> = row.get(8).ok();
    let job_ref: Option<String> = row.get(9).ok();
    let lease_claimant: Option<String> = row.get(10).ok();
    let lease_until: Option<String> = row.get(11).ok();
    let archived: i64 = row.get(12).map_err(&err)?;
    let created_at: String = row.get(13).map_err(&err)?;
    let updated_at: String = row.get(14).map_err(&err)?;

    let lease = match (lease_claimant, lease_until) {
        (Some(claimant), Some(until)) => Some(ClaimLease {
            claimant,
            until: parse_datetime(&until)?,
        }),
        _ => None,
    };

    Ok(Approval {
        id: parse_uuid(&id)?,
        channel: row.get(1).map_err(&err)?,
        target: row.get(2).map_err(&err)?,
        payload: serde_json::from_str(&payload)?,
        status: status.parse().map_err(StoreError::Serialization)?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.get(6).ok(),
        version: version.max(0) as u64,
        next_attempt_at: parse_optional_datetime(next_attempt_at)?,
        job_ref: job_ref.as_deref().map(parse_uuid).transpose()?,
        lease,
        archived: archived != 0,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn subject_parts(subject: EventSubject) -> (&'static str, Uuid) {
    match subject {
        EventSubject::Approval(id) => ("approval", id),
        EventSubject::Job(id) => ("job", id),
    }
}

fn row_to_event(row: &libsql::Row) -> Result<Event, StoreError> {
    let err = row_err("event");
    let id: String = row.get(0).map_err(&err)?;
    let kind: String = row.get(1).map_err(&err)?;
    let subject_id: String = row.get(2).map_err(&err)?;
    let event_type: String = row.get(3).map_err(&err)?;
    let correlation_id: String = row.get(4).map_err(&err)?;
    let details: String = row.get(5).map_err(&err)?;
    let created_at: String = row.get(6).map_err(&err)?;

    let subject_id = parse_uuid(&subject_id)?;
    let subject = match kind.as_str() {
        "approval" => EventSubject::Approval(subject_id),
        "job" => EventSubject::Job(subject_id),
        other => return Err(StoreError::Serialization(format!("unknown subject kind {other}"))),
    };
    let event_type: EventType = serde_json::from_value(serde_json::Value::String(event_type))?;

    Ok(Event {
        id: parse_uuid(&id)?,
        subject,
        event_type,
        timestamp: parse_datetime(&created_at)?,
        correlation_id: parse_uuid(&correlation_id)?,
        details: serde_json::from_str(&details)?,
    })
}

// ── Approvals ───────────────────────────────────────────────────────

#[async_trait]
impl ApprovalStore for LibSqlStore {
    async fn insert(&self, approval: &Approval) -> Result<(), StoreError> {
        let (claimant, until) = match &approval.lease {
            Some(lease) => (Value::Text(lease.claimant.clone()), Value::Text(ts(lease.until))),
            None => (Value::Null, Value::Null),
        };
        let result = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO approvals ({APPROVAL_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    approval.id.to_string(),
                    approval.channel.clone(),
                    approval.target.clone(),
                    serde_json::to_string(&approval.payload)?,
                    approval.status.as_str(),
                    i64::from(approval.attempts),
                    opt_text(approval.last_error.as_deref()),
                    approval.version as i64,
                    opt_text(approval.next_attempt_at.map(ts).as_deref()),
                    opt_text(approval.job_ref.map(|j| j.to_string()).as_deref()),
                    claimant,
                    until,
                    i64::from(approval.archived),
                    ts(approval.created_at),
                    ts(approval.updated_at),
                ],
            )
            .await;

        match result {
            Ok(_) => {
                debug!(approval_id = %approval.id, "Approval inserted into DB");
                Ok(())
            }
            Err(libsql::Error::SqliteFailure(code, _)) if code & 0xff == 19 => {
                Err(StoreError::conflict("approval", approval.id, "already exists"))
            }
            Err(e) => Err(db_err("insert_approval", e)),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Approval>, StoreError> {
        self.fetch_approval(id).await
    }

    async fn list_by_status(
        &self,
        status: ApprovalStatus,
        limit: usize,
    ) -> Result<Vec<Approval>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approvals
                     WHERE status = ?1 AND archived = 0
                     ORDER BY created_at ASC LIMIT ?2"
                ),
                params![status.as_str(), i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|e| db_err("list_by_status", e))?;

        let mut approvals = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| db_err("list_by_status", e))? {
            match row_to_approval(&row) {
                Ok(approval) => approvals.push(approval),
                Err(e) => tracing::warn!("Skipping approval row: {e}"),
            }
        }
        Ok(approvals)
    }

    async fn list_claimable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Approval>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approvals
                     WHERE status = 'approved' AND archived = 0
                       AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                       AND (lease_until IS NULL OR lease_until <= ?1)
                     ORDER BY created_at ASC LIMIT ?2"
                ),
                params![ts(now), i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|e| db_err("list_claimable", e))?;

        let mut approvals = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| db_err("list_claimable", e))? {
            match row_to_approval(&row) {
                Ok(approval) => approvals.push(approval),
                Err(e) => tracing::warn!("Skipping approval row: {e}"),
            }
        }
        Ok(approvals)
    }

    async fn claim(
        &self,
        id: Uuid,
        expected_version: u64,
        lease: ClaimLease,
        now: DateTime<Utc>,
    ) -> Result<Approval, StoreError> {
        let mut current = self
            .fetch_approval(id)
            .await?
            .ok_or_else(|| StoreError::not_found("approval", id))?;
        check_claim(&current, expected_version, &lease.claimant, now)?;

        current.lease = Some(lease);
        current.version += 1;
        current.updated_at = now;
        self.compare_and_swap(&current, expected_version).await?;
        debug!(approval_id = %id, version = current.version, "Approval claimed");
        Ok(current)
    }

    async fn update(
        &self,
        id: Uuid,
        patch: ApprovalPatch,
        expected_version: u64,
    ) -> Result<Approval, StoreError> {
        let mut current = self
            .fetch_approval(id)
            .await?
            .ok_or_else(|| StoreError::not_found("approval", id))?;
        if current.version != expected_version {
            return Err(StoreError::conflict(
                "approval",
                id,
                format!("expected version {expected_version}, found {}", current.version),
            ));
        }
        check_patch(&current, &patch)?;

        current.apply(&patch, Utc::now());
        self.compare_and_swap(&current, expected_version).await?;
        Ok(current)
    }

    async fn archive_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let affected = self
            .conn()
            .execute(
                &format!(
                    "UPDATE approvals SET archived = 1
                     WHERE archived = 0 AND status IN {TERMINAL_STATUSES} AND updated_at < ?1"
                ),
                params![ts(cutoff)],
            )
            .await
            .map_err(|e| db_err("archive_terminal_before", e))?;
        Ok(affected as usize)
    }
}

// ── Event ledger ────────────────────────────────────────────────────

#[async_trait]
impl EventLedger for LibSqlStore {
    async fn append(&self, event: &Event) -> Result<(), StoreError> {
        let (kind, subject_id) = subject_parts(event.subject);
        self.conn()
            .execute(
                "INSERT INTO events (id, subject_kind, subject_id, event_type, correlation_id, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.id.to_string(),
                    kind,
                    subject_id.to_string(),
                    event.event_type.as_str(),
                    event.correlation_id.to_string(),
                    serde_json::to_string(&event.details)?,
                    ts(event.timestamp),
                ],
            )
            .await
            .map_err(|e| db_err("append_event", e))?;
        Ok(())
    }

    async fn list_for(&self, subject: EventSubject) -> Result<Vec<Event>, StoreError> {
        let (kind, subject_id) = subject_parts(subject);
        let mut rows = self
            .conn()
            .query(
                "SELECT id, subject_kind, subject_id, event_type, correlation_id, details, created_at
                 FROM events WHERE subject_kind = ?1 AND subject_id = ?2
                 ORDER BY created_at ASC, rowid ASC",
                params![kind, subject_id.to_string()],
            )
            .await
            .map_err(|e| db_err("list_events", e))?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| db_err("list_events", e))? {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }
}

// ── Rate counters ───────────────────────────────────────────────────

impl LibSqlStore {
    async fn counter(&self, channel: &str, key: &str) -> Result<u32, StoreError> {
        count_in(self.conn(), channel, key).await
    }
}

async fn count_in(conn: &Connection, channel: &str, key: &str) -> Result<u32, StoreError> {
    let mut rows = conn
        .query(
            "SELECT count FROM rate_counters WHERE channel = ?1 AND window_key = ?2",
            params![channel, key],
        )
        .await
        .map_err(|e| db_err("rate_counter", e))?;
    match rows.next().await.map_err(|e| db_err("rate_counter", e))? {
        Some(row) => {
            let count: i64 = row.get(0).map_err(row_err("rate_counter"))?;
            Ok(u32::try_from(count).unwrap_or(u32::MAX))
        }
        None => Ok(0),
    }
}

async fn increment_in(conn: &Connection, channel: &str, key: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO rate_counters (channel, window_key, count) VALUES (?1, ?2, 1)
         ON CONFLICT (channel, window_key) DO UPDATE SET count = count + 1",
        params![channel, key],
    )
    .await
    .map_err(|e| db_err("rate_counter_bump", e))?;
    Ok(())
}

#[async_trait]
impl RateLimitCounter for LibSqlStore {
    async fn snapshot(&self, channel: &str, keys: &WindowKeys) -> Result<RateSnapshot, StoreError> {
        Ok(RateSnapshot {
            hourly: self.counter(channel, &keys.hourly).await?,
            daily: self.counter(channel, &keys.daily).await?,
        })
    }

    /// Check both buckets and bump both inside one immediate transaction, so
    /// no reader ever sees one window moved without the other.
    async fn try_acquire(
        &self,
        channel: &str,
        keys: &WindowKeys,
        caps: ChannelCaps,
    ) -> Result<bool, StoreError> {
        // The connection is shared; only one transaction may be open on it.
        let _serial = self.counter_lock.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| db_err("rate_counter_begin", e))?;

        let current = RateSnapshot {
            hourly: count_in(&tx, channel, &keys.hourly).await?,
            daily: count_in(&tx, channel, &keys.daily).await?,
        };
        let acquired = caps.exceeded(&current).is_none();
        if acquired {
            increment_in(&tx, channel, &keys.hourly).await?;
            increment_in(&tx, channel, &keys.daily).await?;
        }
        tx.commit().await.map_err(|e| db_err("rate_counter_commit", e))?;
        Ok(acquired)
    }
}

// ── Suppression list ────────────────────────────────────────────────

#[async_trait]
impl DncSource for LibSqlStore {
    async fn load(&self) -> Result<DncSet, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT identity, channel, reason FROM dnc_entries", ())
            .await
            .map_err(|e| db_err("load_dnc", e))?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| db_err("load_dnc", e))? {
            let err = row_err("dnc");
            entries.push(DncEntry {
                identity: row.get(0).map_err(&err)?,
                channel: row.get(1).map_err(&err)?,
                reason: row.get(2).map_err(&err)?,
            });
        }
        Ok(DncSet::from_entries(entries))
    }
}

// ── Browser jobs ────────────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlStore {
    async fn save(&self, job: &BrowserJob) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO browser_jobs (id, state, data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (id) DO UPDATE SET state = excluded.state,
                     data = excluded.data, updated_at = excluded.updated_at",
                params![
                    job.id.to_string(),
                    job.state.as_str(),
                    serde_json::to_string(job)?,
                    ts(job.created_at),
                    ts(job.updated_at),
                ],
            )
            .await
            .map_err(|e| db_err("save_job", e))?;
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<BrowserJob>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT data FROM browser_jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| db_err("load_job", e))?;
        match rows.next().await.map_err(|e| db_err("load_job", e))? {
            Some(row) => {
                let data: String = row.get(0).map_err(row_err("load_job"))?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn list_active(&self) -> Result<Vec<BrowserJob>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT data FROM browser_jobs WHERE state NOT IN {TERMINAL_JOB_STATES}
                     ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| db_err("list_active_jobs", e))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| db_err("list_active_jobs", e))? {
            let data: String = row.get(0).map_err(row_err("list_active_jobs"))?;
            match serde_json::from_str::<BrowserJob>(&data) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }
}
