//! `SQLite`-backed audit ledger.
//!
//! The ledger uses WAL mode so readers proceed while a write is in flight.
//! Append-only semantics are enforced by the schema's triggers; this module
//! adds the one sanctioned mutation, the seal execution transition, as a
//! conditional update so that at most one caller ever observes success.

// SQLite returns i64 for counts; they are never negative here.
#![allow(clippy::cast_sign_loss, clippy::missing_panics_doc)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use super::records::{
    AgentCount, AuditRecord, AuditStats, AuthEvent, AuthEventRecord, ExecutionOutcome,
    ManifestRecord, Page, ProviderCount, QueryFilters, ReasonCount,
};
use crate::manifest::{truncate_to_seconds, Manifest};
use crate::seal::Seal;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Database error from `SQLite`.
    ///
    /// Trigger aborts from immutability violations surface here with the
    /// trigger's message.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A manifest with this id already exists.
    #[error("manifest already recorded: {manifest_id}")]
    DuplicateManifest {
        /// The colliding identifier.
        manifest_id: Uuid,
    },

    /// No manifest with this id exists.
    #[error("manifest not found: {manifest_id}")]
    ManifestNotFound {
        /// The missing identifier.
        manifest_id: Uuid,
    },

    /// No seal with this id exists.
    #[error("seal not found: {seal_id}")]
    SealNotFound {
        /// The missing identifier.
        seal_id: String,
    },

    /// A stored value could not be decoded.
    #[error("corrupt record: {message}")]
    Corrupt {
        /// What failed to decode.
        message: String,
    },
}

/// The append-mostly audit ledger.
///
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct AuditLedger {
    conn: Arc<Mutex<Connection>>,
}

impl AuditLedger {
    /// Opens or creates a ledger at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A handle to the shared connection, for stores layered on the same
    /// database.
    #[must_use]
    pub fn handle(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Appends a manifest and its seal in a single transaction.
    ///
    /// If the append fails nothing is inserted, and the caller must not
    /// hand the seal to the client.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DuplicateManifest`] on a manifest-id
    /// collision, or a database error otherwise.
    pub fn append(&self, manifest: &Manifest, seal: &Seal) -> Result<(), LedgerError> {
        let parameters = serde_json::to_string(&manifest.action.parameters)
            .map_err(|e| LedgerError::Corrupt {
                message: format!("parameters not serializable: {e}"),
            })?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO manifests (manifest_id, created_at, agent_id, org_id, user_id,
                                    provider, method, parameters, reasoning,
                                    confidence_score, environment, raw_manifest)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                manifest.manifest_id.to_string(),
                format_time(manifest.created_at),
                manifest.agent.agent_id,
                manifest.agent.org_id,
                manifest.agent.user_id,
                manifest.action.provider,
                manifest.action.method,
                parameters,
                manifest.justification.reasoning,
                manifest.justification.confidence_score,
                manifest.environment,
                manifest.raw_manifest,
            ],
        );

        if let Err(e) = inserted {
            return Err(classify_unique_violation(e, manifest.manifest_id));
        }

        tx.execute(
            "INSERT INTO seals (seal_id, manifest_id, approved, policy_version,
                                denial_reason, signature, public_key,
                                issued_at, expires_at, was_executed, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL)",
            params![
                seal.seal_id,
                seal.manifest_id.to_string(),
                seal.approved,
                seal.policy_version,
                seal.denial_reason,
                seal.signature,
                seal.public_key,
                format_time(seal.issued_at),
                format_time(seal.expires_at),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Reads a manifest by id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ManifestNotFound`] if no such manifest exists.
    pub fn get_manifest(&self, manifest_id: Uuid) -> Result<ManifestRecord, LedgerError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT manifest_id, created_at, agent_id, org_id, user_id, provider, method,
                    parameters, reasoning, confidence_score, environment, raw_manifest
             FROM manifests WHERE manifest_id = ?1",
        )?;

        stmt.query_row(params![manifest_id.to_string()], row_to_manifest)
            .optional()?
            .map_or(
                Err(LedgerError::ManifestNotFound { manifest_id }),
                TryInto::try_into,
            )
    }

    /// Reads a seal by id, including execution state.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::SealNotFound`] if no such seal exists.
    pub fn get_seal(&self, seal_id: &str) -> Result<Seal, LedgerError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT seal_id, manifest_id, approved, policy_version, denial_reason,
                    signature, public_key, issued_at, expires_at, was_executed, executed_at
             FROM seals WHERE seal_id = ?1",
        )?;

        stmt.query_row(params![seal_id], row_to_seal)
            .optional()?
            .map_or_else(
                || {
                    Err(LedgerError::SealNotFound {
                        seal_id: seal_id.to_string(),
                    })
                },
                TryInto::try_into,
            )
    }

    /// Transitions a seal to executed, exactly once.
    ///
    /// The update is conditional on `was_executed = 0`, so concurrent
    /// callers race harmlessly: one wins, the rest observe
    /// [`ExecutionOutcome::AlreadyExecuted`] with the winner's timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::SealNotFound`] if no such seal exists.
    pub fn mark_executed(
        &self,
        seal_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, LedgerError> {
        let executed_at = truncate_to_seconds(now);

        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE seals SET was_executed = 1, executed_at = ?2
             WHERE seal_id = ?1 AND was_executed = 0",
            params![seal_id, format_time(executed_at)],
        )?;

        if updated == 1 {
            return Ok(ExecutionOutcome::Executed { executed_at });
        }

        let prior: Option<Option<String>> = conn
            .query_row(
                "SELECT executed_at FROM seals WHERE seal_id = ?1",
                params![seal_id],
                |row| row.get(0),
            )
            .optional()?;

        match prior {
            Some(Some(raw)) => Ok(ExecutionOutcome::AlreadyExecuted {
                executed_at: parse_time(&raw)?,
            }),
            // was_executed is set without a timestamp only if the schema
            // triggers were bypassed; report the record as corrupt.
            Some(None) => Err(LedgerError::Corrupt {
                message: format!("seal {seal_id} executed without timestamp"),
            }),
            None => Err(LedgerError::SealNotFound {
                seal_id: seal_id.to_string(),
            }),
        }
    }

    /// Queries the ledger, most recent first.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub fn query(
        &self,
        filters: &QueryFilters,
        page: Page,
    ) -> Result<Vec<AuditRecord>, LedgerError> {
        let (where_sql, params_vec) = build_filter_clause(filters);

        let sql = format!(
            "SELECT m.manifest_id, m.created_at, m.agent_id, m.org_id, m.provider, m.method,
                    m.parameters, m.reasoning, m.environment,
                    s.approved, s.policy_version, s.denial_reason, s.seal_id, s.was_executed
             FROM manifests m
             JOIN seals s ON s.manifest_id = m.manifest_id
             {where_sql}
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT ?{limit_idx} OFFSET ?{offset_idx}",
            limit_idx = params_vec.len() + 1,
            offset_idx = params_vec.len() + 2,
        );

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;

        let mut bound: Vec<Box<dyn rusqlite::ToSql>> = params_vec;
        bound.push(Box::new(i64::from(page.clamped_limit())));
        bound.push(Box::new(i64::from(page.offset)));

        let refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(AsRef::as_ref).collect();
        let rows = stmt
            .query_map(refs.as_slice(), row_to_audit_record)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Computes aggregate statistics over the filtered window.
    ///
    /// # Errors
    ///
    /// Returns a database error if any aggregate query fails.
    pub fn stats(&self, filters: &QueryFilters) -> Result<AuditStats, LedgerError> {
        let (where_sql, params_vec) = build_filter_clause(filters);
        let refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(AsRef::as_ref).collect();

        let conn = self.conn.lock().unwrap();

        let base = format!(
            "FROM manifests m JOIN seals s ON s.manifest_id = m.manifest_id {where_sql}"
        );

        let (total, approved, denied, executed): (i64, i64, i64, i64) = conn.query_row(
            &format!(
                "SELECT COUNT(*),
                        COALESCE(SUM(s.approved), 0),
                        COALESCE(SUM(1 - s.approved), 0),
                        COALESCE(SUM(s.was_executed), 0)
                 {base}"
            ),
            refs.as_slice(),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let by_provider = {
            let mut stmt = conn.prepare(&format!(
                "SELECT m.provider, COUNT(*) AS n {base}
                 GROUP BY m.provider ORDER BY n DESC, m.provider ASC"
            ))?;
            let rows = stmt
                .query_map(refs.as_slice(), |row| {
                    Ok(ProviderCount {
                        provider: row.get(0)?,
                        count: row.get::<_, i64>(1)? as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let top_agents = {
            let mut stmt = conn.prepare(&format!(
                "SELECT m.agent_id, COUNT(*) AS n {base}
                 GROUP BY m.agent_id ORDER BY n DESC, m.agent_id ASC LIMIT 5"
            ))?;
            let rows = stmt
                .query_map(refs.as_slice(), |row| {
                    Ok(AgentCount {
                        agent_id: row.get(0)?,
                        count: row.get::<_, i64>(1)? as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let denials_by_reason = {
            let glue = if where_sql.is_empty() { "WHERE" } else { "AND" };
            let mut stmt = conn.prepare(&format!(
                "SELECT COALESCE(s.denial_reason, 'unspecified'), COUNT(*) AS n {base}
                 {glue} s.approved = 0
                 GROUP BY s.denial_reason ORDER BY n DESC"
            ))?;
            let rows = stmt
                .query_map(refs.as_slice(), |row| {
                    Ok(ReasonCount {
                        reason: row.get(0)?,
                        count: row.get::<_, i64>(1)? as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let approval_rate = if total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let rate = approved as f64 / total as f64 * 100.0;
            (rate * 100.0).round() / 100.0
        } else {
            0.0
        };

        Ok(AuditStats {
            total: total as u64,
            approved: approved as u64,
            denied: denied as u64,
            executed: executed as u64,
            approval_rate,
            by_provider,
            top_agents,
            denials_by_reason,
        })
    }

    /// Appends an authentication event to the forensic trail.
    ///
    /// # Errors
    ///
    /// Returns a database error if the insert fails.
    pub fn record_auth_event(&self, event: &AuthEvent) -> Result<(), LedgerError> {
        let kind = event
            .kind
            .map_or("auth_failure", super::records::AuthEventKind::as_str);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO auth_events (event_id, event_type, agent_id, org_id, endpoint,
                                      ip, success, failure_reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Uuid::new_v4().to_string(),
                kind,
                event.agent_id,
                event.org_id,
                event.endpoint,
                event.ip,
                event.success,
                event.failure_reason,
                format_time(truncate_to_seconds(Utc::now())),
            ],
        )?;
        Ok(())
    }

    /// Reads auth events, most recent first. Primarily for tests and
    /// forensics tooling.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub fn auth_events(&self, limit: u32) -> Result<Vec<AuthEventRecord>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_id, event_type, agent_id, org_id, endpoint, ip, success,
                    failure_reason, created_at
             FROM auth_events ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![i64::from(limit)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(event_id, event_type, agent_id, org_id, endpoint, ip, success, reason, at)| {
                    Ok(AuthEventRecord {
                        event_id: parse_uuid(&event_id)?,
                        event_type,
                        agent_id,
                        org_id,
                        endpoint,
                        ip,
                        success,
                        failure_reason: reason,
                        created_at: parse_time(&at)?,
                    })
                },
            )
            .collect()
    }

    /// Pings the database with a trivial query.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

/// Builds the WHERE clause and owned parameters for the shared filters.
fn build_filter_clause(filters: &QueryFilters) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(org_id) = &filters.org_id {
        bound.push(Box::new(org_id.clone()));
        clauses.push(format!("m.org_id = ?{}", bound.len()));
    }
    if let Some(agent_id) = &filters.agent_id {
        bound.push(Box::new(agent_id.clone()));
        clauses.push(format!("m.agent_id = ?{}", bound.len()));
    }
    if let Some(provider) = &filters.provider {
        bound.push(Box::new(provider.clone()));
        clauses.push(format!("m.provider = ?{}", bound.len()));
    }
    if let Some(approved) = filters.approved {
        bound.push(Box::new(approved));
        clauses.push(format!("s.approved = ?{}", bound.len()));
    }
    if let Some(after) = filters.created_after {
        bound.push(Box::new(format_time(after)));
        clauses.push(format!("m.created_at >= ?{}", bound.len()));
    }
    if let Some(before) = filters.created_before {
        bound.push(Box::new(format_time(before)));
        clauses.push(format!("m.created_at <= ?{}", bound.len()));
    }

    if clauses.is_empty() {
        (String::new(), bound)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), bound)
    }
}

/// Maps a unique-constraint violation on `manifests.manifest_id` to the
/// typed duplicate error; everything else passes through.
fn classify_unique_violation(e: rusqlite::Error, manifest_id: Uuid) -> LedgerError {
    if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &e {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation
            && message.contains("manifests.manifest_id")
        {
            return LedgerError::DuplicateManifest { manifest_id };
        }
    }
    LedgerError::Database(e)
}

fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt {
            message: format!("bad timestamp '{raw}': {e}"),
        })
}

fn parse_uuid(raw: &str) -> Result<Uuid, LedgerError> {
    Uuid::parse_str(raw).map_err(|e| LedgerError::Corrupt {
        message: format!("bad uuid '{raw}': {e}"),
    })
}

/// Decodes a manifest row; fallible string decoding is deferred so the
/// rusqlite row mapper stays infallible.
fn row_to_manifest(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawManifestRow> {
    Ok(RawManifestRow {
        manifest_id: row.get(0)?,
        created_at: row.get(1)?,
        agent_id: row.get(2)?,
        org_id: row.get(3)?,
        user_id: row.get(4)?,
        provider: row.get(5)?,
        method: row.get(6)?,
        parameters: row.get(7)?,
        reasoning: row.get(8)?,
        confidence_score: row.get(9)?,
        environment: row.get(10)?,
        raw_manifest: row.get(11)?,
    })
}

struct RawManifestRow {
    manifest_id: String,
    created_at: String,
    agent_id: String,
    org_id: String,
    user_id: Option<String>,
    provider: String,
    method: String,
    parameters: String,
    reasoning: String,
    confidence_score: Option<f64>,
    environment: String,
    raw_manifest: String,
}

impl TryFrom<RawManifestRow> for ManifestRecord {
    type Error = LedgerError;

    fn try_from(raw: RawManifestRow) -> Result<Self, LedgerError> {
        Ok(Self {
            manifest_id: parse_uuid(&raw.manifest_id)?,
            created_at: parse_time(&raw.created_at)?,
            agent_id: raw.agent_id,
            org_id: raw.org_id,
            user_id: raw.user_id,
            provider: raw.provider,
            method: raw.method,
            parameters: serde_json::from_str(&raw.parameters).map_err(|e| {
                LedgerError::Corrupt {
                    message: format!("bad parameters json: {e}"),
                }
            })?,
            reasoning: raw.reasoning,
            confidence_score: raw.confidence_score,
            environment: raw.environment,
            raw_manifest: raw.raw_manifest,
        })
    }
}

fn row_to_seal(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSealRow> {
    Ok(RawSealRow {
        seal_id: row.get(0)?,
        manifest_id: row.get(1)?,
        approved: row.get(2)?,
        policy_version: row.get(3)?,
        denial_reason: row.get(4)?,
        signature: row.get(5)?,
        public_key: row.get(6)?,
        issued_at: row.get(7)?,
        expires_at: row.get(8)?,
        was_executed: row.get(9)?,
        executed_at: row.get(10)?,
    })
}

struct RawSealRow {
    seal_id: String,
    manifest_id: String,
    approved: bool,
    policy_version: String,
    denial_reason: Option<String>,
    signature: String,
    public_key: String,
    issued_at: String,
    expires_at: String,
    was_executed: bool,
    executed_at: Option<String>,
}

impl TryFrom<RawSealRow> for Seal {
    type Error = LedgerError;

    fn try_from(raw: RawSealRow) -> Result<Self, LedgerError> {
        Ok(Self {
            seal_id: raw.seal_id,
            manifest_id: parse_uuid(&raw.manifest_id)?,
            approved: raw.approved,
            policy_version: raw.policy_version,
            denial_reason: raw.denial_reason,
            signature: raw.signature,
            public_key: raw.public_key,
            issued_at: parse_time(&raw.issued_at)?,
            expires_at: parse_time(&raw.expires_at)?,
            was_executed: raw.was_executed,
            executed_at: raw.executed_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

fn row_to_audit_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAuditRow> {
    Ok(RawAuditRow {
        manifest_id: row.get(0)?,
        created_at: row.get(1)?,
        agent_id: row.get(2)?,
        org_id: row.get(3)?,
        provider: row.get(4)?,
        method: row.get(5)?,
        parameters: row.get(6)?,
        reasoning: row.get(7)?,
        environment: row.get(8)?,
        approved: row.get(9)?,
        policy_version: row.get(10)?,
        denial_reason: row.get(11)?,
        seal_id: row.get(12)?,
        was_executed: row.get(13)?,
    })
}

struct RawAuditRow {
    manifest_id: String,
    created_at: String,
    agent_id: String,
    org_id: String,
    provider: String,
    method: String,
    parameters: String,
    reasoning: String,
    environment: String,
    approved: bool,
    policy_version: String,
    denial_reason: Option<String>,
    seal_id: String,
    was_executed: bool,
}

impl TryFrom<RawAuditRow> for AuditRecord {
    type Error = LedgerError;

    fn try_from(raw: RawAuditRow) -> Result<Self, LedgerError> {
        Ok(Self {
            manifest_id: parse_uuid(&raw.manifest_id)?,
            created_at: parse_time(&raw.created_at)?,
            agent_id: raw.agent_id,
            org_id: raw.org_id,
            provider: raw.provider,
            method: raw.method,
            parameters: serde_json::from_str(&raw.parameters).map_err(|e| {
                LedgerError::Corrupt {
                    message: format!("bad parameters json: {e}"),
                }
            })?,
            reasoning: raw.reasoning,
            environment: raw.environment,
            approved: raw.approved,
            policy_version: raw.policy_version,
            denial_reason: raw.denial_reason,
            seal_id: raw.seal_id,
            was_executed: raw.was_executed,
        })
    }
}
