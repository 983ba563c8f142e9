//! Registry of organizations and agents.
//!
//! The registry shares the ledger's database so creation, deactivation, and
//! the audit trail live behind one durable store. The schema permits
//! updates only to the `active` flags; neither table supports deletion.

#![allow(clippy::missing_panics_doc)]

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::manifest::truncate_to_seconds;
use crate::seal::types::rfc3339_secs;

/// Errors raised by registry operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No organization with this id exists.
    #[error("organization not found: {org_id}")]
    OrgNotFound {
        /// The missing identifier.
        org_id: String,
    },

    /// No agent with this id exists.
    #[error("agent not found: {agent_id}")]
    AgentNotFound {
        /// The missing identifier.
        agent_id: String,
    },

    /// An organization or agent with this id already exists.
    #[error("identifier already registered: {id}")]
    AlreadyRegistered {
        /// The colliding identifier.
        id: String,
    },

    /// A stored value could not be decoded.
    #[error("corrupt record: {message}")]
    Corrupt {
        /// What failed to decode.
        message: String,
    },
}

/// A registered organization.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Organization {
    /// Unique organization identifier, `org_<16 hex>`.
    pub org_id: String,

    /// Display name.
    pub org_name: String,

    /// Operator contact address.
    pub contact_email: String,

    /// When the organization was registered.
    #[serde(with = "rfc3339_secs")]
    pub created_at: DateTime<Utc>,

    /// Whether the organization is active. Deactivation is the only
    /// mutation the store permits.
    pub active: bool,
}

/// A registered agent, scoped to exactly one organization.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Agent {
    /// Unique agent identifier.
    pub agent_id: String,

    /// Owning organization.
    pub org_id: String,

    /// Display name.
    pub agent_name: String,

    /// Free-text description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// SHA-256 hash of the agent's API key, when one was issued.
    #[serde(skip)]
    pub api_key_hash: Option<String>,

    /// When the agent was registered.
    #[serde(with = "rfc3339_secs")]
    pub created_at: DateTime<Utc>,

    /// Whether the agent is active. Tokens for inactive agents fail
    /// validation.
    pub active: bool,
}

/// Registry of organizations and agents over the shared database.
#[derive(Clone)]
pub struct IdentityStore {
    conn: Arc<Mutex<Connection>>,
}

impl IdentityStore {
    /// Creates a registry over an existing database handle.
    ///
    /// The schema is applied by [`crate::ledger::AuditLedger`]; construct
    /// the ledger first and share its handle.
    #[must_use]
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Generates an organization identifier: `org_<16 hex>`.
    #[must_use]
    pub fn generate_org_id() -> String {
        format!("org_{}", random_hex(8))
    }

    /// Generates an agent identifier: `agent_<16 hex>`.
    #[must_use]
    pub fn generate_agent_id() -> String {
        format!("agent_{}", random_hex(8))
    }

    /// The deterministic identifier of an organization's bootstrap agent.
    #[must_use]
    pub fn admin_agent_id(org_id: &str) -> String {
        format!("agent_{org_id}_admin")
    }

    /// Registers an organization.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::AlreadyRegistered`] on an id collision.
    pub fn create_org(
        &self,
        org_id: &str,
        org_name: &str,
        contact_email: &str,
    ) -> Result<Organization, IdentityError> {
        let created_at = truncate_to_seconds(Utc::now());

        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT INTO organizations (org_id, org_name, contact_email, created_at, active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![org_id, org_name, contact_email, format_time(created_at)],
        );
        map_unique(inserted, org_id)?;

        Ok(Organization {
            org_id: org_id.to_string(),
            org_name: org_name.to_string(),
            contact_email: contact_email.to_string(),
            created_at,
            active: true,
        })
    }

    /// Reads an organization by id.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::OrgNotFound`] if no such organization
    /// exists.
    pub fn get_org(&self, org_id: &str) -> Result<Organization, IdentityError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT org_id, org_name, contact_email, created_at, active
                 FROM organizations WHERE org_id = ?1",
                params![org_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()?;

        let (org_id, org_name, contact_email, created_at, active) =
            row.ok_or_else(|| IdentityError::OrgNotFound {
                org_id: org_id.to_string(),
            })?;

        Ok(Organization {
            org_id,
            org_name,
            contact_email,
            created_at: parse_time(&created_at)?,
            active,
        })
    }

    /// Registers an agent under an organization.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::OrgNotFound`] if the organization does not
    /// exist and [`IdentityError::AlreadyRegistered`] on an id collision.
    pub fn create_agent(
        &self,
        agent_id: &str,
        org_id: &str,
        agent_name: &str,
        description: Option<&str>,
        api_key_hash: Option<&str>,
    ) -> Result<Agent, IdentityError> {
        // Surface a clean error rather than a foreign-key failure.
        self.get_org(org_id)?;

        let created_at = truncate_to_seconds(Utc::now());

        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT INTO agents (agent_id, org_id, agent_name, description, api_key_hash,
                                 created_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
            params![
                agent_id,
                org_id,
                agent_name,
                description,
                api_key_hash,
                format_time(created_at)
            ],
        );
        map_unique(inserted, agent_id)?;

        Ok(Agent {
            agent_id: agent_id.to_string(),
            org_id: org_id.to_string(),
            agent_name: agent_name.to_string(),
            description: description.map(ToString::to_string),
            api_key_hash: api_key_hash.map(ToString::to_string),
            created_at,
            active: true,
        })
    }

    /// Reads an agent by id.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::AgentNotFound`] if no such agent exists.
    pub fn get_agent(&self, agent_id: &str) -> Result<Agent, IdentityError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT agent_id, org_id, agent_name, description, api_key_hash,
                        created_at, active
                 FROM agents WHERE agent_id = ?1",
                params![agent_id],
                row_to_agent,
            )
            .optional()?;

        let raw = row.ok_or_else(|| IdentityError::AgentNotFound {
            agent_id: agent_id.to_string(),
        })?;
        raw.try_into()
    }

    /// Lists an organization's agents, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub fn list_agents(&self, org_id: &str) -> Result<Vec<Agent>, IdentityError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT agent_id, org_id, agent_name, description, api_key_hash,
                    created_at, active
             FROM agents WHERE org_id = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt
            .query_map(params![org_id], row_to_agent)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Counts an organization's agents.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub fn count_agents(&self, org_id: &str) -> Result<u64, IdentityError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM agents WHERE org_id = ?1",
            params![org_id],
            |row| row.get(0),
        )?;
        #[allow(clippy::cast_sign_loss)]
        Ok(count as u64)
    }

    /// Activates or deactivates an agent.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::AgentNotFound`] if no such agent exists.
    pub fn set_agent_active(&self, agent_id: &str, active: bool) -> Result<(), IdentityError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE agents SET active = ?2 WHERE agent_id = ?1",
            params![agent_id, active],
        )?;
        if updated == 1 {
            Ok(())
        } else {
            Err(IdentityError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
        }
    }

    /// Activates or deactivates an organization.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::OrgNotFound`] if no such organization
    /// exists.
    pub fn set_org_active(&self, org_id: &str, active: bool) -> Result<(), IdentityError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE organizations SET active = ?2 WHERE org_id = ?1",
            params![org_id, active],
        )?;
        if updated == 1 {
            Ok(())
        } else {
            Err(IdentityError::OrgNotFound {
                org_id: org_id.to_string(),
            })
        }
    }

    /// True when the `(agent_id, org_id)` pair exists and the agent is
    /// active. Token validation requires this.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub fn agent_is_active(&self, agent_id: &str, org_id: &str) -> Result<bool, IdentityError> {
        let conn = self.conn.lock().unwrap();
        let active: Option<bool> = conn
            .query_row(
                "SELECT active FROM agents WHERE agent_id = ?1 AND org_id = ?2",
                params![agent_id, org_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(active.unwrap_or(false))
    }
}

/// Hashes an API key for storage.
#[must_use]
pub fn hash_api_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Verifies a presented API key against a stored hash in constant time.
#[must_use]
pub fn verify_api_key(presented: &str, stored_hash: &str) -> bool {
    let presented_hash = hash_api_key(presented);
    presented_hash
        .as_bytes()
        .ct_eq(stored_hash.as_bytes())
        .unwrap_u8()
        == 1
}

fn random_hex(bytes: usize) -> String {
    let mut hex = String::with_capacity(bytes * 2);
    for _ in 0..bytes {
        let byte: u8 = rand::random();
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

fn map_unique(result: rusqlite::Result<usize>, id: &str) -> Result<(), IdentityError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            if let rusqlite::Error::SqliteFailure(failure, Some(_)) = &e {
                if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                    return Err(IdentityError::AlreadyRegistered { id: id.to_string() });
                }
            }
            Err(IdentityError::Database(e))
        },
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, IdentityError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| IdentityError::Corrupt {
            message: format!("bad timestamp '{raw}': {e}"),
        })
}

type RawAgentRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    bool,
);

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAgentRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

impl TryFrom<RawAgentRow> for Agent {
    type Error = IdentityError;

    fn try_from(raw: RawAgentRow) -> Result<Self, IdentityError> {
        let (agent_id, org_id, agent_name, description, api_key_hash, created_at, active) = raw;
        Ok(Self {
            agent_id,
            org_id,
            agent_name,
            description,
            api_key_hash,
            created_at: parse_time(&created_at)?,
            active,
        })
    }
}
