//! SQLite-backed implementations of the core storage traits.
//!
//! One WAL-mode connection is shared by all four stores; each store is a
//! cheap clonable handle. The identity update is a compare-and-swap on
//! the `version` column (`UPDATE ... WHERE id = ? AND version = ?`), so
//! concurrent transitions serialize exactly like the in-memory stores.
//!
//! The audit table satisfies its append-only guarantee physically: this
//! module contains its only INSERT and no UPDATE or DELETE path exists.

// SQLite returns i64 for row IDs, counts, and timestamps; all values here
// are non-negative and well under the i64 range.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use siv_core::audit::{AuditAction, AuditEntry, AuditError, AuditLog, AuditOutcome};
use siv_core::blob::{BlobError, BlobStore};
use siv_core::identity::{Identity, VerificationStatus};
use siv_core::ingest::sha256_hex;
use siv_core::store::{AppealStore, IdentityStore, StoreError};
use siv_core::{Appeal, AppealStatus};
use thiserror::Error;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur opening the database.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DatabaseError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Shared handle to the daemon's SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens or creates the database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
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

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Identity store handle over this database.
    #[must_use]
    pub fn identities(&self) -> SqliteIdentityStore {
        SqliteIdentityStore {
            conn: Arc::clone(&self.conn),
        }
    }

    /// Audit log handle over this database.
    #[must_use]
    pub fn audit(&self) -> SqliteAuditLog {
        SqliteAuditLog {
            conn: Arc::clone(&self.conn),
        }
    }

    /// Appeal store handle over this database.
    #[must_use]
    pub fn appeals(&self) -> SqliteAppealStore {
        SqliteAppealStore {
            conn: Arc::clone(&self.conn),
        }
    }

    /// Blob store handle over this database.
    #[must_use]
    pub fn blobs(&self) -> SqliteBlobStore {
        SqliteBlobStore {
            conn: Arc::clone(&self.conn),
        }
    }
}

fn backend<E: std::fmt::Display>(err: E) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        claimed_full_name: row.get(2)?,
        claimed_institution_id: row.get(3)?,
        claimed_external_id: row.get(4)?,
        document_key: row.get(5)?,
        document_hash: row.get(6)?,
        status: parse_status(&row.get::<_, String>(7)?)?,
        confidence_score: row.get(8)?,
        status_reason: row.get(9)?,
        verified_at: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        verified_by: row.get(11)?,
        document_expires_at: row.get::<_, Option<i64>>(12)?.map(|v| v as u64),
        verification_expires_at: row.get::<_, Option<i64>>(13)?.map(|v| v as u64),
        created_at: row.get::<_, i64>(14)? as u64,
        updated_at: row.get::<_, i64>(15)? as u64,
        version: row.get::<_, i64>(16)? as u64,
    })
}

fn parse_status(value: &str) -> rusqlite::Result<VerificationStatus> {
    VerificationStatus::parse(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown verification status: {value}").into(),
        )
    })
}

fn parse_appeal_status(value: &str) -> rusqlite::Result<AppealStatus> {
    AppealStatus::parse(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown appeal status: {value}").into(),
        )
    })
}

const IDENTITY_COLUMNS: &str = "id, owner_id, claimed_full_name, claimed_institution_id, \
     claimed_external_id, document_key, document_hash, status, confidence_score, \
     status_reason, verified_at, verified_by, document_expires_at, \
     verification_expires_at, created_at, updated_at, version";

/// SQLite [`IdentityStore`].
#[derive(Clone)]
pub struct SqliteIdentityStore {
    conn: Arc<Mutex<Connection>>,
}

impl IdentityStore for SqliteIdentityStore {
    fn insert(&self, identity: &Identity) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let inserted = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO identities ({IDENTITY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    identity.id,
                    identity.owner_id,
                    identity.claimed_full_name,
                    identity.claimed_institution_id,
                    identity.claimed_external_id,
                    identity.document_key,
                    identity.document_hash,
                    identity.status.as_str(),
                    identity.confidence_score,
                    identity.status_reason,
                    identity.verified_at.map(|v| v as i64),
                    identity.verified_by,
                    identity.document_expires_at.map(|v| v as i64),
                    identity.verification_expires_at.map(|v| v as i64),
                    identity.created_at as i64,
                    identity.updated_at as i64,
                    identity.version as i64,
                ],
            )
            .map_err(backend)?;

        if inserted == 0 {
            return Err(StoreError::AlreadyExists {
                id: identity.id.clone(),
            });
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Identity, StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.query_row(
            &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
            params![id],
            identity_from_row,
        )
        .optional()
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    fn update(&self, identity: &Identity, expected_version: u64) -> Result<Identity, StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let changed = conn
            .execute(
                "UPDATE identities SET
                     document_key = ?1, document_hash = ?2, status = ?3,
                     confidence_score = ?4, status_reason = ?5, verified_at = ?6,
                     verified_by = ?7, document_expires_at = ?8,
                     verification_expires_at = ?9, updated_at = ?10,
                     version = version + 1
                 WHERE id = ?11 AND version = ?12",
                params![
                    identity.document_key,
                    identity.document_hash,
                    identity.status.as_str(),
                    identity.confidence_score,
                    identity.status_reason,
                    identity.verified_at.map(|v| v as i64),
                    identity.verified_by,
                    identity.document_expires_at.map(|v| v as i64),
                    identity.verification_expires_at.map(|v| v as i64),
                    identity.updated_at as i64,
                    identity.id,
                    expected_version as i64,
                ],
            )
            .map_err(backend)?;

        if changed == 1 {
            let mut updated = identity.clone();
            updated.version = expected_version + 1;
            return Ok(updated);
        }

        // Distinguish a lost race from a missing row.
        let stored: Option<i64> = conn
            .query_row(
                "SELECT version FROM identities WHERE id = ?1",
                params![identity.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;

        match stored {
            Some(version) => Err(StoreError::VersionConflict {
                id: identity.id.clone(),
                expected: expected_version,
                stored: version as u64,
            }),
            None => Err(StoreError::NotFound {
                id: identity.id.clone(),
            }),
        }
    }
}

/// SQLite [`AuditLog`] — INSERT-only.
#[derive(Clone)]
pub struct SqliteAuditLog {
    conn: Arc<Mutex<Connection>>,
}

impl AuditLog for SqliteAuditLog {
    fn record(&self, mut entry: AuditEntry) -> Result<AuditEntry, AuditError> {
        let details = serde_json::to_string(&entry.details)
            .map_err(|err| AuditError::Backend(err.to_string()))?;

        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "INSERT INTO audit_entries
                 (identity_id, action, result, details, performed_by, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.identity_id,
                entry.action.as_str(),
                entry.result.as_str(),
                details,
                entry.performed_by,
                entry.occurred_at as i64,
            ],
        )
        .map_err(|err| AuditError::Backend(err.to_string()))?;

        entry.seq = Some(conn.last_insert_rowid() as u64);
        Ok(entry)
    }

    fn query(&self, identity_id: &str) -> Result<Vec<AuditEntry>, AuditError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT seq, identity_id, action, result, details, performed_by, occurred_at
                 FROM audit_entries
                 WHERE identity_id = ?1
                 ORDER BY occurred_at DESC, seq DESC",
            )
            .map_err(|err| AuditError::Backend(err.to_string()))?;

        let entries = stmt
            .query_map(params![identity_id], |row| {
                let action: String = row.get(2)?;
                let result: String = row.get(3)?;
                let details: String = row.get(4)?;
                Ok(AuditEntry {
                    seq: Some(row.get::<_, i64>(0)? as u64),
                    identity_id: row.get(1)?,
                    action: AuditAction::parse(&action).ok_or_else(|| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            format!("unknown audit action: {action}").into(),
                        )
                    })?,
                    result: AuditOutcome::parse(&result).ok_or_else(|| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Text,
                            format!("unknown audit outcome: {result}").into(),
                        )
                    })?,
                    details: serde_json::from_str::<BTreeMap<String, String>>(&details)
                        .unwrap_or_default(),
                    performed_by: row.get(5)?,
                    occurred_at: row.get::<_, i64>(6)? as u64,
                })
            })
            .map_err(|err| AuditError::Backend(err.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| AuditError::Backend(err.to_string()))?;

        Ok(entries)
    }
}

/// SQLite [`AppealStore`].
#[derive(Clone)]
pub struct SqliteAppealStore {
    conn: Arc<Mutex<Connection>>,
}

const APPEAL_COLUMNS: &str = "id, identity_id, reason, supplementary_evidence_key, status, \
     prior_status, reviewed_by, review_notes, created_at, reviewed_at";

fn appeal_from_row(row: &Row<'_>) -> rusqlite::Result<Appeal> {
    Ok(Appeal {
        id: row.get(0)?,
        identity_id: row.get(1)?,
        reason: row.get(2)?,
        supplementary_evidence_key: row.get(3)?,
        status: parse_appeal_status(&row.get::<_, String>(4)?)?,
        prior_status: parse_status(&row.get::<_, String>(5)?)?,
        reviewed_by: row.get(6)?,
        review_notes: row.get(7)?,
        created_at: row.get::<_, i64>(8)? as u64,
        reviewed_at: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
    })
}

impl AppealStore for SqliteAppealStore {
    fn insert(&self, appeal: &Appeal) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let inserted = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO appeals ({APPEAL_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    appeal.id,
                    appeal.identity_id,
                    appeal.reason,
                    appeal.supplementary_evidence_key,
                    appeal.status.as_str(),
                    appeal.prior_status.as_str(),
                    appeal.reviewed_by,
                    appeal.review_notes,
                    appeal.created_at as i64,
                    appeal.reviewed_at.map(|v| v as i64),
                ],
            )
            .map_err(backend)?;

        if inserted == 0 {
            return Err(StoreError::AlreadyExists {
                id: appeal.id.clone(),
            });
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Appeal, StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.query_row(
            &format!("SELECT {APPEAL_COLUMNS} FROM appeals WHERE id = ?1"),
            params![id],
            appeal_from_row,
        )
        .optional()
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    fn update(&self, appeal: &Appeal) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let changed = conn
            .execute(
                "UPDATE appeals SET
                     status = ?1, reviewed_by = ?2, review_notes = ?3, reviewed_at = ?4
                 WHERE id = ?5",
                params![
                    appeal.status.as_str(),
                    appeal.reviewed_by,
                    appeal.review_notes,
                    appeal.reviewed_at.map(|v| v as i64),
                    appeal.id,
                ],
            )
            .map_err(backend)?;

        if changed == 0 {
            return Err(StoreError::NotFound {
                id: appeal.id.clone(),
            });
        }
        Ok(())
    }

    fn find_open(&self, identity_id: &str) -> Result<Option<Appeal>, StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.query_row(
            &format!(
                "SELECT {APPEAL_COLUMNS} FROM appeals
                 WHERE identity_id = ?1 AND status IN ('pending', 'under_review')"
            ),
            params![identity_id],
            appeal_from_row,
        )
        .optional()
        .map_err(backend)
    }
}

/// SQLite [`BlobStore`] — content-addressed, deduplicating.
#[derive(Clone)]
pub struct SqliteBlobStore {
    conn: Arc<Mutex<Connection>>,
}

impl BlobStore for SqliteBlobStore {
    fn put(&self, content: &[u8]) -> Result<String, BlobError> {
        if content.is_empty() {
            return Err(BlobError::EmptyContent);
        }
        let key = sha256_hex(content);

        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO blobs (key, content, size_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key,
                content,
                content.len() as i64,
                crate::now_ms() as i64,
            ],
        )
        .map_err(|err| BlobError::Backend(err.to_string()))?;

        Ok(key)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let content: Option<Vec<u8>> = conn
            .query_row(
                "SELECT content FROM blobs WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| BlobError::Backend(err.to_string()))?;

        let content = content.ok_or_else(|| BlobError::NotFound {
            key: key.to_string(),
        })?;

        let actual = sha256_hex(&content);
        if actual != key {
            return Err(BlobError::IntegrityFailure {
                key: key.to_string(),
                actual,
            });
        }
        Ok(content)
    }

    fn exists(&self, key: &str) -> Result<bool, BlobError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM blobs WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|err| BlobError::Backend(err.to_string()))?;
        Ok(found.is_some())
    }
}
