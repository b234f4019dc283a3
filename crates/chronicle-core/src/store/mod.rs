//! `SQLite`-backed ledger storage.
//!
//! The store uses WAL mode so arbitrarily many readers proceed while a write
//! is in flight. The `records` table is physically append-only: `UPDATE` and
//! `DELETE` are rejected by database triggers, not application discipline.
//!
//! # Compare-and-append
//!
//! All chain mutation goes through [`LedgerStore::commit`], which runs a
//! `BEGIN IMMEDIATE` transaction that re-reads the chain head, re-checks the
//! durable halt flag, and inserts — a single serialized compare-and-append.
//! Two concurrent commits referencing the same prior hash cannot both
//! succeed: the loser observes the moved head and fails with
//! [`CommitError::HeadMoved`] before anything persists. The primitive lives
//! in the database, so it survives process restarts.
//!
//! The `prior_hash` index is deliberately non-unique: a divergent row
//! planted by a compromised secondary must remain representable in storage
//! so the fork monitor's detection path is honest.

// SQLite returns i64 for row IDs and counts, but they're always non-negative.
// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::missing_panics_doc
)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use thiserror::Error;

use crate::checkpoint::CheckpointAnchor;
use crate::crypto::{ChainHasher, Hash, SIGNATURE_SIZE};
use crate::record::Record;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No record exists with the requested sequence number.
    #[error("record not found: sequence={sequence}")]
    RecordNotFound {
        /// The sequence number that was not found.
        sequence: u64,
    },
}

/// Errors from the compare-and-append commit path.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommitError {
    /// The durable halt flag is set; the commit was refused.
    #[error("ledger is halted; commit refused")]
    Halted,

    /// The chain head moved between the caller's read and the commit.
    #[error("chain head moved: current head content hash differs from candidate prior hash")]
    HeadMoved {
        /// Content hash of the actual current head.
        current_head: Hash,
        /// Sequence of the actual current head.
        current_sequence: u64,
    },

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<rusqlite::Error> for CommitError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(StoreError::Database(e))
    }
}

/// The current chain head: the one piece of mutable shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHead {
    /// Sequence of the last committed record (0 when the chain is empty).
    pub sequence: u64,

    /// Content hash of the last committed record (the genesis constant when
    /// the chain is empty).
    pub content_hash: Hash,
}

impl ChainHead {
    /// The head of an empty chain.
    #[must_use]
    pub const fn genesis() -> Self {
        Self {
            sequence: 0,
            content_hash: ChainHasher::GENESIS_PRIOR_HASH,
        }
    }
}

/// A fully signed and witnessed record, ready for the atomic commit.
///
/// Everything except `sequence` is populated; the sequence is assigned
/// inside the commit transaction.
#[derive(Debug, Clone)]
pub struct PreparedRecord {
    /// Record type name.
    pub record_type: String,
    /// Schema version of the payload.
    pub schema_version: u32,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Expected content hash of the current head.
    pub prior_hash: Hash,
    /// Content hash over the canonical encoding.
    pub content_hash: Hash,
    /// Hash algorithm identifier.
    pub hash_algorithm: String,
    /// Producing writer identity.
    pub writer_id: String,
    /// Writer signature over the content hash.
    pub writer_signature: [u8; SIGNATURE_SIZE],
    /// Attesting witness identity.
    pub witness_id: String,
    /// Witness signature over the content hash.
    pub witness_signature: [u8; SIGNATURE_SIZE],
    /// Writer-local timestamp, milliseconds since epoch.
    pub local_time_ms: u64,
    /// Authority timestamp, when available.
    pub authority_time_ms: Option<u64>,
}

/// A lightweight row used by the fork monitor's chain walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRow {
    /// Sequence number of the row.
    pub sequence: u64,
    /// Stored prior hash.
    pub prior_hash: Hash,
    /// Stored content hash.
    pub content_hash: Hash,
}

/// A group of persisted records sharing the same prior hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkGroup {
    /// The shared prior hash.
    pub prior_hash: Hash,
    /// The (sequence, content hash) members of the group.
    pub members: Vec<(u64, Hash)>,
}

/// Durable halt row, the source-of-truth halt channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableHalt {
    /// Whether the ledger is halted.
    pub is_halted: bool,
    /// Human-readable reason, when halted.
    pub reason: Option<String>,
    /// JSON array of triggering record sequences.
    pub triggering_refs_json: Option<String>,
    /// When the halt was declared, milliseconds since epoch.
    pub declared_at_ms: Option<u64>,
}

/// The append-only ledger store.
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl LedgerStore {
    /// Opens or creates a ledger database at the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Returns the filesystem path of the database, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reads the current chain head.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn head(&self) -> Result<ChainHead, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::head_on(&conn)
    }

    fn head_on(conn: &Connection) -> Result<ChainHead, StoreError> {
        let row: Option<(i64, Vec<u8>)> = conn
            .query_row(
                "SELECT sequence, content_hash FROM records ORDER BY sequence DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            None => Ok(ChainHead::genesis()),
            Some((sequence, hash)) => Ok(ChainHead {
                sequence: sequence as u64,
                content_hash: blob_to_hash(1, hash)?,
            }),
        }
    }

    /// Atomically appends a prepared record at the current head.
    ///
    /// Re-reads the head and re-checks the durable halt flag inside a
    /// `BEGIN IMMEDIATE` transaction immediately before the insert. Exactly
    /// one of two concurrent commits referencing the same prior hash
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError::Halted`] if the durable halt flag is set,
    /// [`CommitError::HeadMoved`] if the head no longer matches the
    /// candidate's prior hash, or a storage error.
    pub fn commit(&self, prepared: &PreparedRecord) -> Result<Record, CommitError> {
        self.commit_inner(prepared, false)
    }

    /// Commit variant that ignores the halt flag.
    ///
    /// Reserved for the recovery coordinator's single authorized transition;
    /// every other write path goes through [`Self::commit`].
    pub(crate) fn commit_halt_exempt(
        &self,
        prepared: &PreparedRecord,
    ) -> Result<Record, CommitError> {
        self.commit_inner(prepared, true)
    }

    fn commit_inner(
        &self,
        prepared: &PreparedRecord,
        halt_exempt: bool,
    ) -> Result<Record, CommitError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !halt_exempt {
            let halted: i64 =
                tx.query_row("SELECT is_halted FROM halt_state WHERE id = 1", [], |row| {
                    row.get(0)
                })?;
            if halted != 0 {
                return Err(CommitError::Halted);
            }
        }

        let head = Self::head_on(&tx)?;
        if prepared.prior_hash != head.content_hash {
            return Err(CommitError::HeadMoved {
                current_head: head.content_hash,
                current_sequence: head.sequence,
            });
        }

        let sequence = head.sequence + 1;
        tx.execute(
            "INSERT INTO records (sequence, record_type, schema_version, payload, prior_hash,
                                  content_hash, hash_algorithm, writer_id, writer_signature,
                                  witness_id, witness_signature, local_time_ms, authority_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                sequence as i64,
                prepared.record_type,
                prepared.schema_version,
                prepared.payload,
                prepared.prior_hash.as_slice(),
                prepared.content_hash.as_slice(),
                prepared.hash_algorithm,
                prepared.writer_id,
                prepared.writer_signature.as_slice(),
                prepared.witness_id,
                prepared.witness_signature.as_slice(),
                prepared.local_time_ms as i64,
                prepared.authority_time_ms.map(|t| t as i64),
            ],
        )?;
        tx.commit()?;

        Ok(Record {
            sequence,
            record_type: prepared.record_type.clone(),
            schema_version: prepared.schema_version,
            payload: prepared.payload.clone(),
            prior_hash: prepared.prior_hash,
            content_hash: prepared.content_hash,
            hash_algorithm: prepared.hash_algorithm.clone(),
            writer_id: prepared.writer_id.clone(),
            writer_signature: prepared.writer_signature,
            witness_id: prepared.witness_id.clone(),
            witness_signature: prepared.witness_signature,
            local_time_ms: prepared.local_time_ms,
            authority_time_ms: prepared.authority_time_ms,
        })
    }

    /// Reads up to `limit` records with sequence strictly greater than
    /// `cursor`, in ascending sequence order (keyset continuation).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn read_after(&self, cursor: u64, limit: u64) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sequence, record_type, schema_version, payload, prior_hash, content_hash,
                    hash_algorithm, writer_id, writer_signature, witness_id, witness_signature,
                    local_time_ms, authority_time_ms
             FROM records
             WHERE sequence > ?1
             ORDER BY sequence ASC
             LIMIT ?2",
        )?;

        let records = stmt
            .query_map(params![cursor as i64, limit as i64], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Reads up to `limit` records inside a local-time window, with keyset
    /// continuation on sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn read_time_window(
        &self,
        start_ms: u64,
        end_ms: u64,
        after_sequence: u64,
        limit: u64,
    ) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sequence, record_type, schema_version, payload, prior_hash, content_hash,
                    hash_algorithm, writer_id, writer_signature, witness_id, witness_signature,
                    local_time_ms, authority_time_ms
             FROM records
             WHERE local_time_ms >= ?1 AND local_time_ms < ?2 AND sequence > ?3
             ORDER BY sequence ASC
             LIMIT ?4",
        )?;

        let records = stmt
            .query_map(
                params![
                    start_ms as i64,
                    end_ms as i64,
                    after_sequence as i64,
                    limit as i64
                ],
                row_to_record,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Reads a single record by sequence number.
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound` if no record exists with that sequence.
    pub fn read_one(&self, sequence: u64) -> Result<Record, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::read_one_on(&conn, sequence)
    }

    fn read_one_on(conn: &Connection, sequence: u64) -> Result<Record, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT sequence, record_type, schema_version, payload, prior_hash, content_hash,
                    hash_algorithm, writer_id, writer_signature, witness_id, witness_signature,
                    local_time_ms, authority_time_ms
             FROM records
             WHERE sequence = ?1",
        )?;

        stmt.query_row(params![sequence as i64], row_to_record)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::RecordNotFound { sequence },
                other => StoreError::Database(other),
            })
    }

    /// Returns the total number of records.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn record_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Returns `(sequence, content_hash)` for all records in the inclusive
    /// sequence range, ascending. Used for cumulative-hash folding.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn content_hashes_in_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, Hash)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sequence, content_hash FROM records
             WHERE sequence >= ?1 AND sequence <= ?2
             ORDER BY sequence ASC",
        )?;

        let rows = stmt
            .query_map(params![start as i64, end as i64], |row| {
                let sequence: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((sequence as u64, blob_to_hash(1, blob)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Returns lightweight chain rows with sequence strictly greater than
    /// `cursor`, ascending. Used by the fork monitor's incremental walk.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn chain_rows_after(&self, cursor: u64, limit: u64) -> Result<Vec<ChainRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sequence, prior_hash, content_hash FROM records
             WHERE sequence > ?1
             ORDER BY sequence ASC
             LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![cursor as i64, limit as i64], |row| {
                let sequence: i64 = row.get(0)?;
                let prior: Vec<u8> = row.get(1)?;
                let content: Vec<u8> = row.get(2)?;
                Ok(ChainRow {
                    sequence: sequence as u64,
                    prior_hash: blob_to_hash(1, prior)?,
                    content_hash: blob_to_hash(2, content)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Finds groups of persisted records sharing a prior hash.
    ///
    /// Any group with more than one member is a divergence from a single
    /// prior state; differing content hashes inside a group are a fork.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_fork_groups(&self) -> Result<Vec<ForkGroup>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT prior_hash FROM records GROUP BY prior_hash HAVING COUNT(*) > 1",
        )?;
        let priors = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut groups = Vec::with_capacity(priors.len());
        for prior in priors {
            let mut member_stmt = conn.prepare(
                "SELECT sequence, content_hash FROM records
                 WHERE prior_hash = ?1
                 ORDER BY sequence ASC",
            )?;
            let members = member_stmt
                .query_map(params![prior.as_slice()], |row| {
                    let sequence: i64 = row.get(0)?;
                    let content: Vec<u8> = row.get(1)?;
                    Ok((sequence as u64, blob_to_hash(1, content)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            groups.push(ForkGroup {
                prior_hash: blob_to_hash(0, prior)?,
                members,
            });
        }
        Ok(groups)
    }

    /// Returns the sequence of the most recent recovery decision record,
    /// or 0 if none exists. Violations at or below this sequence were
    /// adjudicated by that recovery.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn latest_recovery_sequence(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(sequence) FROM records WHERE record_type = ?1",
            params![crate::record::system_types::RECOVERY_DECIDED],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) as u64)
    }

    // -------------------------------------------------------------------
    // Durable halt channel
    // -------------------------------------------------------------------

    /// Reads the durable halt row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn durable_halt(&self) -> Result<DurableHalt, StoreError> {
        let conn = self.conn.lock().unwrap();
        let halt = conn.query_row(
            "SELECT is_halted, reason, triggering_refs, declared_at_ms
             FROM halt_state WHERE id = 1",
            [],
            |row| {
                Ok(DurableHalt {
                    is_halted: row.get::<_, i64>(0)? != 0,
                    reason: row.get(1)?,
                    triggering_refs_json: row.get(2)?,
                    declared_at_ms: row.get::<_, Option<i64>>(3)?.map(|t| t as u64),
                })
            },
        )?;
        Ok(halt)
    }

    /// Sets the durable halt flag. Crate-private: only the halt transport
    /// writes this row.
    pub(crate) fn set_durable_halt(&self, halt: &DurableHalt) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE halt_state
             SET is_halted = ?1, reason = ?2, triggering_refs = ?3, declared_at_ms = ?4
             WHERE id = 1",
            params![
                i64::from(halt.is_halted),
                halt.reason,
                halt.triggering_refs_json,
                halt.declared_at_ms.map(|t| t as i64),
            ],
        )?;
        Ok(())
    }

    /// Clears the durable halt flag. Crate-private: reachable only through
    /// the recovery coordinator's authorized transition.
    pub(crate) fn clear_durable_halt(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE halt_state
             SET is_halted = 0, reason = NULL, triggering_refs = NULL, declared_at_ms = NULL
             WHERE id = 1",
            [],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Checkpoint anchors
    // -------------------------------------------------------------------

    /// Persists a checkpoint anchor. The table is append-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn insert_checkpoint(&self, anchor: &CheckpointAnchor) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO checkpoints (sequence_at_checkpoint, cumulative_hash, signer_id,
                                      signature, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                anchor.sequence_at_checkpoint as i64,
                anchor.cumulative_hash.as_slice(),
                anchor.signer_id,
                anchor.signature.as_slice(),
                anchor.created_at_ms as i64,
            ],
        )?;
        Ok(())
    }

    /// Returns the checkpoint with the highest sequence, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn latest_checkpoint(&self) -> Result<Option<CheckpointAnchor>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let anchor = conn
            .query_row(
                "SELECT sequence_at_checkpoint, cumulative_hash, signer_id, signature,
                        created_at_ms
                 FROM checkpoints ORDER BY sequence_at_checkpoint DESC LIMIT 1",
                [],
                row_to_checkpoint,
            )
            .optional()?;
        Ok(anchor)
    }

    /// Returns the nearest checkpoint at or before the given sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn checkpoint_at_or_before(
        &self,
        sequence: u64,
    ) -> Result<Option<CheckpointAnchor>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let anchor = conn
            .query_row(
                "SELECT sequence_at_checkpoint, cumulative_hash, signer_id, signature,
                        created_at_ms
                 FROM checkpoints
                 WHERE sequence_at_checkpoint <= ?1
                 ORDER BY sequence_at_checkpoint DESC LIMIT 1",
                params![sequence as i64],
                row_to_checkpoint,
            )
            .optional()?;
        Ok(anchor)
    }

    /// Returns the nearest checkpoint at or after the given sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn checkpoint_at_or_after(
        &self,
        sequence: u64,
    ) -> Result<Option<CheckpointAnchor>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let anchor = conn
            .query_row(
                "SELECT sequence_at_checkpoint, cumulative_hash, signer_id, signature,
                        created_at_ms
                 FROM checkpoints
                 WHERE sequence_at_checkpoint >= ?1
                 ORDER BY sequence_at_checkpoint ASC LIMIT 1",
                params![sequence as i64],
                row_to_checkpoint,
            )
            .optional()?;
        Ok(anchor)
    }

    /// Test-only access to the underlying connection, for planting the
    /// divergent rows a compromised secondary would produce.
    #[cfg(test)]
    pub(crate) fn raw_connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Opens an additional read-only connection for concurrent readers.
    ///
    /// # Errors
    ///
    /// Returns an error for in-memory databases or if the connection cannot
    /// be opened.
    pub fn open_reader(&self) -> Result<LedgerReader, StoreError> {
        let path = self.path.as_ref().ok_or_else(|| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "cannot create reader for in-memory database",
            ))
        })?;

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        Ok(LedgerReader {
            conn: Mutex::new(conn),
        })
    }
}

/// A read-only view of the ledger for concurrent readers.
pub struct LedgerReader {
    conn: Mutex<Connection>,
}

impl LedgerReader {
    /// Reads up to `limit` records with sequence strictly greater than
    /// `cursor`, in ascending sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn read_after(&self, cursor: u64, limit: u64) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sequence, record_type, schema_version, payload, prior_hash, content_hash,
                    hash_algorithm, writer_id, writer_signature, witness_id, witness_signature,
                    local_time_ms, authority_time_ms
             FROM records
             WHERE sequence > ?1
             ORDER BY sequence ASC
             LIMIT ?2",
        )?;

        let records = stmt
            .query_map(params![cursor as i64, limit as i64], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Reads a single record by sequence number.
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound` if no record exists with that sequence.
    pub fn read_one(&self, sequence: u64) -> Result<Record, StoreError> {
        let conn = self.conn.lock().unwrap();
        LedgerStore::read_one_on(&conn, sequence)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let sequence: i64 = row.get(0)?;
    let prior: Vec<u8> = row.get(4)?;
    let content: Vec<u8> = row.get(5)?;
    let writer_sig: Vec<u8> = row.get(8)?;
    let witness_sig: Vec<u8> = row.get(10)?;

    Ok(Record {
        sequence: sequence as u64,
        record_type: row.get(1)?,
        schema_version: row.get::<_, i64>(2)? as u32,
        payload: row.get(3)?,
        prior_hash: blob_to_hash(4, prior)?,
        content_hash: blob_to_hash(5, content)?,
        hash_algorithm: row.get(6)?,
        writer_id: row.get(7)?,
        writer_signature: blob_to_signature(8, writer_sig)?,
        witness_id: row.get(9)?,
        witness_signature: blob_to_signature(10, witness_sig)?,
        local_time_ms: row.get::<_, i64>(11)? as u64,
        authority_time_ms: row.get::<_, Option<i64>>(12)?.map(|t| t as u64),
    })
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointAnchor> {
    let sequence: i64 = row.get(0)?;
    let cumulative: Vec<u8> = row.get(1)?;
    let signature: Vec<u8> = row.get(3)?;

    Ok(CheckpointAnchor {
        sequence_at_checkpoint: sequence as u64,
        cumulative_hash: blob_to_hash(1, cumulative)?,
        signer_id: row.get(2)?,
        signature: blob_to_signature(3, signature)?,
        created_at_ms: row.get::<_, i64>(4)? as u64,
    })
}

fn blob_to_hash(column: usize, blob: Vec<u8>) -> rusqlite::Result<Hash> {
    blob.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Blob,
            "expected 32-byte hash".into(),
        )
    })
}

fn blob_to_signature(column: usize, blob: Vec<u8>) -> rusqlite::Result<[u8; SIGNATURE_SIZE]> {
    blob.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Blob,
            "expected 64-byte signature".into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonical_record_bytes;
    use crate::crypto::HASH_ALGORITHM;

    fn prepared(record_type: &str, payload: &[u8], prior: Hash) -> PreparedRecord {
        let canonical = canonical_record_bytes(record_type, 1, payload, &prior).unwrap();
        PreparedRecord {
            record_type: record_type.to_string(),
            schema_version: 1,
            payload: payload.to_vec(),
            prior_hash: prior,
            content_hash: ChainHasher::content_hash(&canonical),
            hash_algorithm: HASH_ALGORITHM.to_string(),
            writer_id: "writer-1".to_string(),
            writer_signature: [1u8; SIGNATURE_SIZE],
            witness_id: "witness-1".to_string(),
            witness_signature: [2u8; SIGNATURE_SIZE],
            local_time_ms: 1_000,
            authority_time_ms: None,
        }
    }

    fn append_n(store: &LedgerStore, n: u64) -> Vec<Record> {
        let mut records = Vec::new();
        for i in 0..n {
            let head = store.head().unwrap();
            let payload = format!("payload-{i}");
            let rec = store
                .commit(&prepared("test.event", payload.as_bytes(), head.content_hash))
                .unwrap();
            records.push(rec);
        }
        records
    }

    #[test]
    fn empty_chain_head_is_genesis() {
        let store = LedgerStore::in_memory().unwrap();
        assert_eq!(store.head().unwrap(), ChainHead::genesis());
    }

    #[test]
    fn commit_assigns_monotonic_sequences() {
        let store = LedgerStore::in_memory().unwrap();
        let records = append_n(&store, 5);

        for (i, rec) in records.iter().enumerate() {
            assert_eq!(rec.sequence, i as u64 + 1);
        }
        assert_eq!(store.head().unwrap().sequence, 5);
    }

    #[test]
    fn commit_rejects_stale_prior_hash() {
        let store = LedgerStore::in_memory().unwrap();
        append_n(&store, 1);

        // A candidate built against the genesis head loses.
        let stale = prepared("test.event", b"late", ChainHasher::GENESIS_PRIOR_HASH);
        assert!(matches!(
            store.commit(&stale),
            Err(CommitError::HeadMoved { current_sequence: 1, .. })
        ));
        assert_eq!(store.record_count().unwrap(), 1);
    }

    #[test]
    fn commit_rejects_while_halted() {
        let store = LedgerStore::in_memory().unwrap();
        store
            .set_durable_halt(&DurableHalt {
                is_halted: true,
                reason: Some("fork".to_string()),
                triggering_refs_json: None,
                declared_at_ms: Some(1),
            })
            .unwrap();

        let head = store.head().unwrap();
        let candidate = prepared("test.event", b"blocked", head.content_hash);
        assert!(matches!(store.commit(&candidate), Err(CommitError::Halted)));

        // The exempt path still works (recovery record).
        store.commit_halt_exempt(&candidate).unwrap();
        assert_eq!(store.record_count().unwrap(), 1);
    }

    #[test]
    fn update_and_delete_are_rejected_by_the_storage_layer() {
        let store = LedgerStore::in_memory().unwrap();
        append_n(&store, 1);

        let conn = store.conn.lock().unwrap();
        let update = conn.execute("UPDATE records SET payload = x'00' WHERE sequence = 1", []);
        assert!(update.is_err());

        let delete = conn.execute("DELETE FROM records WHERE sequence = 1", []);
        assert!(delete.is_err());
    }

    #[test]
    fn read_after_is_keyset_paginated() {
        let store = LedgerStore::in_memory().unwrap();
        append_n(&store, 5);

        let page1 = store.read_after(0, 2).unwrap();
        assert_eq!(page1.iter().map(|r| r.sequence).collect::<Vec<_>>(), [1, 2]);

        let page2 = store.read_after(2, 2).unwrap();
        assert_eq!(page2.iter().map(|r| r.sequence).collect::<Vec<_>>(), [3, 4]);
    }

    #[test]
    fn read_one_not_found() {
        let store = LedgerStore::in_memory().unwrap();
        assert!(matches!(
            store.read_one(7),
            Err(StoreError::RecordNotFound { sequence: 7 })
        ));
    }

    #[test]
    fn fork_groups_surface_direct_inserts() {
        let store = LedgerStore::in_memory().unwrap();
        let records = append_n(&store, 2);

        // Plant a divergent second child of record 1, as a compromised
        // secondary would: a direct insert bypassing compare-and-append.
        let forged = prepared("test.event", b"forged", records[0].content_hash);
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO records (sequence, record_type, schema_version, payload, prior_hash,
                                      content_hash, hash_algorithm, writer_id, writer_signature,
                                      witness_id, witness_signature, local_time_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    3i64,
                    forged.record_type,
                    forged.schema_version,
                    forged.payload,
                    forged.prior_hash.as_slice(),
                    forged.content_hash.as_slice(),
                    forged.hash_algorithm,
                    forged.writer_id,
                    forged.writer_signature.as_slice(),
                    forged.witness_id,
                    forged.witness_signature.as_slice(),
                    0i64,
                ],
            )
            .unwrap();
        }

        let groups = store.find_fork_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].prior_hash, records[0].content_hash);
        assert_eq!(groups[0].members.len(), 2);
    }

    #[test]
    fn readers_see_committed_records_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::open(dir.path().join("ledger.db")).unwrap();
        append_n(&store, 3);

        // A separate read-only connection sees everything committed, in
        // order, while the writer connection stays open.
        let reader = store.open_reader().unwrap();
        let records = reader.read_after(0, 10).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].sequence, 1);
        assert_eq!(reader.read_one(2).unwrap().sequence, 2);

        append_n(&store, 1);
        assert_eq!(reader.read_after(0, 10).unwrap().len(), 4);
    }

    #[test]
    fn in_memory_store_has_no_reader() {
        let store = LedgerStore::in_memory().unwrap();
        assert!(store.open_reader().is_err());
    }

    #[test]
    fn halt_row_roundtrip() {
        let store = LedgerStore::in_memory().unwrap();
        assert!(!store.durable_halt().unwrap().is_halted);

        store
            .set_durable_halt(&DurableHalt {
                is_halted: true,
                reason: Some("sequence gap".to_string()),
                triggering_refs_json: Some("[4,6]".to_string()),
                declared_at_ms: Some(42),
            })
            .unwrap();

        let halt = store.durable_halt().unwrap();
        assert!(halt.is_halted);
        assert_eq!(halt.reason.as_deref(), Some("sequence gap"));

        store.clear_durable_halt().unwrap();
        assert!(!store.durable_halt().unwrap().is_halted);
    }
}
