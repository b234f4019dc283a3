//! Append-only schema catalog for record types.
//!
//! Every record type and payload schema version must be declared here before
//! the writer accepts a candidate referencing it. Unknown types are rejected,
//! never best-effort parsed (fail-closed).
//!
//! # Key concepts
//!
//! - **Versioned entries**: a `(record_type, schema_version)` pair maps to a
//!   JSON-schema definition plus its content digest.
//! - **Append-only**: re-registering an existing pair with identical content
//!   is idempotent; different content is rejected. Nothing is ever removed.
//! - **Stakes classification**: each type is classed low- or high-stakes;
//!   high-stakes types are gated by the witness pool minimum.
//! - **Closed terminal set**: a type may be marked terminal. Registering any
//!   type that declares itself a reversal of a terminal type is rejected at
//!   this boundary — irreversibility is a registration-time guarantee, not a
//!   runtime convention.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{ChainHasher, Hash, hex};
use crate::record::system_types;

/// Maximum schema content size in bytes.
pub const MAX_SCHEMA_SIZE: usize = 64 * 1024;

/// Maximum number of catalog entries (exhaustion bound).
pub const MAX_CATALOG_ENTRIES: usize = 4096;

/// Stakes classification of a record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakesClass {
    /// Low-stakes: permitted even when the witness pool is degraded.
    Low,
    /// High-stakes: requires the minimum live witness pool.
    High,
}

/// A single catalog entry: one version of one record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    /// Record type name (e.g. `"motion.filed"`).
    pub record_type: String,

    /// Schema version this entry declares.
    pub schema_version: u32,

    /// JSON-schema definition of the payload.
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,

    /// Stakes classification of the type.
    pub stakes: StakesClass,

    /// Whether records of this type represent a terminal state.
    pub terminal: bool,

    /// If set, this type declares itself a reversal of the named type.
    ///
    /// Reversals of terminal types are rejected at registration.
    pub reverses: Option<String>,

    /// Registration timestamp, milliseconds since epoch.
    pub registered_at_ms: u64,

    /// Identity of the registrant.
    pub registered_by: String,
}

impl SchemaEntry {
    /// Returns the content digest of this entry's schema definition.
    #[must_use]
    pub fn digest(&self) -> Hash {
        ChainHasher::content_hash(&self.content)
    }
}

/// Errors that can occur during catalog operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CatalogError {
    /// An entry for this `(record_type, schema_version)` already exists with
    /// different content.
    #[error("catalog is append-only: {record_type} v{schema_version} already registered with digest {existing_digest}")]
    Immutable {
        /// The record type that conflicted.
        record_type: String,
        /// The schema version that conflicted.
        schema_version: u32,
        /// Digest of the already-registered content.
        existing_digest: String,
    },

    /// The entry declares a reversal of a terminal type.
    #[error("{record_type} declares a reversal of terminal type {terminal_type}; terminal states are closed")]
    ReversalOfTerminal {
        /// The offending record type.
        record_type: String,
        /// The terminal type it attempted to reverse.
        terminal_type: String,
    },

    /// The schema content is not valid JSON.
    #[error("schema content for {record_type} v{schema_version} is not valid JSON")]
    InvalidSchemaContent {
        /// The record type with invalid content.
        record_type: String,
        /// The schema version with invalid content.
        schema_version: u32,
    },

    /// The schema content exceeds the maximum size.
    #[error("schema content exceeds max size: {actual} > {max}")]
    SchemaTooLarge {
        /// Actual content size in bytes.
        actual: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The catalog is at capacity.
    #[error("catalog full: {max} entries")]
    CatalogFull {
        /// Maximum number of entries.
        max: usize,
    },

    /// Non-system registrants may not use the reserved type prefix.
    #[error("record type {record_type} uses the reserved prefix {prefix}")]
    ReservedPrefix {
        /// The offending record type.
        record_type: String,
        /// The reserved prefix.
        prefix: &'static str,
    },
}

/// The append-only schema catalog.
pub struct SchemaCatalog {
    entries: RwLock<HashMap<String, BTreeMap<u32, SchemaEntry>>>,
}

impl SchemaCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a schema entry.
    ///
    /// Idempotent for identical content; append-only otherwise.
    ///
    /// # Errors
    ///
    /// See [`CatalogError`].
    pub fn register(&self, entry: SchemaEntry) -> Result<(), CatalogError> {
        if entry.record_type.starts_with(system_types::RESERVED_PREFIX)
            && entry.registered_by != "ledger"
        {
            return Err(CatalogError::ReservedPrefix {
                record_type: entry.record_type,
                prefix: system_types::RESERVED_PREFIX,
            });
        }
        self.register_unchecked(entry)
    }

    /// Registers an entry without the reserved-prefix check. Used for the
    /// ledger's own bootstrap schemas.
    fn register_unchecked(&self, entry: SchemaEntry) -> Result<(), CatalogError> {
        if entry.content.len() > MAX_SCHEMA_SIZE {
            return Err(CatalogError::SchemaTooLarge {
                actual: entry.content.len(),
                max: MAX_SCHEMA_SIZE,
            });
        }
        if serde_json::from_slice::<serde_json::Value>(&entry.content).is_err() {
            return Err(CatalogError::InvalidSchemaContent {
                record_type: entry.record_type,
                schema_version: entry.schema_version,
            });
        }

        let mut entries = self.entries.write().unwrap();

        // Closed terminal set: reversals of terminal types never register.
        if let Some(reversed) = &entry.reverses {
            let target_terminal = entries
                .get(reversed)
                .is_some_and(|versions| versions.values().any(|e| e.terminal));
            if target_terminal {
                return Err(CatalogError::ReversalOfTerminal {
                    record_type: entry.record_type,
                    terminal_type: reversed.clone(),
                });
            }
        }

        if let Some(existing) = entries
            .get(&entry.record_type)
            .and_then(|versions| versions.get(&entry.schema_version))
        {
            if existing.digest() == entry.digest() {
                return Ok(());
            }
            return Err(CatalogError::Immutable {
                record_type: entry.record_type,
                schema_version: entry.schema_version,
                existing_digest: hex::encode(&existing.digest()),
            });
        }

        let total: usize = entries.values().map(BTreeMap::len).sum();
        if total >= MAX_CATALOG_ENTRIES {
            return Err(CatalogError::CatalogFull {
                max: MAX_CATALOG_ENTRIES,
            });
        }

        tracing::debug!(
            record_type = %entry.record_type,
            schema_version = entry.schema_version,
            stakes = ?entry.stakes,
            "schema registered"
        );
        entries
            .entry(entry.record_type.clone())
            .or_default()
            .insert(entry.schema_version, entry);
        Ok(())
    }

    /// Returns true if `(record_type, schema_version)` is declared.
    #[must_use]
    pub fn is_declared(&self, record_type: &str, schema_version: u32) -> bool {
        self.entries
            .read()
            .unwrap()
            .get(record_type)
            .is_some_and(|versions| versions.contains_key(&schema_version))
    }

    /// Looks up an entry by type and version. Fail-closed: unknown pairs
    /// return `None`.
    #[must_use]
    pub fn lookup(&self, record_type: &str, schema_version: u32) -> Option<SchemaEntry> {
        self.entries
            .read()
            .unwrap()
            .get(record_type)
            .and_then(|versions| versions.get(&schema_version))
            .cloned()
    }

    /// Returns the stakes classification of a type, if declared.
    #[must_use]
    pub fn stakes_of(&self, record_type: &str) -> Option<StakesClass> {
        self.entries
            .read()
            .unwrap()
            .get(record_type)
            .and_then(|versions| versions.values().next_back())
            .map(|entry| entry.stakes)
    }

    /// Returns the number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().values().map(BTreeMap::len).sum()
    }

    /// Returns true if no entries are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers the ledger's own operational record schemas.
    ///
    /// Called once at ledger open; idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if a system schema conflicts with an existing entry.
    pub fn register_system_schemas(&self, now_ms: u64) -> Result<(), CatalogError> {
        for (record_type, stakes, terminal, content) in system_schemas::ALL {
            self.register_unchecked(SchemaEntry {
                record_type: (*record_type).to_string(),
                schema_version: 1,
                content: content.to_vec(),
                stakes: *stakes,
                terminal: *terminal,
                reverses: None,
                registered_at_ms: now_ms,
                registered_by: "ledger".to_string(),
            })?;
        }
        Ok(())
    }
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON-schema definitions for the ledger's operational record types.
pub mod system_schemas {
    use super::StakesClass;
    use crate::record::system_types;

    /// Lease granted payload schema.
    pub const LEASE_GRANTED: &[u8] = br#"{
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["lease_id", "epoch", "holder_id", "issued_at_ms", "expires_at_ms"],
        "properties": {
            "lease_id": {"type": "integer"},
            "epoch": {"type": "integer"},
            "holder_id": {"type": "string"},
            "issued_at_ms": {"type": "integer"},
            "expires_at_ms": {"type": "integer"}
        }
    }"#;

    /// Lease handoff payload schema.
    pub const LEASE_HANDOFF: &[u8] = br#"{
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["lease_id", "epoch", "holder_id", "previous_holder_id"],
        "properties": {
            "lease_id": {"type": "integer"},
            "epoch": {"type": "integer"},
            "holder_id": {"type": "string"},
            "previous_holder_id": {"type": "string"}
        }
    }"#;

    /// Lease released payload schema.
    pub const LEASE_RELEASED: &[u8] = br#"{
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["lease_id", "epoch", "holder_id", "released_at_ms"],
        "properties": {
            "lease_id": {"type": "integer"},
            "epoch": {"type": "integer"},
            "holder_id": {"type": "string"},
            "released_at_ms": {"type": "integer"}
        }
    }"#;

    /// Halt declaration payload schema.
    pub const HALT_DECLARED: &[u8] = br#"{
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["reason", "triggering_records", "declared_at_ms"],
        "properties": {
            "reason": {"type": "string"},
            "triggering_records": {"type": "array", "items": {"type": "integer"}},
            "declared_at_ms": {"type": "integer"}
        }
    }"#;

    /// Recovery decision payload schema.
    pub const RECOVERY_DECIDED: &[u8] = br#"{
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["canonical_head", "approved_by", "waiting_period_ms", "decided_at_ms"],
        "properties": {
            "canonical_head": {"type": "integer"},
            "approved_by": {"type": "array", "items": {"type": "string"}},
            "waiting_period_ms": {"type": "integer"},
            "decided_at_ms": {"type": "integer"}
        }
    }"#;

    /// All system schemas: (type, stakes, terminal, content).
    ///
    /// The halt declaration is terminal: the catalog's closed-terminal rule
    /// guarantees no "halt reversed" type can ever register. Recovery is a
    /// separate procedure, not a reversal.
    pub const ALL: &[(&str, StakesClass, bool, &[u8])] = &[
        (system_types::LEASE_GRANTED, StakesClass::High, false, LEASE_GRANTED),
        (system_types::LEASE_HANDOFF, StakesClass::High, false, LEASE_HANDOFF),
        (system_types::LEASE_RELEASED, StakesClass::Low, false, LEASE_RELEASED),
        (system_types::HALT_DECLARED, StakesClass::Low, true, HALT_DECLARED),
        (system_types::RECOVERY_DECIDED, StakesClass::High, false, RECOVERY_DECIDED),
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(record_type: &str, version: u32, content: &[u8]) -> SchemaEntry {
        SchemaEntry {
            record_type: record_type.to_string(),
            schema_version: version,
            content: content.to_vec(),
            stakes: StakesClass::Low,
            terminal: false,
            reverses: None,
            registered_at_ms: 0,
            registered_by: "test".to_string(),
        }
    }

    #[test]
    fn register_and_lookup() {
        let catalog = SchemaCatalog::new();
        catalog.register(entry("motion.filed", 1, br#"{"type":"object"}"#)).unwrap();

        assert!(catalog.is_declared("motion.filed", 1));
        assert!(!catalog.is_declared("motion.filed", 2));
        assert!(!catalog.is_declared("motion.withdrawn", 1));
        assert_eq!(catalog.lookup("motion.filed", 1).unwrap().schema_version, 1);
    }

    #[test]
    fn identical_reregistration_is_idempotent() {
        let catalog = SchemaCatalog::new();
        catalog.register(entry("motion.filed", 1, br#"{"type":"object"}"#)).unwrap();
        catalog.register(entry("motion.filed", 1, br#"{"type":"object"}"#)).unwrap();
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn conflicting_content_is_rejected() {
        let catalog = SchemaCatalog::new();
        catalog.register(entry("motion.filed", 1, br#"{"type":"object"}"#)).unwrap();

        let result = catalog.register(entry("motion.filed", 1, br#"{"type":"string"}"#));
        assert!(matches!(result, Err(CatalogError::Immutable { .. })));
    }

    #[test]
    fn reversal_of_terminal_type_is_rejected() {
        let catalog = SchemaCatalog::new();
        let mut dissolved = entry("assembly.dissolved", 1, br#"{"type":"object"}"#);
        dissolved.terminal = true;
        catalog.register(dissolved).unwrap();

        let mut reversal = entry("assembly.reconstituted", 1, br#"{"type":"object"}"#);
        reversal.reverses = Some("assembly.dissolved".to_string());
        assert!(matches!(
            catalog.register(reversal),
            Err(CatalogError::ReversalOfTerminal { .. })
        ));
    }

    #[test]
    fn reversal_of_non_terminal_type_is_allowed() {
        let catalog = SchemaCatalog::new();
        catalog.register(entry("motion.filed", 1, br#"{"type":"object"}"#)).unwrap();

        let mut withdrawal = entry("motion.withdrawn", 1, br#"{"type":"object"}"#);
        withdrawal.reverses = Some("motion.filed".to_string());
        catalog.register(withdrawal).unwrap();
    }

    #[test]
    fn invalid_json_content_fails_closed() {
        let catalog = SchemaCatalog::new();
        assert!(matches!(
            catalog.register(entry("motion.filed", 1, b"not json")),
            Err(CatalogError::InvalidSchemaContent { .. })
        ));
    }

    #[test]
    fn reserved_prefix_rejected_for_external_registrants() {
        let catalog = SchemaCatalog::new();
        assert!(matches!(
            catalog.register(entry("ledger.fake_type", 1, br#"{"type":"object"}"#)),
            Err(CatalogError::ReservedPrefix { .. })
        ));
    }

    #[test]
    fn system_schemas_register_idempotently() {
        let catalog = SchemaCatalog::new();
        catalog.register_system_schemas(0).unwrap();
        catalog.register_system_schemas(0).unwrap();

        assert_eq!(catalog.len(), system_schemas::ALL.len());
        assert!(catalog.is_declared(system_types::HALT_DECLARED, 1));
        assert_eq!(
            catalog.stakes_of(system_types::LEASE_GRANTED),
            Some(StakesClass::High)
        );
    }

    #[test]
    fn no_reversal_of_halt_can_register() {
        let catalog = SchemaCatalog::new();
        catalog.register_system_schemas(0).unwrap();

        let mut reversal = entry("ops.halt_reversed", 1, br#"{"type":"object"}"#);
        reversal.reverses = Some(system_types::HALT_DECLARED.to_string());
        assert!(matches!(
            catalog.register(reversal),
            Err(CatalogError::ReversalOfTerminal { .. })
        ));
    }
}
