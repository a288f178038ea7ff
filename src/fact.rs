/// Facts: immutable, content-addressed records.
///
/// A fact is identified by the hash of its type, its fields, and the
/// references it holds to its predecessors. Two facts built from the same
/// parts always hash to the same value, so storing one twice collapses to a
/// single record.
///
/// There are two representations:
///
/// - [`FactReference`] is a `(type, hash)` handle. Queries traverse these and
///   never look at field contents.
/// - [`FactRecord`] carries the fields and predecessor references as well.
///
/// The [`crate::mapper::FactMapper`] converts between nested JSON documents
/// and flat records.
use crate::error::SyncResult;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Lightweight handle to a fact, without field data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactReference {
    /// The declared type of the fact (e.g. "Task")
    #[serde(rename = "type")]
    pub fact_type: String,
    /// Hex-encoded SHA-256 of the canonical fact content
    pub hash: String,
}

impl FactReference {
    /// Create a new reference.
    pub fn new(fact_type: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            fact_type: fact_type.into(),
            hash: hash.into(),
        }
    }

    /// Short form used in log lines: `Task:1a2b3c4d`.
    pub fn short(&self) -> String {
        let prefix: String = self.hash.chars().take(8).collect();
        format!("{}:{}", self.fact_type, prefix)
    }
}

impl fmt::Display for FactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fact_type, self.hash)
    }
}

/// The predecessors a fact declares under one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredecessorList {
    /// A single predecessor (`list: {...}`)
    Single(FactReference),
    /// Zero or more predecessors (`prior: [{...}, {...}]`)
    Many(Vec<FactReference>),
}

impl PredecessorList {
    /// Iterate over every reference in this role.
    pub fn iter(&self) -> impl Iterator<Item = &FactReference> {
        let slice: &[FactReference] = match self {
            PredecessorList::Single(reference) => std::slice::from_ref(reference),
            PredecessorList::Many(references) => references,
        };
        slice.iter()
    }

    /// Whether `reference` appears in this role.
    pub fn contains(&self, reference: &FactReference) -> bool {
        self.iter().any(|r| r == reference)
    }
}

/// A complete fact: type, fields and predecessor references.
///
/// Records are immutable once built. The `hash` is computed by
/// [`FactRecord::new`] and always agrees with the other parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRecord {
    /// The declared type of the fact
    #[serde(rename = "type")]
    pub fact_type: String,
    /// Content hash (see [`compute_hash`])
    pub hash: String,
    /// Scalar field values, keyed by field name
    pub fields: BTreeMap<String, JsonValue>,
    /// Predecessor references, keyed by role
    pub predecessors: BTreeMap<String, PredecessorList>,
}

impl FactRecord {
    /// Build a record, computing its content hash.
    pub fn new(
        fact_type: impl Into<String>,
        fields: BTreeMap<String, JsonValue>,
        predecessors: BTreeMap<String, PredecessorList>,
    ) -> SyncResult<Self> {
        let fact_type = fact_type.into();
        let hash = compute_hash(&fact_type, &fields, &predecessors)?;
        Ok(Self {
            fact_type,
            hash,
            fields,
            predecessors,
        })
    }

    /// The reference that identifies this record.
    pub fn reference(&self) -> FactReference {
        FactReference::new(self.fact_type.clone(), self.hash.clone())
    }

    /// Predecessors declared under `role`, empty if the role is absent.
    pub fn predecessors_in(&self, role: &str) -> impl Iterator<Item = &FactReference> {
        self.predecessors.get(role).into_iter().flat_map(|list| list.iter())
    }

    /// Recompute the hash and compare it with the stored one.
    pub fn verify(&self) -> SyncResult<bool> {
        Ok(compute_hash(&self.fact_type, &self.fields, &self.predecessors)? == self.hash)
    }
}

/// Canonical form fed to the hasher. Keys are sorted by `BTreeMap`.
#[derive(Serialize)]
struct CanonicalFact<'a> {
    fields: &'a BTreeMap<String, JsonValue>,
    predecessors: &'a BTreeMap<String, PredecessorList>,
    #[serde(rename = "type")]
    fact_type: &'a str,
}

/// Hash the identifying content of a fact.
///
/// Equal `(type, fields, predecessors)` always produce equal hashes;
/// field order in the source document does not matter.
pub fn compute_hash(
    fact_type: &str,
    fields: &BTreeMap<String, JsonValue>,
    predecessors: &BTreeMap<String, PredecessorList>,
) -> SyncResult<String> {
    let canonical = CanonicalFact {
        fields,
        predecessors,
        fact_type,
    };
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
