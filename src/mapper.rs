/// Document-to-fact mapping layer.
///
/// Applications describe facts as nested JSON documents:
///
/// ```json
/// { "type": "Task", "description": "Buy milk",
///   "list": { "type": "List", "name": "Groceries" } }
/// ```
///
/// Storage and queries work with flat [`FactRecord`]s whose predecessors are
/// [`FactReference`]s. The mapper is the boundary between the two:
///
/// - `dehydrate` splits a document into records, predecessors first
/// - `hydrate` rebuilds the nested document from a set of records
///
/// A JSON object is fact-shaped when it has a string `type`. Fact-shaped
/// values nested under a key become predecessors under that role; arrays of
/// fact-shaped values become predecessor lists. Everything else is a field.
use crate::error::{SyncError, SyncResult};
use crate::fact::{FactRecord, FactReference, PredecessorList};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Maps JSON documents to and from fact records.
///
/// This is a stateless utility struct, like the rest of the mapping code it
/// performs deterministic transformations only.
pub struct FactMapper;

impl FactMapper {
    /// Split a nested fact document into records.
    ///
    /// The result is in topological order: every record appears after all of
    /// its predecessors, and the document's own record is last. Shared
    /// predecessors appear once.
    pub fn dehydrate(value: &JsonValue) -> SyncResult<Vec<FactRecord>> {
        let mut records = Vec::new();
        let mut seen = HashSet::new();
        Self::dehydrate_into(value, &mut records, &mut seen)?;
        Ok(records)
    }

    /// Dehydrate and return only the root reference.
    pub fn reference_of(value: &JsonValue) -> SyncResult<FactReference> {
        let records = Self::dehydrate(value)?;
        records
            .last()
            .map(FactRecord::reference)
            .ok_or_else(|| SyncError::invalid_fact("document produced no records"))
    }

    fn dehydrate_into(
        value: &JsonValue,
        records: &mut Vec<FactRecord>,
        seen: &mut HashSet<FactReference>,
    ) -> SyncResult<FactReference> {
        let object = value
            .as_object()
            .ok_or_else(|| SyncError::invalid_fact(format!("expected an object, found {}", value)))?;
        let fact_type = fact_type_of(object)
            .ok_or_else(|| SyncError::invalid_fact("fact is missing a string 'type'"))?;

        let mut fields = BTreeMap::new();
        let mut predecessors = BTreeMap::new();

        for (key, field) in object {
            if key == "type" {
                continue;
            }
            match field {
                JsonValue::Object(nested) if fact_type_of(nested).is_some() => {
                    let reference = Self::dehydrate_into(field, records, seen)?;
                    predecessors.insert(key.clone(), PredecessorList::Single(reference));
                }
                JsonValue::Array(items) if items.iter().any(is_fact_shaped) => {
                    if !items.iter().all(is_fact_shaped) {
                        return Err(SyncError::invalid_fact(format!(
                            "role '{}' mixes facts and plain values",
                            key
                        )));
                    }
                    let references = items
                        .iter()
                        .map(|item| Self::dehydrate_into(item, records, seen))
                        .collect::<SyncResult<Vec<_>>>()?;
                    predecessors.insert(key.clone(), PredecessorList::Many(references));
                }
                other => {
                    fields.insert(key.clone(), other.clone());
                }
            }
        }

        let record = FactRecord::new(fact_type, fields, predecessors)?;
        let reference = record.reference();
        if seen.insert(reference.clone()) {
            records.push(record);
        }
        Ok(reference)
    }

    /// Rebuild the nested document for `reference` from `records`.
    ///
    /// Every predecessor reachable from `reference` must be present.
    pub fn hydrate(
        records: &HashMap<FactReference, FactRecord>,
        reference: &FactReference,
    ) -> SyncResult<JsonValue> {
        let record = records
            .get(reference)
            .ok_or_else(|| SyncError::FactNotFound {
                reference: reference.clone(),
            })?;

        let mut object = Map::new();
        object.insert("type".to_string(), JsonValue::String(record.fact_type.clone()));
        for (name, value) in &record.fields {
            object.insert(name.clone(), value.clone());
        }
        for (role, list) in &record.predecessors {
            let hydrated = match list {
                PredecessorList::Single(predecessor) => Self::hydrate(records, predecessor)?,
                PredecessorList::Many(predecessors) => JsonValue::Array(
                    predecessors
                        .iter()
                        .map(|p| Self::hydrate(records, p))
                        .collect::<SyncResult<Vec<_>>>()?,
                ),
            };
            object.insert(role.clone(), hydrated);
        }
        Ok(JsonValue::Object(object))
    }
}

fn fact_type_of(object: &Map<String, JsonValue>) -> Option<&str> {
    object.get("type").and_then(JsonValue::as_str)
}

fn is_fact_shaped(value: &JsonValue) -> bool {
    value.as_object().and_then(fact_type_of).is_some()
}
