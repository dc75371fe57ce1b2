// 🕸️ Object Graph Builder - STIX 2.1 objects
// One record becomes a file observable, an indicator on its hash, and a based-on relationship
//
// Identifiers are content-derived (UUIDv5 over canonical JSON), so building the
// same record twice yields the same ids and the sink can upsert re-deliveries.

use crate::record::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// TLP:CLEAR marking definition, shared by every emitted object
pub const TLP_CLEAR_ID: &str = "marking-definition--613f2e26-407d-48c7-9eca-b8e91df99dc9";

/// Namespace used for STIX / OpenCTI deterministic identifiers
pub const STIX_ID_NAMESPACE: Uuid = Uuid::from_u128(0x00abedb4_aa42_466c_9c01_fed23315a9b7);

pub const RELATIONSHIP_BASED_ON: &str = "based-on";
pub const EXTERNAL_SOURCE_NAME: &str = "ossf-malicious-packages";
pub const SPEC_VERSION: &str = "2.1";
const HASH_ALGORITHM: &str = "SHA-256";

// ============================================================================
// GRAPH OBJECTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GraphObject {
    #[serde(rename = "file")]
    Observable(FileObservable),
    Indicator(Indicator),
    Relationship(Relationship),
}

impl GraphObject {
    pub fn id(&self) -> &str {
        match self {
            GraphObject::Observable(o) => &o.id,
            GraphObject::Indicator(i) => &i.id,
            GraphObject::Relationship(r) => &r.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GraphObject::Observable(_) => "file",
            GraphObject::Indicator(_) => "indicator",
            GraphObject::Relationship(_) => "relationship",
        }
    }

    pub fn marking_refs(&self) -> &[String] {
        match self {
            GraphObject::Observable(o) => &o.object_marking_refs,
            GraphObject::Indicator(i) => &i.object_marking_refs,
            GraphObject::Relationship(r) => &r.object_marking_refs,
        }
    }
}

/// File observable keyed by its SHA-256
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileObservable {
    pub spec_version: String,
    pub id: String,
    pub name: String,
    pub hashes: BTreeMap<String, String>,
    pub x_opencti_description: String,
    pub object_marking_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalReference {
    pub source_name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    pub spec_version: String,
    pub id: String,
    #[serde(with = "stix_timestamp")]
    pub created: DateTime<Utc>,
    #[serde(with = "stix_timestamp")]
    pub modified: DateTime<Utc>,
    pub name: String,
    pub description: String,
    pub pattern: String,
    pub pattern_type: String,
    #[serde(with = "stix_timestamp")]
    pub valid_from: DateTime<Utc>,
    pub external_references: Vec<ExternalReference>,
    pub object_marking_refs: Vec<String>,
    pub x_opencti_main_observable_type: String,
    pub x_opencti_score: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub spec_version: String,
    pub id: String,
    #[serde(with = "stix_timestamp")]
    pub created: DateTime<Utc>,
    #[serde(with = "stix_timestamp")]
    pub modified: DateTime<Utc>,
    pub relationship_type: String,
    pub source_ref: String,
    pub target_ref: String,
    pub object_marking_refs: Vec<String>,
}

// ============================================================================
// DETERMINISTIC IDENTIFIERS
// ============================================================================

/// `[file:hashes.'SHA-256' = '<hash>']`
pub fn indicator_pattern(sha256: &str) -> String {
    format!("[file:hashes.'{}' = '{}']", HASH_ALGORITHM, sha256)
}

pub fn observable_id(sha256: &str) -> String {
    let contributing = serde_json::json!({ "hashes": { "SHA-256": sha256 } });
    deterministic_id("file", &contributing)
}

pub fn indicator_id(pattern: &str) -> String {
    let contributing = serde_json::json!({ "pattern": pattern });
    deterministic_id("indicator", &contributing)
}

pub fn relationship_id(relationship_type: &str, source_ref: &str, target_ref: &str) -> String {
    let contributing = serde_json::json!({
        "relationship_type": relationship_type,
        "source_ref": source_ref,
        "target_ref": target_ref,
    });
    deterministic_id("relationship", &contributing)
}

// serde_json maps are key-sorted, so to_string() is already canonical here.
fn deterministic_id(object_type: &str, contributing: &serde_json::Value) -> String {
    let canonical = contributing.to_string();
    let uuid = Uuid::new_v5(&STIX_ID_NAMESPACE, canonical.as_bytes());
    format!("{}--{}", object_type, uuid)
}

// ============================================================================
// OBJECT GRAPH BUILDER
// ============================================================================

pub struct ObjectGraphBuilder {
    /// Confidence score stamped on indicators (0-100)
    pub score: u8,

    /// Creation time stamped on indicators and relationships
    pub timestamp: DateTime<Utc>,

    /// Classification marking shared by every object
    pub marking: String,
}

impl ObjectGraphBuilder {
    pub fn new(score: u8, timestamp: DateTime<Utc>) -> Self {
        ObjectGraphBuilder {
            score,
            timestamp,
            marking: TLP_CLEAR_ID.to_string(),
        }
    }

    /// Build the observable, indicator and relationship for one record
    ///
    /// Returns either all three objects or none: a record with a blank id or
    /// hash contributes nothing.
    pub fn build(&self, record: &Record, provenance_url: &str) -> Vec<GraphObject> {
        if record.id.trim().is_empty() || record.content_hash.trim().is_empty() {
            return Vec::new();
        }

        let sha256 = record.content_hash.as_str();
        let pattern = indicator_pattern(sha256);
        let markings = vec![self.marking.clone()];

        let observable = FileObservable {
            spec_version: SPEC_VERSION.to_string(),
            id: observable_id(sha256),
            name: record.id.clone(),
            hashes: BTreeMap::from([(HASH_ALGORITHM.to_string(), sha256.to_string())]),
            x_opencti_description: record.summary.clone(),
            object_marking_refs: markings.clone(),
        };

        let indicator = Indicator {
            spec_version: SPEC_VERSION.to_string(),
            id: indicator_id(&pattern),
            created: self.timestamp,
            modified: self.timestamp,
            name: format!("Malicious package {}", record.id),
            description: record.summary.clone(),
            pattern,
            pattern_type: "stix".to_string(),
            valid_from: self.timestamp,
            external_references: vec![ExternalReference {
                source_name: EXTERNAL_SOURCE_NAME.to_string(),
                url: provenance_url.to_string(),
            }],
            object_marking_refs: markings.clone(),
            x_opencti_main_observable_type: "File".to_string(),
            x_opencti_score: self.score,
        };

        let relationship = Relationship {
            spec_version: SPEC_VERSION.to_string(),
            id: relationship_id(RELATIONSHIP_BASED_ON, &indicator.id, &observable.id),
            created: self.timestamp,
            modified: self.timestamp,
            relationship_type: RELATIONSHIP_BASED_ON.to_string(),
            source_ref: indicator.id.clone(),
            target_ref: observable.id.clone(),
            object_marking_refs: markings,
        };

        vec![
            GraphObject::Observable(observable),
            GraphObject::Indicator(indicator),
            GraphObject::Relationship(relationship),
        ]
    }

    /// Same as `build`, for a parse result that may have been rejected
    pub fn build_checked(&self, record: Option<&Record>, provenance_url: &str) -> Vec<GraphObject> {
        match record {
            Some(record) => self.build(record, provenance_url),
            None => Vec::new(),
        }
    }
}

/// STIX timestamps: RFC 3339, UTC, millisecond precision
mod stix_timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
