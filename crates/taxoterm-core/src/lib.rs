//! Core domain model and coverage bookkeeping for taxoterm.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "taxoterm-core";

/// Canonical species entry, keyed by an internal numeric id and carrying the
/// external NCBI taxonomy identifier used by the source adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxon {
    pub taxon_id: i64,
    pub ncbi_taxon_id: String,
    pub species: String,
}

/// The set of web sources a taxon is registered to be fetched from.
/// A taxon has at most one portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portal {
    pub portal_id: i64,
    pub taxon_id: i64,
    pub webs: Vec<String>,
}

/// One normalized payload from one source for one portal.
/// Unique per `(portal_id, web)`; re-fetching replaces the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub portal_id: i64,
    pub taxon_id: i64,
    pub web: String,
    pub species: String,
    pub data: Value,
    pub fetched_at: DateTime<Utc>,
}

/// The per-taxon merged view folding all raw records through the fixed
/// section-extraction table. One per taxon, fully replaced on every merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermDocument {
    pub taxon_id: i64,
    pub species: String,
    pub data: Map<String, Value>,
    pub merged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageStatus {
    NotFound,
    PartiallyFound,
    Found,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStatus {
    Success,
    NotFound,
}

/// Outcome for one attempted web source within a coverage result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebOutcome {
    pub web: String,
    pub status: RetrievalStatus,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FoundWebs {
    pub exist: Vec<WebOutcome>,
    pub not_exist: Vec<WebOutcome>,
}

/// Per-taxon accounting for one aggregation call. `found_webs.exist`,
/// `found_webs.not_exist` and `missing_webs` partition the in-scope web set:
/// every in-scope web lands in exactly one of the three.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageResult {
    pub taxon_id: i64,
    pub species: String,
    pub found_webs: FoundWebs,
    pub missing_webs: Vec<String>,
    pub status: CoverageStatus,
    pub info: String,
}

pub const SPECIES_UNKNOWN: &str = "Unknown species";
pub const TAXON_NOT_EXIST: &str = "Taxon does not exist";
pub const PORTAL_NOT_EXIST: &str = "Portal does not exist";
pub const RAW_NOT_EXIST: &str = "No raw records found for this taxon";

const INFO_NONE_FOUND: &str = "No data found for any provided web sources.";
const INFO_SOME_FOUND: &str = "Data retrieved from source and stored for some webs.";
const INFO_ALL_FOUND: &str = "Data retrieved from source and stored for all provided web sources.";
const INFO_WEB_STORED: &str = "Data retrieved from source and stored successfully.";
const INFO_WEB_EMPTY: &str = "No data retrieved from source and no data stored.";

impl CoverageResult {
    /// Result for a taxon that never reached retrieval (unknown taxon or no
    /// portal). The whole requested set stays in `missing_webs`.
    pub fn not_found(
        taxon_id: i64,
        species: Option<&str>,
        requested_webs: &[String],
        info: &str,
    ) -> Self {
        Self {
            taxon_id,
            species: species.unwrap_or(SPECIES_UNKNOWN).to_string(),
            found_webs: FoundWebs::default(),
            missing_webs: requested_webs.to_vec(),
            status: CoverageStatus::NotFound,
            info: info.to_string(),
        }
    }
}

/// Builds one [`CoverageResult`] from three disjoint web sets.
///
/// Starts with every in-scope web in `missing`; each attempt moves exactly
/// one web into `exist` or `not_exist`, so the accounting invariant holds by
/// construction.
#[derive(Debug)]
pub struct CoverageAccumulator {
    taxon_id: i64,
    species: String,
    in_scope: usize,
    exist: Vec<WebOutcome>,
    not_exist: Vec<WebOutcome>,
    missing: Vec<String>,
}

impl CoverageAccumulator {
    pub fn new(taxon_id: i64, species: &str, in_scope_webs: Vec<String>) -> Self {
        Self {
            taxon_id,
            species: species.to_string(),
            in_scope: in_scope_webs.len(),
            exist: Vec::new(),
            not_exist: Vec::new(),
            missing: in_scope_webs,
        }
    }

    /// The source returned a usable payload that was queued for persistence.
    pub fn record_hit(&mut self, web: &str) {
        if self.take_missing(web) {
            self.exist.push(WebOutcome {
                web: web.to_string(),
                status: RetrievalStatus::Success,
                info: INFO_WEB_STORED.to_string(),
            });
        }
    }

    /// The source was attempted but produced nothing (empty payload or
    /// exhausted retries).
    pub fn record_miss(&mut self, web: &str) {
        if self.take_missing(web) {
            self.not_exist.push(WebOutcome {
                web: web.to_string(),
                status: RetrievalStatus::NotFound,
                info: INFO_WEB_EMPTY.to_string(),
            });
        }
    }

    fn take_missing(&mut self, web: &str) -> bool {
        match self.missing.iter().position(|w| w == web) {
            Some(idx) => {
                self.missing.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn finish(self) -> CoverageResult {
        let (status, info) = if self.exist.is_empty() {
            (CoverageStatus::NotFound, INFO_NONE_FOUND)
        } else if self.exist.len() == self.in_scope {
            (CoverageStatus::Found, INFO_ALL_FOUND)
        } else {
            (CoverageStatus::PartiallyFound, INFO_SOME_FOUND)
        };
        CoverageResult {
            taxon_id: self.taxon_id,
            species: self.species,
            found_webs: FoundWebs {
                exist: self.exist,
                not_exist: self.not_exist,
            },
            missing_webs: self.missing,
            status,
            info: info.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Found,
    NotFound,
}

/// Per-taxon outcome of a term merge run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub taxon_id: i64,
    pub species: String,
    pub data: Map<String, Value>,
    pub status: MergeStatus,
    pub info: String,
}

impl MergeResult {
    pub fn found(taxon_id: i64, species: &str, data: Map<String, Value>) -> Self {
        Self {
            taxon_id,
            species: species.to_string(),
            data,
            status: MergeStatus::Found,
            info: "Data stored successfully.".to_string(),
        }
    }

    pub fn not_found(taxon_id: i64, species: Option<&str>, info: &str) -> Self {
        Self {
            taxon_id,
            species: species.unwrap_or_default().to_string(),
            data: Map::new(),
            status: MergeStatus::NotFound,
            info: info.to_string(),
        }
    }
}

/// Structural request failures, rejected before any retrieval or persistence
/// happens. Translated to transport status codes at the web boundary only.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("no data was provided in the request payload")]
    EmptyPayload,
    #[error("unsupported web source: {0}")]
    UnsupportedSource(String),
    #[error("a valid identifier is required for this operation")]
    MissingIdentifier,
}

/// One search hit: identity fields plus only the sub-fields that matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermSearchHit {
    pub taxon_id: i64,
    pub species: String,
    pub data: Map<String, Value>,
}

/// Recursively keeps only the parts of a value tree containing `needle`
/// (case-insensitive substring). Objects and arrays are pruned to matching
/// children; a fully non-matching subtree yields `None`.
pub fn matching_sections(value: &Value, needle: &str) -> Option<Value> {
    let needle = needle.to_lowercase();
    prune(value, &needle)
}

fn prune(value: &Value, needle: &str) -> Option<Value> {
    match value {
        Value::String(s) => s.to_lowercase().contains(needle).then(|| value.clone()),
        Value::Object(map) => {
            let kept: Map<String, Value> = map
                .iter()
                .filter_map(|(k, v)| prune(v, needle).map(|m| (k.clone(), m)))
                .collect();
            (!kept.is_empty()).then(|| Value::Object(kept))
        }
        Value::Array(items) => {
            let kept: Vec<Value> = items.iter().filter_map(|v| prune(v, needle)).collect();
            (!kept.is_empty()).then(|| Value::Array(kept))
        }
        _ => None,
    }
}

/// Shapes term documents into search hits, dropping documents with no match.
pub fn filter_term_matches(terms: &[TermDocument], needle: &str) -> Vec<TermSearchHit> {
    terms
        .iter()
        .filter_map(|term| {
            let matched = matching_sections(&Value::Object(term.data.clone()), needle)?;
            let data = match matched {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            Some(TermSearchHit {
                taxon_id: term.taxon_id,
                species: term.species.clone(),
                data,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn webs(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn accumulator_partitions_the_in_scope_set() {
        let mut acc = CoverageAccumulator::new(1, "Escherichia coli", webs(&["ncbi", "gbif", "bacdive"]));
        acc.record_hit("ncbi");
        acc.record_miss("gbif");
        let result = acc.finish();

        let exist: BTreeSet<_> = result.found_webs.exist.iter().map(|o| o.web.as_str()).collect();
        let not_exist: BTreeSet<_> =
            result.found_webs.not_exist.iter().map(|o| o.web.as_str()).collect();
        let missing: BTreeSet<_> = result.missing_webs.iter().map(String::as_str).collect();

        assert_eq!(exist, BTreeSet::from(["ncbi"]));
        assert_eq!(not_exist, BTreeSet::from(["gbif"]));
        assert_eq!(missing, BTreeSet::from(["bacdive"]));

        let mut all: BTreeSet<&&str> = BTreeSet::new();
        all.extend(&exist);
        all.extend(&not_exist);
        all.extend(&missing);
        assert_eq!(all.len(), 3, "no web double-counted or dropped");
        assert_eq!(result.status, CoverageStatus::PartiallyFound);
    }

    #[test]
    fn status_found_requires_every_in_scope_web_to_exist() {
        let mut acc = CoverageAccumulator::new(1, "x", webs(&["ncbi", "gbif"]));
        acc.record_hit("ncbi");
        acc.record_hit("gbif");
        let result = acc.finish();
        assert_eq!(result.status, CoverageStatus::Found);
        assert!(result.missing_webs.is_empty());
    }

    #[test]
    fn status_not_found_when_nothing_exists() {
        let mut acc = CoverageAccumulator::new(1, "x", webs(&["ncbi"]));
        acc.record_miss("ncbi");
        let result = acc.finish();
        assert_eq!(result.status, CoverageStatus::NotFound);
        assert_eq!(result.found_webs.not_exist.len(), 1);
    }

    #[test]
    fn duplicate_attempts_for_one_web_are_collapsed() {
        let mut acc = CoverageAccumulator::new(1, "x", webs(&["ncbi"]));
        acc.record_hit("ncbi");
        acc.record_hit("ncbi");
        acc.record_miss("ncbi");
        let result = acc.finish();
        assert_eq!(result.found_webs.exist.len(), 1);
        assert!(result.found_webs.not_exist.is_empty());
    }

    #[test]
    fn out_of_scope_web_is_ignored() {
        let mut acc = CoverageAccumulator::new(1, "x", webs(&["ncbi"]));
        acc.record_hit("wikidata");
        let result = acc.finish();
        assert!(result.found_webs.exist.is_empty());
        assert_eq!(result.missing_webs, webs(&["ncbi"]));
    }

    #[test]
    fn matching_sections_keeps_only_matching_subtrees() {
        let doc = json!({
            "Morphology": {"cell shape": "rod-shaped", "gram stain": "negative"},
            "Safety information": {"risk group": "1"},
        });
        let matched = matching_sections(&doc, "ROD").unwrap();
        assert_eq!(
            matched,
            json!({"Morphology": {"cell shape": "rod-shaped"}})
        );
        assert!(matching_sections(&doc, "flagella").is_none());
    }

    #[test]
    fn matching_sections_prunes_arrays_to_matching_elements() {
        let doc = json!({"keywords": ["mesophilic", "gram-negative"]});
        let matched = matching_sections(&doc, "meso").unwrap();
        assert_eq!(matched, json!({"keywords": ["mesophilic"]}));
    }

    #[test]
    fn filter_term_matches_keeps_identity_fields() {
        let term = TermDocument {
            taxon_id: 9,
            species: "Bacillus subtilis".into(),
            data: json!({"Morphology": {"cell shape": "rod-shaped"}})
                .as_object()
                .cloned()
                .unwrap(),
            merged_at: Utc::now(),
        };
        let hits = filter_term_matches(std::slice::from_ref(&term), "rod");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].taxon_id, 9);
        assert_eq!(hits[0].species, "Bacillus subtilis");
        assert!(hits[0].data.contains_key("Morphology"));

        assert!(filter_term_matches(std::slice::from_ref(&term), "cocci").is_empty());
    }
}
