//! The per-source section-extraction table.
//!
//! Each source contributes sections under names no other source emits, so
//! merging is additive and the result is independent of the order raw records
//! are folded in. Adding a source means adding an arm here.

use serde_json::{json, Map, Value};

use taxoterm_core::RawRecord;

pub const SECTION_TAXONOMY: &str = "Name and taxonomic classification";
pub const SECTION_OCCURRENCE: &str = "Occurence (geoference records)";

/// BacDive top-level sections copied through verbatim when present.
pub const BACDIVE_SECTIONS: [&str; 7] = [
    "Morphology",
    "Culture and growth conditions",
    "Physiology and metabolism",
    "Isolation, sampling and environmental information",
    "Safety information",
    "Sequence information",
    "Genome-based predictions",
];

/// Folds all raw records for one taxon into the merged term sections.
/// Unknown sources contribute nothing.
pub fn merge_sections(raws: &[RawRecord]) -> Map<String, Value> {
    let mut merged = Map::new();
    for raw in raws {
        match raw.web.as_str() {
            "ncbi" => {
                let lineage = raw.data.get("Lineage").filter(|v| non_empty(v));
                let lineage_ex = raw.data.get("LineageEx").filter(|v| non_empty(v));
                if let (Some(lineage), Some(lineage_ex)) = (lineage, lineage_ex) {
                    merged.insert(
                        SECTION_TAXONOMY.to_string(),
                        json!({"Lineage": lineage, "LineageEx": lineage_ex}),
                    );
                }
            }
            "bacdive" => {
                for section in BACDIVE_SECTIONS {
                    if let Some(value) = raw.data.get(section).filter(|v| non_empty(v)) {
                        merged.insert(section.to_string(), value.clone());
                    }
                }
            }
            "gbif" => {
                if non_empty(&raw.data) {
                    merged.insert(SECTION_OCCURRENCE.to_string(), raw.data.clone());
                }
            }
            _ => {}
        }
    }
    merged
}

fn non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}
