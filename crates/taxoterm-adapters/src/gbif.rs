//! GBIF adapter: species match by name, then the first occurrence record.

use async_trait::async_trait;
use serde_json::Value;

use taxoterm_core::Taxon;
use taxoterm_storage::{FetchOptions, HttpFetcher};

use crate::{AdapterContext, AdapterError, SourceAdapter};

const SPECIES_MATCH_URL: &str = "https://api.gbif.org/v1/species/match";
const OCCURRENCE_SEARCH_URL: &str = "https://api.gbif.org/v1/occurrence/search";

#[derive(Debug, Clone, Copy)]
pub struct GbifAdapter;

#[async_trait]
impl SourceAdapter for GbifAdapter {
    fn name(&self) -> &'static str {
        "gbif"
    }

    async fn retrieve(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        taxon: &Taxon,
    ) -> Result<Option<Value>, AdapterError> {
        let matched = http
            .get_json(
                ctx.run_id,
                self.name(),
                SPECIES_MATCH_URL,
                FetchOptions {
                    query: &[("name", taxon.species.as_str())],
                    ..Default::default()
                },
            )
            .await?;

        let Some(key) = usage_key(&matched) else {
            return Ok(None);
        };

        let key = key.to_string();
        let occurrences = http
            .get_json(
                ctx.run_id,
                self.name(),
                OCCURRENCE_SEARCH_URL,
                FetchOptions {
                    query: &[("taxonKey", key.as_str())],
                    ..Default::default()
                },
            )
            .await?;

        Ok(first_occurrence(&occurrences))
    }
}

fn usage_key(matched: &Value) -> Option<i64> {
    matched.get("usageKey").and_then(Value::as_i64)
}

fn first_occurrence(occurrences: &Value) -> Option<Value> {
    let first = occurrences.get("results")?.as_array()?.first()?;
    match first {
        Value::Object(map) if !map.is_empty() => Some(first.clone()),
        _ => None,
    }
}
