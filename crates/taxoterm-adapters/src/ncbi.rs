//! NCBI Datasets v2 taxonomy adapter.
//!
//! Resolves by `ncbi_taxon_id` first and falls back to a name search on the
//! species. The payload carries `Lineage`/`LineageEx` alongside the node
//! fields; the term merge keys on those two.

use async_trait::async_trait;
use serde_json::{json, Value};

use taxoterm_core::Taxon;
use taxoterm_storage::{FetchOptions, HttpFetcher};

use crate::{AdapterContext, AdapterError, SourceAdapter};

const DATASETS_BASE: &str = "https://api.ncbi.nlm.nih.gov/datasets/v2";

#[derive(Debug, Clone, Copy)]
pub struct NcbiAdapter;

#[async_trait]
impl SourceAdapter for NcbiAdapter {
    fn name(&self) -> &'static str {
        "ncbi"
    }

    async fn retrieve(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        taxon: &Taxon,
    ) -> Result<Option<Value>, AdapterError> {
        let mut node = self.fetch_node(http, ctx, &taxon.ncbi_taxon_id).await?;

        // The registered id can lag behind NCBI merges; retry by name.
        if node.is_none() {
            if let Some(tax_id) = self.suggest_tax_id(http, ctx, &taxon.species).await? {
                node = self.fetch_node(http, ctx, &tax_id).await?;
            }
        }

        let Some(node) = node else {
            return Ok(None);
        };

        let lineage_ids = lineage_ids(&node);
        let lineage_nodes = if lineage_ids.is_empty() {
            Vec::new()
        } else {
            let joined = lineage_ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let url = format!("{DATASETS_BASE}/taxonomy/taxon/{joined}");
            let resp = http
                .get_json(ctx.run_id, self.name(), &url, FetchOptions::default())
                .await?;
            taxonomy_nodes(&resp)
        };

        Ok(Some(taxonomy_payload(&node, &lineage_nodes)))
    }
}

impl NcbiAdapter {
    async fn fetch_node(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        tax_id: &str,
    ) -> Result<Option<Value>, AdapterError> {
        let url = format!("{DATASETS_BASE}/taxonomy/taxon/{tax_id}");
        let resp = http
            .get_json(ctx.run_id, self.name(), &url, FetchOptions::default())
            .await?;
        Ok(taxonomy_nodes(&resp).into_iter().next())
    }

    async fn suggest_tax_id(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        species: &str,
    ) -> Result<Option<String>, AdapterError> {
        let url = format!("{DATASETS_BASE}/taxonomy/taxon_suggest/{species}");
        let resp = http
            .get_json(ctx.run_id, self.name(), &url, FetchOptions::default())
            .await?;
        Ok(suggested_tax_id(&resp))
    }
}

/// Unwraps the `taxonomy_nodes[].taxonomy` envelopes of a Datasets response.
fn taxonomy_nodes(resp: &Value) -> Vec<Value> {
    resp.get("taxonomy_nodes")
        .and_then(Value::as_array)
        .map(|nodes| {
            nodes
                .iter()
                .filter_map(|n| n.get("taxonomy"))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn suggested_tax_id(resp: &Value) -> Option<String> {
    let first = resp.get("sci_name_and_ids")?.as_array()?.first()?;
    match first.get("tax_id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lineage_ids(node: &Value) -> Vec<i64> {
    node.get("lineage")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

fn taxonomy_payload(node: &Value, lineage_nodes: &[Value]) -> Value {
    let lineage_names: Vec<&str> = lineage_nodes
        .iter()
        .filter_map(|n| n.get("organism_name").and_then(Value::as_str))
        .collect();
    let lineage_ex: Vec<Value> = lineage_nodes
        .iter()
        .map(|n| {
            json!({
                "TaxId": n.get("tax_id").cloned().unwrap_or(Value::Null),
                "ScientificName": n.get("organism_name").cloned().unwrap_or(Value::Null),
                "Rank": n.get("rank").cloned().unwrap_or(Value::Null),
            })
        })
        .collect();

    let mut payload = json!({
        "TaxId": node.get("tax_id").cloned().unwrap_or(Value::Null),
        "ScientificName": node.get("organism_name").cloned().unwrap_or(Value::Null),
        "Rank": node.get("rank").cloned().unwrap_or(Value::Null),
    });
    if !lineage_names.is_empty() {
        payload["Lineage"] = Value::String(lineage_names.join("; "));
        payload["LineageEx"] = Value::Array(lineage_ex);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datasets_response() -> Value {
        json!({
            "taxonomy_nodes": [{
                "taxonomy": {
                    "tax_id": 562,
                    "organism_name": "Escherichia coli",
                    "rank": "SPECIES",
                    "lineage": [131567, 2, 1224],
                }
            }]
        })
    }

    #[test]
    fn taxonomy_nodes_unwraps_the_envelope() {
        let nodes = taxonomy_nodes(&datasets_response());
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0]["organism_name"], "Escherichia coli");
        assert!(taxonomy_nodes(&json!({})).is_empty());
    }

    #[test]
    fn lineage_ids_reads_the_id_list() {
        let node = taxonomy_nodes(&datasets_response()).remove(0);
        assert_eq!(lineage_ids(&node), vec![131567, 2, 1224]);
    }

    #[test]
    fn payload_carries_lineage_and_lineage_ex() {
        let node = taxonomy_nodes(&datasets_response()).remove(0);
        let lineage = vec![
            json!({"tax_id": 131567, "organism_name": "cellular organisms", "rank": "NO_RANK"}),
            json!({"tax_id": 2, "organism_name": "Bacteria", "rank": "SUPERKINGDOM"}),
        ];
        let payload = taxonomy_payload(&node, &lineage);
        assert_eq!(payload["Lineage"], "cellular organisms; Bacteria");
        assert_eq!(payload["LineageEx"][1]["ScientificName"], "Bacteria");
        assert_eq!(payload["ScientificName"], "Escherichia coli");
    }

    #[test]
    fn payload_without_lineage_omits_the_lineage_fields() {
        let node = json!({"tax_id": 562, "organism_name": "Escherichia coli", "rank": "SPECIES"});
        let payload = taxonomy_payload(&node, &[]);
        assert!(payload.get("Lineage").is_none());
        assert!(payload.get("LineageEx").is_none());
    }

    #[test]
    fn suggest_accepts_string_and_numeric_ids() {
        assert_eq!(
            suggested_tax_id(&json!({"sci_name_and_ids": [{"tax_id": "562"}]})),
            Some("562".to_string())
        );
        assert_eq!(
            suggested_tax_id(&json!({"sci_name_and_ids": [{"tax_id": 562}]})),
            Some("562".to_string())
        );
        assert_eq!(suggested_tax_id(&json!({"sci_name_and_ids": []})), None);
    }
}
