//! Wikidata adapter: SPARQL lookup of the item carrying the NCBI taxon id
//! property, label fallback, then the full entity document.

use async_trait::async_trait;
use serde_json::Value;

use taxoterm_core::Taxon;
use taxoterm_storage::{FetchOptions, HttpFetcher};

use crate::{AdapterContext, AdapterError, SourceAdapter};

const SPARQL_URL: &str = "https://query.wikidata.org/sparql";
const ENTITY_URL: &str = "https://www.wikidata.org/w/api.php";
const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

/// Wikidata property for the NCBI taxonomy id.
const NCBI_TAXON_ID_PROPERTY: &str = "P685";

#[derive(Debug, Clone, Copy)]
pub struct WikidataAdapter;

#[async_trait]
impl SourceAdapter for WikidataAdapter {
    fn name(&self) -> &'static str {
        "wikidata"
    }

    async fn retrieve(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        taxon: &Taxon,
    ) -> Result<Option<Value>, AdapterError> {
        let by_id = self
            .query_entity_id(http, ctx, &taxon_id_query(&taxon.ncbi_taxon_id))
            .await?;
        let entity_id = match by_id {
            Some(id) => Some(id),
            None => {
                self.query_entity_id(http, ctx, &label_query(&taxon.species))
                    .await?
            }
        };
        let Some(entity_id) = entity_id else {
            return Ok(None);
        };

        let resp = http
            .get_json(
                ctx.run_id,
                self.name(),
                ENTITY_URL,
                FetchOptions {
                    query: &[
                        ("action", "wbgetentities"),
                        ("format", "json"),
                        ("ids", entity_id.as_str()),
                        ("languages", "en"),
                    ],
                    ..Default::default()
                },
            )
            .await?;
        Ok(entity_document(&resp, &entity_id))
    }
}

impl WikidataAdapter {
    async fn query_entity_id(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        sparql: &str,
    ) -> Result<Option<String>, AdapterError> {
        let resp = http
            .get_json(
                ctx.run_id,
                self.name(),
                SPARQL_URL,
                FetchOptions {
                    query: &[("query", sparql)],
                    accept: Some(SPARQL_RESULTS_JSON),
                    ..Default::default()
                },
            )
            .await?;
        Ok(entity_id_from_bindings(&resp))
    }
}

fn taxon_id_query(ncbi_taxon_id: &str) -> String {
    format!("SELECT ?item WHERE {{ ?item wdt:{NCBI_TAXON_ID_PROPERTY} \"{ncbi_taxon_id}\". }}")
}

fn label_query(species: &str) -> String {
    format!("SELECT ?item WHERE {{ ?item rdfs:label \"{species}\"@en. }}")
}

/// Entity id (`Q...`) from the first SPARQL binding's item URI.
fn entity_id_from_bindings(resp: &Value) -> Option<String> {
    let uri = resp
        .get("results")?
        .get("bindings")?
        .as_array()?
        .first()?
        .get("item")?
        .get("value")?
        .as_str()?;
    uri.rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
}

fn entity_document(resp: &Value, entity_id: &str) -> Option<Value> {
    resp.get("entities")?
        .get(entity_id)
        .filter(|entity| entity.is_object())
        .cloned()
}
