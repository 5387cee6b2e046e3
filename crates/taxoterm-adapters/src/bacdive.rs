//! BacDive adapter.
//!
//! The BacDive strain id is discovered by scraping the advanced-search page
//! for the first `/strain/` link (the search form has no JSON endpoint),
//! falling back to the taxon-name API. The strain document itself comes from
//! the authenticated fetch API.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::Value;

use taxoterm_core::Taxon;
use taxoterm_storage::{FetchOptions, HttpFetcher};

use crate::{AdapterContext, AdapterError, SourceAdapter};

const ADVSEARCH_URL: &str = "https://bacdive.dsmz.de/advsearch";
const API_BASE: &str = "https://api.bacdive.dsmz.de";

#[derive(Debug, Clone)]
pub struct BacdiveAdapter {
    email: Option<String>,
    password: Option<String>,
}

impl BacdiveAdapter {
    pub fn new(email: Option<String>, password: Option<String>) -> Self {
        Self { email, password }
    }

    fn credentials(&self) -> Result<(&str, &str), AdapterError> {
        match (self.email.as_deref(), self.password.as_deref()) {
            (Some(email), Some(password)) => Ok((email, password)),
            _ => Err(AdapterError::Message(
                "bacdive credentials are not configured".to_string(),
            )),
        }
    }

    async fn search_strain_id(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        ncbi_taxon_id: &str,
    ) -> Result<Option<String>, AdapterError> {
        let html = http
            .get_text(
                ctx.run_id,
                self.name(),
                ADVSEARCH_URL,
                FetchOptions {
                    query: &[
                        ("fg[0][gc]", "OR"),
                        ("fg[0][fl][1][fd]", "16S associated NCBI tax ID"),
                        ("fg[0][fl][1][fo]", "equal"),
                        ("fg[0][fl][1][fv]", ncbi_taxon_id),
                        ("fg[0][fl][1][fvd]", "sequence_16S-tax_id-7"),
                    ],
                    ..Default::default()
                },
            )
            .await?;
        Ok(first_strain_id(&html))
    }

    async fn taxon_strain_id(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        species: &str,
    ) -> Result<Option<String>, AdapterError> {
        let (email, password) = self.credentials()?;
        let path: String = species.split_whitespace().collect::<Vec<_>>().join("/");
        let url = format!("{API_BASE}/taxon/{path}");
        let resp = http
            .get_json(
                ctx.run_id,
                self.name(),
                &url,
                FetchOptions {
                    basic_auth: Some((email, password)),
                    ..Default::default()
                },
            )
            .await?;
        Ok(first_taxon_result_id(&resp))
    }
}

#[async_trait]
impl SourceAdapter for BacdiveAdapter {
    fn name(&self) -> &'static str {
        "bacdive"
    }

    async fn retrieve(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        taxon: &Taxon,
    ) -> Result<Option<Value>, AdapterError> {
        let strain_id = match self
            .search_strain_id(http, ctx, &taxon.ncbi_taxon_id)
            .await?
        {
            Some(id) => Some(id),
            None => self.taxon_strain_id(http, ctx, &taxon.species).await?,
        };
        let Some(strain_id) = strain_id else {
            return Ok(None);
        };

        let (email, password) = self.credentials()?;
        let url = format!("{API_BASE}/fetch/{strain_id}");
        let resp = http
            .get_json(
                ctx.run_id,
                self.name(),
                &url,
                FetchOptions {
                    basic_auth: Some((email, password)),
                    ..Default::default()
                },
            )
            .await?;
        Ok(first_result_document(&resp))
    }
}

/// First `/strain/<id>` link in the advanced-search result page.
fn first_strain_id(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("static selector");
    document
        .select(&selector)
        .filter_map(|node| node.value().attr("href"))
        .find(|href| href.starts_with("/strain/"))
        .and_then(|href| href.rsplit('/').next())
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
}

/// The fetch API wraps strain documents in `results`, keyed by strain id.
fn first_result_document(resp: &Value) -> Option<Value> {
    match resp.get("results")? {
        Value::Object(map) => map.values().next().filter(|v| v.is_object()).cloned(),
        Value::Array(items) => items.first().filter(|v| v.is_object()).cloned(),
        _ => None,
    }
}

/// The taxon-name API lists matches as `{"id": <strain id>, ...}` entries.
fn first_taxon_result_id(resp: &Value) -> Option<String> {
    let first = match resp.get("results")? {
        Value::Array(items) => items.first()?,
        Value::Object(map) => map.values().next()?,
        _ => return None,
    };
    match first.get("id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_strain_link_wins() {
        let html = r#"
            <html><body>
              <a href="/advsearch">refine</a>
              <a href="/strain/159837">Escherichia coli DSM 30083</a>
              <a href="/strain/12345">another strain</a>
            </body></html>
        "#;
        assert_eq!(first_strain_id(html), Some("159837".to_string()));
    }

    #[test]
    fn pages_without_strain_links_yield_nothing() {
        assert_eq!(first_strain_id("<html><a href='/about'>x</a></html>"), None);
        assert_eq!(first_strain_id(""), None);
    }

    #[test]
    fn fetch_response_unwraps_the_keyed_results_object() {
        let resp = json!({
            "count": 1,
            "results": {"159837": {"Morphology": {"cell shape": "rod-shaped"}}}
        });
        let doc = first_result_document(&resp).unwrap();
        assert_eq!(doc["Morphology"]["cell shape"], "rod-shaped");
        assert_eq!(first_result_document(&json!({"results": {}})), None);
    }

    #[test]
    fn taxon_response_yields_the_first_strain_id() {
        let resp = json!({"results": [{"id": 159837}, {"id": 2}]});
        assert_eq!(first_taxon_result_id(&resp), Some("159837".to_string()));
        assert_eq!(first_taxon_result_id(&json!({"results": []})), None);
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_any_api_call() {
        let adapter = BacdiveAdapter::new(None, None);
        assert!(adapter.credentials().is_err());
    }
}
