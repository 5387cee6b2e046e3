//! Document-store contract + HTTP fetch utilities for taxoterm.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

use taxoterm_core::{Portal, RawRecord, Taxon, TermDocument};

pub mod pg;

pub use pg::PgStore;

pub const CRATE_NAME: &str = "taxoterm-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Outcome of a guarded taxon delete: referenced taxa are left in place.
#[derive(Debug, Clone, Default)]
pub struct TaxonDeleteReport {
    pub deleted: Vec<Taxon>,
    pub used: Vec<Taxon>,
    pub missing: Vec<i64>,
}

/// Outcome of a guarded portal delete: portals with raw records are left in
/// place.
#[derive(Debug, Clone, Default)]
pub struct PortalDeleteReport {
    pub deleted: Vec<Portal>,
    pub used: Vec<Portal>,
    pub missing: Vec<i64>,
}

/// Document-store contract consumed by the aggregation and merge pipeline.
///
/// Every upsert method is one atomic batch: either all documents in the call
/// are written or none are. Guarded deletes run their read-check-delete cycle
/// inside a single transaction.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_taxa(&self, taxa: &[Taxon]) -> Result<(), StoreError>;
    /// `None` returns the whole collection.
    async fn find_taxa(&self, taxon_ids: Option<&[i64]>) -> Result<Vec<Taxon>, StoreError>;
    async fn delete_taxa(&self, taxon_ids: &[i64]) -> Result<TaxonDeleteReport, StoreError>;

    async fn upsert_portals(&self, portals: &[Portal]) -> Result<(), StoreError>;
    async fn find_portals(&self, portal_ids: Option<&[i64]>) -> Result<Vec<Portal>, StoreError>;
    /// A taxon has at most one portal.
    async fn find_portal_by_taxon(&self, taxon_id: i64) -> Result<Option<Portal>, StoreError>;
    async fn delete_portals(&self, portal_ids: &[i64]) -> Result<PortalDeleteReport, StoreError>;
    /// Distinct taxon ids that currently have a portal.
    async fn portal_taxon_ids(&self) -> Result<Vec<i64>, StoreError>;

    async fn upsert_raw_records(&self, records: &[RawRecord]) -> Result<(), StoreError>;
    async fn find_raw_records(
        &self,
        taxon_ids: Option<&[i64]>,
        webs: Option<&[String]>,
    ) -> Result<Vec<RawRecord>, StoreError>;
    async fn find_raws_by_portal(&self, portal_id: i64) -> Result<Vec<RawRecord>, StoreError>;
    /// Deletes matching records and returns them for result shaping.
    async fn delete_raw_records(
        &self,
        taxon_ids: &[i64],
        webs: &[String],
    ) -> Result<Vec<RawRecord>, StoreError>;

    async fn upsert_terms(&self, terms: &[TermDocument]) -> Result<(), StoreError>;
    async fn find_terms(&self, taxon_ids: Option<&[i64]>) -> Result<Vec<TermDocument>, StoreError>;
    async fn delete_terms(&self, taxon_ids: &[i64]) -> Result<Vec<TermDocument>, StoreError>;
    /// Case-insensitive substring match over species and merged section data.
    async fn search_terms(&self, needle: &str) -> Result<Vec<TermDocument>, StoreError>;
}

/// In-memory [`Store`] used by tests and local development. Mirrors the
/// Postgres backend's keys: `(portal_id, web)` for raw records, `taxon_id`
/// for term documents.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    taxa: BTreeMap<i64, Taxon>,
    portals: BTreeMap<i64, Portal>,
    raws: BTreeMap<(i64, String), RawRecord>,
    terms: BTreeMap<i64, TermDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_taxa(&self, taxa: &[Taxon]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for taxon in taxa {
            inner.taxa.insert(taxon.taxon_id, taxon.clone());
        }
        Ok(())
    }

    async fn find_taxa(&self, taxon_ids: Option<&[i64]>) -> Result<Vec<Taxon>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(match taxon_ids {
            Some(ids) => ids.iter().filter_map(|id| inner.taxa.get(id).cloned()).collect(),
            None => inner.taxa.values().cloned().collect(),
        })
    }

    async fn delete_taxa(&self, taxon_ids: &[i64]) -> Result<TaxonDeleteReport, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut report = TaxonDeleteReport::default();
        for id in taxon_ids {
            let Some(taxon) = inner.taxa.get(id).cloned() else {
                report.missing.push(*id);
                continue;
            };
            if inner.portals.values().any(|p| p.taxon_id == *id) {
                report.used.push(taxon);
            } else {
                inner.taxa.remove(id);
                report.deleted.push(taxon);
            }
        }
        Ok(report)
    }

    async fn upsert_portals(&self, portals: &[Portal]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for portal in portals {
            inner.portals.insert(portal.portal_id, portal.clone());
        }
        Ok(())
    }

    async fn find_portals(&self, portal_ids: Option<&[i64]>) -> Result<Vec<Portal>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(match portal_ids {
            Some(ids) => ids.iter().filter_map(|id| inner.portals.get(id).cloned()).collect(),
            None => inner.portals.values().cloned().collect(),
        })
    }

    async fn find_portal_by_taxon(&self, taxon_id: i64) -> Result<Option<Portal>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.portals.values().find(|p| p.taxon_id == taxon_id).cloned())
    }

    async fn delete_portals(&self, portal_ids: &[i64]) -> Result<PortalDeleteReport, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut report = PortalDeleteReport::default();
        for id in portal_ids {
            let Some(portal) = inner.portals.get(id).cloned() else {
                report.missing.push(*id);
                continue;
            };
            if inner.raws.keys().any(|(portal_id, _)| portal_id == id) {
                report.used.push(portal);
            } else {
                inner.portals.remove(id);
                report.deleted.push(portal);
            }
        }
        Ok(report)
    }

    async fn portal_taxon_ids(&self) -> Result<Vec<i64>, StoreError> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<i64> = inner.portals.values().map(|p| p.taxon_id).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn upsert_raw_records(&self, records: &[RawRecord]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for record in records {
            inner
                .raws
                .insert((record.portal_id, record.web.clone()), record.clone());
        }
        Ok(())
    }

    async fn find_raw_records(
        &self,
        taxon_ids: Option<&[i64]>,
        webs: Option<&[String]>,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .raws
            .values()
            .filter(|raw| taxon_ids.is_none_or(|ids| ids.contains(&raw.taxon_id)))
            .filter(|raw| webs.is_none_or(|webs| webs.contains(&raw.web)))
            .cloned()
            .collect())
    }

    async fn find_raws_by_portal(&self, portal_id: i64) -> Result<Vec<RawRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .raws
            .values()
            .filter(|raw| raw.portal_id == portal_id)
            .cloned()
            .collect())
    }

    async fn delete_raw_records(
        &self,
        taxon_ids: &[i64],
        webs: &[String],
    ) -> Result<Vec<RawRecord>, StoreError> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<(i64, String)> = inner
            .raws
            .values()
            .filter(|raw| taxon_ids.contains(&raw.taxon_id) && webs.contains(&raw.web))
            .map(|raw| (raw.portal_id, raw.web.clone()))
            .collect();
        let mut deleted = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = inner.raws.remove(&key) {
                deleted.push(raw);
            }
        }
        Ok(deleted)
    }

    async fn upsert_terms(&self, terms: &[TermDocument]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for term in terms {
            inner.terms.insert(term.taxon_id, term.clone());
        }
        Ok(())
    }

    async fn find_terms(&self, taxon_ids: Option<&[i64]>) -> Result<Vec<TermDocument>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(match taxon_ids {
            Some(ids) => ids.iter().filter_map(|id| inner.terms.get(id).cloned()).collect(),
            None => inner.terms.values().cloned().collect(),
        })
    }

    async fn delete_terms(&self, taxon_ids: &[i64]) -> Result<Vec<TermDocument>, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut deleted = Vec::new();
        for id in taxon_ids {
            if let Some(term) = inner.terms.remove(id) {
                deleted.push(term);
            }
        }
        Ok(deleted)
    }

    async fn search_terms(&self, needle: &str) -> Result<Vec<TermDocument>, StoreError> {
        let needle = needle.to_lowercase();
        let inner = self.inner.lock().await;
        Ok(inner
            .terms
            .values()
            .filter(|term| {
                term.species.to_lowercase().contains(&needle)
                    || Value::Object(term.data.clone())
                        .to_string()
                        .to_lowercase()
                        .contains(&needle)
            })
            .cloned()
            .collect())
    }
}

/// Retry ceiling for one retrieval: up to 5 attempts with a 20 second pause
/// between them. Fixed, not configurable.
pub const RETRY_ATTEMPTS: usize = 5;
pub const RETRY_DELAY: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
        }
    }
}

/// Per-request options layered on a GET; adapters only set what they need.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions<'a> {
    pub query: &'a [(&'a str, &'a str)],
    pub accept: Option<&'a str>,
    pub basic_auth: Option<(&'a str, &'a str)>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid response body from {url}: {message}")]
    Decode { url: String, message: String },
}

/// Shared HTTP client with the fixed retry policy and concurrency limits.
/// Retry sleeps are per-request and never block other in-flight retrievals.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry_delay: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build()?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            retry_delay: RETRY_DELAY,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn get(
        &self,
        run_id: Uuid,
        source: &str,
        url: &str,
        options: FetchOptions<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..RETRY_ATTEMPTS {
            let mut request = self.client.get(url);
            if !options.query.is_empty() {
                request = request.query(options.query);
            }
            if let Some(accept) = options.accept {
                request = request.header(reqwest::header::ACCEPT, accept);
            }
            if let Some((user, password)) = options.basic_auth {
                request = request.basic_auth(user, Some(password));
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt + 1 < RETRY_ATTEMPTS
                    {
                        tokio::time::sleep(self.retry_delay).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt + 1 < RETRY_ATTEMPTS
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.retry_delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    pub async fn get_text(
        &self,
        run_id: Uuid,
        source: &str,
        url: &str,
        options: FetchOptions<'_>,
    ) -> Result<String, FetchError> {
        let resp = self.get(run_id, source, url, options).await?;
        String::from_utf8(resp.body).map_err(|err| FetchError::Decode {
            url: resp.final_url,
            message: err.to_string(),
        })
    }

    pub async fn get_json(
        &self,
        run_id: Uuid,
        source: &str,
        url: &str,
        options: FetchOptions<'_>,
    ) -> Result<Value, FetchError> {
        let resp = self.get(run_id, source, url, options).await?;
        serde_json::from_slice(&resp.body).map_err(|err| FetchError::Decode {
            url: resp.final_url,
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn raw(portal_id: i64, taxon_id: i64, web: &str, data: Value) -> RawRecord {
        RawRecord {
            portal_id,
            taxon_id,
            web: web.to_string(),
            species: "Escherichia coli".to_string(),
            data,
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn raw_upsert_is_idempotent_per_portal_and_web() {
        let store = MemoryStore::new();
        let record = raw(1, 1, "ncbi", json!({"Lineage": "cellular organisms"}));
        store.upsert_raw_records(std::slice::from_ref(&record)).await.unwrap();
        store.upsert_raw_records(std::slice::from_ref(&record)).await.unwrap();

        let stored = store.find_raws_by_portal(1).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], record);
    }

    #[tokio::test]
    async fn raw_upsert_replaces_prior_content() {
        let store = MemoryStore::new();
        store
            .upsert_raw_records(&[raw(1, 1, "gbif", json!({"country": "NO"}))])
            .await
            .unwrap();
        store
            .upsert_raw_records(&[raw(1, 1, "gbif", json!({"country": "SE"}))])
            .await
            .unwrap();

        let stored = store.find_raws_by_portal(1).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].data, json!({"country": "SE"}));
    }

    #[tokio::test]
    async fn taxon_delete_is_blocked_while_a_portal_references_it() {
        let store = MemoryStore::new();
        store
            .upsert_taxa(&[
                Taxon {
                    taxon_id: 1,
                    ncbi_taxon_id: "562".into(),
                    species: "Escherichia coli".into(),
                },
                Taxon {
                    taxon_id: 2,
                    ncbi_taxon_id: "1423".into(),
                    species: "Bacillus subtilis".into(),
                },
            ])
            .await
            .unwrap();
        store
            .upsert_portals(&[Portal {
                portal_id: 10,
                taxon_id: 1,
                webs: vec!["ncbi".into()],
            }])
            .await
            .unwrap();

        let report = store.delete_taxa(&[1, 2, 3]).await.unwrap();
        assert_eq!(report.used.len(), 1);
        assert_eq!(report.used[0].taxon_id, 1);
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.deleted[0].taxon_id, 2);
        assert_eq!(report.missing, vec![3]);

        let remaining = store.find_taxa(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].taxon_id, 1);
    }

    #[tokio::test]
    async fn portal_delete_is_blocked_while_raw_records_reference_it() {
        let store = MemoryStore::new();
        store
            .upsert_portals(&[
                Portal {
                    portal_id: 10,
                    taxon_id: 1,
                    webs: vec!["ncbi".into()],
                },
                Portal {
                    portal_id: 11,
                    taxon_id: 2,
                    webs: vec!["gbif".into()],
                },
            ])
            .await
            .unwrap();
        store
            .upsert_raw_records(&[raw(10, 1, "ncbi", json!({}))])
            .await
            .unwrap();

        let report = store.delete_portals(&[10, 11]).await.unwrap();
        assert_eq!(report.used.len(), 1);
        assert_eq!(report.used[0].portal_id, 10);
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.deleted[0].portal_id, 11);
    }

    #[tokio::test]
    async fn term_search_matches_species_and_section_content() {
        let store = MemoryStore::new();
        store
            .upsert_terms(&[TermDocument {
                taxon_id: 1,
                species: "Escherichia coli".into(),
                data: json!({"Morphology": {"cell shape": "rod-shaped"}})
                    .as_object()
                    .cloned()
                    .unwrap(),
                merged_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
            }])
            .await
            .unwrap();

        assert_eq!(store.search_terms("ROD-SHAPED").await.unwrap().len(), 1);
        assert_eq!(store.search_terms("escherichia").await.unwrap().len(), 1);
        assert!(store.search_terms("flagella").await.unwrap().is_empty());
    }

    #[test]
    fn transient_statuses_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn retry_policy_is_fixed() {
        assert_eq!(RETRY_ATTEMPTS, 5);
        assert_eq!(RETRY_DELAY, Duration::from_secs(20));
    }
}
