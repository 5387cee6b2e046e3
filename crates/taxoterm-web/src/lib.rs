//! Axum JSON API for taxoterm.
//!
//! Thin handlers over the store and pipeline. Batch endpoints answer with one
//! entry per input identifier; error kinds become HTTP status codes here and
//! nowhere else.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;

use taxoterm_core::{
    filter_term_matches, CoverageResult, MergeResult, Portal, RequestError, Taxon, TermSearchHit,
    PORTAL_NOT_EXIST, TAXON_NOT_EXIST,
};
use taxoterm_pipeline::{Pipeline, PipelineError};
use taxoterm_storage::StoreError;

pub const CRATE_NAME: &str = "taxoterm-web";

const MSG_OK: &str = "Successfully get data";
const MSG_OK_UPSERT: &str = "Successfully create or update data";
const MSG_OK_DELETE: &str = "Successfully delete data";

const STATUS_SUCCESS: &str = "success";
const STATUS_FAILED: &str = "failed";
const STATUS_DELETED: &str = "deleted";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/taxa",
            post(create_taxa_handler).delete(delete_taxa_handler),
        )
        .route("/taxa/get", post(get_taxa_handler))
        .route(
            "/portals",
            post(create_portals_handler).delete(delete_portals_handler),
        )
        .route("/portals/get", post(get_portals_handler))
        .route("/raws/store", post(store_raws_handler))
        .route("/raws/get", post(get_raws_handler))
        .route("/raws", axum::routing::delete(delete_raws_handler))
        .route("/terms/create", post(create_terms_handler))
        .route("/terms/get", post(get_terms_handler))
        .route("/terms/search", post(search_terms_handler))
        .route("/terms", axum::routing::delete(delete_terms_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("TAXOTERM_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "serving taxoterm api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    message: String,
    data: T,
}

fn ok<T: Serialize>(message: &str, data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        message: message.to_string(),
        data,
    })
}

#[derive(Debug)]
enum ApiError {
    Request(RequestError),
    Internal(String),
}

impl From<RequestError> for ApiError {
    fn from(err: RequestError) -> Self {
        Self::Request(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Request(err) => Self::Request(err),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Request(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            Self::Internal(message) => {
                tracing::error!(%message, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct TaxonEntry {
    taxon_id: i64,
    ncbi_taxon_id: Option<String>,
    species: String,
    status: &'static str,
    info: String,
}

impl TaxonEntry {
    fn found(taxon: &Taxon, status: &'static str, info: &str) -> Self {
        Self {
            taxon_id: taxon.taxon_id,
            ncbi_taxon_id: Some(taxon.ncbi_taxon_id.clone()),
            species: taxon.species.clone(),
            status,
            info: info.to_string(),
        }
    }

    fn missing(taxon_id: i64, info: &str) -> Self {
        Self {
            taxon_id,
            ncbi_taxon_id: None,
            species: taxoterm_core::SPECIES_UNKNOWN.to_string(),
            status: STATUS_FAILED,
            info: info.to_string(),
        }
    }
}

async fn create_taxa_handler(
    State(state): State<Arc<AppState>>,
    Json(taxa): Json<Vec<Taxon>>,
) -> Result<impl IntoResponse, ApiError> {
    if taxa.is_empty() {
        return Err(RequestError::EmptyPayload.into());
    }
    state.pipeline.store().upsert_taxa(&taxa).await?;
    let entries: Vec<TaxonEntry> = taxa
        .iter()
        .map(|t| TaxonEntry::found(t, STATUS_SUCCESS, "Data created successfully"))
        .collect();
    Ok(ok(MSG_OK_UPSERT, entries))
}

#[derive(Debug, Deserialize)]
struct TaxonGetRequest {
    #[serde(default)]
    taxon_id: Option<Vec<i64>>,
}

async fn get_taxa_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaxonGetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.pipeline.store();
    let ids = req.taxon_id.filter(|ids| !ids.is_empty());
    let taxa = store.find_taxa(ids.as_deref()).await?;

    let mut entries: Vec<TaxonEntry> = taxa
        .iter()
        .map(|t| TaxonEntry::found(t, STATUS_SUCCESS, "Data retrieved successfully"))
        .collect();
    if let Some(ids) = ids {
        for id in ids {
            if !taxa.iter().any(|t| t.taxon_id == id) {
                entries.push(TaxonEntry::missing(id, TAXON_NOT_EXIST));
            }
        }
    }
    Ok(ok(MSG_OK, entries))
}

#[derive(Debug, Deserialize)]
struct TaxonDeleteRequest {
    #[serde(default)]
    taxon_id: Vec<i64>,
}

async fn delete_taxa_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaxonDeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.taxon_id.is_empty() {
        return Err(RequestError::MissingIdentifier.into());
    }
    let report = state.pipeline.store().delete_taxa(&req.taxon_id).await?;

    let mut entries: Vec<TaxonEntry> = Vec::new();
    entries.extend(
        report
            .deleted
            .iter()
            .map(|t| TaxonEntry::found(t, STATUS_SUCCESS, "Data deleted successfully")),
    );
    entries.extend(report.used.iter().map(|t| {
        TaxonEntry::found(t, STATUS_FAILED, "Taxon is used in other collections")
    }));
    entries.extend(
        report
            .missing
            .iter()
            .map(|id| TaxonEntry::missing(*id, TAXON_NOT_EXIST)),
    );
    Ok(ok(MSG_OK_DELETE, entries))
}

#[derive(Debug, Serialize)]
struct PortalEntry {
    portal_id: i64,
    taxon_id: Option<i64>,
    webs: Vec<String>,
    status: &'static str,
    info: String,
}

impl PortalEntry {
    fn found(portal: &Portal, status: &'static str, info: &str) -> Self {
        Self {
            portal_id: portal.portal_id,
            taxon_id: Some(portal.taxon_id),
            webs: portal.webs.clone(),
            status,
            info: info.to_string(),
        }
    }

    fn missing(portal_id: i64, info: &str) -> Self {
        Self {
            portal_id,
            taxon_id: None,
            webs: Vec::new(),
            status: STATUS_FAILED,
            info: info.to_string(),
        }
    }
}

async fn create_portals_handler(
    State(state): State<Arc<AppState>>,
    Json(portals): Json<Vec<Portal>>,
) -> Result<impl IntoResponse, ApiError> {
    if portals.is_empty() {
        return Err(RequestError::EmptyPayload.into());
    }
    state.pipeline.store().upsert_portals(&portals).await?;
    let entries: Vec<PortalEntry> = portals
        .iter()
        .map(|p| PortalEntry::found(p, STATUS_SUCCESS, "Data created successfully"))
        .collect();
    Ok(ok(MSG_OK_UPSERT, entries))
}

#[derive(Debug, Deserialize)]
struct PortalGetRequest {
    #[serde(default)]
    portal_id: Option<Vec<i64>>,
}

async fn get_portals_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PortalGetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ids = req.portal_id.filter(|ids| !ids.is_empty());
    let portals = state.pipeline.store().find_portals(ids.as_deref()).await?;

    let mut entries: Vec<PortalEntry> = portals
        .iter()
        .map(|p| PortalEntry::found(p, STATUS_SUCCESS, "Data retrieved successfully"))
        .collect();
    if let Some(ids) = ids {
        for id in ids {
            if !portals.iter().any(|p| p.portal_id == id) {
                entries.push(PortalEntry::missing(id, PORTAL_NOT_EXIST));
            }
        }
    }
    Ok(ok(MSG_OK, entries))
}

#[derive(Debug, Deserialize)]
struct PortalDeleteRequest {
    #[serde(default)]
    portal_id: Vec<i64>,
}

async fn delete_portals_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PortalDeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.portal_id.is_empty() {
        return Err(RequestError::MissingIdentifier.into());
    }
    let report = state.pipeline.store().delete_portals(&req.portal_id).await?;

    let mut entries: Vec<PortalEntry> = Vec::new();
    entries.extend(
        report
            .deleted
            .iter()
            .map(|p| PortalEntry::found(p, STATUS_SUCCESS, "Data deleted successfully")),
    );
    entries.extend(report.used.iter().map(|p| {
        PortalEntry::found(p, STATUS_FAILED, "Portal is used in other collections")
    }));
    entries.extend(
        report
            .missing
            .iter()
            .map(|id| PortalEntry::missing(*id, PORTAL_NOT_EXIST)),
    );
    Ok(ok(MSG_OK_DELETE, entries))
}

#[derive(Debug, Deserialize)]
struct RawStoreRequest {
    taxon_id: Vec<i64>,
    #[serde(default)]
    web: Option<Vec<String>>,
}

async fn store_raws_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RawStoreRequest>,
) -> Result<Json<ApiResponse<Vec<CoverageResult>>>, ApiError> {
    let results = state
        .pipeline
        .store_raw_from_portals(&req.taxon_id, req.web.as_deref())
        .await?;
    Ok(ok(MSG_OK_UPSERT, results))
}

#[derive(Debug, Deserialize)]
struct RawGetRequest {
    #[serde(default)]
    taxon_id: Option<Vec<i64>>,
    #[serde(default)]
    web: Option<Vec<String>>,
}

async fn get_raws_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RawGetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let taxon_ids = req.taxon_id.filter(|ids| !ids.is_empty());
    let webs = req.web.filter(|webs| !webs.is_empty());
    let raws = state
        .pipeline
        .store()
        .find_raw_records(taxon_ids.as_deref(), webs.as_deref())
        .await?;
    Ok(ok(MSG_OK, raws))
}

#[derive(Debug, Deserialize)]
struct RawDeleteRequest {
    #[serde(default)]
    taxon_id: Vec<i64>,
    #[serde(default)]
    web: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RawDeleteEntry {
    portal_id: i64,
    taxon_id: i64,
    web: String,
    species: String,
    status: &'static str,
    info: String,
}

async fn delete_raws_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RawDeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Both filters are required so a sparse payload cannot wipe the
    // collection.
    if req.taxon_id.is_empty() || req.web.is_empty() {
        return Err(RequestError::MissingIdentifier.into());
    }
    let deleted = state
        .pipeline
        .store()
        .delete_raw_records(&req.taxon_id, &req.web)
        .await?;
    let entries: Vec<RawDeleteEntry> = deleted
        .iter()
        .map(|raw| RawDeleteEntry {
            portal_id: raw.portal_id,
            taxon_id: raw.taxon_id,
            web: raw.web.clone(),
            species: raw.species.clone(),
            status: STATUS_DELETED,
            info: "Data deleted successfully".to_string(),
        })
        .collect();
    Ok(ok(MSG_OK_DELETE, entries))
}

#[derive(Debug, Deserialize)]
struct TermStoreRequest {
    #[serde(default)]
    taxon_id: Option<Vec<i64>>,
}

async fn create_terms_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TermStoreRequest>,
) -> Result<Json<ApiResponse<Vec<MergeResult>>>, ApiError> {
    let ids = req.taxon_id.unwrap_or_default();
    let results = state.pipeline.store_raw_to_terms(&ids).await?;
    Ok(ok(MSG_OK_UPSERT, results))
}

#[derive(Debug, Deserialize)]
struct TermGetRequest {
    #[serde(default)]
    taxon_id: Option<Vec<i64>>,
}

#[derive(Debug, Serialize)]
struct TermEntry {
    taxon_id: i64,
    species: String,
    data: Value,
    status: &'static str,
    info: String,
}

async fn get_terms_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TermGetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ids = req.taxon_id.filter(|ids| !ids.is_empty());
    let terms = state.pipeline.store().find_terms(ids.as_deref()).await?;

    let mut entries: Vec<TermEntry> = terms
        .iter()
        .map(|term| TermEntry {
            taxon_id: term.taxon_id,
            species: term.species.clone(),
            data: Value::Object(term.data.clone()),
            status: STATUS_SUCCESS,
            info: "Data retrieved successfully".to_string(),
        })
        .collect();
    if let Some(ids) = ids {
        for id in ids {
            if !terms.iter().any(|t| t.taxon_id == id) {
                entries.push(TermEntry {
                    taxon_id: id,
                    species: String::new(),
                    data: Value::Object(Default::default()),
                    status: STATUS_FAILED,
                    info: "No data found for this taxon_id".to_string(),
                });
            }
        }
    }
    Ok(ok(MSG_OK, entries))
}

#[derive(Debug, Deserialize)]
struct TermSearchRequest {
    search: String,
}

async fn search_terms_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TermSearchRequest>,
) -> Result<Json<ApiResponse<Vec<TermSearchHit>>>, ApiError> {
    if req.search.trim().is_empty() {
        return Err(RequestError::EmptyPayload.into());
    }
    let terms = state.pipeline.store().search_terms(&req.search).await?;
    let hits = filter_term_matches(&terms, &req.search);
    Ok(ok(MSG_OK, hits))
}

#[derive(Debug, Deserialize)]
struct TermDeleteRequest {
    #[serde(default)]
    taxon_id: Vec<i64>,
}

async fn delete_terms_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TermDeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.taxon_id.is_empty() {
        return Err(RequestError::MissingIdentifier.into());
    }
    let deleted = state.pipeline.store().delete_terms(&req.taxon_id).await?;

    let mut entries: Vec<TermEntry> = deleted
        .iter()
        .map(|term| TermEntry {
            taxon_id: term.taxon_id,
            species: term.species.clone(),
            data: Value::Object(Default::default()),
            status: STATUS_SUCCESS,
            info: "Data deleted successfully".to_string(),
        })
        .collect();
    for id in &req.taxon_id {
        if !deleted.iter().any(|t| t.taxon_id == *id) {
            entries.push(TermEntry {
                taxon_id: *id,
                species: String::new(),
                data: Value::Object(Default::default()),
                status: STATUS_FAILED,
                info: "No data found for this taxon_id".to_string(),
            });
        }
    }
    Ok(ok(MSG_OK_DELETE, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use serde_json::json;
    use taxoterm_adapters::Adapters;
    use taxoterm_core::TermDocument;
    use taxoterm_storage::{HttpClientConfig, HttpFetcher, MemoryStore, Store};
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(
            Arc::clone(&store) as Arc<dyn Store>,
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
            Adapters::from_adapters(Vec::new()),
        );
        (app(AppState::new(Arc::new(pipeline))), store)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn taxa_roundtrip_create_get_delete() {
        let (app, _store) = test_app();

        let created = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/taxa",
                json!([{"taxon_id": 1, "ncbi_taxon_id": "562", "species": "Escherichia coli"}]),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::OK);

        let got = app
            .clone()
            .oneshot(json_request("POST", "/taxa/get", json!({"taxon_id": [1, 2]})))
            .await
            .unwrap();
        assert_eq!(got.status(), StatusCode::OK);
        let body = body_json(got).await;
        let entries = body["data"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["status"], "success");
        assert_eq!(entries[1]["status"], "failed");
        assert_eq!(entries[1]["info"], "Taxon does not exist");

        let deleted = app
            .oneshot(json_request("DELETE", "/taxa", json!({"taxon_id": [1]})))
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::OK);
        let body = body_json(deleted).await;
        assert_eq!(body["data"][0]["status"], "success");
    }

    #[tokio::test]
    async fn empty_taxa_payload_is_a_bad_request() {
        let (app, _store) = test_app();
        let resp = app
            .oneshot(json_request("POST", "/taxa", json!([])))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn referenced_taxon_delete_reports_used() {
        let (app, store) = test_app();
        store
            .upsert_taxa(&[Taxon {
                taxon_id: 1,
                ncbi_taxon_id: "562".into(),
                species: "Escherichia coli".into(),
            }])
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

        let resp = app
            .oneshot(json_request("DELETE", "/taxa", json!({"taxon_id": [1]})))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["data"][0]["status"], "failed");
        assert_eq!(body["data"][0]["info"], "Taxon is used in other collections");
        assert_eq!(store.find_taxa(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn raw_store_with_unsupported_source_is_rejected() {
        let (app, _store) = test_app();
        let resp = app
            .oneshot(json_request(
                "POST",
                "/raws/store",
                json!({"taxon_id": [1], "web": ["not_a_real_source"]}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("unsupported web source"));
    }

    #[tokio::test]
    async fn raw_delete_requires_both_filters() {
        let (app, _store) = test_app();
        let resp = app
            .oneshot(json_request("DELETE", "/raws", json!({"taxon_id": [1]})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn term_search_returns_only_matching_subfields() {
        let (app, store) = test_app();
        store
            .upsert_terms(&[TermDocument {
                taxon_id: 1,
                species: "Escherichia coli".into(),
                data: json!({
                    "Morphology": {"cell shape": "rod-shaped", "gram stain": "negative"},
                    "Safety information": {"risk group": "1"},
                })
                .as_object()
                .cloned()
                .unwrap(),
                merged_at: Utc::now(),
            }])
            .await
            .unwrap();

        let resp = app
            .oneshot(json_request("POST", "/terms/search", json!({"search": "rod"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let hits = body["data"].as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["species"], "Escherichia coli");
        assert_eq!(
            hits[0]["data"],
            json!({"Morphology": {"cell shape": "rod-shaped"}})
        );
    }
}
