//! Source adapter contract + the static adapter registry.
//!
//! One adapter per external web source. Each adapter resolves a taxon to a
//! remote document (`retrieve`) and flattens it into a text-index-friendly
//! string tree (`normalize`). Registration is explicit: the registry is a
//! fixed list built in [`Adapters::builtin`], and an adapter's name is its
//! registered source name.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use taxoterm_core::Taxon;
use taxoterm_storage::{FetchError, HttpFetcher};

pub mod bacdive;
pub mod gbif;
pub mod ncbi;
pub mod wikidata;

pub use bacdive::BacdiveAdapter;
pub use gbif::GbifAdapter;
pub use ncbi::NcbiAdapter;
pub use wikidata::WikidataAdapter;

pub const CRATE_NAME: &str = "taxoterm-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// Per-run context threaded through retrievals for tracing.
#[derive(Debug, Clone, Copy)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetches the source document for one taxon. `Ok(None)` means the source
    /// has nothing for this taxon; transport errors surface as `Err` and are
    /// downgraded to a per-source miss by the aggregator.
    async fn retrieve(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        taxon: &Taxon,
    ) -> Result<Option<Value>, AdapterError>;

    /// Lossy normalization: every leaf becomes a string so stored documents
    /// stay substring-searchable.
    fn normalize(&self, payload: Value) -> Value {
        stringify_tree(payload)
    }
}

/// Recursively converts every scalar leaf to its string form, preserving
/// object and array structure.
pub fn stringify_tree(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, stringify_tree(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(stringify_tree).collect()),
        Value::String(s) => Value::String(s),
        other => Value::String(other.to_string()),
    }
}

/// Credentials and knobs the builtin adapters need at construction time.
#[derive(Debug, Clone, Default)]
pub struct AdapterConfig {
    pub bacdive_email: Option<String>,
    pub bacdive_password: Option<String>,
}

/// The registered source set. Unsupported-source validation and the default
/// web list are both derived from the names held here.
pub struct Adapters {
    adapters: Vec<Box<dyn SourceAdapter>>,
}

impl Adapters {
    pub fn builtin(config: &AdapterConfig) -> Self {
        Self {
            adapters: vec![
                Box::new(NcbiAdapter),
                Box::new(GbifAdapter),
                Box::new(BacdiveAdapter::new(
                    config.bacdive_email.clone(),
                    config.bacdive_password.clone(),
                )),
                Box::new(WikidataAdapter),
            ],
        }
    }

    pub fn from_adapters(adapters: Vec<Box<dyn SourceAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn SourceAdapter> {
        self.adapters
            .iter()
            .find(|a| a.name() == name)
            .map(|adapter| adapter.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.iter().any(|a| a.name() == name)
    }
}
