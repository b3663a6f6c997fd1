//! `memory` capability: process-local key/value, vector and graph stores.
//!
//! Nothing here survives a restart.

mod graph;
mod kv;
mod vector;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{
    Action, Capability, CapabilityRequest, CapabilityResponse, ErrorCode, Field, FieldType, Schema,
};

pub use graph::GraphStore;
pub use kv::KvStore;
pub use vector::{Match, VectorStore};

/// Results returned by `vector_search` when no limit is given.
pub const DEFAULT_SEARCH_LIMIT: usize = 5;

/// Default cap on one `kv_set` value (1 MB).
pub const DEFAULT_MAX_VALUE_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MemoryError {
    #[error("key is empty")]
    EmptyKey,

    #[error("value is {size} bytes, limit is {limit}")]
    ValueTooLarge { size: usize, limit: usize },

    #[error("vector is empty")]
    EmptyVector,

    #[error("vector has {got} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

#[derive(Deserialize)]
struct KvSetParams {
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct KeyParams {
    key: String,
}

#[derive(Deserialize)]
struct VectorPutParams {
    key: String,
    vector: Vec<f32>,
}

#[derive(Deserialize)]
struct VectorSearchParams {
    vector: Vec<f32>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct GraphUpsertParams {
    id: String,
    payload: Map<String, Value>,
}

#[derive(Deserialize)]
struct GraphGetParams {
    id: String,
}

pub struct MemoryCapability {
    kv: KvStore,
    vectors: VectorStore,
    graph: GraphStore,
}

impl MemoryCapability {
    pub fn new(dimensions: Option<usize>, max_value_bytes: usize) -> Self {
        Self {
            kv: KvStore::new(max_value_bytes),
            vectors: VectorStore::new(dimensions),
            graph: GraphStore::new(),
        }
    }

    fn dispatch(&self, request: &CapabilityRequest) -> CapabilityResponse {
        match request.action.as_str() {
            "kv_set" => with_params(request, |p: KvSetParams| match self.kv.set(&p.key, p.value) {
                Ok(()) => CapabilityResponse::ok(json!({ "key": p.key })),
                Err(e) => CapabilityResponse::fail(ErrorCode::KvSetFailed, e.to_string()),
            }),
            "kv_get" => with_params(request, |p: KeyParams| {
                if p.key.is_empty() {
                    return CapabilityResponse::fail(ErrorCode::KvGetFailed, MemoryError::EmptyKey.to_string());
                }
                CapabilityResponse::ok(json!({ "key": p.key, "value": self.kv.get(&p.key) }))
            }),
            "vector_put" => with_params(request, |p: VectorPutParams| {
                let dimensions = p.vector.len();
                match self.vectors.put(&p.key, p.vector) {
                    Ok(()) => CapabilityResponse::ok(json!({ "key": p.key, "dimensions": dimensions })),
                    Err(e) => CapabilityResponse::fail(ErrorCode::VectorPutFailed, e.to_string()),
                }
            }),
            "vector_search" => with_params(request, |p: VectorSearchParams| {
                let limit = p.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_SEARCH_LIMIT);
                match self.vectors.search(&p.vector, limit) {
                    Ok(matches) => CapabilityResponse::ok(json!({ "matches": matches })),
                    Err(e) => CapabilityResponse::fail(ErrorCode::VectorSearchFailed, e.to_string()),
                }
            }),
            "graph_upsert" => with_params(request, |p: GraphUpsertParams| {
                match self.graph.upsert(&p.id, p.payload) {
                    Ok(created) => CapabilityResponse::ok(json!({ "id": p.id, "created": created })),
                    Err(e) => CapabilityResponse::fail(ErrorCode::InvalidParams, e.to_string()),
                }
            }),
            "graph_get" => with_params(request, |p: GraphGetParams| match self.graph.get(&p.id) {
                Some(payload) => CapabilityResponse::ok(json!({ "id": p.id, "payload": payload })),
                None => CapabilityResponse::fail(ErrorCode::NotFound, format!("node '{}' not found", p.id)),
            }),
            other => CapabilityResponse::fail(ErrorCode::InvalidAction, other),
        }
    }
}

fn with_params<T, F>(request: &CapabilityRequest, handler: F) -> CapabilityResponse
where
    T: serde::de::DeserializeOwned,
    F: FnOnce(T) -> CapabilityResponse,
{
    match request.params() {
        Ok(params) => handler(params),
        Err(e) => e.into(),
    }
}

#[async_trait]
impl Capability for MemoryCapability {
    fn name(&self) -> &str {
        "memory"
    }

    fn description(&self) -> &str {
        "In-memory key/value, vector and graph stores"
    }

    fn schema(&self) -> Schema {
        let key = || Field::required(FieldType::String, "Key");
        let vector = || Field::required(FieldType::Array, "Vector of numbers");
        Schema::new()
            .action(
                Action::new("kv_set", "Store a string value")
                    .field("key", key())
                    .field("value", Field::required(FieldType::String, "Value")),
            )
            .action(Action::new("kv_get", "Read a value (null when absent)").field("key", key()))
            .action(
                Action::new("vector_put", "Store a vector")
                    .field("key", key())
                    .field("vector", vector()),
            )
            .action(
                Action::new("vector_search", "Nearest vectors by cosine similarity")
                    .field("vector", vector())
                    .field(
                        "limit",
                        Field::optional(FieldType::Integer, "Maximum matches")
                            .with_default(json!(DEFAULT_SEARCH_LIMIT)),
                    ),
            )
            .action(
                Action::new("graph_upsert", "Insert or replace a node")
                    .field("id", Field::required(FieldType::String, "Node id"))
                    .field("payload", Field::required(FieldType::Object, "Node payload")),
            )
            .action(
                Action::new("graph_get", "Read a node")
                    .field("id", Field::required(FieldType::String, "Node id")),
            )
    }

    async fn execute(&self, request: &CapabilityRequest) -> anyhow::Result<CapabilityResponse> {
        Ok(self.dispatch(request))
    }
}
