//! Data access provider boundary.
//!
//! The engine compiles dependency descriptors but never executes them. A
//! `DataAccessProvider` receives one stage's descriptor graph and returns a
//! result per qualified name.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use crate::compiler::DependencyGraph;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("dependency '{name}' failed: {reason}")]
    Dependency { name: String, reason: String },

    #[error("unsupported access schema for '{0}'")]
    UnsupportedSchema(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Results keyed by qualified dependency name, plus provider metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub results: Map<String, Value>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

/// Executes compiled dependency graphs.
///
/// Uses RPITIT, like every async trait in this workspace. How the provider
/// parallelizes within a graph is its own concern.
pub trait DataAccessProvider: Send + Sync {
    fn resolve(
        &self,
        stage: &str,
        graph: &DependencyGraph,
    ) -> impl Future<Output = Result<ProviderResponse, ProviderError>> + Send;
}

/// Observes raw provider results for each stage, before formatting.
pub trait RecordCollector: Send + Sync {
    fn collect(&self, stage: &str, graph: &DependencyGraph, results: &Map<String, Value>);
}

/// Answers every descriptor with its own parameters. Used for dry runs of a
/// configuration outside any real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoProvider;

impl DataAccessProvider for EchoProvider {
    async fn resolve(
        &self,
        stage: &str,
        graph: &DependencyGraph,
    ) -> Result<ProviderResponse, ProviderError> {
        tracing::debug!(stage, dependencies = graph.len(), "echo provider resolving");
        let results = graph
            .iter()
            .map(|(name, descriptor)| (name.clone(), Value::Object(descriptor.params.clone())))
            .collect();
        let mut metrics = Map::new();
        metrics.insert("requests".to_string(), Value::from(graph.len()));
        Ok(ProviderResponse { results, metrics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stagehand_types::dependency::{AccessSchema, DependencyDescriptor};

    #[tokio::test]
    async fn test_echo_provider_returns_params() {
        let mut params = Map::new();
        params.insert("Bucket".into(), json!("b"));
        let mut graph = DependencyGraph::new();
        graph.insert(
            "list".into(),
            DependencyDescriptor::new(AccessSchema::ByName("s3.listObjects".into()), params),
        );
        let response = EchoProvider.resolve("s", &graph).await.unwrap();
        assert_eq!(response.results["list"], json!({ "Bucket": "b" }));
        assert_eq!(response.metrics["requests"], json!(1));
    }
}
