//! Client for the managed approximate-nearest-neighbor index service.
//!
//! The service works in three resources:
//!
//! ```text
//! index (tree-AH, built from JSONL files in a bucket)
//!   └─ deployed into ─▶ index endpoint (public, serves findNeighbors)
//! ```
//!
//! Creating an index or endpoint and deploying an index are long-running
//! operations; [`VertexAnnService`] polls them every
//! `vector_store.operation_poll_secs` until done or until
//! `vector_store.operation_timeout_secs` elapses.
//!
//! # Environment Variables
//!
//! - the variable named by `vector_store.token_env` (default
//!   `GOOGLE_OAUTH_ACCESS_TOKEN`) holds an OAuth bearer token.

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::http::send_json_with_retry;

/// Parameters for a new tree-AH index.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnIndexSpec {
    pub display_name: String,
    pub description: String,
    /// `gs://` folder holding the JSONL datapoint files.
    pub contents_uri: String,
    pub dimensions: usize,
    pub approximate_neighbors: usize,
    pub distance_measure: String,
    pub leaf_node_embedding_count: usize,
    pub leaf_nodes_to_search_percent: usize,
}

/// Token allow/deny list on one namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenRestrict {
    pub namespace: String,
    #[serde(rename = "allowList", skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(rename = "denyList", skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

/// Numeric comparison on one namespace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericRestrict {
    pub namespace: String,
    #[serde(rename = "valueDouble")]
    pub value: f64,
    /// `LESS`, `LESS_EQUAL`, `EQUAL`, `GREATER_EQUAL`, `GREATER`, `NOT_EQUAL`.
    pub op: &'static str,
}

/// Restricts applied to one neighbor query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NeighborRestricts {
    pub tokens: Vec<TokenRestrict>,
    pub numeric: Vec<NumericRestrict>,
}

impl NeighborRestricts {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.numeric.is_empty()
    }
}

#[async_trait]
pub trait AnnIndexService: Send + Sync {
    /// Create an index; returns its resource name.
    async fn create_index(&self, index: &AnnIndexSpec) -> Result<String>;

    /// Create a public index endpoint; returns its resource name.
    async fn create_endpoint(&self, display_name: &str, description: &str) -> Result<String>;

    async fn deploy_index(&self, endpoint: &str, index: &str, deployed_index_id: &str) -> Result<()>;

    /// Datapoint ids of the `k` nearest neighbors, best first.
    async fn find_neighbors(
        &self,
        endpoint: &str,
        deployed_index_id: &str,
        query: &[f32],
        k: usize,
        restricts: &NeighborRestricts,
    ) -> Result<Vec<String>>;

    /// Undeploy everything from the endpoint, then delete it.
    async fn delete_endpoint(&self, endpoint: &str) -> Result<()>;

    async fn delete_index(&self, index: &str) -> Result<()>;
}

/// REST client for the regional AI Platform index service.
pub struct VertexAnnService {
    client: reqwest::Client,
    api_base: String,
    parent: String,
    token_env: String,
    machine_type: String,
    poll: Duration,
    timeout: Duration,
}

impl VertexAnnService {
    pub fn new(config: &Config) -> Result<Self> {
        let vs = &config.vector_store;
        let api_base = vs
            .api_base
            .clone()
            .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com/v1", vs.region));
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()?,
            api_base: api_base.trim_end_matches('/').to_string(),
            parent: format!("projects/{}/locations/{}", config.project.id, vs.region),
            token_env: vs.token_env.clone(),
            machine_type: vs.machine_type.clone(),
            poll: Duration::from_secs(vs.operation_poll_secs.max(1)),
            timeout: Duration::from_secs(vs.operation_timeout_secs),
        })
    }

    fn token(&self) -> Result<String> {
        std::env::var(&self.token_env)
            .with_context(|| format!("{} environment variable not set", self.token_env))
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/{}", self.api_base, resource)
    }

    async fn get(&self, url: &str) -> Result<Value> {
        let token = self.token()?;
        send_json_with_retry("AI Platform", 3, || self.client.get(url).bearer_auth(&token)).await
    }

    async fn post(&self, url: &str, body: &Value) -> Result<Value> {
        let token = self.token()?;
        send_json_with_retry("AI Platform", 3, || {
            self.client.post(url).bearer_auth(&token).json(body)
        })
        .await
    }

    async fn delete(&self, url: &str) -> Result<Value> {
        let token = self.token()?;
        send_json_with_retry("AI Platform", 3, || self.client.delete(url).bearer_auth(&token)).await
    }

    /// Poll a long-running operation until it finishes; returns its
    /// `response` payload.
    async fn wait(&self, operation: Value) -> Result<Value> {
        let name = operation["name"]
            .as_str()
            .ok_or_else(|| anyhow!("operation response has no name"))?
            .to_string();
        let deadline = Instant::now() + self.timeout;
        let mut op = operation;

        loop {
            if op["done"].as_bool() == Some(true) {
                if let Some(err) = op.get("error") {
                    bail!("operation {} failed: {}", name, err);
                }
                return Ok(op.get("response").cloned().unwrap_or(Value::Null));
            }
            if Instant::now() >= deadline {
                bail!("operation {} did not finish within {:?}", name, self.timeout);
            }
            tracing::debug!(operation = %name, "waiting for operation");
            tokio::time::sleep(self.poll).await;
            op = self.get(&self.url(&name)).await?;
        }
    }

    fn resource_name(response: &Value, what: &str) -> Result<String> {
        response["name"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("{} operation returned no resource name", what))
    }
}

#[async_trait]
impl AnnIndexService for VertexAnnService {
    async fn create_index(&self, index: &AnnIndexSpec) -> Result<String> {
        let body = json!({
            "displayName": index.display_name,
            "description": index.description,
            "metadata": {
                "contentsDeltaUri": index.contents_uri,
                "config": {
                    "dimensions": index.dimensions,
                    "approximateNeighborsCount": index.approximate_neighbors,
                    "distanceMeasureType": index.distance_measure,
                    "algorithmConfig": {
                        "treeAhConfig": {
                            "leafNodeEmbeddingCount": index.leaf_node_embedding_count,
                            "leafNodesToSearchPercent": index.leaf_nodes_to_search_percent,
                        }
                    }
                }
            }
        });
        let op = self.post(&self.url(&format!("{}/indexes", self.parent)), &body).await?;
        let response = self.wait(op).await?;
        Self::resource_name(&response, "create index")
    }

    async fn create_endpoint(&self, display_name: &str, description: &str) -> Result<String> {
        let body = json!({
            "displayName": display_name,
            "description": description,
            "publicEndpointEnabled": true,
        });
        let op = self
            .post(&self.url(&format!("{}/indexEndpoints", self.parent)), &body)
            .await?;
        let response = self.wait(op).await?;
        Self::resource_name(&response, "create endpoint")
    }

    async fn deploy_index(&self, endpoint: &str, index: &str, deployed_index_id: &str) -> Result<()> {
        let body = json!({
            "deployedIndex": {
                "id": deployed_index_id,
                "index": index,
                "dedicatedResources": {
                    "machineSpec": { "machineType": self.machine_type },
                    "minReplicaCount": 1,
                }
            }
        });
        let op = self
            .post(&self.url(&format!("{}:deployIndex", endpoint)), &body)
            .await?;
        self.wait(op).await?;
        Ok(())
    }

    async fn find_neighbors(
        &self,
        endpoint: &str,
        deployed_index_id: &str,
        query: &[f32],
        k: usize,
        restricts: &NeighborRestricts,
    ) -> Result<Vec<String>> {
        let info = self.get(&self.url(endpoint)).await?;
        let domain = info["publicEndpointDomainName"]
            .as_str()
            .ok_or_else(|| anyhow!("endpoint {} has no public domain", endpoint))?;

        let mut datapoint = json!({ "featureVector": query });
        if !restricts.tokens.is_empty() {
            datapoint["restricts"] = serde_json::to_value(&restricts.tokens)?;
        }
        if !restricts.numeric.is_empty() {
            datapoint["numericRestricts"] = serde_json::to_value(&restricts.numeric)?;
        }
        let body = json!({
            "deployedIndexId": deployed_index_id,
            "queries": [{ "datapoint": datapoint, "neighborCount": k }],
        });
        let url = format!("https://{}/v1/{}:findNeighbors", domain, endpoint);
        let response = self.post(&url, &body).await?;

        Ok(response["nearestNeighbors"][0]["neighbors"]
            .as_array()
            .map(|neighbors| {
                neighbors
                    .iter()
                    .filter_map(|n| n["datapoint"]["datapointId"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_endpoint(&self, endpoint: &str) -> Result<()> {
        let info = self.get(&self.url(endpoint)).await?;
        if let Some(deployed) = info["deployedIndexes"].as_array() {
            for id in deployed.iter().filter_map(|d| d["id"].as_str()) {
                tracing::info!(endpoint = %endpoint, deployed_index = %id, "undeploying index");
                let op = self
                    .post(
                        &self.url(&format!("{}:undeployIndex", endpoint)),
                        &json!({ "deployedIndexId": id }),
                    )
                    .await?;
                self.wait(op).await?;
            }
        }
        let op = self.delete(&self.url(endpoint)).await?;
        self.wait(op).await?;
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        let op = self.delete(&self.url(index)).await?;
        self.wait(op).await?;
        Ok(())
    }
}
