//! Persistent key/value memory with semantic search.
//!
//! Items live in `memories.json`, rewritten atomically (temp file +
//! rename) on every mutation. The store is capped: when full, the least
//! frequently used item is evicted, ties broken by least recent access.
//! Dense embeddings come from the remote embedding service; without a
//! client, semantic search returns nothing while direct key lookup
//! keeps working.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::AssistantError;

/// One remembered fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub key: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Remote embedding client. `None` in the store disables semantic search.
pub struct EmbeddingClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl EmbeddingClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// Fetch a dense vector for `text`.
    pub async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        #[derive(Deserialize)]
        struct EmbeddingResponse {
            data: Vec<EmbeddingData>,
        }
        #[derive(Deserialize)]
        struct EmbeddingData {
            embedding: Vec<f32>,
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let resp = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("embedding request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("embedding API error {status}: {body}");
        }

        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("embedding response parse: {e}"))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("embedding response empty"))
    }
}

/// Cosine similarity of two vectors; zero when either has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// Capped persistent store of memory items.
pub struct MemoryStore {
    path: PathBuf,
    cap: usize,
    items: Vec<MemoryItem>,
    embedder: Option<EmbeddingClient>,
}

impl MemoryStore {
    /// Load the store from `path`, creating an empty one when absent.
    pub fn open(
        path: PathBuf,
        cap: usize,
        embedder: Option<EmbeddingClient>,
    ) -> Result<Self, AssistantError> {
        let items = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Vec<MemoryItem>>(&contents) {
                Ok(items) => items,
                Err(e) => {
                    warn!("failed to parse {}: {e} — starting empty", path.display());
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!(count = items.len(), "memory store loaded");
        let mut store = Self {
            path,
            cap: cap.max(1),
            items,
            embedder,
        };
        // A lowered cap takes effect on load, not just on the next write.
        if store.evict_over_cap() {
            store.save()?;
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.iter().map(|i| i.key.clone()).collect()
    }

    /// Insert or update an item, evicting if the cap is exceeded.
    pub async fn remember(&mut self, key: &str, content: &str) -> Result<(), AssistantError> {
        let embedding = match &self.embedder {
            Some(client) => match client.embed(content).await {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("embedding unavailable for '{key}': {e}");
                    None
                }
            },
            None => None,
        };

        let now = Utc::now();
        if let Some(item) = self.items.iter_mut().find(|i| i.key == key) {
            item.content = content.to_string();
            item.updated_at = now;
            item.embedding = embedding;
        } else {
            self.items.push(MemoryItem {
                key: key.to_string(),
                content: content.to_string(),
                created_at: now,
                updated_at: now,
                access_count: 0,
                last_accessed_at: now,
                embedding,
            });
            self.evict_over_cap();
        }
        self.save()
    }

    /// Direct key lookup; bumps access statistics.
    pub fn recall(&mut self, key: &str) -> Result<Option<String>, AssistantError> {
        let content = match self.items.iter_mut().find(|i| i.key == key) {
            Some(item) => {
                item.access_count += 1;
                item.last_accessed_at = Utc::now();
                Some(item.content.clone())
            }
            None => None,
        };
        if content.is_some() {
            self.save()?;
        }
        Ok(content)
    }

    /// Semantic search by cosine similarity over stored embeddings.
    /// Returns `(key, content)` pairs, best first. Empty without an
    /// embedding client.
    pub async fn search(
        &mut self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<(String, String)>, AssistantError> {
        let Some(client) = &self.embedder else {
            debug!("semantic search skipped: no embedding client");
            return Ok(Vec::new());
        };
        let query_vec = client
            .embed(query)
            .await
            .map_err(AssistantError::Other)?;

        let mut scored: Vec<(f32, usize)> = self
            .items
            .iter()
            .enumerate()
            .filter_map(|(idx, item)| {
                item.embedding
                    .as_ref()
                    .map(|e| (cosine_similarity(&query_vec, e), idx))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);

        let now = Utc::now();
        let mut results = Vec::with_capacity(scored.len());
        for (_score, idx) in scored {
            let item = &mut self.items[idx];
            item.access_count += 1;
            item.last_accessed_at = now;
            results.push((item.key.clone(), item.content.clone()));
        }
        if !results.is_empty() {
            self.save()?;
        }
        Ok(results)
    }

    /// Remove an item; returns whether it existed.
    pub fn forget(&mut self, key: &str) -> Result<bool, AssistantError> {
        let before = self.items.len();
        self.items.retain(|i| i.key != key);
        let removed = self.items.len() != before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Remove everything.
    pub fn clear(&mut self) -> Result<(), AssistantError> {
        self.items.clear();
        self.save()
    }

    /// Evict least-frequently, then least-recently used items until the
    /// count fits the cap. Returns whether anything was evicted.
    fn evict_over_cap(&mut self) -> bool {
        let mut evicted = false;
        while self.items.len() > self.cap {
            let victim = self
                .items
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.access_count
                        .cmp(&b.access_count)
                        .then(a.last_accessed_at.cmp(&b.last_accessed_at))
                })
                .map(|(idx, _)| idx);
            if let Some(idx) = victim {
                let item = self.items.remove(idx);
                debug!(key = %item.key, "memory evicted");
                evicted = true;
            } else {
                break;
            }
        }
        evicted
    }

    /// Rewrite the backing file atomically.
    fn save(&self) -> Result<(), AssistantError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.items)
            .map_err(|e| AssistantError::Other(e.into()))?;
        let tmp = temp_path(&self.path);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_at(dir: &tempfile::TempDir, cap: usize) -> MemoryStore {
        MemoryStore::open(dir.path().join("memories.json"), cap, None).unwrap()
    }

    #[tokio::test]
    async fn remember_and_recall_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir, 10);

        store.remember("birthday", "March 3rd").await.unwrap();
        assert_eq!(
            store.recall("birthday").unwrap().as_deref(),
            Some("March 3rd")
        );
        assert_eq!(store.recall("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memories.json");
        {
            let mut store = MemoryStore::open(path.clone(), 10, None).unwrap();
            store.remember("color", "green").await.unwrap();
        }
        let mut reopened = MemoryStore::open(path, 10, None).unwrap();
        assert_eq!(reopened.recall("color").unwrap().as_deref(), Some("green"));
    }

    #[tokio::test]
    async fn duplicate_key_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir, 10);

        store.remember("pet", "a cat").await.unwrap();
        store.remember("pet", "two cats").await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.recall("pet").unwrap().as_deref(), Some("two cats"));
    }

    #[tokio::test]
    async fn cap_evicts_least_frequently_used() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir, 2);

        store.remember("a", "1").await.unwrap();
        store.remember("b", "2").await.unwrap();
        // Access "a" so "b" becomes the LFU victim.
        store.recall("a").unwrap();
        store.remember("c", "3").await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.recall("b").unwrap().is_none());
        assert!(store.recall("a").unwrap().is_some());
        assert!(store.recall("c").unwrap().is_some());
    }

    #[tokio::test]
    async fn equal_frequency_evicts_least_recent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir, 2);

        store.remember("old", "1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.remember("new", "2").await.unwrap();
        store.remember("extra", "3").await.unwrap();

        assert!(store.recall("old").unwrap().is_none());
        assert!(store.recall("new").unwrap().is_some());
    }

    #[tokio::test]
    async fn count_never_exceeds_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir, 3);
        for i in 0..10 {
            store
                .remember(&format!("k{i}"), &format!("v{i}"))
                .await
                .unwrap();
            assert!(store.len() <= 3);
        }
    }

    #[tokio::test]
    async fn forget_removes_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir, 10);
        store.remember("gone", "soon").await.unwrap();
        assert!(store.forget("gone").unwrap());
        assert!(!store.forget("gone").unwrap());
    }

    #[tokio::test]
    async fn search_without_embedder_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir, 10);
        store.remember("fact", "water is wet").await.unwrap();
        let results = store.search("what is wet?", 5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir, 10);
        store.remember("x", "y").await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn cosine_similarity_behaviour() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }
}
