//! Append-only store of structured numeric facts.

use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use disclosure_common::Result;

use crate::storage::BlobStore;

/// A structured numeric observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    #[serde(alias = "company")]
    pub entity: String,
    pub metric: String,
    #[serde(alias = "year")]
    pub period: String,
    /// Raw value, e.g. "$85,000" or "12%"
    #[serde(deserialize_with = "string_or_number")]
    pub value: String,
}

impl Fact {
    pub fn new(entity: &str, metric: &str, period: &str, value: &str) -> Self {
        Self {
            entity: entity.to_string(),
            metric: metric.to_string(),
            period: period.to_string(),
            value: value.to_string(),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

/// Fact store over a [`BlobStore`] key.
///
/// Readers never block each other. Every rewrite of the stored list goes
/// through `write_lock`, so concurrent appends cannot lose facts.
pub struct FactStore {
    store: Arc<dyn BlobStore>,
    key: String,
    write_lock: Mutex<()>,
}

impl FactStore {
    pub fn new(store: Arc<dyn BlobStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Load every stored fact. Missing or corrupt data loads as empty.
    pub async fn load(&self) -> Vec<Fact> {
        let Some(bytes) = self.store.read(&self.key).await else {
            debug!(key = %self.key, "No fact store yet");
            return Vec::new();
        };

        match serde_json::from_slice(&bytes) {
            Ok(facts) => facts,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Corrupt fact store, treating as empty");
                Vec::new()
            }
        }
    }

    /// Append facts, returning the new total.
    pub async fn append(&self, facts: Vec<Fact>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let mut existing = self.load().await;
        let added = facts.len();
        existing.extend(facts);

        let bytes = serde_json::to_vec_pretty(&existing)?;
        self.store.write(&self.key, &bytes).await?;

        info!(added, total = existing.len(), "Appended facts");
        Ok(existing.len())
    }

    /// Facts for one entity, matched case-insensitively.
    pub async fn facts_for(&self, entity: &str) -> Vec<Fact> {
        let wanted = entity.to_lowercase();
        self.load()
            .await
            .into_iter()
            .filter(|f| f.entity.to_lowercase() == wanted)
            .collect()
    }

    /// Remove every stored fact.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.write(&self.key, b"[]").await?;
        info!(key = %self.key, "Cleared fact store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn store() -> (MemoryStore, FactStore) {
        let mem = MemoryStore::new();
        let facts = FactStore::new(Arc::new(mem.clone()), "facts.json");
        (mem, facts)
    }

    #[tokio::test]
    async fn test_missing_store_loads_empty() {
        let (_, facts) = store();
        assert!(facts.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_store_loads_empty() {
        let (mem, facts) = store();
        mem.write("facts.json", b"{not json").await.unwrap();
        assert!(facts.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_append_and_filter() {
        let (_, facts) = store();
        facts
            .append(vec![Fact::new("ACME", "Revenue", "2023", "$100")])
            .await
            .unwrap();
        let total = facts
            .append(vec![Fact::new("Other", "Revenue", "2023", "$5")])
            .await
            .unwrap();

        assert_eq!(total, 2);
        assert_eq!(facts.facts_for("acme").await.len(), 1);

        facts.clear().await.unwrap();
        assert!(facts.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_serialized() {
        let (_, facts) = store();
        let facts = Arc::new(facts);

        let mut handles = Vec::new();
        for i in 0..16 {
            let facts = Arc::clone(&facts);
            handles.push(tokio::spawn(async move {
                facts
                    .append(vec![Fact::new("ACME", "Revenue", &format!("{}", 2000 + i), "1")])
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(facts.load().await.len(), 16);
    }

    #[test]
    fn test_legacy_field_names_and_numeric_values() {
        let json = r#"[{"company": "ACME", "metric": "Revenue", "year": "2024", "value": 125.5}]"#;
        let facts: Vec<Fact> = serde_json::from_str(json).unwrap();
        assert_eq!(facts[0].entity, "ACME");
        assert_eq!(facts[0].period, "2024");
        assert_eq!(facts[0].value, "125.5");
    }
}
