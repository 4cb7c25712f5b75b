//! Schema registry client.
//!
//! The schema collaborator (tool search / retrieval) is external and is
//! only reached through [`SchemaSource`]. [`SchemaRegistry`] caches what
//! it fetched for the lifetime of one session; schemas are immutable, so
//! a cached entry never needs invalidation within a session.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use super::ToolSchema;
use crate::error::WardenError;

/// "Fetch schema by name" interface of the external schema subsystem.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Returns the schema for `name`, or `None` if no such tool exists.
    async fn fetch(&self, name: &str) -> Result<Option<ToolSchema>>;

    /// Names of all tools currently available to the session.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Schema source backed by a fixed set of schemas, typically loaded
/// from a JSON file (`[{"name": ..., "parameters": [...]}, ...]`).
pub struct InMemorySchemaSource {
    schemas: BTreeMap<String, ToolSchema>,
}

impl InMemorySchemaSource {
    pub fn new(schemas: Vec<ToolSchema>) -> Self {
        Self {
            schemas: schemas.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let schemas: Vec<ToolSchema> = serde_json::from_str(&content)?;
        for schema in &schemas {
            schema.validate()?;
        }
        info!("Loaded {} tool schemas from {}", schemas.len(), path.display());
        Ok(Self::new(schemas))
    }
}

#[async_trait]
impl SchemaSource for InMemorySchemaSource {
    async fn fetch(&self, name: &str) -> Result<Option<ToolSchema>> {
        Ok(self.schemas.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.schemas.keys().cloned().collect())
    }
}

/// Per-session, read-only view over a [`SchemaSource`].
pub struct SchemaRegistry {
    source: Arc<dyn SchemaSource>,
    cache: Mutex<HashMap<String, Arc<ToolSchema>>>,
}

impl SchemaRegistry {
    pub fn new(source: Arc<dyn SchemaSource>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches a schema, serving repeated lookups from the session cache.
    ///
    /// Absence yields `UnknownTool`. A source failure also yields
    /// `UnknownTool`: a tool whose schema cannot be obtained cannot be
    /// enforced, so it cannot be called.
    pub async fn fetch(&self, name: &str) -> Result<Arc<ToolSchema>, WardenError> {
        if let Some(schema) = self.cached(name) {
            return Ok(schema);
        }

        let fetched = self.source.fetch(name).await.map_err(|e| {
            debug!("Schema fetch for '{name}' failed: {e}");
            WardenError::UnknownTool {
                tool: name.to_string(),
            }
        })?;
        let schema = fetched.ok_or_else(|| WardenError::UnknownTool {
            tool: name.to_string(),
        })?;
        schema.validate()?;

        let schema = Arc::new(schema);
        if let Ok(mut cache) = self.cache.lock() {
            cache
                .entry(name.to_string())
                .or_insert_with(|| schema.clone());
        }
        Ok(schema)
    }

    /// Builds the catalog of every tool available to this session.
    pub async fn catalog(&self) -> Result<ToolCatalog> {
        let names = self.source.list().await?;
        let mut tools = BTreeMap::new();
        for name in names {
            let schema = self.fetch(&name).await?;
            tools.insert(name, schema);
        }
        debug!("Session catalog: {} tools", tools.len());
        Ok(ToolCatalog { tools })
    }

    fn cached(&self, name: &str) -> Option<Arc<ToolSchema>> {
        self.cache.lock().ok()?.get(name).cloned()
    }
}

/// Immutable snapshot of the tools available to a session.
///
/// Used by the static analyzer (existence + shape checks), by the
/// repair diagnostics (schema fragments, name hints), and by the code
/// generator prompt.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, Arc<ToolSchema>>,
}

impl ToolCatalog {
    pub fn new(schemas: impl IntoIterator<Item = ToolSchema>) -> Self {
        Self {
            tools: schemas
                .into_iter()
                .map(|s| (s.name.clone(), Arc::new(s)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ToolSchema>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn schemas(&self) -> impl Iterator<Item = &Arc<ToolSchema>> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Best guess for a hallucinated tool name: a catalog entry sharing
    /// the last segment, otherwise the closest name by edit distance
    /// (only when reasonably close).
    pub fn closest(&self, name: &str) -> Option<&str> {
        let last = name.rsplit('.').next().unwrap_or(name);
        if let Some(hit) = self
            .names()
            .find(|candidate| candidate.rsplit('.').next() == Some(last))
        {
            return Some(hit);
        }

        self.names()
            .map(|candidate| (edit_distance(name, candidate), candidate))
            .filter(|(d, candidate)| *d <= candidate.len().max(name.len()) / 3)
            .min_by_key(|(d, _)| *d)
            .map(|(_, candidate)| candidate)
    }
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        cur[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn schema(name: &str) -> ToolSchema {
        ToolSchema {
            name: name.to_string(),
            description: String::new(),
            operation: None,
            parameters: vec![],
            response: Default::default(),
        }
    }

    /// Counts fetches so caching can be observed.
    struct CountingSource {
        inner: InMemorySchemaSource,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl SchemaSource for CountingSource {
        async fn fetch(&self, name: &str) -> Result<Option<ToolSchema>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(name).await
        }

        async fn list(&self) -> Result<Vec<String>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_fetch_is_cached_per_session() {
        let source = Arc::new(CountingSource {
            inner: InMemorySchemaSource::new(vec![schema("crm.read.getLead")]),
            fetches: AtomicUsize::new(0),
        });
        let registry = SchemaRegistry::new(source.clone());

        let a = registry.fetch("crm.read.getLead").await.unwrap();
        let b = registry.fetch("crm.read.getLead").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_tool_is_unknown() {
        let registry = SchemaRegistry::new(Arc::new(InMemorySchemaSource::new(vec![])));
        let err = registry.fetch("nope.tool").await.unwrap_err();
        assert_eq!(
            err,
            WardenError::UnknownTool {
                tool: "nope.tool".into()
            }
        );
    }

    #[tokio::test]
    async fn test_catalog_lists_all_tools() {
        let registry = SchemaRegistry::new(Arc::new(InMemorySchemaSource::new(vec![
            schema("crm.read.getLead"),
            schema("crm.write.updateLead"),
        ])));
        let catalog = registry.catalog().await.unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.contains("crm.write.updateLead"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tools.json");
        std::fs::write(
            &path,
            r#"[{"name": "hr.read.getSalary",
                 "parameters": [{"name": "employeeId", "type": "string", "required": true}]}]"#,
        )
        .unwrap();
        let source = InMemorySchemaSource::from_file(&path).unwrap();
        assert!(source.schemas.contains_key("hr.read.getSalary"));
    }

    #[test]
    fn test_from_file_rejects_invalid_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tools.json");
        std::fs::write(
            &path,
            r#"[{"name": "a.b", "parameters": [{"name": "x", "pattern": "(("}]}]"#,
        )
        .unwrap();
        assert!(InMemorySchemaSource::from_file(&path).is_err());
    }

    #[test]
    fn test_closest_prefers_same_last_segment() {
        let catalog = ToolCatalog::new(vec![
            schema("crm.read.getLead"),
            schema("crm.read.listLeads"),
        ]);
        assert_eq!(catalog.closest("getLead"), Some("crm.read.getLead"));
        assert_eq!(catalog.closest("crm.read.getLeads"), Some("crm.read.getLead"));
        assert_eq!(catalog.closest("weather.forecast"), None);
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("same", "same"), 0);
    }
}
