use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::error::AppError;
use crate::resolver::CompiledSchema;
use crate::schema::ParsingSchema;
use crate::traits::SchemaStore;

/// A schema version with its selectors compiled.
#[derive(Debug)]
pub struct LoadedSchema {
    pub schema: ParsingSchema,
    pub compiled: CompiledSchema,
}

impl LoadedSchema {
    pub fn new(schema: ParsingSchema) -> Result<Self, AppError> {
        let compiled = CompiledSchema::compile(&schema.definition)?;
        Ok(Self { schema, compiled })
    }
}

/// Compiled schema versions shared by all workers.
///
/// Published versions never change, so entries only expire to bound memory.
#[derive(Clone)]
pub struct SchemaCache {
    inner: Cache<(String, u32), Arc<LoadedSchema>>,
}

impl SchemaCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .time_to_idle(Duration::from_secs(30 * 60))
                .build(),
        }
    }

    pub async fn load<S: SchemaStore>(
        &self,
        store: &S,
        schema_id: &str,
        version: u32,
    ) -> Result<Arc<LoadedSchema>, AppError> {
        let key = (schema_id.to_string(), version);
        if let Some(hit) = self.inner.get(&key).await {
            return Ok(hit);
        }
        let schema = store
            .get_schema(schema_id, Some(version))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("schema {schema_id} v{version}")))?;
        let loaded = Arc::new(LoadedSchema::new(schema)?);
        self.inner.insert(key, loaded.clone()).await;
        Ok(loaded)
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::schema::{FieldDefinition, NewSchema, SchemaDefinition};

    #[tokio::test]
    async fn loads_once_and_reports_missing_versions() {
        let store = MemoryStore::new();
        let def = SchemaDefinition::new(vec![FieldDefinition::new("title", "h1")]);
        store
            .create_schema(NewSchema::new("books", "books", def))
            .await
            .unwrap();

        let cache = SchemaCache::new(16);
        let a = cache.load(&store, "books", 1).await.unwrap();
        let b = cache.load(&store, "books", 1).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.schema.version, 1);

        let err = cache.load(&store, "books", 2).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
