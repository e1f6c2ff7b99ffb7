//! Storage backends for enforcement records
//!
//! Stores keep their working set in memory and write the whole collection
//! through a [`Persistence`] backend on every change.

use crate::enforcement::EnforcementResult;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Durable backing for a collection of records
#[async_trait::async_trait]
pub trait Persistence<T>: Send + Sync {
    /// Load every stored record
    async fn load(&self) -> EnforcementResult<Vec<T>>;

    /// Replace the stored collection with `records`
    async fn save(&self, records: &[T]) -> EnforcementResult<()>;
}

/// Backend that keeps nothing, for tests and ephemeral runs
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryPersistence;

#[async_trait::async_trait]
impl<T: Send + Sync> Persistence<T> for MemoryPersistence {
    async fn load(&self) -> EnforcementResult<Vec<T>> {
        Ok(Vec::new())
    }

    async fn save(&self, _records: &[T]) -> EnforcementResult<()> {
        Ok(())
    }
}

/// Backend storing the collection as a YAML sequence in one file
#[derive(Debug, Clone)]
pub struct YamlFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> YamlFile<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl<T> Persistence<T> for YamlFile<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn load(&self) -> EnforcementResult<Vec<T>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => Ok(serde_yaml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, records: &[T]) -> EnforcementResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let yaml = serde_yaml::to_string(records)?;

        // Write beside the target and rename so readers never see a partial file
        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, yaml).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
