use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::types::{FunctionSummary, FunctionTarget};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum FunctionRegistryError {
    #[error("function registry unavailable: {0}")]
    Unavailable(String),
}

/// Lookup of deployed function summaries by their four-part address.
#[async_trait]
pub trait FunctionRegistry: Send + Sync {
    async fn get_summary(
        &self,
        target: &FunctionTarget,
    ) -> Result<Option<FunctionSummary>, FunctionRegistryError>;
}

pub fn memory() -> Arc<MemoryFunctionRegistry> {
    Arc::new(MemoryFunctionRegistry::default())
}

#[derive(Default)]
pub struct MemoryFunctionRegistry {
    inner: Mutex<HashMap<FunctionTarget, FunctionSummary>>,
}

impl MemoryFunctionRegistry {
    pub async fn insert(&self, target: FunctionTarget, summary: FunctionSummary) {
        self.inner.lock().await.insert(target, summary);
    }
}

#[async_trait]
impl FunctionRegistry for MemoryFunctionRegistry {
    async fn get_summary(
        &self,
        target: &FunctionTarget,
    ) -> Result<Option<FunctionSummary>, FunctionRegistryError> {
        Ok(self.inner.lock().await.get(target).cloned())
    }
}
