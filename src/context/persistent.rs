//! Persistent bindings resolved through the external knowledge store.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ContextBlock, ContextScope, Provenance};
use crate::definition::PersistentBinding;

/// Externally owned knowledge store. Must tolerate concurrent use by
/// independent executors.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Resolve a store key, applying the binding's optional transform.
    /// `Ok(None)` means the key holds no value.
    async fn resolve(&self, store_key: &str, transform: Option<&str>) -> anyhow::Result<Option<String>>;
}

/// Knowledge store with no entries.
pub struct NullKnowledgeStore;

#[async_trait]
impl KnowledgeStore for NullKnowledgeStore {
    async fn resolve(&self, _store_key: &str, _transform: Option<&str>) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Read-only view over a pipeline's persistent bindings. Every call goes to
/// the store; nothing is cached between reads.
#[derive(Clone)]
pub struct PersistentBindings {
    bindings: BTreeMap<String, PersistentBinding>,
    store: Arc<dyn KnowledgeStore>,
}

impl PersistentBindings {
    pub fn new(bindings: BTreeMap<String, PersistentBinding>, store: Arc<dyn KnowledgeStore>) -> Self {
        Self { bindings, store }
    }

    pub fn is_declared(&self, ref_id: &str) -> bool {
        self.bindings.contains_key(ref_id)
    }

    /// Resolve a binding. Undeclared refs, empty store entries and store
    /// failures all resolve to `None`; failures are logged.
    pub async fn resolve(&self, ref_id: &str) -> Option<ContextBlock> {
        let binding = self.bindings.get(ref_id)?;
        match self
            .store
            .resolve(&binding.store_key, binding.transform.as_deref())
            .await
        {
            Ok(Some(value)) => Some(ContextBlock::new(
                ref_id,
                ContextScope::Persistent,
                value,
                Provenance::Persistent {
                    store_key: binding.store_key.clone(),
                },
            )),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    binding = ref_id,
                    store_key = %binding.store_key,
                    "Knowledge store lookup failed: {:#}",
                    e
                );
                None
            }
        }
    }

    /// Resolve several bindings, skipping those that are absent.
    pub async fn resolve_all(&self, refs: &[String]) -> Vec<ContextBlock> {
        let mut blocks = Vec::with_capacity(refs.len());
        for ref_id in refs {
            if let Some(block) = self.resolve(ref_id).await {
                blocks.push(block);
            }
        }
        blocks
    }
}
