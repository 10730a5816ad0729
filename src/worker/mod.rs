//! Worker invocation seam.
//!
//! Workers are referenced by id only. The engine resolves them through an
//! injected [`WorkerRegistry`] and calls them through [`Invocable`]; how a
//! worker generates text is opaque. Provided implementations:
//! - [`StaticRegistry`], a fixed id → worker map with team membership
//! - [`HttpWorker`], a JSON-over-HTTP worker with failure classification
//! - [`PlainAssembler`], the default [`PromptAssembler`]

mod http;
mod prompt;

pub use http::HttpWorker;
pub use prompt::{PlainAssembler, PromptAssembler, PromptParts};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::CallError;

/// Where an invocation sits in the run. Passed to every worker call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: String,
    pub phase_id: String,
    pub action_id: String,
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    /// 1-based attempt number within the action's retry budget.
    pub attempt: u32,
    /// 1-based round for round-robin and consensus actions.
    pub round: u32,
}

/// An external text-generation capability.
#[async_trait]
pub trait Invocable: Send + Sync {
    async fn invoke(&self, prompt: &str, ctx: &ExecutionContext) -> Result<String, CallError>;
}

/// Externally owned mapping from worker and team ids to workers.
pub trait WorkerRegistry: Send + Sync {
    fn resolve(&self, worker_id: &str) -> Option<Arc<dyn Invocable>>;

    /// Member worker ids of a team, in invocation order.
    fn team_members(&self, team_id: &str) -> Option<Vec<String>>;

    fn display_name(&self, worker_id: &str) -> String {
        worker_id.to_string()
    }
}

struct Registered {
    worker: Arc<dyn Invocable>,
    display_name: String,
}

/// Registry built up front from known workers and teams.
#[derive(Default)]
pub struct StaticRegistry {
    workers: BTreeMap<String, Registered>,
    teams: BTreeMap<String, Vec<String>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(self, worker_id: &str, worker: Arc<dyn Invocable>) -> Self {
        self.with_named_worker(worker_id, worker_id, worker)
    }

    pub fn with_named_worker(
        mut self,
        worker_id: &str,
        display_name: &str,
        worker: Arc<dyn Invocable>,
    ) -> Self {
        self.workers.insert(
            worker_id.to_string(),
            Registered {
                worker,
                display_name: display_name.to_string(),
            },
        );
        self
    }

    pub fn with_team(mut self, team_id: &str, members: &[&str]) -> Self {
        self.teams.insert(
            team_id.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }
}

impl WorkerRegistry for StaticRegistry {
    fn resolve(&self, worker_id: &str) -> Option<Arc<dyn Invocable>> {
        self.workers.get(worker_id).map(|r| r.worker.clone())
    }

    fn team_members(&self, team_id: &str) -> Option<Vec<String>> {
        self.teams.get(team_id).cloned()
    }

    fn display_name(&self, worker_id: &str) -> String {
        self.workers
            .get(worker_id)
            .map(|r| r.display_name.clone())
            .unwrap_or_else(|| worker_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Invocable for Echo {
        async fn invoke(&self, prompt: &str, ctx: &ExecutionContext) -> Result<String, CallError> {
            Ok(format!("{}:{}", ctx.worker_id, prompt))
        }
    }

    #[tokio::test]
    async fn test_static_registry_resolves_workers() {
        let registry = StaticRegistry::new()
            .with_named_worker("drafter", "Drafter", Arc::new(Echo))
            .with_worker("critic", Arc::new(Echo))
            .with_team("editors", &["drafter", "critic"]);

        let worker = registry.resolve("drafter").unwrap();
        let ctx = ExecutionContext {
            worker_id: "drafter".into(),
            ..Default::default()
        };
        assert_eq!(worker.invoke("hi", &ctx).await.unwrap(), "drafter:hi");

        assert!(registry.resolve("ghost").is_none());
        assert_eq!(registry.display_name("drafter"), "Drafter");
        assert_eq!(registry.display_name("critic"), "critic");
        assert_eq!(registry.display_name("ghost"), "ghost");
        assert_eq!(
            registry.team_members("editors").unwrap(),
            vec!["drafter".to_string(), "critic".to_string()]
        );
        assert!(registry.team_members("nobody").is_none());
        assert_eq!(registry.worker_ids(), vec!["critic", "drafter"]);
    }
}
