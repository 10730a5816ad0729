//! Human review checkpoints.
//!
//! A gavel moves from `Pending` to exactly one of `Approved`, `Rejected` or
//! `Skipped`. The phase that opened it waits on a oneshot receiver; the
//! review surface resolves it through [`GavelController::approve`],
//! [`GavelController::reject`] or [`GavelController::skip`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::definition::GavelSpec;
use crate::errors::{EngineError, EngineResult};

/// Editable field holding the reviewed output.
pub const OUTPUT_FIELD: &str = "output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GavelState {
    Pending,
    Approved,
    Rejected,
    Skipped,
}

impl GavelState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GavelState::Pending)
    }
}

/// Field edits submitted with an approval, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GavelEdits(pub BTreeMap<String, String>);

impl GavelEdits {
    pub fn output(content: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(OUTPUT_FIELD.to_string(), content.into());
        Self(fields)
    }

    /// The edited output, if the reviewer changed it.
    pub fn content(&self) -> Option<&str> {
        self.0.get(OUTPUT_FIELD).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GavelRequest {
    pub id: String,
    pub phase_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    pub prompt: String,
    pub current_output: String,
    pub editable_fields: Vec<String>,
    pub can_skip: bool,
    pub state: GavelState,
    pub created_at: DateTime<Utc>,
}

/// How a gavel was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GavelDecision {
    Approved { edits: GavelEdits },
    Rejected { reason: Option<String> },
    Skipped,
}

struct Entry {
    request: GavelRequest,
    waiter: Option<oneshot::Sender<GavelDecision>>,
}

#[derive(Default)]
pub struct GavelController {
    entries: BTreeMap<String, Entry>,
}

impl GavelController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a pending gavel and return the receiver its decision arrives on.
    pub fn open(
        &mut self,
        phase_id: &str,
        action_id: Option<String>,
        spec: &GavelSpec,
        current_output: &str,
    ) -> (GavelRequest, oneshot::Receiver<GavelDecision>) {
        let (tx, rx) = oneshot::channel();
        let request = GavelRequest {
            id: Uuid::new_v4().to_string(),
            phase_id: phase_id.to_string(),
            action_id,
            prompt: spec.prompt.clone(),
            current_output: current_output.to_string(),
            editable_fields: spec.editable_fields.clone(),
            can_skip: spec.can_skip,
            state: GavelState::Pending,
            created_at: Utc::now(),
        };
        self.entries.insert(
            request.id.clone(),
            Entry {
                request: request.clone(),
                waiter: Some(tx),
            },
        );
        (request, rx)
    }

    fn pending_mut(&mut self, gavel_id: &str) -> EngineResult<&mut Entry> {
        self.entries
            .get_mut(gavel_id)
            .filter(|e| e.request.state == GavelState::Pending)
            .ok_or_else(|| EngineError::UnknownGavel(gavel_id.to_string()))
    }

    fn resolve(&mut self, gavel_id: &str, state: GavelState, decision: GavelDecision) -> EngineResult<GavelRequest> {
        let entry = self.pending_mut(gavel_id)?;
        entry.request.state = state;
        if let Some(waiter) = entry.waiter.take() {
            // The phase may have stopped waiting (abort); the decision is still recorded.
            let _ = waiter.send(decision);
        }
        Ok(entry.request.clone())
    }

    /// Approve, optionally with edits to the gavel's editable fields.
    pub fn approve(&mut self, gavel_id: &str, edits: Option<GavelEdits>) -> EngineResult<GavelRequest> {
        let edits = edits.unwrap_or_default();
        let entry = self.pending_mut(gavel_id)?;
        if let Some(field) = edits
            .0
            .keys()
            .find(|f| !entry.request.editable_fields.contains(f))
        {
            return Err(EngineError::FieldNotEditable {
                gavel: gavel_id.to_string(),
                field: field.clone(),
            });
        }
        self.resolve(gavel_id, GavelState::Approved, GavelDecision::Approved { edits })
    }

    pub fn reject(&mut self, gavel_id: &str, reason: Option<String>) -> EngineResult<GavelRequest> {
        self.resolve(gavel_id, GavelState::Rejected, GavelDecision::Rejected { reason })
    }

    /// Skip a gavel. Fails with `SkipNotAllowed` (leaving it pending) unless
    /// the gavel permits skipping.
    pub fn skip(&mut self, gavel_id: &str) -> EngineResult<GavelRequest> {
        let entry = self.pending_mut(gavel_id)?;
        if !entry.request.can_skip {
            return Err(EngineError::SkipNotAllowed(gavel_id.to_string()));
        }
        self.resolve(gavel_id, GavelState::Skipped, GavelDecision::Skipped)
    }

    pub fn get(&self, gavel_id: &str) -> Option<&GavelRequest> {
        self.entries.get(gavel_id).map(|e| &e.request)
    }

    pub fn pending(&self) -> Vec<GavelRequest> {
        self.entries
            .values()
            .filter(|e| e.request.state == GavelState::Pending)
            .map(|e| e.request.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(can_skip: bool) -> GavelSpec {
        GavelSpec {
            required: true,
            prompt: "Approve the outline?".into(),
            editable_fields: vec![OUTPUT_FIELD.into()],
            can_skip,
            action_id: None,
        }
    }

    #[tokio::test]
    async fn test_approve_with_edits_reaches_waiter() {
        let mut gavels = GavelController::new();
        let (request, rx) = gavels.open("outline", None, &spec(false), "outline:v1");
        assert_eq!(request.state, GavelState::Pending);

        let resolved = gavels
            .approve(&request.id, Some(GavelEdits::output("outline:v1-edited")))
            .unwrap();
        assert_eq!(resolved.state, GavelState::Approved);

        match rx.await.unwrap() {
            GavelDecision::Approved { edits } => {
                assert_eq!(edits.content(), Some("outline:v1-edited"))
            }
            other => panic!("Expected approval, got {:?}", other),
        }
    }

    #[test]
    fn test_skip_not_allowed_keeps_gavel_pending() {
        let mut gavels = GavelController::new();
        let (request, _rx) = gavels.open("outline", None, &spec(false), "x");
        let err = gavels.skip(&request.id).unwrap_err();
        assert!(matches!(err, EngineError::SkipNotAllowed(id) if id == request.id));
        assert_eq!(gavels.get(&request.id).unwrap().state, GavelState::Pending);
        assert_eq!(gavels.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_skip_allowed() {
        let mut gavels = GavelController::new();
        let (request, rx) = gavels.open("outline", None, &spec(true), "x");
        gavels.skip(&request.id).unwrap();
        assert_eq!(rx.await.unwrap(), GavelDecision::Skipped);
        assert!(gavels.pending().is_empty());
    }

    #[test]
    fn test_resolved_gavel_is_stale() {
        let mut gavels = GavelController::new();
        let (request, _rx) = gavels.open("outline", Some("write".into()), &spec(true), "x");
        gavels.reject(&request.id, Some("too short".into())).unwrap();
        assert!(matches!(
            gavels.approve(&request.id, None),
            Err(EngineError::UnknownGavel(_))
        ));
        assert!(matches!(gavels.skip("missing"), Err(EngineError::UnknownGavel(_))));
    }

    #[test]
    fn test_non_editable_field_is_rejected() {
        let mut gavels = GavelController::new();
        let (request, _rx) = gavels.open("outline", None, &spec(false), "x");
        let mut edits = GavelEdits::default();
        edits.0.insert("title".into(), "New".into());
        let err = gavels.approve(&request.id, Some(edits)).unwrap_err();
        assert!(matches!(err, EngineError::FieldNotEditable { field, .. } if field == "title"));
        assert_eq!(gavels.get(&request.id).unwrap().state, GavelState::Pending);
    }

    #[test]
    fn test_resolution_after_waiter_dropped() {
        let mut gavels = GavelController::new();
        let (request, rx) = gavels.open("outline", None, &spec(false), "x");
        drop(rx);
        assert!(gavels.approve(&request.id, None).is_ok());
    }
}
