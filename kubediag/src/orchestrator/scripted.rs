//! A deterministic collaborator that replays a fixed script.
//!
//! Useful for tests and offline demos where no LLM is reachable.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::collaborator::{Action, Collaborator, DecisionRequest};
use crate::error::CollaboratorError;

pub struct ScriptedCollaborator {
    script: Mutex<VecDeque<Action>>,
    /// Returned once the script is empty
    fallback: Option<Action>,
    conclusion: String,
    delay: Duration,
    requests: AtomicUsize,
}

impl ScriptedCollaborator {
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            script: Mutex::new(actions.into()),
            fallback: None,
            conclusion: "Partial diagnosis based on the tool results so far.".to_string(),
            delay: Duration::ZERO,
            requests: AtomicUsize::new(0),
        }
    }

    /// Returns `action` forever.
    pub fn repeating(action: Action) -> Self {
        Self {
            fallback: Some(action),
            ..Self::new(Vec::new())
        }
    }

    /// Text returned when asked to conclude with no budget left.
    pub fn with_conclusion(mut self, text: &str) -> Self {
        self.conclusion = text.to_string();
        self
    }

    /// Sleep before every decision.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Collaborator for ScriptedCollaborator {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Action, CollaboratorError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if request.remaining_steps == 0 {
            return Ok(Action::FinalAnswer(self.conclusion.clone()));
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        Ok(next
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Action::FinalAnswer("No further actions scripted.".to_string())))
    }
}
