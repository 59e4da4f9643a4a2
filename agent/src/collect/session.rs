//! Collection session state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collect::coerce::coerce_answer;
use crate::errors::AgentError;
use crate::models::parameter::{ParameterDefinition, ParameterSet, RecordedParameter};
use crate::templates::Template;

/// Where a session is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CollectionState {
    NotStarted,
    AwaitingAnswer {
        parameter: String,
        /// Invalid answers given for this parameter so far
        retries: u32,
    },
    Complete,
    Cancelled,
}

impl CollectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionState::NotStarted => "not_started",
            CollectionState::AwaitingAnswer { .. } => "awaiting_answer",
            CollectionState::Complete => "complete",
            CollectionState::Cancelled => "cancelled",
        }
    }
}

/// Result of feeding an answer to a session
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerOutcome {
    NextQuestion {
        parameter: String,
        question: String,
    },
    /// The answer was rejected; the same parameter is asked again
    Retry {
        parameter: String,
        question: String,
        reason: String,
    },
    Complete {
        collected: ParameterSet,
    },
}

/// One conversation's progress through a template's parameters
#[derive(Debug, Clone)]
pub struct CollectionSession {
    pub session_id: String,
    pub template_id: String,
    /// Not yet answered, in asking order
    pub pending: Vec<ParameterDefinition>,
    pub collected: ParameterSet,
    pub state: CollectionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollectionSession {
    /// Queue sorted by declared order, required before optional on ties
    pub fn new(session_id: impl Into<String>, template: &Template) -> Self {
        let mut pending = template.parameters.clone();
        pending.sort_by_key(|d| (d.order, !d.required));
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            template_id: template.id.clone(),
            pending,
            collected: ParameterSet::new(),
            state: CollectionState::NotStarted,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current(&self) -> Option<&ParameterDefinition> {
        match &self.state {
            CollectionState::AwaitingAnswer { parameter, .. } => {
                self.pending.iter().find(|d| &d.name == parameter)
            }
            _ => None,
        }
    }

    pub fn current_question(&self) -> Option<String> {
        self.current().map(ParameterDefinition::question)
    }

    /// Ask the first pending parameter, or complete when nothing is pending
    pub fn begin(&mut self) -> AnswerOutcome {
        self.advance()
    }

    fn advance(&mut self) -> AnswerOutcome {
        self.updated_at = Utc::now();
        match self.pending.first() {
            Some(next) => {
                let outcome = AnswerOutcome::NextQuestion {
                    parameter: next.name.clone(),
                    question: next.question(),
                };
                self.state = CollectionState::AwaitingAnswer {
                    parameter: next.name.clone(),
                    retries: 0,
                };
                outcome
            }
            None => {
                self.state = CollectionState::Complete;
                AnswerOutcome::Complete {
                    collected: self.collected.clone(),
                }
            }
        }
    }

    pub fn ensure_open(&self) -> Result<(), AgentError> {
        match self.state {
            CollectionState::Complete => Err(AgentError::SessionComplete(self.session_id.clone())),
            CollectionState::Cancelled => Err(AgentError::SessionCancelled(self.session_id.clone())),
            _ => Ok(()),
        }
    }

    /// Answer the current parameter. Empty text takes the default (or skips
    /// an optional parameter); invalid text keeps the session where it is.
    pub fn answer(&mut self, raw: &str) -> Result<AnswerOutcome, AgentError> {
        self.ensure_open()?;
        if self.state == CollectionState::NotStarted {
            self.begin();
        }
        let Some(definition) = self.current().cloned() else {
            return Ok(self.advance());
        };

        let value = if raw.trim().is_empty() {
            match (&definition.default_value, definition.required) {
                (Some(default), _) => Some(default.clone()),
                (None, false) => None,
                (None, true) => {
                    return Ok(self.retry(&definition, "a value is required".to_string()));
                }
            }
        } else {
            match coerce_answer(&definition, raw) {
                Ok(value) => Some(value),
                Err(AgentError::ValidationError(reason)) => {
                    return Ok(self.retry(&definition, reason));
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(value) = value {
            self.collected.insert(definition.name.clone(), value);
        }
        self.pending.retain(|d| d.name != definition.name);
        Ok(self.advance())
    }

    fn retry(&mut self, definition: &ParameterDefinition, reason: String) -> AnswerOutcome {
        if let CollectionState::AwaitingAnswer { retries, .. } = &mut self.state {
            *retries += 1;
        }
        self.updated_at = Utc::now();
        AnswerOutcome::Retry {
            parameter: definition.name.clone(),
            question: definition.question(),
            reason,
        }
    }

    /// Answer any pending parameter by name, out of turn
    pub fn absorb(&mut self, name: &str, raw: &str) -> Result<(), AgentError> {
        self.ensure_open()?;
        let definition = self
            .pending
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| AgentError::ValidationError(format!("{} is not pending", name)))?;
        let value = coerce_answer(&definition, raw)?;
        self.collected.insert(definition.name.clone(), value);
        self.pending.retain(|d| d.name != definition.name);
        Ok(())
    }

    /// Re-point the session at the head of the queue after out-of-turn answers
    pub fn resync(&mut self) -> AnswerOutcome {
        if let Some(current) = self.current() {
            return AnswerOutcome::NextQuestion {
                parameter: current.name.clone(),
                question: current.question(),
            };
        }
        self.advance()
    }

    /// Whether every pending item can be filled without asking
    pub fn can_hand_off(&self) -> bool {
        self.state == CollectionState::Complete
            || self
                .pending
                .iter()
                .all(|d| d.default_value.is_some() || !d.required)
    }

    /// Required pending parameters without a default
    pub fn missing(&self) -> Vec<String> {
        self.pending
            .iter()
            .filter(|d| d.required && d.default_value.is_none())
            .map(|d| d.name.clone())
            .collect()
    }

    /// Collected values plus defaults of everything still pending
    pub fn resolved(&self) -> Result<ParameterSet, AgentError> {
        if !self.can_hand_off() {
            return Err(AgentError::ValidationError(format!(
                "session {} is still missing: {}",
                self.session_id,
                self.missing().join(", ")
            )));
        }
        let mut parameters = self.collected.clone();
        for definition in &self.pending {
            if let Some(default) = &definition.default_value {
                parameters.insert(definition.name.clone(), default.clone());
            }
        }
        Ok(parameters)
    }

    pub fn cancel(&mut self) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.collected.clear();
        self.pending.clear();
        self.state = CollectionState::Cancelled;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Persistable form; secret answers are left out
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            template_id: self.template_id.clone(),
            state: self.state.clone(),
            pending: self.pending.iter().map(|d| d.name.clone()).collect(),
            collected: self
                .collected
                .redacted()
                .into_iter()
                .filter(|p| !p.secret)
                .collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Rebuild from a snapshot. Parameters whose answers were not persisted
    /// go back on the queue in their asking order.
    pub fn restore(snapshot: SessionSnapshot, template: &Template) -> Self {
        let mut session = CollectionSession::new(snapshot.session_id, template);
        session.created_at = snapshot.created_at;
        session.updated_at = snapshot.updated_at;

        let raw = serde_json::Value::Object(
            snapshot
                .collected
                .into_iter()
                .map(|p| (p.name, p.value))
                .collect(),
        );
        let restored = ParameterSet::from_tfvars_json(&raw, &template.parameters);
        for definition in &template.parameters {
            if let Some(value) = restored.get(&definition.name) {
                session.collected.insert(definition.name.clone(), value.clone());
            }
        }
        // Skipped optionals are neither pending nor collected
        session.pending.retain(|d| {
            !session.collected.contains(&d.name)
                && (snapshot.pending.contains(&d.name) || d.is_secret())
        });

        session.state = match snapshot.state {
            CollectionState::Cancelled => {
                session.collected.clear();
                session.pending.clear();
                CollectionState::Cancelled
            }
            CollectionState::NotStarted => CollectionState::NotStarted,
            CollectionState::AwaitingAnswer { .. } | CollectionState::Complete => {
                match session.pending.first() {
                    Some(next) => CollectionState::AwaitingAnswer {
                        parameter: next.name.clone(),
                        retries: 0,
                    },
                    None => CollectionState::Complete,
                }
            }
        };
        session
    }
}

/// On-disk form of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub template_id: String,
    pub state: CollectionState,
    pub pending: Vec<String>,
    pub collected: Vec<RecordedParameter>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
