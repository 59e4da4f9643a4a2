//! Parameter collector: one isolated session per conversation

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::collect::session::{AnswerOutcome, CollectionSession, CollectionState, SessionSnapshot};
use crate::deploy::tracker::DeploymentTracker;
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::templates::TemplateCatalog;
use crate::utils::generate_id;

static FREEFORM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:^|[\s,;(])([A-Za-z][A-Za-z0-9_\-]*)\s*[:=]\s*(?:"([^"]*)"|'([^']*)'|([^\s,;)]+))"#,
    )
    .expect("freeform regex")
});

/// What a free-form message contributed
#[derive(Debug, Clone, PartialEq)]
pub struct FreeformOutcome {
    pub extracted: usize,
    /// Matched names whose values did not validate, with the reason
    pub rejected: Vec<(String, String)>,
    pub next: AnswerOutcome,
}

pub struct ParameterCollector {
    catalog: Arc<dyn TemplateCatalog>,
    sessions_dir: Dir,
    sessions: RwLock<HashMap<String, Arc<Mutex<CollectionSession>>>>,
}

impl ParameterCollector {
    pub fn new(catalog: Arc<dyn TemplateCatalog>, sessions_dir: Dir) -> Self {
        Self {
            catalog,
            sessions_dir,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a session for a template and ask its first question
    pub async fn start_session(&self, template_id: &str) -> Result<CollectionSession, AgentError> {
        let template = self.catalog.get(template_id).await?;
        let mut session = CollectionSession::new(generate_id("ses"), &template);
        session.begin();
        self.persist(&session).await?;

        let id = session.session_id.clone();
        {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            sessions.insert(id.clone(), Arc::new(Mutex::new(session.clone())));
        }
        info!(
            "Started session {} for template {} ({} parameters)",
            id,
            template_id,
            session.pending.len()
        );
        Ok(session)
    }

    fn handle(&self, session_id: &str) -> Result<Arc<Mutex<CollectionSession>>, AgentError> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))
    }

    pub async fn session(&self, session_id: &str) -> Result<CollectionSession, AgentError> {
        let handle = self.handle(session_id)?;
        let session = handle.lock().await;
        Ok(session.clone())
    }

    pub async fn current_question(&self, session_id: &str) -> Result<Option<String>, AgentError> {
        Ok(self.session(session_id).await?.current_question())
    }

    pub async fn submit_answer(
        &self,
        session_id: &str,
        raw: &str,
    ) -> Result<AnswerOutcome, AgentError> {
        let handle = self.handle(session_id)?;
        let mut session = handle.lock().await;
        let outcome = session.answer(raw)?;
        match &outcome {
            AnswerOutcome::Retry {
                parameter, reason, ..
            } => debug!("Session {} re-asks {}: {}", session_id, parameter, reason),
            _ => self.persist(&session).await?,
        }
        Ok(outcome)
    }

    /// Pull `key: value` and `key=value` pairs for any pending parameter out
    /// of a free-form message
    pub async fn collect_from_freeform(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<FreeformOutcome, AgentError> {
        let handle = self.handle(session_id)?;
        let mut session = handle.lock().await;
        session.ensure_open()?;

        let mut extracted = 0;
        let mut rejected = Vec::new();
        for caps in FREEFORM_RE.captures_iter(text) {
            let key = normalize_key(&caps[1]);
            let Some(name) = session
                .pending
                .iter()
                .find(|d| normalize_key(&d.name) == key)
                .map(|d| d.name.clone())
            else {
                continue;
            };
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match session.absorb(&name, value) {
                Ok(()) => extracted += 1,
                Err(AgentError::ValidationError(reason)) => rejected.push((name, reason)),
                Err(e) => return Err(e),
            }
        }

        let next = session.resync();
        if extracted > 0 {
            self.persist(&session).await?;
        }
        debug!(
            "Session {} took {} values from free text ({} rejected)",
            session_id,
            extracted,
            rejected.len()
        );
        Ok(FreeformOutcome {
            extracted,
            rejected,
            next,
        })
    }

    pub async fn cancel(&self, session_id: &str) -> Result<(), AgentError> {
        let handle = self.handle(session_id)?;
        let mut session = handle.lock().await;
        session.cancel()?;
        self.persist(&session).await?;
        info!("Cancelled session {}", session_id);
        Ok(())
    }

    /// Start a deployment with the session's parameters, defaults filling
    /// whatever is still pending. The session is discarded on success.
    pub async fn handoff(
        &self,
        session_id: &str,
        tracker: &Arc<DeploymentTracker>,
    ) -> Result<String, AgentError> {
        let handle = self.handle(session_id)?;
        let session = handle.lock().await;
        if session.state == CollectionState::Cancelled {
            return Err(AgentError::SessionCancelled(session_id.to_string()));
        }
        let parameters = session.resolved()?;
        let deployment_id = tracker.start_async(&session.template_id, parameters).await?;
        drop(session);

        {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            sessions.remove(session_id);
        }
        self.snapshot_file(session_id).delete().await?;
        info!(
            "Session {} handed off as deployment {}",
            session_id, deployment_id
        );
        Ok(deployment_id)
    }

    /// Reload sessions persisted before a restart
    pub async fn restore(&self) -> Result<usize, AgentError> {
        if !self.sessions_dir.exists().await {
            return Ok(0);
        }
        let mut restored = 0;
        for path in self.sessions_dir.list_files().await? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file = File::new(&path);
            let snapshot: SessionSnapshot = match file.read_json().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Skipping session file {}: {}", path.display(), e);
                    continue;
                }
            };
            let template = match self.catalog.get(&snapshot.template_id).await {
                Ok(template) => template,
                Err(e) => {
                    warn!(
                        "Dropping session {}: template {} unavailable: {}",
                        snapshot.session_id, snapshot.template_id, e
                    );
                    continue;
                }
            };
            let session = CollectionSession::restore(snapshot, &template);
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            sessions
                .entry(session.session_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(session)));
            restored += 1;
        }
        info!("Restored {} collection sessions", restored);
        Ok(restored)
    }

    fn snapshot_file(&self, session_id: &str) -> File {
        self.sessions_dir.file(&format!("{}.json", session_id))
    }

    async fn persist(&self, session: &CollectionSession) -> Result<(), AgentError> {
        self.snapshot_file(&session.session_id)
            .write_json(&session.snapshot())
            .await
    }
}

/// Case and separator-insensitive key, so `Node-Count` finds `node_count`
fn normalize_key(key: &str) -> String {
    key.to_ascii_lowercase().replace('-', "_")
}
