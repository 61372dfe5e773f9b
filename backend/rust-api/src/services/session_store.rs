use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{PlayerError, PlayerResult};
use crate::models::{Session, SessionChanges};
use crate::utils::retry::{retry_async_with_config, RetryConfig};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<Session>;

    /// Inserts every session or none of them.
    async fn create_many(&self, sessions: Vec<Session>) -> Result<Vec<Session>>;

    async fn find_by_id(&self, id: &str, with_parent: bool) -> Result<Option<Session>>;

    async fn update(&self, id: &str, changes: SessionChanges) -> Result<Option<Session>>;

    /// Applies `changes` only if the stored row still carries `expected_version`.
    /// `Ok(None)` reports a lost race (or a row that vanished).
    async fn update_versioned(
        &self,
        id: &str,
        expected_version: i64,
        changes: SessionChanges,
    ) -> Result<Option<Session>>;

    /// Children of an activity session, in creation order.
    async fn find_all_with_parent(&self, parent_id: &str) -> Result<Vec<Session>>;

    async fn find_exercise_session_by_activity_id(
        &self,
        activity_id: &str,
        session_id: &str,
    ) -> Result<Option<Session>>;

    /// Activity session a learner already owns for a given activity resource.
    async fn find_user_activity_session(
        &self,
        user_id: &str,
        resource: &str,
    ) -> Result<Option<Session>>;

    async fn ping(&self) -> Result<()>;
}

#[derive(Debug)]
struct VersionConflict;

/// Read-modify-write of one row with optimistic concurrency: the transition is
/// recomputed from the freshest copy until a versioned write lands.
pub async fn update_with_retry<F>(
    store: &dyn SessionStore,
    id: &str,
    transition: F,
) -> PlayerResult<Session>
where
    F: Fn(&Session) -> PlayerResult<SessionChanges> + Sync,
{
    let transition = &transition;
    let attempt = move || async move {
        let current = match store.find_by_id(id, false).await {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(Err(PlayerError::not_found(format!("Session {} not found", id)))),
            Err(err) => return Ok(Err(PlayerError::from(err))),
        };

        let changes = match transition(&current) {
            Ok(changes) => changes,
            Err(err) => return Ok(Err(err)),
        };
        if changes.is_empty() {
            return Ok(Ok(current));
        }

        match store.update_versioned(id, current.version, changes).await {
            Ok(Some(updated)) => Ok(Ok(updated)),
            Ok(None) => {
                tracing::debug!("Version conflict on session {} (v{})", id, current.version);
                Err(VersionConflict)
            }
            Err(err) => Ok(Err(PlayerError::from(err))),
        }
    };

    match retry_async_with_config(RetryConfig::version_conflict(), attempt).await {
        Ok(result) => result,
        Err(VersionConflict) => Err(PlayerError::Internal(anyhow!(
            "Session {} kept changing concurrently",
            id
        ))),
    }
}

/// Single-process store keeping rows in memory.
#[derive(Default)]
pub struct InMemorySessionStore {
    rows: RwLock<HashMap<String, (u64, Session)>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    async fn insert_all(&self, sessions: Vec<Session>) -> Result<Vec<Session>> {
        let mut rows = self.rows.write().await;
        if let Some(duplicate) = sessions.iter().find(|session| rows.contains_key(&session.id)) {
            return Err(anyhow!("Duplicate session id {}", duplicate.id));
        }

        let mut sequence = rows.len() as u64;
        for session in &sessions {
            sequence += 1;
            let mut stored = session.clone();
            stored.parent = None;
            rows.insert(session.id.clone(), (sequence, stored));
        }
        Ok(sessions)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: Session) -> Result<Session> {
        let mut created = self.insert_all(vec![session]).await?;
        created.pop().ok_or_else(|| anyhow!("Session insert returned nothing"))
    }

    async fn create_many(&self, sessions: Vec<Session>) -> Result<Vec<Session>> {
        self.insert_all(sessions).await
    }

    async fn find_by_id(&self, id: &str, with_parent: bool) -> Result<Option<Session>> {
        let rows = self.rows.read().await;
        let Some((_, session)) = rows.get(id) else {
            return Ok(None);
        };

        let mut session = session.clone();
        if with_parent {
            session.parent = session
                .parent_id
                .as_ref()
                .and_then(|parent_id| rows.get(parent_id))
                .map(|(_, parent)| Box::new(parent.clone()));
        }
        Ok(Some(session))
    }

    async fn update(&self, id: &str, changes: SessionChanges) -> Result<Option<Session>> {
        let mut rows = self.rows.write().await;
        Ok(rows.get_mut(id).map(|(_, session)| {
            changes.apply_to(session);
            session.clone()
        }))
    }

    async fn update_versioned(
        &self,
        id: &str,
        expected_version: i64,
        changes: SessionChanges,
    ) -> Result<Option<Session>> {
        let mut rows = self.rows.write().await;
        Ok(match rows.get_mut(id) {
            Some((_, session)) if session.version == expected_version => {
                changes.apply_to(session);
                Some(session.clone())
            }
            _ => None,
        })
    }

    async fn find_all_with_parent(&self, parent_id: &str) -> Result<Vec<Session>> {
        let rows = self.rows.read().await;
        let mut children: Vec<&(u64, Session)> = rows
            .values()
            .filter(|(_, session)| session.parent_id.as_deref() == Some(parent_id))
            .collect();
        children.sort_by_key(|(sequence, _)| *sequence);
        Ok(children.into_iter().map(|(_, session)| session.clone()).collect())
    }

    async fn find_exercise_session_by_activity_id(
        &self,
        activity_id: &str,
        session_id: &str,
    ) -> Result<Option<Session>> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(session_id)
            .filter(|(_, session)| session.parent_id.as_deref() == Some(activity_id))
            .map(|(_, session)| session.clone()))
    }

    async fn find_user_activity_session(
        &self,
        user_id: &str,
        resource: &str,
    ) -> Result<Option<Session>> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|(_, session)| {
                session.is_activity()
                    && session.parent_id.is_none()
                    && session.is_owned_by(user_id)
                    && session.source.resource.as_deref() == Some(resource)
            })
            .min_by_key(|(sequence, _)| *sequence)
            .map(|(_, session)| session.clone()))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
