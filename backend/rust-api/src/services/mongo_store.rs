use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, Document};
use mongodb::options::ReturnDocument;
use mongodb::{Client, Collection, Database};
use uuid::Uuid;

use crate::metrics::track_db_operation;
use crate::models::{NewPeerContest, PeerContest, PeerContestStatus, Session, SessionChanges};

use super::peer_service::PeerService;
use super::session_store::SessionStore;

const SESSIONS: &str = "player_sessions";
const PEER_CONTESTS: &str = "peer_contests";

pub struct MongoSessionStore {
    client: Client,
    database: Database,
    sessions: Collection<Session>,
}

impl MongoSessionStore {
    pub fn new(client: Client, database: &str) -> Self {
        let database = client.database(database);
        let sessions = database.collection(SESSIONS);
        Self {
            client,
            database,
            sessions,
        }
    }

    fn update_document(changes: &SessionChanges) -> Result<Document> {
        let mut set = Document::new();
        if let Some(envid) = &changes.envid {
            set.insert("envid", envid.as_str());
        }
        if let Some(variables) = &changes.variables {
            set.insert("variables", to_bson(variables)?);
        }
        if let Some(variables) = &changes.source_variables {
            set.insert("source.variables", to_bson(variables)?);
        }
        if let Some(grade) = changes.grade {
            set.insert("grade", grade);
        }
        if let Some(attempts) = changes.attempts {
            set.insert("attempts", attempts as i64);
        }
        if let Some(started_at) = changes.started_at {
            set.insert("startedAt", to_bson(&started_at)?);
        }
        if let Some(last_graded_at) = changes.last_graded_at {
            set.insert("lastGradedAt", to_bson(&last_graded_at)?);
        }
        if let Some(is_built) = changes.is_built {
            set.insert("isBuilt", is_built);
        }
        set.insert("updatedAt", to_bson(&Utc::now())?);

        Ok(doc! { "$set": set, "$inc": { "version": 1_i64 } })
    }

    async fn find_one_and_apply(
        &self,
        filter: Document,
        changes: &SessionChanges,
    ) -> Result<Option<Session>> {
        let update = Self::update_document(changes)?;
        self.sessions
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .await
            .context("Failed to update player session")
    }
}

#[async_trait]
impl SessionStore for MongoSessionStore {
    async fn create(&self, session: Session) -> Result<Session> {
        track_db_operation("insert_one", SESSIONS, async {
            self.sessions
                .insert_one(&session)
                .await
                .context("Failed to insert player session")?;
            Ok(session)
        })
        .await
    }

    async fn create_many(&self, sessions: Vec<Session>) -> Result<Vec<Session>> {
        if sessions.is_empty() {
            return Ok(sessions);
        }

        track_db_operation("insert_many", SESSIONS, async {
            let mut transaction = self
                .client
                .start_session()
                .await
                .context("Failed to start MongoDB session")?;
            transaction
                .start_transaction()
                .await
                .context("Failed to start transaction")?;

            let inserted = self
                .sessions
                .insert_many(&sessions)
                .session(&mut transaction)
                .await;

            if let Err(err) = inserted {
                if let Err(abort_err) = transaction.abort_transaction().await {
                    tracing::warn!("Failed to abort session transaction: {}", abort_err);
                }
                return Err(anyhow!(err).context("Failed to insert player sessions"));
            }

            transaction
                .commit_transaction()
                .await
                .context("Failed to commit player sessions")?;
            Ok(sessions)
        })
        .await
    }

    async fn find_by_id(&self, id: &str, with_parent: bool) -> Result<Option<Session>> {
        let session = track_db_operation("find_one", SESSIONS, async {
            self.sessions
                .find_one(doc! { "_id": id })
                .await
                .context("Failed to query player session")
        })
        .await?;

        let Some(mut session) = session else {
            return Ok(None);
        };

        if with_parent {
            if let Some(parent_id) = session.parent_id.clone() {
                session.parent = self
                    .sessions
                    .find_one(doc! { "_id": parent_id.as_str() })
                    .await
                    .context("Failed to query parent session")?
                    .map(Box::new);
            }
        }
        Ok(Some(session))
    }

    async fn update(&self, id: &str, changes: SessionChanges) -> Result<Option<Session>> {
        track_db_operation(
            "update",
            SESSIONS,
            self.find_one_and_apply(doc! { "_id": id }, &changes),
        )
        .await
    }

    async fn update_versioned(
        &self,
        id: &str,
        expected_version: i64,
        changes: SessionChanges,
    ) -> Result<Option<Session>> {
        track_db_operation(
            "update_versioned",
            SESSIONS,
            self.find_one_and_apply(doc! { "_id": id, "version": expected_version }, &changes),
        )
        .await
    }

    async fn find_all_with_parent(&self, parent_id: &str) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = track_db_operation("find", SESSIONS, async {
            let cursor = self
                .sessions
                .find(doc! { "parentId": parent_id })
                .await
                .context("Failed to query child sessions")?;
            cursor
                .try_collect()
                .await
                .context("Failed to iterate child sessions")
        })
        .await?;

        sessions.sort_by_key(|session| session.created_at);
        Ok(sessions)
    }

    async fn find_exercise_session_by_activity_id(
        &self,
        activity_id: &str,
        session_id: &str,
    ) -> Result<Option<Session>> {
        track_db_operation("find_one", SESSIONS, async {
            self.sessions
                .find_one(doc! { "_id": session_id, "parentId": activity_id })
                .await
                .context("Failed to query exercise session")
        })
        .await
    }

    async fn find_user_activity_session(
        &self,
        user_id: &str,
        resource: &str,
    ) -> Result<Option<Session>> {
        track_db_operation("find_one", SESSIONS, async {
            self.sessions
                .find_one(doc! {
                    "userId": user_id,
                    "parentId": null,
                    "source.kind": "activity",
                    "source.resource": resource,
                })
                .sort(doc! { "createdAt": 1 })
                .await
                .context("Failed to query activity session")
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .context("MongoDB ping failed")?;
        Ok(())
    }
}

pub struct MongoPeerService {
    contests: Collection<PeerContest>,
}

impl MongoPeerService {
    pub fn new(database: &Database) -> Self {
        Self {
            contests: database.collection(PEER_CONTESTS),
        }
    }
}

#[async_trait]
impl PeerService for MongoPeerService {
    async fn get_next_copy(&self, user_id: &str, activity_id: &str) -> Result<Option<PeerContest>> {
        track_db_operation("find_one", PEER_CONTESTS, async {
            self.contests
                .find_one(doc! {
                    "correctorId": user_id,
                    "activityId": activity_id,
                    "status": PeerContestStatus::Next.as_str(),
                    "$expr": { "$ne": ["$player1Id", "$player2Id"] },
                })
                .sort(doc! { "level": 1, "createdAt": 1 })
                .await
                .context("Failed to query pending peer contest")
        })
        .await
    }

    async fn create_match(&self, contest: NewPeerContest) -> Result<PeerContest> {
        let contest = contest.into_contest(Uuid::new_v4().to_string());
        track_db_operation("insert_one", PEER_CONTESTS, async {
            self.contests
                .insert_one(&contest)
                .await
                .context("Failed to insert peer contest")?;
            Ok(contest)
        })
        .await
    }

    async fn resolve_game(&self, contest_id: &str, winner_index: usize) -> Result<Option<PeerContest>> {
        track_db_operation("resolve", PEER_CONTESTS, async {
            let pending = doc! { "_id": contest_id, "status": "next" };
            let Some(contest) = self
                .contests
                .find_one(pending.clone())
                .await
                .context("Failed to query peer contest")?
            else {
                return Ok(None);
            };

            let resolved = contest
                .with_winner(winner_index)
                .ok_or_else(|| anyhow!("Invalid winner index {} for contest {}", winner_index, contest_id))?;
            // A concurrent resolution wins; this one reports the contest as decided.
            let result = self
                .contests
                .replace_one(pending, &resolved)
                .await
                .context("Failed to store peer contest winner")?;
            if result.matched_count == 0 {
                return Ok(None);
            }
            Ok(Some(resolved))
        })
        .await
    }
}
