use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{NewPeerContest, PeerContest, PeerContestStatus};

/// External matcher owning peer contests. The engine only registers
/// submissions, asks for the next pair to compare and records winners.
#[async_trait]
pub trait PeerService: Send + Sync {
    /// Pending contest this learner has to arbitrate, if any. Self-paired
    /// placeholders are never handed out.
    async fn get_next_copy(&self, user_id: &str, activity_id: &str) -> Result<Option<PeerContest>>;

    async fn create_match(&self, contest: NewPeerContest) -> Result<PeerContest>;

    /// Records the winner of a pending contest. Unknown or already decided
    /// contests yield `None`.
    async fn resolve_game(&self, contest_id: &str, winner_index: usize) -> Result<Option<PeerContest>>;
}

#[derive(Default)]
pub struct InMemoryPeerService {
    contests: RwLock<Vec<PeerContest>>,
}

impl InMemoryPeerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contests(&self) -> Vec<PeerContest> {
        self.contests.read().await.clone()
    }

    /// Stands in for the external matcher: gives a placeholder contest a real
    /// opponent and a corrector.
    pub async fn assign_corrector(
        &self,
        contest_id: &str,
        opponent_id: &str,
        opponent_session_id: &str,
        corrector_id: &str,
    ) -> Result<PeerContest> {
        let mut contests = self.contests.write().await;
        let contest = contests
            .iter_mut()
            .find(|contest| contest.id == contest_id)
            .ok_or_else(|| anyhow!("Peer contest {} not found", contest_id))?;

        contest.player2_id = opponent_id.to_string();
        contest.player2_session_id = opponent_session_id.to_string();
        contest.corrector_id = corrector_id.to_string();
        contest.updated_at = Utc::now();
        Ok(contest.clone())
    }
}

#[async_trait]
impl PeerService for InMemoryPeerService {
    async fn get_next_copy(&self, user_id: &str, activity_id: &str) -> Result<Option<PeerContest>> {
        let contests = self.contests.read().await;
        Ok(contests
            .iter()
            .find(|contest| {
                contest.corrector_id == user_id
                    && contest.activity_id == activity_id
                    && contest.status == PeerContestStatus::Next
                    && !contest.is_self_paired()
            })
            .cloned())
    }

    async fn create_match(&self, contest: NewPeerContest) -> Result<PeerContest> {
        let contest = contest.into_contest(Uuid::new_v4().to_string());
        self.contests.write().await.push(contest.clone());
        Ok(contest)
    }

    async fn resolve_game(&self, contest_id: &str, winner_index: usize) -> Result<Option<PeerContest>> {
        let mut contests = self.contests.write().await;
        let Some(slot) = contests
            .iter_mut()
            .find(|contest| contest.id == contest_id && contest.status == PeerContestStatus::Next)
        else {
            return Ok(None);
        };

        let resolved = slot
            .clone()
            .with_winner(winner_index)
            .ok_or_else(|| anyhow!("Invalid winner index {} for contest {}", winner_index, contest_id))?;
        *slot = resolved.clone();
        Ok(Some(resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placeholder_contests_are_not_offered_for_comparison() {
        let service = InMemoryPeerService::new();
        let contest = service
            .create_match(NewPeerContest::self_paired("act", "alice", "s-alice"))
            .await
            .unwrap();

        assert!(service.get_next_copy("alice", "act").await.unwrap().is_none());

        service
            .assign_corrector(&contest.id, "bob", "s-bob", "carol")
            .await
            .unwrap();
        let pending = service.get_next_copy("carol", "act").await.unwrap().unwrap();
        assert_eq!(pending.player1_session_id, "s-alice");
        assert_eq!(pending.player2_session_id, "s-bob");
    }

    #[tokio::test]
    async fn resolved_contest_leaves_the_queue() {
        let service = InMemoryPeerService::new();
        let contest = service
            .create_match(NewPeerContest::self_paired("act", "alice", "s-alice"))
            .await
            .unwrap();
        service
            .assign_corrector(&contest.id, "bob", "s-bob", "carol")
            .await
            .unwrap();

        let resolved = service.resolve_game(&contest.id, 0).await.unwrap().unwrap();
        assert_eq!(resolved.winner_id.as_deref(), Some("alice"));
        assert!(service.get_next_copy("carol", "act").await.unwrap().is_none());
        assert!(service.resolve_game("missing", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn decided_contest_keeps_its_winner() {
        let service = InMemoryPeerService::new();
        let contest = service
            .create_match(NewPeerContest::self_paired("act", "alice", "s-alice"))
            .await
            .unwrap();
        service
            .assign_corrector(&contest.id, "bob", "s-bob", "carol")
            .await
            .unwrap();

        service.resolve_game(&contest.id, 1).await.unwrap().unwrap();
        assert!(service.resolve_game(&contest.id, 0).await.unwrap().is_none());

        let stored = service.contests().await;
        assert_eq!(stored[0].winner_id.as_deref(), Some("bob"));
        assert_eq!(stored[0].status, PeerContestStatus::Done);
    }
}
