use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role an exercise group plays in a peer-navigation activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Primary exercise every learner answers first.
    Exercise,
    /// Compares two prior answers and designates a winner.
    Comparison,
    /// Filler shown while nothing else is available.
    Waiting,
    /// Pool worked through while waiting for a comparison.
    Training,
}

impl PeerRole {
    /// Compatibility shim for activities authored before groups carried an
    /// explicit role: the role is inferred from the (french) group name.
    pub fn from_group_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "exercice" | "exercise" => Some(PeerRole::Exercise),
            "comparaison" | "comparison" => Some(PeerRole::Comparison),
            "attente" | "waiting" => Some(PeerRole::Waiting),
            "entrainement" | "entraînement" | "training" => Some(PeerRole::Training),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerContestStatus {
    /// Waiting for an opponent or for its corrector to compare.
    Next,
    Done,
}

impl PeerContestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerContestStatus::Next => "next",
            PeerContestStatus::Done => "done",
        }
    }
}

/// One pairwise comparison game between two learners' answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerContest {
    #[serde(rename = "_id")]
    pub id: String,
    pub activity_id: String,
    pub level: u32,
    pub corrector_id: String,
    pub player1_id: String,
    pub player1_session_id: String,
    pub player2_id: String,
    pub player2_session_id: String,
    #[serde(default)]
    pub winner_id: Option<String>,
    #[serde(default)]
    pub winner_session_id: Option<String>,
    pub status: PeerContestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PeerContest {
    /// Both player slots hold the same learner until the peer service finds
    /// a genuine opponent.
    pub fn is_self_paired(&self) -> bool {
        self.player1_id == self.player2_id
    }

    /// Applies a winner; index 0 designates player 1 and index 1 player 2.
    /// Other indices designate nobody.
    pub fn with_winner(mut self, winner_index: usize) -> Option<Self> {
        let (winner_id, winner_session_id) = match winner_index {
            0 => (self.player1_id.clone(), self.player1_session_id.clone()),
            1 => (self.player2_id.clone(), self.player2_session_id.clone()),
            _ => return None,
        };
        self.winner_id = Some(winner_id);
        self.winner_session_id = Some(winner_session_id);
        self.status = PeerContestStatus::Done;
        self.updated_at = Utc::now();
        Some(self)
    }
}

/// Contest registration handed to the peer service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPeerContest {
    pub activity_id: String,
    pub level: u32,
    pub corrector_id: String,
    pub player1_id: String,
    pub player1_session_id: String,
    pub player2_id: String,
    pub player2_session_id: String,
    pub status: PeerContestStatus,
}

impl NewPeerContest {
    /// Placeholder pairing registered when a learner solves the primary exercise.
    pub fn self_paired(activity_id: &str, user_id: &str, session_id: &str) -> Self {
        Self {
            activity_id: activity_id.to_string(),
            level: 0,
            corrector_id: user_id.to_string(),
            player1_id: user_id.to_string(),
            player1_session_id: session_id.to_string(),
            player2_id: user_id.to_string(),
            player2_session_id: session_id.to_string(),
            status: PeerContestStatus::Next,
        }
    }

    pub fn into_contest(self, id: String) -> PeerContest {
        let now = Utc::now();
        PeerContest {
            id,
            activity_id: self.activity_id,
            level: self.level,
            corrector_id: self.corrector_id,
            player1_id: self.player1_id,
            player1_session_id: self.player1_session_id,
            player2_id: self.player2_id,
            player2_session_id: self.player2_session_id,
            winner_id: None,
            winner_session_id: None,
            status: self.status,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_group_names_map_to_roles() {
        assert_eq!(PeerRole::from_group_name("Exercice"), Some(PeerRole::Exercise));
        assert_eq!(PeerRole::from_group_name(" comparaison "), Some(PeerRole::Comparison));
        assert_eq!(PeerRole::from_group_name("ATTENTE"), Some(PeerRole::Waiting));
        assert_eq!(PeerRole::from_group_name("entraînement"), Some(PeerRole::Training));
        assert_eq!(PeerRole::from_group_name("bonus"), None);
    }

    #[test]
    fn self_paired_contest_uses_submitter_everywhere() {
        let contest = NewPeerContest::self_paired("act", "learner", "s1").into_contest("c1".into());
        assert!(contest.is_self_paired());
        assert_eq!(contest.status, PeerContestStatus::Next);
        assert_eq!(contest.player1_session_id, contest.player2_session_id);
    }

    #[test]
    fn winner_index_selects_player() {
        let mut contest = NewPeerContest::self_paired("act", "a", "sa").into_contest("c1".into());
        contest.player2_id = "b".into();
        contest.player2_session_id = "sb".into();

        assert!(contest.clone().with_winner(2).is_none());

        let resolved = contest.with_winner(1).unwrap();
        assert_eq!(resolved.winner_id.as_deref(), Some("b"));
        assert_eq!(resolved.winner_session_id.as_deref(), Some("sb"));
        assert_eq!(resolved.status, PeerContestStatus::Done);
    }
}
