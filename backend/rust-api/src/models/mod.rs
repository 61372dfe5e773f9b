use serde_json::{Map, Value};

/// Open-ended key/value bag exchanged with scripts. Insertion order is kept
/// so scripts see their keys back the way they wrote them.
pub type Variables = Map<String, Value>;

pub mod navigation;
pub mod peer;
pub mod player;
pub mod session;

pub use navigation::{
    ActivitySettings, ExerciseGroup, ExerciseMeta, ExerciseState, Navigation, NavigationExercise,
    NavigationMode,
};
pub use peer::{NewPeerContest, PeerContest, PeerContestStatus, PeerRole};
pub use player::{
    AutoNext, EvaluateRequest, EvaluateResponse, NavigationCommand, PlayActivityRequest,
    PlayExercisesRequest, PlayExercisesResponse, PlayerAction, PlayerActivity, PlayerExercise,
    PreviewRequest, PreviewResponse, TerminateRequest, TerminationReason,
};
pub use session::{Session, SessionChanges, Source, SourceFile, SourceKind, SUCCESS_GRADE, UNGRADED};
