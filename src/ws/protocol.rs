//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::grid::Cell;
use crate::rules::{Maneuver, RulesetId, WaitTrigger};

/// Body posture; constrains movement and penalizes attack and defense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Posture {
    Standing,
    Crouching,
    Kneeling,
    Prone,
}

impl Default for Posture {
    fn default() -> Self {
        Self::Standing
    }
}

/// Conditions a combatant can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Stunned,
    Unconscious,
    Surrendered,
    Grappled,
}

/// Targetable body locations (contested-defense ruleset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitLocation {
    Torso,
    Vitals,
    Skull,
    Face,
    Arm,
    Leg,
    Hand,
    Foot,
}

impl Default for HitLocation {
    fn default() -> Self {
        Self::Torso
    }
}

/// Active defense choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefenseKind {
    Dodge,
    Parry,
    Block,
    /// Decline to defend (take the hit).
    None,
}

/// Equipment handling actions for the Ready maneuver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyKind {
    Draw,
    Sheathe,
    Reload,
    Prepare,
    Pickup,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Attach (or re-attach) to a match this player belongs to.
    JoinMatch {
        match_id: Option<Uuid>,
    },

    // ---- contested-defense ruleset turn actions ----
    SelectManeuver {
        maneuver: Maneuver,
    },
    MoveStep {
        to: Cell,
    },
    Rotate {
        clockwise: bool,
    },
    ConfirmMovement,
    UndoMovement,
    SkipMovement,
    Attack {
        target_id: Uuid,
        weapon: usize,
        hit_location: Option<HitLocation>,
        /// Deceptive attack levels: each level is -2 to hit, -1 to the
        /// target's defense.
        deceptive: u8,
        /// Trade accuracy for one extra attack this turn.
        rapid_strike: bool,
    },
    Defend {
        defense: DefenseKind,
        /// Weapon index when parrying.
        weapon: Option<usize>,
        retreat: bool,
        /// Dodge and drop: extra bonus, ends prone.
        drop_prone: bool,
    },
    ReadyAction {
        action: ReadyKind,
        weapon: Option<usize>,
    },
    EnterCloseCombat {
        target_id: Uuid,
    },
    ExitCloseCombat,
    Grapple,
    BreakFree,
    /// Answer an opponent's close-combat exit: follow them or let go.
    CloseCombatResponse {
        follow: bool,
    },
    AimTarget {
        target_id: Uuid,
    },
    EvaluateTarget {
        target_id: Uuid,
    },
    SetWaitTrigger {
        trigger: WaitTrigger,
    },
    ChangePosture {
        posture: Posture,
    },

    // ---- DC-based ruleset turn actions ----
    Pf2Stride {
        to: Cell,
    },
    Pf2Step {
        to: Cell,
    },
    Pf2DropProne,
    Pf2Stand,
    Pf2Strike {
        target_id: Uuid,
        weapon: usize,
    },
    Pf2RaiseShield,
    Pf2CastSpell {
        spell: usize,
        target_id: Uuid,
    },
    Pf2Trip {
        target_id: Uuid,
    },
    Pf2Feint {
        target_id: Uuid,
    },
    Pf2Demoralize {
        target_id: Uuid,
    },
    /// Resolve an offered reaction window.
    Pf2Reaction {
        accept: bool,
    },

    // ---- shared ----
    EndTurn,
    Surrender,
    Ping {
        t: u64,
    },
    LeaveMatch,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        user_id: Uuid,
        server_time: u64,
    },

    /// Confirmation of match join
    MatchJoined {
        match_id: Uuid,
        ruleset: RulesetId,
        players: Vec<ParticipantInfo>,
    },

    PlayerJoined {
        player: ParticipantInfo,
    },

    PlayerLeft {
        user_id: Uuid,
        reason: String,
    },

    /// Full authoritative state, sent after every committed mutation.
    MatchState {
        snapshot: crate::game::snapshot::MatchSnapshot,
    },

    /// Discrete presentation event accompanying a state change.
    VisualEffect {
        effect: EffectKind,
        actor_id: Uuid,
        target_id: Option<Uuid>,
        position: WorldPos,
        magnitude: i32,
    },

    /// A human-in-the-loop decision is required.
    PendingAction {
        /// Only this player should act on the prompt.
        to: Uuid,
        prompt: PendingPrompt,
    },

    MatchEnd {
        winner_user_id: Option<Uuid>,
    },

    /// Error addressed to a single player; the session layer drops errors
    /// meant for other players on the same broadcast.
    Error {
        to: Uuid,
        code: String,
        message: String,
    },

    Pong {
        t: u64,
    },
}

/// Participant identity for lobby/join messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub display_name: String,
    pub is_bot: bool,
    pub connected: bool,
}

/// Continuous position for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldPos {
    pub x: f32,
    pub y: f32,
}

/// Kinds of visual effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    Damage,
    Miss,
    Defend,
    Grapple,
    CloseCombat,
}

/// Prompts that block on a specific player's choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingPrompt {
    /// Your close-combat opponent is stepping away: let go or follow.
    OpponentExitingCloseCombat {
        leaver: Uuid,
    },
    /// A reaction window is open against the provoking combatant.
    ReactionAvailable {
        provoker: Uuid,
    },
    /// An attack awaits your defense choice.
    DefenseRequired {
        attacker: Uuid,
        deadline_ms: u64,
    },
}
