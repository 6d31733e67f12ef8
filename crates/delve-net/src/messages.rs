//! Envelope catalogue and body codec.
//!
//! Every frame body is `[version: u8][postcard-encoded Envelope]`. The
//! [`Envelope`] variant is the type discriminator; exactly one payload is
//! carried per frame. Use [`encode_envelope`] and [`decode_envelope`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Current wire-protocol version. Prepended to every encoded body.
pub const PROTOCOL_VERSION: u8 = 1;

/// Number of pickaxe slots the server manages.
pub const SLOT_COUNT: u8 = 4;

/// Number of gem sockets under each pickaxe slot.
pub const SUB_SLOT_COUNT: u8 = 6;

/// Unique identifier of one owned gem.
pub type InstanceId = String;

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// Top-level wire message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Envelope {
    // --- Session (client -> server) ---
    /// Authenticate the connection.
    HandshakeRequest(HandshakeRequest),
    /// Keep-alive, sent on a fixed cadence while authenticated.
    Heartbeat(Heartbeat),
    /// Ask for the server clock.
    ServerTimeRequest,

    // --- Session (server -> client) ---
    /// Answer to [`Envelope::HandshakeRequest`].
    HandshakeResponse(HandshakeResponse),
    /// Server-side failure not tied to a specific result message.
    Error(ErrorNotice),
    /// Answer to [`Envelope::Heartbeat`].
    HeartbeatAck(ServerTime),
    /// Answer to [`Envelope::ServerTimeRequest`].
    ServerTime(ServerTime),
    /// Authoritative currency totals.
    CurrencyUpdate(CurrencyUpdate),

    // --- Pickaxe slots ---
    /// Ask for all slots.
    SlotListRequest,
    /// Upgrade one slot.
    SlotUpgradeRequest(SlotRequest),
    /// Unlock one slot.
    SlotUnlockRequest(SlotRequest),
    /// Unlock one gem socket.
    SubSlotUnlockRequest(SubSlotRequest),
    /// Full or partial slot list.
    SlotList(SlotList),
    /// Outcome of an upgrade/unlock.
    SlotResult(SlotResult),

    // --- Gems ---
    /// Ask for the complete inventory.
    GemListRequest,
    /// Put a gem into a socket.
    GemEquipRequest(GemEquipRequest),
    /// Take a gem out of a socket.
    GemUnequipRequest(SubSlotRequest),
    /// Fuse gems into a new one.
    GemSynthesisRequest(GemBatchRequest),
    /// Destroy gems for a refund.
    GemDiscardRequest(GemBatchRequest),
    /// Trade gems for gems of another kind.
    GemConversionRequest(GemConversionRequest),
    /// Complete inventory.
    GemList(GemList),
    /// Gems added to the inventory.
    GemGranted(GemList),
    /// Outcome of equip/unequip, carrying the affected slots.
    GemEquipResult(GemEquipResult),
    /// Outcome of synthesis. Consumed ids are not echoed.
    GemSynthesisResult(GemProducedResult),
    /// Outcome of discard. Discarded ids are not echoed.
    GemDiscardResult(GemDiscardResult),
    /// Outcome of conversion. Consumed ids are not echoed.
    GemConversionResult(GemProducedResult),

    // --- Missions ---
    /// Ask for the mission board.
    MissionListRequest,
    /// Claim a completed mission.
    MissionClaimRequest(MissionSlotRequest),
    /// Replace a mission with a new one.
    MissionRerollRequest(MissionSlotRequest),
    /// Claim a milestone reward.
    MilestoneClaimRequest(MilestoneClaimRequest),
    /// Report a watched advertisement.
    AdWatchedRequest(AdWatchedRequest),
    /// Complete mission board.
    MissionList(MissionList),
    /// Progress on one mission.
    MissionProgress(MissionProgress),
    /// Outcome of a claim.
    MissionClaimResult(MissionClaimResult),
    /// Outcome of a reroll.
    MissionRerollResult(MissionRerollResult),
    /// Outcome of a milestone claim.
    MilestoneClaimResult(MilestoneClaimResult),
    /// Today's count for one advertisement type.
    AdCountUpdate(AdCountUpdate),
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// Field-less tag identifying an [`Envelope`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    HandshakeRequest,
    Heartbeat,
    ServerTimeRequest,
    HandshakeResponse,
    Error,
    HeartbeatAck,
    ServerTime,
    CurrencyUpdate,
    SlotListRequest,
    SlotUpgradeRequest,
    SlotUnlockRequest,
    SubSlotUnlockRequest,
    SlotList,
    SlotResult,
    GemListRequest,
    GemEquipRequest,
    GemUnequipRequest,
    GemSynthesisRequest,
    GemDiscardRequest,
    GemConversionRequest,
    GemList,
    GemGranted,
    GemEquipResult,
    GemSynthesisResult,
    GemDiscardResult,
    GemConversionResult,
    MissionListRequest,
    MissionClaimRequest,
    MissionRerollRequest,
    MilestoneClaimRequest,
    AdWatchedRequest,
    MissionList,
    MissionProgress,
    MissionClaimResult,
    MissionRerollResult,
    MilestoneClaimResult,
    AdCountUpdate,
}

impl Envelope {
    /// Extract the routing tag without consuming the envelope.
    pub fn kind(&self) -> MessageKind {
        match self {
            Envelope::HandshakeRequest(_) => MessageKind::HandshakeRequest,
            Envelope::Heartbeat(_) => MessageKind::Heartbeat,
            Envelope::ServerTimeRequest => MessageKind::ServerTimeRequest,
            Envelope::HandshakeResponse(_) => MessageKind::HandshakeResponse,
            Envelope::Error(_) => MessageKind::Error,
            Envelope::HeartbeatAck(_) => MessageKind::HeartbeatAck,
            Envelope::ServerTime(_) => MessageKind::ServerTime,
            Envelope::CurrencyUpdate(_) => MessageKind::CurrencyUpdate,
            Envelope::SlotListRequest => MessageKind::SlotListRequest,
            Envelope::SlotUpgradeRequest(_) => MessageKind::SlotUpgradeRequest,
            Envelope::SlotUnlockRequest(_) => MessageKind::SlotUnlockRequest,
            Envelope::SubSlotUnlockRequest(_) => MessageKind::SubSlotUnlockRequest,
            Envelope::SlotList(_) => MessageKind::SlotList,
            Envelope::SlotResult(_) => MessageKind::SlotResult,
            Envelope::GemListRequest => MessageKind::GemListRequest,
            Envelope::GemEquipRequest(_) => MessageKind::GemEquipRequest,
            Envelope::GemUnequipRequest(_) => MessageKind::GemUnequipRequest,
            Envelope::GemSynthesisRequest(_) => MessageKind::GemSynthesisRequest,
            Envelope::GemDiscardRequest(_) => MessageKind::GemDiscardRequest,
            Envelope::GemConversionRequest(_) => MessageKind::GemConversionRequest,
            Envelope::GemList(_) => MessageKind::GemList,
            Envelope::GemGranted(_) => MessageKind::GemGranted,
            Envelope::GemEquipResult(_) => MessageKind::GemEquipResult,
            Envelope::GemSynthesisResult(_) => MessageKind::GemSynthesisResult,
            Envelope::GemDiscardResult(_) => MessageKind::GemDiscardResult,
            Envelope::GemConversionResult(_) => MessageKind::GemConversionResult,
            Envelope::MissionListRequest => MessageKind::MissionListRequest,
            Envelope::MissionClaimRequest(_) => MessageKind::MissionClaimRequest,
            Envelope::MissionRerollRequest(_) => MessageKind::MissionRerollRequest,
            Envelope::MilestoneClaimRequest(_) => MessageKind::MilestoneClaimRequest,
            Envelope::AdWatchedRequest(_) => MessageKind::AdWatchedRequest,
            Envelope::MissionList(_) => MessageKind::MissionList,
            Envelope::MissionProgress(_) => MessageKind::MissionProgress,
            Envelope::MissionClaimResult(_) => MessageKind::MissionClaimResult,
            Envelope::MissionRerollResult(_) => MessageKind::MissionRerollResult,
            Envelope::MilestoneClaimResult(_) => MessageKind::MilestoneClaimResult,
            Envelope::AdCountUpdate(_) => MessageKind::AdCountUpdate,
        }
    }
}

// ---------------------------------------------------------------------------
// Session payloads
// ---------------------------------------------------------------------------

/// Credentials presented once per connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeRequest {
    /// Bearer token.
    pub token: String,
    /// Stable device identifier.
    pub device_id: String,
    /// Client version string.
    pub client_version: String,
}

/// Server answer to a handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HandshakeResponse {
    /// Whether the credentials were accepted.
    pub ok: bool,
    /// Rejection reason when `ok` is false.
    pub error: Option<String>,
    /// Initial authoritative state.
    pub snapshot: Option<InitialState>,
    /// Server clock at send time, in Unix milliseconds.
    pub server_time_ms: Option<u64>,
}

/// Everything the caches need right after authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InitialState {
    pub currency: Currency,
    pub slots: Vec<ResourceSlot>,
    pub gems: Vec<GemRecord>,
    pub missions: Option<MissionList>,
}

/// Generic server error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorNotice {
    /// Machine-readable code.
    pub code: u32,
    /// Human-readable message.
    pub message: String,
}

/// Client keep-alive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    /// Client wall clock at send time, in Unix milliseconds.
    pub client_time_ms: u64,
}

/// Server clock signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ServerTime {
    /// Server wall clock, in Unix milliseconds.
    pub server_time_ms: u64,
}

/// Currency balances.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Currency {
    pub gold: u64,
    pub crystal: u64,
}

/// Currency push.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrencyUpdate {
    pub currency: Currency,
}

// ---------------------------------------------------------------------------
// Slot payloads
// ---------------------------------------------------------------------------

/// One pickaxe slot and its gem sockets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceSlot {
    /// Slot index, `0..SLOT_COUNT`.
    pub index: u8,
    pub level: u32,
    pub tier: u32,
    pub attack_power: f64,
    pub attack_speed: f64,
    pub crit_chance: f64,
    pub crit_damage: f64,
    /// Damage per second after all modifiers.
    pub dps: f64,
    pub unlocked: bool,
    /// Gem sockets, at most [`SUB_SLOT_COUNT`].
    pub sub_slots: Vec<SubSlot>,
}

/// One gem socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubSlot {
    /// Socket index, `0..SUB_SLOT_COUNT`.
    pub index: u8,
    pub unlocked: bool,
    /// Gem currently socketed here.
    pub occupant: Option<InstanceId>,
}

/// Target of a slot-level request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotRequest {
    pub slot_index: u8,
}

/// Target of a socket-level request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubSlotRequest {
    pub slot_index: u8,
    pub sub_slot_index: u8,
}

/// Slots pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SlotList {
    pub slots: Vec<ResourceSlot>,
}

/// Outcome of a slot upgrade or unlock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SlotResult {
    pub success: bool,
    pub error: Option<String>,
    /// The slot after the operation.
    pub slot: Option<ResourceSlot>,
    /// Balances after paying for the operation.
    pub currency: Option<Currency>,
}

// ---------------------------------------------------------------------------
// Gem payloads
// ---------------------------------------------------------------------------

/// Rarity grade.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GemGrade {
    Common,
    Rare,
    Epic,
    Legendary,
    Mythic,
}

/// Gem family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum GemKind {
    Ruby,
    Sapphire,
    Emerald,
    Topaz,
    Amethyst,
}

/// One owned gem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GemRecord {
    pub instance_id: InstanceId,
    pub definition_id: u32,
    pub grade: GemGrade,
    pub kind: GemKind,
    pub stat_multiplier: f64,
    /// Acquisition time, in Unix milliseconds.
    pub acquired_at: u64,
}

/// A set of gems.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GemList {
    pub gems: Vec<GemRecord>,
}

/// Put `instance_id` into a socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GemEquipRequest {
    pub slot_index: u8,
    pub sub_slot_index: u8,
    pub instance_id: InstanceId,
}

/// Gems consumed by synthesis or discard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GemBatchRequest {
    pub instance_ids: Vec<InstanceId>,
}

/// Gems consumed by a conversion and the requested kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GemConversionRequest {
    pub instance_ids: Vec<InstanceId>,
    pub target_kind: GemKind,
}

/// Outcome of equip or unequip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GemEquipResult {
    pub success: bool,
    pub error: Option<String>,
    /// Slots touched by the operation (a move can touch two).
    pub slots: Vec<ResourceSlot>,
}

/// Outcome of an operation that consumes gems and yields new ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GemProducedResult {
    pub success: bool,
    pub error: Option<String>,
    pub produced: Vec<GemRecord>,
}

/// Outcome of a discard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GemDiscardResult {
    pub success: bool,
    pub error: Option<String>,
    /// Balances after the refund.
    pub currency: Option<Currency>,
}

// ---------------------------------------------------------------------------
// Mission payloads
// ---------------------------------------------------------------------------

/// Mission lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MissionStatus {
    InProgress,
    Completed,
    Claimed,
}

/// One mission on the board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissionRecord {
    pub slot_no: u32,
    pub mission_id: u32,
    pub current_value: u64,
    pub target_value: u64,
    pub status: MissionStatus,
}

/// Board-wide counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MissionSummary {
    pub completed_count: u32,
    pub rerolls_used: u32,
    pub rerolls_free: u32,
    /// Next reset, in Unix milliseconds.
    pub reset_at: u64,
}

/// Milestone rewards unlocked by completed missions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MilestoneState {
    pub completed_count: u32,
    pub claimed_milestones: Vec<u32>,
    pub reset_at: u64,
}

/// Complete mission board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MissionList {
    pub missions: Vec<MissionRecord>,
    pub summary: MissionSummary,
    pub milestones: MilestoneState,
    /// Today's count per advertisement type.
    pub ad_counts: BTreeMap<String, u32>,
}

/// Progress on one mission. `slot_no` may be absent for server-side
/// triggers that only know the mission id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissionProgress {
    pub slot_no: Option<u32>,
    pub mission_id: u32,
    pub current_value: u64,
    pub status: MissionStatus,
}

/// Target of a mission request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissionSlotRequest {
    pub slot_no: u32,
}

/// Milestone to claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MilestoneClaimRequest {
    pub milestone: u32,
}

/// Advertisement watched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdWatchedRequest {
    pub ad_type: String,
}

/// Outcome of a mission claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MissionClaimResult {
    pub success: bool,
    pub error: Option<String>,
    pub mission: Option<MissionRecord>,
    pub currency: Option<Currency>,
}

/// Outcome of a reroll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MissionRerollResult {
    pub success: bool,
    pub error: Option<String>,
    /// The replacement mission.
    pub mission: Option<MissionRecord>,
    pub rerolls_used: u32,
    pub rerolls_free: u32,
}

/// Outcome of a milestone claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MilestoneClaimResult {
    pub success: bool,
    pub error: Option<String>,
    pub milestone: u32,
    pub currency: Option<Currency>,
}

/// Today's count for one advertisement type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdCountUpdate {
    pub ad_type: String,
    pub count_today: u32,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during body decoding.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The body was empty (no version byte).
    #[error("empty body, no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard encoding or decoding failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Encode an [`Envelope`] into a versioned frame body.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, MessageError> {
    let body = postcard::to_allocvec(envelope)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a versioned frame body into an [`Envelope`].
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, MessageError> {
    let (&version, rest) = data.split_first().ok_or(MessageError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(rest)?)
}
