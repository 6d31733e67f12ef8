//! Message routing: decode inbound frames and apply them to the caches.
//!
//! The [`Router`] owns every cache and is the only code that mutates them.
//! It runs on the single consumer context: [`Router::handle_event`] is fed
//! from the transport's dispatch queue in receive order and never runs
//! concurrently with itself (`&mut self`).
//!
//! A message that fails to decode or to apply is logged with its kind and
//! dropped; routing continues with the next frame.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use delve_net::messages::{
    Currency, Envelope, GemDiscardResult, GemProducedResult, InitialState, InstanceId,
    MessageError, MessageKind, MissionList, SLOT_COUNT, decode_envelope,
};
use delve_net::session::ServerHello;
use delve_net::transport::{DisconnectReason, TransportEvent};

use crate::cache::{Cache, CacheView};
use crate::clock::ClockOffset;
use crate::correlation::{OperationKind, PendingCorrelations};
use crate::inventory::Inventory;
use crate::missions::MissionBoard;
use crate::notify::{Correlated, Notifications, SessionEvent};
use crate::slots::SlotTable;

/// Why one inbound message was dropped.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("undecodable frame: {0}")]
    Decode(#[from] MessageError),
    #[error("client-to-server message {0:?} received from server")]
    Unexpected(MessageKind),
    #[error("slot index {0} out of range")]
    SlotIndex(u8),
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),
}

/// Read handles onto every cache.
#[derive(Debug, Clone)]
pub struct CacheViews {
    pub slots: CacheView<SlotTable>,
    pub inventory: CacheView<Inventory>,
    pub missions: CacheView<MissionBoard>,
    pub clock: CacheView<ClockOffset>,
    pub wallet: CacheView<Currency>,
}

/// Counters for routed and dropped messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub dropped: u64,
}

/// Demultiplexes envelopes onto the caches and notification feeds.
pub struct Router {
    slots: Cache<SlotTable>,
    inventory: Cache<Inventory>,
    missions: Cache<MissionBoard>,
    clock: Cache<ClockOffset>,
    wallet: Cache<Currency>,
    correlations: PendingCorrelations,
    notifications: Arc<Notifications>,
    stats: RouterStats,
}

impl Router {
    pub fn new(correlations: PendingCorrelations, notifications: Arc<Notifications>) -> Self {
        Self {
            slots: Cache::new(SlotTable::default()),
            inventory: Cache::new(Inventory::default()),
            missions: Cache::new(MissionBoard::default()),
            clock: Cache::new(ClockOffset::default()),
            wallet: Cache::new(Currency::default()),
            correlations,
            notifications,
            stats: RouterStats::default(),
        }
    }

    pub fn views(&self) -> CacheViews {
        CacheViews {
            slots: self.slots.view(),
            inventory: self.inventory.view(),
            missions: self.missions.view(),
            clock: self.clock.view(),
            wallet: self.wallet.view(),
        }
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Process one transport event.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => tracing::debug!("transport connected"),
            TransportEvent::Frame(body) => {
                self.route_frame(&body);
            }
            TransportEvent::Disconnected(reason) => self.on_disconnected(reason),
        }
    }

    /// Decode and route one frame body. Returns whether it was applied.
    pub fn route_frame(&mut self, body: &[u8]) -> bool {
        match decode_envelope(body) {
            Ok(envelope) => self.route(envelope),
            Err(e) => {
                self.stats.dropped += 1;
                let e = RouteError::from(e);
                tracing::warn!(error = %e, len = body.len(), "dropping frame");
                false
            }
        }
    }

    /// Route one decoded envelope. Returns whether it was applied.
    pub fn route(&mut self, envelope: Envelope) -> bool {
        let kind = envelope.kind();
        match contain_panic(|| self.dispatch(envelope)) {
            Ok(()) => {
                self.stats.routed += 1;
                tracing::trace!(?kind, "routed");
                true
            }
            Err(e) => {
                self.stats.dropped += 1;
                tracing::warn!(?kind, error = %e, "dropping message");
                false
            }
        }
    }

    /// Seed the caches from a successful handshake, then announce it.
    pub fn apply_server_hello(&mut self, hello: ServerHello) {
        if let Some(snapshot) = hello.snapshot {
            self.apply_initial_state(snapshot);
        }
        if let Some(server_ms) = hello.server_time_ms {
            self.sync_clock(server_ms);
        }
        self.notifications.session.publish(SessionEvent::Authenticated);
    }

    /// Report a rejected handshake to subscribers.
    pub fn report_auth_failure(&self, reason: impl Into<String>) {
        self.notifications
            .session
            .publish(SessionEvent::AuthenticationFailed(reason.into()));
    }

    fn on_disconnected(&mut self, reason: DisconnectReason) {
        let dropped = self.correlations.clear();
        if dropped > 0 {
            tracing::info!(dropped, "abandoning in-flight operations");
        }
        tracing::info!(%reason, "disconnected");
        self.notifications
            .session
            .publish(SessionEvent::Disconnected(reason));
    }

    fn dispatch(&mut self, envelope: Envelope) -> Result<(), RouteError> {
        match envelope {
            Envelope::HandshakeResponse(response) => {
                // A repeated handshake answer still carries authoritative state.
                if response.ok
                    && let Some(snapshot) = response.snapshot
                {
                    self.apply_initial_state(snapshot);
                }
            }
            Envelope::Error(notice) => {
                tracing::warn!(code = notice.code, message = %notice.message, "server error");
                self.notifications.session.publish(SessionEvent::ServerError {
                    code: notice.code,
                    message: notice.message,
                });
            }
            Envelope::HeartbeatAck(time) | Envelope::ServerTime(time) => {
                self.sync_clock(time.server_time_ms);
            }
            Envelope::CurrencyUpdate(update) => self.set_currency(update.currency),

            Envelope::SlotList(list) => {
                let changed = self.slots.update(|table| {
                    table.apply_snapshot(list.slots);
                });
                if changed {
                    self.slots_changed();
                }
            }
            Envelope::SlotResult(result) => {
                if let Some(slot) = &result.slot
                    && slot.index >= SLOT_COUNT
                {
                    return Err(RouteError::SlotIndex(slot.index));
                }
                if result.success {
                    if let Some(slot) = result.slot.clone() {
                        let changed = self.slots.update(|table| {
                            table.apply_single_result(slot);
                        });
                        if changed {
                            self.slots_changed();
                        }
                    }
                    if let Some(currency) = result.currency {
                        self.set_currency(currency);
                    }
                } else {
                    log_failure(MessageKind::SlotResult, result.error.as_deref());
                }
                self.notifications.slot_results.publish(result);
            }

            Envelope::GemList(list) => {
                let changed = self.slots.read(|table| {
                    self.inventory
                        .update(|inventory| inventory.apply_list(list.gems, table))
                });
                if changed {
                    self.notifications.gems_changed.publish(());
                }
            }
            Envelope::GemGranted(list) => {
                let granted = list.gems.clone();
                if self
                    .inventory
                    .update(|inventory| inventory.apply_grant(list.gems))
                {
                    self.notifications.gems_changed.publish(());
                }
                self.notifications.gems_granted.publish(granted);
            }
            Envelope::GemEquipResult(result) => {
                if result.success {
                    let changed = self.slots.update(|table| {
                        table.apply_snapshot(result.slots.iter().cloned());
                    });
                    if changed {
                        self.slots_changed();
                    }
                } else {
                    log_failure(MessageKind::GemEquipResult, result.error.as_deref());
                }
                self.notifications.gem_equip.publish(result);
            }
            Envelope::GemSynthesisResult(result) => {
                let correlated = self.apply_produced(OperationKind::Synthesis, result);
                self.notifications.gem_synthesis.publish(correlated);
            }
            Envelope::GemConversionResult(result) => {
                let correlated = self.apply_produced(OperationKind::Conversion, result);
                self.notifications.gem_conversion.publish(correlated);
            }
            Envelope::GemDiscardResult(result) => {
                let correlated = self.apply_discard(result);
                self.notifications.gem_discard.publish(correlated);
            }

            Envelope::MissionList(list) => self.set_missions(list),
            Envelope::MissionProgress(progress) => {
                let mut resolved = false;
                let changed = self
                    .missions
                    .update(|board| resolved = board.apply_progress(&progress));
                if resolved {
                    if changed {
                        self.notifications.missions_changed.publish(());
                    }
                    self.notifications.mission_progress.publish(progress);
                }
            }
            Envelope::MissionClaimResult(result) => {
                if result.success {
                    if let Some(mission) = result.mission.clone() {
                        self.update_missions(|board| board.apply_mission(mission));
                    }
                    if let Some(currency) = result.currency {
                        self.set_currency(currency);
                    }
                } else {
                    log_failure(MessageKind::MissionClaimResult, result.error.as_deref());
                }
                self.notifications.mission_claim.publish(result);
            }
            Envelope::MissionRerollResult(result) => {
                if result.success {
                    let mission = result.mission.clone();
                    let (used, free) = (result.rerolls_used, result.rerolls_free);
                    self.update_missions(|board| {
                        if let Some(mission) = mission {
                            board.apply_mission(mission);
                        }
                        board.apply_reroll_counts(used, free);
                    });
                } else {
                    log_failure(MessageKind::MissionRerollResult, result.error.as_deref());
                }
                self.notifications.mission_reroll.publish(result);
            }
            Envelope::MilestoneClaimResult(result) => {
                if result.success {
                    let milestone = result.milestone;
                    self.update_missions(|board| board.apply_milestone_claimed(milestone));
                    if let Some(currency) = result.currency {
                        self.set_currency(currency);
                    }
                } else {
                    log_failure(MessageKind::MilestoneClaimResult, result.error.as_deref());
                }
                self.notifications.milestone_claim.publish(result);
            }
            Envelope::AdCountUpdate(update) => {
                let (ad_type, count) = (update.ad_type.clone(), update.count_today);
                self.update_missions(|board| board.apply_ad_count(ad_type, count));
                self.notifications.ad_count.publish(update);
            }

            other => return Err(RouteError::Unexpected(other.kind())),
        }
        Ok(())
    }

    fn apply_initial_state(&mut self, state: InitialState) {
        self.set_currency(state.currency);

        let slots_changed = self.slots.update(|table| {
            table.apply_snapshot(state.slots);
        });
        // apply_list rebuilds occupancy from the table it is given.
        let gems_changed = self.slots.read(|table| {
            self.inventory
                .update(|inventory| inventory.apply_list(state.gems, table))
        });
        if slots_changed {
            self.notifications.slots_changed.publish(());
        }
        if gems_changed {
            self.notifications.gems_changed.publish(());
        }

        if let Some(missions) = state.missions {
            self.set_missions(missions);
        }
    }

    /// Slots moved: occupancy is derived from them, so rebuild it.
    fn slots_changed(&mut self) {
        let occupancy_changed = self.slots.read(|table| {
            self.inventory
                .update(|inventory| inventory.recompute_occupancy(table))
        });
        self.notifications.slots_changed.publish(());
        if occupancy_changed {
            self.notifications.gems_changed.publish(());
        }
    }

    fn apply_produced(
        &mut self,
        kind: OperationKind,
        result: GemProducedResult,
    ) -> Correlated<GemProducedResult> {
        let consumed = self.take_correlation(kind);
        if result.success {
            let produced = result.produced.clone();
            let ids = consumed.clone();
            if self.inventory.update(|inventory| {
                inventory.apply_removal(&ids);
                inventory.apply_grant(produced);
            }) {
                self.notifications.gems_changed.publish(());
            }
        } else {
            log_failure(kind.result_kind(), result.error.as_deref());
        }
        Correlated { result, consumed }
    }

    fn apply_discard(&mut self, result: GemDiscardResult) -> Correlated<GemDiscardResult> {
        let consumed = self.take_correlation(OperationKind::Discard);
        if result.success {
            let ids = consumed.clone();
            if self.inventory.update(|inventory| {
                inventory.apply_removal(&ids);
            }) {
                self.notifications.gems_changed.publish(());
            }
            if let Some(currency) = result.currency {
                self.set_currency(currency);
            }
        } else {
            log_failure(MessageKind::GemDiscardResult, result.error.as_deref());
        }
        Correlated { result, consumed }
    }

    fn take_correlation(&self, kind: OperationKind) -> Vec<InstanceId> {
        self.correlations.resolve(kind).unwrap_or_else(|| {
            tracing::debug!(?kind, "result with no pending request");
            Vec::new()
        })
    }

    fn set_currency(&mut self, currency: Currency) {
        if self.wallet.update(|wallet| *wallet = currency) {
            self.notifications.currency.publish(currency);
        }
    }

    fn set_missions(&mut self, list: MissionList) {
        self.update_missions(|board| board.apply_list(list));
    }

    fn update_missions(&mut self, f: impl FnOnce(&mut MissionBoard)) {
        if self.missions.update(f) {
            self.notifications.missions_changed.publish(());
        }
    }

    fn sync_clock(&mut self, server_ms: u64) {
        self.clock.update(|clock| clock.update(server_ms));
        self.notifications.server_time.publish(server_ms);
    }
}

/// Run one handler, turning a panic into a [`RouteError`] so the consumer
/// loop survives it. A cache left half-updated by the panic keeps its
/// value; its subscribers are not notified of it.
fn contain_panic(handler: impl FnOnce() -> Result<(), RouteError>) -> Result<(), RouteError> {
    std::panic::catch_unwind(AssertUnwindSafe(handler)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Err(RouteError::HandlerPanicked(message))
    })
}

fn log_failure(kind: MessageKind, error: Option<&str>) {
    tracing::info!(?kind, error = error.unwrap_or("unspecified"), "operation failed on server");
}
