//! Outbound requests.
//!
//! [`RequestSender`] has one method per client-to-server operation. Requests
//! go onto an outbox drained by [`send_loop`], which owns all writes for the
//! session. Operations whose results do not echo their inputs record the ids
//! with the correlation tracker before they are queued.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use delve_net::messages::{
    AdWatchedRequest, Envelope, GemBatchRequest, GemConversionRequest, GemEquipRequest, GemKind,
    InstanceId, MilestoneClaimRequest, MissionSlotRequest, SLOT_COUNT, SUB_SLOT_COUNT,
    SlotRequest, SubSlotRequest,
};
use delve_net::transport::Transport;

use crate::correlation::{OperationKind, PendingCorrelations};

/// Why a request was not queued.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("slot index {0} out of range")]
    SlotIndex(u8),
    #[error("sub-slot index {0} out of range")]
    SubSlotIndex(u8),
    #[error("no gems selected")]
    EmptySelection,
    #[error("client is not running")]
    NotRunning,
}

/// Queues requests for the session's send loop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RequestSender {
    outbox: mpsc::UnboundedSender<Envelope>,
    correlations: PendingCorrelations,
}

impl RequestSender {
    pub(crate) fn new(
        outbox: mpsc::UnboundedSender<Envelope>,
        correlations: PendingCorrelations,
    ) -> Self {
        Self {
            outbox,
            correlations,
        }
    }

    /// Queue any envelope. Gem batch requests take the same correlation
    /// path as [`synthesize_gems`](Self::synthesize_gems) and friends, so
    /// their results are reconciled either way.
    pub fn send(&self, envelope: Envelope) -> Result<(), RequestError> {
        match envelope {
            Envelope::GemSynthesisRequest(GemBatchRequest { instance_ids }) => {
                self.synthesize_gems(instance_ids)
            }
            Envelope::GemDiscardRequest(GemBatchRequest { instance_ids }) => {
                self.discard_gems(instance_ids)
            }
            Envelope::GemConversionRequest(GemConversionRequest {
                instance_ids,
                target_kind,
            }) => self.convert_gems(instance_ids, target_kind),
            other => self.queue(other),
        }
    }

    fn queue(&self, envelope: Envelope) -> Result<(), RequestError> {
        self.outbox
            .send(envelope)
            .map_err(|_| RequestError::NotRunning)
    }

    pub fn request_server_time(&self) -> Result<(), RequestError> {
        self.queue(Envelope::ServerTimeRequest)
    }

    // --- Slots ---

    pub fn request_slot_list(&self) -> Result<(), RequestError> {
        self.queue(Envelope::SlotListRequest)
    }

    pub fn upgrade_slot(&self, slot_index: u8) -> Result<(), RequestError> {
        check_slot(slot_index)?;
        self.queue(Envelope::SlotUpgradeRequest(SlotRequest { slot_index }))
    }

    pub fn unlock_slot(&self, slot_index: u8) -> Result<(), RequestError> {
        check_slot(slot_index)?;
        self.queue(Envelope::SlotUnlockRequest(SlotRequest { slot_index }))
    }

    pub fn unlock_sub_slot(&self, slot_index: u8, sub_slot_index: u8) -> Result<(), RequestError> {
        check_sub_slot(slot_index, sub_slot_index)?;
        self.queue(Envelope::SubSlotUnlockRequest(SubSlotRequest {
            slot_index,
            sub_slot_index,
        }))
    }

    // --- Gems ---

    pub fn request_gem_list(&self) -> Result<(), RequestError> {
        self.queue(Envelope::GemListRequest)
    }

    pub fn equip_gem(
        &self,
        slot_index: u8,
        sub_slot_index: u8,
        instance_id: impl Into<InstanceId>,
    ) -> Result<(), RequestError> {
        check_sub_slot(slot_index, sub_slot_index)?;
        self.queue(Envelope::GemEquipRequest(GemEquipRequest {
            slot_index,
            sub_slot_index,
            instance_id: instance_id.into(),
        }))
    }

    pub fn unequip_gem(&self, slot_index: u8, sub_slot_index: u8) -> Result<(), RequestError> {
        check_sub_slot(slot_index, sub_slot_index)?;
        self.queue(Envelope::GemUnequipRequest(SubSlotRequest {
            slot_index,
            sub_slot_index,
        }))
    }

    pub fn synthesize_gems(&self, instance_ids: Vec<InstanceId>) -> Result<(), RequestError> {
        self.correlated(
            OperationKind::Synthesis,
            instance_ids,
            |instance_ids| Envelope::GemSynthesisRequest(GemBatchRequest { instance_ids }),
        )
    }

    pub fn discard_gems(&self, instance_ids: Vec<InstanceId>) -> Result<(), RequestError> {
        self.correlated(
            OperationKind::Discard,
            instance_ids,
            |instance_ids| Envelope::GemDiscardRequest(GemBatchRequest { instance_ids }),
        )
    }

    pub fn convert_gems(
        &self,
        instance_ids: Vec<InstanceId>,
        target_kind: GemKind,
    ) -> Result<(), RequestError> {
        self.correlated(OperationKind::Conversion, instance_ids, |instance_ids| {
            Envelope::GemConversionRequest(GemConversionRequest {
                instance_ids,
                target_kind,
            })
        })
    }

    // --- Missions ---

    pub fn request_mission_list(&self) -> Result<(), RequestError> {
        self.queue(Envelope::MissionListRequest)
    }

    pub fn claim_mission(&self, slot_no: u32) -> Result<(), RequestError> {
        self.queue(Envelope::MissionClaimRequest(MissionSlotRequest { slot_no }))
    }

    pub fn reroll_mission(&self, slot_no: u32) -> Result<(), RequestError> {
        self.queue(Envelope::MissionRerollRequest(MissionSlotRequest { slot_no }))
    }

    pub fn claim_milestone(&self, milestone: u32) -> Result<(), RequestError> {
        self.queue(Envelope::MilestoneClaimRequest(MilestoneClaimRequest {
            milestone,
        }))
    }

    pub fn report_ad_watched(&self, ad_type: impl Into<String>) -> Result<(), RequestError> {
        self.queue(Envelope::AdWatchedRequest(AdWatchedRequest {
            ad_type: ad_type.into(),
        }))
    }

    /// Record `ids` for `kind`, then queue the request built from them.
    fn correlated(
        &self,
        kind: OperationKind,
        ids: Vec<InstanceId>,
        build: impl FnOnce(Vec<InstanceId>) -> Envelope,
    ) -> Result<(), RequestError> {
        if ids.is_empty() {
            return Err(RequestError::EmptySelection);
        }
        if self.outbox.is_closed() {
            return Err(RequestError::NotRunning);
        }
        // Recorded first so the result can never overtake it.
        let previous = self.correlations.begin(kind, ids.clone());
        self.queue(build(ids)).inspect_err(|_| {
            self.correlations.abandon(kind, previous);
        })
    }
}

fn check_slot(slot_index: u8) -> Result<(), RequestError> {
    if slot_index >= SLOT_COUNT {
        return Err(RequestError::SlotIndex(slot_index));
    }
    Ok(())
}

fn check_sub_slot(slot_index: u8, sub_slot_index: u8) -> Result<(), RequestError> {
    check_slot(slot_index)?;
    if sub_slot_index >= SUB_SLOT_COUNT {
        return Err(RequestError::SubSlotIndex(sub_slot_index));
    }
    Ok(())
}

/// Drain the outbox onto the transport until cancelled or every sender is gone.
///
/// A request that cannot be written is logged and dropped; if it had a
/// correlation entry, the entry is cleared so no later result picks it up.
pub(crate) async fn send_loop(
    transport: Transport,
    mut outbox: mpsc::UnboundedReceiver<Envelope>,
    correlations: PendingCorrelations,
    send_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = outbox.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let kind = envelope.kind();
        match transport.send_envelope(&envelope, send_timeout).await {
            Ok(()) => tracing::debug!(?kind, "request sent"),
            Err(e) => {
                tracing::warn!(?kind, error = %e, "request not sent");
                if let Some(op) = OperationKind::for_request(kind) {
                    correlations.resolve(op);
                }
            }
        }
    }
    tracing::debug!("send loop stopped");
}
