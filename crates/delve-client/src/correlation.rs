//! Pending-correlation tracker.
//!
//! Synthesis, discard and conversion results do not echo the ids they
//! consumed. The request side records those ids under the operation kind
//! before sending; the router takes them back when the terminal response
//! arrives. One operation per kind may be in flight at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use delve_net::messages::{InstanceId, MessageKind};

/// Operations whose results need client-side correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Synthesis,
    Discard,
    Conversion,
}

impl OperationKind {
    /// Kind of the terminal response for this operation.
    pub fn result_kind(self) -> MessageKind {
        match self {
            OperationKind::Synthesis => MessageKind::GemSynthesisResult,
            OperationKind::Discard => MessageKind::GemDiscardResult,
            OperationKind::Conversion => MessageKind::GemConversionResult,
        }
    }

    /// Operation started by an outbound request kind, if it needs one.
    pub fn for_request(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::GemSynthesisRequest => Some(OperationKind::Synthesis),
            MessageKind::GemDiscardRequest => Some(OperationKind::Discard),
            MessageKind::GemConversionRequest => Some(OperationKind::Conversion),
            _ => None,
        }
    }
}

/// Shared map of in-flight operations. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct PendingCorrelations {
    inner: Arc<Mutex<HashMap<OperationKind, Vec<InstanceId>>>>,
}

impl PendingCorrelations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the ids for `kind`. A second `begin` for the same kind
    /// replaces the first; the replaced ids are returned so a request that
    /// never leaves can hand them back through [`abandon`](Self::abandon).
    pub fn begin(&self, kind: OperationKind, ids: Vec<InstanceId>) -> Option<Vec<InstanceId>> {
        let previous = self.lock().insert(kind, ids);
        if let Some(previous) = &previous {
            tracing::warn!(
                ?kind,
                stale = previous.len(),
                "operation already in flight, replacing its ids"
            );
        }
        previous
    }

    /// Undo a `begin` whose request was never queued, putting back whatever
    /// it replaced.
    pub fn abandon(&self, kind: OperationKind, previous: Option<Vec<InstanceId>>) {
        let mut map = self.lock();
        match previous {
            Some(ids) => map.insert(kind, ids),
            None => map.remove(&kind),
        };
    }

    /// Take the ids for `kind`. Only the first call after `begin` gets them.
    pub fn resolve(&self, kind: OperationKind) -> Option<Vec<InstanceId>> {
        self.lock().remove(&kind)
    }

    pub fn is_pending(&self, kind: OperationKind) -> bool {
        self.lock().contains_key(&kind)
    }

    /// Forget everything in flight. Returns how many operations were dropped.
    pub fn clear(&self) -> usize {
        let mut map = self.lock();
        let dropped = map.len();
        map.clear();
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OperationKind, Vec<InstanceId>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<InstanceId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_returns_ids_exactly_once() {
        let pending = PendingCorrelations::new();
        pending.begin(OperationKind::Discard, ids(&["g1", "g2"]));

        assert_eq!(pending.resolve(OperationKind::Discard), Some(ids(&["g1", "g2"])));
        assert_eq!(pending.resolve(OperationKind::Discard), None);
        assert!(!pending.is_pending(OperationKind::Discard));
    }

    #[test]
    fn test_kinds_are_independent() {
        let pending = PendingCorrelations::new();
        pending.begin(OperationKind::Synthesis, ids(&["a"]));
        pending.begin(OperationKind::Conversion, ids(&["b"]));

        assert_eq!(pending.resolve(OperationKind::Conversion), Some(ids(&["b"])));
        assert!(pending.is_pending(OperationKind::Synthesis));
        assert_eq!(pending.resolve(OperationKind::Discard), None);
    }

    #[test]
    fn test_second_begin_replaces_first() {
        let pending = PendingCorrelations::new();
        pending.begin(OperationKind::Discard, ids(&["old"]));
        pending.begin(OperationKind::Discard, ids(&["new"]));
        assert_eq!(pending.resolve(OperationKind::Discard), Some(ids(&["new"])));
    }

    #[test]
    fn test_abandon_restores_replaced_ids() {
        let pending = PendingCorrelations::new();
        assert_eq!(pending.begin(OperationKind::Discard, ids(&["old"])), None);
        let previous = pending.begin(OperationKind::Discard, ids(&["new"]));
        assert_eq!(previous, Some(ids(&["old"])));

        pending.abandon(OperationKind::Discard, previous);
        assert_eq!(pending.resolve(OperationKind::Discard), Some(ids(&["old"])));

        pending.begin(OperationKind::Synthesis, ids(&["x"]));
        pending.abandon(OperationKind::Synthesis, None);
        assert!(!pending.is_pending(OperationKind::Synthesis));
    }

    #[test]
    fn test_clones_share_state() {
        let pending = PendingCorrelations::new();
        let other = pending.clone();
        pending.begin(OperationKind::Synthesis, ids(&["x"]));
        assert_eq!(other.resolve(OperationKind::Synthesis), Some(ids(&["x"])));
        assert!(!pending.is_pending(OperationKind::Synthesis));
    }

    #[test]
    fn test_clear_drops_everything() {
        let pending = PendingCorrelations::new();
        pending.begin(OperationKind::Synthesis, ids(&["x"]));
        pending.begin(OperationKind::Discard, ids(&["y"]));
        assert_eq!(pending.clear(), 2);
        assert_eq!(pending.resolve(OperationKind::Discard), None);
    }

    #[test]
    fn test_request_and_result_kinds_pair_up() {
        for (request, op) in [
            (MessageKind::GemSynthesisRequest, OperationKind::Synthesis),
            (MessageKind::GemDiscardRequest, OperationKind::Discard),
            (MessageKind::GemConversionRequest, OperationKind::Conversion),
        ] {
            assert_eq!(OperationKind::for_request(request), Some(op));
        }
        assert_eq!(OperationKind::for_request(MessageKind::GemEquipRequest), None);
        assert_eq!(
            OperationKind::Discard.result_kind(),
            MessageKind::GemDiscardResult
        );
    }
}
