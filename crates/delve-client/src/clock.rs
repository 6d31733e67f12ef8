//! Server clock estimate.
//!
//! Each server time signal overwrites the offset wholesale:
//! `offset = server_ms - local_ms` at the instant of receipt, and
//! `now = local_ms + offset`. There is no smoothing and no outlier
//! rejection; one late packet moves the estimate by its full delay.

use delve_net::session::unix_millis;

/// Offset between the server clock and the local wall clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockOffset {
    /// `server - local` in milliseconds. Zero until the first sync.
    pub offset_ms: i64,
    /// Server time of the most recent sync.
    pub last_server_ms: Option<u64>,
}

impl ClockOffset {
    /// Whether at least one server time signal has been seen.
    pub fn is_synced(&self) -> bool {
        self.last_server_ms.is_some()
    }

    /// Estimated server time now.
    pub fn now_ms(&self) -> u64 {
        self.now_at(unix_millis())
    }

    /// Estimated server time at local instant `local_ms`.
    pub fn now_at(&self, local_ms: u64) -> u64 {
        i64::try_from(local_ms)
            .unwrap_or(i64::MAX)
            .saturating_add(self.offset_ms)
            .max(0) as u64
    }

    pub(crate) fn update(&mut self, server_ms: u64) {
        self.update_at(server_ms, unix_millis());
    }

    /// Overwrite the offset from a sample taken at local instant `local_ms`.
    pub(crate) fn update_at(&mut self, server_ms: u64, local_ms: u64) {
        let server = i64::try_from(server_ms).unwrap_or(i64::MAX);
        let local = i64::try_from(local_ms).unwrap_or(i64::MAX);
        self.offset_ms = server.saturating_sub(local);
        self.last_server_ms = Some(server_ms);
    }
}
