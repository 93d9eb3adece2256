use chrono::{DateTime, Utc};
use serde::Serialize;

/// Last known position and motion of the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub time: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    /// meters
    pub alt: f64,
    /// km/h
    pub speed: f64,
}

/// Shown until the receiver reports its first fix
const DEFAULT_TIME_S: i64 = 1495050105;
const DEFAULT_LAT: f64 = 37.263056;
const DEFAULT_LON: f64 = -115.79302;

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            time: DateTime::from_timestamp(DEFAULT_TIME_S, 0).unwrap_or_default(),
            lat: DEFAULT_LAT,
            lon: DEFAULT_LON,
            alt: 0.0,
            speed: 0.0,
        }
    }
}

/// Door lock state, only ever changed by an executed command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Locked,
    Unlocked,
    #[default]
    Unknown,
}

/// Snapshot plus the fix flag that gates whether it can be trusted
#[derive(Debug, Clone, Default)]
pub struct TelemetryState {
    snapshot: TelemetrySnapshot,
    fixed: bool,
}

impl TelemetryState {
    pub fn snapshot(&self) -> &TelemetrySnapshot {
        &self.snapshot
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// The snapshot, only while the receiver holds a fix
    pub fn trusted(&self) -> Option<&TelemetrySnapshot> {
        self.fixed.then_some(&self.snapshot)
    }

    /// Record a valid fix, replacing the snapshot as a whole
    pub fn fix_acquired(&mut self, snapshot: TelemetrySnapshot) {
        self.fixed = true;
        self.snapshot = snapshot;
    }

    /// Record a lost fix, the stale snapshot is kept
    pub fn fix_lost(&mut self) {
        self.fixed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_untrusted_with_defaults() {
        let state = TelemetryState::default();
        assert!(!state.is_fixed());
        assert!(state.trusted().is_none());
        assert_eq!(state.snapshot().lat, DEFAULT_LAT);
        assert_eq!(state.snapshot().time.timestamp(), DEFAULT_TIME_S);
    }

    #[test]
    fn lost_fix_keeps_last_snapshot() {
        let mut state = TelemetryState::default();
        let snap = TelemetrySnapshot {
            lat: 1.0,
            lon: 2.0,
            ..Default::default()
        };
        state.fix_acquired(snap);
        assert_eq!(state.trusted(), Some(&snap));

        state.fix_lost();
        assert!(state.trusted().is_none());
        assert_eq!(state.snapshot(), &snap);
    }

    #[test]
    fn lock_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&LockState::Unknown).unwrap(),
            "\"unknown\""
        );
    }
}
