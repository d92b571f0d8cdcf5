//! Lock-free observable values shared between the session, the capture
//! drain thread and the host.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// `connected`, `is_speaking` and `volume`, readable from any thread.
#[derive(Debug, Default)]
pub struct SessionSignals {
    connected: AtomicBool,
    speaking: AtomicBool,
    /// `f32::to_bits` of the last volume.
    volume_bits: AtomicU32,
}

impl SessionSignals {
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Acquire)
    }

    /// Last microphone level, always in [0.0, 1.0].
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Acquire))
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Returns `true` if the value changed.
    pub(crate) fn set_speaking(&self, speaking: bool) -> bool {
        self.speaking.swap(speaking, Ordering::AcqRel) != speaking
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        let clamped = if volume.is_nan() {
            0.0
        } else {
            volume.clamp(0.0, 1.0)
        };
        self.volume_bits.store(clamped.to_bits(), Ordering::Release);
    }

    /// Back to initial values (not connected, silent, volume 0).
    pub(crate) fn reset(&self) {
        self.set_connected(false);
        self.set_speaking(false);
        self.set_volume(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_is_clamped() {
        let signals = SessionSignals::default();
        signals.set_volume(3.0);
        assert_eq!(signals.volume(), 1.0);
        signals.set_volume(-0.2);
        assert_eq!(signals.volume(), 0.0);
        signals.set_volume(f32::NAN);
        assert_eq!(signals.volume(), 0.0);
    }

    #[test]
    fn speaking_reports_changes_only() {
        let signals = SessionSignals::default();
        assert!(signals.set_speaking(true));
        assert!(!signals.set_speaking(true));
        assert!(signals.set_speaking(false));
    }

    #[test]
    fn reset_restores_defaults() {
        let signals = SessionSignals::default();
        signals.set_connected(true);
        signals.set_speaking(true);
        signals.set_volume(0.7);
        signals.reset();
        assert!(!signals.connected());
        assert!(!signals.is_speaking());
        assert_eq!(signals.volume(), 0.0);
    }
}
