//! Media-clock and frame-cadence utilities.
//!
//! All encoded chunks are timestamped in the source's media-time domain,
//! expressed in integer microseconds. This module provides:
//! - Conversions between seconds, microseconds and sample offsets
//! - The output frame cadence gate used by the capture loop
//! - Drift measurement between two streams

use serde::{Deserialize, Serialize};

/// Microseconds per second.
pub const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Convert media seconds to rounded microseconds.
pub fn secs_to_us(secs: f64) -> i64 {
    (secs * MICROS_PER_SEC).round() as i64
}

/// Convert microseconds to media seconds.
pub fn us_to_secs(us: i64) -> f64 {
    us as f64 / MICROS_PER_SEC
}

/// Timestamp of a sample offset at the given rate, in microseconds.
pub fn samples_to_us(offset: u64, sample_rate: u32) -> i64 {
    ((offset as f64 / sample_rate.max(1) as f64) * MICROS_PER_SEC).round() as i64
}

/// Nominal duration of one output frame, in microseconds.
pub fn frame_duration_us(fps: u32) -> u64 {
    (MICROS_PER_SEC / fps.max(1) as f64).round() as u64
}

/// What the cadence gate does when media time has run far ahead of the
/// next due frame (encoding slower than playback).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CadencePolicy {
    /// Jump the due time to the current media time once the lag exceeds
    /// `max_lag_frames` intervals, so the next later poll captures again.
    /// Frames in the gap are skipped.
    Resync { max_lag_frames: f64 },
    /// Always advance by exactly one interval, emitting one frame per poll
    /// until the gate catches up.
    CatchUp,
}

impl Default for CadencePolicy {
    fn default() -> Self {
        Self::Resync {
            max_lag_frames: 2.0,
        }
    }
}

/// Decision returned by [`FrameCadence::poll`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CadenceDecision {
    /// Media time has not reached the next due frame yet.
    Wait,
    /// Capture a frame now.
    Capture,
    /// Capture a frame now; the due time was resynchronised and
    /// `skipped_frames` output slots were dropped.
    Resynced { skipped_frames: u64 },
}

impl CadenceDecision {
    pub fn should_capture(self) -> bool {
        !matches!(self, CadenceDecision::Wait)
    }
}

/// Fixed output frame-rate gate driven by media time.
///
/// Maintains a monotonically advancing "next frame due" time in the
/// video's own time domain. The first poll always captures.
#[derive(Debug, Clone)]
pub struct FrameCadence {
    interval_secs: f64,
    next_due_secs: f64,
    /// Media time of the last resync; the frame there is already taken.
    resynced_at: Option<f64>,
    policy: CadencePolicy,
}

impl FrameCadence {
    /// Create a gate targeting the given output frame rate.
    pub fn new(fps: u32, policy: CadencePolicy) -> Self {
        Self {
            interval_secs: 1.0 / fps.max(1) as f64,
            next_due_secs: 0.0,
            resynced_at: None,
            policy,
        }
    }

    /// Check whether a frame is due at `media_secs` and advance the gate.
    pub fn poll(&mut self, media_secs: f64) -> CadenceDecision {
        if media_secs < self.next_due_secs
            || self.resynced_at.is_some_and(|at| media_secs <= at)
        {
            return CadenceDecision::Wait;
        }
        self.resynced_at = None;

        match self.policy {
            CadencePolicy::Resync { max_lag_frames }
                if media_secs > self.next_due_secs + self.interval_secs * max_lag_frames =>
            {
                let skipped =
                    ((media_secs - self.next_due_secs) / self.interval_secs).floor() as u64;
                self.next_due_secs = media_secs;
                self.resynced_at = Some(media_secs);
                CadenceDecision::Resynced {
                    skipped_frames: skipped,
                }
            }
            _ => {
                self.next_due_secs += self.interval_secs;
                CadenceDecision::Capture
            }
        }
    }

    /// Restart the gate so the next poll at or after `media_secs` captures.
    pub fn reset_to(&mut self, media_secs: f64) {
        self.next_due_secs = media_secs.max(0.0);
        self.resynced_at = None;
    }

    /// Next due media time in seconds.
    pub fn next_due_secs(&self) -> f64 {
        self.next_due_secs
    }

    /// Target interval in seconds.
    pub fn interval_secs(&self) -> f64 {
        self.interval_secs
    }
}

/// Drift measurement between two streams.
#[derive(Debug, Clone, Copy)]
pub struct DriftMeasurement {
    /// Timestamp in the reference stream (us).
    pub reference_us: i64,
    /// Timestamp in the measured stream (us).
    pub measured_us: i64,
}

impl DriftMeasurement {
    /// Drift in microseconds (positive = measured is ahead).
    pub fn drift_us(&self) -> i64 {
        self.measured_us - self.reference_us
    }

    /// Drift in milliseconds.
    pub fn drift_ms(&self) -> f64 {
        self.drift_us() as f64 / 1_000.0
    }

    /// Whether drift exceeds an acceptable threshold.
    pub fn exceeds_threshold_ms(&self, threshold_ms: f64) -> bool {
        self.drift_ms().abs() > threshold_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_conversions() {
        assert_eq!(secs_to_us(1.5), 1_500_000);
        assert!((us_to_secs(250_000) - 0.25).abs() < 1e-12);
        assert_eq!(samples_to_us(44_100, 44_100), 1_000_000);
        assert_eq!(samples_to_us(1024, 48_000), 21_333);
        assert_eq!(frame_duration_us(60), 16_667);
    }

    #[test]
    fn test_cadence_first_poll_captures() {
        let mut cadence = FrameCadence::new(60, CadencePolicy::default());
        assert_eq!(cadence.poll(0.0), CadenceDecision::Capture);
        assert_eq!(cadence.poll(0.001), CadenceDecision::Wait);
        assert_eq!(cadence.poll(1.0 / 60.0), CadenceDecision::Capture);
    }

    #[test]
    fn test_cadence_resyncs_when_far_behind() {
        let mut cadence = FrameCadence::new(60, CadencePolicy::default());
        cadence.poll(0.0);
        let decision = cadence.poll(0.5);
        assert_eq!(
            decision,
            CadenceDecision::Resynced { skipped_frames: 29 }
        );
        assert_eq!(cadence.next_due_secs(), 0.5);

        // Due again on the next later poll.
        assert_eq!(cadence.poll(0.5), CadenceDecision::Wait);
        assert_eq!(cadence.poll(0.501), CadenceDecision::Capture);
        assert!((cadence.next_due_secs() - (0.5 + 1.0 / 60.0)).abs() < 1e-12);
    }

    #[test]
    fn test_cadence_catch_up_never_skips() {
        let mut cadence = FrameCadence::new(10, CadencePolicy::CatchUp);
        cadence.poll(0.0);
        let mut captured = 0;
        for _ in 0..20 {
            if cadence.poll(0.5).should_capture() {
                captured += 1;
            }
        }
        // 0.1 .. 0.5 inclusive
        assert_eq!(captured, 5);
    }

    #[test]
    fn test_drift_measurement() {
        let drift = DriftMeasurement {
            reference_us: 5_000_000,
            measured_us: 4_983_333,
        };
        assert_eq!(drift.drift_us(), -16_667);
        assert!((drift.drift_ms() + 16.667).abs() < 1e-9);
        assert!(drift.exceeds_threshold_ms(10.0));
        assert!(!drift.exceeds_threshold_ms(20.0));
    }
}
