//! Network interpolation engine: turns a sparse, jittery stream of pose
//! samples into continuous motion on a local playback timeline.
//!
//! The timeline trails the newest sample by an adaptive render delay sized
//! from measured jitter. Instead of snapping when it drifts, the timeline
//! plays slightly faster or slower than real time until the lead is back
//! inside the dead zone. Teleports and buffer overflow re-seed it.
//!
//! Samples may be pushed from a network-receive callback on another thread
//! through a [`PoseFeed`]; the buffer is guarded by a single mutex shared
//! with the render side.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use glam::{Quat, Vec3};

use crate::interp_buffer::{
    BufferSettings, InterpolationBuffer, PoseSample, PushOutcome, RenderPose,
};
use crate::jitter::JitterEstimator;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Tuning for one interpolator.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpolationSettings {
    /// Nominal server send interval (seconds).
    pub send_interval: f64,
    /// Lower bound on the render delay (seconds).
    pub min_delay: f64,
    /// Upper bound on the render delay (seconds).
    pub max_delay: f64,
    /// Extra delay as a fraction of `send_interval`.
    pub safety_margin: f64,
    /// Spacings kept by the jitter estimator.
    pub jitter_window: usize,
    /// EMA factor for jitter.
    pub jitter_alpha: f64,
    /// EMA factor for the timeline lead.
    pub drift_alpha: f64,
    /// Drift above this speeds playback up (seconds).
    pub catch_up_threshold: f64,
    /// Drift below minus this slows playback down (seconds).
    pub slow_down_threshold: f64,
    /// Playback speed while catching up.
    pub catch_up_rate: f64,
    /// Playback speed while slowing down.
    pub slow_down_rate: f64,
    /// Displacement between consecutive samples treated as a teleport (meters).
    pub teleport_distance: f32,
    /// Lead beyond `max_delay` that re-seeds the timeline (seconds).
    pub resync_gap: f64,
    /// Buffer limits.
    pub buffer: BufferSettings,
}

impl Default for InterpolationSettings {
    fn default() -> Self {
        Self::from(&nebula_config::InterpolationConfig::default())
    }
}

impl From<&nebula_config::InterpolationConfig> for InterpolationSettings {
    fn from(config: &nebula_config::InterpolationConfig) -> Self {
        let min_delay = config.min_delay.max(0.0);
        Self {
            send_interval: config.send_interval,
            min_delay,
            max_delay: config.max_delay.max(min_delay),
            safety_margin: config.safety_margin,
            jitter_window: config.jitter_window,
            jitter_alpha: config.jitter_alpha,
            drift_alpha: config.drift_alpha.clamp(0.0, 1.0),
            catch_up_threshold: config.catch_up_threshold,
            slow_down_threshold: config.slow_down_threshold,
            catch_up_rate: config.catch_up_rate,
            slow_down_rate: config.slow_down_rate,
            teleport_distance: config.teleport_distance,
            resync_gap: config.resync_gap.max(0.0),
            buffer: BufferSettings::from(config),
        }
    }
}

impl InterpolationSettings {
    /// Render delay for a given normalized jitter, clamped to the band.
    pub fn delay_for(&self, normalized_jitter: f64) -> f64 {
        (self.send_interval * (1.0 + normalized_jitter + self.safety_margin))
            .clamp(self.min_delay, self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// What happened to a pushed sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Buffered normally.
    Accepted,
    /// First sample: the timeline was seeded from it.
    Seeded,
    /// Implausible jump: buffer cleared, timeline re-seeded.
    Teleported,
    /// Buffer cap hit: buffer cleared, timeline re-seeded.
    Overflowed,
    /// Sample far ahead of a stale timeline: buffer cleared, timeline
    /// re-seeded.
    Resynced,
    /// Non-finite input, dropped.
    Rejected,
}

#[derive(Debug)]
struct EngineState {
    settings: InterpolationSettings,
    buffer: InterpolationBuffer,
    jitter: JitterEstimator,
    /// Local playback position in remote time. `None` until seeded.
    timeline: Option<f64>,
    delay: f64,
    /// EMA of (newest remote time - timeline), measured at each arrival.
    lead: f64,
    speed: f64,
    resets: u64,
}

impl EngineState {
    fn new(settings: InterpolationSettings) -> Self {
        let delay = settings.delay_for(0.0);
        Self {
            buffer: InterpolationBuffer::new(settings.buffer),
            jitter: JitterEstimator::new(settings.jitter_window, settings.jitter_alpha),
            timeline: None,
            delay,
            lead: delay,
            speed: 1.0,
            resets: 0,
            settings,
        }
    }

    fn push(&mut self, remote_time: f64, local_time: f64, position: Vec3, rotation: Quat) -> FeedOutcome {
        if !remote_time.is_finite() || !position.is_finite() || !rotation.is_finite() {
            return FeedOutcome::Rejected;
        }

        self.jitter.record_arrival(local_time);
        self.delay = self
            .settings
            .delay_for(self.jitter.normalized(self.settings.send_interval));

        let sample = PoseSample {
            remote_time,
            local_time,
            position,
            rotation,
        };

        let teleported = self
            .buffer
            .latest()
            .is_some_and(|last| last.position.distance(position) > self.settings.teleport_distance);

        let behind = self.timeline.is_some_and(|timeline| {
            remote_time - timeline > self.settings.max_delay + self.settings.resync_gap
        });

        if self.timeline.is_none() || teleported || behind {
            self.buffer.clear();
            self.buffer.push(sample);
            let first = self.timeline.is_none();
            self.reseed(remote_time);
            return if first {
                FeedOutcome::Seeded
            } else if teleported {
                tracing::debug!(remote_time, "teleport detected, interpolation re-seeded");
                FeedOutcome::Teleported
            } else {
                tracing::debug!(remote_time, "timeline fell behind the stream, re-seeded");
                FeedOutcome::Resynced
            };
        }

        if self.buffer.push(sample) == PushOutcome::Overflowed {
            tracing::debug!(remote_time, "interpolation buffer overflow, re-seeded");
            self.reseed(remote_time);
            return FeedOutcome::Overflowed;
        }

        self.observe_lead();
        FeedOutcome::Accepted
    }

    fn reseed(&mut self, remote_time: f64) {
        self.timeline = Some(remote_time - self.delay);
        self.lead = self.delay;
        self.speed = 1.0;
        self.resets += 1;
    }

    fn observe_lead(&mut self) {
        if let (Some(timeline), Some(latest)) = (self.timeline, self.buffer.latest()) {
            let lead = latest.remote_time - timeline;
            self.lead += self.settings.drift_alpha * (lead - self.lead);
        }
    }

    fn drift(&self) -> f64 {
        self.lead - self.delay
    }

    fn advance(&mut self, dt: f64) -> Option<RenderPose> {
        let timeline = self.timeline?;
        let drift = self.drift();
        self.speed = if drift > self.settings.catch_up_threshold {
            self.settings.catch_up_rate
        } else if drift < -self.settings.slow_down_threshold {
            self.settings.slow_down_rate
        } else {
            1.0
        };

        let now = timeline + dt.max(0.0) * self.speed;
        self.timeline = Some(now);

        let pose = self.buffer.sample(now);
        self.buffer.prune(now);
        pose
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.jitter.reset();
        self.timeline = None;
        self.delay = self.settings.delay_for(0.0);
        self.lead = self.delay;
        self.speed = 1.0;
    }
}

fn lock(state: &Mutex<EngineState>) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// NetworkInterpolator
// ---------------------------------------------------------------------------

/// One actor's interpolation engine. Render side.
#[derive(Debug)]
pub struct NetworkInterpolator {
    state: Arc<Mutex<EngineState>>,
}

/// Cloneable, `Send` handle that pushes samples into a
/// [`NetworkInterpolator`] from any thread.
#[derive(Debug, Clone)]
pub struct PoseFeed {
    state: Arc<Mutex<EngineState>>,
}

impl PoseFeed {
    /// Buffer a pose sampled by the server at `remote_time` and received
    /// locally at `local_time`.
    pub fn push(&self, remote_time: f64, local_time: f64, position: Vec3, rotation: Quat) -> FeedOutcome {
        lock(&self.state).push(remote_time, local_time, position, rotation)
    }
}

impl Default for NetworkInterpolator {
    fn default() -> Self {
        Self::new(InterpolationSettings::default())
    }
}

impl NetworkInterpolator {
    /// Empty interpolator.
    pub fn new(settings: InterpolationSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::new(settings))),
        }
    }

    /// A feed handle sharing this interpolator's buffer.
    pub fn feed(&self) -> PoseFeed {
        PoseFeed {
            state: Arc::clone(&self.state),
        }
    }

    /// Buffer a sample (same as going through a [`PoseFeed`]).
    pub fn push(&self, remote_time: f64, local_time: f64, position: Vec3, rotation: Quat) -> FeedOutcome {
        lock(&self.state).push(remote_time, local_time, position, rotation)
    }

    /// Advance the timeline by `dt` seconds of local time and return the
    /// pose to render, or `None` before the first sample.
    pub fn advance(&self, dt: f64) -> Option<RenderPose> {
        lock(&self.state).advance(dt)
    }

    /// Drop all samples and forget the timeline.
    pub fn clear(&self) {
        lock(&self.state).clear();
    }

    /// Current render delay (seconds).
    pub fn delay(&self) -> f64 {
        lock(&self.state).delay
    }

    /// Current timeline position in remote time.
    pub fn timeline(&self) -> Option<f64> {
        lock(&self.state).timeline
    }

    /// Smoothed lead minus delay (seconds).
    pub fn drift(&self) -> f64 {
        lock(&self.state).drift()
    }

    /// Playback speed used by the last advance.
    pub fn speed(&self) -> f64 {
        lock(&self.state).speed
    }

    /// Estimated jitter (seconds).
    pub fn jitter(&self) -> f64 {
        lock(&self.state).jitter.jitter()
    }

    /// Samples currently buffered.
    pub fn buffered(&self) -> usize {
        lock(&self.state).buffer.len()
    }

    /// Times the timeline was seeded or re-seeded.
    pub fn resets(&self) -> u64 {
        lock(&self.state).resets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp_buffer::SampleMode;

    fn fixed_delay(delay: f64) -> InterpolationSettings {
        InterpolationSettings {
            min_delay: delay,
            max_delay: delay,
            ..InterpolationSettings::default()
        }
    }

    fn at(x: f32) -> Vec3 {
        Vec3::new(x, 0.0, 0.0)
    }

    #[test]
    fn test_render_query_blends_bracketing_samples() {
        let interp = NetworkInterpolator::new(fixed_delay(0.15));
        assert_eq!(interp.push(0.0, 0.0, at(0.0), Quat::IDENTITY), FeedOutcome::Seeded);
        assert_eq!(interp.push(0.1, 0.1, at(1.0), Quat::IDENTITY), FeedOutcome::Accepted);
        assert_eq!(interp.push(0.2, 0.2, at(2.0), Quat::IDENTITY), FeedOutcome::Accepted);

        let pose = interp.advance(0.3).unwrap();
        assert!((interp.timeline().unwrap() - 0.15).abs() < 1e-9);
        assert_eq!(pose.mode, SampleMode::Interpolated);
        assert!((pose.position.x - 1.5).abs() < 1e-4, "x = {}", pose.position.x);
    }

    #[test]
    fn test_rotation_is_slerped() {
        let interp = NetworkInterpolator::new(fixed_delay(0.1));
        let quarter = Quat::from_rotation_y(std::f32::consts::FRAC_PI_2);
        interp.push(0.0, 0.0, at(0.0), Quat::IDENTITY);
        interp.push(0.1, 0.1, at(0.1), quarter);
        let pose = interp.advance(0.15).unwrap();
        let expected = Quat::from_rotation_y(std::f32::consts::FRAC_PI_4);
        assert!(pose.rotation.angle_between(expected) < 1e-3);
    }

    #[test]
    fn test_nothing_renders_before_first_sample() {
        let interp = NetworkInterpolator::default();
        assert!(interp.advance(0.1).is_none());
        assert_eq!(interp.timeline(), None);
    }

    #[test]
    fn test_teleport_reseeds_timeline() {
        let interp = NetworkInterpolator::new(fixed_delay(0.1));
        interp.push(0.0, 0.0, at(0.0), Quat::IDENTITY);
        interp.push(0.1, 0.1, at(0.1), Quat::IDENTITY);
        let outcome = interp.push(0.2, 0.2, at(50.0), Quat::IDENTITY);
        assert_eq!(outcome, FeedOutcome::Teleported);
        assert_eq!(interp.buffered(), 1);
        assert!((interp.timeline().unwrap() - 0.1).abs() < 1e-9);
        assert_eq!(interp.advance(0.0).unwrap().position.x, 50.0);
        assert_eq!(interp.resets(), 2);
    }

    #[test]
    fn test_non_finite_sample_rejected() {
        let interp = NetworkInterpolator::default();
        assert_eq!(
            interp.push(f64::NAN, 0.0, Vec3::ZERO, Quat::IDENTITY),
            FeedOutcome::Rejected
        );
        assert_eq!(interp.buffered(), 0);
    }

    #[test]
    fn test_delay_grows_with_jitter() {
        let settings = InterpolationSettings::default();
        let calm = settings.delay_for(0.0);
        let noisy = settings.delay_for(1.0);
        assert!((calm - 0.12).abs() < 1e-9);
        assert!(noisy > calm);
        assert_eq!(settings.delay_for(100.0), settings.max_delay);
    }

    #[test]
    fn test_timeline_catches_up_when_behind() {
        let interp = NetworkInterpolator::new(fixed_delay(0.1));
        interp.push(0.0, 0.0, at(0.0), Quat::IDENTITY);
        // A burst ahead of the timeline without local time passing.
        for i in 1..=8 {
            interp.push(i as f64 * 0.1, 0.0, at(i as f32 * 0.01), Quat::IDENTITY);
        }
        assert!(interp.drift() > 0.05);
        interp.advance(0.016);
        assert_eq!(interp.speed(), 1.05);
    }

    #[test]
    fn test_timeline_slows_down_when_samples_arrive_late() {
        let interp = NetworkInterpolator::new(fixed_delay(0.1));
        interp.push(0.0, 0.0, at(0.0), Quat::IDENTITY);
        let mut local = 0.0;
        // Samples 0.1 s apart in server time arrive 0.2 s apart locally.
        for i in 1..=10 {
            for _ in 0..10 {
                interp.advance(0.02);
                local += 0.02;
            }
            interp.push(i as f64 * 0.1, local, at(i as f32 * 0.01), Quat::IDENTITY);
        }
        assert!(interp.drift() < -0.05);
        interp.advance(0.016);
        assert_eq!(interp.speed(), 0.95);
    }

    #[test]
    fn test_steady_stream_plays_at_real_time() {
        let interp = NetworkInterpolator::new(fixed_delay(0.12));
        let mut local = 0.0;
        for i in 0..100 {
            interp.push(i as f64 * 0.1, local, at(i as f32 * 0.1), Quat::IDENTITY);
            for _ in 0..5 {
                interp.advance(0.02);
                local += 0.02;
            }
        }
        assert_eq!(interp.speed(), 1.0);
        assert!(interp.drift().abs() < 0.05);
    }

    #[test]
    fn test_extrapolation_does_not_snap_back_between_frames() {
        let interp = NetworkInterpolator::new(fixed_delay(0.1));
        interp.push(0.0, 0.0, at(0.0), Quat::IDENTITY);
        interp.push(0.1, 0.1, at(0.1), Quat::IDENTITY);

        let first = interp.advance(0.25).unwrap();
        assert_eq!(first.mode, SampleMode::Extrapolated);
        assert!((first.position.x - 0.15).abs() < 1e-4);

        let mut last_x = first.position.x;
        for _ in 0..20 {
            let pose = interp.advance(0.02).unwrap();
            assert!(
                pose.position.x >= last_x - 1e-6,
                "rendered position moved backwards: {last_x} -> {}",
                pose.position.x
            );
            last_x = pose.position.x;
        }
        assert!((last_x - 0.35).abs() < 1e-4);
    }

    #[test]
    fn test_stale_seed_resyncs_on_live_stream() {
        let interp = NetworkInterpolator::default();
        assert_eq!(interp.push(0.0, 0.0, at(0.0), Quat::IDENTITY), FeedOutcome::Seeded);

        let mut local = 0.0;
        let mut outcomes = Vec::new();
        for i in 0..30 {
            let remote = 30.0 + i as f64 * 0.1;
            outcomes.push(interp.push(remote, local, at(i as f32 * 0.1), Quat::IDENTITY));
            for _ in 0..5 {
                interp.advance(0.02);
                local += 0.02;
            }
        }

        assert_eq!(outcomes[0], FeedOutcome::Resynced);
        assert!(outcomes[1..].iter().all(|o| *o == FeedOutcome::Accepted));
        assert_eq!(interp.resets(), 2);
        let newest = 30.0 + 29.0 * 0.1;
        let timeline = interp.timeline().unwrap();
        assert!(newest - timeline < 0.6, "timeline {timeline} trails {newest}");
        let pose = interp.advance(0.0).unwrap();
        assert!(pose.position.x > 2.0, "rendered x = {}", pose.position.x);
    }

    #[test]
    fn test_feed_pushes_from_another_thread() {
        let interp = NetworkInterpolator::new(fixed_delay(0.1));
        let feed = interp.feed();
        let handle = std::thread::spawn(move || {
            for i in 0..5 {
                feed.push(i as f64 * 0.1, i as f64 * 0.1, at(i as f32), Quat::IDENTITY);
            }
        });
        handle.join().unwrap();
        assert_eq!(interp.buffered(), 5);
    }

    #[test]
    fn test_clear_forgets_timeline() {
        let interp = NetworkInterpolator::default();
        interp.push(1.0, 1.0, at(0.0), Quat::IDENTITY);
        interp.clear();
        assert_eq!(interp.timeline(), None);
        assert_eq!(interp.push(2.0, 2.0, at(0.0), Quat::IDENTITY), FeedOutcome::Seeded);
    }
}
