//! Time-ordered ring of pose samples with bracket lookup, pruning and
//! bounded extrapolation.

use std::collections::VecDeque;

use glam::{Quat, Vec3};

// ---------------------------------------------------------------------------
// PoseSample
// ---------------------------------------------------------------------------

/// One received pose, keyed by the server's send time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSample {
    /// Server session time at which the pose was sampled (seconds).
    pub remote_time: f64,
    /// Local session time at which the sample arrived (seconds).
    pub local_time: f64,
    /// World position.
    pub position: Vec3,
    /// World rotation.
    pub rotation: Quat,
}

/// How a rendered pose was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    /// Blended between two buffered samples.
    Interpolated,
    /// Projected past the newest sample using its velocity.
    Extrapolated,
    /// Clamped to the oldest or newest sample.
    Held,
}

/// Pose to render for a given timeline position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPose {
    /// Position to render.
    pub position: Vec3,
    /// Rotation to render.
    pub rotation: Quat,
    /// How it was produced.
    pub mode: SampleMode,
}

/// Outcome of [`InterpolationBuffer::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The sample was inserted in order.
    Inserted,
    /// A sample with the same remote time was replaced.
    Replaced,
    /// The buffer hit its cap; it now holds only the new sample.
    Overflowed,
}

/// Limits and thresholds for one buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferSettings {
    /// Hard cap on buffered samples.
    pub capacity: usize,
    /// Buffers at or below this length are searched linearly.
    pub linear_scan_limit: usize,
    /// Longest extrapolation past the newest sample (seconds).
    pub max_extrapolation: f64,
    /// Speed at or above which extrapolation is refused (m/s).
    pub running_speed: f32,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            capacity: 64,
            linear_scan_limit: 8,
            max_extrapolation: 0.25,
            running_speed: 4.0,
        }
    }
}

impl From<&nebula_config::InterpolationConfig> for BufferSettings {
    fn from(config: &nebula_config::InterpolationConfig) -> Self {
        Self {
            capacity: config.buffer_capacity.max(2),
            linear_scan_limit: config.linear_scan_limit,
            max_extrapolation: config.max_extrapolation.max(0.0),
            running_speed: config.running_speed,
        }
    }
}

// ---------------------------------------------------------------------------
// InterpolationBuffer
// ---------------------------------------------------------------------------

/// Pose samples sorted by `remote_time`, at most one per timestamp.
#[derive(Debug, Clone)]
pub struct InterpolationBuffer {
    samples: VecDeque<PoseSample>,
    settings: BufferSettings,
}

impl InterpolationBuffer {
    /// Empty buffer.
    pub fn new(settings: BufferSettings) -> Self {
        Self {
            samples: VecDeque::with_capacity(settings.capacity),
            settings,
        }
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Newest sample.
    pub fn latest(&self) -> Option<&PoseSample> {
        self.samples.back()
    }

    /// Oldest sample.
    pub fn oldest(&self) -> Option<&PoseSample> {
        self.samples.front()
    }

    /// Drop every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Insert in remote-time order. A sample whose remote time is already
    /// buffered replaces the old one.
    pub fn push(&mut self, sample: PoseSample) -> PushOutcome {
        let idx = self.upper_index(sample.remote_time);
        if idx > 0 && self.samples[idx - 1].remote_time == sample.remote_time {
            self.samples[idx - 1] = sample;
            return PushOutcome::Replaced;
        }

        if self.samples.len() >= self.settings.capacity {
            self.samples.clear();
            self.samples.push_back(sample);
            return PushOutcome::Overflowed;
        }

        self.samples.insert(idx, sample);
        PushOutcome::Inserted
    }

    /// Index of the first sample with `remote_time > t`.
    fn upper_index(&self, t: f64) -> usize {
        if self.samples.len() <= self.settings.linear_scan_limit {
            self.samples
                .iter()
                .position(|s| s.remote_time > t)
                .unwrap_or(self.samples.len())
        } else {
            self.samples.partition_point(|s| s.remote_time <= t)
        }
    }

    /// Pose for timeline position `t`.
    pub fn sample(&self, t: f64) -> Option<RenderPose> {
        let first = self.samples.front()?;
        if t <= first.remote_time {
            return Some(held(first));
        }

        let upper = self.upper_index(t);
        if upper < self.samples.len() {
            let a = &self.samples[upper - 1];
            let b = &self.samples[upper];
            let span = b.remote_time - a.remote_time;
            let alpha = if span > 0.0 {
                ((t - a.remote_time) / span).clamp(0.0, 1.0) as f32
            } else {
                1.0
            };
            return Some(RenderPose {
                position: a.position.lerp(b.position, alpha),
                rotation: a.rotation.slerp(b.rotation, alpha),
                mode: SampleMode::Interpolated,
            });
        }

        Some(self.extrapolate(t))
    }

    fn extrapolate(&self, t: f64) -> RenderPose {
        let n = self.samples.len();
        let last = &self.samples[n - 1];
        if n < 2 {
            return held(last);
        }
        let prev = &self.samples[n - 2];
        let dt = last.remote_time - prev.remote_time;
        if dt <= 0.0 {
            return held(last);
        }

        let velocity = (last.position - prev.position) / dt as f32;
        if !velocity.is_finite() || velocity.length() >= self.settings.running_speed {
            return held(last);
        }
        // Past the horizon the pose stays where extrapolation stopped.
        let overshoot = t - last.remote_time;
        let (overshoot, mode) = if overshoot > self.settings.max_extrapolation {
            (self.settings.max_extrapolation, SampleMode::Held)
        } else {
            (overshoot, SampleMode::Extrapolated)
        };
        RenderPose {
            position: last.position + velocity * overshoot as f32,
            rotation: last.rotation,
            mode,
        }
    }

    /// Drop samples no longer needed to render `t`: everything older than
    /// the newest sample at or before `t`, except that the newest two are
    /// always kept for the extrapolation velocity. Returns how many were
    /// dropped.
    pub fn prune(&mut self, t: f64) -> usize {
        let mut dropped = 0;
        while self.samples.len() > 2 && self.samples[1].remote_time <= t {
            self.samples.pop_front();
            dropped += 1;
        }
        dropped
    }
}

fn held(sample: &PoseSample) -> RenderPose {
    RenderPose {
        position: sample.position,
        rotation: sample.rotation,
        mode: SampleMode::Held,
    }
}
