//! Orb animation driven by live amplitude
//!
//! Sampled once per UI refresh. Only reads the analyzers; never touches the
//! audio graphs themselves.

use crate::audio::Analyzer;
use crate::session::{Activity, Phase, SessionStatus};

/// Weight of the newest sample in the smoothed intensity
const SMOOTHING: f32 = 0.3;

const MAX_SCALE_GAIN: f32 = 0.45;

const IDLE_COLOR: u32 = 0x2d2d44;
const LISTENING_COLOR: u32 = 0x0f3460;
const LISTENING_HIGHLIGHT: u32 = 0x4cc9f0;
const SPEAKING_COLOR: u32 = 0xe94560;
const SPEAKING_HIGHLIGHT: u32 = 0xff9eb0;

/// How the orb should be drawn this frame
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VisualFrame {
    pub scale: f32,
    pub glow: f32,
    /// 0xRRGGBB
    pub color: u32,
}

impl Default for VisualFrame {
    fn default() -> Self {
        Self {
            scale: 1.0,
            glow: 0.0,
            color: IDLE_COLOR,
        }
    }
}

#[derive(Debug, Default)]
pub struct VisualFeedbackLoop {
    intensity: f32,
}

impl VisualFeedbackLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance one tick. Outside an open session the orb settles back to
    /// rest; inside, it follows whichever side is currently producing audio.
    pub fn tick(
        &mut self,
        status: &SessionStatus,
        input: Option<&Analyzer>,
        output: Option<&Analyzer>,
    ) -> VisualFrame {
        let (target, base, highlight) = match (status.phase, status.activity) {
            (Phase::Open, Activity::AgentSpeaking) => (
                output.map(Analyzer::amplitude).unwrap_or(0.0),
                SPEAKING_COLOR,
                SPEAKING_HIGHLIGHT,
            ),
            (Phase::Open, Activity::Listening) => (
                input.map(Analyzer::amplitude).unwrap_or(0.0),
                LISTENING_COLOR,
                LISTENING_HIGHLIGHT,
            ),
            (Phase::Connecting, _) => (0.0, LISTENING_COLOR, LISTENING_HIGHLIGHT),
            _ => (0.0, IDLE_COLOR, IDLE_COLOR),
        };

        let target = target.clamp(0.0, 1.0);
        self.intensity += (target - self.intensity) * SMOOTHING;
        if self.intensity < 1e-4 {
            self.intensity = 0.0;
        }

        VisualFrame {
            scale: 1.0 + MAX_SCALE_GAIN * self.intensity,
            glow: self.intensity,
            color: mix(base, highlight, self.intensity),
        }
    }
}

/// Linear blend of two 0xRRGGBB colors
fn mix(from: u32, to: u32, t: f32) -> u32 {
    let channel = |shift: u32| {
        let a = ((from >> shift) & 0xff) as f32;
        let b = ((to >> shift) & 0xff) as f32;
        ((a + (b - a) * t).round() as u32).min(0xff) << shift
    };
    channel(16) | channel(8) | channel(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(phase: Phase, activity: Activity) -> SessionStatus {
        SessionStatus {
            phase,
            activity,
            error: None,
        }
    }

    fn loud_analyzer() -> Analyzer {
        let analyzer = Analyzer::new();
        let samples: Vec<f32> = (0..1024)
            .map(|i| (i as f32 * 0.7).sin() * 0.9)
            .collect();
        analyzer.push(&samples);
        analyzer
    }

    #[test]
    fn test_idle_stays_at_rest() {
        let mut visual = VisualFeedbackLoop::new();
        let loud = loud_analyzer();
        let frame = visual.tick(&status(Phase::Idle, Activity::Listening), Some(&loud), Some(&loud));
        assert_eq!(frame, VisualFrame::default());
    }

    #[test]
    fn test_follows_active_side() {
        let loud = loud_analyzer();
        let quiet = Analyzer::new();

        let mut visual = VisualFeedbackLoop::new();
        let mut frame = VisualFrame::default();
        for _ in 0..30 {
            frame = visual.tick(
                &status(Phase::Open, Activity::AgentSpeaking),
                Some(&quiet),
                Some(&loud),
            );
        }
        assert!(frame.scale > 1.0);
        assert!(frame.scale <= 1.0 + MAX_SCALE_GAIN);
        assert!(frame.glow > 0.0);
        assert_ne!(frame.color, SPEAKING_COLOR);

        // Switching to listening on a silent mic decays back toward rest
        for _ in 0..200 {
            frame = visual.tick(
                &status(Phase::Open, Activity::Listening),
                Some(&quiet),
                Some(&loud),
            );
        }
        assert_eq!(frame.glow, 0.0);
        assert_eq!(frame.color, LISTENING_COLOR);
    }

    #[test]
    fn test_missing_analyzer_is_silent() {
        let mut visual = VisualFeedbackLoop::new();
        let frame = visual.tick(&status(Phase::Open, Activity::AgentSpeaking), None, None);
        assert_eq!(frame.scale, 1.0);
        assert_eq!(frame.color, SPEAKING_COLOR);
    }

    #[test]
    fn test_mix_endpoints() {
        assert_eq!(mix(0x000000, 0xffffff, 0.0), 0x000000);
        assert_eq!(mix(0x000000, 0xffffff, 1.0), 0xffffff);
        assert_eq!(mix(0x102030, 0x102030, 0.5), 0x102030);
    }
}
