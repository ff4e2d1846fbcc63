//! Gapless, interruptible playback scheduling
//!
//! Inbound chunks arrive at irregular intervals with irregular durations.
//! Each one is placed on the output clock directly after the previous one,
//! so playback is continuous as long as audio keeps arriving ahead of the
//! clock. The in-flight map is the single authority for "agent speaking".

use crate::audio::codec;
use crate::error::DecodeError;
use crate::session::{BufferId, InboundChunk};
use log::{debug, trace, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// The exclusively owned output audio graph
pub trait OutputGraph: Send {
    /// Position of the output clock in seconds
    fn current_time(&self) -> f64;

    /// Start `buffer` at its start time, or at the next unrendered instant if
    /// the clock has moved past it since it was read. Returns the start time
    /// actually used. Completion is reported through the session's event
    /// queue as `PlaybackFinished`.
    fn start(&mut self, buffer: &ScheduledBuffer) -> f64;

    /// Stop a buffer immediately; it must not report completion afterwards
    fn stop(&mut self, id: BufferId);

    /// Release the graph. Must be idempotent.
    fn close(&mut self);
}

/// A decoded chunk with its place on the output clock
#[derive(Clone, Debug)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start_time: f64,
    pub duration: f64,
    pub samples: Arc<[f32]>,
}

#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    /// Distance from "now" under which playback counts as starting from silence
    pub guard_window: Duration,
    /// Delay added when starting from silence
    pub lead_in: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::audio::PLAYBACK_SAMPLE_RATE,
            guard_window: Duration::from_millis(20),
            lead_in: Duration::from_millis(50),
        }
    }
}

/// Edge of the agent's speaking state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeakingChange {
    Started,
    Finished,
}

/// Result of a successful enqueue
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scheduled {
    pub id: BufferId,
    pub start_time: f64,
    pub duration: f64,
    pub change: Option<SpeakingChange>,
}

#[derive(Clone, Copy, Debug)]
struct InFlight {
    start_time: f64,
    duration: f64,
}

pub struct PlaybackScheduler {
    config: PlaybackConfig,
    graph: Box<dyn OutputGraph>,
    next_start_time: f64,
    in_flight: BTreeMap<BufferId, InFlight>,
    next_id: BufferId,
    speaking: bool,
    closed: bool,
}

impl PlaybackScheduler {
    pub fn new(config: PlaybackConfig, graph: Box<dyn OutputGraph>) -> Self {
        let next_start_time = graph.current_time();
        Self {
            config,
            graph,
            next_start_time,
            in_flight: BTreeMap::new(),
            next_id: 1,
            speaking: false,
            closed: false,
        }
    }

    #[cfg(test)]
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    #[cfg(test)]
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Decode a chunk and schedule it directly after everything pending
    pub fn enqueue(&mut self, chunk: &InboundChunk) -> Result<Scheduled, DecodeError> {
        let samples = match codec::decode(&chunk.payload) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Dropping inbound chunk #{}: {}", chunk.seq, e);
                return Err(e);
            }
        };
        let duration = codec::duration_seconds(samples.len(), self.config.sample_rate);

        let now = self.graph.current_time();
        if self.next_start_time < now {
            // Fell behind; resume at now rather than compressing
            self.next_start_time = now;
        }
        if self.next_start_time - now < self.config.guard_window.as_secs_f64() {
            self.next_start_time += self.config.lead_in.as_secs_f64();
        }

        let id = self.next_id;
        self.next_id += 1;

        let buffer = ScheduledBuffer {
            id,
            start_time: self.next_start_time,
            duration,
            samples: samples.into(),
        };
        let start_time = self.graph.start(&buffer);
        if start_time > buffer.start_time {
            debug!(
                "Buffer {} started {:.1}ms late, clock moved during scheduling",
                id,
                (start_time - buffer.start_time) * 1000.0
            );
        }
        self.in_flight.insert(
            id,
            InFlight {
                start_time,
                duration,
            },
        );
        self.next_start_time = start_time + duration;

        trace!(
            "Chunk #{} scheduled as buffer {} at {:.3}s for {:.3}s (clock {:.3}s)",
            chunk.seq,
            id,
            start_time,
            duration,
            now
        );

        let change = if self.speaking {
            None
        } else {
            self.speaking = true;
            Some(SpeakingChange::Started)
        };

        Ok(Scheduled {
            id,
            start_time,
            duration,
            change,
        })
    }

    /// A buffer finished rendering; stale ids are ignored
    pub fn complete(&mut self, id: BufferId) -> Option<SpeakingChange> {
        let entry = self.in_flight.remove(&id)?;
        trace!(
            "Buffer {} finished ({:.3}s + {:.3}s)",
            id,
            entry.start_time,
            entry.duration
        );

        if self.in_flight.is_empty() && self.speaking {
            self.speaking = false;
            Some(SpeakingChange::Finished)
        } else {
            None
        }
    }

    /// Cancel all playback immediately and reset the clock to now
    pub fn interrupt(&mut self) -> Option<SpeakingChange> {
        let cancelled = self.in_flight.len();
        for id in std::mem::take(&mut self.in_flight).into_keys() {
            self.graph.stop(id);
        }
        self.next_start_time = self.graph.current_time();

        if cancelled > 0 {
            debug!("Interrupted playback, {} buffer(s) cancelled", cancelled);
        }

        if self.speaking {
            self.speaking = false;
            Some(SpeakingChange::Finished)
        } else {
            None
        }
    }

    /// Stop everything and release the output graph
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.interrupt();
        self.graph.close();
        self.closed = true;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use base64::prelude::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    /// Output graph with a hand-driven clock
    #[derive(Clone, Default)]
    pub(crate) struct FakeGraph {
        pub(crate) state: Arc<Mutex<FakeGraphState>>,
    }

    #[derive(Default)]
    pub(crate) struct FakeGraphState {
        pub(crate) now: f64,
        pub(crate) started: Vec<(BufferId, f64, f64)>,
        pub(crate) stopped: Vec<BufferId>,
        pub(crate) playing: Vec<BufferId>,
        pub(crate) close_calls: usize,
        /// Clock advance applied between reading the clock and starting
        pub(crate) start_lag: f64,
    }

    impl FakeGraph {
        pub(crate) fn set_now(&self, now: f64) {
            self.state.lock().unwrap().now = now;
        }
    }

    impl OutputGraph for FakeGraph {
        fn current_time(&self) -> f64 {
            self.state.lock().unwrap().now
        }

        fn start(&mut self, buffer: &ScheduledBuffer) -> f64 {
            let mut state = self.state.lock().unwrap();
            state.now += state.start_lag;
            let start_time = buffer.start_time.max(state.now);
            state.started.push((buffer.id, start_time, buffer.duration));
            state.playing.push(buffer.id);
            start_time
        }

        fn stop(&mut self, id: BufferId) {
            let mut state = self.state.lock().unwrap();
            state.stopped.push(id);
            state.playing.retain(|&p| p != id);
        }

        fn close(&mut self) {
            let mut state = self.state.lock().unwrap();
            state.close_calls += 1;
            state.playing.clear();
        }
    }

    /// A chunk carrying `ms` milliseconds of 24 kHz audio
    pub(crate) fn chunk(seq: u64, ms: u64) -> InboundChunk {
        let bytes = vec![0x10u8; (24 * ms as usize) * 2];
        InboundChunk {
            seq,
            payload: BASE64_STANDARD.encode(bytes),
        }
    }

    fn scheduler() -> (PlaybackScheduler, FakeGraph) {
        let graph = FakeGraph::default();
        let scheduler = PlaybackScheduler::new(PlaybackConfig::default(), Box::new(graph.clone()));
        (scheduler, graph)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_first_chunk_gets_lead_in() {
        let (mut scheduler, _graph) = scheduler();
        let scheduled = scheduler.enqueue(&chunk(0, 500)).unwrap();

        assert!(approx(scheduled.start_time, 0.05));
        assert!(approx(scheduled.duration, 0.5));
        assert_eq!(scheduled.change, Some(SpeakingChange::Started));
        assert!(scheduler.is_speaking());

        // Playback drains at lead-in + duration
        assert_eq!(scheduler.complete(scheduled.id), Some(SpeakingChange::Finished));
        assert!(!scheduler.is_speaking());
    }

    #[test]
    fn test_back_to_back_chunks_are_gapless() {
        let (mut scheduler, _graph) = scheduler();
        let first = scheduler.enqueue(&chunk(0, 300)).unwrap();
        let second = scheduler.enqueue(&chunk(1, 400)).unwrap();

        assert!(approx(second.start_time, first.start_time + 0.3));
        assert_eq!(second.change, None);
        assert_eq!(scheduler.in_flight_len(), 2);
    }

    #[test]
    fn test_falling_behind_resumes_at_now() {
        let (mut scheduler, graph) = scheduler();
        let first = scheduler.enqueue(&chunk(0, 100)).unwrap();
        scheduler.complete(first.id);

        graph.set_now(2.0);
        let late = scheduler.enqueue(&chunk(1, 100)).unwrap();
        assert!(approx(late.start_time, 2.05));
    }

    #[test]
    fn test_interrupt_clears_and_resets_clock() {
        let (mut scheduler, graph) = scheduler();
        let scheduled = scheduler.enqueue(&chunk(0, 500)).unwrap();

        graph.set_now(0.15);
        assert_eq!(scheduler.interrupt(), Some(SpeakingChange::Finished));
        assert_eq!(scheduler.in_flight_len(), 0);
        assert!(approx(scheduler.next_start_time(), 0.15));
        assert!(graph.state.lock().unwrap().playing.is_empty());
        assert_eq!(graph.state.lock().unwrap().stopped, vec![scheduled.id]);

        // A completion racing the interrupt is ignored
        assert_eq!(scheduler.complete(scheduled.id), None);
    }

    #[test]
    fn test_clock_moving_during_scheduling_pushes_start() {
        let config = PlaybackConfig {
            lead_in: Duration::from_millis(10),
            ..PlaybackConfig::default()
        };
        let graph = FakeGraph::default();
        graph.state.lock().unwrap().start_lag = 0.0427;
        let mut scheduler = PlaybackScheduler::new(config, Box::new(graph.clone()));

        let first = scheduler.enqueue(&chunk(0, 100)).unwrap();
        assert!(approx(first.start_time, 0.0427));

        // The next chunk follows the start actually used, without overlap
        graph.state.lock().unwrap().start_lag = 0.0;
        let second = scheduler.enqueue(&chunk(1, 100)).unwrap();
        assert!(approx(second.start_time, 0.1427));
    }

    #[test]
    fn test_interrupt_when_silent_is_quiet() {
        let (mut scheduler, _graph) = scheduler();
        assert_eq!(scheduler.interrupt(), None);
    }

    #[test]
    fn test_decode_failure_leaves_state_untouched() {
        let (mut scheduler, graph) = scheduler();
        let bad = InboundChunk {
            seq: 3,
            payload: "%%%".to_string(),
        };
        assert!(scheduler.enqueue(&bad).is_err());
        let empty = InboundChunk {
            seq: 4,
            payload: String::new(),
        };
        assert_eq!(scheduler.enqueue(&empty).unwrap_err(), DecodeError::Empty);

        assert_eq!(scheduler.in_flight_len(), 0);
        assert!(!scheduler.is_speaking());
        assert!(approx(scheduler.next_start_time(), 0.0));
        assert!(graph.state.lock().unwrap().started.is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut scheduler, graph) = scheduler();
        scheduler.enqueue(&chunk(0, 100)).unwrap();
        scheduler.close();
        scheduler.close();

        let state = graph.state.lock().unwrap();
        assert_eq!(state.close_calls, 1);
        assert!(state.playing.is_empty());
        assert_eq!(scheduler.in_flight_len(), 0);
    }

    proptest! {
        #[test]
        fn prop_schedule_is_monotonic_and_non_overlapping(
            steps in proptest::collection::vec((1u64..400, 0u64..300), 1..40)
        ) {
            let (mut scheduler, graph) = scheduler();
            let mut now = 0.0;
            let mut previous: Option<(f64, f64)> = None;

            for (seq, (duration_ms, gap_ms)) in steps.into_iter().enumerate() {
                now += gap_ms as f64 / 1000.0;
                graph.set_now(now);
                let scheduled = scheduler.enqueue(&chunk(seq as u64, duration_ms)).unwrap();

                prop_assert!(scheduled.start_time >= now);
                if let Some((start, duration)) = previous {
                    prop_assert!(scheduled.start_time >= start);
                    prop_assert!(scheduled.start_time + 1e-9 >= start + duration);
                }
                previous = Some((scheduled.start_time, scheduled.duration));
            }
        }
    }
}
