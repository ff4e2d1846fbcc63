//! Audio playback using PipeWire
//!
//! The output stream runs for the whole session and renders from a shared
//! timeline of scheduled buffers. Rendered frames define the output clock.

use crate::audio::Analyzer;
use crate::session::{BufferId, EventSink, OutputGraph, ScheduledBuffer, SessionEvent};
use log::{debug, warn};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Fixed playback rate of inbound audio
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

struct TimelineBuffer {
    id: BufferId,
    start_frame: u64,
    samples: Arc<[f32]>,
}

impl TimelineBuffer {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Buffers placed on the output clock, rendered frame by frame
pub struct Timeline {
    sample_rate: u32,
    frames_rendered: u64,
    buffers: Vec<TimelineBuffer>,
}

impl Timeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_rendered: 0,
            buffers: Vec::new(),
        }
    }

    /// Output clock in seconds
    pub fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    /// Place a buffer on the clock and return the start time actually used.
    /// A start the clock has already passed moves up to the next unrendered
    /// frame so no sample is skipped.
    pub fn insert(&mut self, id: BufferId, start_time: f64, samples: Arc<[f32]>) -> f64 {
        let requested = (start_time * self.sample_rate as f64).round().max(0.0) as u64;
        let start_frame = requested.max(self.frames_rendered);
        self.buffers.push(TimelineBuffer {
            id,
            start_frame,
            samples,
        });
        start_frame as f64 / self.sample_rate as f64
    }

    pub fn remove(&mut self, id: BufferId) {
        self.buffers.retain(|b| b.id != id);
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Render the next `out.len()` frames, returning buffers that finished
    pub fn render(&mut self, out: &mut [f32]) -> Vec<BufferId> {
        out.fill(0.0);
        let block_start = self.frames_rendered;
        let block_end = block_start + out.len() as u64;

        for buffer in &self.buffers {
            let from = buffer.start_frame.max(block_start);
            let to = buffer.end_frame().min(block_end);
            if from >= to {
                continue;
            }
            let src = (from - buffer.start_frame) as usize..(to - buffer.start_frame) as usize;
            let dst = (from - block_start) as usize..(to - block_start) as usize;
            out[dst].copy_from_slice(&buffer.samples[src]);
        }

        self.frames_rendered = block_end;

        let mut finished = Vec::new();
        self.buffers.retain(|b| {
            if b.end_frame() <= block_end {
                finished.push(b.id);
                false
            } else {
                true
            }
        });
        finished
    }
}

/// Frames to render in one cycle: what the graph requested, bounded by the
/// mapped buffer. Older servers report no request; fill the buffer then.
fn frames_to_render(available: usize, requested: usize) -> usize {
    if requested == 0 {
        available
    } else {
        requested.min(available)
    }
}

/// Thread-safe handle on the timeline shared with the render thread
#[derive(Clone)]
pub struct SharedTimeline {
    inner: Arc<Mutex<Timeline>>,
}

impl SharedTimeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Timeline::new(sample_rate))),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Timeline> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Speaker output graph backed by a PipeWire playback stream
pub struct PipeWireOutput {
    timeline: SharedTimeline,
    thread_handle: Option<JoinHandle<()>>,
    sender: Option<pw::channel::Sender<PlaybackCommand>>,
}

enum PlaybackCommand {
    Stop,
}

impl PipeWireOutput {
    /// Start the output stream on a background thread
    pub fn open(sample_rate: u32, sink: EventSink, analyzer: Analyzer) -> Result<Self, String> {
        let timeline = SharedTimeline::new(sample_rate);
        let (sender, receiver) = pw::channel::channel::<PlaybackCommand>();

        let thread_timeline = timeline.clone();
        let handle = thread::Builder::new()
            .name("parley-playback".to_string())
            .spawn(move || {
                if let Err(e) = run_playback_loop(
                    sample_rate,
                    thread_timeline,
                    sink.clone(),
                    analyzer,
                    receiver,
                ) {
                    sink.post(SessionEvent::DeviceFailed(e));
                }
            })
            .map_err(|e| format!("Failed to spawn playback thread: {}", e))?;

        Ok(Self {
            timeline,
            thread_handle: Some(handle),
            sender: Some(sender),
        })
    }
}

impl OutputGraph for PipeWireOutput {
    fn current_time(&self) -> f64 {
        self.timeline.lock().current_time()
    }

    fn start(&mut self, buffer: &ScheduledBuffer) -> f64 {
        self.timeline
            .lock()
            .insert(buffer.id, buffer.start_time, buffer.samples.clone())
    }

    fn stop(&mut self, id: BufferId) {
        self.timeline.lock().remove(id);
    }

    fn close(&mut self) {
        self.timeline.lock().clear();

        // Send stop command
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PlaybackCommand::Stop);
        }

        // Wait for thread to finish
        if let Some(handle) = self.thread_handle.take() {
            super::join_audio_thread("Playback", handle);
            debug!("Playback thread joined");
        }
    }
}

impl Drop for PipeWireOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run the PipeWire playback loop in a background thread
fn run_playback_loop(
    sample_rate: u32,
    timeline: SharedTimeline,
    sink: EventSink,
    analyzer: Analyzer,
    receiver: pw::channel::Receiver<PlaybackCommand>,
) -> Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    // Set up channel receiver to stop the loop
    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        PlaybackCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    // User data for the stream callbacks
    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        timeline: SharedTimeline,
        analyzer: Analyzer,
        sink: EventSink,
        mono: Vec<f32>,
    }

    let user_data = UserData {
        format: Default::default(),
        timeline,
        analyzer,
        sink,
        mono: Vec::new(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => "Parley",
    };

    let stream = pw::stream::StreamBox::new(&core, "parley-playback", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .state_changed(|_, user_data, _old, new| {
            if let pw::stream::StreamState::Error(message) = new {
                warn!("Playback stream error: {}", message);
                user_data
                    .sink
                    .post(SessionEvent::DeviceFailed(message.to_string()));
            }
        })
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }

            let (media_type, media_subtype) = match format_utils::parse_format(param) {
                Ok(v) => v,
                Err(_) => return,
            };

            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }

            if let Err(e) = user_data.format.parse(param) {
                warn!("Failed to parse playback format: {:?}", e);
            }
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            // Frames the graph wants this cycle; the mapped buffer is larger
            let requested = buffer.requested() as usize;

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1) as usize;
            let stride = std::mem::size_of::<f32>() * n_channels;

            let Some(slice) = data.data() else {
                return;
            };

            let n_frames = frames_to_render(slice.len() / stride, requested);
            user_data.mono.resize(n_frames, 0.0);

            // Lock only for the render itself
            let finished = user_data.timeline.lock().render(&mut user_data.mono);

            for (i, &sample) in user_data.mono.iter().enumerate() {
                let bytes = sample.to_le_bytes();
                for channel in 0..n_channels {
                    let offset = i * stride + channel * std::mem::size_of::<f32>();
                    slice[offset..offset + 4].copy_from_slice(&bytes);
                }
            }

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = (n_frames * stride) as u32;

            user_data.analyzer.push(&user_data.mono);
            for id in finished {
                user_data.sink.post(SessionEvent::PlaybackFinished(id));
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    // Request mono F32LE at the playback rate
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(sample_rate);
    audio_info.set_channels(1);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    let values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner();

    let pod = Pod::from_bytes(&values).ok_or("Failed to build audio format pod")?;
    let mut params = [pod];

    // Connect the stream (Output direction for playback)
    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    // Run until stopped
    mainloop.run();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(len: usize, value: f32) -> Arc<[f32]> {
        vec![value; len].into()
    }

    #[test]
    fn test_render_places_buffers_on_clock() {
        let mut timeline = Timeline::new(10);
        timeline.insert(1, 0.2, samples(3, 0.5));
        timeline.insert(2, 0.5, samples(2, -0.5));

        let mut out = [9.0; 6];
        let finished = timeline.render(&mut out);
        assert_eq!(out, [0.0, 0.0, 0.5, 0.5, 0.5, -0.5]);
        assert_eq!(finished, vec![1]);
        assert!((timeline.current_time() - 0.6).abs() < 1e-9);

        let mut out = [9.0; 4];
        let finished = timeline.render(&mut out);
        assert_eq!(out, [-0.5, 0.0, 0.0, 0.0]);
        assert_eq!(finished, vec![2]);
        assert_eq!(timeline.len(), 0);
    }

    #[test]
    fn test_removed_buffer_is_silent_and_never_finishes() {
        let mut timeline = Timeline::new(10);
        timeline.insert(7, 0.0, samples(4, 1.0));

        let mut out = [0.0; 2];
        assert!(timeline.render(&mut out).is_empty());
        assert_eq!(out, [1.0, 1.0]);

        timeline.remove(7);
        let mut out = [0.0; 4];
        assert!(timeline.render(&mut out).is_empty());
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn test_quantum_blocks_report_completion_when_heard() {
        // 200 ms chunk at 50 ms, rendered in 1024-frame graph cycles
        let mut timeline = Timeline::new(24000);
        timeline.insert(1, 0.05, samples(4800, 0.25));
        let end_frame = 1200 + 4800;

        let mut out = vec![0.0; frames_to_render(8192, 1024)];
        assert_eq!(out.len(), 1024);

        let mut rendered = 0;
        loop {
            let finished = timeline.render(&mut out);
            rendered += out.len();
            if rendered < end_frame {
                assert!(finished.is_empty(), "finished early at frame {}", rendered);
                assert!(timeline.current_time() < 0.25);
            } else {
                assert_eq!(finished, vec![1]);
                break;
            }
        }
        // The clock never runs more than one cycle ahead of the chunk end
        assert!(rendered - end_frame < 1024);
    }

    #[test]
    fn test_frames_to_render_honours_request() {
        assert_eq!(frames_to_render(8192, 256), 256);
        assert_eq!(frames_to_render(512, 1024), 512);
        assert_eq!(frames_to_render(8192, 0), 8192);
    }

    #[test]
    fn test_late_insert_moves_to_next_unrendered_frame() {
        let mut timeline = Timeline::new(24000);
        let mut out = vec![0.0; 1024];
        timeline.render(&mut out);

        // Requested 25 ms, but the clock is already at 1024 frames
        let start = timeline.insert(1, 0.025, samples(2400, 0.5));
        assert!((start - 1024.0 / 24000.0).abs() < 1e-9);

        let mut heard = 0;
        let mut out = vec![0.0; 1024];
        for _ in 0..4 {
            timeline.render(&mut out);
            heard += out.iter().filter(|&&s| s == 0.5).count();
        }
        assert_eq!(heard, 2400);
    }

    #[test]
    fn test_clock_advances_through_silence() {
        let mut timeline = Timeline::new(24000);
        let mut out = vec![0.0; 2400];
        timeline.render(&mut out);
        timeline.render(&mut out);
        assert!((timeline.current_time() - 0.2).abs() < 1e-9);
    }
}
