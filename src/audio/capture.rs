//! Microphone capture using PipeWire
//!
//! Produces fixed-size mono frames at the capture rate and feeds the input
//! analyzer. Frames are posted to the session controller, which owns encoding.

use crate::audio::Analyzer;
use crate::session::{CaptureHandle, EventSink, SessionEvent};
use log::{debug, warn};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::thread::{self, JoinHandle};

/// Fixed capture rate expected by the remote endpoint
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// One fixed-length block of captured mono samples
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Audio capture configuration
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Sample rate (default: 16000)
    pub sample_rate: u32,
    /// Number of channels (default: 1 for mono)
    pub channels: u32,
    /// Samples per delivered frame
    pub block_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: 1,
            block_size: 2048,
        }
    }
}

/// Cuts an arbitrary sample stream into fixed-size frames
pub struct FrameAssembler {
    block_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(block_size: usize, sample_rate: u32) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            sample_rate,
            pending: Vec::with_capacity(block_size),
        }
    }

    /// Add samples, returning every frame completed by them
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.block_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.block_size {
                let samples = std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.block_size),
                );
                frames.push(AudioFrame {
                    samples,
                    sample_rate: self.sample_rate,
                });
            }
        }
        frames
    }
}

/// Simple linear resampling
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 * ratio;
        let idx = src_idx as usize;
        let frac = (src_idx - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else {
            samples[idx.min(samples.len() - 1)]
        };

        output.push(sample);
    }

    output
}

/// Microphone capture graph backed by a PipeWire input stream
pub struct PipeWireCapture {
    thread_handle: Option<JoinHandle<()>>,
    sender: Option<pw::channel::Sender<PipeWireCommand>>,
}

enum PipeWireCommand {
    Stop,
}

impl PipeWireCapture {
    /// Start capturing on a background thread
    ///
    /// Failures inside the PipeWire loop (no daemon, permission denied,
    /// device lost) are reported through `sink` as `DeviceFailed`.
    pub fn open(
        config: CaptureConfig,
        sink: EventSink,
        analyzer: Analyzer,
    ) -> Result<Self, String> {
        let (sender, receiver) = pw::channel::channel::<PipeWireCommand>();

        let handle = thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || {
                if let Err(e) = run_capture_loop(config, sink.clone(), analyzer, receiver) {
                    sink.post(SessionEvent::DeviceFailed(e));
                }
            })
            .map_err(|e| format!("Failed to spawn capture thread: {}", e))?;

        Ok(Self {
            thread_handle: Some(handle),
            sender: Some(sender),
        })
    }
}

impl CaptureHandle for PipeWireCapture {
    fn close(&mut self) {
        // Send stop command
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PipeWireCommand::Stop);
        }

        // Wait for thread to finish
        if let Some(handle) = self.thread_handle.take() {
            super::join_audio_thread("Capture", handle);
            debug!("Capture thread joined");
        }
    }
}

impl Drop for PipeWireCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run the PipeWire capture loop in a background thread
fn run_capture_loop(
    config: CaptureConfig,
    sink: EventSink,
    analyzer: Analyzer,
    receiver: pw::channel::Receiver<PipeWireCommand>,
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
        PipeWireCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    // User data for the stream callbacks
    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        target_rate: u32,
        assembler: FrameAssembler,
        analyzer: Analyzer,
        sink: EventSink,
        mainloop_weak: pw::main_loop::MainLoopWeak,
    }

    let user_data = UserData {
        format: Default::default(),
        target_rate: config.sample_rate,
        assembler: FrameAssembler::new(config.block_size, config.sample_rate),
        analyzer,
        sink,
        mainloop_weak: mainloop.downgrade(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => "Parley",
    };

    let stream = pw::stream::StreamBox::new(&core, "parley-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .state_changed(|_, user_data, _old, new| {
            if let pw::stream::StreamState::Error(message) = new {
                warn!("Capture stream error: {}", message);
                user_data
                    .sink
                    .post(SessionEvent::DeviceFailed(message.to_string()));
                if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                    mainloop.quit();
                }
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
                warn!("Failed to parse capture format: {:?}", e);
                return;
            }
            debug!(
                "Capture format negotiated: {} Hz, {} channel(s)",
                user_data.format.rate(),
                user_data.format.channels()
            );
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1);
            let rate = match user_data.format.rate() {
                0 => user_data.target_rate,
                rate => rate,
            };
            let n_samples = data.chunk().size() / (std::mem::size_of::<f32>() as u32);

            let Some(raw_samples) = data.data() else {
                return;
            };

            // Keep the first channel only
            let mut mono_samples = Vec::with_capacity((n_samples / n_channels) as usize);
            for i in (0..n_samples).step_by(n_channels as usize) {
                let start = i as usize * std::mem::size_of::<f32>();
                let end = start + std::mem::size_of::<f32>();
                if end <= raw_samples.len() {
                    let sample =
                        f32::from_le_bytes(raw_samples[start..end].try_into().unwrap_or([0; 4]));
                    mono_samples.push(sample);
                }
            }

            let mono_samples = resample(&mono_samples, rate, user_data.target_rate);
            user_data.analyzer.push(&mono_samples);

            for frame in user_data.assembler.push(&mono_samples) {
                user_data.sink.post(SessionEvent::Frame(frame));
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    // Request mono F32LE at the capture rate
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(config.sample_rate);
    audio_info.set_channels(config.channels);

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

    stream
        .connect(
            spa::utils::Direction::Input,
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

    #[test]
    fn test_assembler_emits_fixed_frames() {
        let mut assembler = FrameAssembler::new(4, 16000);
        assert!(assembler.push(&[0.1, 0.2, 0.3]).is_empty());

        let frames = assembler.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(frames[1].samples, vec![0.5, 0.6, 0.7, 0.8]);
        assert!(frames.iter().all(|f| f.sample_rate == 16000));

        let frames = assembler.push(&[1.0, 1.0, 1.0]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, vec![0.9, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_resample() {
        let samples = vec![0.0, 1.0, 0.0, -1.0];
        let resampled = resample(&samples, 4, 2);
        assert_eq!(resampled.len(), 2);

        let upsampled = resample(&[0.0, 1.0], 16000, 32000);
        assert_eq!(upsampled, vec![0.0, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples = vec![0.25, -0.25];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }
}
