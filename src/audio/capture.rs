//! Microphone capture via cpal.
//!
//! Opens the default (or named) input device at its native sample rate,
//! down-mixes to mono i16, and delivers fixed 512-sample frames through
//! a lock-free ring. Consumers resample as needed (16 kHz for VAD,
//! 24 kHz for uplink).

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use tracing::{error, info};

use crate::error::AssistantError;

use super::ring_buffer::{audio_ring_buffer, AudioConsumer, AudioProducer};
use super::CAPTURE_FRAME_SAMPLES;

/// List available input device names.
pub fn list_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.input_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

/// Resolved info about the audio input we will use.
struct CaptureConfig {
    device: cpal::Device,
    stream_config: StreamConfig,
    native_rate: u32,
}

/// Find and configure the input device.
fn resolve_device(device_name: Option<&str>) -> Result<CaptureConfig, AssistantError> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| AssistantError::RecorderFailure(format!("enumerate input devices: {e}")))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AssistantError::RecorderFailure(format!("input device not found: {name}")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| AssistantError::RecorderFailure("no default input device".to_string()))?
    };

    let dev_name = device.name().unwrap_or_else(|_| "unknown".into());

    let default_config = device
        .default_input_config()
        .map_err(|e| AssistantError::RecorderFailure(format!("default input config: {e}")))?;

    let native_rate = default_config.sample_rate().0;
    let channels = default_config.channels();

    let stream_config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    info!(device = %dev_name, native_rate, channels, "selected input device");

    Ok(CaptureConfig {
        device,
        stream_config,
        native_rate,
    })
}

/// Down-mix multi-channel audio to mono by averaging channels.
fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

fn build_stream(
    cfg: CaptureConfig,
    mut producer: AudioProducer,
) -> Result<Stream, AssistantError> {
    let channels = cfg.stream_config.channels;
    let mut chunk_buf: Vec<i16> = Vec::with_capacity(CAPTURE_FRAME_SAMPLES * 2);

    let stream = cfg
        .device
        .build_input_stream(
            &cfg.stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = to_mono(data, channels);
                for s in mono {
                    chunk_buf.push((s.clamp(-1.0, 1.0) * 32767.0) as i16);
                }
                // Push whole frames so the consumer sees aligned chunks.
                while chunk_buf.len() >= CAPTURE_FRAME_SAMPLES {
                    let frame: Vec<i16> = chunk_buf.drain(..CAPTURE_FRAME_SAMPLES).collect();
                    let written = producer.push_slice(&frame);
                    if written < CAPTURE_FRAME_SAMPLES {
                        // Ring full — oldest audio is lost; consumer catches up.
                    }
                }
            },
            move |err| {
                error!("audio input stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AssistantError::RecorderFailure(format!("build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| AssistantError::RecorderFailure(format!("start input stream: {e}")))?;

    Ok(stream)
}

/// An open microphone delivering fixed-size PCM16 mono frames.
///
/// The cpal stream stays alive for the lifetime of this value; dropping
/// it releases the device. Frames are produced lazily — `read_frame`
/// never blocks and allocates only the returned frame.
pub struct Microphone {
    _stream: Stream,
    consumer: AudioConsumer,
    native_rate: u32,
}

impl Microphone {
    /// Open the default (or named) input device.
    pub fn open(device_name: Option<&str>) -> Result<Self, AssistantError> {
        let cfg = resolve_device(device_name)?;
        let native_rate = cfg.native_rate;
        let (producer, consumer) = audio_ring_buffer(None);
        let stream = build_stream(cfg, producer)?;
        info!("audio capture started");
        Ok(Self {
            _stream: stream,
            consumer,
            native_rate,
        })
    }

    /// The device's native sample rate; frames are delivered at this rate.
    pub fn native_sample_rate(&self) -> u32 {
        self.native_rate
    }

    /// Pop the next full frame if one is available.
    pub fn read_frame(&mut self) -> Option<Vec<i16>> {
        if self.consumer.available() < CAPTURE_FRAME_SAMPLES {
            return None;
        }
        let mut frame = vec![0i16; CAPTURE_FRAME_SAMPLES];
        let read = self.consumer.pop_slice(&mut frame);
        debug_assert_eq!(read, CAPTURE_FRAME_SAMPLES);
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_channels() {
        let stereo = [0.2f32, 0.4, -0.2, -0.4];
        let mono = to_mono(&stereo, 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!((mono[1] + 0.3).abs() < 1e-6);
    }

    #[test]
    fn downmix_mono_is_identity() {
        let input = [0.5f32, -0.5];
        assert_eq!(to_mono(&input, 1), input);
    }
}
