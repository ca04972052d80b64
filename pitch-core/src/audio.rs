//! # Audio Capture Module
//!
//! Feeds the engine's shared input buffer from a live input device using
//! CPAL (Cross-Platform Audio Library). This is the host-side collaborator
//! of the pipeline: it mixes to mono, resamples to the model rate and
//! publishes the newest window once per hop.
//!
//! ## Features
//! - Automatic input device selection
//! - Prefers mono f32 configurations near the model sample rate
//! - Linear resampling to `MODEL_SAMPLE_RATE`
//! - Capture timestamps for end-to-end latency reporting

use crate::runtime::{FRAME_LEN, HOP_LEN, MODEL_SAMPLE_RATE};
use crate::shared::{SharedInputBuffer, now_ms};
use anyhow::{Result, anyhow};
use cpal::SupportedStreamConfigRange;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, info};
use std::sync::Arc;

/// Turns device-rate mono audio into model-rate hops and publishes the
/// newest window to a [`SharedInputBuffer`].
pub struct FrameAssembler {
    input: Arc<SharedInputBuffer>,
    /// Source samples advanced per output sample.
    step: f64,
    /// Fractional read position into the current source block.
    position: f64,
    /// Last source sample of the previous block, for interpolation across blocks.
    previous: f32,
    ring: Vec<f32>,
    /// Next write index in `ring`; also the oldest sample once full.
    head: usize,
    ordered: Vec<f32>,
    filled: usize,
    since_publish: usize,
}

impl FrameAssembler {
    pub fn new(input: Arc<SharedInputBuffer>, device_rate: u32) -> Self {
        Self {
            input,
            step: device_rate as f64 / MODEL_SAMPLE_RATE as f64,
            position: 0.0,
            previous: 0.0,
            ring: vec![0.0; FRAME_LEN],
            head: 0,
            ordered: vec![0.0; FRAME_LEN],
            filled: 0,
            since_publish: 0,
        }
    }

    /// Consumes one block of device-rate mono samples.
    pub fn push(&mut self, block: &[f32]) {
        if block.is_empty() {
            return;
        }
        // Position -1.0 refers to `previous`.
        while self.position < block.len() as f64 - 1.0 + f64::EPSILON {
            let base = self.position.floor();
            let frac = (self.position - base) as f32;
            let i = base as isize;
            let a = if i < 0 { self.previous } else { block[i as usize] };
            let b = block[(i + 1).clamp(0, block.len() as isize - 1) as usize];
            self.emit(a + (b - a) * frac);
            self.position += self.step;
        }
        self.position -= block.len() as f64;
        self.previous = block[block.len() - 1];
    }

    fn emit(&mut self, sample: f32) {
        self.ring[self.head] = sample;
        self.head = (self.head + 1) % FRAME_LEN;
        self.filled = (self.filled + 1).min(FRAME_LEN);

        self.since_publish += 1;
        if self.filled == FRAME_LEN && self.since_publish >= HOP_LEN {
            let (newest, oldest) = self.ring.split_at(self.head);
            self.ordered[..oldest.len()].copy_from_slice(oldest);
            self.ordered[oldest.len()..].copy_from_slice(newest);
            self.input.write_frame(&self.ordered, Some(now_ms()));
            self.since_publish = 0;
        }
    }
}

/// Starts audio capture from the default input device.
///
/// # Returns
/// * `Ok((stream, sample_rate))` - Stream handle (keep it alive) and the device rate
/// * `Err(e)` - No device or no usable f32 configuration
pub fn start_capture(input: Arc<SharedInputBuffer>) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("No input device available"))?;

    info!("Using audio input device: {}", device.name()?);

    let configs = device.supported_input_configs()?.collect::<Vec<_>>();
    let supported = find_supported_config(configs, MODEL_SAMPLE_RATE)
        .ok_or_else(|| anyhow!("No suitable f32 input format found"))?;

    let rate = MODEL_SAMPLE_RATE.clamp(supported.min_sample_rate().0, supported.max_sample_rate().0);
    let config = supported.with_sample_rate(cpal::SampleRate(rate));
    let channels = config.channels() as usize;
    let config: cpal::StreamConfig = config.into();

    info!("Selected capture format: {rate} Hz, {channels} channel(s)");

    let mut assembler = FrameAssembler::new(input, rate);
    let mut mono = Vec::with_capacity(4096);

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            mono.clear();
            mono.extend(
                data.chunks(channels.max(1))
                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
            );
            assembler.push(&mono);
        },
        |err| error!("An error occurred on the audio stream: {err}"),
        None,
    )?;

    stream.play()?;

    Ok((stream, rate))
}

/// Picks the f32 configuration closest to `target_rate`, preferring mono.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| {
            let rate_distance = if (c.min_sample_rate().0..=c.max_sample_rate().0).contains(&target_rate) {
                0
            } else {
                let min_diff = (c.min_sample_rate().0 as i64 - target_rate as i64).abs();
                let max_diff = (c.max_sample_rate().0 as i64 - target_rate as i64).abs();
                min_diff.min(max_diff)
            };
            (c.channels() != 1, rate_distance)
        })
}
