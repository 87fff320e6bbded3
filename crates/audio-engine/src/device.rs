//! Playback device binding.
//!
//! Output is abstracted as an [`OutputBackend`] that negotiates a format and opens an
//! [`OutputStream`] driving a real-time render callback. The CPAL binding here:
//! - picks the default device or one matched by substring
//! - picks the supported config closest to the source format
//! - renders into an `f32` scratch buffer and converts to the device sample format

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::decode::PcmFormat;

/// Real-time render callback: fill the interleaved buffer completely.
///
/// Runs on the device thread. It must not block on anything the control thread can hold.
pub type RenderFn = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Factory for output streams.
pub trait OutputBackend {
    /// Choose the format the device will run at for a source in `native` format.
    fn negotiate(&mut self, native: PcmFormat) -> Result<PcmFormat>;

    /// Open a stream at the negotiated `format`. The stream starts stopped.
    fn open(&mut self, format: PcmFormat, render: RenderFn) -> Result<Box<dyn OutputStream>>;
}

/// An open output stream.
///
/// `start`/`stop` are idempotent. Dropping the stream closes the device: once the drop
/// returns, the render callback is never invoked again and has been dropped.
pub trait OutputStream {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn format(&self) -> PcmFormat;
}

/// CPAL-backed output.
pub struct CpalOutput {
    host: cpal::Host,
    device_name: Option<String>,
    buffer_frames: Option<u32>,
    negotiated: Option<(cpal::Device, cpal::SupportedStreamConfig)>,
}

impl CpalOutput {
    pub fn new(device_name: Option<String>, buffer_frames: Option<u32>) -> Self {
        Self {
            host: cpal::default_host(),
            device_name,
            buffer_frames,
            negotiated: None,
        }
    }
}

impl OutputBackend for CpalOutput {
    fn negotiate(&mut self, native: PcmFormat) -> Result<PcmFormat> {
        let device = pick_device(&self.host, self.device_name.as_deref())?;
        let config = pick_output_config(&device, Some(native.sample_rate), native.channels)?;
        let format = PcmFormat::new(config.sample_rate(), config.channels());
        tracing::info!(
            device = %device.description().map(|d| d.to_string()).unwrap_or_default(),
            rate_hz = format.sample_rate,
            channels = format.channels,
            sample_format = ?config.sample_format(),
            "output format negotiated"
        );
        self.negotiated = Some((device, config));
        Ok(format)
    }

    fn open(&mut self, format: PcmFormat, render: RenderFn) -> Result<Box<dyn OutputStream>> {
        let (device, config) = self
            .negotiated
            .take()
            .ok_or_else(|| anyhow!("output opened before format negotiation"))?;
        let mut stream_config: cpal::StreamConfig = config.clone().into();
        if let Some(buf) = pick_buffer_size(&config, self.buffer_frames) {
            stream_config.buffer_size = buf;
        }
        let stream =
            build_output_stream(&device, &stream_config, config.sample_format(), render)?;
        // Some hosts start streams on creation.
        stream.pause().context("pause new stream")?;
        Ok(Box::new(CpalStream { stream, format }))
    }
}

struct CpalStream {
    stream: cpal::Stream,
    format: PcmFormat,
}

impl OutputStream for CpalStream {
    fn start(&mut self) -> Result<()> {
        self.stream.play().context("start output stream")
    }

    fn stop(&mut self) -> Result<()> {
        self.stream.pause().context("stop output stream")
    }

    fn format(&self) -> PcmFormat {
        self.format
    }
}

/// Build a CPAL output stream driven by `render`.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    render: RenderFn,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, render),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, render),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, render),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, render),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Type-specialized stream builder for CPAL sample formats.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut render: RenderFn,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let initial_frames = match config.buffer_size {
        cpal::BufferSize::Fixed(n) => n as usize,
        cpal::BufferSize::Default => 4096,
    };
    // Sized up front; only grows if the host hands out a larger buffer than advertised.
    let mut scratch = vec![0.0f32; initial_frames * channels];

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            if scratch.len() < data.len() {
                scratch.resize(data.len(), 0.0);
            }
            let buf = &mut scratch[..data.len()];
            render(buf);
            for (dst, src) in data.iter_mut().zip(buf.iter()) {
                *dst = <T as cpal::Sample>::from_sample::<f32>(*src);
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Pick the first output device matching `needle` (case-insensitive), or the default device.
///
/// Returns an error if no suitable device is found.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .ok()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Pick the best supported output config for the device.
///
/// If `target_rate` is `Some`, prefer the highest supported sample rate that is
/// **<= target_rate**; if none are <=, choose the lowest supported rate above it.
/// If `None`, choose the highest supported rate. Ties prefer the source channel count
/// (then stereo), then `f32` over integer formats.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
    target_channels: u16,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();

    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            below: target_rate.map(|t| rate <= t).unwrap_or(true),
            rate,
            channel_rank: channel_rank(range.channels(), target_channels),
            format_rank: sample_format_rank(range.sample_format()),
        };
        if candidate.format_rank >= UNSUPPORTED_FORMAT_RANK {
            continue;
        }
        let replace = match &best {
            None => true,
            Some((b, _)) => candidate.is_better_than(b),
        };
        if replace {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Pick a stream buffer size.
///
/// A requested size is clamped into the device range. Without a request, prefer larger
/// values (capped) to reduce underruns. `None` lets CPAL use the device default.
pub fn pick_buffer_size(
    config: &cpal::SupportedStreamConfig,
    requested: Option<u32>,
) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed(choose_buffer_frames(*min, *max, requested)))
        }
        cpal::SupportedBufferSize::Unknown => requested.map(cpal::BufferSize::Fixed),
    }
}

fn choose_buffer_frames(min: u32, max: u32, requested: Option<u32>) -> u32 {
    const MAX_FRAMES: u32 = 16_384;
    if let Some(req) = requested {
        return req.clamp(min, max.max(min));
    }
    if max > MAX_FRAMES {
        if min > MAX_FRAMES { min } else { MAX_FRAMES }
    } else {
        max
    }
}

const UNSUPPORTED_FORMAT_RANK: u8 = 10;

#[derive(Clone, Copy, Debug)]
struct Candidate {
    below: bool,
    rate: u32,
    channel_rank: u8,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, best: &Candidate) -> bool {
        if self.below != best.below {
            self.below && !best.below
        } else if self.rate != best.rate {
            // Above the target the lowest rate wins; at or below it the highest.
            if self.below { self.rate > best.rate } else { self.rate < best.rate }
        } else if self.channel_rank != best.channel_rank {
            self.channel_rank < best.channel_rank
        } else {
            self.format_rank < best.format_rank
        }
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

fn channel_rank(channels: u16, target: u16) -> u8 {
    if channels == target {
        0
    } else if channels == 2 {
        1
    } else {
        2
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => UNSUPPORTED_FORMAT_RANK,
    }
}

/// Lightweight output device metadata for device listings.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub min_rate: u32,
    pub max_rate: u32,
}

/// Return device metadata for the current host.
pub fn list_device_infos(host: &cpal::Host) -> Result<Vec<DeviceInfo>> {
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.to_string());
    let devices = host.output_devices().context("No output devices")?;
    let mut out = Vec::new();
    for d in devices {
        let name = d.description()?.to_string();
        let mut min_rate = u32::MAX;
        let mut max_rate = 0u32;
        if let Ok(ranges) = d.supported_output_configs() {
            for r in ranges {
                min_rate = min_rate.min(r.min_sample_rate());
                max_rate = max_rate.max(r.max_sample_rate());
            }
        }
        if max_rate == 0 || min_rate > max_rate {
            match d.default_output_config() {
                Ok(cfg) => {
                    min_rate = cfg.sample_rate();
                    max_rate = cfg.sample_rate();
                }
                Err(_) => {
                    tracing::warn!(device = %name, "skipping device with invalid sample rate range");
                    continue;
                }
            }
        }
        out.push(DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate,
            max_rate,
        });
    }
    Ok(out)
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(below: bool, rate: u32, channel_rank: u8, format_rank: u8) -> Candidate {
        Candidate {
            below,
            rate,
            channel_rank,
            format_rank,
        }
    }

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", ""));
    }

    #[test]
    fn pick_rate_for_range_prefers_target_when_in_range() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(48_000)), 48_000);
    }

    #[test]
    fn pick_rate_for_range_clamps_to_range() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(22_050)), 44_100);
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(192_000)), 96_000);
    }

    #[test]
    fn pick_rate_for_range_defaults_to_max() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, None), 96_000);
    }

    #[test]
    fn candidate_prefers_below_target() {
        assert!(cand(true, 44_100, 1, 1).is_better_than(&cand(false, 48_000, 1, 1)));
    }

    #[test]
    fn candidate_prefers_closest_rate_above_target() {
        assert!(cand(false, 48_000, 0, 0).is_better_than(&cand(false, 96_000, 0, 0)));
    }

    #[test]
    fn candidate_prefers_higher_rate_below_target() {
        assert!(cand(true, 48_000, 2, 2).is_better_than(&cand(true, 44_100, 2, 2)));
    }

    #[test]
    fn candidate_prefers_matching_channels_then_format() {
        assert!(cand(true, 48_000, 0, 2).is_better_than(&cand(true, 48_000, 1, 0)));
        assert!(cand(true, 48_000, 1, 0).is_better_than(&cand(true, 48_000, 1, 2)));
    }

    #[test]
    fn channel_rank_prefers_exact_then_stereo() {
        assert_eq!(channel_rank(1, 1), 0);
        assert_eq!(channel_rank(2, 1), 1);
        assert_eq!(channel_rank(6, 1), 2);
    }

    #[test]
    fn choose_buffer_frames_clamps_request() {
        assert_eq!(choose_buffer_frames(64, 4096, Some(512)), 512);
        assert_eq!(choose_buffer_frames(64, 4096, Some(16)), 64);
        assert_eq!(choose_buffer_frames(64, 4096, Some(100_000)), 4096);
    }

    #[test]
    fn choose_buffer_frames_caps_large_ranges() {
        assert_eq!(choose_buffer_frames(64, 4096, None), 4096);
        assert_eq!(choose_buffer_frames(64, 1 << 20, None), 16_384);
        assert_eq!(choose_buffer_frames(32_768, 1 << 20, None), 32_768);
    }
}
