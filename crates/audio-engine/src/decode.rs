//! Decoder adapter.
//!
//! Uses Symphonia to:
//! - probe the input container/codec in two phases: the reader matching the extension hint
//!   with the core codecs first, then every enabled reader and codec by content sniffing
//! - decode packets into interleaved `f32` samples on demand
//! - map channels and resample to the format the output device was opened with
//! - seek to an exact frame (coarse container seek, then trimming decoded frames)
//!
//! Consumers only see [`FrameSource`], a pull interface with a fixed output format.

use std::io;
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{
    CODEC_TYPE_NULL, CodecParameters, CodecRegistry, Decoder, DecoderOptions,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::{Hint, Probe};
use symphonia::core::units::{Time, TimeBase};
use symphonia::default::codecs::{
    AacDecoder, AlacDecoder, FlacDecoder, MpaDecoder, PcmDecoder, VorbisDecoder,
};
use symphonia::default::formats::{
    AdtsReader, AiffReader, FlacReader, IsoMp4Reader, MpaReader, OggReader, WavReader,
};

use crate::resample::StreamResampler;
use crate::uri::SourceLocator;

// More consecutive decode errors than this ends the stream.
const MAX_DECODE_RETRIES: usize = 3;

/// Sample rate and channel count of an interleaved `f32` stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

/// Pull interface over a decoded stream of interleaved `f32` frames.
pub trait FrameSource: Send {
    /// Output format of [`read_frames`](FrameSource::read_frames).
    fn format(&self) -> PcmFormat;

    /// Total frames in the output domain, `0` when the container does not say.
    fn total_frames(&self) -> u64;

    /// Fill `out` with up to `out.len() / channels` frames and return how many were written.
    ///
    /// Returning fewer frames than requested means end of stream; it is not an error.
    fn read_frames(&mut self, out: &mut [f32]) -> usize;

    /// Reposition so the next read starts at `frame`.
    fn seek_to_frame(&mut self, frame: u64) -> Result<()>;
}

/// Neither probe phase recognized the source.
#[derive(Debug, thiserror::Error)]
#[error("no decoder recognized {0}")]
pub struct UnsupportedFormat(pub String);

/// Metadata captured while probing the source.
#[derive(Clone, Debug, Default)]
pub struct SourceInfo {
    /// Codec name (best-effort).
    pub codec: Option<String>,
    /// Source bit depth (best-effort).
    pub bit_depth: Option<u16>,
    /// Container/extension hint (best-effort).
    pub container: Option<String>,
    /// Opened by the extended probe after the hinted one failed.
    pub extended_probe: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProbePhase {
    /// Only the reader the extension names (all core readers without a known extension),
    /// core codecs, default options.
    Hinted,
    /// Every enabled reader and codec (adds Matroska, CAF, ADPCM), content sniffing,
    /// gapless trimming and a prebuilt seek index.
    Extended,
}

/// Readers for the hinted phase.
fn hinted_probe(ext: Option<&str>) -> Probe {
    let mut probe = Probe::default();
    match ext.map(str::to_ascii_lowercase).as_deref() {
        Some("wav" | "wave") => probe.register_all::<WavReader>(),
        Some("aif" | "aiff" | "aifc") => probe.register_all::<AiffReader>(),
        Some("flac") => probe.register_all::<FlacReader>(),
        Some("mp1" | "mp2" | "mp3") => probe.register_all::<MpaReader>(),
        Some("aac") => probe.register_all::<AdtsReader>(),
        Some("m4a" | "m4b" | "mp4" | "alac") => probe.register_all::<IsoMp4Reader>(),
        Some("ogg" | "oga") => probe.register_all::<OggReader>(),
        _ => {
            probe.register_all::<WavReader>();
            probe.register_all::<AiffReader>();
            probe.register_all::<FlacReader>();
            probe.register_all::<MpaReader>();
            probe.register_all::<AdtsReader>();
            probe.register_all::<IsoMp4Reader>();
            probe.register_all::<OggReader>();
        }
    }
    probe
}

/// Codecs for the hinted phase.
fn core_codecs() -> &'static CodecRegistry {
    static CORE: OnceLock<CodecRegistry> = OnceLock::new();
    CORE.get_or_init(|| {
        let mut registry = CodecRegistry::new();
        registry.register_all::<PcmDecoder>();
        registry.register_all::<FlacDecoder>();
        registry.register_all::<MpaDecoder>();
        registry.register_all::<AacDecoder>();
        registry.register_all::<AlacDecoder>();
        registry.register_all::<VorbisDecoder>();
        registry
    })
}

/// Symphonia-backed [`FrameSource`].
pub struct SymphoniaSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    native: PcmFormat,
    native_total: u64,
    output: PcmFormat,
    resampler: Option<StreamResampler>,
    sample_buf: Option<SampleBuffer<f32>>,
    sample_buf_spec: Option<(usize, usize)>,
    /// Channel-mapped samples at the native rate.
    mapped: Vec<f32>,
    /// Output-domain samples not yet handed out.
    ready: Vec<f32>,
    ready_pos: usize,
    /// Native frames still to drop after an accurate seek landed early.
    discard_frames: u64,
    eof: bool,
    info: SourceInfo,
}

impl SymphoniaSource {
    /// Open and probe `locator`.
    ///
    /// The extension-hinted probe runs first; if it cannot produce a decoder the source is
    /// reopened and probed again by content alone, with every enabled reader and codec.
    /// Output starts in the native format; call [`configure_output`](Self::configure_output)
    /// once the device format is known.
    pub fn open(locator: &SourceLocator) -> Result<Self> {
        let first = locator.media_source()?;
        let ext = locator.extension();
        match Self::open_phase(first, ext.as_deref(), ProbePhase::Hinted) {
            Ok(src) => Ok(src),
            Err(hinted_err) => {
                tracing::debug!(
                    source = %locator.describe(),
                    error = %format!("{hinted_err:#}"),
                    "hinted probe failed; retrying with the extended probe"
                );
                let again = locator.media_source()?;
                Self::open_phase(again, ext.as_deref(), ProbePhase::Extended)
                    .context(UnsupportedFormat(locator.describe()))
            }
        }
    }

    fn open_phase(
        source: Box<dyn MediaSource>,
        ext: Option<&str>,
        phase: ProbePhase,
    ) -> Result<Self> {
        let hint = Hint::new();
        let hinted;
        let (probe, codecs, format_opts): (&Probe, &CodecRegistry, FormatOptions) = match phase {
            ProbePhase::Hinted => {
                hinted = hinted_probe(ext);
                (&hinted, core_codecs(), FormatOptions::default())
            }
            ProbePhase::Extended => (
                symphonia::default::get_probe(),
                symphonia::default::get_codecs(),
                FormatOptions {
                    enable_gapless: true,
                    prebuild_seek_index: true,
                    ..Default::default()
                },
            ),
        };

        let mss = MediaSourceStream::new(source, Default::default());
        let probed = probe
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .context("probe container")?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| anyhow!("No decodable audio track"))?;
        let track_id = track.id;
        let codec_params: CodecParameters = track.codec_params.clone();

        let rate = codec_params
            .sample_rate
            .filter(|r| *r > 0)
            .ok_or_else(|| anyhow!("Unknown sample rate"))?;
        let channels = codec_params
            .channels
            .map(|c| c.count())
            .filter(|c| *c > 0)
            .ok_or_else(|| anyhow!("Unknown channels"))?;
        let channels = u16::try_from(channels).context("channel count")?;

        let decoder = codecs
            .make(&codec_params, &DecoderOptions::default())
            .context("create decoder")?;

        let native = PcmFormat::new(rate, channels);
        let info = SourceInfo {
            codec: codec_name_from_params(&codec_params),
            bit_depth: codec_params
                .bits_per_sample
                .or(codec_params.bits_per_coded_sample)
                .and_then(|v| u16::try_from(v).ok()),
            container: ext.map(str::to_string),
            extended_probe: phase == ProbePhase::Extended,
        };

        Ok(Self {
            format,
            decoder,
            track_id,
            time_base: codec_params.time_base,
            native,
            native_total: codec_params.n_frames.unwrap_or(0),
            output: native,
            resampler: None,
            sample_buf: None,
            sample_buf_spec: None,
            mapped: Vec::new(),
            ready: Vec::new(),
            ready_pos: 0,
            discard_frames: 0,
            eof: false,
            info,
        })
    }

    /// Format the stream was encoded in.
    pub fn native_format(&self) -> PcmFormat {
        self.native
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    /// Emit `output` instead of the native format: channels are mapped and, when the rates
    /// differ, audio is resampled in chunks of `chunk_frames`.
    pub fn configure_output(&mut self, output: PcmFormat, chunk_frames: usize) -> Result<()> {
        if output.channels == 0 || output.sample_rate == 0 {
            return Err(anyhow!("invalid output format {output:?}"));
        }
        self.resampler = if output.sample_rate != self.native.sample_rate {
            tracing::info!(
                from_hz = self.native.sample_rate,
                to_hz = output.sample_rate,
                "resampling"
            );
            Some(StreamResampler::new(
                self.native.sample_rate,
                output.sample_rate,
                output.channels as usize,
                chunk_frames,
            )?)
        } else {
            None
        };
        self.output = output;
        self.ready.clear();
        self.ready_pos = 0;
        Ok(())
    }

    fn output_to_native(&self, frame: u64) -> u64 {
        rescale(frame, self.native.sample_rate, self.output.sample_rate)
    }

    fn ts_to_native_frames(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) => {
                let t = tb.calc_time(ts);
                let rate = self.native.sample_rate as u64;
                t.seconds
                    .saturating_mul(rate)
                    .saturating_add((t.frac * rate as f64).round() as u64)
            }
            None => ts,
        }
    }

    /// Decode packets until at least one frame lands in `ready`, or the stream ends.
    fn decode_next(&mut self) {
        let out_channels = self.output.channels as usize;
        let mut decode_errors = 0usize;
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "packet read ended stream");
                    break;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    decode_errors += 1;
                    if decode_errors > MAX_DECODE_RETRIES {
                        tracing::warn!(error = %e, "repeated decode errors; ending stream");
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "decoder failed; ending stream");
                    break;
                }
            };
            decode_errors = 0;

            let spec: SignalSpec = *decoded.spec();
            let src_channels = spec.channels.count();
            let frames = decoded.frames();
            if frames == 0 || src_channels == 0 {
                continue;
            }

            let shape = (decoded.capacity(), src_channels);
            let fits = matches!(self.sample_buf_spec, Some((cap, ch)) if cap >= shape.0 && ch == shape.1);
            if !fits {
                self.sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
                self.sample_buf_spec = Some(shape);
            }
            let Some(buf) = self.sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            let mut samples = buf.samples();
            if self.discard_frames > 0 {
                let skip = (self.discard_frames.min(frames as u64)) as usize;
                self.discard_frames -= skip as u64;
                samples = &samples[(skip * src_channels).min(samples.len())..];
            }
            if samples.is_empty() {
                continue;
            }

            self.mapped.clear();
            map_channels(samples, src_channels, out_channels, &mut self.mapped);
            match self.resampler.as_mut() {
                Some(rs) => {
                    if let Err(e) = rs.process(&self.mapped, &mut self.ready) {
                        tracing::warn!("resample failed; ending stream: {e:#}");
                        break;
                    }
                    if self.ready.is_empty() {
                        // Resampler is still filling its first chunk.
                        continue;
                    }
                }
                None => self.ready.extend_from_slice(&self.mapped),
            }
            return;
        }
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(rs) = self.resampler.as_mut() {
            if let Err(e) = rs.flush(&mut self.ready) {
                tracing::warn!("resampler flush failed: {e:#}");
            }
        }
        self.eof = true;
    }
}

impl FrameSource for SymphoniaSource {
    fn format(&self) -> PcmFormat {
        self.output
    }

    fn total_frames(&self) -> u64 {
        rescale(
            self.native_total,
            self.output.sample_rate,
            self.native.sample_rate,
        )
    }

    fn read_frames(&mut self, out: &mut [f32]) -> usize {
        let ch = self.output.channels as usize;
        let wanted = out.len() / ch;
        let mut written = 0usize;
        while written < wanted {
            let avail = (self.ready.len() - self.ready_pos) / ch;
            if avail > 0 {
                let n = avail.min(wanted - written);
                let src = &self.ready[self.ready_pos..self.ready_pos + n * ch];
                out[written * ch..(written + n) * ch].copy_from_slice(src);
                self.ready_pos += n * ch;
                written += n;
                continue;
            }
            if self.eof {
                break;
            }
            self.ready.clear();
            self.ready_pos = 0;
            self.decode_next();
        }
        written
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<()> {
        self.ready.clear();
        self.ready_pos = 0;
        self.discard_frames = 0;

        let total = self.total_frames();
        if total > 0 && frame >= total {
            self.eof = true;
            return Ok(());
        }

        let native_frame = self.output_to_native(frame);
        let rate = self.native.sample_rate as u64;
        let time = Time::new(
            native_frame / rate,
            (native_frame % rate) as f64 / rate as f64,
        );
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .with_context(|| format!("seek to frame {frame}"))?;

        self.decoder.reset();
        if let Some(rs) = self.resampler.as_mut() {
            rs.reset();
        }
        self.discard_frames =
            self.ts_to_native_frames(seeked.required_ts.saturating_sub(seeked.actual_ts));
        self.eof = false;
        Ok(())
    }
}

/// Convert a frame count between rates (`frames * to / from`, truncating).
pub fn rescale(frames: u64, to_rate: u32, from_rate: u32) -> u64 {
    if from_rate == 0 || to_rate == from_rate {
        return frames;
    }
    let scaled = frames as u128 * to_rate as u128 / from_rate as u128;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Append `src` (interleaved, `src_channels`) to `out` remapped to `dst_channels`.
///
/// Mapping rules:
/// - same layout: pass-through
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: best-effort "clamp to available channels"
pub fn map_channels(src: &[f32], src_channels: usize, dst_channels: usize, out: &mut Vec<f32>) {
    if src_channels == dst_channels {
        out.extend_from_slice(src);
        return;
    }
    out.reserve(src.len() / src_channels * dst_channels);
    for frame in src.chunks_exact(src_channels) {
        match (src_channels, dst_channels) {
            (2, 1) => out.push(0.5 * (frame[0] + frame[1])),
            (1, _) => out.extend(std::iter::repeat_n(frame[0], dst_channels)),
            _ => {
                for ch in 0..dst_channels {
                    out.push(frame[ch.min(src_channels - 1)]);
                }
            }
        }
    }
}

/// Best-effort codec label used in load logs.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}
