//! Streaming resampler used by the decoder adapter.
//!
//! Uses Rubato to convert decoded interleaved `f32` audio from the source rate to the
//! negotiated output rate. Unlike a pipeline stage this runs inline: the decoder pushes
//! whatever it just decoded and collects whatever full chunks came out.

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

/// Chunked sinc resampler over interleaved samples.
pub struct StreamResampler {
    inner: Box<dyn Resampler<f32>>,
    channels: usize,
    chunk_frames: usize,
    /// Input waiting for a full chunk.
    pending: Vec<f32>,
    out_buf: Vec<f32>,
    indexing: Indexing,
}

impl StreamResampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        if src_rate == 0 || dst_rate == 0 || channels == 0 {
            return Err(anyhow!(
                "invalid resampler shape: {src_rate} Hz -> {dst_rate} Hz, {channels} ch"
            ));
        }
        let chunk_frames = chunk_frames.max(1);
        let inner = build_sinc(src_rate, dst_rate, channels, chunk_frames)?;
        let ratio = dst_rate as f64 / src_rate as f64;
        let out_frames = ((chunk_frames as f64 * ratio * 1.2).ceil() as usize + 64).max(chunk_frames * 3);
        Ok(Self {
            inner,
            channels,
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * channels),
            out_buf: vec![0.0; out_frames * channels],
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    /// Feed interleaved input; every completed chunk is resampled and appended to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        let chunk_samples = self.chunk_frames * self.channels;
        let mut offset = 0;
        while offset < input.len() {
            let take = (chunk_samples - self.pending.len()).min(input.len() - offset);
            self.pending.extend_from_slice(&input[offset..offset + take]);
            offset += take;
            if self.pending.len() == chunk_samples {
                self.run_chunk(None, out)?;
                self.pending.clear();
            }
        }
        Ok(())
    }

    /// Resample whatever partial chunk is left (end of stream).
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let tail_frames = self.pending.len() / self.channels;
        if tail_frames == 0 {
            return Ok(());
        }
        // Pad to a full chunk; `partial_len` tells rubato how much of it is real.
        self.pending.resize(self.chunk_frames * self.channels, 0.0);
        let res = self.run_chunk(Some(tail_frames), out);
        self.pending.clear();
        res
    }

    /// Drop buffered input and filter state (after a seek). Keeps the sinc tables, so it
    /// is safe to call from the render callback.
    pub fn reset(&mut self) {
        self.inner.reset();
        self.pending.clear();
    }

    fn run_chunk(&mut self, partial_len: Option<usize>, out: &mut Vec<f32>) -> Result<()> {
        let input_adapter = InterleavedSlice::new(&self.pending, self.channels, self.chunk_frames)
            .map_err(|e| anyhow!("interleaved slice (input) error: {e}"))?;
        let out_capacity_frames = self.out_buf.len() / self.channels;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.out_buf, self.channels, out_capacity_frames)
                .map_err(|e| anyhow!("interleaved slice (output) error: {e}"))?;

        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = partial_len;

        let (_nbr_in, nbr_out) = self
            .inner
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
            .map_err(|e| anyhow!("resampler process error: {e}"))?;

        out.extend_from_slice(&self.out_buf[..nbr_out * self.channels]);
        Ok(())
    }
}

fn build_sinc(
    src_rate: u32,
    dst_rate: u32,
    channels: usize,
    chunk_frames: usize,
) -> Result<Box<dyn Resampler<f32>>> {
    let f_ratio = dst_rate as f64 / src_rate as f64;

    let sinc_len = 128;
    let window = WindowFunction::BlackmanHarris2;
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    };

    let resampler =
        Async::<f32>::new_sinc(f_ratio, 1.1, &params, chunk_frames, channels, FixedAsync::Input)
            .map_err(|e| anyhow!("resampler init error: {e}"))?;
    Ok(Box::new(resampler))
}
