//! Ogg/Opus chunk decoding.
//!
//! Wraps the Opus decoder behind a chunk-oriented interface: the session
//! feeds raw stream chunks exactly as received, and gets back planar f32
//! PCM for whatever complete packets those bytes finished. Packet extraction
//! (page reassembly, lacing, continuation) happens here so the timing path
//! can stay a pure probe over raw chunks.

use anyhow::{Context, Result};
use opus::{Channels, Decoder};
use tracing::{debug, warn};

use crate::ogg::PageScanner;

/// Opus always decodes at 48kHz regardless of the input's original rate.
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// Samples per channel in the largest Opus frame (120ms at 48kHz).
const MAX_FRAME_SAMPLES: usize = 5760;

/// Decoded PCM for one received chunk.
///
/// `channel_data` is planar: one `Vec<f32>` per channel, all the same
/// length. `sample_rate` is `None` until the identification header has been
/// seen, matching a decoder that cannot know its output format yet.
#[derive(Debug, Clone, Default)]
pub struct DecodedAudio {
    // ---
    pub sample_rate: Option<u32>,
    pub channel_data: Vec<Vec<f32>>,
    pub samples_decoded: usize,
}

impl DecodedAudio {
    // ---
    /// Returns whether this result carries any playable samples.
    pub fn is_audible(&self) -> bool {
        // ---
        self.samples_decoded > 0 && !self.channel_data.is_empty()
    }

    /// Block duration in seconds, zero when nothing was decoded.
    pub fn duration_secs(&self) -> f64 {
        // ---
        match self.sample_rate {
            Some(rate) if rate > 0 => self.samples_decoded as f64 / rate as f64,
            _ => 0.0,
        }
    }
}

/// Chunk-at-a-time decoder capability.
///
/// Implementations own their codec state; releasing it happens exactly once,
/// when the owning session attempt drops the box.
pub trait ChunkDecoder: Send {
    /// Decodes one raw stream chunk into zero or more PCM samples.
    fn decode(&mut self, chunk: &[u8]) -> Result<DecodedAudio>;
}

/// Ogg/Opus implementation of [`ChunkDecoder`].
///
/// State machine: pages are reassembled across chunk boundaries, packets are
/// reassembled across page boundaries, `OpusHead` configures the decoder,
/// `OpusTags` is skipped, and everything after that is audio.
pub struct OggOpusDecoder {
    // ---
    scanner: PageScanner,

    /// Packet bytes carried over from a 255-lacing continuation.
    partial_packet: Vec<u8>,

    /// Created once the identification header announces the channel count.
    decoder: Option<Decoder>,

    channels: usize,
}

impl OggOpusDecoder {
    // ---
    /// Creates a decoder that has not yet seen the identification header.
    pub fn new() -> Self {
        // ---
        Self {
            scanner: PageScanner::new(),
            partial_packet: Vec::new(),
            decoder: None,
            channels: 0,
        }
    }

    fn sample_rate(&self) -> Option<u32> {
        // ---
        self.decoder.as_ref().map(|_| OPUS_SAMPLE_RATE)
    }

    /// Configures the Opus decoder from an `OpusHead` packet.
    fn configure(&mut self, packet: &[u8]) -> Result<()> {
        // ---
        // Channel count sits right after the 8-byte signature and version byte.
        let channels = packet.get(9).copied().unwrap_or(2) as usize;

        let layout = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => anyhow::bail!("unsupported channel count in identification header: {}", other),
        };

        debug!("Identification header: {} channel(s)", channels);

        self.decoder =
            Some(Decoder::new(OPUS_SAMPLE_RATE, layout).context("failed to create Opus decoder")?);
        self.channels = channels;

        Ok(())
    }

    /// Decodes one complete Opus packet into the planar output.
    fn decode_packet(&mut self, packet: &[u8], out: &mut DecodedAudio) -> Result<()> {
        // ---
        if packet.starts_with(b"OpusHead") {
            return self.configure(packet);
        }

        if packet.starts_with(b"OpusTags") {
            debug!("Skipping comment header ({} bytes)", packet.len());
            return Ok(());
        }

        let Some(decoder) = self.decoder.as_mut() else {
            // Audio before the identification header cannot be decoded.
            warn!("Dropping {} byte packet before identification header", packet.len());
            return Ok(());
        };

        let mut interleaved = vec![0f32; MAX_FRAME_SAMPLES * self.channels];
        let samples = decoder
            .decode_float(packet, &mut interleaved, false)
            .context("Opus decoding failed")?;

        if out.channel_data.is_empty() {
            out.channel_data = vec![Vec::new(); self.channels];
        }

        for (ch, sink) in out.channel_data.iter_mut().enumerate() {
            sink.extend(
                interleaved[..samples * self.channels]
                    .iter()
                    .skip(ch)
                    .step_by(self.channels),
            );
        }

        out.samples_decoded += samples;
        Ok(())
    }
}

impl Default for OggOpusDecoder {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

impl ChunkDecoder for OggOpusDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Result<DecodedAudio> {
        // ---
        self.scanner.push(chunk);

        let mut out = DecodedAudio::default();

        while let Some(page) = self.scanner.next_page() {
            let segments: Vec<(Vec<u8>, bool)> = page
                .segments()
                .map(|(bytes, complete)| (bytes.to_vec(), complete))
                .collect();

            for (segment, completes_packet) in segments {
                self.partial_packet.extend_from_slice(&segment);
                if completes_packet {
                    let packet = std::mem::take(&mut self.partial_packet);
                    self.decode_packet(&packet, &mut out)?;
                }
            }
        }

        out.sample_rate = self.sample_rate();
        Ok(out)
    }
}
