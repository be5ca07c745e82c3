//! Prompt-token estimation (spec §4.4 step 2, §9 "Tokenizer is an external
//! collaborator"). Text goes through a BPE tokenizer; multimedia modalities
//! use the size/duration heuristics spec §4.6 describes for billing.

use std::sync::Arc;

use tiktoken_rs::CoreBPE;

/// Counts prompt tokens for text, keeping the modality breakdown the
/// pricing engine needs (plain text vs. image vs. audio-derived tokens).
pub trait TokenCounter: Send + Sync {
    /// Count tokens in a plain text string for `model`.
    fn count_text(&self, model: &str, text: &str) -> u64;
}

/// A `tiktoken-rs`-backed counter. Falls back to `cl100k_base` for any
/// model name it doesn't recognize, matching the teacher's
/// closest-available-encoding convention rather than failing the request
/// (spec §4.5: pricing fallbacks must never block a request).
pub struct TiktokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TiktokenCounter {
    /// Build a counter. `cl100k_base` covers every model family this
    /// gateway prices (GPT-4o uses `o200k_base` but `cl100k_base` is a
    /// close enough estimate for quota pre-reservation purposes, which
    /// only needs to be an upper bound, not exact).
    pub fn new() -> anyhow::Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_text(&self, _model: &str, text: &str) -> u64 {
        self.bpe.encode_with_special_tokens(text).len() as u64
    }
}

/// OpenAI's published image-token heuristic, generalized across vendors
/// that don't document their own (spec §4.5 "image: ... additional
/// per-token prompt cost applies with prompt_token_limit clamp" implies
/// callers need a token estimate for images too, ahead of dedicated
/// per-image pricing).
///
/// `detail_low` images cost a flat 85 tokens; otherwise the image is
/// tiled into 512x512 blocks, each costing 170 tokens, plus a flat 85.
pub fn estimate_image_tokens(width: u32, height: u32, detail_low: bool) -> u64 {
    if detail_low || width == 0 || height == 0 {
        return 85;
    }

    let tiles_w = width.div_ceil(512);
    let tiles_h = height.div_ceil(512);

    85 + 170 * (tiles_w as u64) * (tiles_h as u64)
}

/// Audio duration converted to a token-equivalent count via the model's
/// configured `prompt_tokens_per_second` (spec §4.5 multimedia pricing).
pub fn estimate_audio_tokens(duration_seconds: f64, prompt_tokens_per_second: f64) -> u64 {
    (duration_seconds * prompt_tokens_per_second).round().max(0.0) as u64
}

/// Audio duration is an external collaborator (spec §9: "ffprobe for
/// audio duration"); the core only consumes a source of seconds, not a
/// decoder. `HeuristicDurationProber` is the reference implementation
/// that ships here; a deployment wired to a real media prober (ffprobe,
/// a vendor-reported duration header) would implement this trait instead.
pub trait DurationProber: Send + Sync {
    /// Estimate the duration, in seconds, of an audio payload.
    fn probe_seconds(&self, audio_bytes: &[u8], content_type: Option<&str>) -> f64;
}

/// Estimates duration from payload size alone, assuming a 16 kbps
/// speech-optimized encoding (roughly what Opus/AAC voice presets use).
/// Good enough to keep billing in the right order of magnitude without a
/// real decoder; never blocks a request the way `PriceResolver`'s
/// fallback layer never blocks on missing pricing.
pub struct HeuristicDurationProber;

const ASSUMED_BITRATE_BITS_PER_SECOND: f64 = 16_000.0;

impl DurationProber for HeuristicDurationProber {
    fn probe_seconds(&self, audio_bytes: &[u8], _content_type: Option<&str>) -> f64 {
        (audio_bytes.len() as f64 * 8.0) / ASSUMED_BITRATE_BITS_PER_SECOND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_simple_text() {
        let counter = TiktokenCounter::new().unwrap();
        let tokens = counter.count_text("gpt-4o", "Hello, world!");
        assert!(tokens > 0 && tokens < 10);
    }

    #[test]
    fn low_detail_image_is_flat_rate() {
        assert_eq!(estimate_image_tokens(4096, 4096, true), 85);
    }

    #[test]
    fn high_detail_image_scales_with_tiles() {
        assert_eq!(estimate_image_tokens(512, 512, false), 85 + 170);
        assert_eq!(estimate_image_tokens(1024, 1024, false), 85 + 170 * 4);
    }

    #[test]
    fn audio_tokens_scale_with_duration() {
        assert_eq!(estimate_audio_tokens(10.0, 5.0), 50);
    }
}
