//! Prompt encoding: weighted fast path, chunked fallback, and the shape work
//! that turns one encoding into a batch of sampler conditioning.

mod long_prompt;
mod weighted;

pub use long_prompt::{LongPromptEmbedding, LongPromptEncoder};
pub use weighted::{parse_emphasis, EmphasisError, WeightedFragment, WeightedPromptEncoder};

use candle_core::{Result, Tensor};
use serde::Serialize;
use tracing::{debug, warn};

use crate::capability::{Conditioning, PromptEncoder};
use crate::PromptPair;

/// Which encoder produced a request's embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum EncodingPath {
    Primary,
    LongPrompt { chunks: usize },
}

/// Embeddings of one prompt pair, batch size 1.
pub struct EncodedPrompts {
    pub path: EncodingPath,
    /// `[1, seq, hidden]`
    pub positive: Tensor,
    pub negative: Tensor,
    /// `[1, proj]`
    pub pooled_positive: Tensor,
    pub pooled_negative: Tensor,
}

/// Result of trying the primary encoder.
pub enum EncodingAttempt {
    Encoded(EncodedPrompts),
    Fallback { reason: anyhow::Error },
}

impl EncodedPrompts {
    /// Zero-pads the shorter of positive/negative along the sequence axis.
    pub fn reconcile_lengths(self) -> Result<Self> {
        let positive_len = self.positive.dim(1)?;
        let negative_len = self.negative.dim(1)?;
        if positive_len == negative_len {
            return Ok(self);
        }
        let target = positive_len.max(negative_len);
        debug!(positive_len, negative_len, "padding prompt embeddings to equal length");
        Ok(Self {
            positive: pad_sequence(&self.positive, target)?,
            negative: pad_sequence(&self.negative, target)?,
            ..self
        })
    }

    /// Repeats the single encoding `count` times along the batch axis.
    pub fn expand_batch(&self, count: usize) -> Result<Conditioning> {
        Ok(Conditioning {
            prompt_embeds: self.positive.repeat((count, 1, 1))?,
            negative_embeds: self.negative.repeat((count, 1, 1))?,
            pooled_prompt: self.pooled_positive.repeat((count, 1))?,
            pooled_negative: self.pooled_negative.repeat((count, 1))?,
        })
    }
}

impl From<LongPromptEmbedding> for EncodedPrompts {
    fn from(out: LongPromptEmbedding) -> Self {
        Self {
            path: EncodingPath::LongPrompt { chunks: out.chunks },
            positive: out.positive,
            negative: out.negative,
            pooled_positive: out.pooled_positive,
            pooled_negative: out.pooled_negative,
        }
    }
}

/// Appends zero rows to `[batch, seq, hidden]` until `seq == target`.
pub fn pad_sequence(embeds: &Tensor, target: usize) -> Result<Tensor> {
    let (batch, seq, hidden) = embeds.dims3()?;
    if seq >= target {
        return Ok(embeds.clone());
    }
    let pad = Tensor::zeros((batch, target - seq, hidden), embeds.dtype(), embeds.device())?;
    Tensor::cat(&[embeds, &pad], 1)
}

/// Runs the primary encoder on both texts. Any error becomes a fallback.
pub fn try_primary(encoder: &dyn PromptEncoder, prompts: &PromptPair) -> EncodingAttempt {
    let encoded = encoder.encode(prompts.positive()).and_then(|positive| {
        let negative = encoder.encode(prompts.negative())?;
        Ok(EncodedPrompts {
            path: EncodingPath::Primary,
            positive: positive.embeds,
            negative: negative.embeds,
            pooled_positive: positive.pooled,
            pooled_negative: negative.pooled,
        })
    });
    match encoded {
        Ok(encoded) => EncodingAttempt::Encoded(encoded),
        Err(reason) => EncodingAttempt::Fallback { reason },
    }
}

/// Primary encoder first, long-prompt chunking when it gives up.
pub fn encode_prompts(
    primary: &dyn PromptEncoder,
    long_prompt: &LongPromptEncoder,
    prompts: &PromptPair,
    clip_skip: Option<usize>,
) -> anyhow::Result<EncodedPrompts> {
    match try_primary(primary, prompts) {
        EncodingAttempt::Encoded(encoded) => Ok(encoded),
        EncodingAttempt::Fallback { reason } => {
            warn!("primary encoder failed, falling back to chunked encoding: {reason:#}");
            let encoded = long_prompt.encode(prompts.positive(), prompts.negative(), clip_skip)?;
            Ok(encoded.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};

    fn encoded(pos_len: usize, neg_len: usize) -> Result<EncodedPrompts> {
        let dev = Device::Cpu;
        Ok(EncodedPrompts {
            path: EncodingPath::Primary,
            positive: Tensor::ones((1, pos_len, 4), DType::F32, &dev)?,
            negative: Tensor::ones((1, neg_len, 4), DType::F32, &dev)?,
            pooled_positive: Tensor::ones((1, 3), DType::F32, &dev)?,
            pooled_negative: Tensor::ones((1, 3), DType::F32, &dev)?,
        })
    }

    #[test]
    fn shorter_negative_is_zero_padded() -> Result<()> {
        let out = encoded(154, 77)?.reconcile_lengths()?;
        assert_eq!(out.positive.dims(), &[1, 154, 4]);
        assert_eq!(out.negative.dims(), &[1, 154, 4]);
        let tail = out.negative.i((0, 77.., ..))?.sum_all()?.to_scalar::<f32>()?;
        let head = out.negative.i((0, ..77, ..))?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(tail, 0.0);
        assert_eq!(head, 77.0 * 4.0);
        Ok(())
    }

    #[test]
    fn shorter_positive_is_zero_padded() -> Result<()> {
        let out = encoded(77, 231)?.reconcile_lengths()?;
        assert_eq!(out.positive.dims(), &[1, 231, 4]);
        Ok(())
    }

    #[test]
    fn batch_expansion_replicates() -> Result<()> {
        let out = encoded(77, 77)?.expand_batch(3)?;
        assert_eq!(out.prompt_embeds.dims(), &[3, 77, 4]);
        assert_eq!(out.pooled_negative.dims(), &[3, 3]);
        assert_eq!(out.batch_size()?, 3);
        Ok(())
    }

    #[test]
    fn path_serializes_with_chunk_count() {
        let json = serde_json::to_string(&EncodingPath::LongPrompt { chunks: 2 }).unwrap();
        assert_eq!(json, r#"{"path":"long_prompt","chunks":2}"#);
    }
}
