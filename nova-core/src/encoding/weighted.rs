use anyhow::{Context, Result};
use candle_core::{DType, Tensor, D};
use thiserror::Error;

use super::long_prompt::{chunk_ids, frame_chunk, strip_boundaries};
use crate::capability::{EncoderPair, PromptEmbedding, PromptEncoder};
use crate::presets::CONTENT_TOKENS_PER_CHUNK;

/// Multiplier applied per `(...)` level; `[...]` divides by it.
const EMPHASIS_STEP: f32 = 1.1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmphasisError {
    #[error("unmatched '{0}' at byte {1}")]
    Unmatched(char, usize),
    #[error("unclosed '{0}'")]
    Unclosed(char),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bracket {
    Round,
    Square,
}

impl Bracket {
    fn open(self) -> char {
        match self {
            Bracket::Round => '(',
            Bracket::Square => '[',
        }
    }
}

/// A run of prompt text sharing one attention weight.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedFragment {
    pub text: String,
    pub weight: f32,
}

/// Splits emphasis syntax into weighted fragments.
///
/// `(text)` multiplies by 1.1 per level, `[text]` divides by 1.1, `(text:1.3)`
/// sets an explicit factor and `\(` escapes a bracket. Unbalanced brackets are
/// an error.
pub fn parse_emphasis(text: &str) -> Result<Vec<WeightedFragment>, EmphasisError> {
    let mut fragments: Vec<WeightedFragment> = Vec::new();
    let mut stack: Vec<(Bracket, usize)> = Vec::new();
    let mut current = String::new();

    fn flush(current: &mut String, fragments: &mut Vec<WeightedFragment>) {
        if !current.is_empty() {
            fragments.push(WeightedFragment {
                text: std::mem::take(current),
                weight: 1.0,
            });
        }
    }

    fn scale(fragments: &mut [WeightedFragment], factor: f32) {
        for fragment in fragments {
            fragment.weight *= factor;
        }
    }

    let mut chars = text.char_indices().peekable();
    while let Some((pos, ch)) = chars.next() {
        match ch {
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    current.push(escaped);
                }
            }
            '(' | '[' => {
                flush(&mut current, &mut fragments);
                let kind = if ch == '(' { Bracket::Round } else { Bracket::Square };
                stack.push((kind, fragments.len()));
            }
            ':' if matches!(stack.last(), Some((Bracket::Round, _))) => {
                let rest = &text[pos + 1..];
                let explicit = rest
                    .find(')')
                    .and_then(|close| rest[..close].trim().parse::<f32>().ok().map(|w| (close, w)));
                match explicit {
                    Some((close, weight)) => {
                        flush(&mut current, &mut fragments);
                        if let Some((_, start)) = stack.pop() {
                            scale(&mut fragments[start..], weight);
                        }
                        // Skip the number and the closing bracket.
                        let resume = pos + 1 + close + 1;
                        while chars.peek().is_some_and(|&(i, _)| i < resume) {
                            chars.next();
                        }
                    }
                    None => current.push(ch),
                }
            }
            ')' | ']' => {
                let kind = if ch == ')' { Bracket::Round } else { Bracket::Square };
                match stack.pop() {
                    Some((open, start)) if open == kind => {
                        flush(&mut current, &mut fragments);
                        let factor = match kind {
                            Bracket::Round => EMPHASIS_STEP,
                            Bracket::Square => 1.0 / EMPHASIS_STEP,
                        };
                        scale(&mut fragments[start..], factor);
                    }
                    _ => return Err(EmphasisError::Unmatched(ch, pos)),
                }
            }
            _ => current.push(ch),
        }
    }
    if let Some((open, _)) = stack.last() {
        return Err(EmphasisError::Unclosed(open.open()));
    }
    flush(&mut current, &mut fragments);
    Ok(fragments)
}

/// Scales per-token hidden states by their weights, then restores the
/// original mean so the overall magnitude stays comparable.
fn apply_weights(hidden: &Tensor, weights: &[f32]) -> Result<Tensor> {
    if weights.iter().all(|&w| w == 1.0) {
        return Ok(hidden.clone());
    }
    let dtype = hidden.dtype();
    let hidden = hidden.to_dtype(DType::F32)?;
    let original_mean = hidden.mean_all()?.to_scalar::<f32>()?;
    let weights = Tensor::from_slice(weights, (1, weights.len(), 1), hidden.device())?;
    let weighted = hidden.broadcast_mul(&weights)?;
    let new_mean = weighted.mean_all()?.to_scalar::<f32>()?;
    let weighted = if new_mean != 0.0 {
        (weighted * f64::from(original_mean / new_mean))?
    } else {
        weighted
    };
    Ok(weighted.to_dtype(dtype)?)
}

/// Emphasis-aware primary encoder.
///
/// Honours `(word:1.2)` style weighting on prompts of any length: weighted
/// tokens are cut into `C + 2` windows the same way the long-prompt encoder
/// cuts them, each window is encoded and weighted on its own, and the windows
/// are concatenated. Pooled output comes from the first window. Only bad
/// emphasis syntax or an encoder error makes it fail.
#[derive(Clone)]
pub struct WeightedPromptEncoder {
    first: EncoderPair,
    second: EncoderPair,
    content_tokens: usize,
}

/// Framed window ids with the weight of every position.
type WeightedWindow = (Vec<u32>, Vec<f32>);

impl WeightedPromptEncoder {
    pub fn new(first: EncoderPair, second: EncoderPair) -> Self {
        Self {
            first,
            second,
            content_tokens: CONTENT_TOKENS_PER_CHUNK,
        }
    }

    pub fn with_content_tokens(mut self, content_tokens: usize) -> Self {
        self.content_tokens = content_tokens.max(1);
        self
    }

    /// Framed windows and matching per-token weights for one encoder.
    /// Boundary positions carry weight 1.
    fn weighted_windows(
        &self,
        pair: &EncoderPair,
        fragments: &[WeightedFragment],
    ) -> Result<Vec<WeightedWindow>> {
        let tokenizer = &pair.tokenizer;
        let (start, end) = (tokenizer.start_id(), tokenizer.end_id());
        let mut ids = Vec::new();
        let mut weights = Vec::new();
        for fragment in fragments {
            let fragment_ids = strip_boundaries(tokenizer.tokenize(&fragment.text)?, start, end);
            weights.extend(std::iter::repeat(fragment.weight).take(fragment_ids.len()));
            ids.extend(fragment_ids);
        }

        let windows = chunk_ids(&ids, start, end, self.content_tokens)
            .into_iter()
            .zip(weights.chunks(self.content_tokens))
            .map(|(chunk, block)| {
                let mut window_weights = Vec::with_capacity(chunk.len());
                window_weights.push(1.0);
                window_weights.extend_from_slice(block);
                window_weights.resize(chunk.len(), 1.0);
                (chunk, window_weights)
            })
            .collect();
        Ok(windows)
    }

    fn pad_windows(&self, windows: &mut Vec<WeightedWindow>, pair: &EncoderPair, count: usize) {
        let (start, end) = (pair.tokenizer.start_id(), pair.tokenizer.end_id());
        let width = self.content_tokens + 2;
        windows.resize_with(count, || (frame_chunk(&[], start, end, self.content_tokens), vec![1.0; width]));
    }
}

impl PromptEncoder for WeightedPromptEncoder {
    fn encode(&self, text: &str) -> Result<PromptEmbedding> {
        let fragments = parse_emphasis(text).context("invalid emphasis syntax")?;
        let mut windows_first = self.weighted_windows(&self.first, &fragments)?;
        let mut windows_second = self.weighted_windows(&self.second, &fragments)?;
        let count = windows_first.len().max(windows_second.len()).max(1);
        self.pad_windows(&mut windows_first, &self.first, count);
        self.pad_windows(&mut windows_second, &self.second, count);

        let mut embeds = Vec::with_capacity(count);
        let mut pooled = None;
        for ((ids_first, weights_first), (ids_second, weights_second)) in
            windows_first.iter().zip(&windows_second)
        {
            let first = self.first.encoder.encode(ids_first)?;
            let second = self.second.encoder.encode(ids_second)?;
            let dtype = second.hidden_states.dtype();
            let hidden_first = apply_weights(&first.hidden_states, weights_first)?.to_dtype(dtype)?;
            let hidden_second = apply_weights(&second.hidden_states, weights_second)?;
            embeds.push(Tensor::cat(&[&hidden_first, &hidden_second], D::Minus1)?);
            if pooled.is_none() {
                pooled = Some(second.pooled.context("second text encoder returned no pooled output")?);
            }
        }

        let embeds = Tensor::cat(&embeds, 1)?;
        let pooled = pooled
            .context("second text encoder returned no pooled output")?
            .to_dtype(embeds.dtype())?;
        Ok(PromptEmbedding { embeds, pooled })
    }
}
