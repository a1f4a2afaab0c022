use anyhow::{Context, Result};
use candle_core::{Tensor, D};
use tracing::debug;

use crate::capability::EncoderPair;
use crate::presets::CONTENT_TOKENS_PER_CHUNK;

/// Drops the start and end ids a tokenizer wraps around its output, leaving
/// raw content ids. Sequences not wrapped on both ends are returned as is.
pub(crate) fn strip_boundaries(mut ids: Vec<u32>, start: u32, end: u32) -> Vec<u32> {
    if ids.len() >= 2 && ids[0] == start && ids[ids.len() - 1] == end {
        ids.pop();
        ids.remove(0);
    }
    ids
}

/// `[start] + block + [end] * (content - block.len() + 1)`: always `content + 2` wide.
pub(crate) fn frame_chunk(block: &[u32], start: u32, end: u32, content: usize) -> Vec<u32> {
    let mut chunk = Vec::with_capacity(content + 2);
    chunk.push(start);
    chunk.extend_from_slice(block);
    chunk.resize(content + 2, end);
    chunk
}

pub(crate) fn chunk_ids(ids: &[u32], start: u32, end: u32, content: usize) -> Vec<Vec<u32>> {
    ids.chunks(content)
        .map(|block| frame_chunk(block, start, end, content))
        .collect()
}

/// Output of [`LongPromptEncoder::encode`].
pub struct LongPromptEmbedding {
    /// `[1, chunks * (C + 2), hidden_1 + hidden_2]`
    pub positive: Tensor,
    pub negative: Tensor,
    /// `[1, proj]`, second encoder, first chunk.
    pub pooled_positive: Tensor,
    pub pooled_negative: Tensor,
    pub chunks: usize,
}

/// Chunking encoder for prompts longer than the CLIP window.
///
/// Each text is tokenized without truncation, cut into blocks of `C` content
/// tokens framed by boundary ids, and every block is encoded separately by
/// both encoders. Chunk embeddings are concatenated in reading order. Positive
/// and negative texts, on both encoders, are padded with boundary-only chunks
/// to the same chunk count so their sequence lengths always agree.
#[derive(Clone)]
pub struct LongPromptEncoder {
    first: EncoderPair,
    second: EncoderPair,
    content_tokens: usize,
}

impl LongPromptEncoder {
    pub fn new(first: EncoderPair, second: EncoderPair) -> Self {
        Self {
            first,
            second,
            content_tokens: CONTENT_TOKENS_PER_CHUNK,
        }
    }

    /// Overrides the number of content tokens per chunk (75 for CLIP).
    pub fn with_content_tokens(mut self, content_tokens: usize) -> Self {
        self.content_tokens = content_tokens.max(1);
        self
    }

    /// Width of every chunk, boundaries included.
    pub fn chunk_width(&self) -> usize {
        self.content_tokens + 2
    }

    fn chunks_for(&self, pair: &EncoderPair, text: &str) -> Result<Vec<Vec<u32>>> {
        let tokenizer = &pair.tokenizer;
        let (start, end) = (tokenizer.start_id(), tokenizer.end_id());
        let ids = strip_boundaries(tokenizer.tokenize(text)?, start, end);
        Ok(chunk_ids(&ids, start, end, self.content_tokens))
    }

    fn pad_chunks(&self, chunks: &mut Vec<Vec<u32>>, pair: &EncoderPair, num_chunks: usize) {
        let (start, end) = (pair.tokenizer.start_id(), pair.tokenizer.end_id());
        chunks.resize_with(num_chunks, || frame_chunk(&[], start, end, self.content_tokens));
    }

    /// Both encoders on one chunk, features concatenated; plus the second
    /// encoder's pooled output.
    fn encode_chunk(&self, ids_first: &[u32], ids_second: &[u32]) -> Result<(Tensor, Option<Tensor>)> {
        let first = self.first.encoder.encode(ids_first)?;
        let second = self.second.encoder.encode(ids_second)?;
        let dtype = second.hidden_states.dtype();
        let hidden_first = first.hidden_states.to_dtype(dtype)?;
        let embeds = Tensor::cat(&[&hidden_first, &second.hidden_states], D::Minus1)?;
        Ok((embeds, second.pooled))
    }

    /// Encodes a prompt/negative pair of any length.
    ///
    /// `clip_skip` is accepted for parity with the sampler parameters; the
    /// hidden states are always taken from the penultimate layer, the same
    /// layer the weighted encoder uses.
    pub fn encode(
        &self,
        prompt: &str,
        negative: &str,
        clip_skip: Option<usize>,
    ) -> Result<LongPromptEmbedding> {
        let mut pos_first = self.chunks_for(&self.first, prompt)?;
        let mut pos_second = self.chunks_for(&self.second, prompt)?;
        let mut neg_first = self.chunks_for(&self.first, negative)?;
        let mut neg_second = self.chunks_for(&self.second, negative)?;

        let num_chunks = [&pos_first, &pos_second, &neg_first, &neg_second]
            .iter()
            .map(|chunks| chunks.len())
            .max()
            .unwrap_or(0)
            .max(1);
        debug!(num_chunks, ?clip_skip, "encoding long prompt");

        self.pad_chunks(&mut pos_first, &self.first, num_chunks);
        self.pad_chunks(&mut pos_second, &self.second, num_chunks);
        self.pad_chunks(&mut neg_first, &self.first, num_chunks);
        self.pad_chunks(&mut neg_second, &self.second, num_chunks);

        let mut positive = Vec::with_capacity(num_chunks);
        let mut negative = Vec::with_capacity(num_chunks);
        let mut pooled_positive = None;
        let mut pooled_negative = None;
        for i in 0..num_chunks {
            let (embeds, pooled) = self.encode_chunk(&pos_first[i], &pos_second[i])?;
            if i == 0 {
                pooled_positive = pooled;
            }
            positive.push(embeds);

            let (embeds, pooled) = self.encode_chunk(&neg_first[i], &neg_second[i])?;
            if i == 0 {
                pooled_negative = pooled;
            }
            negative.push(embeds);
        }

        let positive = Tensor::cat(&positive, 1)?;
        let negative = Tensor::cat(&negative, 1)?;
        let dtype = positive.dtype();
        let pooled_positive = pooled_positive
            .context("second text encoder returned no pooled output")?
            .to_dtype(dtype)?;
        let pooled_negative = pooled_negative
            .context("second text encoder returned no pooled output")?
            .to_dtype(dtype)?;

        Ok(LongPromptEmbedding {
            positive,
            negative,
            pooled_positive,
            pooled_negative,
            chunks: num_chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::bail;
    use candle_core::{DType, Device, IndexOp};
    use rstest::rstest;

    use super::*;
    use crate::capability::{EncoderOutput, TextEncoder, TextTokenizer};

    const START: u32 = 900;
    const END: u32 = 901;

    /// One id per whitespace-separated word, wrapped in boundaries.
    struct WordTokenizer;

    impl TextTokenizer for WordTokenizer {
        fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
            if text.contains('\u{0}') {
                bail!("tokenizer rejected input");
            }
            let mut ids = vec![START];
            ids.extend(text.split_whitespace().map(|w| w.len() as u32));
            ids.push(END);
            Ok(ids)
        }

        fn start_id(&self) -> u32 {
            START
        }

        fn end_id(&self) -> u32 {
            END
        }
    }

    /// Hidden state of token `t` is `[t; hidden]`; pooled is the first id.
    struct EchoEncoder {
        hidden: usize,
        pooled: bool,
    }

    impl TextEncoder for EchoEncoder {
        fn encode(&self, ids: &[u32]) -> Result<EncoderOutput> {
            let data: Vec<f32> = ids
                .iter()
                .flat_map(|&id| std::iter::repeat(id as f32).take(self.hidden))
                .collect();
            let hidden_states = Tensor::from_vec(data, (1, ids.len(), self.hidden), &Device::Cpu)?;
            let pooled = if self.pooled {
                Some(Tensor::full(ids[1] as f32, (1, 3), &Device::Cpu)?)
            } else {
                None
            };
            Ok(EncoderOutput {
                hidden_states,
                pooled,
            })
        }
    }

    fn encoder(content: usize) -> LongPromptEncoder {
        let tokenizer = Arc::new(WordTokenizer);
        LongPromptEncoder::new(
            EncoderPair::new(tokenizer.clone(), Arc::new(EchoEncoder { hidden: 2, pooled: false })),
            EncoderPair::new(tokenizer, Arc::new(EchoEncoder { hidden: 3, pooled: true })),
        )
        .with_content_tokens(content)
    }

    fn words(n: usize) -> String {
        (0..n).map(|i| "w".repeat(1 + i % 5)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn strip_only_when_wrapped() {
        assert_eq!(strip_boundaries(vec![START, 1, 2, END], START, END), vec![1, 2]);
        assert_eq!(strip_boundaries(vec![1, 2, END], START, END), vec![1, 2, END]);
        assert_eq!(strip_boundaries(vec![START, END], START, END), Vec::<u32>::new());
    }

    #[test]
    fn last_chunk_is_padded_not_truncated() {
        let chunks = chunk_ids(&[1, 2, 3, 4, 5], START, END, 3);
        assert_eq!(chunks, vec![vec![START, 1, 2, 3, END], vec![START, 4, 5, END, END]]);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(75, 1)]
    #[case(76, 2)]
    #[case(150, 2)]
    #[case(151, 3)]
    fn chunk_count_and_width(#[case] tokens: usize, #[case] expected: usize) -> Result<()> {
        let enc = encoder(75);
        let out = enc.encode(&words(tokens), "", None)?;
        assert_eq!(out.chunks, expected);
        assert_eq!(out.positive.dims(), &[1, expected * 77, 5]);
        Ok(())
    }

    #[test]
    fn positive_and_negative_lengths_match() -> Result<()> {
        let enc = encoder(4);
        let out = enc.encode("a", &words(13), None)?;
        assert_eq!(out.chunks, 4);
        assert_eq!(out.positive.dims(), out.negative.dims());
        Ok(())
    }

    #[test]
    fn chunks_keep_reading_order() -> Result<()> {
        let enc = encoder(2);
        // word lengths 1, 2, 3 become ids 1, 2, 3
        let out = enc.encode("a bb ccc", "", None)?;
        let first_feature: Vec<f32> = out.positive.i((0, .., 0))?.to_vec1()?;
        assert_eq!(
            first_feature,
            vec![900., 1., 2., 901., 900., 3., 901., 901.]
        );
        Ok(())
    }

    #[test]
    fn pooled_comes_from_first_chunk_only() -> Result<()> {
        let enc = encoder(2);
        let out = enc.encode("ccc a bbbb", "", None)?;
        let pooled: Vec<f32> = out.pooled_positive.flatten_all()?.to_vec1()?;
        assert_eq!(pooled, vec![3.0; 3]);
        // negative is empty, so its first chunk starts with an end id
        let pooled: Vec<f32> = out.pooled_negative.flatten_all()?.to_vec1()?;
        assert_eq!(pooled, vec![END as f32; 3]);
        assert_eq!(out.pooled_positive.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn empty_text_yields_one_boundary_chunk() -> Result<()> {
        let enc = encoder(75);
        let out = enc.encode("", "", None)?;
        assert_eq!(out.chunks, 1);
        assert_eq!(out.negative.dims(), &[1, 77, 5]);
        Ok(())
    }

    #[test]
    fn tokenizer_failure_propagates() {
        let enc = encoder(75);
        assert!(enc.encode("bad\u{0}", "", None).is_err());
    }
}
