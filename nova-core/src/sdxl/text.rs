use std::path::Path;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::models::stable_diffusion::clip::{ClipTextTransformer, Config};
use tokenizers::Tokenizer;

use crate::capability::{EncoderOutput, TextEncoder, TextTokenizer};

const START_TOKEN: &str = "<|startoftext|>";
const END_TOKEN: &str = "<|endoftext|>";

/// CLIP BPE tokenizer without truncation.
pub struct HfTokenizer {
    tokenizer: Tokenizer,
    start_id: u32,
    end_id: u32,
}

impl HfTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        tokenizer
            .with_truncation(None)
            .map_err(Error::msg)
            .context("failed to disable tokenizer truncation")?;
        tokenizer.with_padding(None);
        let start_id = tokenizer
            .token_to_id(START_TOKEN)
            .with_context(|| format!("tokenizer has no {START_TOKEN} token"))?;
        let end_id = tokenizer
            .token_to_id(END_TOKEN)
            .with_context(|| format!("tokenizer has no {END_TOKEN} token"))?;
        Ok(Self {
            tokenizer,
            start_id,
            end_id,
        })
    }
}

impl TextTokenizer for HfTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(text, true).map_err(Error::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn start_id(&self) -> u32 {
        self.start_id
    }

    fn end_id(&self) -> u32 {
        self.end_id
    }
}

/// One SDXL CLIP text tower. The second tower carries a projection and
/// produces the pooled embedding.
pub struct ClipEncoder {
    model: ClipTextTransformer,
    projection: Option<Linear>,
    end_id: u32,
    device: Device,
}

impl ClipEncoder {
    /// `model.safetensors` of a diffusers `text_encoder*` folder.
    pub fn load(
        weights: impl AsRef<Path>,
        config: &Config,
        projection_dims: Option<(usize, usize)>,
        end_id: u32,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights.as_ref()], dtype, device)
                .context("failed to build CLIP var builder")?
        };
        let model = ClipTextTransformer::new(vb.clone(), config).context("failed to load CLIP model")?;
        let projection = match projection_dims {
            Some((embed_dim, projection_dim)) => Some(
                candle_nn::linear_no_bias(embed_dim, projection_dim, vb.pp("text_projection"))
                    .context("failed to load CLIP text projection")?,
            ),
            None => None,
        };
        Ok(Self {
            model,
            projection,
            end_id,
            device: device.clone(),
        })
    }
}

impl TextEncoder for ClipEncoder {
    fn encode(&self, ids: &[u32]) -> Result<EncoderOutput> {
        let input = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let (last, penultimate) = self.model.forward_until_encoder_layer(&input, usize::MAX, -2)?;
        let pooled = match &self.projection {
            Some(projection) => {
                // First end token after the start token.
                let eos = ids
                    .iter()
                    .skip(1)
                    .position(|&id| id == self.end_id)
                    .map_or(ids.len().saturating_sub(1), |p| p + 1);
                let pooled = last.i((.., eos, ..))?;
                Some(projection.forward(&pooled)?)
            }
            None => None,
        };
        Ok(EncoderOutput {
            hidden_states: penultimate,
            pooled,
        })
    }
}
