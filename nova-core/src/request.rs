use serde::{Deserialize, Serialize};

use crate::presets::{
    DEFAULT_CLIP_SKIP, DEFAULT_GUIDANCE, DEFAULT_GUIDANCE_RESCALE, DEFAULT_HEIGHT,
    DEFAULT_PAG_SCALE, DEFAULT_STEPS, DEFAULT_WIDTH, MAX_DIMENSION, MAX_OUTPUTS, MAX_STEPS,
};
use crate::GenerationError;

/// Seed value that asks for a non-deterministic generation.
pub const RANDOM_SEED: i64 = -1;

/// How the fixed preprompt fragments are applied to a request.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Preprompt {
    /// `true` wraps the prompt with the checkpoint's quality fragments.
    Enabled(bool),
    /// A non-blank string replaces the fixed prefix.
    Custom(String),
}

impl Default for Preprompt {
    fn default() -> Self {
        Self::Enabled(true)
    }
}

/// One generation request as accepted by the runtime.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub prepend_preprompt: Preprompt,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_guidance")]
    pub guidance_scale: f64,
    #[serde(default = "default_guidance_rescale")]
    pub guidance_rescale: f64,
    #[serde(default = "default_clip_skip")]
    pub clip_skip: Option<usize>,
    #[serde(default = "default_pag_scale")]
    pub pag_scale: f64,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default = "default_num_outputs")]
    pub num_outputs: usize,
    #[serde(default = "default_face_refinement")]
    pub face_refinement: bool,
}

fn default_steps() -> usize {
    DEFAULT_STEPS
}

fn default_guidance() -> f64 {
    DEFAULT_GUIDANCE
}

fn default_guidance_rescale() -> f64 {
    DEFAULT_GUIDANCE_RESCALE
}

fn default_clip_skip() -> Option<usize> {
    Some(DEFAULT_CLIP_SKIP)
}

fn default_pag_scale() -> f64 {
    DEFAULT_PAG_SCALE
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

fn default_num_outputs() -> usize {
    1
}

fn default_face_refinement() -> bool {
    true
}

impl GenerationRequest {
    /// A request carrying the default value for every parameter but the prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            prepend_preprompt: Preprompt::default(),
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE,
            guidance_rescale: DEFAULT_GUIDANCE_RESCALE,
            clip_skip: default_clip_skip(),
            pag_scale: DEFAULT_PAG_SCALE,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            seed: None,
            num_outputs: 1,
            face_refinement: true,
        }
    }

    /// The seed to drive a deterministic generator, if any. `-1` means random.
    pub fn effective_seed(&self) -> Option<i64> {
        self.seed.filter(|&seed| seed != RANDOM_SEED)
    }

    /// Guidance rescale as handed to the sampler: never negative.
    pub fn effective_guidance_rescale(&self) -> f64 {
        if self.guidance_rescale > 0.0 {
            self.guidance_rescale
        } else {
            0.0
        }
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        fn reject(msg: String) -> Result<(), GenerationError> {
            Err(GenerationError::InvalidRequest(msg))
        }

        if !(1..=MAX_OUTPUTS).contains(&self.num_outputs) {
            return reject(format!(
                "num_outputs must be between 1 and {MAX_OUTPUTS}, got {}",
                self.num_outputs
            ));
        }
        if !(1..=MAX_STEPS).contains(&self.steps) {
            return reject(format!(
                "steps must be between 1 and {MAX_STEPS}, got {}",
                self.steps
            ));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if !(1..=MAX_DIMENSION).contains(&value) {
                return reject(format!(
                    "{name} must be between 1 and {MAX_DIMENSION}, got {value}"
                ));
            }
        }
        if !(1.0..=50.0).contains(&self.guidance_scale) {
            return reject(format!(
                "guidance_scale must be between 1 and 50, got {}",
                self.guidance_scale
            ));
        }
        // Negative rescale is tolerated and clamped to zero at sampling time.
        if self.guidance_rescale > 5.0 {
            return reject(format!(
                "guidance_rescale must be at most 5, got {}",
                self.guidance_rescale
            ));
        }
        if !(0.0..=50.0).contains(&self.pag_scale) {
            return reject(format!(
                "pag_scale must be between 0 and 50, got {}",
                self.pag_scale
            ));
        }
        if self.clip_skip == Some(0) {
            return reject("clip_skip must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_fill_missing_fields() {
        let req: GenerationRequest = serde_json::from_str(r#"{"prompt": "a cat"}"#).unwrap();
        assert_eq!(req, GenerationRequest::new("a cat"));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn preprompt_accepts_bool_and_string() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "x", "prepend_preprompt": false}"#).unwrap();
        assert_eq!(req.prepend_preprompt, Preprompt::Enabled(false));

        let req: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "x", "prepend_preprompt": "cinematic,"}"#)
                .unwrap();
        assert_eq!(req.prepend_preprompt, Preprompt::Custom("cinematic,".into()));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "x", "scheduler": "Euler a"}"#).unwrap();
        assert_eq!(req.prompt, "x");
    }

    #[rstest]
    #[case(None, None)]
    #[case(Some(-1), None)]
    #[case(Some(42), Some(42))]
    #[case(Some(0), Some(0))]
    fn random_seed_sentinel(#[case] seed: Option<i64>, #[case] expected: Option<i64>) {
        let mut req = GenerationRequest::new("x");
        req.seed = seed;
        assert_eq!(req.effective_seed(), expected);
    }

    #[rstest]
    #[case(0)]
    #[case(5)]
    fn output_count_is_bounded(#[case] n: usize) {
        let mut req = GenerationRequest::new("x");
        req.num_outputs = n;
        assert!(req.validate().unwrap_err().is_client_error());
    }

    #[test]
    fn out_of_range_dimensions_are_rejected() {
        let mut req = GenerationRequest::new("x");
        req.width = 5000;
        assert!(matches!(
            req.validate(),
            Err(GenerationError::InvalidRequest(msg)) if msg.contains("width")
        ));
    }

    #[test]
    fn negative_rescale_is_clamped() {
        let mut req = GenerationRequest::new("x");
        req.guidance_rescale = -0.5;
        assert_eq!(req.effective_guidance_rescale(), 0.0);
        req.guidance_rescale = 0.7;
        assert_eq!(req.effective_guidance_rescale(), 0.7);
    }
}
