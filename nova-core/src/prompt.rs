use crate::presets::{DEFAULT_NEGATIVE, POST_PROMPT, PREPROMPT, PRE_NEGATIVE};
use crate::request::{GenerationRequest, Preprompt};

/// Positive and negative text handed to the encoders for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    positive: String,
    negative: String,
}

impl PromptPair {
    pub fn new(positive: impl Into<String>, negative: impl Into<String>) -> Self {
        Self {
            positive: positive.into(),
            negative: negative.into(),
        }
    }

    /// Builds the final prompts from the user text and the preprompt setting.
    pub fn assemble(request: &GenerationRequest) -> Self {
        let prompt = request.prompt.as_str();
        let user_negative = request.negative_prompt.as_deref();

        match &request.prepend_preprompt {
            Preprompt::Enabled(true) => Self::new(
                format!("{PREPROMPT}{prompt}, {POST_PROMPT}"),
                format!("{PRE_NEGATIVE}{}", user_negative.unwrap_or_default()),
            ),
            Preprompt::Custom(prefix) if !prefix.trim().is_empty() => {
                let prefix = prefix.trim().trim_end_matches(',');
                Self::new(
                    format!("{prefix}, {prompt}"),
                    user_negative.unwrap_or(DEFAULT_NEGATIVE),
                )
            }
            _ => Self::new(prompt, user_negative.unwrap_or(DEFAULT_NEGATIVE)),
        }
    }

    pub fn positive(&self) -> &str {
        &self.positive
    }

    pub fn negative(&self) -> &str {
        &self.negative
    }
}
