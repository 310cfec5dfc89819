// SPDX-License-Identifier: Apache-2.0

//! Wire shapes of the `streamGenerateContent` REST API, reduced to the
//! fields this server reads and writes.

use serde::{Deserialize, Serialize};

use crate::ModelError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<ChunkContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkContent {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<RequestContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<RequestContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContent {
    pub parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
}

impl GenerateRequest {
    #[must_use]
    pub fn from_prompt(prompt: &str) -> Self {
        Self {
            contents: vec![RequestContent {
                parts: vec![RequestPart {
                    text: prompt.to_string(),
                }],
            }],
            system_instruction: None,
            generation_config: None,
        }
    }

    #[must_use]
    pub fn with_system_instruction(mut self, instruction: &str) -> Self {
        self.system_instruction = Some(RequestContent {
            parts: vec![RequestPart {
                text: instruction.to_string(),
            }],
        });
        self
    }

    #[must_use]
    pub fn with_response_modalities(mut self, modalities: &[&str]) -> Self {
        self.generation_config = Some(GenerationConfig {
            response_modalities: modalities.iter().map(ToString::to_string).collect(),
        });
        self
    }
}

/// Every streamed chunk must carry exactly one candidate. A candidate with
/// no content contributes no parts.
pub fn single_candidate_parts(chunk: &StreamChunk) -> Result<&[Part], ModelError> {
    if chunk.candidates.len() != 1 {
        return Err(ModelError::unexpected(format!(
            "expected one candidate, got {}",
            chunk.candidates.len()
        )));
    }
    Ok(chunk.candidates[0]
        .content
        .as_ref()
        .map_or(&[], |content| content.parts.as_slice()))
}
