use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessage, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{classify_openai_error, AppError};

use super::prompts::{extraction_schema, EXTRACTION_SYSTEM_MESSAGE};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExtractedInstance {
    pub quote: String,
    pub char_offset_start: u64,
    pub char_offset_end: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExtractedConcept {
    pub label: String,
    pub description: String,
    pub search_terms: Vec<String>,
    pub instances: Vec<ExtractedInstance>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExtractedRelationship {
    pub from_label: String,
    pub to_label: String,
    pub rel_type: String,
    pub confidence: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ChunkExtraction {
    pub concepts: Vec<ExtractedConcept>,
    pub relationships: Vec<ExtractedRelationship>,
}

/// The only place the pipeline learns about chat providers. The adapter
/// validates the schema at the boundary; downstream code sees typed values.
#[async_trait]
pub trait ExtractionAdapter: Send + Sync {
    async fn extract_concepts(
        &self,
        chunk_text: &str,
        vocabulary: &[String],
        context_hint: Option<&str>,
    ) -> Result<ChunkExtraction, AppError>;
}

pub struct OpenAiExtraction {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAiExtraction {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: String) -> Self {
        Self { client, model }
    }

    fn response_format() -> ResponseFormat {
        ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: Some("Concepts, evidence quotes and typed relationships".into()),
                name: "chunk_extraction".into(),
                schema: Some(extraction_schema()),
                strict: Some(true),
            },
        }
    }

    fn build_request(
        &self,
        chunk_text: &str,
        vocabulary: &[String],
        context_hint: Option<&str>,
    ) -> Result<CreateChatCompletionRequest, AppError> {
        let vocabulary_list = vocabulary.join(", ");
        let user_message = format!(
            "Relationship vocabulary: [{vocabulary_list}]\nContext: {hint}\nChunk:\n{chunk_text}",
            hint = context_hint.unwrap_or("none"),
        );

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(EXTRACTION_SYSTEM_MESSAGE).into(),
                ChatCompletionRequestUserMessage::from(user_message).into(),
            ])
            .response_format(Self::response_format())
            .build()
            .map_err(AppError::OpenAI)?;

        Ok(request)
    }

    fn build_repair_request(
        &self,
        original: &CreateChatCompletionRequest,
        invalid_output: &str,
        parse_error: &str,
    ) -> Result<CreateChatCompletionRequest, AppError> {
        let mut messages = original.messages.clone();
        messages.push(ChatCompletionRequestAssistantMessage::from(invalid_output).into());
        messages.push(
            ChatCompletionRequestUserMessage::from(format!(
                "That output failed schema validation: {parse_error}. \
                 Return the corrected object only."
            ))
            .into(),
        );

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .response_format(Self::response_format())
            .build()
            .map_err(AppError::OpenAI)?;

        Ok(request)
    }

    async fn complete(&self, request: CreateChatCompletionRequest) -> Result<String, AppError> {
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|err| classify_openai_error(&err))?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| AppError::AdapterFatal("no content in extraction response".into()))
    }
}

#[async_trait]
impl ExtractionAdapter for OpenAiExtraction {
    async fn extract_concepts(
        &self,
        chunk_text: &str,
        vocabulary: &[String],
        context_hint: Option<&str>,
    ) -> Result<ChunkExtraction, AppError> {
        let request = self.build_request(chunk_text, vocabulary, context_hint)?;
        let content = self.complete(request.clone()).await?;

        let extraction = match serde_json::from_str::<ChunkExtraction>(&content) {
            Ok(extraction) => extraction,
            Err(parse_error) => {
                // One repair round-trip; a second schema failure ends the chunk.
                warn!(%parse_error, "extraction output failed validation; attempting repair");
                let repair = self.build_repair_request(&request, &content, &parse_error.to_string())?;
                let repaired = self.complete(repair).await?;
                serde_json::from_str::<ChunkExtraction>(&repaired).map_err(|err| {
                    AppError::AdapterFatal(format!(
                        "extraction output invalid after repair: {err}"
                    ))
                })?
            }
        };

        debug!(
            concepts = extraction.concepts.len(),
            relationships = extraction.relationships.len(),
            "chunk extraction parsed"
        );
        Ok(extraction)
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod scripted {
    //! Deterministic extraction for tests: scripted responses first, then a
    //! rule-based fallback that derives one concept from the chunk text.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex;

    use super::{
        ChunkExtraction, ExtractedConcept, ExtractedInstance, ExtractionAdapter,
    };
    use crate::error::AppError;
    use async_trait::async_trait;

    #[derive(Default)]
    pub struct ScriptedExtraction {
        responses: Mutex<VecDeque<Result<ChunkExtraction, AppError>>>,
        delay: Mutex<Option<std::time::Duration>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedExtraction {
        pub fn new() -> Self {
            Self::default()
        }

        /// Slow every call down; lets tests cancel mid-job deterministically.
        pub async fn set_delay(&self, delay: std::time::Duration) {
            *self.delay.lock().await = Some(delay);
        }

        pub async fn push(&self, extraction: ChunkExtraction) {
            self.responses.lock().await.push_back(Ok(extraction));
        }

        pub async fn push_error(&self, error: AppError) {
            self.responses.lock().await.push_back(Err(error));
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    /// One concept per chunk, labelled after the first word, evidenced by a
    /// verbatim quote of that word. Offsets are exact by construction.
    pub fn rule_based(chunk_text: &str) -> ChunkExtraction {
        let Some(word_start) = chunk_text.find(|c: char| c.is_alphanumeric()) else {
            return ChunkExtraction::default();
        };
        let word_end = chunk_text[word_start..]
            .find(|c: char| !c.is_alphanumeric())
            .map_or(chunk_text.len(), |offset| word_start + offset);
        let quote = &chunk_text[word_start..word_end];

        ChunkExtraction {
            concepts: vec![ExtractedConcept {
                label: quote.to_owned(),
                description: format!("Concept derived from the text around '{quote}'"),
                search_terms: vec![quote.to_lowercase()],
                instances: vec![ExtractedInstance {
                    quote: quote.to_owned(),
                    char_offset_start: word_start as u64,
                    char_offset_end: word_end as u64,
                }],
            }],
            relationships: vec![],
        }
    }

    #[async_trait]
    impl ExtractionAdapter for ScriptedExtraction {
        async fn extract_concepts(
            &self,
            chunk_text: &str,
            _vocabulary: &[String],
            _context_hint: Option<&str>,
        ) -> Result<ChunkExtraction, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().await;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match self.responses.lock().await.pop_front() {
                Some(result) => result,
                None => Ok(rule_based(chunk_text)),
            }
        }
    }
}
