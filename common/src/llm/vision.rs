use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ImageDetail, ImageUrlArgs,
    },
    Client,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{classify_openai_error, AppError};

use super::prompts::IMAGE_DESCRIPTION_PROMPT;

/// Turns an image into a dense textual description that then feeds the
/// normal text pipeline.
#[async_trait]
pub trait VisionAdapter: Send + Sync {
    async fn describe_image(&self, bytes: &[u8], mime_type: &str) -> Result<String, AppError>;
}

pub struct OpenAiVision {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAiVision {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl VisionAdapter for OpenAiVision {
    async fn describe_image(&self, bytes: &[u8], mime_type: &str) -> Result<String, AppError> {
        let base64_image = STANDARD.encode(bytes);
        let image_url = format!("data:{mime_type};base64,{base64_image}");

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([ChatCompletionRequestUserMessageArgs::default()
                .content(vec![
                    ChatCompletionRequestMessageContentPartTextArgs::default()
                        .text(IMAGE_DESCRIPTION_PROMPT)
                        .build()
                        .map_err(AppError::OpenAI)?
                        .into(),
                    ChatCompletionRequestMessageContentPartImageArgs::default()
                        .image_url(
                            ImageUrlArgs::default()
                                .url(image_url)
                                .detail(ImageDetail::High)
                                .build()
                                .map_err(AppError::OpenAI)?,
                        )
                        .build()
                        .map_err(AppError::OpenAI)?
                        .into(),
                ])
                .build()
                .map_err(AppError::OpenAI)?
                .into()])
            .build()
            .map_err(AppError::OpenAI)?;

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
            .filter(|description| !description.is_empty())
            .ok_or_else(|| AppError::AdapterFatal("no description in vision response".into()))
    }
}
