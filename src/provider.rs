//! External provider traits (§6 External Interfaces).
//!
//! Grounded on `client_wrapper.rs`'s `ClientWrapper` trait shape — a thin,
//! object-safe async trait per capability, implemented by real SDK clients
//! outside this crate and by deterministic in-memory stubs for tests.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::KernelError;

/// Tokens or audio chunks streamed back from a provider call.
pub enum StreamChunk {
    Text(String),
    Audio(Vec<u8>),
}

/// A completed non-streaming LLM response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cached_tokens: u64,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_name(&self) -> &str;
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<LlmResponse, KernelError>;

    /// Stream generation as text chunks; the final chunk's usage is reported
    /// via the returned `LlmResponse` once the stream completes.
    async fn stream(&self, prompt: &str) -> Result<(BoxStream<'static, String>, LlmResponse), KernelError>;
}

#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub text: String,
    pub audio_duration_ms: u64,
}

#[async_trait]
pub trait SttProvider: Send + Sync {
    fn provider_name(&self) -> &str;
    fn model_name(&self) -> &str;

    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<TranscriptionResult, KernelError>;
}

#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub audio: Vec<u8>,
    pub char_count: u64,
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn provider_name(&self) -> &str;
    fn model_name(&self) -> &str;

    async fn synthesize(&self, text: &str) -> Result<SynthesisResult, KernelError>;

    async fn stream(&self, text: &str) -> Result<(BoxStream<'static, Vec<u8>>, SynthesisResult), KernelError>;
}

/// Deterministic stubs confined to this crate's own test harness — never
/// wired into a real topology. Mirrors the source's fixture providers used
/// under `tests/`.
pub mod stub {
    use super::*;
    use futures_util::stream;

    pub struct StubLlmProvider {
        pub provider: String,
        pub model: String,
        pub reply: String,
    }

    #[async_trait]
    impl LlmProvider for StubLlmProvider {
        fn provider_name(&self) -> &str {
            &self.provider
        }

        fn model_name(&self) -> &str {
            &self.model
        }

        async fn generate(&self, prompt: &str) -> Result<LlmResponse, KernelError> {
            Ok(LlmResponse {
                text: self.reply.clone(),
                tokens_in: prompt.split_whitespace().count() as u64,
                tokens_out: self.reply.split_whitespace().count() as u64,
                cached_tokens: 0,
            })
        }

        async fn stream(&self, prompt: &str) -> Result<(BoxStream<'static, String>, LlmResponse), KernelError> {
            let response = self.generate(prompt).await?;
            let chunks: Vec<String> = response.text.split(' ').map(|w| format!("{w} ")).collect();
            Ok((Box::pin(stream::iter(chunks)), response))
        }
    }

    /// An `LlmProvider` that always fails, for exercising mid-stream failure
    /// and the dead-letter queue.
    pub struct FailingLlmProvider {
        pub provider: String,
        pub model: String,
        pub message: String,
    }

    #[async_trait]
    impl LlmProvider for FailingLlmProvider {
        fn provider_name(&self) -> &str {
            &self.provider
        }

        fn model_name(&self) -> &str {
            &self.model
        }

        async fn generate(&self, _prompt: &str) -> Result<LlmResponse, KernelError> {
            Err(KernelError::provider(self.message.clone()))
        }

        async fn stream(&self, _prompt: &str) -> Result<(BoxStream<'static, String>, LlmResponse), KernelError> {
            Err(KernelError::provider(self.message.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::stub::StubLlmProvider;
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn stub_llm_provider_generates_its_canned_reply() {
        let provider = StubLlmProvider {
            provider: "stub".into(),
            model: "stub-1".into(),
            reply: "hello there".into(),
        };
        let response = provider.generate("hi").await.unwrap();
        assert_eq!(response.text, "hello there");
        assert_eq!(response.tokens_out, 2);
    }

    #[tokio::test]
    async fn stub_llm_provider_streams_word_chunks() {
        let provider = StubLlmProvider {
            provider: "stub".into(),
            model: "stub-1".into(),
            reply: "a b c".into(),
        };
        let (mut chunks, _response) = provider.stream("hi").await.unwrap();
        let mut collected = String::new();
        while let Some(chunk) = chunks.next().await {
            collected.push_str(&chunk);
        }
        assert_eq!(collected.trim(), "a b c");
    }
}
