//! A scripted provider for tests in this and downstream crates.
//!
//! Enabled for this crate's tests and, elsewhere, through the
//! `test-helpers` feature.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use threadline_core::error::ProviderError;
use threadline_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};

// ── Mock Provider ────────────────────────────────────────────────────────

/// Returns queued responses in order and records every request it sees.
///
/// When the queue is empty it repeats the `replying` text if one was set,
/// otherwise it panics.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    repeat: Option<String>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with the same text.
    pub fn replying(text: &str) -> Self {
        Self {
            repeat: Some(text.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// A successful response with 10 prompt + 5 completion tokens.
    pub fn text_response(text: &str) -> ProviderResponse {
        ProviderResponse {
            content: text.to_string(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            model: "mock-model".into(),
        }
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len()
        };
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        match &self.repeat {
            Some(text) => Ok(Self::text_response(text)),
            None => panic!("ScriptedProvider exhausted on call #{call}"),
        }
    }
}
