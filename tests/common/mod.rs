//! Shared test backends

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use context_gateway::generation::{GenerationBackend, GenerationError, GenerationRequest};

/// Backend that replays scripted results, then repeats a default
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Result<String, GenerationError>>>,
    default: Result<String, GenerationError>,
    calls: AtomicU32,
    last_request: Mutex<Option<GenerationRequest>>,
}

#[allow(dead_code)]
impl ScriptedBackend {
    pub fn new(name: &str, script: Vec<Result<String, GenerationError>>, default: Result<String, GenerationError>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            default,
            calls: AtomicU32::new(0),
            last_request: Mutex::new(None),
        })
    }

    pub fn succeeding(name: &str, text: &str) -> Arc<Self> {
        Self::new(name, Vec::new(), Ok(text.to_string()))
    }

    pub fn failing(name: &str, err: GenerationError) -> Arc<Self> {
        Self::new(name, Vec::new(), Err(err))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.default.clone())
    }
}

#[allow(dead_code)]
pub fn http_error(status: u16, message: &str) -> GenerationError {
    GenerationError::Http {
        status,
        message: message.to_string(),
    }
}
