//! Text generation backends and the resilient client that fronts them

pub mod backend;
pub mod openai;
pub mod resilient;

pub use backend::{GenerationBackend, GenerationError, GenerationRequest};
pub use openai::{BackendConfig, OpenAiCompatibleBackend};
pub use resilient::{FallbackStats, GenerationOutcome, ResilientGenerationClient};

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{GenerationBackend, GenerationError, GenerationRequest};

    /// Backend replaying scripted results, then repeating a default
    pub struct ScriptedBackend {
        name: String,
        script: Mutex<VecDeque<Result<String, GenerationError>>>,
        default: Result<String, GenerationError>,
        calls: AtomicU32,
        last_request: Mutex<Option<GenerationRequest>>,
    }

    impl ScriptedBackend {
        pub fn new(name: &str, script: Vec<Result<String, GenerationError>>) -> Arc<Self> {
            Self::build(name, script, Ok("ok".to_string()))
        }

        pub fn succeeding(name: &str, text: &str) -> Arc<Self> {
            Self::build(name, Vec::new(), Ok(text.to_string()))
        }

        pub fn failing(name: &str, err: GenerationError) -> Arc<Self> {
            Self::build(name, Vec::new(), Err(err))
        }

        fn build(
            name: &str,
            script: Vec<Result<String, GenerationError>>,
            default: Result<String, GenerationError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: Mutex::new(script.into()),
                default,
                calls: AtomicU32::new(0),
                last_request: Mutex::new(None),
            })
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
}
