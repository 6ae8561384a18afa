use std::collections::HashMap;
use std::sync::Arc;

use crate::adaptor::Adaptor;
use crate::openai::OpenAiAdaptor;

/// Adaptors keyed by channel type, built once at startup
#[derive(Default, Clone)]
pub struct AdaptorRegistry {
    adaptors: HashMap<String, Arc<dyn Adaptor>>,
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in OpenAI-compatible adaptor under `openai`
    pub fn with_defaults(client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register("openai", Arc::new(OpenAiAdaptor::new(client)));
        registry
    }

    pub fn register(&mut self, channel_type: impl Into<String>, adaptor: Arc<dyn Adaptor>) {
        let channel_type = channel_type.into();
        tracing::debug!(channel_type = %channel_type, adaptor = adaptor.name(), "registered adaptor");
        self.adaptors.insert(channel_type, adaptor);
    }

    pub fn get(&self, channel_type: &str) -> Option<Arc<dyn Adaptor>> {
        self.adaptors.get(channel_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.adaptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adaptors.is_empty()
    }
}

impl std::fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptorRegistry")
            .field("channel_types", &self.adaptors.keys().collect::<Vec<_>>())
            .finish()
    }
}
