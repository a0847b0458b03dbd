use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::inference::{ModelId, ModelRuntime, RuntimeError, Tensor};

/// Runtime whose registered models return their inputs unchanged.
#[derive(Debug, Default)]
pub struct EchoRuntime {
    models: Mutex<HashSet<ModelId>>,
    failing: HashMap<ModelId, String>,
    delay: Option<Duration>,
}

impl EchoRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(self, model_id: ModelId) -> Self {
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model_id);
        self
    }

    /// A model that is registered but always fails with `message`.
    pub fn with_failing_model(mut self, model_id: ModelId, message: &str) -> Self {
        self.failing.insert(model_id, message.to_string());
        self.with_model(model_id)
    }

    /// Sleep this long before answering every run.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn is_registered(&self, model_id: &ModelId) -> bool {
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(model_id)
    }
}

#[async_trait]
impl ModelRuntime for EchoRuntime {
    async fn run(
        &self,
        model_id: &ModelId,
        inputs: Vec<Tensor>,
    ) -> Result<Vec<Tensor>, RuntimeError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if !self.is_registered(model_id) {
            return Err(RuntimeError::ModelNotFound);
        }
        if let Some(message) = self.failing.get(model_id) {
            return Err(RuntimeError::Failed(message.clone()));
        }
        Ok(inputs)
    }

    async fn delete(&self, model_id: &ModelId) -> Result<(), RuntimeError> {
        let removed = self
            .models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(model_id);
        if removed {
            Ok(())
        } else {
            Err(RuntimeError::ModelNotFound)
        }
    }
}
