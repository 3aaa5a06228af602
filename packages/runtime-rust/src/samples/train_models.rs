//! Train-models workflow.
//!
//! `TrainModels` starts two status checks. A check whose training is still
//! pending re-sends itself after [`POLL_DELAY`]; a finished check reports the
//! model as trained. Once both models are trained the saga sends
//! `ModelsTrained` and completes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use simplebus_core::{
    ConfigError, Handle, Handler, Outbox, Saga, SagaData, StartedBy, StateMapper,
};
use tracing::info;
use uuid::Uuid;

use crate::dispatch::HandlerRegistry;

/// Delay before a pending status check is retried.
pub const POLL_DELAY: Duration = Duration::from_secs(2);

sample_message!(
    /// Starts the workflow.
    TrainModels = "sample.train-models" { id: Uuid }
);
sample_message!(
    /// Sent when both models are trained.
    ModelsTrained = "sample.models-trained" { id: Uuid }
);
sample_message!(CheckIntentClassifier = "sample.check-intent-classifier" { id: Uuid });
sample_message!(CheckEntityRecognizer = "sample.check-entity-recognizer" { id: Uuid });
sample_message!(IntentClassifierTrained = "sample.intent-classifier-trained" { id: Uuid });
sample_message!(EntityRecognizerTrained = "sample.entity-recognizer-trained" { id: Uuid });

/// Reports whether a model's training has finished.
pub type StatusProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Training finishes on roughly two checks out of three.
#[must_use]
pub fn random_status() -> bool {
    rand::rng().random_range(0..3) != 0
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainModelsState {
    pub agent_id: Uuid,
    pub intent_classifier_completed: bool,
    pub entity_recognizer_completed: bool,
}

pub struct TrainModelsWorkflow {
    data: SagaData<TrainModelsState>,
    probe: StatusProbe,
}

impl TrainModelsWorkflow {
    #[must_use]
    pub fn new(probe: StatusProbe) -> Self {
        Self {
            data: SagaData::new(),
            probe,
        }
    }

    fn complete_when_trained(&mut self, id: Uuid, bus: &mut Outbox) -> anyhow::Result<()> {
        let state = self.state()?;
        if state.intent_classifier_completed && state.entity_recognizer_completed {
            info!(%id, "training completed");
            bus.send(&ModelsTrained { id })?;
            self.mark_as_completed();
        }
        Ok(())
    }
}

impl Default for TrainModelsWorkflow {
    fn default() -> Self {
        Self::new(Arc::new(random_status))
    }
}

impl Handler for TrainModelsWorkflow {}

impl Saga for TrainModelsWorkflow {
    const SAGA_TYPE: &'static str = "sample.train-models-workflow";
    type State = TrainModelsState;

    fn configure_mapping(mapper: &mut StateMapper<Self>) {
        mapper
            .start_with::<TrainModels>("id", "agent_id")
            .map::<CheckIntentClassifier>("id", "agent_id")
            .map::<CheckEntityRecognizer>("id", "agent_id")
            .map::<IntentClassifierTrained>("id", "agent_id")
            .map::<EntityRecognizerTrained>("id", "agent_id");
    }

    fn saga_data(&self) -> &SagaData<TrainModelsState> {
        &self.data
    }

    fn saga_data_mut(&mut self) -> &mut SagaData<TrainModelsState> {
        &mut self.data
    }
}

impl StartedBy<TrainModels> for TrainModelsWorkflow {}

#[async_trait]
impl Handle<TrainModels> for TrainModelsWorkflow {
    async fn handle(&mut self, message: &TrainModels, bus: &mut Outbox) -> anyhow::Result<()> {
        info!(id = %message.id, "training intent classifier and entity recognizer");
        bus.send(&CheckIntentClassifier { id: message.id })?;
        bus.send(&CheckEntityRecognizer { id: message.id })?;
        Ok(())
    }
}

#[async_trait]
impl Handle<CheckIntentClassifier> for TrainModelsWorkflow {
    async fn handle(&mut self, message: &CheckIntentClassifier, bus: &mut Outbox) -> anyhow::Result<()> {
        if (self.probe)() {
            info!(id = %message.id, "intent classifier training completed");
            bus.send(&IntentClassifierTrained { id: message.id })?;
        } else {
            info!(id = %message.id, "intent classifier training pending");
            bus.retry(message, POLL_DELAY)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Handle<CheckEntityRecognizer> for TrainModelsWorkflow {
    async fn handle(&mut self, message: &CheckEntityRecognizer, bus: &mut Outbox) -> anyhow::Result<()> {
        if (self.probe)() {
            info!(id = %message.id, "entity recognizer training completed");
            bus.send(&EntityRecognizerTrained { id: message.id })?;
        } else {
            info!(id = %message.id, "entity recognizer training pending");
            bus.retry(message, POLL_DELAY)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Handle<IntentClassifierTrained> for TrainModelsWorkflow {
    async fn handle(&mut self, message: &IntentClassifierTrained, bus: &mut Outbox) -> anyhow::Result<()> {
        self.state_mut()?.intent_classifier_completed = true;
        self.complete_when_trained(message.id, bus)
    }
}

#[async_trait]
impl Handle<EntityRecognizerTrained> for TrainModelsWorkflow {
    async fn handle(&mut self, message: &EntityRecognizerTrained, bus: &mut Outbox) -> anyhow::Result<()> {
        self.state_mut()?.entity_recognizer_completed = true;
        self.complete_when_trained(message.id, bus)
    }
}

/// Registers the workflow with the random status probe.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the workflow's mapping is invalid or a
/// handler is registered twice.
pub fn register(registry: &HandlerRegistry) -> Result<(), ConfigError> {
    register_with(registry, Arc::new(random_status))
}

/// Registers the workflow with a custom status probe.
///
/// # Errors
///
/// Same as [`register`].
pub fn register_with(registry: &HandlerRegistry, probe: StatusProbe) -> Result<(), ConfigError> {
    registry
        .saga(move || TrainModelsWorkflow::new(Arc::clone(&probe)))?
        .handles::<TrainModels>()?
        .handles::<CheckIntentClassifier>()?
        .handles::<CheckEntityRecognizer>()?
        .handles::<IntentClassifierTrained>()?
        .handles::<EntityRecognizerTrained>()?;
    registry.message::<ModelsTrained>();
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use simplebus_core::Dispatch;

    use super::*;

    fn hydrated(finished: bool) -> (TrainModelsWorkflow, Uuid) {
        let id = Uuid::new_v4();
        let mut workflow = TrainModelsWorkflow::new(Arc::new(move || finished));
        workflow.saga_data_mut().assign(TrainModelsState {
            agent_id: id,
            ..TrainModelsState::default()
        });
        (workflow, id)
    }

    #[tokio::test]
    async fn pending_check_is_retried_after_the_poll_delay() {
        let (mut workflow, id) = hydrated(false);
        let mut bus = Outbox::new();

        workflow
            .handle(&CheckIntentClassifier { id }, &mut bus)
            .await
            .unwrap();

        match bus.pending() {
            [Dispatch::Retry { envelope, delay }] => {
                assert_eq!(*delay, POLL_DELAY);
                assert_eq!(
                    envelope.open_as::<CheckIntentClassifier>().unwrap(),
                    CheckIntentClassifier { id }
                );
            }
            other => panic!("expected a single retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn both_models_trained_completes() {
        let (mut workflow, id) = hydrated(true);
        let mut bus = Outbox::new();

        workflow
            .handle(&IntentClassifierTrained { id }, &mut bus)
            .await
            .unwrap();
        assert!(!workflow.is_completed());

        workflow
            .handle(&EntityRecognizerTrained { id }, &mut bus)
            .await
            .unwrap();
        assert!(workflow.is_completed());
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn random_status_is_mostly_finished() {
        let finished = (0..3_000).filter(|_| random_status()).count();
        assert!((1_500..2_500).contains(&finished), "finished {finished} of 3000");
    }
}
