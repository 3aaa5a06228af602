//! Publish-agent workflow.
//!
//! `PublishAgent` creates a corpus, trains the entity recognizer and the
//! intent classifier in parallel, and creates a deployment once both models
//! are trained. `DeploymentCreated` publishes `AgentPublished` and completes
//! the saga.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use simplebus_core::{
    ConfigError, Handle, Handler, Outbox, Saga, SagaData, StartedBy, StateMapper,
};
use tracing::info;
use uuid::Uuid;

use super::WorkDelay;
use crate::dispatch::HandlerRegistry;

sample_message!(
    /// Starts the workflow.
    PublishAgent = "sample.publish-agent" { id: Uuid }
);
sample_message!(
    /// Sent when the workflow completes.
    AgentPublished = "sample.agent-published" { id: Uuid }
);
sample_message!(CreateCorpus = "sample.create-corpus" { id: Uuid });
sample_message!(CorpusCreated = "sample.corpus-created" { id: Uuid, success: bool });
sample_message!(TrainIntentClassifierModel = "sample.train-intent-classifier-model" { id: Uuid });
sample_message!(
    IntentClassifierModelTrained = "sample.intent-classifier-model-trained" { id: Uuid, success: bool }
);
sample_message!(TrainEntityRecognizerModel = "sample.train-entity-recognizer-model" { id: Uuid });
sample_message!(
    EntityRecognizerModelTrained = "sample.entity-recognizer-model-trained" { id: Uuid, success: bool }
);
sample_message!(CreateDeployment = "sample.create-deployment" { id: Uuid });
sample_message!(DeploymentCreated = "sample.deployment-created" { id: Uuid, success: bool });

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAgentState {
    pub identifier: Uuid,
    pub entity_recognizer_created: bool,
    pub intent_classifier_created: bool,
}

#[derive(Default)]
pub struct PublishAgentWorkflow {
    data: SagaData<PublishAgentState>,
}

impl PublishAgentWorkflow {
    fn deploy_when_trained(&self, id: Uuid, bus: &mut Outbox) -> anyhow::Result<()> {
        let state = self.state()?;
        if state.entity_recognizer_created && state.intent_classifier_created {
            bus.send(&CreateDeployment { id })?;
        }
        Ok(())
    }
}

impl Handler for PublishAgentWorkflow {}

impl Saga for PublishAgentWorkflow {
    const SAGA_TYPE: &'static str = "sample.publish-agent-workflow";
    type State = PublishAgentState;

    fn configure_mapping(mapper: &mut StateMapper<Self>) {
        mapper
            .start_with::<PublishAgent>("id", "identifier")
            .map::<CorpusCreated>("id", "identifier")
            .map::<EntityRecognizerModelTrained>("id", "identifier")
            .map::<IntentClassifierModelTrained>("id", "identifier")
            .map::<DeploymentCreated>("id", "identifier");
    }

    fn saga_data(&self) -> &SagaData<PublishAgentState> {
        &self.data
    }

    fn saga_data_mut(&mut self) -> &mut SagaData<PublishAgentState> {
        &mut self.data
    }
}

impl StartedBy<PublishAgent> for PublishAgentWorkflow {}

#[async_trait]
impl Handle<PublishAgent> for PublishAgentWorkflow {
    async fn handle(&mut self, message: &PublishAgent, bus: &mut Outbox) -> anyhow::Result<()> {
        info!(id = %message.id, "publishing agent");
        bus.send(&CreateCorpus { id: message.id })?;
        Ok(())
    }
}

#[async_trait]
impl Handle<CorpusCreated> for PublishAgentWorkflow {
    async fn handle(&mut self, message: &CorpusCreated, bus: &mut Outbox) -> anyhow::Result<()> {
        info!(id = %message.id, "corpus created");
        bus.send(&TrainEntityRecognizerModel { id: message.id })?;
        bus.send(&TrainIntentClassifierModel { id: message.id })?;
        Ok(())
    }
}

#[async_trait]
impl Handle<EntityRecognizerModelTrained> for PublishAgentWorkflow {
    async fn handle(
        &mut self,
        message: &EntityRecognizerModelTrained,
        bus: &mut Outbox,
    ) -> anyhow::Result<()> {
        info!(id = %message.id, "entity recognizer trained");
        self.state_mut()?.entity_recognizer_created = true;
        self.deploy_when_trained(message.id, bus)
    }
}

#[async_trait]
impl Handle<IntentClassifierModelTrained> for PublishAgentWorkflow {
    async fn handle(
        &mut self,
        message: &IntentClassifierModelTrained,
        bus: &mut Outbox,
    ) -> anyhow::Result<()> {
        info!(id = %message.id, "intent classifier trained");
        self.state_mut()?.intent_classifier_created = true;
        self.deploy_when_trained(message.id, bus)
    }
}

#[async_trait]
impl Handle<DeploymentCreated> for PublishAgentWorkflow {
    async fn handle(&mut self, message: &DeploymentCreated, bus: &mut Outbox) -> anyhow::Result<()> {
        info!(id = %message.id, "deployment created");
        bus.send(&AgentPublished { id: message.id })?;
        self.mark_as_completed();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Stateless worker for every task message of this workflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishAgentTasks {
    work: WorkDelay,
}

impl PublishAgentTasks {
    #[must_use]
    pub fn new(work: WorkDelay) -> Self {
        Self { work }
    }
}

impl Handler for PublishAgentTasks {}

#[async_trait]
impl Handle<CreateCorpus> for PublishAgentTasks {
    async fn handle(&mut self, message: &CreateCorpus, bus: &mut Outbox) -> anyhow::Result<()> {
        info!(id = %message.id, "creating corpus");
        self.work.perform().await;
        bus.send(&CorpusCreated {
            id: message.id,
            success: true,
        })?;
        Ok(())
    }
}

#[async_trait]
impl Handle<TrainIntentClassifierModel> for PublishAgentTasks {
    async fn handle(
        &mut self,
        message: &TrainIntentClassifierModel,
        bus: &mut Outbox,
    ) -> anyhow::Result<()> {
        info!(id = %message.id, "training intent classifier");
        self.work.perform().await;
        bus.send(&IntentClassifierModelTrained {
            id: message.id,
            success: true,
        })?;
        Ok(())
    }
}

#[async_trait]
impl Handle<TrainEntityRecognizerModel> for PublishAgentTasks {
    async fn handle(
        &mut self,
        message: &TrainEntityRecognizerModel,
        bus: &mut Outbox,
    ) -> anyhow::Result<()> {
        info!(id = %message.id, "training entity recognizer");
        self.work.perform().await;
        bus.send(&EntityRecognizerModelTrained {
            id: message.id,
            success: true,
        })?;
        Ok(())
    }
}

#[async_trait]
impl Handle<CreateDeployment> for PublishAgentTasks {
    async fn handle(&mut self, message: &CreateDeployment, bus: &mut Outbox) -> anyhow::Result<()> {
        info!(id = %message.id, "creating deployment");
        self.work.perform().await;
        bus.send(&DeploymentCreated {
            id: message.id,
            success: true,
        })?;
        Ok(())
    }
}

/// Registers the workflow and its tasks.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the workflow's mapping is invalid or a
/// handler is registered twice.
pub fn register(registry: &HandlerRegistry, work: WorkDelay) -> Result<(), ConfigError> {
    registry
        .saga(PublishAgentWorkflow::default)?
        .handles::<PublishAgent>()?
        .handles::<CorpusCreated>()?
        .handles::<EntityRecognizerModelTrained>()?
        .handles::<IntentClassifierModelTrained>()?
        .handles::<DeploymentCreated>()?;
    registry
        .handler(move || PublishAgentTasks::new(work))
        .handles::<CreateCorpus>()?
        .handles::<TrainIntentClassifierModel>()?
        .handles::<TrainEntityRecognizerModel>()?
        .handles::<CreateDeployment>()?;
    registry.message::<AgentPublished>();
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
