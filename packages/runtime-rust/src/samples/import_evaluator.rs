//! Import-evaluator workflow.
//!
//! `ImportEvaluatorData` stages five tables in parallel. Each staged table
//! sets its flag; once all five are set the staged data is merged. A table
//! that fails to stage completes the saga early, and any later message for
//! the import cannot materialize.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use simplebus_core::{
    ConfigError, Handle, Handler, Outbox, Saga, SagaData, StartedBy, StateMapper,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::WorkDelay;
use crate::dispatch::HandlerRegistry;

sample_message!(
    /// Starts the workflow.
    ImportEvaluatorData = "sample.import-evaluator-data" { import_id: Uuid }
);
sample_message!(
    /// Sent when the merged data is in place.
    EvaluatorDataImported = "sample.evaluator-data-imported" { import_id: Uuid }
);
sample_message!(StageTable1 = "sample.stage-table-1" { import_id: Uuid });
sample_message!(Table1Staged = "sample.table-1-staged" { import_id: Uuid, success: bool });
sample_message!(StageTable2 = "sample.stage-table-2" { import_id: Uuid });
sample_message!(Table2Staged = "sample.table-2-staged" { import_id: Uuid, success: bool });
sample_message!(StageTable3 = "sample.stage-table-3" { import_id: Uuid });
sample_message!(Table3Staged = "sample.table-3-staged" { import_id: Uuid, success: bool });
sample_message!(StageTable4 = "sample.stage-table-4" { import_id: Uuid });
sample_message!(Table4Staged = "sample.table-4-staged" { import_id: Uuid, success: bool });
sample_message!(StageTable5 = "sample.stage-table-5" { import_id: Uuid });
sample_message!(Table5Staged = "sample.table-5-staged" { import_id: Uuid, success: bool });
sample_message!(MergeStagedData = "sample.merge-staged-data" { import_id: Uuid });
sample_message!(StagedDataMerged = "sample.staged-data-merged" { import_id: Uuid, success: bool });

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportState {
    pub import_id: Uuid,
    pub staged: [bool; 5],
    pub data_merged: bool,
}

#[derive(Default)]
pub struct ImportEvaluatorWorkflow {
    data: SagaData<ImportState>,
}

impl ImportEvaluatorWorkflow {
    /// Records table `table` (1-based) as staged and merges once every table
    /// is.
    fn table_staged(
        &mut self,
        table: usize,
        import_id: Uuid,
        success: bool,
        bus: &mut Outbox,
    ) -> anyhow::Result<()> {
        info!(%import_id, table, success, "table staged");
        let state = self.state_mut()?;
        state.staged[table - 1] = true;

        if !success {
            warn!(%import_id, table, "staging failed, import abandoned");
            self.mark_as_completed();
            return Ok(());
        }

        if state.staged.iter().all(|staged| *staged) {
            bus.send(&MergeStagedData { import_id })?;
        }
        Ok(())
    }
}

impl Handler for ImportEvaluatorWorkflow {}

impl Saga for ImportEvaluatorWorkflow {
    const SAGA_TYPE: &'static str = "sample.import-evaluator-workflow";
    type State = ImportState;

    fn configure_mapping(mapper: &mut StateMapper<Self>) {
        mapper
            .start_with::<ImportEvaluatorData>("import_id", "import_id")
            .map::<Table1Staged>("import_id", "import_id")
            .map::<Table2Staged>("import_id", "import_id")
            .map::<Table3Staged>("import_id", "import_id")
            .map::<Table4Staged>("import_id", "import_id")
            .map::<Table5Staged>("import_id", "import_id")
            .map::<StagedDataMerged>("import_id", "import_id");
    }

    fn saga_data(&self) -> &SagaData<ImportState> {
        &self.data
    }

    fn saga_data_mut(&mut self) -> &mut SagaData<ImportState> {
        &mut self.data
    }
}

impl StartedBy<ImportEvaluatorData> for ImportEvaluatorWorkflow {}

#[async_trait]
impl Handle<ImportEvaluatorData> for ImportEvaluatorWorkflow {
    async fn handle(&mut self, message: &ImportEvaluatorData, bus: &mut Outbox) -> anyhow::Result<()> {
        let import_id = message.import_id;
        info!(%import_id, "importing evaluator data");
        self.state_mut()?.import_id = import_id;
        bus.send(&StageTable1 { import_id })?;
        bus.send(&StageTable2 { import_id })?;
        bus.send(&StageTable3 { import_id })?;
        bus.send(&StageTable4 { import_id })?;
        bus.send(&StageTable5 { import_id })?;
        Ok(())
    }
}

/// One `Handle` impl per staged-table event, all funnelled into
/// `table_staged`.
macro_rules! handle_table_staged {
    ($($message:ident => $table:literal),* $(,)?) => {
        $(
            #[async_trait]
            impl Handle<$message> for ImportEvaluatorWorkflow {
                async fn handle(&mut self, message: &$message, bus: &mut Outbox) -> anyhow::Result<()> {
                    self.table_staged($table, message.import_id, message.success, bus)
                }
            }
        )*
    };
}

handle_table_staged!(
    Table1Staged => 1,
    Table2Staged => 2,
    Table3Staged => 3,
    Table4Staged => 4,
    Table5Staged => 5,
);

#[async_trait]
impl Handle<StagedDataMerged> for ImportEvaluatorWorkflow {
    async fn handle(&mut self, message: &StagedDataMerged, bus: &mut Outbox) -> anyhow::Result<()> {
        info!(import_id = %message.import_id, "staged data merged");
        self.state_mut()?.data_merged = true;
        self.mark_as_completed();
        bus.send(&EvaluatorDataImported {
            import_id: message.import_id,
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Stateless worker for every task message of this workflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportTasks {
    work: WorkDelay,
}

impl ImportTasks {
    #[must_use]
    pub fn new(work: WorkDelay) -> Self {
        Self { work }
    }
}

impl Handler for ImportTasks {}

/// One `Handle` impl per stage command, each replying with its staged event.
macro_rules! handle_stage_table {
    ($($command:ident => $event:ident),* $(,)?) => {
        $(
            #[async_trait]
            impl Handle<$command> for ImportTasks {
                async fn handle(&mut self, message: &$command, bus: &mut Outbox) -> anyhow::Result<()> {
                    info!(import_id = %message.import_id, command = stringify!($command), "staging table");
                    self.work.perform().await;
                    bus.send(&$event {
                        import_id: message.import_id,
                        success: true,
                    })?;
                    Ok(())
                }
            }
        )*
    };
}

handle_stage_table!(
    StageTable1 => Table1Staged,
    StageTable2 => Table2Staged,
    StageTable3 => Table3Staged,
    StageTable4 => Table4Staged,
    StageTable5 => Table5Staged,
    MergeStagedData => StagedDataMerged,
);

/// Registers the workflow and its tasks.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the workflow's mapping is invalid or a
/// handler is registered twice.
pub fn register(registry: &HandlerRegistry, work: WorkDelay) -> Result<(), ConfigError> {
    registry
        .saga(ImportEvaluatorWorkflow::default)?
        .handles::<ImportEvaluatorData>()?
        .handles::<Table1Staged>()?
        .handles::<Table2Staged>()?
        .handles::<Table3Staged>()?
        .handles::<Table4Staged>()?
        .handles::<Table5Staged>()?
        .handles::<StagedDataMerged>()?;
    registry
        .handler(move || ImportTasks::new(work))
        .handles::<StageTable1>()?
        .handles::<StageTable2>()?
        .handles::<StageTable3>()?
        .handles::<StageTable4>()?
        .handles::<StageTable5>()?
        .handles::<MergeStagedData>()?;
    registry.message::<EvaluatorDataImported>();
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
