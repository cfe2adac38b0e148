/// Pipeline events
///
/// The completion callback surface of the core: the coordinator publishes
/// every step and phase transition it performs on a broadcast channel, and
/// the surrounding application subscribes to trigger notifications or start
/// the next stage.

use crate::coordinator::pipeline::PhaseVerdict;
use crate::scan::types::ScanRecord;
use crate::workflow::types::{PipelineKind, StepKind};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Something observable happened to a run or a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunSubmitted {
        token: Uuid,
        pipeline: PipelineKind,
    },
    StepStarted {
        token: Uuid,
        step: StepKind,
    },
    StepCompleted {
        token: Uuid,
        step: StepKind,
    },
    StepFailed {
        token: Uuid,
        step: StepKind,
        reason: String,
        cancelled_descendants: u64,
    },
    /// Emitted once per phase, by the report that completed it
    PhaseCompleted {
        record: ScanRecord,
        verdict: PhaseVerdict,
    },
    /// The parent of this step completed; it may be started now
    StageReady {
        token: Uuid,
        step: StepKind,
    },
    /// The phase has not received a report within the staleness threshold
    PhaseStale {
        record: ScanRecord,
    },
}

/// Broadcast fan-out of pipeline events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; with none attached the event is dropped
    pub fn publish(&self, event: PipelineEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            tracing::debug!("📭 No subscribers for pipeline event: {:?}", event);
        }
    }
}
