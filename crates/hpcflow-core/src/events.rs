use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub kind: RuntimeEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum RuntimeEventKind {
    Run(RunEvent),
    Step(StepEvent),
    Artifact(ArtifactEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        run_id: String,
        graph_id: String,
        step_count: usize,
    },
    Completed {
        run_id: String,
        graph_id: String,
        elapsed_ms: u128,
    },
    Failed {
        run_id: String,
        graph_id: String,
        failed_steps: Vec<String>,
    },
    TimedOut {
        run_id: String,
        graph_id: String,
        elapsed_ms: u128,
    },
    Cancelled {
        run_id: String,
        graph_id: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepEvent {
    Ready {
        run_id: String,
        step: String,
    },
    Submitted {
        run_id: String,
        step: String,
        job_id: String,
        job_name: String,
    },
    StateChanged {
        run_id: String,
        step: String,
        job_id: String,
        state: String,
        detail: Option<String>,
    },
    Succeeded {
        run_id: String,
        step: String,
    },
    Failed {
        run_id: String,
        step: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactEvent {
    Registered {
        run_id: String,
        step: String,
        slot: String,
        path: String,
        version: u32,
    },
}

pub trait RuntimeEventObserver: Send + Sync {
    fn on_event(&self, event: &RuntimeEvent);
}

impl<F> RuntimeEventObserver for F
where
    F: Fn(&RuntimeEvent) + Send + Sync,
{
    fn on_event(&self, event: &RuntimeEvent) {
        self(event);
    }
}

pub type SharedRuntimeEventObserver = Arc<dyn RuntimeEventObserver>;
pub type RuntimeEventSender = mpsc::UnboundedSender<RuntimeEvent>;
pub type RuntimeEventReceiver = mpsc::UnboundedReceiver<RuntimeEvent>;

#[derive(Clone, Default)]
pub struct RuntimeEventSink {
    observer: Option<SharedRuntimeEventObserver>,
    sender: Option<RuntimeEventSender>,
}

impl RuntimeEventSink {
    pub fn with_observer(observer: SharedRuntimeEventObserver) -> Self {
        Self {
            observer: Some(observer),
            sender: None,
        }
    }

    pub fn with_sender(sender: RuntimeEventSender) -> Self {
        Self {
            observer: None,
            sender: Some(sender),
        }
    }

    pub fn observer(mut self, observer: SharedRuntimeEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: RuntimeEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, event: RuntimeEvent) {
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn runtime_event_channel() -> (RuntimeEventSender, RuntimeEventReceiver) {
    mpsc::unbounded_channel()
}

/// Stamps events with a per-run sequence number before handing them to a sink.
pub(crate) struct EventEmitter {
    sink: RuntimeEventSink,
    next_sequence_no: AtomicU64,
}

impl EventEmitter {
    pub(crate) fn new(sink: RuntimeEventSink) -> Self {
        Self {
            sink,
            next_sequence_no: AtomicU64::new(1),
        }
    }

    pub(crate) fn emit(&self, kind: RuntimeEventKind) {
        if !self.sink.is_enabled() {
            return;
        }
        let sequence_no = self.next_sequence_no.fetch_add(1, Ordering::Relaxed);
        self.sink.emit(RuntimeEvent {
            sequence_no,
            timestamp: timestamp_now(),
            kind,
        });
    }

    pub(crate) fn run(&self, event: RunEvent) {
        self.emit(RuntimeEventKind::Run(event));
    }

    pub(crate) fn step(&self, event: StepEvent) {
        self.emit(RuntimeEventKind::Step(event));
    }

    pub(crate) fn artifact(&self, event: ArtifactEvent) {
        self.emit(RuntimeEventKind::Artifact(event));
    }
}

pub(crate) fn timestamp_now() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03}Z",
        since_epoch.as_secs(),
        since_epoch.subsec_millis()
    )
}
