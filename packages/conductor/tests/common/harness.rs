//! Engine harness: a conductor, its drain worker and a telemetry recorder.

use std::sync::{Arc, Mutex};

use conductor::{
    topics, Conductor, ConductorBuilder, ConductorConfig, ConductorHandle, HandlerTable, Sequence,
};
use serde_json::Value;

/// Records every message published on the subscribed topics.
#[derive(Clone, Default)]
pub struct Recorder {
    messages: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Recorder {
    pub fn attach(conductor: &Conductor, topics: &[&str]) -> Self {
        let recorder = Self::default();
        for topic in topics {
            let messages = recorder.messages.clone();
            conductor.subscribe(*topic, move |msg| {
                messages
                    .lock()
                    .unwrap()
                    .push((msg.topic.clone(), msg.data.clone()));
                Ok(())
            });
        }
        recorder
    }

    pub fn topics(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn on(&self, topic: &str) -> Vec<Value> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.on(topic).len()
    }
}

/// Every telemetry topic the engine publishes.
pub const ALL_TOPICS: [&str; 14] = [
    topics::SEQUENCE_QUEUED,
    topics::SEQUENCE_DUPLICATE,
    topics::SEQUENCE_DEFERRED,
    topics::SEQUENCE_READMITTED,
    topics::RESOURCE_INTERRUPTED,
    topics::SEQUENCE_STARTED,
    topics::SEQUENCE_COMPLETED,
    topics::SEQUENCE_FAILED,
    topics::SEQUENCE_CANCELLED,
    topics::BEAT_STARTED,
    topics::BEAT_COMPLETED,
    topics::BEAT_FAILED,
    topics::PLUGIN_MOUNTED,
    topics::PLUGIN_UNMOUNTED,
];

pub struct TestHarness {
    pub conductor: Conductor,
    pub recorder: Recorder,
    worker: Option<ConductorHandle>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(ConductorConfig::default())
    }

    pub fn with_config(config: ConductorConfig) -> Self {
        let conductor = ConductorBuilder::new(config).build();
        let recorder = Recorder::attach(&conductor, &ALL_TOPICS);
        Self {
            conductor,
            recorder,
            worker: None,
        }
    }

    /// Mount and assert success.
    pub fn mount(&self, sequence: Sequence, handlers: HandlerTable) {
        let result = self.conductor.mount(sequence, Some(handlers), None, None);
        assert!(result.success, "mount failed: {:?}", result.error);
    }

    pub fn start(&mut self) {
        if self.worker.is_none() {
            self.worker = Some(self.conductor.start());
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown().await;
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.abort();
        }
    }
}
