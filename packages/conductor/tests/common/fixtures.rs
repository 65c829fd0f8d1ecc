//! Sequences and handler tables shared by the integration tests.

use std::sync::{Arc, Mutex};

use conductor::{handler, Beat, Dynamics, HandlerTable, Sequence};

/// One movement of immediate beats publishing `events` in order.
pub fn simple_sequence(id: &str, name: &str, events: &[&str]) -> Sequence {
    let beats: Vec<Beat> = events
        .iter()
        .enumerate()
        .map(|(i, event)| Beat::new(i as u32 + 1, *event, Dynamics::MezzoForte))
        .collect();

    Sequence::builder(id, name)
        .description("test sequence")
        .version("1.0.0")
        .movement("main", move |m| {
            beats.into_iter().fold(m, |m, beat| m.beat_with(beat))
        })
        .build()
}

/// A sequence whose beats are given explicitly.
pub fn sequence_with_beats(id: &str, name: &str, beats: Vec<Beat>) -> Sequence {
    Sequence::builder(id, name)
        .description("test sequence")
        .version("1.0.0")
        .movement("main", move |m| {
            beats.into_iter().fold(m, |m, beat| m.beat_with(beat))
        })
        .build()
}

/// Handlers that succeed without doing anything.
pub fn noop_handlers(events: &[&str]) -> HandlerTable {
    events
        .iter()
        .map(|event| (event.to_string(), handler(|_| Ok(()))))
        .collect()
}

/// Shared, ordered log of strings written by handlers.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Handlers that append their event name (and the message's `tag` field, if any)
/// to `log`.
pub fn logging_handlers(events: &[&str], log: &EventLog) -> HandlerTable {
    events
        .iter()
        .map(|event| {
            let log = log.clone();
            let name = event.to_string();
            let entry = name.clone();
            (
                name,
                handler(move |msg| {
                    match msg.field("tag").and_then(|v| v.as_str()) {
                        Some(tag) => log.push(format!("{tag}:{entry}")),
                        None => log.push(entry.clone()),
                    }
                    Ok(())
                }),
            )
        })
        .collect()
}
