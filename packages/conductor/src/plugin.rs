//! Mounted plugins and mount-time validation.
//!
//! A plugin contributes one [`Sequence`] and, optionally, a handler table
//! mapping event names to callbacks. Mounting registers the sequence so
//! `submit` can resolve it and subscribes every handler on the bus;
//! unmounting reverses both.
//!
//! Validation never throws: problems come back in a [`MountResult`] so a
//! batch of plugins can keep mounting past one bad entry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::bus::{Callback, Subscription};
use crate::error::MountError;
use crate::sequence::Sequence;

/// Event handler supplied by a plugin.
pub type Handler = Callback;

/// Event name → handler.
pub type HandlerTable = HashMap<String, Handler>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&crate::bus::Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Outcome of `Conductor::mount`.
#[derive(Debug, Clone, PartialEq)]
pub struct MountResult {
    pub success: bool,
    pub plugin_id: String,
    pub warnings: Vec<String>,
    pub error: Option<MountError>,
}

impl MountResult {
    pub(crate) fn mounted(plugin_id: String, warnings: Vec<String>) -> Self {
        Self {
            success: true,
            plugin_id,
            warnings,
            error: None,
        }
    }

    pub(crate) fn failed(plugin_id: String, warnings: Vec<String>, error: MountError) -> Self {
        Self {
            success: false,
            plugin_id,
            warnings,
            error: Some(error),
        }
    }

    /// Machine-readable failure reason, e.g. `"already_mounted"`.
    pub fn reason(&self) -> Option<&'static str> {
        self.error.as_ref().map(MountError::reason)
    }
}

/// A mounted plugin.
pub(crate) struct PluginRecord {
    pub(crate) id: String,
    pub(crate) sequence: Arc<Sequence>,
    pub(crate) handler_events: BTreeSet<String>,
    pub(crate) subscriptions: Vec<Subscription>,
    pub(crate) metadata: Option<Value>,
    pub(crate) warnings: Vec<String>,
    pub(crate) mounted_at: DateTime<Utc>,
}

impl PluginRecord {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            plugin_id: self.id.clone(),
            sequence_id: self.sequence.id.clone(),
            sequence_name: self.sequence.name.clone(),
            handler_events: self.handler_events.iter().cloned().collect(),
            metadata: self.metadata.clone(),
            warnings: self.warnings.clone(),
            mounted_at: self.mounted_at,
        }
    }
}

/// Public view of a mounted plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub plugin_id: String,
    pub sequence_id: String,
    pub sequence_name: String,
    pub handler_events: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub warnings: Vec<String>,
    pub mounted_at: DateTime<Utc>,
}

/// Plugin id → record.
#[derive(Default)]
pub(crate) struct PluginRegistry {
    plugins: HashMap<String, PluginRecord>,
}

impl PluginRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Check a candidate mount. Returns the warnings on success.
    pub(crate) fn validate(
        &self,
        plugin_id: &str,
        sequence: &Sequence,
        handlers: Option<&HandlerTable>,
    ) -> Result<Vec<String>, (Vec<String>, MountError)> {
        let report = sequence.validate();
        let mut warnings = report.warnings;
        if !report.errors.is_empty() {
            return Err((
                warnings,
                MountError::InvalidSequence {
                    errors: report.errors,
                },
            ));
        }

        match handlers {
            None => warnings.push(format!(
                "plugin {plugin_id} has no handler table; its events must be handled by bus subscribers"
            )),
            Some(table) => {
                let mut errors: Vec<String> = table
                    .keys()
                    .filter(|event| event.trim().is_empty())
                    .map(|_| "handler table contains an empty event name".to_string())
                    .collect();
                errors.dedup();
                if !errors.is_empty() {
                    return Err((warnings, MountError::InvalidHandlers { errors }));
                }

                let events = sequence.event_names();
                let mut unused: Vec<&String> = table
                    .keys()
                    .filter(|event| !events.contains(event.as_str()))
                    .filter(|event| !event.starts_with(crate::telemetry::RESERVED_PREFIX))
                    .collect();
                unused.sort();
                for event in unused {
                    warnings.push(format!("handler for '{event}' matches no beat event"));
                }

                let mut unhandled: Vec<&str> = events
                    .into_iter()
                    .filter(|event| !table.contains_key(*event))
                    .collect();
                unhandled.sort_unstable();
                for event in unhandled {
                    warnings.push(format!("beat event '{event}' has no handler in this plugin"));
                }
            }
        }

        if self.plugins.contains_key(plugin_id) {
            return Err((
                warnings,
                MountError::AlreadyMounted {
                    plugin_id: plugin_id.to_string(),
                },
            ));
        }

        if let Some(owner) = self.sequence_owner(&sequence.id) {
            return Err((
                warnings,
                MountError::SequenceIdTaken {
                    sequence_id: sequence.id.clone(),
                    owner: owner.to_string(),
                },
            ));
        }

        Ok(warnings)
    }

    pub(crate) fn insert(&mut self, record: PluginRecord) {
        self.plugins.insert(record.id.clone(), record);
    }

    pub(crate) fn remove(&mut self, plugin_id: &str) -> Option<PluginRecord> {
        self.plugins.remove(plugin_id)
    }

    pub(crate) fn contains(&self, plugin_id: &str) -> bool {
        self.plugins.contains_key(plugin_id)
    }

    pub(crate) fn info(&self, plugin_id: &str) -> Option<PluginInfo> {
        self.plugins.get(plugin_id).map(PluginRecord::info)
    }

    /// Mounted plugin ids, sorted.
    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Plugin that registered `sequence_id`, if any.
    pub(crate) fn sequence_owner(&self, sequence_id: &str) -> Option<&str> {
        self.plugins
            .values()
            .find(|record| record.sequence.id == sequence_id)
            .map(|record| record.id.as_str())
    }

    pub(crate) fn drain(&mut self) -> Vec<PluginRecord> {
        self.plugins.drain().map(|(_, record)| record).collect()
    }
}
