//! Resource ownership tracking and conflict resolution.
//!
//! At most one [`ResourceOwnership`] exists per resource id. Three indexes are
//! kept in step:
//!
//! - resource id -> ownership record
//! - owner name -> resource ids (bulk release when the owner's last instance goes)
//! - (owner, instance) -> resource ids and last activity (cascade on instance removal)
//!
//! # Decision table
//!
//! | Condition                                   | Decision                  |
//! |---------------------------------------------|---------------------------|
//! | resource free                               | ALLOW                     |
//! | same owner, same instance                   | ALLOW (idempotent re-entry)|
//! | same owner, different instance              | REJECT                    |
//! | different owner, requester HIGH             | INTERRUPT                 |
//! | different owner, requester not HIGH         | REJECT, or QUEUE when deferral is enabled |
//!
//! Re-entry does not stack records. Every admitted request that re-entered
//! is kept as a holder, and the resource is released only when the last
//! holder finishes or is cleared.
//!
//! The tracker is only ever mutated under the orchestrator's state lock, so an
//! INTERRUPT's release-then-acquire is a single step to every other caller.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::ResourceTransferError;
use crate::request::{Priority, RequestId};

/// Exclusive claim on a logical resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOwnership {
    pub resource_id: String,
    pub owner: String,
    pub instance_id: String,
    pub acquired_at: DateTime<Utc>,
    pub priority: Priority,
    /// Latest request to claim the resource.
    pub execution_id: RequestId,
    /// Every admitted request still holding the claim.
    pub holders: BTreeSet<RequestId>,
}

/// A requester asking for a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub resource_id: String,
    pub owner: String,
    pub instance_id: String,
    pub priority: Priority,
    pub execution_id: RequestId,
}

/// Outcome of a conflict check.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictDecision {
    Allow {
        /// The requester already owns the resource.
        reentry: bool,
    },
    Reject {
        current: ResourceOwnership,
        reason: String,
    },
    Interrupt {
        current: ResourceOwnership,
    },
    /// Park the request until `blocked_by` is released.
    Queue {
        current: ResourceOwnership,
        blocked_by: String,
    },
}

impl ConflictDecision {
    pub fn label(&self) -> &'static str {
        match self {
            ConflictDecision::Allow { .. } => "ALLOW",
            ConflictDecision::Reject { .. } => "REJECT",
            ConflictDecision::Interrupt { .. } => "INTERRUPT",
            ConflictDecision::Queue { .. } => "QUEUE",
        }
    }
}

#[derive(Debug, Clone)]
struct InstanceRecord {
    resources: BTreeSet<String>,
    last_active: Instant,
}

/// Ownership tables plus the decision policy.
#[derive(Debug)]
pub struct ResourceTracker {
    ownership: HashMap<String, ResourceOwnership>,
    owner_resources: HashMap<String, BTreeSet<String>>,
    instances: HashMap<(String, String), InstanceRecord>,
    ttl: Duration,
    defer_conflicts: bool,
}

impl ResourceTracker {
    pub fn new(ttl: Duration, defer_conflicts: bool) -> Self {
        Self {
            ownership: HashMap::new(),
            owner_resources: HashMap::new(),
            instances: HashMap::new(),
            ttl,
            defer_conflicts,
        }
    }

    /// Decide what to do with `claim` given the current owner.
    pub fn decide(&self, claim: &Claim) -> ConflictDecision {
        let Some(current) = self.ownership.get(&claim.resource_id) else {
            return ConflictDecision::Allow { reentry: false };
        };

        if current.owner == claim.owner {
            if current.instance_id == claim.instance_id {
                return ConflictDecision::Allow { reentry: true };
            }
            return ConflictDecision::Reject {
                current: current.clone(),
                reason: format!(
                    "same-owner instance conflict: {} already holds {} via instance {}",
                    current.owner, claim.resource_id, current.instance_id
                ),
            };
        }

        if claim.priority == Priority::High {
            return ConflictDecision::Interrupt {
                current: current.clone(),
            };
        }

        if self.defer_conflicts {
            return ConflictDecision::Queue {
                current: current.clone(),
                blocked_by: claim.resource_id.clone(),
            };
        }

        ConflictDecision::Reject {
            current: current.clone(),
            reason: format!(
                "{} priority cannot interrupt {} (owned by {})",
                claim.priority, claim.resource_id, current.owner
            ),
        }
    }

    /// Take ownership of a free resource, or re-enter one already held.
    ///
    /// Re-entry keeps the single record, moves it to the newer execution and
    /// adds that execution to the holders.
    pub fn acquire(&mut self, claim: &Claim, now: Instant) -> Result<&ResourceOwnership, String> {
        if let Some(current) = self.ownership.get(&claim.resource_id) {
            if current.owner != claim.owner || current.instance_id != claim.instance_id {
                return Err(format!(
                    "{} is owned by {}/{}",
                    claim.resource_id, current.owner, current.instance_id
                ));
            }
        }

        let record = self
            .ownership
            .entry(claim.resource_id.clone())
            .and_modify(|existing| {
                existing.execution_id = claim.execution_id;
                existing.priority = claim.priority;
                existing.holders.insert(claim.execution_id);
            })
            .or_insert_with(|| ResourceOwnership {
                resource_id: claim.resource_id.clone(),
                owner: claim.owner.clone(),
                instance_id: claim.instance_id.clone(),
                acquired_at: Utc::now(),
                priority: claim.priority,
                execution_id: claim.execution_id,
                holders: BTreeSet::from([claim.execution_id]),
            });

        self.owner_resources
            .entry(claim.owner.clone())
            .or_default()
            .insert(claim.resource_id.clone());
        let instance = self
            .instances
            .entry((claim.owner.clone(), claim.instance_id.clone()))
            .or_insert_with(|| InstanceRecord {
                resources: BTreeSet::new(),
                last_active: now,
            });
        instance.resources.insert(claim.resource_id.clone());
        instance.last_active = now;

        Ok(record)
    }

    /// Release the current owner and install `claim` in one step.
    pub fn transfer(
        &mut self,
        claim: &Claim,
        now: Instant,
    ) -> Result<ResourceOwnership, ResourceTransferError> {
        let previous = self
            .release(&claim.resource_id)
            .ok_or_else(|| ResourceTransferError {
                resource_id: claim.resource_id.clone(),
                from_owner: "<none>".into(),
                to_owner: claim.owner.clone(),
                reason: "resource had no owner to interrupt".into(),
            })?;

        match self.acquire(claim, now) {
            Ok(_) => Ok(previous),
            Err(reason) => Err(ResourceTransferError {
                resource_id: claim.resource_id.clone(),
                from_owner: previous.owner,
                to_owner: claim.owner.clone(),
                reason,
            }),
        }
    }

    /// Remove a resource's ownership from every index.
    pub fn release(&mut self, resource_id: &str) -> Option<ResourceOwnership> {
        let record = self.ownership.remove(resource_id)?;

        if let Some(set) = self.owner_resources.get_mut(&record.owner) {
            set.remove(resource_id);
            if set.is_empty() {
                self.owner_resources.remove(&record.owner);
            }
        }
        let key = (record.owner.clone(), record.instance_id.clone());
        if let Some(instance) = self.instances.get_mut(&key) {
            instance.resources.remove(resource_id);
        }

        Some(record)
    }

    /// Drop `execution_id` from the holders of `resource_id`.
    ///
    /// The resource is released, and returned, once no holder is left. A
    /// request that lost the claim to an interrupt is not a holder, so its
    /// release is a no-op.
    pub fn release_for(
        &mut self,
        resource_id: &str,
        execution_id: RequestId,
    ) -> Option<ResourceOwnership> {
        let record = self.ownership.get_mut(resource_id)?;
        if !record.holders.remove(&execution_id) {
            return None;
        }
        if let Some(&remaining) = record.holders.iter().next() {
            if record.execution_id == execution_id {
                record.execution_id = remaining;
            }
            return None;
        }
        self.release(resource_id)
    }

    /// Drop an owner instance, releasing everything it holds.
    ///
    /// When it was the owner's last instance, anything still indexed under
    /// the owner name is released as well.
    pub fn remove_instance(&mut self, owner: &str, instance_id: &str) -> Vec<String> {
        let Some(instance) = self
            .instances
            .remove(&(owner.to_string(), instance_id.to_string()))
        else {
            return Vec::new();
        };

        let mut released: Vec<String> = instance
            .resources
            .into_iter()
            .filter(|resource_id| {
                matches!(self.ownership.get(resource_id), Some(r) if r.instance_id == instance_id && r.owner == owner)
            })
            .collect();
        for resource_id in &released {
            self.release(resource_id);
        }

        let owner_has_instances = self.instances.keys().any(|(o, _)| o == owner);
        if !owner_has_instances {
            if let Some(remaining) = self.owner_resources.remove(owner) {
                for resource_id in remaining {
                    if self.release(&resource_id).is_some() {
                        released.push(resource_id);
                    }
                }
            }
        }

        released
    }

    /// Remove instances idle longer than the TTL.
    ///
    /// An instance is kept while any of its resources has a holder in `live`
    /// (the running and queued request ids). Returns the released resource ids.
    pub fn cleanup_stale(&mut self, now: Instant, live: &HashSet<RequestId>) -> Vec<String> {
        let stale: Vec<(String, String)> = self
            .instances
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.last_active) >= self.ttl)
            .filter(|(_, record)| {
                !record.resources.iter().any(|resource_id| {
                    self.ownership
                        .get(resource_id)
                        .is_some_and(|r| r.holders.iter().any(|h| live.contains(h)))
                })
            })
            .map(|(key, _)| key.clone())
            .collect();

        let mut released = Vec::new();
        for (owner, instance_id) in stale {
            released.extend(self.remove_instance(&owner, &instance_id));
        }
        released
    }

    pub fn owner_of(&self, resource_id: &str) -> Option<&ResourceOwnership> {
        self.ownership.get(resource_id)
    }

    pub fn len(&self) -> usize {
        self.ownership.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ownership.is_empty()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Ownership records sorted by resource id.
    pub fn snapshot(&self) -> Vec<ResourceOwnership> {
        let mut records: Vec<ResourceOwnership> = self.ownership.values().cloned().collect();
        records.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        records
    }

    /// Owner name -> resource ids.
    pub fn owner_map(&self) -> BTreeMap<String, Vec<String>> {
        self.owner_resources
            .iter()
            .map(|(owner, resources)| (owner.clone(), resources.iter().cloned().collect()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.ownership.clear();
        self.owner_resources.clear();
        self.instances.clear();
    }
}
