//! Group manager.
//!
//! Groups are named sets of connection ids kept inside the hub state. A
//! group that loses its last member through [`Group::delete`], or that is
//! cleared, is removed from the table in the same critical section.
//!
//! Each time a group is created it gets a fresh epoch. A [`Group`] handle
//! remembers the epoch it was created for, so a handle that outlived its
//! group cannot touch a newer group with the same id.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::{debug, trace};

use crate::codec::Envelope;
use crate::connection::Connection;
use crate::errors::{Result, WsxError};
use crate::hub::{Hub, WeakHub};
use crate::ids::{ConnectionId, GroupId};

#[derive(Debug)]
struct GroupEntry {
    epoch: u64,
    members: BTreeSet<ConnectionId>,
}

/// The group table's view of a stale handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Detached;

/// All groups of one hub.
#[derive(Debug, Default)]
pub struct GroupTable {
    groups: HashMap<GroupId, GroupEntry>,
    next_epoch: u64,
}

impl GroupTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current epoch for `id`, creating an empty group if needed.
    pub fn get_or_create(&mut self, id: &GroupId) -> u64 {
        if let Some(entry) = self.groups.get(id) {
            return entry.epoch;
        }
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let _ = self.groups.insert(
            id.clone(),
            GroupEntry {
                epoch,
                members: BTreeSet::new(),
            },
        );
        trace!(group_id = %id, epoch, "group created");
        epoch
    }

    /// Current epoch for `id`, if the group exists.
    pub fn epoch(&self, id: &GroupId) -> Option<u64> {
        self.groups.get(id).map(|entry| entry.epoch)
    }

    fn entry(&self, id: &GroupId, epoch: u64) -> Option<&GroupEntry> {
        self.groups.get(id).filter(|entry| entry.epoch == epoch)
    }

    fn entry_mut(&mut self, id: &GroupId, epoch: u64) -> Option<&mut GroupEntry> {
        self.groups.get_mut(id).filter(|entry| entry.epoch == epoch)
    }

    /// Add a member. `Ok(false)` if it was already present.
    pub fn insert(
        &mut self,
        id: &GroupId,
        epoch: u64,
        member: ConnectionId,
    ) -> std::result::Result<bool, Detached> {
        let entry = self.entry_mut(id, epoch).ok_or(Detached)?;
        Ok(entry.members.insert(member))
    }

    /// Add a member to the current incarnation of `id`, creating the group
    /// if needed. Returns the epoch joined and whether the member is new.
    pub fn join(&mut self, id: &GroupId, member: ConnectionId) -> (u64, bool) {
        let epoch = self.get_or_create(id);
        let added = self
            .entry_mut(id, epoch)
            .is_some_and(|entry| entry.members.insert(member));
        (epoch, added)
    }

    /// Remove a member, dropping the group if it becomes empty.
    pub fn remove(&mut self, id: &GroupId, epoch: u64, member: &ConnectionId) -> bool {
        let Some(entry) = self.entry_mut(id, epoch) else {
            return false;
        };
        if !entry.members.remove(member) {
            return false;
        }
        if entry.members.is_empty() {
            let _ = self.groups.remove(id);
            debug!(group_id = %id, "group emptied and removed");
        }
        true
    }

    /// Drop this incarnation of the group. Returns its former members.
    pub fn clear(&mut self, id: &GroupId, epoch: u64) -> Vec<ConnectionId> {
        if self.entry(id, epoch).is_none() {
            return Vec::new();
        }
        self.groups
            .remove(id)
            .map(|entry| entry.members.into_iter().collect())
            .unwrap_or_default()
    }

    /// Remove `member` from every group, dropping groups that become empty.
    /// Returns the ids of the groups it was removed from.
    pub fn remove_everywhere(&mut self, member: &ConnectionId) -> Vec<GroupId> {
        let mut left = Vec::new();
        self.groups.retain(|id, entry| {
            if entry.members.remove(member) {
                left.push(id.clone());
                !entry.members.is_empty()
            } else {
                true
            }
        });
        left.sort();
        left
    }

    /// Members of this incarnation, or `None` if it is gone.
    pub fn members(&self, id: &GroupId, epoch: u64) -> Option<Vec<ConnectionId>> {
        self.entry(id, epoch)
            .map(|entry| entry.members.iter().cloned().collect())
    }

    /// Members of whatever incarnation currently holds `id`.
    pub fn current_members(&self, id: &GroupId) -> Vec<ConnectionId> {
        self.groups
            .get(id)
            .map(|entry| entry.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Member count of this incarnation; 0 if it is gone.
    pub fn member_count(&self, id: &GroupId, epoch: u64) -> usize {
        self.entry(id, epoch).map_or(0, |entry| entry.members.len())
    }

    /// Whether this incarnation contains `member`.
    pub fn contains(&self, id: &GroupId, epoch: u64, member: &ConnectionId) -> bool {
        self.entry(id, epoch)
            .is_some_and(|entry| entry.members.contains(member))
    }

    /// Sorted ids of every live group.
    pub fn ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.groups.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sorted ids of the groups `member` belongs to.
    pub fn groups_of(&self, member: &ConnectionId) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, entry)| entry.members.contains(member))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of live groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether there are no groups.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Summary of one group, as reported by [`Hub::group_summaries`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    /// Group name.
    pub id: GroupId,
    /// Number of members.
    pub members: usize,
}

impl GroupTable {
    /// Sorted summaries of every live group.
    pub fn summaries(&self) -> Vec<GroupSummary> {
        let mut summaries: Vec<GroupSummary> = self
            .groups
            .iter()
            .map(|(id, entry)| GroupSummary {
                id: id.clone(),
                members: entry.members.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}

/// Handle to one incarnation of a named group.
#[derive(Clone, Debug)]
pub struct Group {
    id: GroupId,
    epoch: u64,
    hub: WeakHub,
}

impl Group {
    pub(crate) fn new(id: GroupId, epoch: u64, hub: WeakHub) -> Self {
        Self { id, epoch, hub }
    }

    /// Group name.
    pub fn id(&self) -> &GroupId {
        &self.id
    }

    fn hub(&self) -> Option<Hub> {
        self.hub.upgrade()
    }

    /// Whether this incarnation still exists.
    pub fn is_attached(&self) -> bool {
        self.hub()
            .is_some_and(|hub| hub.state().groups.epoch(&self.id) == Some(self.epoch))
    }

    /// Add a registered connection. `Ok(false)` if it was already a member.
    pub fn add(&self, connection: &Connection) -> Result<bool> {
        let hub = self
            .hub()
            .ok_or_else(|| WsxError::GroupDetached(self.id.clone()))?;
        let mut state = hub.state();
        if !state.registry.contains(connection.id()) {
            return Err(WsxError::UnknownConnection(connection.id().clone()));
        }
        let added = state
            .groups
            .insert(&self.id, self.epoch, connection.id().clone())
            .map_err(|Detached| WsxError::GroupDetached(self.id.clone()))?;
        drop(state);
        if added {
            debug!(group_id = %self.id, conn_id = %connection.id(), "joined group");
        }
        Ok(added)
    }

    /// Remove a member. Removing the last member removes the group.
    pub fn delete(&self, id: &ConnectionId) -> bool {
        let Some(hub) = self.hub() else {
            return false;
        };
        let removed = hub.state().groups.remove(&self.id, self.epoch, id);
        if removed {
            debug!(group_id = %self.id, conn_id = %id, "left group");
        }
        removed
    }

    /// Remove every member and the group itself. A no-op on a detached
    /// handle.
    pub fn clear(&self) {
        let Some(hub) = self.hub() else {
            return;
        };
        let removed = hub.state().groups.clear(&self.id, self.epoch);
        debug!(group_id = %self.id, members = removed.len(), "group cleared");
    }

    /// Number of members; 0 when detached.
    pub fn len(&self) -> usize {
        self.hub()
            .map_or(0, |hub| hub.state().groups.member_count(&self.id, self.epoch))
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is a member.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.hub()
            .is_some_and(|hub| hub.state().groups.contains(&self.id, self.epoch, id))
    }

    /// Snapshot of member ids.
    pub fn member_ids(&self) -> Vec<ConnectionId> {
        self.hub()
            .and_then(|hub| hub.state().groups.members(&self.id, self.epoch))
            .unwrap_or_default()
    }

    /// Snapshot of member connections.
    pub fn members(&self) -> Vec<Connection> {
        let Some(hub) = self.hub() else {
            return Vec::new();
        };
        let state = hub.state();
        state
            .groups
            .members(&self.id, self.epoch)
            .unwrap_or_default()
            .iter()
            .filter_map(|id| state.registry.get(id).cloned())
            .collect()
    }

    /// Send a typed message to every member. Returns the number of
    /// deliveries.
    pub fn send(&self, kind: impl Into<String>, payload: impl Serialize) -> Result<usize> {
        self.send_envelope(&Envelope::typed(kind, payload)?)
    }

    /// Send an envelope to every member, encoding it once.
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<usize> {
        let Some(hub) = self.hub() else {
            return Ok(0);
        };
        let targets = self.members();
        hub.deliver(envelope, &targets)
    }
}
