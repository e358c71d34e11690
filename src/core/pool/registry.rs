// src/core/pool/registry.rs

//! The per-worker connection registry: an arena keyed by connection id, with
//! parent/child links stored as ids instead of pointers.
//!
//! A child is stored in the same arena but is not a root: it is only reached
//! through its parent's `children` list. A record that has been detached but
//! still pins (or is pinned by) live relatives stays in the arena until the
//! whole family is finished, then the topmost finished ancestor is removed
//! together with its subtree.

use crate::connection::{ConnId, ConnectionRecord};
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a detached record was left in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// One or more children are still attached.
    HasChildren,
    /// The parent is still attached and keeps the child reachable.
    HasParent,
}

/// The registry-level result of a detach.
#[derive(Debug)]
pub(crate) enum Detached {
    /// The listed records left the registry and must be released.
    Removed(Vec<Arc<ConnectionRecord>>),
    Deferred(DeferReason),
    AlreadyDetached,
    NotFound,
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) record: Arc<ConnectionRecord>,
    pub(crate) parent: Option<ConnId>,
    pub(crate) children: Vec<ConnId>,
    pub(crate) detached: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    slots: IndexMap<ConnId, Slot>,
}

impl Registry {
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn contains(&self, id: &ConnId) -> bool {
        self.slots.contains_key(id)
    }

    pub(crate) fn get(&self, id: &ConnId) -> Option<&Slot> {
        self.slots.get(id)
    }

    /// Records that are attached and not yet detached. Equal to the worker's
    /// load at every point where the worker lock is released.
    pub(crate) fn attached_count(&self) -> usize {
        self.slots.values().filter(|slot| !slot.detached).count()
    }

    /// Top-level entries, in registry order.
    pub(crate) fn roots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values().filter(|slot| slot.parent.is_none())
    }

    pub(crate) fn insert_root(&mut self, record: Arc<ConnectionRecord>) {
        let id = record.id();
        let previous = self.slots.insert(
            id,
            Slot {
                record,
                parent: None,
                children: Vec::new(),
                detached: false,
            },
        );
        debug_assert!(previous.is_none(), "connection {id} inserted twice");
    }

    /// Links a child under `parent`. Returns `false`, and stores the child as
    /// a root instead, if the parent has already left the registry.
    pub(crate) fn insert_child(&mut self, record: Arc<ConnectionRecord>, parent: ConnId) -> bool {
        let id = record.id();
        let Some(parent_slot) = self.slots.get_mut(&parent) else {
            self.insert_root(record);
            return false;
        };
        parent_slot.children.push(id);
        self.slots.insert(
            id,
            Slot {
                record,
                parent: Some(parent),
                children: Vec::new(),
                detached: false,
            },
        );
        true
    }

    /// A record is finished once it is detached and all of its descendants
    /// are finished. Missing ids count as finished.
    fn is_finished(&self, id: &ConnId) -> bool {
        match self.slots.get(id) {
            Some(slot) => slot.detached && slot.children.iter().all(|c| self.is_finished(c)),
            None => true,
        }
    }

    fn has_live_children(&self, id: &ConnId) -> bool {
        self.slots
            .get(id)
            .is_some_and(|slot| slot.children.iter().any(|c| !self.is_finished(c)))
    }

    /// Marks `id` detached and removes whatever is no longer pinned.
    ///
    /// The removed unit is the topmost finished ancestor of `id` (or `id`
    /// itself) with its subtree. If that unit still hangs off an attached
    /// parent it stays registered until the parent lets go.
    pub(crate) fn detach(&mut self, id: &ConnId) -> Detached {
        let Some(slot) = self.slots.get_mut(id) else {
            return Detached::NotFound;
        };
        if slot.detached {
            return Detached::AlreadyDetached;
        }
        slot.detached = true;

        if self.has_live_children(id) {
            return Detached::Deferred(DeferReason::HasChildren);
        }
        let top = self.finished_top(*id);
        if let Some(parent) = self.slots.get(&top).and_then(|slot| slot.parent)
            && self.slots.get(&parent).is_some_and(|p| !p.detached)
        {
            return Detached::Deferred(DeferReason::HasParent);
        }
        Detached::Removed(
            self.remove_subtree(&top)
                .into_iter()
                .map(|slot| slot.record)
                .collect(),
        )
    }

    fn finished_top(&self, id: ConnId) -> ConnId {
        let mut top = id;
        while let Some(parent) = self.slots.get(&top).and_then(|slot| slot.parent) {
            if !self.is_finished(&parent) {
                break;
            }
            top = parent;
        }
        top
    }

    /// Unlinks `id` and every descendant. Absent ids are a no-op.
    pub(crate) fn remove_subtree(&mut self, id: &ConnId) -> Vec<Slot> {
        let Some(root) = self.slots.swap_remove(id) else {
            return Vec::new();
        };
        if let Some(parent) = root.parent
            && let Some(parent_slot) = self.slots.get_mut(&parent)
        {
            parent_slot.children.retain(|c| c != id);
        }

        let mut removed = Vec::new();
        let mut pending: Vec<ConnId> = root.children.clone();
        removed.push(root);
        while let Some(child) = pending.pop() {
            if let Some(slot) = self.slots.swap_remove(&child) {
                pending.extend(slot.children.iter().copied());
                removed.push(slot);
            }
        }
        removed
    }

    /// The most recent activity anywhere in the subtree rooted at `id`.
    fn last_activity(&self, id: &ConnId) -> Option<Instant> {
        let slot = self.slots.get(id)?;
        let own = slot.record.access_time();
        Some(
            slot.children
                .iter()
                .filter_map(|c| self.last_activity(c))
                .fold(own, Instant::max),
        )
    }

    /// Roots whose whole session has been idle for longer than `expire_after`.
    pub(crate) fn collect_expired(&self, now: Instant, expire_after: Duration) -> Vec<ConnId> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.parent.is_none())
            .filter_map(|(id, _)| {
                let last = self.last_activity(id)?;
                (now.saturating_duration_since(last) > expire_after).then_some(*id)
            })
            .collect()
    }

    /// Empties the registry, returning every record still present.
    pub(crate) fn drain(&mut self) -> Vec<Slot> {
        self.slots.drain(..).map(|(_, slot)| slot).collect()
    }
}
