//! Per-pod message filtering
//!
//! A filter associates things about a message (its id, its type) with an
//! allow/deny decision. Entries that are absent default to allow. Each pod
//! owns exactly one filter and is the only thing that mutates it.

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

use weft_message::Message;

#[derive(Default)]
struct FilterMaps {
    ids: HashMap<Uuid, bool>,
    types: HashMap<String, bool>,
    /// true: listed types are denied, everything else allowed.
    /// false: only listed types are allowed.
    type_inclusive: bool,
}

/// Allow/deny rule set consulted before a pod's handler runs
pub struct MessageFilter {
    maps: RwLock<FilterMaps>,
}

impl MessageFilter {
    pub(crate) fn new() -> Self {
        Self {
            maps: RwLock::new(FilterMaps {
                ids: HashMap::new(),
                types: HashMap::new(),
                type_inclusive: true,
            }),
        }
    }

    /// Whether the message may reach the handler
    pub(crate) fn allow(&self, msg: &Message) -> bool {
        let maps = self.maps.read();

        if let Some(allow) = maps.ids.get(&msg.id()) {
            if !allow {
                return false;
            }
        }

        match maps.types.get(msg.msg_type()) {
            Some(allow) => *allow,
            None => maps.type_inclusive,
        }
    }

    /// Record an allow/deny decision for a message id
    pub(crate) fn filter_id(&self, id: Uuid, allow: bool) {
        self.maps.write().ids.insert(id, allow);
    }

    /// Record an allow/deny decision for a message type
    pub(crate) fn filter_type(&self, msg_type: impl Into<String>, allow: bool) {
        self.maps.write().types.insert(msg_type.into(), allow);
    }

    /// Reset to the default state: everything allowed
    pub(crate) fn reset(&self) {
        let mut maps = self.maps.write();
        maps.ids.clear();
        maps.types.clear();
        maps.type_inclusive = true;
    }

    /// Reset and switch to allow-only mode for the listed types
    pub(crate) fn reset_to_types(&self, types: &[&str]) {
        let mut maps = self.maps.write();
        maps.ids.clear();
        maps.types.clear();
        maps.type_inclusive = false;

        for t in types {
            maps.types.insert((*t).to_string(), true);
        }
    }
}
