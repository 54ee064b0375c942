mod build;
mod identity;
mod invocable;

pub use build::{BuildEvent, PendingOperation};
pub use identity::{EventId, EventIdentity, ScriptId};
pub use invocable::{EventSettings, HandlerList, InvocableEvent, Invocation, InvocationReport, InvokeOptions};

use crate::key::HandleKey;
use smallvec::SmallVec;
use std::collections::HashSet;

/// Order bucket used when an event never had its shape declared.
pub const DEFAULT_ORDER: &str = "default";

/// The fixed shape of an invocable event: legal order buckets in execution
/// order, and the permitted keys (empty means unrestricted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventShape {
    orders: SmallVec<[String; 4]>,
    keys: HashSet<HandleKey>,
}

impl EventShape {
    /// Duplicate bucket names keep their first position. An empty order list
    /// falls back to the single default bucket.
    pub fn new<I, S>(orders: I, keys: impl IntoIterator<Item = HandleKey>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: SmallVec<[String; 4]> = SmallVec::new();
        for order in orders {
            let order = order.into();
            if !unique.contains(&order) {
                unique.push(order);
            }
        }
        if unique.is_empty() {
            unique.push(DEFAULT_ORDER.to_string());
        }
        let keys = keys.into_iter().filter(|key| !key.is_wildcard()).collect();
        Self { orders: unique, keys }
    }

    pub fn orders(&self) -> &[String] {
        &self.orders
    }

    pub fn keys(&self) -> &HashSet<HandleKey> {
        &self.keys
    }

    pub fn first_order(&self) -> &str {
        &self.orders[0]
    }

    pub fn order_position(&self, order: &str) -> Option<usize> {
        self.orders.iter().position(|candidate| candidate == order)
    }

    /// The wildcard is always permitted; concrete keys only when the key set
    /// is unrestricted or contains them.
    pub fn permits_key(&self, key: &HandleKey) -> bool {
        key.is_wildcard() || self.keys.is_empty() || self.keys.contains(key)
    }
}

impl Default for EventShape {
    fn default() -> Self {
        Self::new([DEFAULT_ORDER], [])
    }
}
