//! Process-local named monotonic counters.
//!
//! Counters are addressable as (module, name) and are incremented at least at
//! every provider call and every error branch. Unlike the fire-and-forget
//! [`metrics`] macros, this registry can be read back, because the daemon API
//! exposes counter values verbatim to clients.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// One counter value as exposed through the query API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub module: String,
    pub name: String,
    pub value: u64,
}

/// A registry of named monotonic counters. Cheap to clone; clones share
/// state.
#[derive(Clone, Debug, Default)]
pub struct Counters {
    inner: Arc<DashMap<(String, String), u64>>,
}

impl Counters {
    pub fn new() -> Self {
        Default::default()
    }

    /// Increment the (module, name) counter, creating it at zero first if it
    /// has never been touched.
    pub fn inc(&self, module: &str, name: &str) {
        metrics::counter!(
            "drover_counter",
            "module" => module.to_owned(),
            "name" => name.to_owned(),
        )
        .increment(1);
        *self
            .inner
            .entry((module.to_owned(), name.to_owned()))
            .or_insert(0) += 1;
    }

    /// Current value of the (module, name) counter; zero if never incremented.
    pub fn get(&self, module: &str, name: &str) -> u64 {
        self.inner
            .get(&(module.to_owned(), name.to_owned()))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Snapshot of every counter, sorted by (module, name) so output is
    /// stable.
    pub fn snapshot(&self) -> Vec<Counter> {
        let mut all: Vec<Counter> = self
            .inner
            .iter()
            .map(|entry| {
                let (module, name) = entry.key();
                Counter {
                    module: module.clone(),
                    name: name.clone(),
                    value: *entry.value(),
                }
            })
            .collect();
        all.sort_by(|a, b| (&a.module, &a.name).cmp(&(&b.module, &b.name)));
        all
    }
}
