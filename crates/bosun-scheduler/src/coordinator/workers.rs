//! Worker capacity bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

fn default_max_builds() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    pub name: String,
    #[serde(default = "default_max_builds")]
    pub max_builds: u32,
    /// Treat the worker as connected from startup.
    #[serde(default)]
    pub online: bool,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_builds: 1,
            online: false,
        }
    }

    pub fn with_max_builds(mut self, max_builds: u32) -> Self {
        self.max_builds = max_builds;
        self
    }

    pub fn online(mut self) -> Self {
        self.online = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuilderConfig {
    pub name: String,
    pub workers: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

impl BuilderConfig {
    pub fn new(name: impl Into<String>, workers: &[&str]) -> Self {
        Self {
            name: name.into(),
            workers: workers.iter().map(|w| w.to_string()).collect(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A worker with at least one free slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSlot {
    pub name: String,
    pub running: u32,
    pub max_builds: u32,
}

#[derive(Debug, Clone)]
struct WorkerState {
    max_builds: u32,
    running: u32,
    online: bool,
}

/// Workers, the builders they serve, and how many builds each is running.
/// Slots are shared by every builder a worker serves.
#[derive(Debug, Clone, Default)]
pub struct WorkerPool {
    workers: BTreeMap<String, WorkerState>,
    builders: BTreeMap<String, BuilderConfig>,
}

impl WorkerPool {
    pub fn new(workers: &[WorkerConfig], builders: &[BuilderConfig]) -> Self {
        Self {
            workers: workers
                .iter()
                .map(|w| {
                    (
                        w.name.clone(),
                        WorkerState {
                            max_builds: w.max_builds,
                            running: 0,
                            online: w.online,
                        },
                    )
                })
                .collect(),
            builders: builders.iter().map(|b| (b.name.clone(), b.clone())).collect(),
        }
    }

    /// Adopt a new configuration, keeping running counts and online flags
    /// for workers that remain.
    pub fn reconfigure(&mut self, workers: &[WorkerConfig], builders: &[BuilderConfig]) {
        let mut next = Self::new(workers, builders);
        for (name, state) in next.workers.iter_mut() {
            if let Some(old) = self.workers.get(name) {
                state.running = old.running;
                state.online = state.online || old.online;
            }
        }
        *self = next;
    }

    pub fn builder_names(&self) -> Vec<String> {
        self.builders.keys().cloned().collect()
    }

    pub fn has_builder(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    pub fn builder_priority(&self, name: &str) -> i32 {
        self.builders.get(name).map_or(0, |b| b.priority)
    }

    /// Returns `false` for unknown workers.
    pub fn set_online(&mut self, worker: &str, online: bool) -> bool {
        match self.workers.get_mut(worker) {
            Some(state) => {
                state.online = online;
                true
            }
            None => false,
        }
    }

    /// Free slots usable by `builder`, in configured worker order.
    pub fn available_for(&self, builder: &str, excluded: &HashSet<String>) -> Vec<WorkerSlot> {
        let Some(config) = self.builders.get(builder) else {
            return Vec::new();
        };
        config
            .workers
            .iter()
            .filter(|w| !excluded.contains(*w))
            .filter_map(|w| {
                let state = self.workers.get(w)?;
                (state.online && state.running < state.max_builds).then(|| WorkerSlot {
                    name: w.clone(),
                    running: state.running,
                    max_builds: state.max_builds,
                })
            })
            .collect()
    }

    /// Take a slot on `worker`. Returns `false` if none is free.
    pub fn acquire(&mut self, worker: &str) -> bool {
        match self.workers.get_mut(worker) {
            Some(state) if state.online && state.running < state.max_builds => {
                state.running += 1;
                true
            }
            _ => false,
        }
    }

    pub fn release(&mut self, worker: &str) {
        if let Some(state) = self.workers.get_mut(worker) {
            state.running = state.running.saturating_sub(1);
        }
    }

    pub fn running_on(&self, worker: &str) -> u32 {
        self.workers.get(worker).map_or(0, |s| s.running)
    }
}
