//! Worker supervisor
//!
//! This module provides:
//! - `reconcile`, the pure old/new source diff
//! - The `Command` wire contract sent to the worker-management task
//! - `Supervisor`, which holds the last applied snapshot and emits
//!   commands whenever a new snapshot arrives
//!
//! The supervisor never touches worker handles. Those are owned by
//! the spawner on the other end of the command channel.

pub mod spawner;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SubscriptionSpec, WorkerOptions};
use crate::metrics::METRICS;

/// Sources to stop, then sources to start.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    pub stop: Vec<String>,
    pub start: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.stop.is_empty() && self.start.is_empty()
    }
}

/// Diffs two source maps.
///
/// A source whose subscription changed appears in both lists; the
/// caller applies every stop before any start. Both lists are sorted
/// and duplicate-free.
pub fn reconcile(
    old: &BTreeMap<String, SubscriptionSpec>,
    new: &BTreeMap<String, SubscriptionSpec>,
) -> Plan {
    if new.is_empty() {
        return Plan {
            stop: old.keys().cloned().collect(),
            start: Vec::new(),
        };
    }

    if old.is_empty() {
        return Plan {
            stop: Vec::new(),
            start: new.keys().cloned().collect(),
        };
    }

    let mut stop = BTreeSet::new();
    let mut start = BTreeSet::new();

    for (source, spec) in new {
        match old.get(source) {
            None => {
                start.insert(source.clone());
            }
            Some(prev) if prev != spec => {
                stop.insert(source.clone());
                start.insert(source.clone());
            }
            Some(_) => {}
        }
    }

    for source in old.keys() {
        if !new.contains_key(source) {
            stop.insert(source.clone());
        }
    }

    Plan {
        stop: stop.into_iter().collect(),
        start: start.into_iter().collect(),
    }
}

/// Control message for the worker-management task.
///
/// Wire shape:
///     {"op":"start","source":..,"subscription_spec":..,"config":..}
///     {"op":"stop","source":..}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Command {
    Start {
        source: String,
        subscription_spec: SubscriptionSpec,
        config: WorkerOptions,
    },
    Stop {
        source: String,
    },
}

impl Command {
    pub fn source(&self) -> &str {
        match self {
            Command::Start { source, .. } | Command::Stop { source } => source,
        }
    }
}

/// Everything one ingestion worker needs to run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerDescriptor {
    pub source: String,
    pub spec: SubscriptionSpec,
    pub options: WorkerOptions,
}

pub struct Supervisor {
    /// Last applied snapshot
    running: Option<Arc<Config>>,
    commands: Option<mpsc::Sender<Command>>,
}

impl Supervisor {
    pub fn new(commands: mpsc::Sender<Command>) -> Self {
        Self {
            running: None,
            commands: Some(commands),
        }
    }

    /// Applies a new snapshot and sends the resulting commands.
    ///
    /// A change of worker options (queue backend) restarts every
    /// source, since running workers captured the old options.
    pub async fn reconfigure(&mut self, new: Arc<Config>) -> Plan {
        if self.running.as_deref() == Some(new.as_ref()) {
            return Plan::default();
        }

        let empty = BTreeMap::new();
        let old_sources = self.running.as_ref().map_or(&empty, |c| &c.sources);

        let options_changed = self
            .running
            .as_ref()
            .is_some_and(|c| c.worker_options() != new.worker_options());

        let plan = if options_changed {
            log::info!("worker options changed, restarting all sources");
            reconcile(old_sources, &empty).merge(reconcile(&empty, &new.sources))
        } else {
            reconcile(old_sources, &new.sources)
        };

        if !plan.is_empty() {
            log::info!("reconfigure: stop={:?} start={:?}", plan.stop, plan.start);
        }

        let options = new.worker_options();
        let mut commands: Vec<Command> = plan
            .stop
            .iter()
            .map(|source| Command::Stop {
                source: source.clone(),
            })
            .collect();

        for source in &plan.start {
            if let Some(spec) = new.sources.get(source) {
                commands.push(Command::Start {
                    source: source.clone(),
                    subscription_spec: spec.clone(),
                    config: options.clone(),
                });
            }
        }

        for cmd in commands {
            self.send(cmd).await;
        }

        self.running = Some(new);
        plan
    }

    async fn send(&mut self, cmd: Command) {
        let Some(tx) = &self.commands else {
            log::debug!("command channel closed, dropping {:?}", cmd);
            return;
        };

        match tx.send(cmd).await {
            Ok(()) => {
                METRICS.commands_sent.fetch_add(1, Ordering::Relaxed);
            }
            // receiver gone: shutdown in progress
            Err(mpsc::error::SendError(cmd)) => {
                log::debug!("command channel closed, dropping {} for {}", op(&cmd), cmd.source());
                self.commands = None;
            }
        }
    }

    /// Closes the command channel. Later reconfigurations only
    /// update the running snapshot.
    pub fn close(&mut self) {
        self.commands = None;
    }

    #[cfg(test)]
    pub fn running(&self) -> Option<&Arc<Config>> {
        self.running.as_ref()
    }

    /// Applies the current snapshot, then every change until cancelled.
    pub async fn run(
        mut self,
        mut config: watch::Receiver<Arc<Config>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let initial = config.borrow_and_update().clone();
        self.reconfigure(initial).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = config.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = config.borrow_and_update().clone();
                    self.reconfigure(snapshot).await;
                }
            }
        }

        self.close();
        log::info!("supervisor stopped, command channel closed");
        Ok(())
    }
}

impl Plan {
    fn merge(mut self, other: Plan) -> Plan {
        let stop: BTreeSet<String> = self.stop.drain(..).chain(other.stop).collect();
        let start: BTreeSet<String> = self.start.drain(..).chain(other.start).collect();
        Plan {
            stop: stop.into_iter().collect(),
            start: start.into_iter().collect(),
        }
    }
}

fn op(cmd: &Command) -> &'static str {
    match cmd {
        Command::Start { .. } => "start",
        Command::Stop { .. } => "stop",
    }
}
