// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scheduler and execution tracker.
//!
//! The scheduler turns rule definitions into concrete executions:
//!
//! - [`execute_rule()`](Scheduler::execute_rule) starts a run on demand:
//!   synchronous start (conflict checking, record creation), asynchronous
//!   run (the engine works on a background task).
//! - A cron loop fires enabled rules on their schedule. Standard 5-field
//!   expressions are accepted and normalized; an empty expression means
//!   on-demand only.
//! - In-flight bookkeeping enforces at most one running execution per
//!   rule; a second start fails fast with
//!   [`ReplicationError::Conflict`].
//! - [`cancel_rule()`](Scheduler::cancel_rule) flips the execution's
//!   cancel handle; the engine observes it at its next suspension point
//!   and the record lands in `canceled`.
//!
//! Terminal states are written exactly once, by the scheduler, after the
//! engine task returns. The scheduler is cheap to clone; all clones share
//! the same in-flight map and store.

use crate::config::GlobalSettings;
use crate::engine::ReplicationEngine;
use crate::error::{ReplicationError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::execution::{Execution, ExecutionStatus};
use crate::metrics;
use crate::store::{ExecutionLogger, ExecutionStore};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Parse a cron expression, normalizing 5-field syntax to the 6-field
/// (with seconds) form the `cron` crate expects.
pub fn parse_cron_expression(expression: &str) -> Result<Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expression),
        6 | 7 => expression.to_string(),
        _ => {
            return Err(ReplicationError::Config(format!(
                "invalid cron expression (expected 5 or 6 fields): {}",
                expression
            )))
        }
    };
    Schedule::from_str(&normalized)
        .map_err(|e| ReplicationError::Config(format!("invalid cron expression: {}", e)))
}

/// The next fire time strictly after `after`.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Long-lived scheduler over a store of rules and endpoints.
pub struct Scheduler<S: ExecutionStore> {
    store: Arc<S>,
    bus: EventBus,
    global: GlobalSettings,
    /// rule name -> cancel handle of its running execution
    in_flight: Arc<StdMutex<HashMap<String, watch::Sender<bool>>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    cron_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl<S: ExecutionStore> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            bus: self.bus.clone(),
            global: self.global.clone(),
            in_flight: Arc::clone(&self.in_flight),
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            shutdown_rx: self.shutdown_rx.clone(),
            cron_handle: Arc::clone(&self.cron_handle),
        }
    }
}

impl<S: ExecutionStore> Scheduler<S> {
    pub fn new(store: Arc<S>, bus: EventBus, global: GlobalSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            bus,
            global,
            in_flight: Arc::new(StdMutex::new(HashMap::new())),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            cron_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Subscribe to the progress feed.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Whether a rule currently has an execution in flight.
    pub fn is_running(&self, rule_name: &str) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .contains_key(rule_name)
    }

    /// Number of executions in flight.
    pub fn running_count(&self) -> usize {
        self.in_flight.lock().expect("in-flight lock poisoned").len()
    }

    /// Start an execution for a rule.
    ///
    /// Returns the execution id once the record is created and the engine
    /// is running in the background. Fails fast with
    /// [`ReplicationError::Conflict`] when the rule is already in flight.
    pub async fn execute_rule(&self, rule_name: &str) -> Result<String> {
        let rule = self
            .store
            .get_rule(rule_name)
            .await?
            .ok_or_else(|| ReplicationError::NotFound {
                kind: "rule",
                name: rule_name.to_string(),
            })?;

        let source_endpoint = self
            .store
            .get_endpoint(&rule.source.registry)
            .await?
            .ok_or_else(|| ReplicationError::NotFound {
                kind: "endpoint",
                name: rule.source.registry.clone(),
            })?;
        let target_endpoint = self
            .store
            .get_endpoint(&rule.target.registry)
            .await?
            .ok_or_else(|| ReplicationError::NotFound {
                kind: "endpoint",
                name: rule.target.registry.clone(),
            })?;

        // Claim the in-flight slot before any record is written.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            if in_flight.contains_key(&rule.name) {
                return Err(ReplicationError::Conflict(rule.name));
            }
            in_flight.insert(rule.name.clone(), cancel_tx);
            metrics::set_running_executions(in_flight.len());
        }

        let mut execution = Execution::new(&rule.name);
        execution.start();
        let execution_id = execution.id.clone();

        if let Err(e) = self.store.create_execution(execution.clone()).await {
            self.release(&rule.name);
            return Err(e);
        }

        let logger = ExecutionLogger::new(
            Arc::clone(&self.store) as Arc<dyn ExecutionStore>,
            self.bus.clone(),
            &execution_id,
            &rule.name,
        );

        let engine = match ReplicationEngine::new(
            rule.clone(),
            self.global.clone(),
            &source_endpoint,
            &target_endpoint,
            self.bus.clone(),
            logger,
        ) {
            Ok(engine) => engine,
            Err(e) => {
                execution.finish(ExecutionStatus::Failed, Some(e.to_string()));
                if let Err(store_err) = self.store.update_execution(execution).await {
                    warn!(error = %store_err, "Failed to record engine construction failure");
                }
                self.release(&rule.name);
                return Err(e);
            }
        };

        info!(rule = %rule.name, execution_id = %execution_id, "Execution started");

        let this = self.clone();
        let rule_name = rule.name.clone();
        tokio::spawn(async move {
            let counters = engine.counters();
            let result = engine.run(cancel_rx).await;

            let (status, error) = match result {
                Ok(()) => (ExecutionStatus::Success, None),
                Err(ReplicationError::Canceled) => (ExecutionStatus::Canceled, None),
                Err(e) => (ExecutionStatus::Failed, Some(e.to_string())),
            };

            execution.counters = counters.snapshot();
            execution.finish(status, error);
            metrics::record_execution_finished(
                &rule_name,
                status,
                execution.duration().to_std().unwrap_or_default(),
            );

            if let Err(e) = this.store.update_execution(execution).await {
                warn!(rule = %rule_name, error = %e, "Failed to persist terminal execution state");
            }
            info!(rule = %rule_name, status = %status, "Execution finished");
            this.release(&rule_name);
        });

        Ok(execution_id)
    }

    /// Cancel the running execution of a rule.
    ///
    /// The engine observes the signal at its next suspension point; the
    /// execution record lands in `canceled`.
    pub fn cancel_rule(&self, rule_name: &str) -> Result<()> {
        let in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
        match in_flight.get(rule_name) {
            Some(cancel_tx) => {
                let _ = cancel_tx.send(true);
                info!(rule = %rule_name, "Cancellation requested");
                Ok(())
            }
            None => Err(ReplicationError::NotFound {
                kind: "running execution",
                name: rule_name.to_string(),
            }),
        }
    }

    fn release(&self, rule_name: &str) {
        let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
        in_flight.remove(rule_name);
        metrics::set_running_executions(in_flight.len());
    }

    /// Start the cron loop.
    ///
    /// Computes the earliest upcoming fire across all enabled rules with
    /// a schedule, sleeps until then, and fires whatever is due. Conflicts
    /// (rule still running from the previous fire) are skipped with a
    /// warning.
    pub fn start(&self) {
        let this = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            info!("Scheduler cron loop started");
            loop {
                let due = this.upcoming_fires().await;
                let now = Utc::now();
                let sleep_for = due
                    .iter()
                    .map(|(_, at)| *at)
                    .min()
                    .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
                    // No scheduled rules: re-scan once a minute to pick up edits.
                    .unwrap_or(Duration::from_secs(60));

                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {
                        let now = Utc::now();
                        for (rule_name, at) in &due {
                            if *at > now {
                                continue;
                            }
                            match this.execute_rule(rule_name).await {
                                Ok(execution_id) => {
                                    info!(rule = %rule_name, execution_id = %execution_id, "Cron trigger fired");
                                }
                                Err(ReplicationError::Conflict(_)) => {
                                    warn!(rule = %rule_name, "Cron fire skipped: previous execution still running");
                                }
                                Err(e) => {
                                    error!(rule = %rule_name, error = %e, "Cron-triggered execution failed to start");
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Scheduler cron loop stopped");
        });

        *self
            .cron_handle
            .lock()
            .expect("cron handle lock poisoned") = Some(handle);
    }

    /// Next fire time per enabled rule with a cron expression.
    ///
    /// Unparseable expressions are skipped here; validation flags them at
    /// rule-save time.
    async fn upcoming_fires(&self) -> Vec<(String, DateTime<Utc>)> {
        let rules = self.store.list_enabled_rules().await.unwrap_or_default();
        let now = Utc::now();
        rules
            .iter()
            .filter(|rule| !rule.cron.is_empty())
            .filter_map(|rule| {
                let schedule = parse_cron_expression(&rule.cron).ok()?;
                next_fire(&schedule, now).map(|at| (rule.name.clone(), at))
            })
            .collect()
    }

    /// Stop the cron loop and cancel every running execution.
    pub async fn shutdown(&self) {
        info!("Shutting down scheduler");
        let _ = self.shutdown_tx.send(true);

        let handle = self
            .cron_handle
            .lock()
            .expect("cron handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
        for (rule_name, cancel_tx) in in_flight.iter() {
            info!(rule = %rule_name, "Canceling execution on shutdown");
            let _ = cancel_tx.send(true);
        }
    }
}
