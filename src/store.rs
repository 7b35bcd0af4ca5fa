// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence boundary for rules, endpoints, and executions.
//!
//! The scheduler needs CRUD over [`ReplicationRule`]s and
//! [`RegistryEndpoint`]s, plus an append-only log per [`Execution`]. The
//! storage technology is the collaborator's concern; this module defines
//! the trait and a memory-backed implementation used by tests and
//! standalone mode.
//!
//! The trait uses boxed futures so it stays object-safe and mockable.

use crate::config::{RegistryEndpoint, ReplicationRule};
use crate::error::{ReplicationError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::execution::{Execution, ExecutionLog, LogLevel};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Type alias for boxed async futures (reduces trait signature noise).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What the scheduler needs from the persistence layer.
pub trait ExecutionStore: Send + Sync + 'static {
    /// Look up a rule by name.
    fn get_rule(&self, name: &str) -> BoxFuture<'_, Result<Option<ReplicationRule>>>;

    /// All enabled rules (the scheduler's cron registry feeds on this).
    fn list_enabled_rules(&self) -> BoxFuture<'_, Result<Vec<ReplicationRule>>>;

    /// Look up a registry endpoint by name.
    fn get_endpoint(&self, name: &str) -> BoxFuture<'_, Result<Option<RegistryEndpoint>>>;

    /// Persist a freshly created execution record.
    fn create_execution(&self, execution: Execution) -> BoxFuture<'_, Result<()>>;

    /// Overwrite an execution record (counters, terminal state).
    fn update_execution(&self, execution: Execution) -> BoxFuture<'_, Result<()>>;

    /// Fetch an execution by id.
    fn get_execution(&self, id: &str) -> BoxFuture<'_, Result<Option<Execution>>>;

    /// Append one entry to an execution's log.
    fn append_log(&self, entry: ExecutionLog) -> BoxFuture<'_, Result<()>>;

    /// All log entries for an execution, in append order.
    fn execution_logs(&self, execution_id: &str) -> BoxFuture<'_, Result<Vec<ExecutionLog>>>;
}

/// In-memory store for tests and standalone runs.
#[derive(Default)]
pub struct MemoryStore {
    rules: RwLock<HashMap<String, ReplicationRule>>,
    endpoints: RwLock<HashMap<String, RegistryEndpoint>>,
    executions: RwLock<HashMap<String, Execution>>,
    logs: RwLock<Vec<ExecutionLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a rule.
    pub async fn put_rule(&self, rule: ReplicationRule) {
        self.rules.write().await.insert(rule.name.clone(), rule);
    }

    /// Insert or replace an endpoint.
    pub async fn put_endpoint(&self, endpoint: RegistryEndpoint) {
        self.endpoints
            .write()
            .await
            .insert(endpoint.name.clone(), endpoint);
    }

    /// Number of stored executions (test helper).
    pub async fn execution_count(&self) -> usize {
        self.executions.read().await.len()
    }
}

impl ExecutionStore for MemoryStore {
    fn get_rule(&self, name: &str) -> BoxFuture<'_, Result<Option<ReplicationRule>>> {
        let name = name.to_string();
        Box::pin(async move { Ok(self.rules.read().await.get(&name).cloned()) })
    }

    fn list_enabled_rules(&self) -> BoxFuture<'_, Result<Vec<ReplicationRule>>> {
        Box::pin(async move {
            let mut rules: Vec<ReplicationRule> = self
                .rules
                .read()
                .await
                .values()
                .filter(|r| r.enabled)
                .cloned()
                .collect();
            rules.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(rules)
        })
    }

    fn get_endpoint(&self, name: &str) -> BoxFuture<'_, Result<Option<RegistryEndpoint>>> {
        let name = name.to_string();
        Box::pin(async move { Ok(self.endpoints.read().await.get(&name).cloned()) })
    }

    fn create_execution(&self, execution: Execution) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut executions = self.executions.write().await;
            if executions.contains_key(&execution.id) {
                return Err(ReplicationError::Store(format!(
                    "execution {} already exists",
                    execution.id
                )));
            }
            executions.insert(execution.id.clone(), execution);
            Ok(())
        })
    }

    fn update_execution(&self, execution: Execution) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.executions
                .write()
                .await
                .insert(execution.id.clone(), execution);
            Ok(())
        })
    }

    fn get_execution(&self, id: &str) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.executions.read().await.get(&id).cloned()) })
    }

    fn append_log(&self, entry: ExecutionLog) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.logs.write().await.push(entry);
            Ok(())
        })
    }

    fn execution_logs(&self, execution_id: &str) -> BoxFuture<'_, Result<Vec<ExecutionLog>>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            Ok(self
                .logs
                .read()
                .await
                .iter()
                .filter(|l| l.execution_id == execution_id)
                .cloned()
                .collect())
        })
    }
}

/// Structured logger bound to one execution.
///
/// Every entry goes three ways: the store (append-only log), the event
/// bus (live feed), and `tracing` (operator logs). Store failures are
/// downgraded to warnings so a sick database cannot fail a healthy copy.
#[derive(Clone)]
pub struct ExecutionLogger {
    store: Arc<dyn ExecutionStore>,
    bus: EventBus,
    execution_id: String,
    rule: String,
}

impl ExecutionLogger {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        bus: EventBus,
        execution_id: impl Into<String>,
        rule: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bus,
            execution_id: execution_id.into(),
            rule: rule.into(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(rule = %self.rule, execution_id = %self.execution_id, "{}", message),
            LogLevel::Info => info!(rule = %self.rule, execution_id = %self.execution_id, "{}", message),
            LogLevel::Warn => warn!(rule = %self.rule, execution_id = %self.execution_id, "{}", message),
            LogLevel::Error => error!(rule = %self.rule, execution_id = %self.execution_id, "{}", message),
        }

        let entry = ExecutionLog::new(&self.execution_id, level, message.clone());
        if let Err(e) = self.store.append_log(entry.clone()).await {
            warn!(error = %e, "Failed to persist execution log entry");
        }
        self.bus.publish(EngineEvent::Log {
            execution_id: self.execution_id.clone(),
            level,
            message,
            timestamp: entry.timestamp,
        });
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message).await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message).await;
    }
}
