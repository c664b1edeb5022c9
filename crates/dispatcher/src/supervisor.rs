//! Runs a dispatcher and a set of workers under one supervisor process.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use durq_core::{Clock, NewProcess, ProcessId, ProcessKind, QueueResult, SystemClock};
use durq_store::QueueStore;

use crate::config::{DispatcherConfig, WorkerConfig};
use crate::dispatcher::{Dispatcher, DispatcherHandle, DispatcherStats};
use crate::handler::HandlerRegistry;
use crate::heartbeat;
use crate::worker::{Worker, WorkerHandle, WorkerStats};

pub struct Supervisor {
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    name: String,
    dispatcher: Option<DispatcherConfig>,
    workers: Vec<WorkerConfig>,
    clock: Arc<dyn Clock>,
}

impl Supervisor {
    pub fn new(store: Arc<dyn QueueStore>, registry: HandlerRegistry) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            name: "supervisor".to_string(),
            dispatcher: None,
            workers: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_dispatcher(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = Some(config);
        self
    }

    pub fn with_worker(mut self, config: WorkerConfig) -> Self {
        self.workers.push(config);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register the supervisor, then start the dispatcher and every worker
    /// as its children. All of them stop when `shutdown` fires.
    ///
    /// Fails before registering anything if a heartbeat interval would let
    /// the reaper collect a healthy child.
    pub async fn start(self, shutdown: CancellationToken) -> QueueResult<SupervisorHandle> {
        let stale_after = match &self.dispatcher {
            Some(config) => {
                config.validate()?;
                config.stale_after
            }
            None => DispatcherConfig::default().stale_after,
        };
        for worker in &self.workers {
            worker.validate(stale_after)?;
        }

        let process = self
            .store
            .register(NewProcess::new(ProcessKind::Supervisor, &self.name))
            .await?;
        let token = shutdown.child_token();
        let heartbeat_interval = self
            .dispatcher
            .as_ref()
            .map(|d| d.heartbeat_interval)
            .or_else(|| self.workers.first().map(|w| w.heartbeat_interval))
            .unwrap_or(DispatcherConfig::default().heartbeat_interval);
        let heartbeat = heartbeat::spawn(self.store.clone(), process.id, heartbeat_interval, token.clone());

        let dispatcher = match self.dispatcher {
            Some(config) => Some(
                Dispatcher::new(self.store.clone(), config)
                    .with_clock(self.clock.clone())
                    .with_supervisor(process.id)
                    .start(token.clone())
                    .await?,
            ),
            None => None,
        };

        let mut workers = Vec::with_capacity(self.workers.len());
        for config in self.workers {
            let handle = Worker::new(self.store.clone(), self.registry.clone(), config)
                .with_supervisor(process.id)
                .start(token.clone())
                .await?;
            workers.push(handle);
        }

        info!(
            supervisor = %self.name,
            process_id = %process.id,
            workers = workers.len(),
            dispatcher = dispatcher.is_some(),
            "supervisor started"
        );

        Ok(SupervisorHandle {
            process_id: process.id,
            store: self.store,
            shutdown: token,
            heartbeat,
            dispatcher,
            workers,
        })
    }
}

/// What the supervised runtimes did before shutting down.
#[derive(Debug, Clone, Default)]
pub struct SupervisorReport {
    pub dispatcher: Option<DispatcherStats>,
    pub workers: Vec<WorkerStats>,
}

pub struct SupervisorHandle {
    process_id: ProcessId,
    store: Arc<dyn QueueStore>,
    shutdown: CancellationToken,
    heartbeat: JoinHandle<()>,
    dispatcher: Option<DispatcherHandle>,
    workers: Vec<WorkerHandle>,
}

impl SupervisorHandle {
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn worker_ids(&self) -> Vec<ProcessId> {
        self.workers.iter().map(WorkerHandle::process_id).collect()
    }

    pub fn dispatcher_id(&self) -> Option<ProcessId> {
        self.dispatcher.as_ref().map(DispatcherHandle::process_id)
    }

    /// Stop workers first (draining in-flight jobs), then the dispatcher,
    /// then deregister the supervisor itself.
    pub async fn shutdown(self) -> QueueResult<SupervisorReport> {
        self.shutdown.cancel();

        let mut report = SupervisorReport::default();
        let mut first_error = None;
        for worker in self.workers {
            match worker.wait().await {
                Ok(stats) => report.workers.push(stats),
                Err(e) => {
                    warn!(error = %e, "worker stopped with an error");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(dispatcher) = self.dispatcher {
            match dispatcher.shutdown().await {
                Ok(stats) => report.dispatcher = Some(stats),
                Err(e) => {
                    warn!(error = %e, "dispatcher stopped with an error");
                    first_error.get_or_insert(e);
                }
            }
        }
        let _ = self.heartbeat.await;
        self.store.deregister(self.process_id).await?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}
