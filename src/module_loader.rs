//! # Module Load Manager
//!
//! Loads modules at most once, even when many callers ask for the same module
//! at the same time, and gates loading on dependency readiness.
//!
//! ## Lifecycle
//!
//! ```text
//! NotStarted ──load──▶ Loading ──ok──▶ Loaded
//!                         │
//!                         └──err──▶ Failed ──load──▶ Loading ...
//! ```
//!
//! A failed module is not terminal: the next `load` call is a fresh attempt.
//!
//! ## Single flight
//!
//! The first caller spawns the load operation as a tokio task and records a
//! shared handle to its completion. Every caller that arrives while the module
//! is `Loading` awaits that same handle. The operation keeps running even if
//! every caller stops waiting, and its outcome is always written back to the
//! record, so later queries see it.
//!
//! On success the manager announces the module on the [`ReadinessBus`], which
//! may in turn release modules waiting on it.

use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use dashmap::DashMap;
use futures::{
    future::{try_join_all, BoxFuture, Shared},
    FutureExt,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument};

use crate::event_bus::{BoxError, BusError, ReadinessBus};

type InFlight = Shared<BoxFuture<'static, LoadResult<()>>>;

/// Boxed load operation, used when loading several modules at once.
pub type LoadOperation = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LoadStatus {
    NotStarted,
    Loading,
    Loaded,
    Failed,
}

enum ModuleRecord {
    NotStarted,
    Loading(InFlight),
    Loaded,
    Failed(LoadError),
}

impl ModuleRecord {
    fn status(&self) -> LoadStatus {
        match self {
            ModuleRecord::NotStarted => LoadStatus::NotStarted,
            ModuleRecord::Loading(_) => LoadStatus::Loading,
            ModuleRecord::Loaded => LoadStatus::Loaded,
            ModuleRecord::Failed(_) => LoadStatus::Failed,
        }
    }
}

/// A module name paired with the operation that loads it.
pub struct LoadEntry {
    pub name: String,
    pub operation: LoadOperation,
}

impl LoadEntry {
    pub fn new<F, Fut>(name: &str, operation: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            operation: Box::new(move || operation().boxed()),
        }
    }
}

#[derive(Clone)]
pub struct ModuleLoadManager {
    records: Arc<DashMap<String, ModuleRecord>>,
    bus: ReadinessBus,
    dependency_timeout: Duration,
}

impl ModuleLoadManager {
    pub fn new(bus: ReadinessBus, dependency_timeout: Duration) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            bus,
            dependency_timeout,
        }
    }

    /// Loads `name` by invoking `operation`, at most once at a time.
    ///
    /// * Already loaded: returns `Ok(())` without invoking `operation`.
    /// * Currently loading: awaits the load already in flight; `operation` is dropped.
    /// * Otherwise: invokes `operation` once, records the outcome and, on
    ///   success, announces `name` ready on the bus.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// * `LoadError::LoadFailure` - the operation failed; also kept for [`Self::get_error`]
    /// * `LoadError::TaskAborted` - the operation panicked or its task was cancelled
    #[instrument(skip(self, operation))]
    pub async fn load<F, Fut>(&self, name: &str, operation: F) -> LoadResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let (in_flight, completion) = {
            let mut record = self
                .records
                .entry(name.to_string())
                .or_insert(ModuleRecord::NotStarted);
            match &*record {
                ModuleRecord::Loaded => return Ok(()),
                ModuleRecord::Loading(in_flight) => {
                    debug!("Module {} already loading, joining in-flight load", name);
                    (in_flight.clone(), None)
                }
                ModuleRecord::NotStarted | ModuleRecord::Failed(_) => {
                    let (tx, rx) = oneshot::channel();
                    let records = self.records.clone();
                    let module = name.to_string();
                    let in_flight = async move {
                        rx.await.unwrap_or_else(|_| {
                            // The task may have recorded its outcome before going away.
                            let mut record = records
                                .entry(module.clone())
                                .or_insert(ModuleRecord::NotStarted);
                            match &*record {
                                ModuleRecord::Loaded => Ok(()),
                                ModuleRecord::Failed(e) => Err(e.clone()),
                                ModuleRecord::NotStarted | ModuleRecord::Loading(_) => {
                                    let e = LoadError::TaskAborted {
                                        module,
                                        message: "load task dropped".to_string(),
                                    };
                                    *record = ModuleRecord::Failed(e.clone());
                                    Err(e)
                                }
                            }
                        })
                    }
                    .boxed()
                    .shared();
                    *record = ModuleRecord::Loading(in_flight.clone());
                    (in_flight, Some(tx))
                }
            }
        };

        // The record lock is released before user code runs.
        if let Some(tx) = completion {
            info!("Loading {}...", name);
            self.spawn_load(name, operation(), tx);
        }

        in_flight.await
    }

    fn spawn_load<Fut>(&self, name: &str, operation: Fut, tx: oneshot::Sender<LoadResult<()>>)
    where
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let records = self.records.clone();
        let bus = self.bus.clone();
        let module = name.to_string();

        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(operation).catch_unwind().await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => Err(LoadError::LoadFailure {
                    module: module.clone(),
                    source: Arc::from(source),
                }),
                Err(_) => Err(LoadError::TaskAborted {
                    module: module.clone(),
                    message: "load operation panicked".to_string(),
                }),
            };

            match &outcome {
                Ok(()) => {
                    records.insert(module.clone(), ModuleRecord::Loaded);
                    bus.announce_ready(&module);
                    info!("{} loaded successfully", module);
                }
                Err(e) => {
                    records.insert(module.clone(), ModuleRecord::Failed(e.clone()));
                    error!("Failed to load {}: {}", module, e);
                }
            }

            // 待機者がいなくても結果はレコードに残る
            let _ = tx.send(outcome);
        });
    }

    /// Loads every entry concurrently.
    ///
    /// Fails with the first error observed. Loads that were still running keep
    /// running, and every module's outcome stays queryable afterwards.
    pub async fn load_all(&self, entries: Vec<LoadEntry>) -> LoadResult<()> {
        try_join_all(
            entries
                .into_iter()
                .map(|LoadEntry { name, operation }| async move {
                    self.load(&name, operation).await
                }),
        )
        .await?;
        Ok(())
    }

    /// Waits until every module in `dependencies` is ready on the bus, then
    /// loads `name` with [`Self::load`].
    ///
    /// Readiness is what the bus reports, so a dependency that announced
    /// itself without going through this manager counts.
    ///
    /// # Errors
    ///
    /// * `LoadError::DependencyTimeout` - the dependency timeout elapsed first;
    ///   `operation` is never invoked
    /// * `LoadError::DependencyWaitCancelled` - the bus was reset while waiting
    /// * anything [`Self::load`] returns
    #[instrument(skip(self, operation))]
    pub async fn load_with_dependencies<F, Fut>(
        &self,
        name: &str,
        operation: F,
        dependencies: &[String],
    ) -> LoadResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.bus
            .wait_all_ready(dependencies, self.dependency_timeout)
            .await
            .map_err(|e| match e {
                BusError::WaitTimeout { unready } => LoadError::DependencyTimeout {
                    module: name.to_string(),
                    unready,
                },
                BusError::WaitCancelled => LoadError::DependencyWaitCancelled {
                    module: name.to_string(),
                },
            })?;

        self.load(name, operation).await
    }

    pub fn status(&self, name: &str) -> LoadStatus {
        self.records
            .get(name)
            .map_or(LoadStatus::NotStarted, |record| record.status())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.status(name) == LoadStatus::Loaded
    }

    pub fn is_loading(&self, name: &str) -> bool {
        self.status(name) == LoadStatus::Loading
    }

    /// The error of the last attempt, if that attempt failed.
    pub fn get_error(&self, name: &str) -> Option<LoadError> {
        self.records.get(name).and_then(|record| match &*record {
            ModuleRecord::Failed(e) => Some(e.clone()),
            _ => None,
        })
    }

    pub fn bus(&self) -> &ReadinessBus {
        &self.bus
    }
}

#[derive(Error, Debug, Clone)]
pub enum LoadError {
    #[error("Failed to load module {module}: {source}")]
    LoadFailure {
        module: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("Timeout waiting for dependencies of {module}: {}", unready.join(", "))]
    DependencyTimeout { module: String, unready: Vec<String> },

    #[error("Dependency wait for {module} cancelled by bus reset")]
    DependencyWaitCancelled { module: String },

    #[error("Load task for {module} aborted: {message}")]
    TaskAborted { module: String, message: String },
}

pub type LoadResult<T> = Result<T, LoadError>;
