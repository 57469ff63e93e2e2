//! # Shell Context
//!
//! The [`ShellContext`] owns everything the host shell needs to mount modules:
//! the validated dependency graph, the [`ReadinessBus`] and the
//! [`ModuleLoadManager`]. It is created once at shell startup and torn down
//! explicitly; consumers receive it by reference instead of reaching for a
//! global.
//!
//! Modules never see the context itself. Each one is handed a [`ShellBridge`]
//! at mount time: a small versioned interface onto the bus that lets code
//! built without any dependency on this crate announce readiness and exchange
//! events with the shell.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures::future::try_join_all;
use mockall::automock;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::ShellConfig,
    event_bus::{BoxError, CallbackResult, ReadinessBus, Subscription},
    event_types::EventType,
    graph::DependencyGraph,
    module_loader::{LoadResult, ModuleLoadManager},
    InternalResult,
};

/// Version of the [`ShellBridge`] interface handed to modules.
pub const BRIDGE_VERSION: u32 = 1;

/// Fetches and instantiates a module's remote artifact.
///
/// This is the only boundary into the remote-module mechanism; the shell
/// treats it as opaque.
#[automock]
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<(), BoxError>;
}

pub struct ShellContext {
    config: ShellConfig,
    graph: DependencyGraph,
    load_order: Vec<String>,
    bus: ReadinessBus,
    loader: ModuleLoadManager,
    installed: Arc<AtomicBool>,
    error_log: Subscription,
}

impl ShellContext {
    /// Validates the dependency configuration and sets up a fresh bus and
    /// load manager.
    ///
    /// # Errors
    ///
    /// `Error::Graph` if the configured dependencies contain a cycle.
    pub fn new(config: ShellConfig) -> InternalResult<Self> {
        let graph = DependencyGraph::from_config(&config);
        let load_order = graph.compute_load_order()?;

        let bus = ReadinessBus::new(config.wait_timeout);
        let loader = ModuleLoadManager::new(bus.clone(), config.dependency_timeout);

        let error_log = bus.subscribe(EventType::ModuleError.as_str(), log_module_error);

        info!(
            "Shell context created with {} module(s): {}",
            graph.len(),
            load_order.join(", ")
        );
        Ok(Self {
            config,
            graph,
            load_order,
            bus,
            loader,
            installed: Arc::new(AtomicBool::new(true)),
            error_log,
        })
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn bus(&self) -> &ReadinessBus {
        &self.bus
    }

    pub fn loader(&self) -> &ModuleLoadManager {
        &self.loader
    }

    /// Modules in dependency order, including undeclared dependencies.
    pub fn load_order(&self) -> &[String] {
        &self.load_order
    }

    /// A bridge for a module to talk to this shell.
    pub fn bridge(&self) -> ShellBridge {
        ShellBridge {
            version: BRIDGE_VERSION,
            bus: self.bus.clone(),
            installed: self.installed.clone(),
        }
    }

    /// Declared modules whose priority asks for preloading, in load order.
    pub fn critical_modules(&self) -> Vec<String> {
        self.load_order
            .iter()
            .filter(|name| {
                self.config
                    .module(name)
                    .is_some_and(|module| module.priority.is_preloaded())
            })
            .cloned()
            .collect()
    }

    /// Mounts `name` once its configured dependencies are ready.
    ///
    /// On success `module:ready` is emitted; on failure `module:error` is
    /// emitted with the module name and the error message, and the error is
    /// returned.
    #[instrument(skip(self, fetcher))]
    pub async fn mount(&self, name: &str, fetcher: Arc<dyn ModuleFetcher>) -> LoadResult<()> {
        let dependencies = self.graph.dependencies_of(name).to_vec();
        if !self.graph.contains(name) {
            warn!("Mounting undeclared module {}", name);
        }

        let module = name.to_string();
        let operation = move || async move { fetcher.fetch(&module).await };

        match self
            .loader
            .load_with_dependencies(name, operation, &dependencies)
            .await
        {
            Ok(()) => {
                self.bus
                    .emit(EventType::ModuleReady.as_str(), &json!({ "module": name }));
                Ok(())
            }
            Err(e) => {
                self.bus.emit(
                    EventType::ModuleError.as_str(),
                    &json!({ "module": name, "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    /// Mounts every declared module concurrently. Dependency gating makes each
    /// module start only after the modules it depends on are ready.
    pub async fn mount_all(&self, fetcher: Arc<dyn ModuleFetcher>) -> LoadResult<()> {
        let declared: Vec<&String> = self
            .load_order
            .iter()
            .filter(|name| self.graph.contains(name))
            .collect();
        debug!("Mounting {} module(s)", declared.len());

        try_join_all(
            declared
                .into_iter()
                .map(|name| self.mount(name, fetcher.clone())),
        )
        .await?;
        Ok(())
    }

    /// Mounts the modules returned by [`Self::critical_modules`].
    pub async fn preload_critical(&self, fetcher: Arc<dyn ModuleFetcher>) -> LoadResult<()> {
        let critical = self.critical_modules();
        info!("Preloading critical modules: {}", critical.join(", "));

        try_join_all(
            critical
                .iter()
                .map(|name| self.mount(name, fetcher.clone())),
        )
        .await?;
        Ok(())
    }

    /// Detaches every bridge handed out, drops the shell's own error logging
    /// and resets the bus.
    ///
    /// Loads still in flight run to completion and update their records, but
    /// their readiness lands on a bus nobody is attached to.
    pub fn teardown(self) {
        self.installed.store(false, Ordering::SeqCst);
        if !self.error_log.unsubscribe() {
            warn!("Module error logging was already unsubscribed");
        }
        self.bus.reset();
        info!("Shell context torn down");
    }
}

fn log_module_error(data: &Value) -> CallbackResult {
    error!("Module error: {}", data);
    Ok(())
}

/// The interface a mounted module uses to reach the shell.
///
/// Exposes exactly `announce_ready`, `subscribe`, `emit` and `is_ready`. Once
/// the owning [`ShellContext`] is torn down the bridge is detached: queries
/// report not ready, announcements and emissions are dropped, and
/// subscriptions are inert.
#[derive(Clone)]
pub struct ShellBridge {
    version: u32,
    bus: ReadinessBus,
    installed: Arc<AtomicBool>,
}

impl ShellBridge {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_attached(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    pub fn announce_ready(&self, name: &str) {
        if !self.is_attached() {
            warn!("Bridge detached; ignoring readiness of {}", name);
            return;
        }
        self.bus.announce_ready(name);
    }

    pub fn subscribe<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) -> CallbackResult + Send + Sync + 'static,
    {
        if !self.is_attached() {
            warn!("Bridge detached; subscription to {} is inert", event);
            return Subscription::detached(event);
        }
        self.bus.subscribe(event, callback)
    }

    pub fn emit(&self, event: &str, data: &Value) {
        if !self.is_attached() {
            warn!("Bridge detached; dropping event {}", event);
            return;
        }
        self.bus.emit(event, data);
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.is_attached() && self.bus.is_ready(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadPriority, ModuleConfig};
    use crate::Error;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn config() -> ShellConfig {
        ShellConfig::default()
            .with_module(ModuleConfig::new("dashboard", &[]).with_priority(LoadPriority::High))
            .with_module(ModuleConfig::new("contacts", &["dashboard"]))
            .with_module(ModuleConfig::new("companies", &["contacts"]))
    }

    #[test]
    fn test_cyclic_configuration_is_rejected() {
        let config = ShellConfig::default()
            .with_module(ModuleConfig::new("a", &["b"]))
            .with_module(ModuleConfig::new("b", &["a"]));
        assert!(matches!(ShellContext::new(config), Err(Error::Graph(_))));
    }

    #[test]
    fn test_critical_modules() {
        let shell = ShellContext::new(ShellConfig::builtin()).unwrap();
        assert_eq!(shell.critical_modules(), vec!["dashboard", "monitoring"]);
    }

    #[tokio::test]
    async fn test_mount_all_fetches_each_module_once() {
        let shell = ShellContext::new(config()).unwrap();
        let mut fetcher = MockModuleFetcher::new();
        fetcher.expect_fetch().times(3).returning(|_| Ok(()));

        shell.mount_all(Arc::new(fetcher)).await.unwrap();

        for name in ["dashboard", "contacts", "companies"] {
            assert!(shell.loader().is_loaded(name));
            assert!(shell.bus().is_ready(name));
        }
    }

    #[tokio::test]
    async fn test_mount_failure_emits_module_error() {
        let shell = ShellContext::new(config()).unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let _subscription = shell
            .bridge()
            .subscribe(EventType::ModuleError.as_str(), move |data| {
                sink.lock().unwrap().push(data.clone());
                Ok(())
            });

        let mut fetcher = MockModuleFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(|_| Err("chunk load failed".into()));

        let result = shell.mount("dashboard", Arc::new(fetcher)).await;
        assert!(result.is_err());

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["module"], "dashboard");
        assert!(errors[0]["error"]
            .as_str()
            .unwrap()
            .contains("chunk load failed"));
    }

    #[test]
    fn test_teardown_releases_error_logging() {
        let shell = ShellContext::new(config()).unwrap();
        let bus = shell.bus().clone();
        let module_error = EventType::ModuleError.as_str();
        assert_eq!(bus.subscriber_count(module_error), 1);

        // A module's own subscription survives until the reset.
        let module_subscription = shell.bridge().subscribe(module_error, |_| Ok(()));
        assert_eq!(bus.subscriber_count(module_error), 2);

        shell.teardown();
        assert_eq!(bus.subscriber_count(module_error), 0);
        assert!(!module_subscription.unsubscribe());
    }

    #[test]
    fn test_bridge_is_inert_after_teardown() {
        let shell = ShellContext::new(config()).unwrap();
        let bridge = shell.bridge();
        assert_eq!(bridge.version(), BRIDGE_VERSION);

        bridge.announce_ready("dashboard");
        assert!(bridge.is_ready("dashboard"));

        shell.teardown();
        assert!(!bridge.is_attached());
        assert!(!bridge.is_ready("dashboard"));

        bridge.announce_ready("contacts");
        assert!(!bridge.is_ready("contacts"));
        assert!(!bridge.subscribe("nav:change", |_| Ok(())).unsubscribe());
    }
}
