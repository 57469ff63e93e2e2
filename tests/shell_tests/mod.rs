mod bridge_tests;
mod mount_tests;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use shell_loader::{
    config::{LoadPriority, ModuleConfig, ShellConfig},
    event_bus::BoxError,
    shell::ModuleFetcher,
};

/// Fetcher that records when each fetch starts and finishes.
#[derive(Default)]
pub struct RecordingFetcher {
    delay: Duration,
    failing: Vec<String>,
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
}

impl RecordingFetcher {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn failing(delay: Duration, failing: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            delay,
            failing: failing.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModuleFetcher for RecordingFetcher {
    async fn fetch(&self, name: &str) -> Result<(), BoxError> {
        self.started.lock().unwrap().push(name.to_string());
        tokio::time::sleep(self.delay).await;
        if self.failing.iter().any(|f| f == name) {
            return Err(format!("{} failed to initialize", name).into());
        }
        self.finished.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

pub fn crm_config() -> ShellConfig {
    ShellConfig::default()
        .with_module(ModuleConfig::new("dashboard", &[]).with_priority(LoadPriority::Critical))
        .with_module(ModuleConfig::new("contacts", &["dashboard"]))
        .with_module(ModuleConfig::new("companies", &["contacts"]))
}

pub fn position(order: &[String], name: &str) -> usize {
    order
        .iter()
        .position(|n| n == name)
        .unwrap_or_else(|| panic!("{} missing from {:?}", name, order))
}
