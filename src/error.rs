use thiserror::Error;

use crate::config::ConfigError;
use crate::event_bus::BusError;
use crate::graph::GraphError;
use crate::module_loader::LoadError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Load error: {0}")]
    Load(#[from] LoadError),
    // dependency configuration
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type InternalResult<T> = Result<T, Error>;
