#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use sombra_ids::{IdGenerator, IdGeneratorOptions, IdMonitor, NoopMonitor, Result};

/// Installs a fmt subscriber honouring `RUST_LOG`; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn open(path: &Path) -> Result<IdGenerator> {
    open_with(path, IdGeneratorOptions::default(), Arc::new(NoopMonitor))
}

pub fn open_with(path: &Path, options: IdGeneratorOptions, monitor: Arc<dyn IdMonitor>) -> Result<IdGenerator> {
    init_tracing();
    IdGenerator::open(path, options, monitor, 0)
}
