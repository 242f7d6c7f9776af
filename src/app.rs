//! Wiring: build the engine, store and controller from a [`Config`].

use std::sync::Arc;

use crate::accounts::{AccountStore, InMemoryAccountStore};
use crate::artifacts::ArtifactStore;
use crate::config::Config;
use crate::conversion::JobController;
use crate::events::EventBus;
use webmforge_common::Result;
use webmforge_engine::{Backend, ProcessEngine, SandboxEngine, ToolRegistry, TranscodeEngine};

/// Broadcast buffer for live event subscribers.
const EVENT_CAPACITY: usize = 256;

/// Everything a front end (server or CLI) needs.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub controller: Arc<JobController>,
}

/// Select the backend named in the configuration. Scratch space for each
/// invocation lives under the temp root.
pub fn build_engine(config: &Config) -> Result<Arc<dyn TranscodeEngine>> {
    let engine_cfg = &config.engine;
    let scratch = config.storage.temp_dir.clone();

    let engine: Arc<dyn TranscodeEngine> = match engine_cfg.backend {
        Backend::Process => {
            let registry = ToolRegistry::discover(engine_cfg.ffmpeg_path.as_deref());
            Arc::new(
                ProcessEngine::from_registry(&registry)
                    .with_timeout(engine_cfg.timeout())
                    .with_scratch_root(scratch),
            )
        }
        Backend::Sandbox => Arc::new(
            SandboxEngine::new(engine_cfg.wasm_module.clone())?
                .with_timeout(engine_cfg.timeout())
                .with_scratch_root(scratch),
        ),
    };

    tracing::info!(backend = %engine.backend(), "Execution backend selected");
    Ok(engine)
}

pub fn build_services(config: Config) -> Result<Services> {
    build_services_with(config, Arc::new(InMemoryAccountStore::new()))
}

/// Like [`build_services`] with an injected account store.
pub fn build_services_with(config: Config, accounts: Arc<dyn AccountStore>) -> Result<Services> {
    let engine = build_engine(&config)?;
    let store = Arc::new(ArtifactStore::from_config(&config.storage)?);
    let events = Arc::new(EventBus::new(EVENT_CAPACITY));
    let controller = Arc::new(JobController::new(&config, engine, store, accounts, events));

    Ok(Services {
        config: Arc::new(config),
        controller,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.input_dir = dir.join("uploads");
        config.storage.output_dir = dir.join("output");
        config.storage.temp_dir = dir.join("temp");
        config
    }

    #[test]
    fn builds_process_backend_and_roots() {
        let dir = tempfile::tempdir().unwrap();
        let services = build_services(config_in(dir.path())).unwrap();
        assert_eq!(services.controller.engine().backend(), Backend::Process);
        assert!(dir.path().join("uploads").is_dir());
        assert!(dir.path().join("output").is_dir());
        assert!(dir.path().join("temp").is_dir());
        assert_eq!(services.controller.strategies().len(), 3);
    }

    #[test]
    fn sandbox_backend_defers_module_loading() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.engine.backend = Backend::Sandbox;
        config.engine.wasm_module = dir.path().join("missing.wasm");
        let engine = build_engine(&config).unwrap();
        assert_eq!(engine.backend(), Backend::Sandbox);
    }
}
