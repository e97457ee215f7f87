use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::access::AccessToken;
use crate::backend::context::BackendContext;
use crate::backend::host::HostBackend;
use crate::backend::multi::MultiBackendRouter;
use crate::backend::slurm::SlurmBackend;
use crate::backend::SharedBackend;
use crate::broker::{Selection, SelectionMode};
use crate::config::{BackendConfig, BackendKind, RouterConfig};
use crate::error::{GridError, Result};

/// Builds one backend from its configuration and shared helpers.
pub type BackendConstructor = fn(&BackendConfig, BackendContext) -> SharedBackend;

/// Maps backend kinds to constructors. Built once at startup.
pub struct BackendRegistry {
    constructors: BTreeMap<&'static str, BackendConstructor>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(BackendKind::Host.as_str(), build_host);
        registry.register(BackendKind::Slurm.as_str(), build_slurm);
        registry
    }
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, kind: &'static str, constructor: BackendConstructor) {
        self.constructors.insert(kind, constructor);
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }

    pub fn create(
        &self,
        config: &BackendConfig,
        workdir: &Path,
        token: Arc<AccessToken>,
    ) -> Result<SharedBackend> {
        let kind = config.kind.as_str();
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| GridError::UnknownBackend(kind.to_string()))?;
        let ctx = BackendContext::new(workdir, config.runner(), token);
        tracing::debug!(backend = %config.name, kind, "Created backend");
        Ok(constructor(config, ctx))
    }

    /// One backend as is; several behind a [`MultiBackendRouter`].
    pub fn build(
        &self,
        configs: &[BackendConfig],
        router: &RouterConfig,
        seed: Option<u64>,
        workdir: &Path,
        token: Arc<AccessToken>,
    ) -> Result<SharedBackend> {
        let default_index = configs.iter().position(|c| c.default).unwrap_or(0);
        let Some(default_config) = configs.get(default_index) else {
            return Err(GridError::Config("no backend configured".to_string()));
        };
        let default = self.create(default_config, workdir, token.clone())?;
        if configs.len() == 1 {
            return Ok(default);
        }

        let mut multi = MultiBackendRouter::new(default)
            .threaded(router.threaded)
            .with_selection(Selection::new(SelectionMode::Random, 1, seed));
        for (index, config) in configs.iter().enumerate() {
            if index != default_index {
                multi = multi.with_backend(self.create(config, workdir, token.clone())?)?;
            }
        }
        tracing::info!(
            backends = ?multi.backend_names(),
            default = multi.default_backend(),
            threaded = multi.is_threaded(),
            "Routing across backends"
        );
        Ok(Arc::new(multi))
    }
}

fn build_host(config: &BackendConfig, ctx: BackendContext) -> SharedBackend {
    let mut backend = HostBackend::new(&config.name, ctx);
    if let Some(secs) = config.min_interval {
        backend = backend.with_min_interval(Duration::from_secs(secs));
    }
    Arc::new(backend)
}

fn build_slurm(config: &BackendConfig, ctx: BackendContext) -> SharedBackend {
    let mut backend = SlurmBackend::new(&config.name, ctx);
    if let Some(secs) = config.min_interval {
        backend = backend.with_min_interval(Duration::from_secs(secs));
    }
    Arc::new(backend)
}
