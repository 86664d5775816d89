//! Name-keyed collection of supervised services.
//!
//! The registry owns one [`Supervisor`] per service and mirrors the live spec
//! set into a [`ConfigStore`] after every create and delete.

use crate::config::{ServiceSpec, SpecSet};
use crate::error::{HotifyError, Result};
use crate::git::GitSource;
use crate::proxy::ProxyPublisher;
use crate::service::ServiceSummary;
use crate::store::ConfigStore;
use crate::supervisor::{Supervisor, SupervisorOptions};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub struct Registry {
    services: RwLock<BTreeMap<String, Arc<Supervisor>>>,
    /// Serializes snapshot-and-save so saves land in order
    persist: tokio::sync::Mutex<()>,
    store: Arc<dyn ConfigStore>,
    git: Arc<dyn GitSource>,
    proxy: Arc<dyn ProxyPublisher>,
    services_path: PathBuf,
    options: SupervisorOptions,
    /// Set by stop_all; creates are refused afterwards
    closed: AtomicBool,
}

impl Registry {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        git: Arc<dyn GitSource>,
        proxy: Arc<dyn ProxyPublisher>,
        services_path: impl Into<PathBuf>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            services: RwLock::new(BTreeMap::new()),
            persist: tokio::sync::Mutex::new(()),
            store,
            git,
            proxy,
            services_path: services_path.into(),
            options,
            closed: AtomicBool::new(false),
        }
    }

    pub fn services_path(&self) -> &Path {
        &self.services_path
    }

    /// Register every persisted service and bring them up concurrently.
    ///
    /// A service that fails to come up stays registered so it can be
    /// retried through start or update; only a store failure is an error.
    pub async fn init(&self) -> Result<()> {
        let specs = self.store.load()?;
        info!(services = specs.len(), "Loading services");

        let supervisors: Vec<Arc<Supervisor>> = {
            let mut services = self.services.write();
            specs
                .into_values()
                .map(|spec| {
                    let supervisor = self.supervisor_for(spec);
                    services.insert(supervisor.name().to_string(), Arc::clone(&supervisor));
                    supervisor
                })
                .collect()
        };

        let mut tasks = JoinSet::new();
        for supervisor in supervisors {
            tasks.spawn(async move {
                let result = supervisor.provision().await;
                (supervisor, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((supervisor, Ok(()))) => {
                    info!(service = %supervisor.name(), "Service started");
                }
                Ok((supervisor, Err(e))) => {
                    error!(service = %supervisor.name(), error = %e, "Failed to bring up service");
                }
                Err(e) => {
                    error!(error = %e, "Service bring-up task failed");
                }
            }
        }

        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Supervisor>> {
        self.services.read().get(name).cloned()
    }

    /// Summaries ordered by name
    pub fn list(&self) -> Vec<ServiceSummary> {
        self.services.read().values().map(|s| s.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    /// Current spec set, as persisted
    pub fn specs(&self) -> SpecSet {
        self.services
            .read()
            .iter()
            .map(|(name, s)| (name.clone(), s.spec().clone()))
            .collect()
    }

    /// Register, persist and provision a new service.
    ///
    /// On any failure after registration the service is stopped, removed and
    /// the spec set persisted again, leaving the name free.
    pub async fn create(&self, mut spec: ServiceSpec) -> Result<Arc<Supervisor>> {
        spec.normalize();
        spec.validate().map_err(HotifyError::InvalidRequest)?;

        let supervisor = {
            let mut services = self.services.write();
            if self.closed.load(Ordering::SeqCst) {
                return Err(HotifyError::ShuttingDown(spec.name));
            }
            if services.contains_key(&spec.name) {
                return Err(HotifyError::Conflict(spec.name));
            }
            let supervisor = self.supervisor_for(spec);
            services.insert(supervisor.name().to_string(), Arc::clone(&supervisor));
            supervisor
        };

        info!(service = %supervisor.name(), "Creating service");
        let had_checkout = tokio::fs::try_exists(supervisor.working_dir())
            .await
            .unwrap_or(true);

        let result = match self.persist().await {
            Ok(()) => supervisor.provision().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            error!(service = %supervisor.name(), error = %e, "Failed to create service");
            self.discard(&supervisor, !had_checkout).await;
            return Err(e);
        }

        Ok(supervisor)
    }

    /// Stop and forget a service.
    ///
    /// The record is removed even if stopping reports an error; that error is
    /// returned after the spec set has been saved.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let supervisor = self
            .lookup(name)
            .ok_or_else(|| HotifyError::NotFound(name.to_string()))?;

        info!(service = name, "Deleting service");
        let retired = supervisor.retire().await;

        if !self.remove_record(&supervisor) {
            // lost a race with a concurrent delete
            return Err(HotifyError::NotFound(name.to_string()));
        }

        self.persist().await?;
        retired
    }

    /// Shut every service down for good, logging failures.
    ///
    /// Operations queued behind the sweep fail instead of launching, and new
    /// services can no longer be created.
    pub async fn stop_all(&self) {
        let supervisors: Vec<Arc<Supervisor>> = {
            let services = self.services.write();
            self.closed.store(true, Ordering::SeqCst);
            services.values().cloned().collect()
        };
        info!(services = supervisors.len(), "Stopping all services");

        let mut tasks = JoinSet::new();
        for supervisor in supervisors {
            tasks.spawn(async move {
                if let Err(e) = supervisor.shutdown().await {
                    warn!(service = %supervisor.name(), error = %e, "Error stopping service");
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Stop task failed");
            }
        }
    }

    fn supervisor_for(&self, spec: ServiceSpec) -> Arc<Supervisor> {
        let working_dir = self.services_path.join(&spec.name);
        Supervisor::new(
            spec,
            working_dir,
            Arc::clone(&self.git),
            Arc::clone(&self.proxy),
            self.options,
        )
    }

    /// Remove exactly this record; false if it is no longer registered
    fn remove_record(&self, supervisor: &Arc<Supervisor>) -> bool {
        let mut services = self.services.write();
        match services.get(supervisor.name()) {
            Some(current) if Arc::ptr_eq(current, supervisor) => {
                services.remove(supervisor.name());
                true
            }
            _ => false,
        }
    }

    async fn discard(&self, supervisor: &Arc<Supervisor>, remove_checkout: bool) {
        if let Err(e) = supervisor.retire().await {
            warn!(service = %supervisor.name(), error = %e, "Error stopping failed service");
        }
        self.remove_record(supervisor);

        if remove_checkout {
            if let Err(e) = tokio::fs::remove_dir_all(supervisor.working_dir()).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(service = %supervisor.name(), error = %e, "Failed to remove checkout");
                }
            }
        }

        if let Err(e) = self.persist().await {
            error!(service = %supervisor.name(), error = %e, "Failed to save configuration");
        }
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist.lock().await;
        let specs = self.specs();
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(&specs))
            .await
            .map_err(|e| HotifyError::Config(format!("save task failed: {e}")))?
    }
}
