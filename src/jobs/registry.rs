//! Job registry.
//!
//! Jobs are declared as YAML manifests in a directory, one file per job:
//!
//! ```yaml
//! # jobs/sendWelcomeEmail.yaml
//! handler: log
//! description: Greets a newly registered user.
//! ```
//!
//! The job name defaults to the file stem and can be overridden with
//! `name:`. `handler:` selects a compiled-in handler from the
//! `HandlerCatalog`. A name missing from the registry is a dispatch-time
//! error for the worker, not a load-time error, since workers may run
//! different subsets of jobs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use super::builtin::{BroadcastJob, LogJob, BROADCAST_KIND, LOG_KIND};
use super::JobHandler;
use crate::broker::Broker;
use crate::dispatch::{Dispatcher, JobDispatcher};

/// Errors loading job definitions.
#[derive(Debug, thiserror::Error)]
pub enum RegistryLoadError {
    #[error("Cannot read jobs directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot read job definition {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed job definition {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Job definition {path} has no usable name")]
    MissingName { path: PathBuf },

    #[error("Job '{job}' uses unknown handler '{handler}'")]
    UnknownHandler { job: String, handler: String },

    #[error("Job '{job}' is defined more than once")]
    Duplicate { job: String },
}

/// On-disk job definition.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobManifest {
    name: Option<String>,
    handler: String,
    description: Option<String>,
}

/// Compiled-in handlers that manifests can refer to by kind.
#[derive(Default, Clone)]
pub struct HandlerCatalog {
    kinds: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in `log` and `broadcast` kinds.
    ///
    /// `broadcast` relays payloads onto `bridge_exchange`.
    pub fn builtin(broker: Arc<dyn Broker>, bridge_exchange: impl Into<String>) -> Self {
        Self::new()
            .with(LOG_KIND, Arc::new(LogJob))
            .with(
                BROADCAST_KIND,
                Arc::new(BroadcastJob::new(broker, bridge_exchange)),
            )
    }

    pub fn with(mut self, kind: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.kinds.insert(kind.into(), handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.kinds.get(kind).cloned()
    }
}

/// One registered job.
#[derive(Clone)]
pub struct RegisteredJob {
    pub name: String,
    pub description: Option<String>,
    pub handler: Arc<dyn JobHandler>,
}

/// Immutable map from job name to handler.
///
/// Lookups are case-sensitive.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, RegisteredJob>,
}

impl JobRegistry {
    pub fn builder() -> JobRegistryBuilder {
        JobRegistryBuilder::default()
    }

    /// Load every `*.yaml` / `*.yml` manifest in `dir` (not recursive).
    pub fn load(
        dir: impl AsRef<Path>,
        catalog: &HandlerCatalog,
    ) -> Result<Self, RegistryLoadError> {
        let dir = dir.as_ref();
        let read_dir_error = |source| RegistryLoadError::ReadDir {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(read_dir_error)? {
            let path = entry.map_err(read_dir_error)?.path();
            if path.is_file() && is_manifest(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut builder = Self::builder();
        for path in paths {
            let manifest = read_manifest(&path)?;
            let name = manifest
                .name
                .or_else(|| file_stem(&path))
                .filter(|name| !name.trim().is_empty())
                .ok_or_else(|| RegistryLoadError::MissingName { path: path.clone() })?;

            let handler = catalog.get(&manifest.handler).ok_or_else(|| {
                RegistryLoadError::UnknownHandler {
                    job: name.clone(),
                    handler: manifest.handler.clone(),
                }
            })?;

            debug!(job = %name, handler = %manifest.handler, path = %path.display(), "Loaded job definition");
            builder = builder.register_described(name, manifest.description, handler)?;
        }

        let registry = builder.build();
        info!(
            dir = %dir.display(),
            jobs = ?registry.names(),
            "Job registry loaded"
        );
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn JobHandler>> {
        self.jobs.get(name).map(|job| &job.handler)
    }

    pub fn job(&self, name: &str) -> Option<&RegisteredJob> {
        self.jobs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered job names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Per-job dispatch helper with the job's name baked in.
    pub fn dispatcher_for(
        &self,
        name: &str,
        dispatcher: Arc<Dispatcher>,
    ) -> Option<JobDispatcher> {
        self.jobs
            .get(name)
            .map(|job| JobDispatcher::new(dispatcher, job.name.clone()))
    }
}

/// Builder for programmatic registration.
#[derive(Default)]
pub struct JobRegistryBuilder {
    jobs: HashMap<String, RegisteredJob>,
}

impl JobRegistryBuilder {
    pub fn register(
        self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, RegistryLoadError> {
        self.register_described(name, None, handler)
    }

    pub fn register_described(
        mut self,
        name: impl Into<String>,
        description: Option<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, RegistryLoadError> {
        let name = name.into();
        if self.jobs.contains_key(&name) {
            return Err(RegistryLoadError::Duplicate { job: name });
        }
        self.jobs.insert(
            name.clone(),
            RegisteredJob {
                name,
                description,
                handler,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> JobRegistry {
        JobRegistry { jobs: self.jobs }
    }
}

fn is_manifest(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

fn read_manifest(path: &Path) -> Result<JobManifest, RegistryLoadError> {
    let contents = std::fs::read_to_string(path).map_err(|source| RegistryLoadError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| RegistryLoadError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::dispatch::DispatchRoute;
    use std::fs;

    fn catalog() -> HandlerCatalog {
        HandlerCatalog::builtin(Arc::new(MemoryBroker::new()), "websocket")
    }

    #[test]
    fn test_load_uses_file_stem_and_explicit_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sendWelcomeEmail.yaml"), "handler: log\n").unwrap();
        fs::write(
            dir.path().join("relay.yml"),
            "name: broadcast\nhandler: broadcast\ndescription: Relay to clients\n",
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "not a job").unwrap();

        let registry = JobRegistry::load(dir.path(), &catalog()).unwrap();

        assert_eq!(registry.names(), vec!["broadcast", "sendWelcomeEmail"]);
        assert_eq!(
            registry.job("broadcast").unwrap().description.as_deref(),
            Some("Relay to clients")
        );
    }

    #[test]
    fn test_lookup_is_case_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sendWelcomeEmail.yaml"), "handler: log\n").unwrap();

        let registry = JobRegistry::load(dir.path(), &catalog()).unwrap();

        assert!(registry.get("sendWelcomeEmail").is_some());
        assert!(registry.get("sendwelcomeemail").is_none());
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let result = JobRegistry::load(&missing, &catalog());
        assert!(matches!(result, Err(RegistryLoadError::ReadDir { .. })));
    }

    #[test]
    fn test_malformed_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.yaml"), "handler: [log\n").unwrap();

        let result = JobRegistry::load(dir.path(), &catalog());
        assert!(matches!(result, Err(RegistryLoadError::Malformed { .. })));
    }

    #[test]
    fn test_unknown_field_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("typo.yaml"), "handlr: log\n").unwrap();

        let result = JobRegistry::load(dir.path(), &catalog());
        assert!(matches!(result, Err(RegistryLoadError::Malformed { .. })));
    }

    #[test]
    fn test_unknown_handler_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("mail.yaml"), "handler: smtp\n").unwrap();

        let result = JobRegistry::load(dir.path(), &catalog());
        assert!(matches!(
            result,
            Err(RegistryLoadError::UnknownHandler { ref job, ref handler })
                if job == "mail" && handler == "smtp"
        ));
    }

    #[test]
    fn test_duplicate_names_fail() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.yaml"), "name: same\nhandler: log\n").unwrap();
        fs::write(dir.path().join("b.yaml"), "name: same\nhandler: log\n").unwrap();

        let result = JobRegistry::load(dir.path(), &catalog());
        assert!(matches!(result, Err(RegistryLoadError::Duplicate { ref job }) if job == "same"));
    }

    #[test]
    fn test_empty_directory_loads_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::load(dir.path(), &catalog()).unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_for_registered_job() {
        let broker = MemoryBroker::new();
        let registry = JobRegistry::builder()
            .register("cleanup", Arc::new(LogJob))
            .unwrap()
            .build();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(broker.clone()),
            DispatchRoute::default(),
        ));

        assert!(registry
            .dispatcher_for("missing", dispatcher.clone())
            .is_none());

        let job = registry.dispatcher_for("cleanup", dispatcher).unwrap();
        job.dispatch(serde_json::json!({})).await.unwrap();
        assert_eq!(broker.queue_depth("default"), Some(1));
    }
}
