use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::adapter::{LocalWorker, RemoteEndpoint, RemoteWorker, Worker, WorkerHandler};
use crate::config::{EndpointConfig, WorkerConfig};
use crate::contract::TransportMode;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no worker registered for role `{0}`")]
pub struct UnknownWorkerError(pub String);

/// Where a role's calls go: a local handler reference or a remote endpoint id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDescriptor {
    pub mode: TransportMode,
    pub target: String,
}

pub struct RegisteredWorker {
    pub role: String,
    pub descriptor: TransportDescriptor,
    pub endpoint: Option<RemoteEndpoint>,
    pub worker: Arc<dyn Worker>,
}

impl std::fmt::Debug for RegisteredWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredWorker")
            .field("role", &self.role)
            .field("descriptor", &self.descriptor)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// In-process handlers available to `local` workers, keyed by handler reference.
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn WorkerHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, handler: Arc<dyn WorkerHandler>) -> Self {
        self.insert(name, handler);
        self
    }

    pub fn insert(&mut self, name: &str, handler: Arc<dyn WorkerHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkerHandler>> {
        self.handlers.get(name).cloned()
    }
}

/// Collects registrations at startup. Consumed by [`RegistryBuilder::build`],
/// after which the topology cannot change.
#[derive(Default)]
pub struct RegistryBuilder {
    workers: Vec<RegisteredWorker>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_local(
        self,
        role: &str,
        handler_ref: &str,
        handler: Arc<dyn WorkerHandler>,
    ) -> Result<Self> {
        self.register(
            role,
            TransportDescriptor {
                mode: TransportMode::Local,
                target: handler_ref.to_string(),
            },
            None,
            Arc::new(LocalWorker::new(handler)),
        )
    }

    pub fn register_remote(
        self,
        role: &str,
        client: reqwest::Client,
        endpoint: RemoteEndpoint,
    ) -> Result<Self> {
        let descriptor = TransportDescriptor {
            mode: TransportMode::Remote,
            target: endpoint.id.clone(),
        };
        let worker = Arc::new(RemoteWorker::new(client, endpoint.clone()));
        self.register(role, descriptor, Some(endpoint), worker)
    }

    fn register(
        mut self,
        role: &str,
        descriptor: TransportDescriptor,
        endpoint: Option<RemoteEndpoint>,
        worker: Arc<dyn Worker>,
    ) -> Result<Self> {
        let role = role.trim();
        if role.is_empty() {
            return Err(AppError::Registry("worker role must not be empty".to_string()));
        }
        if self.workers.iter().any(|w| w.role == role) {
            return Err(AppError::Registry(format!(
                "worker role `{role}` registered twice"
            )));
        }

        tracing::debug!(
            role = role,
            mode = %descriptor.mode,
            target = %descriptor.target,
            "Registering worker"
        );

        self.workers.push(RegisteredWorker {
            role: role.to_string(),
            descriptor,
            endpoint,
            worker,
        });
        Ok(self)
    }

    pub fn build(self) -> WorkerRegistry {
        WorkerRegistry {
            workers: self.workers,
        }
    }
}

/// Read-only role -> transport table shared by every run.
pub struct WorkerRegistry {
    workers: Vec<RegisteredWorker>,
}

impl WorkerRegistry {
    /// Build the registry from configuration, in configuration order.
    pub fn from_config(
        workers: &[WorkerConfig],
        endpoints: &[EndpointConfig],
        handlers: &HandlerTable,
        client: reqwest::Client,
    ) -> Result<Self> {
        let mut builder = RegistryBuilder::new();

        for entry in workers {
            builder = match entry.mode {
                TransportMode::Local => {
                    let handler = handlers.get(&entry.target).ok_or_else(|| {
                        AppError::Config(format!(
                            "worker `{}` references unknown handler `{}`",
                            entry.role, entry.target
                        ))
                    })?;
                    builder.register_local(&entry.role, &entry.target, handler)?
                }
                TransportMode::Remote => {
                    let endpoint = endpoints
                        .iter()
                        .find(|e| e.id == entry.target)
                        .ok_or_else(|| {
                            AppError::Config(format!(
                                "worker `{}` references unknown endpoint `{}`",
                                entry.role, entry.target
                            ))
                        })?;
                    builder.register_remote(&entry.role, client.clone(), endpoint.to_endpoint())?
                }
            };
        }

        let registry = builder.build();
        tracing::info!(workers = registry.len(), "Worker registry ready");
        Ok(registry)
    }

    pub fn resolve(&self, role: &str) -> std::result::Result<&RegisteredWorker, UnknownWorkerError> {
        self.workers
            .iter()
            .find(|w| w.role == role)
            .ok_or_else(|| UnknownWorkerError(role.to_string()))
    }

    pub fn contains(&self, role: &str) -> bool {
        self.workers.iter().any(|w| w.role == role)
    }

    /// Workers whose role is `base` or `base.<sub-check>`, in registration order.
    pub fn family(&self, base: &str) -> Vec<&RegisteredWorker> {
        self.workers
            .iter()
            .filter(|w| {
                w.role == base
                    || w
                        .role
                        .strip_prefix(base)
                        .is_some_and(|rest| rest.starts_with('.'))
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredWorker> {
        self.workers.iter()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::handler_fn;
    use crate::contract::WorkerReply;

    fn noop() -> Arc<dyn WorkerHandler> {
        handler_fn(|_req| async { Ok(WorkerReply::skipped("noop")) })
    }

    #[test]
    fn test_unknown_role_is_an_error() {
        let registry = RegistryBuilder::new()
            .register_local("qa", "noop", noop())
            .unwrap()
            .build();
        assert_eq!(
            registry.resolve("docs").unwrap_err(),
            UnknownWorkerError("docs".into())
        );
        assert_eq!(registry.resolve("qa").unwrap().descriptor.target, "noop");
    }

    #[test]
    fn test_duplicate_role_rejected() {
        let result = RegistryBuilder::new()
            .register_local("qa", "noop", noop())
            .unwrap()
            .register_local("qa", "other", noop());
        assert!(matches!(result, Err(AppError::Registry(_))));
    }

    #[test]
    fn test_family_keeps_registration_order() {
        let registry = RegistryBuilder::new()
            .register_local("audit.security", "noop", noop())
            .unwrap()
            .register_local("qa", "noop", noop())
            .unwrap()
            .register_local("audit", "noop", noop())
            .unwrap()
            .register_local("auditor", "noop", noop())
            .unwrap()
            .build();
        let roles: Vec<_> = registry.family("audit").iter().map(|w| w.role.as_str()).collect();
        assert_eq!(roles, vec!["audit.security", "audit"]);
    }

    #[test]
    fn test_from_config_resolves_handlers_and_endpoints() {
        let workers = vec![
            WorkerConfig {
                role: "audit".into(),
                mode: TransportMode::Local,
                target: "noop".into(),
            },
            WorkerConfig {
                role: "qa".into(),
                mode: TransportMode::Remote,
                target: "runtime-a".into(),
            },
        ];
        let endpoints = vec![EndpointConfig {
            id: "runtime-a".into(),
            url: "http://127.0.0.1:1/workers/qa".into(),
            token: Some("t".into()),
            signing_secret: None,
        }];
        let handlers = HandlerTable::new().with("noop", noop());

        let registry =
            WorkerRegistry::from_config(&workers, &endpoints, &handlers, reqwest::Client::new())
                .unwrap();

        let qa = registry.resolve("qa").unwrap();
        assert_eq!(qa.descriptor.mode, TransportMode::Remote);
        assert_eq!(qa.worker.transport(), TransportMode::Remote);
        assert_eq!(qa.endpoint.as_ref().map(|e| e.id.as_str()), Some("runtime-a"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_from_config_rejects_unknown_handler() {
        let workers = vec![WorkerConfig {
            role: "audit".into(),
            mode: TransportMode::Local,
            target: "missing".into(),
        }];
        let result =
            WorkerRegistry::from_config(&workers, &[], &HandlerTable::new(), reqwest::Client::new());
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
