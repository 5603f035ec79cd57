//! The mock service store: validated writes, snapshot reads.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::model::{self, MockService, MockServiceCreate, MockServiceUpdate, ValidationError};
use crate::path::{PathTemplate, TemplateError};

/// One entry of the active-service snapshot: the service plus its path
/// template, compiled once per mutation instead of once per request.
#[derive(Debug, Clone)]
pub struct ActiveService {
    pub service: Arc<MockService>,
    pub template: PathTemplate,
}

impl ActiveService {
    pub fn new(service: Arc<MockService>) -> Result<Self, TemplateError> {
        let template = PathTemplate::compile(&service.path)?;
        Ok(Self { service, template })
    }
}

struct RepoInner {
    services: BTreeMap<u64, Arc<MockService>>,
    next_id: u64,
    /// Active services in id order, rebuilt on every mutation. The router
    /// clones the `Arc` once per request and works off an immutable list
    /// of precompiled templates.
    active: Arc<Vec<ActiveService>>,
}

impl RepoInner {
    fn rebuild_active(&mut self) {
        self.active = Arc::new(
            self.services
                .values()
                .filter(|s| s.is_active)
                .filter_map(|s| match ActiveService::new(s.clone()) {
                    Ok(active) => Some(active),
                    Err(error) => {
                        // Validation keeps this from happening for services
                        // created through the repository; a corrupt snapshot
                        // entry must not break routing for everyone else.
                        warn!(service = s.id, %error, "skipping active service with invalid template");
                        None
                    }
                })
                .collect(),
        );
    }
}

/// In-process service registry with an optional JSON snapshot on disk.
///
/// Reads are lock-cheap: dispatch grabs the prebuilt active snapshot and
/// releases the lock before routing. Mutations validate, renumber the
/// snapshot and rewrite the persistence file when one is configured. Ids
/// are monotonic and never reused within a process.
pub struct ServiceRepository {
    inner: RwLock<RepoInner>,
    persist_path: Option<PathBuf>,
}

impl Default for ServiceRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRepository {
    /// An empty, memory-only repository.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RepoInner {
                services: BTreeMap::new(),
                next_id: 1,
                active: Arc::new(Vec::new()),
            }),
            persist_path: None,
        }
    }

    /// A repository backed by a JSON snapshot file.
    ///
    /// A missing file is an empty registry; an unreadable one is a startup
    /// error, silently starting empty would look like data loss.
    pub fn open(path: PathBuf) -> Result<Self, GatewayError> {
        let mut services = BTreeMap::new();
        let mut next_id = 1;
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let loaded: Vec<MockService> = serde_json::from_str(&raw)
                .map_err(|e| GatewayError::Store(format!("cannot parse {}: {e}", path.display())))?;
            for service in loaded {
                next_id = next_id.max(service.id + 1);
                services.insert(service.id, Arc::new(service));
            }
            info!(count = services.len(), path = %path.display(), "loaded service snapshot");
        }
        let mut inner = RepoInner {
            services,
            next_id,
            active: Arc::new(Vec::new()),
        };
        inner.rebuild_active();
        Ok(Self {
            inner: RwLock::new(inner),
            persist_path: Some(path),
        })
    }

    /// Validate and register a new service.
    pub fn create(&self, input: MockServiceCreate) -> Result<MockService, ValidationError> {
        let mut inner = self.inner.write().expect("repository lock poisoned");
        let id = inner.next_id;
        let service = input.into_service(id, Utc::now())?;
        inner.next_id += 1;
        inner.services.insert(id, Arc::new(service.clone()));
        inner.rebuild_active();
        self.persist(&inner);
        info!(service = id, name = %service.name, "mock service created");
        Ok(service)
    }

    pub fn get(&self, id: u64) -> Option<Arc<MockService>> {
        self.inner
            .read()
            .expect("repository lock poisoned")
            .services
            .get(&id)
            .cloned()
    }

    /// All services in id order, paginated.
    pub fn list(&self, skip: usize, limit: usize) -> Vec<Arc<MockService>> {
        self.inner
            .read()
            .expect("repository lock poisoned")
            .services
            .values()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect()
    }

    /// The current active-service snapshot, templates precompiled.
    pub fn list_active(&self) -> Arc<Vec<ActiveService>> {
        self.inner
            .read()
            .expect("repository lock poisoned")
            .active
            .clone()
    }

    /// Apply a partial update. Returns `Ok(None)` for an unknown id.
    pub fn update(
        &self,
        id: u64,
        patch: MockServiceUpdate,
    ) -> Result<Option<MockService>, ValidationError> {
        let mut inner = self.inner.write().expect("repository lock poisoned");
        let Some(existing) = inner.services.get(&id) else {
            return Ok(None);
        };
        let updated = patch.apply(existing, Utc::now())?;
        inner.services.insert(id, Arc::new(updated.clone()));
        inner.rebuild_active();
        self.persist(&inner);
        info!(service = id, "mock service updated");
        Ok(Some(updated))
    }

    /// Remove a service. Returns whether it existed.
    pub fn delete(&self, id: u64) -> bool {
        let mut inner = self.inner.write().expect("repository lock poisoned");
        let removed = inner.services.remove(&id).is_some();
        if removed {
            inner.rebuild_active();
            self.persist(&inner);
            info!(service = id, "mock service deleted");
        }
        removed
    }

    /// Re-run validation over every stored service, normalizing in place.
    /// Used after loading snapshots written by older builds.
    pub fn revalidate(&self) -> Vec<(u64, ValidationError)> {
        let mut inner = self.inner.write().expect("repository lock poisoned");
        let mut failures = Vec::new();
        let ids: Vec<u64> = inner.services.keys().copied().collect();
        for id in ids {
            let mut service = (*inner.services[&id]).clone();
            match model::validate(&mut service) {
                Ok(()) => {
                    inner.services.insert(id, Arc::new(service));
                }
                Err(error) => failures.push((id, error)),
            }
        }
        inner.rebuild_active();
        failures
    }

    fn persist(&self, inner: &RepoInner) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let services: Vec<&MockService> = inner.services.values().map(Arc::as_ref).collect();
        let result = serde_json::to_string_pretty(&services)
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));
        if let Err(error) = result {
            // The in-memory registry is still consistent; losing the
            // snapshot only hurts the next restart.
            warn!(%error, path = %path.display(), "persisting service snapshot failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceType, Strategy};
    use tempfile::TempDir;

    fn create(name: &str, path: &str) -> MockServiceCreate {
        MockServiceCreate {
            name: name.into(),
            path: path.into(),
            methods: vec!["get".into()],
            strategy: Strategy::Static,
            static_response: Some("ok".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_assigns_monotonic_ids() {
        let repo = ServiceRepository::new();
        let a = repo.create(create("a", "/a")).unwrap();
        let b = repo.create(create("b", "/b")).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        repo.delete(a.id);
        let c = repo.create(create("c", "/c")).unwrap();
        assert_eq!(c.id, 3, "ids are not reused");
    }

    #[test]
    fn test_active_snapshot_tracks_mutations() {
        let repo = ServiceRepository::new();
        let a = repo.create(create("a", "/a")).unwrap();
        let snapshot = repo.list_active();
        assert_eq!(snapshot.len(), 1);

        repo.update(
            a.id,
            MockServiceUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        // The old snapshot is untouched, the new one reflects the change.
        assert_eq!(snapshot.len(), 1);
        assert!(repo.list_active().is_empty());
    }

    #[test]
    fn test_validation_failure_leaves_store_unchanged() {
        let repo = ServiceRepository::new();
        let mut bad = create("bad", "/dup/{x}/{x}");
        bad.service_type = ServiceType::Rest;
        assert!(repo.create(bad).is_err());
        assert!(repo.list(0, 10).is_empty());
        // The failed attempt must not burn an id.
        assert_eq!(repo.create(create("ok", "/ok")).unwrap().id, 1);
    }

    #[test]
    fn test_list_pagination() {
        let repo = ServiceRepository::new();
        for i in 0..5 {
            repo.create(create(&format!("s{i}"), &format!("/s{i}"))).unwrap();
        }
        let page = repo.list(1, 2);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, 2);
        assert_eq!(page[1].id, 3);
    }

    #[test]
    fn test_update_unknown_id() {
        let repo = ServiceRepository::new();
        assert!(repo.update(99, MockServiceUpdate::default()).unwrap().is_none());
        assert!(!repo.delete(99));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("services.json");
        {
            let repo = ServiceRepository::open(path.clone()).unwrap();
            repo.create(create("kept", "/kept")).unwrap();
            let mut soap = create("soap", "/soap");
            soap.service_type = ServiceType::Soap;
            soap.methods = vec!["post".into()];
            repo.create(soap).unwrap();
        }
        let reopened = ServiceRepository::open(path).unwrap();
        let services = reopened.list(0, 10);
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "kept");
        assert_eq!(services[0].methods, vec!["GET"]);
        assert_eq!(services[1].service_type, ServiceType::Soap);
        // New ids continue after the loaded ones.
        assert_eq!(reopened.create(create("new", "/new")).unwrap().id, 3);
    }

    #[test]
    fn test_snapshot_entry_with_invalid_template_not_routed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("services.json");
        let valid = create("ok", "/ok").into_service(1, Utc::now()).unwrap();
        let mut broken = create("broken", "/fine").into_service(2, Utc::now()).unwrap();
        broken.path = "no-slash".into();
        std::fs::write(&path, serde_json::to_string(&vec![&valid, &broken]).unwrap()).unwrap();

        let repo = ServiceRepository::open(path).unwrap();
        // Both entries load, but only the compilable one is dispatchable.
        assert_eq!(repo.list(0, 10).len(), 2);
        let active = repo.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].service.id, 1);
    }

    #[test]
    fn test_open_rejects_corrupt_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("services.json");
        std::fs::write(&path, "not json at all").unwrap();
        assert!(ServiceRepository::open(path).is_err());
    }
}
