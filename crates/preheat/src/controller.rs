//! Dispatch controller.
//!
//! The in-process surface callers use: provider listing, instance and
//! history pass-throughs, and [`Controller::preheat_images`], which fans one
//! request out to every enabled healthy instance and hands each submitted
//! task to the monitor.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::{PreheatError, PreheatResult};
use crate::models::{
    HealthStatus, HistoryRecord, ImageRepository, Instance, InstancePatch, PreheatImage,
    PreheatingStatus, Query, PREHEAT_IMAGE_TYPE, TIME_PLACEHOLDER,
};
use crate::monitor::ProgressWatcher;
use crate::provider::client::join_url;
use crate::provider::{Driver, DriverRegistry, Metadata};
use crate::store::{HistoryStore, InstanceStore, TokenService};

/// Task id recorded for targets or images that never reached a provider.
pub const NO_TASK_ID: &str = "-";

/// Registry access granted to providers fetching a manifest.
const PULL_ACTION: &str = "pull";

/// Per-instance dispatch results, keyed by instance id.
pub type DispatchResult = BTreeMap<i64, Vec<PreheatingStatus>>;

/// Coordinates instances, drivers, history and the monitor.
pub struct Controller {
    instances: Arc<dyn InstanceStore>,
    history: Arc<dyn HistoryStore>,
    registry: Arc<DriverRegistry>,
    tokens: Arc<dyn TokenService>,
    watcher: Arc<dyn ProgressWatcher>,
    /// Base URL providers use to reach the registry
    registry_endpoint: String,
}

impl Controller {
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        history: Arc<dyn HistoryStore>,
        registry: Arc<DriverRegistry>,
        tokens: Arc<dyn TokenService>,
        watcher: Arc<dyn ProgressWatcher>,
        registry_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            instances,
            history,
            registry,
            tokens,
            watcher,
            registry_endpoint: registry_endpoint.into(),
        }
    }

    pub fn list_providers(&self) -> Vec<Metadata> {
        self.registry.list_providers()
    }

    pub async fn count_instances(&self, query: &Query) -> PreheatResult<u64> {
        self.instances.count(query).await
    }

    pub async fn list_instances(&self, query: &Query) -> PreheatResult<Vec<Instance>> {
        self.instances.list(query).await
    }

    pub async fn get_instance(&self, id: i64) -> PreheatResult<Instance> {
        self.instances.get(id).await
    }

    pub async fn get_instance_by_name(&self, name: &str) -> PreheatResult<Instance> {
        self.instances.get_by_name(name).await
    }

    /// Persist a new instance.
    ///
    /// Rejects an endpoint already used by another instance with
    /// [`PreheatError::Conflict`] and a vendor without a driver with
    /// [`PreheatError::UnknownVendor`]. The provider is probed once before
    /// saving and its status seeded from the result.
    pub async fn create_instance(&self, mut instance: Instance) -> PreheatResult<i64> {
        instance.validate()?;
        self.ensure_endpoint_free(&instance.endpoint, None).await?;

        let driver = self.registry.create(&instance)?;
        instance.status = probe(driver.as_ref(), &instance).await;
        instance.setup_timestamp = Utc::now().timestamp();

        let id = self.instances.save(instance).await?;
        info!(instance_id = id, "Created preheat instance");
        Ok(id)
    }

    /// Apply `patch` to the stored instance `id`.
    pub async fn update_instance(&self, id: i64, patch: &InstancePatch) -> PreheatResult<()> {
        let mut instance = self.instances.get(id).await?;
        let previous_endpoint = instance.endpoint.clone();
        patch.apply(&mut instance)?;
        if instance.endpoint != previous_endpoint {
            self.ensure_endpoint_free(&instance.endpoint, Some(id)).await?;
        }
        self.instances.update(&instance).await
    }

    pub async fn delete_instance(&self, id: i64) -> PreheatResult<()> {
        self.instances.delete(id).await?;
        info!(instance_id = id, "Deleted preheat instance");
        Ok(())
    }

    /// Probe `instance` without persisting anything.
    pub async fn check_health(&self, instance: &Instance) -> PreheatResult<()> {
        let driver = self.registry.create(instance)?;
        let health = driver.get_health().await?;
        if health.status != HealthStatus::Healthy {
            return Err(PreheatError::Unhealthy(format!(
                "preheat provider instance {}-{}:{} is not healthy",
                instance.vendor, instance.name, instance.endpoint
            )));
        }
        Ok(())
    }

    /// Total matching history rows and the requested page.
    pub async fn load_history(&self, query: &Query) -> PreheatResult<(u64, Vec<HistoryRecord>)> {
        let total = self.history.count(query).await?;
        let rows = self.history.list(query).await?;
        Ok((total, rows))
    }

    /// Preheat every image on every enabled healthy instance.
    ///
    /// Fails as a whole only on invalid input or when no instance can be
    /// targeted. Per-target and per-image failures come back as FAIL
    /// entries in the returned map.
    pub async fn preheat_images(&self, images: &[String]) -> PreheatResult<DispatchResult> {
        if images.is_empty() {
            return Err(PreheatError::Validation("no images to preheat".to_string()));
        }
        let repositories = images
            .iter()
            .map(|image| image.parse::<ImageRepository>())
            .collect::<PreheatResult<Vec<_>>>()?;

        let instances = self.instances.list(&Query::all()).await?;
        if instances.is_empty() {
            return Err(PreheatError::NotFound("no preheat instances configured".to_string()));
        }
        let targets: Vec<Instance> = instances
            .into_iter()
            .filter(Instance::is_dispatch_target)
            .collect();
        if targets.is_empty() {
            return Err(PreheatError::Unhealthy("no enabled healthy instances".to_string()));
        }

        let mut results = DispatchResult::new();
        for target in &targets {
            let entries = results.entry(target.id).or_default();

            let driver = match self.registry.create(target) {
                Ok(driver) => driver,
                Err(e) => {
                    warn!(instance = %target.name, error = %e, "Skipping preheat target");
                    entries.push(PreheatingStatus::failed(NO_TASK_ID, &e));
                    continue;
                }
            };

            for repository in &repositories {
                match self.submit(target, driver.as_ref(), repository).await {
                    Ok(status) => entries.push(status),
                    Err(e) => {
                        warn!(
                            instance = %target.name,
                            image = %repository,
                            error = %e,
                            "Preheat submit failed"
                        );
                        entries.push(PreheatingStatus::failed(NO_TASK_ID, &e));
                    }
                }
            }
        }

        info!(
            images = repositories.len(),
            targets = targets.len(),
            "Dispatched preheat request"
        );
        Ok(results)
    }

    /// Submit one image to one target, record it and start tracking it.
    async fn submit(
        &self,
        target: &Instance,
        driver: &dyn Driver,
        repository: &ImageRepository,
    ) -> PreheatResult<PreheatingStatus> {
        let image = self.build_image(repository).await?;
        let status = driver.preheat(&image).await?;

        let record = HistoryRecord {
            id: 0,
            task_id: status.task_id.clone(),
            image: repository.to_string(),
            start_time: status
                .start_time
                .clone()
                .unwrap_or_else(|| TIME_PLACEHOLDER.to_string()),
            finish_time: status
                .finish_time
                .clone()
                .unwrap_or_else(|| TIME_PLACEHOLDER.to_string()),
            status: status.status.clone(),
            provider: target.vendor.clone(),
            instance: target.id,
        };
        if let Err(e) = self.history.append(record).await {
            error!(
                instance = %target.name,
                task_id = %status.task_id,
                error = %e,
                "Failed to record preheat history"
            );
        }

        if !status.task_id.is_empty() {
            self.watcher.watch_progress(target.id, &status.task_id);
        }
        Ok(status)
    }

    async fn build_image(&self, repository: &ImageRepository) -> PreheatResult<PreheatImage> {
        let token = self
            .tokens
            .mint(repository.name(), &[PULL_ACTION.to_string()])
            .await?;
        let url = join_url(
            &self.registry_endpoint,
            &format!("v2/{}/manifests/{}", repository.name(), repository.tag()),
        )?;

        Ok(PreheatImage {
            image_type: PREHEAT_IMAGE_TYPE.to_string(),
            url: url.to_string(),
            headers: BTreeMap::from([("Authorization".to_string(), format!("Bearer {token}"))]),
            image_name: repository.name().to_string(),
            tag: repository.tag().to_string(),
            digest: String::new(),
        })
    }

    async fn ensure_endpoint_free(&self, endpoint: &str, owner: Option<i64>) -> PreheatResult<()> {
        let query = Query::all().with_keyword("endpoint", endpoint);
        let clash = self
            .instances
            .list(&query)
            .await?
            .into_iter()
            .any(|other| Some(other.id) != owner);
        if clash {
            return Err(PreheatError::Conflict(format!("endpoint {endpoint} already in use")));
        }
        Ok(())
    }
}

/// Best-effort health probe; any failure counts as unhealthy.
async fn probe(driver: &dyn Driver, instance: &Instance) -> HealthStatus {
    match driver.get_health().await {
        Ok(health) if health.status == HealthStatus::Healthy => HealthStatus::Healthy,
        Ok(_) => HealthStatus::Unhealthy,
        Err(e) => {
            warn!(instance = %instance.name, error = %e, "New instance failed health probe");
            HealthStatus::Unhealthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use crate::monitor::MockProgressWatcher;
    use crate::store::{MemoryHistoryStore, MemoryInstanceStore, MockTokenService};
    use crate::testing::{driver_context_with, registry_with, StaticDriver};

    struct Fixture {
        controller: Controller,
        instances: Arc<MemoryInstanceStore>,
        history: Arc<MemoryHistoryStore>,
    }

    fn tokens() -> MockTokenService {
        let mut tokens = MockTokenService::new();
        tokens
            .expect_mint()
            .returning(|repo, _| Ok(format!("token-for-{repo}")));
        tokens
    }

    fn fixture(driver: Arc<StaticDriver>, watcher: MockProgressWatcher) -> Fixture {
        let instances = Arc::new(MemoryInstanceStore::new());
        let history = Arc::new(MemoryHistoryStore::new());
        let registry = Arc::new(registry_with(driver, driver_context_with(history.clone())));
        let controller = Controller::new(
            instances.clone(),
            history.clone(),
            registry,
            Arc::new(tokens()),
            Arc::new(watcher),
            "https://harbor.local",
        );
        Fixture {
            controller,
            instances,
            history,
        }
    }

    fn ignore_watches() -> MockProgressWatcher {
        let mut watcher = MockProgressWatcher::new();
        watcher.expect_watch_progress().return_const(());
        watcher
    }

    async fn add(instances: &MemoryInstanceStore, name: &str, status: HealthStatus, enabled: bool) -> i64 {
        let mut instance = Instance::new(name, "fake", format!("http://{name}.local"));
        instance.status = status;
        instance.enabled = enabled;
        instances.save(instance).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_instance_probes_and_stamps() {
        let f = fixture(Arc::new(StaticDriver::healthy("fake")), ignore_watches());
        let id = f
            .controller
            .create_instance(Instance::new("a", "fake", "http://a.local"))
            .await
            .unwrap();

        let stored = f.controller.get_instance(id).await.unwrap();
        assert_eq!(stored.status, HealthStatus::Healthy);
        assert!(stored.setup_timestamp > 0);
        assert_eq!(f.controller.get_instance_by_name("a").await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_create_instance_unhealthy_probe() {
        let f = fixture(Arc::new(StaticDriver::unhealthy("fake")), ignore_watches());
        let id = f
            .controller
            .create_instance(Instance::new("a", "fake", "http://a.local"))
            .await
            .unwrap();
        assert_eq!(
            f.controller.get_instance(id).await.unwrap().status,
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_create_instance_rejects_unknown_vendor() {
        let f = fixture(Arc::new(StaticDriver::healthy("fake")), ignore_watches());
        let err = f
            .controller
            .create_instance(Instance::new("b", "nydus", "http://b.local"))
            .await
            .unwrap_err();
        assert!(matches!(err, PreheatError::UnknownVendor(_)));
        assert_eq!(f.controller.count_instances(&Query::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_instance_endpoint_conflict() {
        let f = fixture(Arc::new(StaticDriver::healthy("fake")), ignore_watches());
        f.controller
            .create_instance(Instance::new("a", "fake", "http://shared.local"))
            .await
            .unwrap();
        let err = f
            .controller
            .create_instance(Instance::new("b", "fake", "http://shared.local"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(f.controller.count_instances(&Query::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_instance() {
        let f = fixture(Arc::new(StaticDriver::healthy("fake")), ignore_watches());
        let a = add(&f.instances, "a", HealthStatus::Healthy, true).await;
        add(&f.instances, "b", HealthStatus::Healthy, true).await;

        let empty = f.controller.update_instance(a, &InstancePatch::default()).await;
        assert!(empty.is_err());

        let clash = InstancePatch {
            endpoint: Some("http://b.local".to_string()),
            ..Default::default()
        };
        assert!(f.controller.update_instance(a, &clash).await.unwrap_err().is_conflict());

        let disable = InstancePatch {
            enabled: Some(false),
            ..Default::default()
        };
        f.controller.update_instance(a, &disable).await.unwrap();
        assert!(!f.controller.get_instance(a).await.unwrap().enabled);

        f.controller.delete_instance(a).await.unwrap();
        assert!(f.controller.get_instance(a).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_check_health() {
        let healthy = fixture(Arc::new(StaticDriver::healthy("fake")), ignore_watches());
        let instance = Instance::new("a", "fake", "http://a.local");
        healthy.controller.check_health(&instance).await.unwrap();

        let sick = fixture(Arc::new(StaticDriver::unhealthy("fake")), ignore_watches());
        assert!(sick.controller.check_health(&instance).await.is_err());

        let unknown = Instance::new("x", "nydus", "http://x.local");
        assert!(matches!(
            healthy.controller.check_health(&unknown).await.unwrap_err(),
            PreheatError::UnknownVendor(_)
        ));
    }

    #[tokio::test]
    async fn test_list_providers() {
        let f = fixture(Arc::new(StaticDriver::healthy("fake")), ignore_watches());
        let providers = f.controller.list_providers();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].id, "fake");
    }

    #[tokio::test]
    async fn test_preheat_rejects_bad_input() {
        let driver = Arc::new(StaticDriver::healthy("fake"));
        let f = fixture(Arc::clone(&driver), ignore_watches());
        add(&f.instances, "a", HealthStatus::Healthy, true).await;

        assert!(f.controller.preheat_images(&[]).await.is_err());
        let err = f
            .controller
            .preheat_images(&["library/alpine:latest".to_string(), "invalid".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, PreheatError::Validation(_)));
        assert_eq!(driver.preheats(), 0);
        assert_eq!(f.history.count(&Query::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_preheat_requires_targets() {
        let f = fixture(Arc::new(StaticDriver::healthy("fake")), ignore_watches());
        let images = ["library/alpine:latest".to_string()];
        assert!(f.controller.preheat_images(&images).await.unwrap_err().is_not_found());

        add(&f.instances, "off", HealthStatus::Healthy, false).await;
        add(&f.instances, "sick", HealthStatus::Unhealthy, true).await;
        let err = f.controller.preheat_images(&images).await.unwrap_err();
        assert!(err.to_string().contains("no enabled healthy instances"));
    }

    #[tokio::test]
    async fn test_preheat_records_and_enqueues() {
        let mut watcher = MockProgressWatcher::new();
        watcher
            .expect_watch_progress()
            .withf(|_, task| task == "task-1")
            .times(2)
            .return_const(());

        let driver = Arc::new(StaticDriver::healthy("fake"));
        let f = fixture(Arc::clone(&driver), watcher);
        let id = add(&f.instances, "a", HealthStatus::Unknown, true).await;
        add(&f.instances, "sick", HealthStatus::Unhealthy, true).await;

        let images = ["library/alpine:latest".to_string(), "library/redis:7".to_string()];
        let results = f.controller.preheat_images(&images).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[&id].len(), 2);
        assert!(results[&id].iter().all(|s| s.status == TaskStatus::Pending));

        let (total, rows) = f.controller.load_history(&Query::all()).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows[0].image, "library/alpine:latest");
        assert_eq!(rows[0].start_time, TIME_PLACEHOLDER);
        assert_eq!(rows[0].instance, id);
        assert_eq!(rows[1].image, "library/redis:7");
    }

    #[tokio::test]
    async fn test_submit_failure_is_recorded_not_raised() {
        let mut watcher = MockProgressWatcher::new();
        watcher.expect_watch_progress().never();

        let driver = Arc::new(StaticDriver::healthy("fake").failing_submit("provider down"));
        let f = fixture(Arc::clone(&driver), watcher);
        let id = add(&f.instances, "a", HealthStatus::Healthy, true).await;

        let results = f
            .controller
            .preheat_images(&["library/alpine:latest".to_string()])
            .await
            .unwrap();
        let entry = &results[&id][0];
        assert_eq!(entry.status, TaskStatus::Fail);
        assert_eq!(entry.task_id, NO_TASK_ID);
        assert!(entry.error.as_deref().unwrap().contains("provider down"));
        assert_eq!(f.history.count(&Query::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_vendor_target_gets_fail_entry() {
        let mut watcher = MockProgressWatcher::new();
        watcher.expect_watch_progress().times(1).return_const(());

        let f = fixture(Arc::new(StaticDriver::healthy("fake")), watcher);
        let good = add(&f.instances, "a", HealthStatus::Healthy, true).await;
        let bad = f
            .instances
            .save(Instance::new("n", "nydus", "http://n.local"))
            .await
            .unwrap();

        let results = f
            .controller
            .preheat_images(&["library/alpine:latest".to_string()])
            .await
            .unwrap();
        assert_eq!(results[&good][0].status, TaskStatus::Pending);
        assert_eq!(results[&bad].len(), 1);
        assert_eq!(results[&bad][0].status, TaskStatus::Fail);
        assert_eq!(f.history.count(&Query::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_terminal_submit_without_task_id_is_not_tracked() {
        let mut watcher = MockProgressWatcher::new();
        watcher.expect_watch_progress().never();

        let driver = Arc::new(
            StaticDriver::healthy("fake").with_submit(PreheatingStatus::new("", TaskStatus::Success)),
        );
        let f = fixture(driver, watcher);
        add(&f.instances, "a", HealthStatus::Healthy, true).await;

        f.controller
            .preheat_images(&["library/alpine:latest".to_string()])
            .await
            .unwrap();
        let (_, rows) = f.controller.load_history(&Query::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TaskStatus::Success);
    }
}
