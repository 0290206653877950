//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use tunegate_core::{
    EngineConfig, EngineDeps, EnhancementRequest, FleetCoordinator, MemoryApprovalChannel,
    ParameterDelta, Parameters, Sampler,
};
use tunegate_state::fakes::MemoryKvStore;
use tunegate_state::{KvStore, StorageResult};

pub const AGENT: &str = "scout";

pub fn params(temperature: f64) -> Parameters {
    Parameters::from([("temperature".to_string(), temperature)])
}

/// Default gate, `scenarios` trials per side, fast commit retries.
pub fn config(scenarios: u32) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sampler.scenario_count = scenarios;
    config.commit.retry_backoff_ms = 1;
    config
}

/// Low-impact request (10 % change of `temperature = 1.0`).
pub fn small_step() -> EnhancementRequest {
    step(0.1)
}

/// High-impact request (60 % change), needs approval at the default threshold.
pub fn big_step() -> EnhancementRequest {
    step(0.6)
}

pub fn step(amount: f64) -> EnhancementRequest {
    EnhancementRequest::new(AGENT).with_delta(ParameterDelta::new().with("temperature", amount))
}

pub struct FleetBuilder {
    pub config: EngineConfig,
    pub kv: Arc<dyn KvStore>,
    pub approval: Option<Arc<MemoryApprovalChannel>>,
}

impl FleetBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            kv: Arc::new(MemoryKvStore::new()),
            approval: None,
        }
    }

    pub fn kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = kv;
        self
    }

    pub fn approval(mut self, channel: Arc<MemoryApprovalChannel>) -> Self {
        self.approval = Some(channel);
        self
    }

    /// Build the fleet and register [`AGENT`] at `temperature = 1.0`.
    pub async fn build(self, sampler: Arc<dyn Sampler>) -> FleetCoordinator {
        let mut deps = EngineDeps::new(self.kv, sampler);
        if let Some(channel) = self.approval {
            deps = deps.with_approval(channel);
        }
        let fleet = FleetCoordinator::new(self.config, deps).unwrap();
        fleet.register_agent(AGENT, params(1.0)).await.unwrap();
        fleet
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Store that stops the writer right after its first completed `put` under
/// a prefix, until the test calls [`resume`](Self::resume).
pub struct PausingKvStore {
    inner: Arc<dyn KvStore>,
    prefix: Mutex<Option<String>>,
    paused: Notify,
    resumed: Notify,
}

impl PausingKvStore {
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self {
            inner,
            prefix: Mutex::new(None),
            paused: Notify::new(),
            resumed: Notify::new(),
        }
    }

    pub fn pause_after_put(&self, prefix: impl Into<String>) {
        *self.prefix.lock().unwrap() = Some(prefix.into());
    }

    /// Wait until a writer is held.
    pub async fn wait_paused(&self) {
        tokio::time::timeout(Duration::from_secs(2), self.paused.notified())
            .await
            .expect("writer never paused");
    }

    pub fn resume(&self) {
        self.resumed.notify_one();
    }

    fn take_match(&self, key: &str) -> bool {
        let mut prefix = self.prefix.lock().unwrap();
        if prefix.as_deref().is_some_and(|p| key.starts_with(p)) {
            *prefix = None;
            return true;
        }
        false
    }
}

#[async_trait]
impl KvStore for PausingKvStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.inner.put(key, value).await?;
        if self.take_match(key) {
            self.paused.notify_one();
            self.resumed.notified().await;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> StorageResult<bool> {
        self.inner.compare_and_put(key, expected, value).await
    }
}
