//! Worker registry and dispatch
//!
//! Tracks every registered worker with its advertised models and load, hands
//! out worker addresses per model and drops workers that stop sending
//! heartbeats.

use crate::worker_client::WorkerClient;
use chatserve_common::config::{ControllerConfig, DispatchMethod};
use chatserve_common::METRICS;
use chatserve_proto::WorkerStatus;
use parking_lot::{Mutex, RwLock};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What the controller knows about one worker
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    /// Worker address, also its registry key
    pub address: String,
    pub model_names: Vec<String>,
    pub speed: f64,
    pub queue_length: usize,
    /// Whether this worker is subject to heartbeat expiry
    pub check_heart_beat: bool,
    pub last_heart_beat: Instant,
}

impl WorkerInfo {
    fn new(address: String, check_heart_beat: bool, status: WorkerStatus) -> Self {
        Self {
            address,
            model_names: status.model_names,
            speed: status.speed,
            queue_length: status.queue_length,
            check_heart_beat,
            last_heart_beat: Instant::now(),
        }
    }

    /// Calculate load score for routing (lower is better)
    pub fn load_score(&self) -> f64 {
        if self.speed <= 0.0 {
            return f64::INFINITY;
        }
        self.queue_length as f64 / self.speed
    }

    pub fn serves(&self, model: &str) -> bool {
        self.model_names.iter().any(|m| m == model)
    }

    fn is_expired(&self, expiration: Duration) -> bool {
        self.check_heart_beat && self.last_heart_beat.elapsed() > expiration
    }
}

/// Registry of live workers
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerInfo>>,
    dispatch: DispatchMethod,
    heart_beat_expiration: Duration,
    expiry_check_interval: Duration,
    rng: Mutex<StdRng>,
}

impl WorkerRegistry {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            dispatch: config.dispatch,
            heart_beat_expiration: config.heart_beat_expiration(),
            expiry_check_interval: config.expiry_check_interval(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    fn publish(&self, count: usize) {
        METRICS.controller.registered_workers.set(count as i64);
    }

    /// Add a worker or replace what is known about it
    pub fn register(&self, address: &str, check_heart_beat: bool, status: WorkerStatus) {
        let info = WorkerInfo::new(address.to_string(), check_heart_beat, status);
        let count = {
            let mut workers = self.workers.write();
            workers.insert(address.to_string(), info.clone());
            workers.len()
        };
        self.publish(count);

        info!(
            "Registered worker {} for models {:?} (queue_length={})",
            address, info.model_names, info.queue_length
        );
    }

    /// Record a heartbeat. Returns false if the worker is not registered.
    pub fn heartbeat(&self, address: &str, queue_length: usize) -> bool {
        METRICS.controller.heartbeats_received.inc();

        let mut workers = self.workers.write();
        match workers.get_mut(address) {
            Some(worker) => {
                worker.queue_length = queue_length;
                worker.last_heart_beat = Instant::now();
                debug!("Heartbeat from {}, queue_length={}", address, queue_length);
                true
            }
            None => {
                debug!("Heartbeat from unknown worker {}", address);
                false
            }
        }
    }

    /// Remove a worker. Returns whether it was registered.
    pub fn remove(&self, address: &str) -> bool {
        let (removed, count) = {
            let mut workers = self.workers.write();
            let removed = workers.remove(address).is_some();
            (removed, workers.len())
        };
        if removed {
            self.publish(count);
            info!("Removed worker {}", address);
        }
        removed
    }

    /// Drop workers whose last heartbeat is older than the expiration
    pub fn remove_stale(&self) -> Vec<String> {
        let (expired, count) = {
            let mut workers = self.workers.write();
            let expired: Vec<String> = workers
                .values()
                .filter(|w| w.is_expired(self.heart_beat_expiration))
                .map(|w| w.address.clone())
                .collect();
            for address in &expired {
                workers.remove(address);
            }
            (expired, workers.len())
        };

        if !expired.is_empty() {
            METRICS.controller.expired_workers.inc_by(expired.len() as u64);
            self.publish(count);
            for address in &expired {
                warn!("Worker {} expired after missing heartbeats", address);
            }
        }
        expired
    }

    /// Every model served by at least one worker, sorted
    pub fn list_models(&self) -> Vec<String> {
        let workers = self.workers.read();
        workers
            .values()
            .flat_map(|w| w.model_names.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Pick a worker for `model` and count the dispatch against its queue
    pub fn get_worker_address(&self, model: &str) -> Option<String> {
        let mut workers = self.workers.write();
        let mut candidates: Vec<&mut WorkerInfo> = workers.values_mut().filter(|w| w.serves(model)).collect();

        if candidates.is_empty() {
            METRICS.controller.no_workers_available.inc();
            debug!("No worker serves model {}", model);
            return None;
        }
        // HashMap order is arbitrary; sort so ties resolve the same way every time
        candidates.sort_by(|a, b| a.address.cmp(&b.address));

        let index = match self.dispatch {
            DispatchMethod::ShortestQueue => candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.load_score()
                        .partial_cmp(&b.load_score())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i)
                .unwrap_or(0),
            DispatchMethod::Lottery => {
                let weights: Vec<f64> = candidates.iter().map(|w| w.speed.max(0.0)).collect();
                match WeightedIndex::new(&weights) {
                    Ok(dist) => dist.sample(&mut *self.rng.lock()),
                    Err(_) => 0,
                }
            }
        };

        let worker = &mut candidates[index];
        worker.queue_length += 1;
        METRICS.controller.dispatches.inc();
        debug!(
            "Dispatching {} to {} (queue_length now {})",
            model, worker.address, worker.queue_length
        );
        Some(worker.address.clone())
    }

    pub fn worker_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.workers.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn get(&self, address: &str) -> Option<WorkerInfo> {
        self.workers.read().get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Combined status of every registered worker
    pub fn aggregate_status(&self) -> WorkerStatus {
        let workers = self.workers.read();
        let model_names = workers
            .values()
            .flat_map(|w| w.model_names.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        WorkerStatus {
            model_names,
            speed: workers.values().map(|w| w.speed).sum(),
            queue_length: workers.values().map(|w| w.queue_length).sum(),
        }
    }

    /// Re-query every worker's status; drop the ones that do not answer
    pub async fn refresh_all(&self, client: &WorkerClient) {
        let snapshot: Vec<(String, bool)> = self
            .workers
            .read()
            .values()
            .map(|w| (w.address.clone(), w.check_heart_beat))
            .collect();

        for (address, check_heart_beat) in snapshot {
            match client.get_status(&address).await {
                Ok(status) => self.register(&address, check_heart_beat, status),
                Err(e) => {
                    warn!("Worker {} did not answer a status refresh: {}", address, e);
                    self.remove(&address);
                }
            }
        }
    }

    /// Start background expiry task
    pub fn start_expiry_checks(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.expiry_check_interval);

            loop {
                interval.tick().await;
                self.remove_stale();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(model: &str, queue_length: usize) -> WorkerStatus {
        WorkerStatus {
            model_names: vec![model.to_string()],
            speed: 1.0,
            queue_length,
        }
    }

    fn registry(dispatch: DispatchMethod) -> WorkerRegistry {
        WorkerRegistry::new(&ControllerConfig {
            dispatch,
            ..ControllerConfig::default()
        })
    }

    #[test]
    fn test_shortest_queue_dispatch() {
        let registry = registry(DispatchMethod::ShortestQueue);
        registry.register("http://w1:21002", true, status("opt-1.3b", 3));
        registry.register("http://w2:21002", true, status("opt-1.3b", 1));
        registry.register("http://w3:21002", true, status("vicuna-7b", 0));

        assert_eq!(registry.get_worker_address("opt-1.3b").as_deref(), Some("http://w2:21002"));
        assert_eq!(registry.get("http://w2:21002").unwrap().queue_length, 2);

        assert_eq!(registry.get_worker_address("opt-1.3b").as_deref(), Some("http://w2:21002"));
        assert_eq!(registry.get("http://w2:21002").unwrap().queue_length, 3);

        // w2 now ties w1 on load; lowest address wins
        assert_eq!(registry.get_worker_address("opt-1.3b").as_deref(), Some("http://w1:21002"));
        assert_eq!(registry.get("http://w1:21002").unwrap().queue_length, 4);
        assert_eq!(registry.get_worker_address("llama"), None);
    }

    #[test]
    fn test_lottery_only_picks_serving_workers() {
        let registry = registry(DispatchMethod::Lottery);
        registry.register("http://w1:21002", true, status("opt-1.3b", 0));
        registry.register("http://w2:21002", true, status("vicuna-7b", 0));

        for _ in 0..20 {
            assert_eq!(registry.get_worker_address("vicuna-7b").as_deref(), Some("http://w2:21002"));
        }
    }

    #[test]
    fn test_heartbeat_for_unknown_worker() {
        let registry = registry(DispatchMethod::ShortestQueue);
        assert!(!registry.heartbeat("http://w1:21002", 0));

        registry.register("http://w1:21002", true, status("opt-1.3b", 0));
        assert!(registry.heartbeat("http://w1:21002", 4));
        assert_eq!(registry.get("http://w1:21002").unwrap().queue_length, 4);
    }

    #[test]
    fn test_list_models_sorted_and_deduplicated() {
        let registry = registry(DispatchMethod::ShortestQueue);
        registry.register("http://w1:21002", true, status("vicuna-7b", 0));
        registry.register("http://w2:21002", true, status("opt-1.3b", 0));
        registry.register("http://w3:21002", true, status("opt-1.3b", 0));

        assert_eq!(registry.list_models(), vec!["opt-1.3b".to_string(), "vicuna-7b".to_string()]);

        let aggregate = registry.aggregate_status();
        assert_eq!(aggregate.model_names.len(), 2);
        assert_eq!(aggregate.speed, 3.0);
    }

    #[test]
    fn test_remove() {
        let registry = registry(DispatchMethod::ShortestQueue);
        registry.register("http://w1:21002", true, status("opt-1.3b", 0));
        assert!(registry.remove("http://w1:21002"));
        assert!(!registry.remove("http://w1:21002"));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_workers_expire() {
        let registry = registry(DispatchMethod::ShortestQueue);
        registry.register("http://w1:21002", true, status("opt-1.3b", 0));
        registry.register("http://w2:21002", true, status("opt-1.3b", 0));
        registry.register("http://pinned:21002", false, status("opt-1.3b", 0));

        tokio::time::advance(Duration::from_secs(60)).await;
        registry.heartbeat("http://w2:21002", 0);
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(registry.remove_stale(), vec!["http://w1:21002".to_string()]);
        assert_eq!(
            registry.worker_addresses(),
            vec!["http://pinned:21002".to_string(), "http://w2:21002".to_string()]
        );
    }
}
