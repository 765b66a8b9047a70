//! Collector registry: concurrent fan-out and snapshot merge.
//!
//! Successive gathers are serialized by a single async mutex so overlapping
//! scrapes queue instead of double-driving the library. Within one gather,
//! every collector runs on its own blocking worker and results merge through
//! a concurrent map keyed by `(entity-kind, counter)`.

use crate::collectors::Collector;
use crate::counters::Counter;
use crate::dcgm::EntityGroup;
use crate::error::Result;
use crate::metrics::{Metric, MetricsByCounterGroup};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Default)]
pub struct Registry {
    collectors: StdMutex<Vec<(EntityGroup, Arc<dyn Collector>)>>,
    /// `(entity-kind, collector-instance)` pairs already registered.
    seen: StdMutex<HashSet<(EntityGroup, usize)>>,
    gather_lock: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a collector under an entity kind. Registering the same
    /// instance for the same kind again is a no-op; a different instance for
    /// the same kind is kept and will also run.
    pub fn register(&self, group: EntityGroup, collector: Arc<dyn Collector>) {
        let identity = Arc::as_ptr(&collector) as *const () as usize;
        let mut seen = self.seen.lock().unwrap();
        if !seen.insert((group, identity)) {
            debug!("collector {} already registered for {group}", collector.name());
            return;
        }
        self.collectors.lock().unwrap().push((group, collector));
    }

    pub fn collector_count(&self) -> usize {
        self.collectors.lock().unwrap().len()
    }

    /// Runs every collector concurrently and merges their output. The first
    /// collector error aborts the gather; partial results are discarded.
    pub async fn gather(&self) -> Result<MetricsByCounterGroup> {
        let _serialized = self.gather_lock.lock().await;
        let collectors: Vec<(EntityGroup, Arc<dyn Collector>)> =
            self.collectors.lock().unwrap().clone();

        let merged: Arc<DashMap<(EntityGroup, Counter), Vec<Metric>>> = Arc::new(DashMap::new());
        let mut tasks = JoinSet::new();
        for (group, collector) in collectors {
            let merged = Arc::clone(&merged);
            tasks.spawn_blocking(move || {
                let metrics = collector.get_metrics()?;
                for (counter, list) in metrics {
                    merged.entry((group, counter)).or_default().extend(list);
                }
                Ok::<(), crate::error::ExporterError>(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| {
                crate::error::ExporterError::Collection(format!("collector task panicked: {e}"))
            })?;
            if let Err(e) = result {
                tasks.shutdown().await;
                return Err(e);
            }
        }

        let mut snapshot = MetricsByCounterGroup::default();
        let merged = Arc::try_unwrap(merged).unwrap_or_else(|m| (*m).clone());
        for ((group, counter), list) in merged {
            if list.is_empty() {
                continue;
            }
            snapshot.entry(group).or_default().insert(counter, list);
        }
        Ok(snapshot)
    }

    /// Runs every collector's cleanup. Errors are logged, never propagated.
    pub fn cleanup(&self) {
        for (group, collector) in self.collectors.lock().unwrap().iter() {
            debug!("cleaning up {} collector for {group}", collector.name());
            collector.cleanup();
        }
        if self.collector_count() > 0 {
            warn!("registry cleaned up; further gathers return empty snapshots");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::PromType;
    use crate::error::ExporterError;
    use crate::metrics::MetricsByCounter;

    struct StaticCollector {
        group: EntityGroup,
        counter: Counter,
        values: Vec<&'static str>,
        fail: bool,
    }

    impl Collector for StaticCollector {
        fn group(&self) -> EntityGroup {
            self.group
        }
        fn name(&self) -> &'static str {
            "static"
        }
        fn get_metrics(&self) -> Result<MetricsByCounter> {
            if self.fail {
                return Err(ExporterError::Collection("boom".to_string()));
            }
            let mut out = MetricsByCounter::default();
            out.insert(
                self.counter.clone(),
                self.values
                    .iter()
                    .map(|v| Metric::new(self.counter.clone(), *v))
                    .collect(),
            );
            Ok(out)
        }
    }

    fn counter(name: &str) -> Counter {
        Counter::new(1, name, PromType::Gauge, "")
    }

    #[tokio::test]
    async fn gather_merges_by_group_and_counter() {
        let registry = Registry::new();
        registry.register(
            EntityGroup::Gpu,
            Arc::new(StaticCollector {
                group: EntityGroup::Gpu,
                counter: counter("A"),
                values: vec!["1", "2"],
                fail: false,
            }),
        );
        registry.register(
            EntityGroup::Switch,
            Arc::new(StaticCollector {
                group: EntityGroup::Switch,
                counter: counter("B"),
                values: vec!["3"],
                fail: false,
            }),
        );
        let snapshot = registry.gather().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&EntityGroup::Gpu][&counter("A")].len(), 2);
        assert_eq!(snapshot[&EntityGroup::Switch][&counter("B")].len(), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_is_idempotent() {
        let registry = Registry::new();
        let collector = Arc::new(StaticCollector {
            group: EntityGroup::Gpu,
            counter: counter("A"),
            values: vec!["1"],
            fail: false,
        });
        for _ in 0..5 {
            registry.register(EntityGroup::Gpu, collector.clone());
        }
        assert_eq!(registry.collector_count(), 1);
        let snapshot = registry.gather().await.unwrap();
        assert_eq!(snapshot[&EntityGroup::Gpu][&counter("A")].len(), 1);
    }

    #[tokio::test]
    async fn distinct_instances_for_one_group_both_run() {
        let registry = Registry::new();
        for _ in 0..2 {
            registry.register(
                EntityGroup::Gpu,
                Arc::new(StaticCollector {
                    group: EntityGroup::Gpu,
                    counter: counter("A"),
                    values: vec!["1"],
                    fail: false,
                }),
            );
        }
        assert_eq!(registry.collector_count(), 2);
        let snapshot = registry.gather().await.unwrap();
        assert_eq!(snapshot[&EntityGroup::Gpu][&counter("A")].len(), 2);
    }

    #[tokio::test]
    async fn collector_error_discards_partial_results() {
        let registry = Registry::new();
        registry.register(
            EntityGroup::Gpu,
            Arc::new(StaticCollector {
                group: EntityGroup::Gpu,
                counter: counter("A"),
                values: vec!["1"],
                fail: false,
            }),
        );
        registry.register(
            EntityGroup::Gpu,
            Arc::new(StaticCollector {
                group: EntityGroup::Gpu,
                counter: counter("B"),
                values: vec![],
                fail: true,
            }),
        );
        assert!(registry.gather().await.is_err());
    }
}
