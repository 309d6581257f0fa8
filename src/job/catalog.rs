use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ServiceCatalog;

use super::Job;

/// Builds one job instance bound to a region.
pub type JobFactory = Arc<dyn Fn(&str) -> Arc<dyn Job> + Send + Sync>;

/// Registry mapping `(service, metric)` pairs to job factories.
///
/// The catalogue names which metrics are enabled; the registry supplies
/// the code that collects them. Keeping the two apart lets hosts register
/// only the collectors their credentials can serve.
#[derive(Default)]
pub struct JobRegistry {
    factories: HashMap<(String, String), JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the factory for one service metric, replacing any
    /// previous registration.
    pub fn register(
        &mut self,
        service: impl Into<String>,
        metric: impl Into<String>,
        factory: JobFactory,
    ) {
        self.factories
            .insert((service.into(), metric.into()), factory);
    }

    /// Returns true if a factory is registered for the pair.
    pub fn supports(&self, service: &str, metric: &str) -> bool {
        self.factories
            .contains_key(&(service.to_string(), metric.to_string()))
    }

    /// Instantiates every enabled quota job across the given regions.
    ///
    /// Enabled metrics without a registered factory are skipped with a
    /// warning; the tick proceeds with whatever collectors exist.
    pub fn build_jobs(&self, catalog: &ServiceCatalog, regions: &[String]) -> Vec<Arc<dyn Job>> {
        let mut jobs = Vec::new();

        for (service, cfg) in &catalog.services {
            for metric in &cfg.quota_metrics {
                let key = (service.clone(), metric.name.clone());
                let Some(factory) = self.factories.get(&key) else {
                    warn!(
                        service = %service,
                        metric = %metric.name,
                        "no collector registered for enabled metric",
                    );
                    continue;
                };

                for region in regions {
                    jobs.push(factory(region));
                }

                debug!(
                    service = %service,
                    metric = %metric.name,
                    regions = regions.len(),
                    "jobs built",
                );
            }
        }

        jobs
    }
}
