//! Phased teardown: resources are released phase by phase in a fixed order,
//! concurrently within a phase, under one overall deadline.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Stop taking work and let in-flight work finish
    Drain,
    /// Push buffered output to its destination
    Flush,
    /// Close clients of external services
    External,
    /// Logging and metrics
    Observe,
    /// Storage and broker files
    Datastore,
}

impl Phase {
    pub const ORDER: [Phase; 5] = [
        Phase::Drain,
        Phase::Flush,
        Phase::External,
        Phase::Observe,
        Phase::Datastore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Drain => "drain",
            Phase::Flush => "flush",
            Phase::External => "external",
            Phase::Observe => "observe",
            Phase::Datastore => "datastore",
        }
    }
}

#[async_trait]
pub trait Releasable: Send + Sync {
    fn name(&self) -> &str;
    async fn release(&self) -> Result<()>;
}

struct FnRelease<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> Releasable for FnRelease<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn release(&self) -> Result<()> {
        (self.f)().await
    }
}

pub fn release_fn<F, Fut>(name: &str, f: F) -> Arc<dyn Releasable>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnRelease {
        name: name.to_string(),
        f,
    })
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: Vec<Phase>,
    /// (phase, resource, error)
    pub failures: Vec<(Phase, String, String)>,
    /// The phase that was running or due when the deadline passed
    pub aborted_at: Option<Phase>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.aborted_at.is_none()
    }
}

#[derive(Default)]
pub struct ShutdownPlan {
    phases: BTreeMap<Phase, Vec<Arc<dyn Releasable>>>,
}

impl ShutdownPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, phase: Phase, resource: Arc<dyn Releasable>) -> &mut Self {
        self.phases.entry(phase).or_default().push(resource);
        self
    }

    /// Release everything, giving up on the remaining phases once `deadline`
    /// has elapsed. A failing resource does not stop its phase or later ones.
    pub async fn execute(self, deadline: Duration) -> ShutdownReport {
        let started = Instant::now();
        let mut report = ShutdownReport::default();

        for phase in Phase::ORDER {
            let Some(resources) = self.phases.get(&phase) else {
                report.completed.push(phase);
                continue;
            };

            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!("Shutdown deadline passed before phase {}", phase.as_str());
                report.aborted_at = Some(phase);
                break;
            }

            info!("Shutdown phase {}: releasing {} resources", phase.as_str(), resources.len());
            let releases = resources.iter().map(|r| async move { (r.name().to_string(), r.release().await) });
            match tokio::time::timeout(remaining, futures_util::future::join_all(releases)).await {
                Ok(results) => {
                    for (name, res) in results {
                        if let Err(e) = res {
                            error!("Failed to release {} during {}: {}", name, phase.as_str(), e);
                            report.failures.push((phase, name, e.to_string()));
                        }
                    }
                    report.completed.push(phase);
                }
                Err(_) => {
                    warn!("Shutdown deadline passed during phase {}", phase.as_str());
                    report.aborted_at = Some(phase);
                    break;
                }
            }
        }

        info!(
            "Shutdown finished in {:?} ({} phases, {} failures{})",
            started.elapsed(),
            report.completed.len(),
            report.failures.len(),
            if report.aborted_at.is_some() { ", aborted" } else { "" }
        );
        report
    }
}
