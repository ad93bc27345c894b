//! Periodic health polling and per-service metrics.
//!
//! Every sweep probes all registered services concurrently, folds each result
//! into that service's [`ServiceMetrics`], and publishes `service_metrics` and
//! `system_metrics` events. A `healthy <-> unhealthy` flip additionally emits
//! one `service_health_alert` event and one user-facing notification.
//!
//! A failed probe never escapes the sweep; it is recorded as unhealthy.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::json;
use switchboard_core::{ClockSource, HealthAlert, MessageType, ServiceMetrics, ServiceStatus, SystemClock, SystemMetrics};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, PublishOptions};
use crate::notify::{LogNotifier, Notification, NotificationLevel, Notifier};
use crate::worker::{BackgroundRunnable, BackgroundWorker};

/// Source of health verdicts for the monitor.
///
/// [`ServiceRegistry`](crate::ServiceRegistry) is the production implementation.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Services to check on every sweep.
    fn service_ids(&self) -> Vec<String>;

    /// Returns `true` if the service answered its health check successfully.
    async fn probe(&self, service_id: &str) -> bool;
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct MonitorState {
    probe: Arc<dyn HealthProbe>,
    bus: Arc<MessageBus>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn ClockSource>,
    metrics: DashMap<String, ServiceMetrics>,
}

struct CheckOutcome {
    metrics: ServiceMetrics,
    alert: Option<HealthAlert>,
}

impl MonitorState {
    async fn check_service(&self, service_id: &str) -> CheckOutcome {
        let started = Instant::now();
        let healthy = self.probe.probe(service_id).await;
        let elapsed = started.elapsed();
        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = elapsed.as_millis() as u64;
        let checked_at = self.clock.now_millis();

        metrics::histogram!("switchboard_health_check_duration_ms", "service" => service_id.to_string())
            .record(elapsed.as_secs_f64() * 1000.0);
        metrics::gauge!("switchboard_service_healthy", "service" => service_id.to_string())
            .set(if healthy { 1.0 } else { 0.0 });

        let (metrics, previous) = {
            let mut entry = self
                .metrics
                .entry(service_id.to_string())
                .or_insert_with(|| ServiceMetrics::new(service_id));
            let previous = entry.record_check(healthy, elapsed_ms, checked_at);
            (entry.clone(), previous)
        };

        let alert = previous.is_transition_to(metrics.status).then(|| HealthAlert {
            service_id: service_id.to_string(),
            previous,
            current: metrics.status,
            response_time_ms: elapsed_ms,
            error_count: metrics.error_count,
            timestamp: checked_at,
        });
        debug!(service = service_id, healthy, elapsed_ms, "health check recorded");
        CheckOutcome { metrics, alert }
    }

    async fn sweep(&self) -> SystemMetrics {
        let ids = self.probe.service_ids();
        let outcomes = join_all(ids.iter().map(|id| self.check_service(id))).await;

        for outcome in outcomes {
            self.bus
                .publish(MessageType::ServiceMetrics, json!(outcome.metrics), PublishOptions::no_retry())
                .await;
            if let Some(alert) = outcome.alert {
                self.raise_alert(alert).await;
            }
        }

        let system = self.system_metrics();
        self.bus
            .publish(MessageType::SystemMetrics, json!(system), PublishOptions::no_retry())
            .await;
        system
    }

    async fn raise_alert(&self, alert: HealthAlert) {
        let notification = match alert.current {
            ServiceStatus::Unhealthy => {
                warn!(service = %alert.service_id, error_count = alert.error_count, "service became unhealthy");
                Notification::new(
                    NotificationLevel::Warning,
                    "Service unhealthy",
                    format!("{} stopped answering its health check", alert.service_id),
                )
            }
            _ => {
                info!(service = %alert.service_id, "service recovered");
                Notification::new(
                    NotificationLevel::Info,
                    "Service recovered",
                    format!("{} is healthy again", alert.service_id),
                )
            }
        };
        self.notifier.notify(notification);
        self.bus
            .publish(MessageType::ServiceHealthAlert, json!(alert), PublishOptions::no_retry())
            .await;
    }

    fn system_metrics(&self) -> SystemMetrics {
        let snapshot: Vec<ServiceMetrics> = self.metrics.iter().map(|e| e.value().clone()).collect();
        SystemMetrics::aggregate(&snapshot)
    }
}

// ---------------------------------------------------------------------------
// Sweeper runnable
// ---------------------------------------------------------------------------

/// Commands accepted by the polling loop.
#[derive(Debug)]
pub enum MonitorCommand {
    /// Run a sweep now, outside the regular schedule.
    CheckNow,
}

struct HealthSweeper {
    state: Arc<MonitorState>,
}

#[async_trait]
impl BackgroundRunnable for HealthSweeper {
    type Task = MonitorCommand;

    fn name(&self) -> &'static str {
        "health-monitor"
    }

    async fn run(&mut self, task: MonitorCommand) {
        match task {
            MonitorCommand::CheckNow => {
                self.state.sweep().await;
            }
        }
    }

    async fn on_tick(&mut self) {
        self.state.sweep().await;
    }
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

/// Polls service health on an interval and keeps per-service metrics.
pub struct HealthMonitor {
    state: Arc<MonitorState>,
    worker: tokio::sync::Mutex<Option<BackgroundWorker<HealthSweeper>>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(probe: Arc<dyn HealthProbe>, bus: Arc<MessageBus>) -> Self {
        Self::with_parts(probe, bus, Arc::new(SystemClock), Arc::new(LogNotifier))
    }

    #[must_use]
    pub fn with_parts(
        probe: Arc<dyn HealthProbe>,
        bus: Arc<MessageBus>,
        clock: Arc<dyn ClockSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            state: Arc::new(MonitorState {
                probe,
                bus,
                notifier,
                clock,
                metrics: DashMap::new(),
            }),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Starts polling every `interval`. A no-op if already monitoring.
    pub async fn start_monitoring(&self, interval: Duration) {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(BackgroundWorker::is_running) {
            debug!("health monitoring already running");
            return;
        }
        info!(interval = ?interval, "health monitoring started");
        *worker = Some(BackgroundWorker::start(
            HealthSweeper {
                state: Arc::clone(&self.state),
            },
            interval,
        ));
    }

    /// Stops polling. Idempotent.
    pub async fn stop_monitoring(&self) {
        if let Some(mut worker) = self.worker.lock().await.take() {
            worker.stop().await;
            info!("health monitoring stopped");
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(BackgroundWorker::is_running)
    }

    /// Asks the polling loop to sweep now without waiting for the result.
    ///
    /// # Errors
    ///
    /// Returns an error if monitoring is not running.
    pub async fn request_check(&self) -> anyhow::Result<()> {
        match self.worker.lock().await.as_ref() {
            Some(worker) => worker.submit(MonitorCommand::CheckNow).await,
            None => Err(anyhow::anyhow!("health monitoring not running")),
        }
    }

    /// Runs one sweep immediately and returns the resulting aggregate.
    pub async fn check_all(&self) -> SystemMetrics {
        self.state.sweep().await
    }

    /// Metrics of one service, `None` if it was never checked.
    #[must_use]
    pub fn get_service_metrics(&self, service_id: &str) -> Option<ServiceMetrics> {
        self.state.metrics.get(service_id).map(|m| m.clone())
    }

    /// Metrics of every checked service, sorted by service id.
    #[must_use]
    pub fn get_all_metrics(&self) -> Vec<ServiceMetrics> {
        let mut all: Vec<ServiceMetrics> = self.state.metrics.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        all
    }

    #[must_use]
    pub fn get_system_metrics(&self) -> SystemMetrics {
        self.state.system_metrics()
    }

    /// Plain-text summary of the current metrics.
    #[must_use]
    pub fn generate_health_report(&self) -> String {
        let system = self.get_system_metrics();
        let mut out = String::from("Service Health Report\n=====================\n");
        let _ = writeln!(
            out,
            "Services: {} total, {} healthy, {} unhealthy",
            system.total_services, system.healthy_services, system.unhealthy_services
        );
        let _ = writeln!(out, "Average response time: {:.1}ms", system.average_response_time_ms);
        let _ = writeln!(out, "Requests: {}, errors: {}", system.total_requests, system.total_errors);
        for m in self.get_all_metrics() {
            let _ = write!(
                out,
                "\n[{}] {} {}ms errors {}/{}",
                m.status.as_str(),
                m.service_id,
                m.response_time_ms,
                m.error_count,
                m.request_count
            );
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
