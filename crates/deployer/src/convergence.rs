//! Convergence polling.
//!
//! After reconciliation the poller lists the workload's pods on a fixed
//! interval until every observed pod is `Running` and their number matches
//! the expected replica count. Each tick first checks the cancellation token,
//! the deadline and the tick budget.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::DeployError;
use crate::gateway::{or_cancelled, ClusterGateway, PodPhase, PodSummary};
use crate::reconcile::ReconciliationResult;
use crate::selector::LabelSelector;

/// Fixed pause between ticks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Time after which a rollout that has not converged is reported as failed.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(600);

/// Bounds of one polling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    /// `None` polls until converged or cancelled.
    pub timeout: Option<Duration>,
    /// Maximum number of observations; `None` for no limit.
    pub max_ticks: Option<u64>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: Some(DEFAULT_POLL_TIMEOUT),
            max_ticks: None,
        }
    }
}

/// Pods matching the workload's selector at one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodObservation {
    pub total: usize,
    pub running: usize,
    /// Pod count per reported phase.
    pub phases: BTreeMap<String, usize>,
}

/// Whether an observation satisfies the expected replica count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceState {
    Converged,
    Progressing { running: usize, total: usize },
}

impl PodObservation {
    pub fn from_pods(pods: &[PodSummary]) -> Self {
        let mut phases = BTreeMap::new();
        for pod in pods {
            *phases.entry(pod.phase.to_string()).or_insert(0) += 1;
        }
        Self {
            total: pods.len(),
            running: pods
                .iter()
                .filter(|pod| pod.phase == PodPhase::Running)
                .count(),
            phases,
        }
    }

    /// Converged iff at least one pod runs, every observed pod runs, and the
    /// running count equals `expected`.
    pub fn evaluate(&self, expected: i32) -> ConvergenceState {
        let matches_expected =
            usize::try_from(expected).is_ok_and(|expected| self.running == expected);

        if self.running > 0 && self.running == self.total && matches_expected {
            ConvergenceState::Converged
        } else {
            ConvergenceState::Progressing {
                running: self.running,
                total: self.total,
            }
        }
    }

    fn phase_breakdown(&self) -> String {
        if self.phases.is_empty() {
            return String::new();
        }
        let parts = self
            .phases
            .iter()
            .map(|(phase, count)| format!("{phase}={count}"))
            .collect::<Vec<_>>();
        format!(" [{}]", parts.join(", "))
    }
}

/// Summary of a successful polling session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceReport {
    pub ticks: u64,
    pub elapsed: Duration,
    pub observation: PodObservation,
}

/// Polls the gateway until a reconciled workload converges.
pub struct ConvergencePoller<'a> {
    gateway: &'a dyn ClusterGateway,
    settings: PollSettings,
}

impl<'a> ConvergencePoller<'a> {
    pub fn new(gateway: &'a dyn ClusterGateway, settings: PollSettings) -> Self {
        Self { gateway, settings }
    }

    /// Block until the workload converges, the session is cancelled, or its
    /// deadline or tick budget runs out.
    pub async fn await_ready(
        &self,
        result: &ReconciliationResult,
        cancel: &CancellationToken,
    ) -> Result<ConvergenceReport, DeployError> {
        let selector = LabelSelector::from_labels(&result.labels)?;
        let start = Instant::now();
        let deadline = self.settings.timeout.map(|timeout| start + timeout);
        let mut ticks: u64 = 0;
        let mut last = PodObservation::default();

        debug!(
            name = %result.name,
            selector = %selector,
            expected = result.expected_replicas,
            "Waiting for pods to converge"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(DeployError::Cancelled {
                    name: result.name.clone(),
                    ticks,
                });
            }

            let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
            let exhausted = self.settings.max_ticks.is_some_and(|max| ticks >= max);
            if expired || exhausted {
                return Err(DeployError::ConvergenceFailed {
                    name: result.name.clone(),
                    running: last.running,
                    total: last.total,
                    expected: result.expected_replicas,
                    ticks,
                    elapsed: start.elapsed(),
                    phases: last.phase_breakdown(),
                });
            }

            let Some(pods) = or_cancelled(cancel, self.gateway.list_pods(selector.as_str())).await
            else {
                return Err(DeployError::Cancelled {
                    name: result.name.clone(),
                    ticks,
                });
            };
            let pods = pods?;
            ticks += 1;
            let observation = PodObservation::from_pods(&pods);

            match observation.evaluate(result.expected_replicas) {
                ConvergenceState::Converged => {
                    info!(
                        name = %result.name,
                        running = observation.running,
                        ticks,
                        "Pods are ready"
                    );
                    return Ok(ConvergenceReport {
                        ticks,
                        elapsed: start.elapsed(),
                        observation,
                    });
                }
                ConvergenceState::Progressing { running, total } => {
                    info!(
                        name = %result.name,
                        running,
                        total,
                        expected = result.expected_replicas,
                        "Waiting for pods to become ready"
                    );
                }
            }
            last = observation;

            let pause = deadline.map_or(self.settings.interval, |deadline| {
                self.settings
                    .interval
                    .min(deadline.saturating_duration_since(Instant::now()))
            });

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(DeployError::Cancelled {
                        name: result.name.clone(),
                        ticks,
                    });
                }
                () = tokio::time::sleep(pause) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::fake::{pods, FakeGateway};
    use crate::reconcile::ReconcileAction;
    use crate::selector::LabelSet;

    fn observe(phases: &[&str]) -> PodObservation {
        PodObservation::from_pods(&pods(phases))
    }

    fn reconciled(expected: i32) -> ReconciliationResult {
        let mut labels = LabelSet::new();
        labels.insert("app".to_string(), "web".to_string());
        ReconciliationResult {
            name: "web".to_string(),
            action: ReconcileAction::Updated,
            labels,
            expected_replicas: expected,
        }
    }

    fn settings(timeout: Option<u64>, max_ticks: Option<u64>) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(5),
            timeout: timeout.map(Duration::from_secs),
            max_ticks,
        }
    }

    #[test]
    fn test_all_running_at_expected_count_converges() {
        assert_eq!(
            observe(&["Running", "Running", "Running"]).evaluate(3),
            ConvergenceState::Converged
        );
    }

    #[test]
    fn test_any_non_running_pod_blocks_convergence() {
        assert_eq!(
            observe(&["Running", "Running", "Pending"]).evaluate(3),
            ConvergenceState::Progressing {
                running: 2,
                total: 3
            }
        );
        // Running count matches, but a failed pod is still observed.
        assert!(matches!(
            observe(&["Running", "Running", "Failed"]).evaluate(2),
            ConvergenceState::Progressing { .. }
        ));
    }

    #[test]
    fn test_no_pods_never_converges() {
        assert!(matches!(
            observe(&[]).evaluate(0),
            ConvergenceState::Progressing {
                running: 0,
                total: 0
            }
        ));
        assert!(matches!(
            observe(&[]).evaluate(3),
            ConvergenceState::Progressing { .. }
        ));
    }

    #[test]
    fn test_count_mismatch_blocks_convergence() {
        assert!(matches!(
            observe(&["Running", "Running", "Running", "Running"]).evaluate(3),
            ConvergenceState::Progressing { .. }
        ));
        assert!(matches!(
            observe(&["Running"]).evaluate(0),
            ConvergenceState::Progressing { .. }
        ));
        assert!(matches!(
            observe(&["Running"]).evaluate(-1),
            ConvergenceState::Progressing { .. }
        ));
    }

    #[test]
    fn test_phase_match_is_case_sensitive() {
        let observation = observe(&["running", "Running"]);
        assert_eq!(observation.running, 1);
        assert!(matches!(
            observation.evaluate(2),
            ConvergenceState::Progressing { .. }
        ));
    }

    #[test]
    fn test_phase_breakdown() {
        let observation = observe(&["Running", "Pending", "Running"]);
        assert_eq!(observation.phase_breakdown(), " [Pending=1, Running=2]");
        assert_eq!(PodObservation::default().phase_breakdown(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_converged() {
        let gateway = FakeGateway::new().with_pod_script(vec![
            pods(&[]),
            pods(&["Pending", "Pending", "Pending"]),
            pods(&["Running", "Running", "Pending"]),
            pods(&["Running", "Running", "Running"]),
        ]);
        let cancel = CancellationToken::new();

        let report = ConvergencePoller::new(&gateway, settings(Some(600), None))
            .await_ready(&reconciled(3), &cancel)
            .await
            .unwrap();

        assert_eq!(report.ticks, 4);
        assert_eq!(report.elapsed, Duration::from_secs(15));
        assert_eq!(report.observation.running, 3);
        assert_eq!(gateway.calls().list, 4);
        assert!(gateway.selectors().iter().all(|s| s == "app=web"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_expected_with_no_pods_exhausts_tick_budget() {
        let gateway = FakeGateway::new().with_pod_script(vec![pods(&[])]);
        let cancel = CancellationToken::new();

        let err = ConvergencePoller::new(&gateway, settings(None, Some(3)))
            .await_ready(&reconciled(0), &cancel)
            .await
            .unwrap_err();

        match err {
            DeployError::ConvergenceFailed {
                ticks,
                running,
                total,
                expected,
                ..
            } => {
                assert_eq!((ticks, running, total, expected), (3, 0, 0, 0));
            }
            other => panic!("expected ConvergenceFailed, got {other:?}"),
        }
        assert_eq!(gateway.calls().list, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_last_observation() {
        let gateway =
            FakeGateway::new().with_pod_script(vec![pods(&["Running", "CrashLoopBackOff"])]);
        let cancel = CancellationToken::new();

        let err = ConvergencePoller::new(&gateway, settings(Some(12), None))
            .await_ready(&reconciled(2), &cancel)
            .await
            .unwrap_err();

        match err {
            DeployError::ConvergenceFailed {
                ticks,
                running,
                total,
                elapsed,
                phases,
                ..
            } => {
                // Observations at 0s, 5s and 10s; the last sleep is cut to the deadline.
                assert_eq!(ticks, 3);
                assert_eq!((running, total), (1, 2));
                assert_eq!(elapsed, Duration::from_secs(12));
                assert!(phases.contains("CrashLoopBackOff=1"));
            }
            other => panic!("expected ConvergenceFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_sleep() {
        let gateway = FakeGateway::new().with_pod_script(vec![pods(&["Pending"])]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let err = ConvergencePoller::new(&gateway, settings(None, None))
            .await_ready(&reconciled(1), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Cancelled { ticks: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_listing_yields_to_cancellation() {
        let gateway = FakeGateway::new().hanging_list();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });

        let err = ConvergencePoller::new(&gateway, settings(None, None))
            .await_ready(&reconciled(1), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Cancelled { ticks: 0, .. }));
        assert_eq!(gateway.calls().list, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_cancelled_token_skips_listing() {
        let gateway = FakeGateway::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ConvergencePoller::new(&gateway, PollSettings::default())
            .await_ready(&reconciled(1), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Cancelled { ticks: 0, .. }));
        assert_eq!(gateway.calls().list, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_failure_is_fatal() {
        let gateway = FakeGateway::new().failing_list(500);
        let cancel = CancellationToken::new();

        let err = ConvergencePoller::new(&gateway, PollSettings::default())
            .await_ready(&reconciled(1), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeployError::Gateway(GatewayError::Api { code: 500, .. })
        ));
        assert_eq!(gateway.calls().list, 1);
    }

    #[tokio::test]
    async fn test_empty_label_set_fails_before_listing() {
        let gateway = FakeGateway::new();
        let mut result = reconciled(1);
        result.labels.clear();

        let err = ConvergencePoller::new(&gateway, PollSettings::default())
            .await_ready(&result, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::InvalidSelector(_)));
        assert_eq!(gateway.calls().list, 0);
    }
}
