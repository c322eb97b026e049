//! The operations the control surface drives: run, stop, status.
//!
//! [`Simulator`] owns the [`SimulationRegistry`] and the collaborators
//! every runner is built with. Run and stop requests for one environment
//! are serialized through the registry's per-environment lock; requests
//! for different environments never wait on each other.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use fleetsim_types::{EnvironmentStatus, RunId, RunState, UnitKind, UnitStatus};

use crate::config::SimulatorConfig;
use crate::error::SimError;
use crate::registry::SimulationRegistry;
use crate::runner::{EnvironmentRunner, RunOptions, RunnerDeps};
use crate::source::FileUnitSource;
use crate::transport::{StreamConnector, TelemetryPoster};

/// A run request after parsing and validation.
#[derive(Debug, Clone, Default)]
pub struct RunParams {
    /// Target environment.
    pub env: String,
    /// Operator units requested by identifier.
    pub operators: Vec<String>,
    /// Vehicle units requested by identifier.
    pub vehicles: Vec<String>,
    /// Also run every operator with a unit file in the environment.
    pub all_operators: bool,
    /// Also run every vehicle with a unit file in the environment.
    pub all_vehicles: bool,
    /// Duration, speed, and inline routes.
    pub options: RunOptions,
}

/// Connect-phase result of a run request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Identifier shared by the runners this request started.
    pub run_id: RunId,
    /// Target environment.
    pub env: String,
    /// One status per operator unit.
    pub operators: Vec<UnitStatus>,
    /// One status per vehicle unit.
    pub vehicles: Vec<UnitStatus>,
}

/// Entry point for starting, stopping, and inspecting simulations.
#[derive(Debug)]
pub struct Simulator {
    deps: RunnerDeps,
    registry: Arc<SimulationRegistry>,
}

impl Simulator {
    /// A simulator reading unit files from the configured data directory.
    pub fn new(
        config: SimulatorConfig,
        connector: Arc<dyn StreamConnector>,
        poster: Arc<dyn TelemetryPoster>,
    ) -> Self {
        let source = Arc::new(FileUnitSource::new(config.data_dir.clone()));
        Self::with_deps(RunnerDeps {
            config: Arc::new(config),
            source,
            connector,
            poster,
        })
    }

    /// A simulator built from explicit collaborators.
    pub fn with_deps(deps: RunnerDeps) -> Self {
        Self {
            deps,
            registry: Arc::new(SimulationRegistry::new()),
        }
    }

    /// The simulator configuration.
    pub fn config(&self) -> &SimulatorConfig {
        &self.deps.config
    }

    /// The registry of active runners and links.
    pub const fn registry(&self) -> &Arc<SimulationRegistry> {
        &self.registry
    }

    /// Start the requested units.
    ///
    /// For each kind with at least one unit, the environment's previous
    /// runner of that kind is stopped and evicted first. Returns once every
    /// unit has been connected or has failed; sessions keep running in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::UnknownEnvironment`] if `params.env` is not
    /// configured. Per-unit failures are reported in the statuses instead.
    pub async fn run(&self, params: RunParams) -> Result<RunReport, SimError> {
        self.deps.config.environment(&params.env)?;
        let _guard = self.registry.lock_env(&params.env).await;

        let operators = self.units_for(
            UnitKind::Operator,
            &params.env,
            &params.operators,
            params.all_operators,
            params.options.operator_overrides.keys(),
        );
        let vehicles = self.units_for(
            UnitKind::Vehicle,
            &params.env,
            &params.vehicles,
            params.all_vehicles,
            params.options.vehicle_overrides.keys(),
        );

        let run_id = RunId::new();
        let options = Arc::new(params.options);
        info!(
            env = %params.env,
            run = %run_id,
            operators = operators.len(),
            vehicles = vehicles.len(),
            "run requested"
        );

        let operators = self
            .start(UnitKind::Operator, &params.env, operators, run_id, &options)
            .await;
        let vehicles = self
            .start(UnitKind::Vehicle, &params.env, vehicles, run_id, &options)
            .await;

        Ok(RunReport {
            run_id,
            env: params.env,
            operators,
            vehicles,
        })
    }

    async fn start(
        &self,
        kind: UnitKind,
        env: &str,
        units: Vec<String>,
        run_id: RunId,
        options: &Arc<RunOptions>,
    ) -> Vec<UnitStatus> {
        if units.is_empty() {
            return Vec::new();
        }
        if let Some(previous) = self.registry.remove_runner(kind, env) {
            info!(%env, %kind, run = %previous.run_id(), "evicting previous runner");
            previous.stop_all();
        }

        let runner = Arc::new(
            EnvironmentRunner::new(
                env,
                kind,
                units,
                self.deps.clone(),
                Arc::clone(options),
                Some(&self.registry),
            )
            .with_run_id(run_id),
        );
        runner.run().await
    }

    /// Explicit units, then discovered units, then override keys, without
    /// duplicates.
    fn units_for<'a>(
        &self,
        kind: UnitKind,
        env: &str,
        explicit: &[String],
        all: bool,
        overrides: impl Iterator<Item = &'a String>,
    ) -> Vec<String> {
        let discovered = if all {
            self.deps.source.discover(kind, env)
        } else {
            Vec::new()
        };
        let mut seen = HashSet::new();
        explicit
            .iter()
            .cloned()
            .chain(discovered)
            .chain(overrides.cloned())
            .filter(|unit| seen.insert(unit.clone()))
            .collect()
    }

    /// Stop one environment, or every environment when `env` is `None`.
    /// Always succeeds; stopping an idle environment is a no-op.
    pub async fn stop(&self, env: Option<&str>) {
        match env {
            Some(env) => self.stop_env(env).await,
            None => {
                for env in self.known_environments() {
                    self.stop_env(&env).await;
                }
                // Anything registered after the listing above.
                for env in self.registry.environments() {
                    self.stop_env(&env).await;
                }
                info!("all environments stopped");
            }
        }
    }

    async fn stop_env(&self, env: &str) {
        let _guard = self.registry.lock_env(env).await;
        let runners = self.registry.clear_env(env);
        let stopped = runners.len();
        for runner in runners {
            runner.stop_all();
        }
        info!(%env, runners = stopped, "environment stopped");
    }

    /// Status of one environment, or of every configured or active
    /// environment when `env` is `None`.
    pub fn status(&self, env: Option<&str>) -> Vec<EnvironmentStatus> {
        match env {
            Some(env) => vec![self.env_status(env)],
            None => self
                .known_environments()
                .iter()
                .map(|env| self.env_status(env))
                .collect(),
        }
    }

    fn env_status(&self, env: &str) -> EnvironmentStatus {
        let runs = self.registry.runs(env);
        let active_units = self.registry.active_units(env);
        let status = if self.registry.is_running(env) || active_units > 0 {
            RunState::Running
        } else {
            RunState::Stopped
        };
        EnvironmentStatus {
            env: env.to_owned(),
            status,
            runs,
            active_units,
        }
    }

    fn known_environments(&self) -> Vec<String> {
        let mut envs: BTreeSet<String> = self.deps.config.environments.keys().cloned().collect();
        envs.extend(self.registry.environments());
        envs.into_iter().collect()
    }

    /// Unit identifiers with a unit file for `kind` in `env`.
    pub fn discover(&self, kind: UnitKind, env: &str) -> Vec<String> {
        self.deps.source.discover(kind, env)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::time::Duration;

    use fleetsim_types::{ConnectState, OperatorOverride, RawCoordinate, VehicleOverride};

    use super::*;
    use crate::transport::{LoopbackConnector, Outbound, RecordingPoster};

    const CONFIG: &str = r#"
environments:
  dev:
    stream_url: ws://collector.test/ws
    connector_url: http://connector.test
    operator_tokens:
      "01": one
      "02": two
  demo:
    stream_url: ws://collector.demo/ws
    connector_url: http://connector.demo
    operator_tokens:
      "01": demo-one
"#;

    fn simulator() -> (Simulator, Arc<LoopbackConnector>, Arc<RecordingPoster>) {
        let connector = Arc::new(LoopbackConnector::new());
        let poster = Arc::new(RecordingPoster::new());
        let mut config = SimulatorConfig::from_yaml_str(CONFIG).unwrap();
        config.data_dir = std::env::temp_dir().join("fleetsim-simulator-none");
        let sim = Simulator::new(config, connector.clone(), poster.clone());
        (sim, connector, poster)
    }

    fn route() -> Vec<RawCoordinate> {
        vec![
            RawCoordinate::Pair([106.546_830_29, 58.032_565_97]),
            RawCoordinate::Pair([106.538_4, 58.034_09]),
        ]
    }

    fn params(env: &str, operators: &[&str], vehicles: &[&str]) -> RunParams {
        RunParams {
            env: env.to_owned(),
            options: RunOptions {
                operator_overrides: operators
                    .iter()
                    .map(|u| ((*u).to_owned(), OperatorOverride::Coords(route())))
                    .collect(),
                vehicle_overrides: vehicles
                    .iter()
                    .map(|u| ((*u).to_owned(), VehicleOverride::Coords(route())))
                    .collect(),
                ..RunOptions::default()
            },
            ..RunParams::default()
        }
    }

    fn state(sim: &Simulator, env: &str) -> RunState {
        sim.status(Some(env))[0].status
    }

    #[tokio::test(start_paused = true)]
    async fn run_then_stop_flips_status() {
        let (sim, _, _) = simulator();
        assert_eq!(state(&sim, "dev"), RunState::Stopped);

        let report = sim.run(params("dev", &["1"], &["5"])).await.unwrap();
        assert_eq!(report.operators, vec![UnitStatus::ok("1", ConnectState::Connected)]);
        assert_eq!(report.vehicles, vec![UnitStatus::ok("5", ConnectState::Ready)]);
        assert_eq!(state(&sim, "dev"), RunState::Running);
        let runs = sim.status(Some("dev"))[0].runs.clone();
        assert_eq!(runs, vec![report.run_id, report.run_id]);

        sim.stop(Some("dev")).await;
        assert_eq!(state(&sim, "dev"), RunState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_evicts_previous_runner_of_same_kind() {
        let (sim, connector, _) = simulator();
        let first = sim.run(params("dev", &["1"], &[])).await.unwrap();
        let second = sim.run(params("dev", &["2"], &[])).await.unwrap();
        assert_ne!(first.run_id, second.run_id);

        let status = &sim.status(Some("dev"))[0];
        assert_eq!(status.runs, vec![second.run_id]);
        assert_eq!(sim.registry().link_count("dev"), 1);

        let mut peers = connector.take_peers();
        assert_eq!(peers[0].1.drain(), vec![Outbound::Close]);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(peers[0].1.drain_texts().is_empty());
        assert!(!peers[1].1.drain_texts().is_empty());

        sim.stop(None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_one_environment_leaves_others_running() {
        let (sim, _, _) = simulator();
        sim.run(params("dev", &["1"], &[])).await.unwrap();
        sim.run(params("demo", &["1"], &[])).await.unwrap();

        sim.stop(Some("dev")).await;
        assert_eq!(state(&sim, "dev"), RunState::Stopped);
        assert_eq!(state(&sim, "demo"), RunState::Running);

        sim.stop(None).await;
        let all = sim.status(None);
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|s| s.status == RunState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_waits_for_a_run_in_progress() {
        let (sim, _, _) = simulator();
        let guard = sim.registry().lock_env("dev").await;

        let stop = sim.stop(None);
        tokio::pin!(stop);
        let early = tokio::time::timeout(Duration::from_millis(50), &mut stop).await;
        assert!(early.is_err());

        // The in-progress run registers its link before releasing the lock.
        let (connection, mut peer) = crate::transport::StreamConnection::pair();
        sim.registry().set_link("dev", "1", connection.link);
        drop(guard);

        stop.await;
        assert_eq!(state(&sim, "dev"), RunState::Stopped);
        assert_eq!(peer.drain(), vec![Outbound::Close]);
    }

    #[tokio::test]
    async fn unknown_environment_is_rejected() {
        let (sim, _, _) = simulator();
        let err = sim.run(params("stage", &["1"], &[])).await.unwrap_err();
        assert!(matches!(err, SimError::UnknownEnvironment(_)));
    }

    #[tokio::test]
    async fn empty_kinds_are_skipped() {
        let (sim, connector, _) = simulator();
        let report = sim.run(params("dev", &[], &[])).await.unwrap();
        assert!(report.operators.is_empty());
        assert!(report.vehicles.is_empty());
        assert!(connector.connected_units().is_empty());
        assert_eq!(state(&sim, "dev"), RunState::Stopped);
    }

    #[tokio::test]
    async fn explicit_units_come_before_override_keys() {
        let (sim, _, _) = simulator();
        let mut request = params("dev", &["2", "1"], &[]);
        request.operators = vec!["1".to_owned(), "3".to_owned()];
        let report = sim.run(request).await.unwrap();
        let units: Vec<&str> = report.operators.iter().map(|s| s.unit.as_str()).collect();
        assert_eq!(units, vec!["1", "3", "2"]);
        sim.stop(None).await;
    }
}
