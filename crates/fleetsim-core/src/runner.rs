//! Supervision of every unit of one kind in one environment.
//!
//! An [`EnvironmentRunner`] works in two phases. [`connect_all`] resolves
//! and connects every unit concurrently and reports a status per unit; one
//! unit failing never affects the others. [`run_in_background`] then
//! spawns a task per prepared unit and returns at once. [`run`] does both
//! and registers the runner with the [`SimulationRegistry`] in between.
//!
//! When a unit's session ends its task removes the unit from the runner
//! and, for the last unit, removes the runner from the registry.
//! [`stop_all`] stops everything the runner still owns and is safe to call
//! any number of times.
//!
//! [`connect_all`]: EnvironmentRunner::connect_all
//! [`run_in_background`]: EnvironmentRunner::run_in_background
//! [`run`]: EnvironmentRunner::run
//! [`stop_all`]: EnvironmentRunner::stop_all

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use tracing::{error, info, warn};

use fleetsim_types::{
    ConnectState, OperatorOverride, RunId, UnitKind, UnitStatus, VehicleOverride,
};

use crate::config::SimulatorConfig;
use crate::control::SessionControl;
use crate::error::SimError;
use crate::polled::{PollReport, PolledUnit};
use crate::registry::SimulationRegistry;
use crate::source::{FileUnitSource, UnitSource, resolve_operator, resolve_vehicle};
use crate::stream::{SessionReport, StreamUnit, connect_target};
use crate::transport::{
    LoopbackConnector, RecordingPoster, StreamConnection, StreamConnector, StreamLink,
    TelemetryPoster,
};

/// Shared collaborators every runner needs.
#[derive(Clone)]
pub struct RunnerDeps {
    /// Simulator configuration.
    pub config: Arc<SimulatorConfig>,
    /// Where unit definitions come from.
    pub source: Arc<dyn UnitSource>,
    /// Opens operator streams.
    pub connector: Arc<dyn StreamConnector>,
    /// Sends vehicle posts.
    pub poster: Arc<dyn TelemetryPoster>,
}

impl std::fmt::Debug for RunnerDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerDeps")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RunnerDeps {
    /// Default configuration, file units below the current directory, and
    /// in-memory transports. Nothing leaves the process.
    pub fn in_memory() -> Self {
        let config = SimulatorConfig::default();
        Self {
            source: Arc::new(FileUnitSource::new(config.data_dir.clone())),
            config: Arc::new(config),
            connector: Arc::new(LoopbackConnector::new()),
            poster: Arc::new(RecordingPoster::new()),
        }
    }
}

/// Per-run parameters taken from the run request.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overall duration. Stream units run until stopped without one;
    /// polled units fall back to the configured default.
    pub duration: Option<Duration>,
    /// Run-wide vehicle speed in m/s.
    pub speed_mps: Option<f64>,
    /// Inline operator routes keyed by unit.
    pub operator_overrides: BTreeMap<String, OperatorOverride>,
    /// Inline vehicle routes keyed by unit.
    pub vehicle_overrides: BTreeMap<String, VehicleOverride>,
}

/// How a unit's background session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// An operator session finished.
    Stream(SessionReport),
    /// A vehicle session finished.
    Polled(PollReport),
    /// A session failed with an error.
    Failed {
        /// Unit identifier.
        unit: String,
        /// Error message.
        error: String,
    },
}

/// A unit that passed the connect phase and is waiting to start.
enum Prepared {
    Stream(StreamUnit, StreamConnection),
    Polled(PolledUnit),
}

/// A unit whose session is running.
#[derive(Debug)]
struct ActiveUnit {
    control: Arc<SessionControl>,
    link: Option<StreamLink>,
}

#[derive(Default)]
struct RunnerState {
    stopped: bool,
    prepared: BTreeMap<String, Prepared>,
    active: BTreeMap<String, ActiveUnit>,
    finished: BTreeMap<String, SessionOutcome>,
}

/// Supervisor of the units of one kind in one environment.
pub struct EnvironmentRunner {
    run_id: RunId,
    env: String,
    kind: UnitKind,
    units: Vec<String>,
    deps: RunnerDeps,
    options: Arc<RunOptions>,
    registry: Option<Weak<SimulationRegistry>>,
    state: Mutex<RunnerState>,
}

impl std::fmt::Debug for EnvironmentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentRunner")
            .field("run_id", &self.run_id)
            .field("env", &self.env)
            .field("kind", &self.kind)
            .field("units", &self.units)
            .finish_non_exhaustive()
    }
}

impl EnvironmentRunner {
    /// Create a runner. Duplicate unit identifiers are dropped, keeping
    /// the first occurrence.
    pub fn new(
        env: &str,
        kind: UnitKind,
        units: Vec<String>,
        deps: RunnerDeps,
        options: Arc<RunOptions>,
        registry: Option<&Arc<SimulationRegistry>>,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let units = units
            .into_iter()
            .filter(|unit| seen.insert(unit.clone()))
            .collect();
        Self {
            run_id: RunId::new(),
            env: env.to_owned(),
            kind,
            units,
            deps,
            options,
            registry: registry.map(Arc::downgrade),
            state: Mutex::new(RunnerState::default()),
        }
    }

    /// Use `run_id` instead of a freshly generated identifier, so runners
    /// started by one request share it.
    #[must_use]
    pub const fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    /// Identifier of this run.
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Environment this runner drives.
    pub fn env(&self) -> &str {
        &self.env
    }

    /// Kind of unit this runner drives.
    pub const fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Units this runner was created with.
    pub fn units(&self) -> &[String] {
        &self.units
    }

    fn state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> Option<Arc<SimulationRegistry>> {
        self.registry.as_ref().and_then(Weak::upgrade)
    }

    /// Number of unit sessions currently running.
    pub fn active_units(&self) -> usize {
        self.state().active.len()
    }

    /// Latest outcome of each unit whose session has finished, in unit
    /// order. A unit that runs again replaces its earlier outcome.
    pub fn finished(&self) -> Vec<SessionOutcome> {
        self.state().finished.values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Connect phase
    // -----------------------------------------------------------------------

    /// Resolve and connect every unit concurrently.
    ///
    /// Returns one status per unit, in the order the units were given.
    pub async fn connect_all(&self) -> Vec<UnitStatus> {
        let attempts = self.units.iter().map(|unit| self.prepare(unit));
        let results = join_all(attempts).await;

        let mut statuses = Vec::with_capacity(results.len());
        let mut ready = Vec::new();
        for (unit, result) in self.units.iter().zip(results) {
            match result {
                Ok(prepared) => {
                    let state = match &prepared {
                        Prepared::Stream(_, connection) => {
                            if let Some(registry) = self.registry() {
                                registry.set_link(&self.env, unit, connection.link.clone());
                            }
                            ConnectState::Connected
                        }
                        Prepared::Polled(_) => ConnectState::Ready,
                    };
                    info!(env = %self.env, kind = %self.kind, %unit, status = ?state, "unit prepared");
                    statuses.push(UnitStatus::ok(unit.as_str(), state));
                    ready.push((unit.clone(), prepared));
                }
                Err(e) => {
                    warn!(env = %self.env, kind = %self.kind, %unit, error = %e, "unit failed to prepare");
                    statuses.push(UnitStatus::failed(unit.as_str(), &e));
                }
            }
        }

        let rejected = {
            let mut state = self.state();
            if state.stopped {
                ready
            } else {
                state.prepared.extend(ready);
                Vec::new()
            }
        };
        // Stopped while connecting: nothing prepared may outlive the stop.
        for (unit, prepared) in rejected {
            self.release(&unit, prepared_link(&prepared).as_ref());
        }

        statuses
    }

    /// Run `resolve` on the blocking pool, since unit sources read files.
    async fn resolve<T, F>(&self, unit: &str, resolve: F) -> Result<T, SimError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn UnitSource, &SimulatorConfig, &str, &str, &RunOptions) -> Result<T, SimError>
            + Send
            + 'static,
    {
        let source = Arc::clone(&self.deps.source);
        let config = Arc::clone(&self.deps.config);
        let options = Arc::clone(&self.options);
        let env = self.env.clone();
        let unit = unit.to_owned();
        tokio::task::spawn_blocking(move || {
            resolve(source.as_ref(), &config, &env, &unit, &options)
        })
        .await
        .map_err(std::io::Error::from)?
    }

    async fn prepare(&self, unit: &str) -> Result<Prepared, SimError> {
        let config = &*self.deps.config;
        match self.kind {
            UnitKind::Operator => {
                let plan = self
                    .resolve(unit, |source, config, env, unit, options| {
                        resolve_operator(
                            source,
                            config,
                            env,
                            unit,
                            options.operator_overrides.get(unit),
                        )
                    })
                    .await?;
                let target = connect_target(config, &self.env, &plan)?;
                let connection = self
                    .deps
                    .connector
                    .connect(&target)
                    .await
                    .map_err(|e| SimError::Connect(e.to_string()))?;
                let session =
                    StreamUnit::new(plan, &self.env, self.options.duration, config.cycle_gap());
                Ok(Prepared::Stream(session, connection))
            }
            UnitKind::Vehicle => {
                let plan = self
                    .resolve(unit, |source, config, env, unit, options| {
                        resolve_vehicle(
                            source,
                            config,
                            env,
                            unit,
                            options.vehicle_overrides.get(unit),
                            options.speed_mps,
                        )
                    })
                    .await?;
                let profile = config.environment(&self.env)?;
                if profile.connector_url.is_empty() {
                    return Err(SimError::Config(format!(
                        "no connector_url configured for {}",
                        self.env
                    )));
                }
                let duration = self
                    .options
                    .duration
                    .unwrap_or_else(|| Duration::from_secs(config.vehicle.duration_secs));
                let session = PolledUnit::new(
                    plan,
                    &self.env,
                    profile.vehicle_endpoint(),
                    duration,
                    Arc::clone(&self.deps.poster),
                );
                Ok(Prepared::Polled(session))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Background phase
    // -----------------------------------------------------------------------

    /// Start the session of every prepared unit without waiting for any
    /// of them. Session errors are logged, never returned.
    pub fn run_in_background(self: &Arc<Self>) {
        let mut state = self.state();
        if state.stopped {
            return;
        }
        let prepared = std::mem::take(&mut state.prepared);

        for (unit, prepared) in prepared {
            let (control, link, session) = match prepared {
                Prepared::Stream(session, connection) => {
                    let control = session.control();
                    let link = connection.link.clone();
                    let failed_unit = unit.clone();
                    let future: BoxFuture<'static, SessionOutcome> = Box::pin(async move {
                        match session.run(connection).await {
                            Ok(report) => SessionOutcome::Stream(report),
                            Err(e) => SessionOutcome::Failed {
                                unit: failed_unit,
                                error: e.to_string(),
                            },
                        }
                    });
                    (control, Some(link), future)
                }
                Prepared::Polled(session) => {
                    let control = session.control();
                    let future: BoxFuture<'static, SessionOutcome> =
                        Box::pin(async move { SessionOutcome::Polled(session.run().await) });
                    (control, None, future)
                }
            };

            state.active.insert(unit.clone(), ActiveUnit { control, link });
            let runner = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = session.await;
                runner.finish(&unit, outcome);
            });
        }

        info!(
            env = %self.env,
            kind = %self.kind,
            run = %self.run_id,
            units = state.active.len(),
            "runner started"
        );
    }

    /// Connect every unit, register with the registry if any unit is
    /// usable, and start them in the background.
    pub async fn run(self: &Arc<Self>) -> Vec<UnitStatus> {
        let statuses = self.connect_all().await;
        if statuses.iter().any(UnitStatus::is_ok) {
            if let Some(registry) = self.registry() {
                registry.set_runner(Arc::clone(self));
            }
            self.run_in_background();
        }
        statuses
    }

    fn finish(&self, unit: &str, outcome: SessionOutcome) {
        match &outcome {
            SessionOutcome::Stream(report) => info!(
                env = %self.env,
                %unit,
                end = ?report.end,
                messages_sent = report.messages_sent,
                log_lines = report.log.len(),
                "operator session finished"
            ),
            SessionOutcome::Polled(report) => info!(
                env = %self.env,
                %unit,
                end = ?report.end,
                posts = report.outcomes.len(),
                "vehicle session finished"
            ),
            SessionOutcome::Failed { error, .. } => {
                error!(env = %self.env, %unit, %error, "session failed");
            }
        }

        let (link, now_idle) = {
            let mut state = self.state();
            let link = state.active.remove(unit).and_then(|a| a.link);
            state.finished.insert(unit.to_owned(), outcome);
            (link, state.active.is_empty() && state.prepared.is_empty())
        };

        self.release(unit, link.as_ref());
        if now_idle {
            if let Some(registry) = self.registry() {
                registry.remove_runner_if(self.kind, &self.env, self.run_id);
            }
        }
    }

    fn release(&self, unit: &str, link: Option<&StreamLink>) {
        let Some(link) = link else {
            return;
        };
        link.close();
        if let Some(registry) = self.registry() {
            registry.remove_link_if_same(&self.env, unit, link);
        }
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    /// Stop every session, close every connection, and remove this
    /// runner's entries from the registry. Idempotent.
    pub fn stop_all(&self) {
        let (prepared, active) = {
            let mut state = self.state();
            state.stopped = true;
            (
                std::mem::take(&mut state.prepared),
                std::mem::take(&mut state.active),
            )
        };

        let stopped = prepared.len().saturating_add(active.len());
        for (unit, prepared) in prepared {
            self.release(&unit, prepared_link(&prepared).as_ref());
        }
        for (unit, active) in active {
            active.control.stop();
            self.release(&unit, active.link.as_ref());
        }
        if let Some(registry) = self.registry() {
            registry.remove_runner_if(self.kind, &self.env, self.run_id);
        }

        info!(
            env = %self.env,
            kind = %self.kind,
            run = %self.run_id,
            stopped,
            "runner stopped"
        );
    }
}

fn prepared_link(prepared: &Prepared) -> Option<StreamLink> {
    match prepared {
        Prepared::Stream(_, connection) => Some(connection.link.clone()),
        Prepared::Polled(_) => None,
    }
}
