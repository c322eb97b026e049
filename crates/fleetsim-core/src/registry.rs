//! Process-wide table of active runners and live connections.
//!
//! The registry is created once by whoever owns the control surface and
//! handed to runners by reference; nothing in this crate reaches for a
//! global. Runners are keyed by `(kind, env)`, so an environment can have
//! at most one operator runner and one vehicle runner at a time. Live
//! stream links are keyed by environment and unit.
//!
//! Table mutations are short and never await, so the tables sit behind
//! std mutexes. Start and stop requests for one environment are serialized
//! with a per-environment async lock from [`SimulationRegistry::lock_env`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use fleetsim_types::{RunId, UnitKind};

use crate::runner::EnvironmentRunner;
use crate::transport::StreamLink;

type RunnerKey = (UnitKind, String);

/// Active runners and live connections, keyed by environment.
#[derive(Debug, Default)]
pub struct SimulationRegistry {
    runners: Mutex<BTreeMap<RunnerKey, Arc<EnvironmentRunner>>>,
    links: Mutex<BTreeMap<String, BTreeMap<String, StreamLink>>>,
    env_locks: Mutex<BTreeMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the start/stop lock of `env`.
    ///
    /// Holding the guard serializes run and stop requests for that
    /// environment; other environments are unaffected.
    pub async fn lock_env(&self, env: &str) -> OwnedMutexGuard<()> {
        let env_lock = {
            let mut locks = lock(&self.env_locks);
            Arc::clone(locks.entry(env.to_owned()).or_default())
        };
        env_lock.lock_owned().await
    }

    // -----------------------------------------------------------------------
    // Runners
    // -----------------------------------------------------------------------

    /// The runner of `kind` registered for `env`.
    pub fn runner(&self, kind: UnitKind, env: &str) -> Option<Arc<EnvironmentRunner>> {
        lock(&self.runners).get(&(kind, env.to_owned())).cloned()
    }

    /// Register `runner` for its kind and environment, returning the
    /// runner it replaces.
    pub fn set_runner(&self, runner: Arc<EnvironmentRunner>) -> Option<Arc<EnvironmentRunner>> {
        let key = (runner.kind(), runner.env().to_owned());
        debug!(env = %key.1, kind = %key.0, run = %runner.run_id(), "runner registered");
        lock(&self.runners).insert(key, runner)
    }

    /// Remove the runner of `kind` for `env`.
    pub fn remove_runner(&self, kind: UnitKind, env: &str) -> Option<Arc<EnvironmentRunner>> {
        lock(&self.runners).remove(&(kind, env.to_owned()))
    }

    /// Remove the runner of `kind` for `env` only if it is run `run_id`.
    ///
    /// A runner deregistering itself late must not evict its successor.
    pub fn remove_runner_if(&self, kind: UnitKind, env: &str, run_id: RunId) -> bool {
        let mut runners = lock(&self.runners);
        let key = (kind, env.to_owned());
        if runners.get(&key).is_some_and(|r| r.run_id() == run_id) {
            runners.remove(&key);
            debug!(%env, %kind, run = %run_id, "runner deregistered");
            true
        } else {
            false
        }
    }

    /// Identifiers of the runners registered for `env`.
    pub fn runs(&self, env: &str) -> Vec<RunId> {
        lock(&self.runners)
            .iter()
            .filter(|((_, e), _)| e == env)
            .map(|(_, runner)| runner.run_id())
            .collect()
    }

    /// Total unit sessions still active across the runners of `env`.
    pub fn active_units(&self, env: &str) -> usize {
        lock(&self.runners)
            .iter()
            .filter(|((_, e), _)| e == env)
            .map(|(_, runner)| runner.active_units())
            .sum()
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    /// Record the live link of `unit` in `env`.
    pub fn set_link(&self, env: &str, unit: &str, link: StreamLink) {
        lock(&self.links)
            .entry(env.to_owned())
            .or_default()
            .insert(unit.to_owned(), link);
    }

    /// Forget the link of `unit` in `env`, if it is still `link`.
    pub fn remove_link_if_same(&self, env: &str, unit: &str, link: &StreamLink) -> bool {
        let mut links = lock(&self.links);
        let Some(env_links) = links.get_mut(env) else {
            return false;
        };
        let removed = env_links
            .get(unit)
            .is_some_and(|current| current.same_link(link))
            && env_links.remove(unit).is_some();
        if env_links.is_empty() {
            links.remove(env);
        }
        removed
    }

    /// Number of live links in `env`.
    pub fn link_count(&self, env: &str) -> usize {
        lock(&self.links).get(env).map_or(0, BTreeMap::len)
    }

    // -----------------------------------------------------------------------
    // Environments
    // -----------------------------------------------------------------------

    /// Whether `env` has a registered runner or a live link.
    pub fn is_running(&self, env: &str) -> bool {
        let has_runner = lock(&self.runners).keys().any(|(_, e)| e == env);
        has_runner || self.link_count(env) > 0
    }

    /// Every environment with a registered runner or a live link.
    pub fn environments(&self) -> Vec<String> {
        let mut envs: BTreeSet<String> = lock(&self.runners)
            .keys()
            .map(|(_, env)| env.clone())
            .collect();
        envs.extend(lock(&self.links).keys().cloned());
        envs.into_iter().collect()
    }

    /// Remove every entry of `env`, closing its links, and return the
    /// runners that were registered so the caller can stop them.
    pub fn clear_env(&self, env: &str) -> Vec<Arc<EnvironmentRunner>> {
        let runners: Vec<Arc<EnvironmentRunner>> = {
            let mut table = lock(&self.runners);
            let keys: Vec<RunnerKey> = table.keys().filter(|(_, e)| e == env).cloned().collect();
            keys.iter().filter_map(|key| table.remove(key)).collect()
        };
        if let Some(links) = lock(&self.links).remove(env) {
            for link in links.values() {
                link.close();
            }
        }
        runners
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::runner::{RunOptions, RunnerDeps};
    use crate::transport::{Outbound, StreamConnection};

    fn runner(kind: UnitKind, env: &str) -> Arc<EnvironmentRunner> {
        Arc::new(EnvironmentRunner::new(
            env,
            kind,
            Vec::new(),
            RunnerDeps::in_memory(),
            Arc::new(RunOptions::default()),
            None,
        ))
    }

    #[test]
    fn runners_are_keyed_by_kind_and_env() {
        let registry = SimulationRegistry::new();
        let ops = runner(UnitKind::Operator, "dev");
        let veh = runner(UnitKind::Vehicle, "dev");
        assert!(registry.set_runner(Arc::clone(&ops)).is_none());
        assert!(registry.set_runner(Arc::clone(&veh)).is_none());
        assert!(registry.set_runner(runner(UnitKind::Operator, "demo")).is_none());

        assert_eq!(registry.runs("dev").len(), 2);
        assert_eq!(registry.environments(), vec!["demo", "dev"]);

        let replacement = runner(UnitKind::Operator, "dev");
        let previous = registry.set_runner(Arc::clone(&replacement)).unwrap();
        assert_eq!(previous.run_id(), ops.run_id());
        assert_eq!(registry.runs("dev").len(), 2);
    }

    #[test]
    fn stale_runner_cannot_evict_successor() {
        let registry = SimulationRegistry::new();
        let old = runner(UnitKind::Vehicle, "dev");
        let new = runner(UnitKind::Vehicle, "dev");
        registry.set_runner(Arc::clone(&new));

        assert!(!registry.remove_runner_if(UnitKind::Vehicle, "dev", old.run_id()));
        assert!(registry.is_running("dev"));
        assert!(registry.remove_runner_if(UnitKind::Vehicle, "dev", new.run_id()));
        assert!(!registry.is_running("dev"));
    }

    #[test]
    fn links_count_towards_running() {
        let registry = SimulationRegistry::new();
        let (connection, _peer) = StreamConnection::pair();
        registry.set_link("dev", "1", connection.link.clone());
        assert!(registry.is_running("dev"));
        assert!(!registry.is_running("demo"));

        let (other, _other_peer) = StreamConnection::pair();
        assert!(!registry.remove_link_if_same("dev", "1", &other.link));
        assert!(registry.remove_link_if_same("dev", "1", &connection.link));
        assert!(!registry.is_running("dev"));
        assert!(registry.environments().is_empty());
    }

    #[test]
    fn clear_env_leaves_other_environments_alone() {
        let registry = SimulationRegistry::new();
        registry.set_runner(runner(UnitKind::Operator, "dev"));
        registry.set_runner(runner(UnitKind::Vehicle, "demo"));
        let (connection, mut peer) = StreamConnection::pair();
        registry.set_link("dev", "1", connection.link);

        let removed = registry.clear_env("dev");
        assert_eq!(removed.len(), 1);
        assert!(!registry.is_running("dev"));
        assert!(registry.is_running("demo"));
        assert_eq!(peer.drain(), vec![Outbound::Close]);

        assert_eq!(registry.clear_env("demo").len(), 1);
        assert!(registry.environments().is_empty());
    }

    #[tokio::test]
    async fn env_locks_are_independent() {
        let registry = Arc::new(SimulationRegistry::new());
        let _dev = registry.lock_env("dev").await;

        // Another environment can be locked while dev is held.
        let demo = tokio::time::timeout(Duration::from_secs(1), registry.lock_env("demo")).await;
        assert!(demo.is_ok());

        // dev itself cannot.
        let again = tokio::time::timeout(Duration::from_millis(50), registry.lock_env("dev")).await;
        assert!(again.is_err());
    }
}
