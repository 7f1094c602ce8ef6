//! # Driver Pair
//!
//! Every replication operation is written once as a [`CoreDriver`] and exposed
//! through two wrappers sharing the same single-flight [`Station`]:
//!
//! | Wrapper | Caller | Returns |
//! |---------|--------|---------|
//! | [`BlockingDriver`] | public API, partition guard | the operation's output |
//! | [`NonBlockingDriver`] | background sweeps | a [`Dispatch`] ticket |
//!
//! ## Execution rules
//!
//! 1. `is_obvious` short-circuits before registration.
//! 2. The first registrant of a key is the leader; everyone else waits on the
//!    leader's instrument for at most their own timeout.
//! 3. The leader's body runs in a detached task holding a [`FlightGuard`], so
//!    the key is always freed: with the real output, or with `give_up()` on
//!    error, panic, cancellation or deadline.
//! 4. The body is bounded by its deadline. A caller that stops waiting early
//!    gets `give_up()` while the body keeps running to completion and frees
//!    the key for anyone still waiting.
//!
//! Nothing is retried here; retry cadence belongs to the periodic callers.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::pool::WorkerPool;
use crate::station::{FlightGuard, Station};

/// One replication operation, independent of how callers wait for it.
#[async_trait]
pub trait CoreDriver: Send + Sync + 'static {
    /// Single-flight key. Equality decides which calls collapse together.
    type Op: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    type Output: Clone + Debug + Send + Sync + 'static;

    /// Operation name used in log fields.
    fn name(&self) -> &'static str;

    /// Perform the operation. Waits must not outlive `deadline`.
    async fn execute(&self, op: Self::Op, deadline: Instant) -> anyhow::Result<Self::Output>;

    /// Terminal value for timeouts and local failures.
    fn give_up(&self) -> Self::Output;

    /// Answer without any work or registration, when possible.
    fn is_obvious(&self, _op: &Self::Op) -> Option<Self::Output> {
        None
    }
}

/// Result of a non-blocking submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch<O> {
    /// Answered by the fast path; nothing was submitted.
    Obvious(O),
    /// This call became the leader and its body was queued.
    Submitted,
    /// An identical operation is already running.
    InFlight,
    /// The worker pool is shut down; the registration was released.
    Closed,
}

async fn run_leader<D: CoreDriver>(
    core: Arc<D>,
    op: D::Op,
    deadline: Instant,
    guard: FlightGuard<D::Op, D::Output>,
) -> D::Output {
    let output = match tokio::time::timeout_at(deadline, core.execute(op.clone(), deadline)).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(op = core.name(), key = ?op, error = %e, "operation failed, giving up");
            core.give_up()
        }
        Err(_) => {
            debug!(op = core.name(), key = ?op, "operation hit its deadline");
            core.give_up()
        }
    };
    let waiters = guard.land(output.clone());
    trace!(op = core.name(), waiters, "operation landed");
    output
}

pub struct BlockingDriver<D: CoreDriver> {
    core: Arc<D>,
    station: Arc<Station<D::Op, D::Output>>,
}

impl<D: CoreDriver> Clone for BlockingDriver<D> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            station: self.station.clone(),
        }
    }
}

impl<D: CoreDriver> BlockingDriver<D> {
    pub fn new(core: Arc<D>, station: Arc<Station<D::Op, D::Output>>) -> Self {
        Self { core, station }
    }

    pub fn core(&self) -> &Arc<D> {
        &self.core
    }

    /// Run `op` (or join an identical run) and wait at most `timeout`.
    pub async fn execute(&self, op: D::Op, timeout: Duration) -> D::Output {
        if let Some(output) = self.core.is_obvious(&op) {
            return output;
        }

        if let Some(instrument) = self.station.register(op.clone()) {
            trace!(op = self.core.name(), key = ?op, "joining in-flight operation");
            return instrument
                .get(timeout)
                .await
                .unwrap_or_else(|| self.core.give_up());
        }

        let deadline = Instant::now() + timeout;
        let guard = FlightGuard::new(self.station.clone(), op.clone(), self.core.give_up());
        let body = tokio::spawn(run_leader(self.core.clone(), op, deadline, guard));

        match tokio::time::timeout(timeout, body).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(op = self.core.name(), error = %e, "operation task aborted");
                self.core.give_up()
            }
            Err(_) => self.core.give_up(),
        }
    }
}

pub struct NonBlockingDriver<D: CoreDriver> {
    core: Arc<D>,
    station: Arc<Station<D::Op, D::Output>>,
    pool: Arc<WorkerPool>,
}

impl<D: CoreDriver> Clone for NonBlockingDriver<D> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            station: self.station.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<D: CoreDriver> NonBlockingDriver<D> {
    pub fn new(core: Arc<D>, station: Arc<Station<D::Op, D::Output>>, pool: Arc<WorkerPool>) -> Self {
        Self { core, station, pool }
    }

    /// Queue `op` on the worker pool unless it is obvious or already running.
    pub fn execute(&self, op: D::Op, timeout: Duration) -> Dispatch<D::Output> {
        if let Some(output) = self.core.is_obvious(&op) {
            return Dispatch::Obvious(output);
        }
        if self.station.register(op.clone()).is_some() {
            return Dispatch::InFlight;
        }

        let deadline = Instant::now() + timeout;
        let guard = FlightGuard::new(self.station.clone(), op.clone(), self.core.give_up());
        let core = self.core.clone();
        // A rejected job is dropped with its guard, which frees the key.
        match self.pool.submit(async move {
            run_leader(core, op, deadline, guard).await;
        }) {
            Ok(()) => Dispatch::Submitted,
            Err(_) => Dispatch::Closed,
        }
    }
}

/// Both wrappers of one core, sharing its station.
pub struct DriverPair<D: CoreDriver> {
    pub blocking: BlockingDriver<D>,
    pub background: NonBlockingDriver<D>,
}

impl<D: CoreDriver> DriverPair<D> {
    pub fn new(core: D, pool: Arc<WorkerPool>) -> Self {
        let core = Arc::new(core);
        let station = Arc::new(Station::new());
        Self {
            blocking: BlockingDriver::new(core.clone(), station.clone()),
            background: NonBlockingDriver::new(core, station, pool),
        }
    }

    /// Operations currently registered on the shared station.
    pub fn in_flight(&self) -> usize {
        self.blocking.station.in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use crate::pool::DEFAULT_IDLE_KEEPALIVE;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Answer {
        Value(u32),
        GaveUp,
    }

    /// Counts executions and optionally parks until released.
    struct Probe {
        runs: AtomicUsize,
        gate: Notify,
        parked: bool,
        fail: bool,
        work: Duration,
    }

    impl Probe {
        fn new() -> Self {
            Self {
                runs: AtomicUsize::new(0),
                gate: Notify::new(),
                parked: false,
                fail: false,
                work: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl CoreDriver for Probe {
        type Op = u32;
        type Output = Answer;

        fn name(&self) -> &'static str {
            "probe"
        }

        async fn execute(&self, op: u32, _deadline: Instant) -> anyhow::Result<Answer> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.parked {
                self.gate.notified().await;
            }
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            if self.fail {
                anyhow::bail!("storage unavailable");
            }
            Ok(Answer::Value(op * 10))
        }

        fn give_up(&self) -> Answer {
            Answer::GaveUp
        }

        fn is_obvious(&self, op: &u32) -> Option<Answer> {
            (*op == 0).then_some(Answer::Value(0))
        }
    }

    fn blocking(probe: Probe) -> (BlockingDriver<Probe>, Arc<Probe>, Arc<Station<u32, Answer>>) {
        let core = Arc::new(probe);
        let station = Arc::new(Station::new());
        (BlockingDriver::new(core.clone(), station.clone()), core, station)
    }

    #[tokio::test]
    async fn obvious_operations_skip_execution() {
        let (driver, core, station) = blocking(Probe::new());
        assert_eq!(driver.execute(0, Duration::from_secs(1)).await, Answer::Value(0));
        assert_eq!(core.runs.load(Ordering::SeqCst), 0);
        assert_eq!(station.in_flight(), 0);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let mut probe = Probe::new();
        probe.parked = true;
        let (driver, core, station) = blocking(probe);

        let mut callers = Vec::new();
        for _ in 0..8 {
            let driver = driver.clone();
            callers.push(tokio::spawn(async move {
                driver.execute(4, Duration::from_secs(5)).await
            }));
        }
        while core.runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        // Give followers time to attach before releasing the leader.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        core.gate.notify_waiters();

        for caller in callers {
            assert_eq!(caller.await.unwrap(), Answer::Value(40));
        }
        assert_eq!(core.runs.load(Ordering::SeqCst), 1);
        assert_eq!(station.in_flight(), 0);
    }

    #[tokio::test]
    async fn errors_become_give_up() {
        let mut probe = Probe::new();
        probe.fail = true;
        let (driver, _core, station) = blocking(probe);
        assert_eq!(driver.execute(3, Duration::from_secs(1)).await, Answer::GaveUp);
        assert_eq!(station.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_leader_still_frees_key() {
        let mut probe = Probe::new();
        probe.work = Duration::from_millis(500);
        let (driver, _core, station) = blocking(probe);

        assert_eq!(driver.execute(2, Duration::from_millis(100)).await, Answer::GaveUp);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!station.is_registered(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn all_callers_see_give_up_on_timeout() {
        let mut probe = Probe::new();
        probe.parked = true;
        let (driver, core, station) = blocking(probe);

        let mut callers = Vec::new();
        for _ in 0..4 {
            let driver = driver.clone();
            callers.push(tokio::spawn(async move {
                driver.execute(9, Duration::from_millis(200)).await
            }));
        }
        for caller in callers {
            assert_eq!(caller.await.unwrap(), Answer::GaveUp);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(core.runs.load(Ordering::SeqCst), 1);
        assert_eq!(station.in_flight(), 0);
    }

    #[tokio::test]
    async fn non_blocking_reports_in_flight_and_lands() {
        let mut probe = Probe::new();
        probe.parked = true;
        let core = Arc::new(probe);
        let station: Arc<Station<u32, Answer>> = Arc::new(Station::new());
        let pool = WorkerPool::new(1, 2, DEFAULT_IDLE_KEEPALIVE);
        let driver = NonBlockingDriver::new(core.clone(), station.clone(), pool);

        assert_eq!(driver.execute(0, Duration::from_secs(1)), Dispatch::Obvious(Answer::Value(0)));
        assert_eq!(driver.execute(5, Duration::from_secs(5)), Dispatch::Submitted);
        assert_eq!(driver.execute(5, Duration::from_secs(5)), Dispatch::InFlight);

        let follower = station.register(5).expect("still in flight");
        while core.runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        core.gate.notify_waiters();
        assert_eq!(follower.get(Duration::from_secs(5)).await, Some(Answer::Value(50)));
    }

    #[tokio::test]
    async fn closed_pool_releases_registration() {
        let core = Arc::new(Probe::new());
        let station: Arc<Station<u32, Answer>> = Arc::new(Station::new());
        let pool = WorkerPool::new(1, 1, DEFAULT_IDLE_KEEPALIVE);
        pool.shutdown();
        let driver = NonBlockingDriver::new(core, station.clone(), pool);

        assert_eq!(driver.execute(7, Duration::from_secs(1)), Dispatch::Closed);
        assert!(!station.is_registered(&7));
    }
}
