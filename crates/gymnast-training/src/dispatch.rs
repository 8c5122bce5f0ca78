//! Fanning a generation out to a bounded pool of evaluation workers.
//!
//! Every agent that still needs a score for the task becomes an [`EvaluationJob`]:
//! a self-contained value holding the agent snapshot, the evaluation spec and a
//! seed. Each job is moved into a freshly spawned worker thread that runs exactly
//! that one job, sends one result over a channel and exits, so environment state
//! never accumulates in a long-lived worker.
//!
//! The dispatcher is the only consumer of the channel. It keeps at most
//! `pool_size` worker threads alive and returns once every agent has a record.
//!
//! # Failures
//!
//! Environment errors, panics, workers that cannot be spawned and jobs that run
//! past the timeout are turned into per-agent failures. The agent still gets a
//! record carrying its previous outcomes and a [`JobFailure`] marker, so the
//! record count always equals the population size.
//!
//! A timed-out worker is abandoned and whatever it sends later is discarded, but
//! its thread keeps its pool slot until it actually exits, also across calls to
//! [`EvaluationDispatcher::dispatch`]. When every slot is held by an abandoned
//! worker and none exits within another timeout period, the jobs still waiting
//! fail as timed out instead of growing the pool.

use std::{
    any::Any,
    collections::{BTreeSet, HashMap, VecDeque},
    error::Error,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::{Duration, Instant},
};

use gymnast_env::EnvironmentFactory;
use tracing::{debug, warn};

use crate::{
    agent::{AgentHandle, AgentId, JobFailure, Outcomes, Policy, ScoreRecord},
    episode::{EpisodeRunner, EvaluationError, EvaluationSpec},
};

/// Everything a worker needs to evaluate one agent.
#[derive(Debug, Clone)]
pub struct EvaluationJob<P> {
    pub agent: AgentHandle<P>,
    pub spec: EvaluationSpec,
    pub seed: u64,
}

impl<P> EvaluationJob<P>
where
    P: Policy,
{
    pub fn run(
        mut self,
        factory: &dyn EnvironmentFactory,
        deadline: Option<Instant>,
    ) -> Result<ScoreRecord, EvaluationError> {
        let mut runner = EpisodeRunner::new(self.spec);
        if let Some(deadline) = deadline {
            runner = runner.with_deadline(deadline);
        }
        runner.evaluate(&mut self.agent, factory, self.seed)
    }
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum DispatchError {
    #[display("agent {id} appears more than once in the population")]
    DuplicateAgent { id: AgentId },
}

/// Records collected for one generation, one per agent, in completion order.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub records: Vec<ScoreRecord>,
    /// Agents whose score was already known and that were not re-run.
    pub skipped: usize,
}

impl DispatchReport {
    pub fn failures(&self) -> impl Iterator<Item = (AgentId, &JobFailure)> + '_ {
        self.records
            .iter()
            .filter_map(|r| r.failure.as_ref().map(|f| (r.id, f)))
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }
}

#[derive(Debug)]
struct Completion {
    id: AgentId,
    result: Result<ScoreRecord, String>,
}

#[derive(Debug)]
struct InFlight {
    started: Instant,
    prior: Outcomes,
}

/// Number of live worker threads, abandoned ones included.
#[derive(Debug, Default)]
struct WorkerSlots {
    live: Mutex<usize>,
    released: Condvar,
}

impl WorkerSlots {
    fn live(&self) -> usize {
        *self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(self: &Arc<Self>, limit: usize) -> Option<SlotGuard> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if *live >= limit {
            return None;
        }
        *live += 1;
        Some(SlotGuard(Arc::clone(self)))
    }

    fn release(&self) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        *live = live.saturating_sub(1);
        drop(live);
        self.released.notify_all();
    }

    /// Blocks until fewer than `limit` workers are alive, for at most `timeout`.
    fn wait_for_free(&self, limit: usize, timeout: Option<Duration>) -> bool {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let live = match timeout {
            Some(timeout) => {
                self.released
                    .wait_timeout_while(live, timeout, |live| *live >= limit)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .released
                .wait_while(live, |live| *live >= limit)
                .unwrap_or_else(PoisonError::into_inner),
        };
        *live < limit
    }
}

/// Holds one pool slot until dropped.
#[derive(Debug)]
struct SlotGuard(Arc<WorkerSlots>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Evaluates a whole population with a bounded number of concurrent workers.
///
/// Clones share one pool.
#[derive(Debug, Clone)]
pub struct EvaluationDispatcher {
    pool_size: usize,
    job_timeout: Option<Duration>,
    slots: Arc<WorkerSlots>,
}

impl EvaluationDispatcher {
    /// # Panics
    ///
    /// Panics if `pool_size` is zero.
    #[must_use]
    pub fn new(pool_size: usize, job_timeout: Option<Duration>) -> Self {
        assert!(pool_size > 0, "worker pool size must be at least 1");
        Self {
            pool_size,
            job_timeout,
            slots: Arc::default(),
        }
    }

    /// Worker threads currently alive, including abandoned ones.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.slots.live()
    }

    /// Evaluates every agent once and blocks until all of them have a record.
    pub fn dispatch<P>(
        &self,
        agents: Vec<AgentHandle<P>>,
        spec: &EvaluationSpec,
        factory: &Arc<dyn EnvironmentFactory>,
        seed: u64,
    ) -> Result<DispatchReport, DispatchError>
    where
        P: Policy,
    {
        let mut seen = BTreeSet::new();
        if let Some(agent) = agents.iter().find(|a| !seen.insert(a.id())) {
            return Err(DispatchError::DuplicateAgent { id: agent.id() });
        }

        let total = agents.len();
        let mut report = DispatchReport {
            records: Vec::with_capacity(total),
            skipped: 0,
        };
        let mut pending = VecDeque::new();
        for agent in agents {
            if agent.is_task_done(&spec.task) {
                debug!(agent = %agent.id(), task = %spec.task, "agent can skip");
                report.records.push(agent.to_record());
                report.skipped += 1;
            } else {
                pending.push_back(agent);
            }
        }

        let (tx, rx) = mpsc::channel();
        let mut in_flight = HashMap::new();
        while report.records.len() < total {
            while !pending.is_empty() {
                let Some(slot) = self.slots.try_acquire(self.pool_size) else {
                    break;
                };
                let Some(agent) = pending.pop_front() else {
                    break;
                };
                let id = agent.id();
                let prior = agent.outcomes().clone();
                let job = EvaluationJob {
                    agent,
                    spec: spec.clone(),
                    seed: job_seed(seed, id),
                };
                let started = Instant::now();
                match self.spawn(job, factory, tx.clone(), started, slot) {
                    Ok(()) => {
                        in_flight.insert(id, InFlight { started, prior });
                    }
                    Err(reason) => {
                        report.records.push(failure_record(id, prior, &spec.task, reason));
                    }
                }
            }

            if in_flight.is_empty() {
                if pending.is_empty() {
                    break;
                }
                // every slot is held by an abandoned worker
                if !self.slots.wait_for_free(self.pool_size, self.job_timeout) {
                    let stuck = self.slots.live();
                    warn!(stuck, waiting = pending.len(), "no evaluation worker became free");
                    for agent in pending.drain(..) {
                        let reason = format!("timed out waiting for one of {stuck} stuck workers");
                        let prior = agent.outcomes().clone();
                        report
                            .records
                            .push(failure_record(agent.id(), prior, &spec.task, reason));
                    }
                }
                continue;
            }

            match self.receive(&rx, &in_flight) {
                Ok(Completion { id, result }) => match in_flight.remove(&id) {
                    Some(job) => report.records.push(match result {
                        Ok(record) => record,
                        Err(reason) => failure_record(id, job.prior, &spec.task, reason),
                    }),
                    None => debug!(agent = %id, "discarding result of abandoned job"),
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    for (id, job) in in_flight.drain() {
                        let reason = "worker channel closed".to_owned();
                        report.records.push(failure_record(id, job.prior, &spec.task, reason));
                    }
                }
            }

            if let Some(timeout) = self.job_timeout {
                let now = Instant::now();
                let expired = in_flight
                    .iter()
                    .filter(|(_, job)| now.duration_since(job.started) >= timeout)
                    .map(|(id, _)| *id)
                    .collect::<Vec<_>>();
                for id in expired {
                    if let Some(job) = in_flight.remove(&id) {
                        let reason = format!("timed out after {timeout:?}");
                        report.records.push(failure_record(id, job.prior, &spec.task, reason));
                    }
                }
            }
        }

        Ok(report)
    }

    fn spawn<P>(
        &self,
        job: EvaluationJob<P>,
        factory: &Arc<dyn EnvironmentFactory>,
        tx: mpsc::Sender<Completion>,
        started: Instant,
        slot: SlotGuard,
    ) -> Result<(), String>
    where
        P: Policy,
    {
        let id = job.agent.id();
        let factory = Arc::clone(factory);
        let deadline = self.job_timeout.map(|timeout| started + timeout);
        // a worker that fails to spawn drops its closure, and with it the slot
        thread::Builder::new()
            .name(format!("eval-{}", id.0))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    job.run(factory.as_ref(), deadline)
                }))
                .map_err(|payload| format!("worker panicked: {}", panic_message(&*payload)))
                .and_then(|result| result.map_err(|err| error_chain(&err)));
                drop(slot);
                // the receiver is gone if this job was abandoned after a timeout
                tx.send(Completion { id, result }).ok();
            })
            .map(drop)
            .map_err(|err| format!("failed to spawn worker: {err}"))
    }

    fn receive(
        &self,
        rx: &mpsc::Receiver<Completion>,
        in_flight: &HashMap<AgentId, InFlight>,
    ) -> Result<Completion, RecvTimeoutError> {
        match self.job_timeout {
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(timeout) => {
                let next_expiry = in_flight
                    .values()
                    .map(|job| job.started + timeout)
                    .min()
                    .unwrap_or_else(Instant::now);
                rx.recv_timeout(next_expiry.saturating_duration_since(Instant::now()))
            }
        }
    }
}

fn failure_record(id: AgentId, outcomes: Outcomes, task: &str, reason: String) -> ScoreRecord {
    warn!(agent = %id, task, %reason, "evaluation failed, agent left unscored");
    ScoreRecord {
        id,
        outcomes,
        failure: Some(JobFailure {
            task: task.to_owned(),
            reason,
        }),
    }
}

/// Derives a per-agent seed so evaluation does not depend on scheduling order.
#[must_use]
pub fn job_seed(seed: u64, id: AgentId) -> u64 {
    splitmix64(seed ^ splitmix64(id.0))
}

pub(crate) fn splitmix64(value: u64) -> u64 {
    let mut z = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic payload")
}

fn error_chain(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use gymnast_env::Action;

    use crate::testing::{ECHO_TASK, ScriptedEnvironments, TestPolicy};

    use super::*;

    fn spec() -> EvaluationSpec {
        EvaluationSpec {
            task: ECHO_TASK.to_owned(),
            episodes: 1,
            max_frames: 10,
        }
    }

    fn factory() -> (ScriptedEnvironments, Arc<dyn EnvironmentFactory>) {
        let scripted = ScriptedEnvironments::echo();
        let shared: Arc<dyn EnvironmentFactory> = Arc::new(scripted.clone());
        (scripted, shared)
    }

    fn population(policies: impl IntoIterator<Item = TestPolicy>) -> Vec<AgentHandle<TestPolicy>> {
        policies
            .into_iter()
            .zip(0..)
            .map(|(policy, id)| AgentHandle::new(AgentId(id), policy, Outcomes::new()))
            .collect()
    }

    fn scores(report: &DispatchReport) -> BTreeMap<u64, Option<f64>> {
        report
            .records
            .iter()
            .map(|r| (r.id.0, r.outcomes.get(ECHO_TASK).copied()))
            .collect()
    }

    #[test]
    fn test_one_record_per_agent() {
        let (_, factory) = factory();
        let agents = population((0..20).map(TestPolicy::Fixed));

        let report = EvaluationDispatcher::new(3, None)
            .dispatch(agents, &spec(), &factory, 1)
            .unwrap();

        assert_eq!(report.records.len(), 20);
        assert_eq!(report.failure_count(), 0);
        let scores = scores(&report);
        assert_eq!(scores.len(), 20);
        for (id, score) in scores {
            #[expect(clippy::cast_precision_loss)]
            let expected = id as f64;
            assert_eq!(score, Some(expected));
        }
    }

    #[test]
    fn test_pool_larger_than_population() {
        let (_, factory) = factory();
        let agents = population((0..2).map(TestPolicy::Fixed));
        let report = EvaluationDispatcher::new(16, None)
            .dispatch(agents, &spec(), &factory, 1)
            .unwrap();
        assert_eq!(report.records.len(), 2);
    }

    #[test]
    fn test_evaluated_agents_are_skipped() {
        let (scripted, factory) = factory();
        let mut agents = population((0..6).map(TestPolicy::Fixed));
        for agent in agents.iter_mut().take(4) {
            agent.record_reward(ECHO_TASK, -5.0);
        }

        let report = EvaluationDispatcher::new(2, None)
            .dispatch(agents, &spec(), &factory, 1)
            .unwrap();

        assert_eq!(report.records.len(), 6);
        assert_eq!(report.skipped, 4);
        assert_eq!(scripted.created(), 2);
        let scores = scores(&report);
        assert_eq!(scores[&0], Some(-5.0));
        assert_eq!(scores[&5], Some(5.0));
    }

    #[test]
    fn test_panicking_agent_does_not_abort_generation() {
        let (_, factory) = factory();
        let agents = population([
            TestPolicy::Fixed(1),
            TestPolicy::Panic,
            TestPolicy::Fixed(3),
        ]);

        let report = EvaluationDispatcher::new(2, None)
            .dispatch(agents, &spec(), &factory, 1)
            .unwrap();

        assert_eq!(report.records.len(), 3);
        let failures = report.failures().collect::<Vec<_>>();
        assert_eq!(failures.len(), 1);
        let (id, failure) = failures[0];
        assert_eq!(id, AgentId(1));
        assert_eq!(scores(&report)[&1], None);
        assert!(failure.reason.contains("panicked"), "{}", failure.reason);
        assert_eq!(scores(&report)[&2], Some(3.0));
    }

    #[test]
    fn test_environment_failure_is_reported_per_agent() {
        let factory: Arc<dyn EnvironmentFactory> = Arc::new(ScriptedEnvironments::failing_at(0));
        let agents = population([TestPolicy::Fixed(0), TestPolicy::Fixed(1)]);
        let spec = EvaluationSpec {
            task: "scripted".to_owned(),
            episodes: 1,
            max_frames: 5,
        };

        let report = EvaluationDispatcher::new(1, None)
            .dispatch(agents, &spec, &factory, 1)
            .unwrap();

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.failure_count(), 2);
        let (_, failure) = report.failures().next().unwrap();
        assert!(failure.reason.contains("scripted failure"), "{}", failure.reason);
    }

    #[test]
    fn test_stalled_job_times_out() {
        let (_, factory) = factory();
        let agents = population([
            TestPolicy::Stall(Duration::from_secs(5)),
            TestPolicy::Fixed(7),
        ]);

        let started = Instant::now();
        let report = EvaluationDispatcher::new(2, Some(Duration::from_millis(100)))
            .dispatch(agents, &spec(), &factory, 1)
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(report.records.len(), 2);
        let failures = report.failures().collect::<Vec<_>>();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, AgentId(0));
        assert!(failures[0].1.reason.contains("timed out"));
        assert_eq!(scores(&report)[&1], Some(7.0));
    }

    /// Sleeps in `act` and tracks how many instances are acting at once.
    #[derive(Debug, Clone)]
    struct Occupying {
        hold: Duration,
        acting: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Policy for Occupying {
        fn act(&mut self, _observation: &[f64]) -> Action {
            let now = self.acting.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(self.hold);
            self.acting.fetch_sub(1, Ordering::SeqCst);
            0
        }
    }

    fn occupying(count: u64, hold: Duration) -> (Vec<AgentHandle<Occupying>>, Arc<AtomicUsize>) {
        let policy = Occupying {
            hold,
            acting: Arc::default(),
            peak: Arc::default(),
        };
        let peak = Arc::clone(&policy.peak);
        let agents = (0..count)
            .map(|id| AgentHandle::new(AgentId(id), policy.clone(), Outcomes::new()))
            .collect();
        (agents, peak)
    }

    #[test]
    fn test_abandoned_workers_keep_their_slot() {
        let (_, factory) = factory();
        let (agents, peak) = occupying(5, Duration::from_millis(600));
        let dispatcher = EvaluationDispatcher::new(1, Some(Duration::from_millis(50)));

        let report = dispatcher.dispatch(agents, &spec(), &factory, 1).unwrap();

        assert_eq!(report.records.len(), 5);
        assert_eq!(report.failure_count(), 5);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(dispatcher.live_workers() <= 1);
        let (_, waited) = report.failures().find(|(id, _)| *id == AgentId(4)).unwrap();
        assert!(waited.reason.contains("stuck"), "{}", waited.reason);

        // the stuck worker still holds the only slot in the next generation
        let (agents, next_peak) = occupying(3, Duration::from_millis(600));
        let report = dispatcher.dispatch(agents, &spec(), &factory, 2).unwrap();
        assert_eq!(report.records.len(), 3);
        assert_eq!(report.failure_count(), 3);
        assert_eq!(next_peak.load(Ordering::SeqCst), 0);
        assert!(dispatcher.live_workers() <= 1);
    }

    #[test]
    fn test_slot_of_abandoned_worker_is_reused_once_it_exits() {
        let (_, factory) = factory();
        let agents = population([
            TestPolicy::Stall(Duration::from_millis(300)),
            TestPolicy::Fixed(7),
        ]);

        let report = EvaluationDispatcher::new(1, Some(Duration::from_millis(200)))
            .dispatch(agents, &spec(), &factory, 1)
            .unwrap();

        assert_eq!(report.records.len(), 2);
        let failures = report.failures().collect::<Vec<_>>();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, AgentId(0));
        assert_eq!(scores(&report)[&1], Some(7.0));
    }

    #[test]
    fn test_duplicate_identity_is_rejected() {
        let (scripted, factory) = factory();
        let agents = vec![
            AgentHandle::new(AgentId(4), TestPolicy::Fixed(0), Outcomes::new()),
            AgentHandle::new(AgentId(4), TestPolicy::Fixed(1), Outcomes::new()),
        ];
        let err = EvaluationDispatcher::new(2, None)
            .dispatch(agents, &spec(), &factory, 1)
            .unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateAgent { id: AgentId(4) }));
        assert_eq!(scripted.created(), 0);
    }

    #[test]
    fn test_job_seed_depends_on_identity_only() {
        assert_eq!(job_seed(9, AgentId(1)), job_seed(9, AgentId(1)));
        assert_ne!(job_seed(9, AgentId(1)), job_seed(9, AgentId(2)));
        assert_ne!(job_seed(9, AgentId(1)), job_seed(10, AgentId(1)));
    }
}
