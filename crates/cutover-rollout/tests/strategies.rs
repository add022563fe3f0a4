//! End-to-end strategy runs against a simulated scheduler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use tokio::sync::watch;

use cutover_core::*;
use cutover_rollout::*;
use cutover_state::*;

/// Turns formation diffs into job events, the way a scheduler would.
///
/// Every started instance reports `starting`, `up` and a duplicate `up`;
/// every stopped instance reports `down`. Another app's noise is mixed in.
struct SimulatedScheduler {
    store: StateStore,
    bus: JobEventBus,
    crash_release: Option<String>,
    silent_apps: Vec<String>,
    writes: Mutex<Vec<Formation>>,
    next_job: AtomicU64,
}

impl SimulatedScheduler {
    fn new(store: StateStore) -> Self {
        Self {
            store,
            bus: JobEventBus::new(1024),
            crash_release: None,
            silent_apps: Vec::new(),
            writes: Mutex::new(Vec::new()),
            next_job: AtomicU64::new(1),
        }
    }

    fn crashing(mut self, release_id: &str) -> Self {
        self.crash_release = Some(release_id.to_string());
        self
    }

    /// Never report job events for `app_id`.
    fn silent_for(mut self, app_id: &str) -> Self {
        self.silent_apps.push(app_id.to_string());
        self
    }

    fn emit(&self, formation: &Formation, process_type: &str, state: JobState) {
        let n = self.next_job.fetch_add(1, Ordering::SeqCst);
        self.bus.publish(JobEvent {
            app_id: formation.app_id.clone(),
            release_id: formation.release_id.clone(),
            job_id: format!("{}-{process_type}-{n}", formation.release_id),
            process_type: process_type.to_string(),
            state,
        });
    }

    fn writes(&self) -> Vec<Formation> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Controller for SimulatedScheduler {
    async fn get_formation(&self, app_id: &str, release_id: &str) -> ControllerResult<Formation> {
        Ok(self.store.get_formation(app_id, release_id)?)
    }

    async fn put_formation(&self, formation: &Formation) -> ControllerResult<()> {
        let previous = match self.store.get_formation(&formation.app_id, &formation.release_id) {
            Ok(f) => f,
            Err(e) if e.is_not_found() => Formation::empty(&formation.app_id, &formation.release_id),
            Err(e) => return Err(e.into()),
        };
        self.store.put_formation(formation)?;
        self.writes.lock().unwrap().push(formation.clone());

        if self.silent_apps.contains(&formation.app_id) {
            return Ok(());
        }

        self.bus.publish(JobEvent {
            app_id: "other-app".to_string(),
            release_id: "x".to_string(),
            job_id: "noise".to_string(),
            process_type: "web".to_string(),
            state: JobState::Up,
        });

        let mut types: Vec<&String> = previous.processes.keys().collect();
        types.extend(formation.processes.keys());
        types.sort();
        types.dedup();

        for t in types {
            let before = previous.count(t);
            let after = formation.count(t);
            for _ in before..after {
                self.emit(formation, t, JobState::Starting);
                if self.crash_release.as_deref() == Some(formation.release_id.as_str()) {
                    self.emit(formation, t, JobState::Crashed);
                } else {
                    self.emit(formation, t, JobState::Up);
                    self.emit(formation, t, JobState::Up);
                }
            }
            for _ in after..before {
                self.emit(formation, t, JobState::Down);
            }
        }
        Ok(())
    }

    async fn stream_job_events(&self, app_id: &str, _since_id: u64) -> ControllerResult<JobEventStream> {
        Ok(self.bus.subscribe(app_id))
    }
}

/// Replays a fixed list of job events and then ends the stream.
struct ScriptedController {
    store: StateStore,
    script: Vec<JobEvent>,
}

#[async_trait]
impl Controller for ScriptedController {
    async fn get_formation(&self, app_id: &str, release_id: &str) -> ControllerResult<Formation> {
        Ok(self.store.get_formation(app_id, release_id)?)
    }

    async fn put_formation(&self, formation: &Formation) -> ControllerResult<()> {
        self.store.put_formation(formation)?;
        Ok(())
    }

    async fn stream_job_events(&self, _app_id: &str, _since_id: u64) -> ControllerResult<JobEventStream> {
        Ok(stream::iter(self.script.clone().into_iter().map(Ok)).boxed())
    }
}

struct Harness {
    store: StateStore,
    log: EventLog,
    repo: DeploymentRepo,
}

impl Harness {
    fn new() -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let log = EventLog::new(store.clone(), Notifier::new(256));
        let repo = DeploymentRepo::new(store.clone(), WorkQueue::new(store.clone()));
        Self { store, log, repo }
    }

    fn seed(&self, release: &str, counts: &[(&str, u32)]) {
        self.seed_app("app", release, counts);
    }

    fn seed_app(&self, app_id: &str, release: &str, counts: &[(&str, u32)]) {
        let processes: BTreeMap<String, u32> =
            counts.iter().map(|(t, n)| (t.to_string(), *n)).collect();
        self.store
            .put_formation(&Formation::new(app_id, release, processes))
            .unwrap();
    }

    fn deploy(&self, strategy: DeploymentStrategy) -> Deployment {
        self.deploy_app("app", strategy)
    }

    fn deploy_app(&self, app_id: &str, strategy: DeploymentStrategy) -> Deployment {
        self.repo
            .add(&NewDeployment {
                id: None,
                app_id: app_id.to_string(),
                old_release_id: "r1".to_string(),
                new_release_id: "r2".to_string(),
                strategy,
            })
            .unwrap()
    }

    fn engine(&self, controller: Arc<dyn Controller>) -> StrategyEngine {
        StrategyEngine::new(controller, self.log.clone(), self.repo.clone())
    }

    fn events(&self, deployment: &Deployment) -> Vec<DeploymentEvent> {
        self.log.list_since(&deployment.id, 0).unwrap()
    }
}

/// Asserts old + new capacity per type stays within {N, N+1}.
fn assert_capacity_bounded(writes: &[Formation], original: &BTreeMap<String, u32>) {
    let mut old: BTreeMap<String, u32> = original.clone();
    let mut new: BTreeMap<String, u32> = BTreeMap::new();
    for w in writes {
        if w.release_id == "r1" {
            old = w.processes.clone();
        } else {
            new = w.processes.clone();
        }
        for (t, n) in original {
            let total = old.get(t).copied().unwrap_or(0) + new.get(t).copied().unwrap_or(0);
            assert!(
                total == *n || total == n + 1,
                "{t}: capacity {total} outside {{{n}, {}}}",
                n + 1
            );
        }
    }
}

#[tokio::test]
async fn one_by_one_moves_three_web_instances() {
    let h = Harness::new();
    h.seed("r1", &[("web", 3)]);
    let d = h.deploy(DeploymentStrategy::OneByOne);

    let scheduler = Arc::new(SimulatedScheduler::new(h.store.clone()));
    h.engine(scheduler.clone()).run(&d).await.unwrap();

    let events = h.events(&d);
    assert_eq!(events.len(), 6);
    for (i, e) in events.iter().enumerate() {
        assert_eq!(e.job_type, "web");
        if i % 2 == 0 {
            assert_eq!(e.job_state, JobState::Up);
            assert_eq!(e.release_id, "r2");
        } else {
            assert_eq!(e.job_state, JobState::Down);
            assert_eq!(e.release_id, "r1");
        }
    }
    assert!(events.windows(2).all(|w| w[0].id < w[1].id));
    assert!(events[..5].iter().all(|e| e.status == DeploymentEventStatus::Running));
    assert_eq!(events[5].status, DeploymentEventStatus::Complete);

    assert!(h.repo.get(&d.id).unwrap().is_finished());
    assert_eq!(h.store.get_formation("app", "r1").unwrap().count("web"), 0);
    assert_eq!(h.store.get_formation("app", "r2").unwrap().count("web"), 3);

    let original: BTreeMap<String, u32> = [("web".to_string(), 3)].into();
    assert_capacity_bounded(&scheduler.writes(), &original);
}

#[tokio::test]
async fn one_by_one_confirms_every_type() {
    let h = Harness::new();
    h.seed("r1", &[("web", 2), ("worker", 3)]);
    let d = h.deploy(DeploymentStrategy::OneByOne);

    let scheduler = Arc::new(SimulatedScheduler::new(h.store.clone()));
    h.engine(scheduler.clone()).run(&d).await.unwrap();

    let events = h.events(&d);
    assert_eq!(events.len(), 10);
    for (t, n) in [("web", 2), ("worker", 3)] {
        let ups = events
            .iter()
            .filter(|e| e.job_type == t && e.job_state == JobState::Up)
            .count();
        let downs = events
            .iter()
            .filter(|e| e.job_type == t && e.job_state == JobState::Down)
            .count();
        assert_eq!(ups, n);
        assert_eq!(downs, n);
    }
    // web finishes before worker starts.
    assert!(events[..4].iter().all(|e| e.job_type == "web"));

    let original: BTreeMap<String, u32> =
        [("web".to_string(), 2), ("worker".to_string(), 3)].into();
    assert_capacity_bounded(&scheduler.writes(), &original);
}

#[tokio::test]
async fn crash_fails_and_finishes_deployment() {
    let h = Harness::new();
    h.seed("r1", &[("web", 3)]);
    let d = h.deploy(DeploymentStrategy::OneByOne);

    let scheduler = Arc::new(SimulatedScheduler::new(h.store.clone()).crashing("r2"));
    let err = h.engine(scheduler.clone()).run(&d).await.unwrap_err();
    assert!(err.is_terminal());
    assert!(matches!(err, RolloutError::Match(MatchError::Crashed { .. })));

    let events = h.events(&d);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, DeploymentEventStatus::Failed);
    assert_eq!(events[0].job_state, JobState::Crashed);
    assert_eq!(events[0].release_id, "r2");

    // Only the first new instance was requested; the old release is untouched.
    assert_eq!(scheduler.writes().len(), 1);
    assert_eq!(h.store.get_formation("app", "r1").unwrap().count("web"), 3);
    assert!(h.repo.get(&d.id).unwrap().is_finished());
}

#[tokio::test]
async fn stream_closure_aborts_without_finishing() {
    let h = Harness::new();
    h.seed("r1", &[("web", 2)]);
    let d = h.deploy(DeploymentStrategy::OneByOne);

    let controller = Arc::new(ScriptedController {
        store: h.store.clone(),
        script: vec![JobEvent {
            app_id: "app".to_string(),
            release_id: "r2".to_string(),
            job_id: "web-1".to_string(),
            process_type: "web".to_string(),
            state: JobState::Up,
        }],
    });
    let err = h.engine(controller).run(&d).await.unwrap_err();
    assert!(!err.is_terminal());
    match &err {
        RolloutError::Match(MatchError::StreamClosed { unmet }) => {
            assert_eq!(unmet.remaining("web", JobState::Down), 1);
        }
        other => panic!("expected stream closed, got {other:?}"),
    }

    let events = h.events(&d);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, DeploymentEventStatus::Running);
    assert!(!h.repo.get(&d.id).unwrap().is_finished());
}

#[tokio::test]
async fn old_release_events_do_not_confirm_new_instances() {
    let h = Harness::new();
    h.seed("r1", &[("web", 1)]);
    let d = h.deploy(DeploymentStrategy::OneByOne);

    let old_job = |state| JobEvent {
        app_id: "app".to_string(),
        release_id: "r1".to_string(),
        job_id: "web-old".to_string(),
        process_type: "web".to_string(),
        state,
    };
    let controller = Arc::new(ScriptedController {
        store: h.store.clone(),
        script: vec![old_job(JobState::Up), old_job(JobState::Down)],
    });
    let err = h.engine(controller).run(&d).await.unwrap_err();
    match &err {
        RolloutError::Match(MatchError::StreamClosed { unmet }) => {
            assert_eq!(unmet.release_id(), Some("r2"));
            assert_eq!(unmet.remaining("web", JobState::Up), 1);
        }
        other => panic!("expected stream closed, got {other:?}"),
    }

    // The old release was never scaled down and nothing was logged.
    assert_eq!(h.store.get_formation("app", "r1").unwrap().count("web"), 1);
    assert!(h.events(&d).is_empty());
    assert!(!h.repo.get(&d.id).unwrap().is_finished());
}

#[tokio::test]
async fn missing_old_formation_is_not_found() {
    let h = Harness::new();
    let d = h.deploy(DeploymentStrategy::OneByOne);

    let scheduler = Arc::new(SimulatedScheduler::new(h.store.clone()));
    let err = h.engine(scheduler).run(&d).await.unwrap_err();
    assert!(matches!(err, RolloutError::Controller(ControllerError::NotFound(_))));
    assert!(!h.repo.get(&d.id).unwrap().is_finished());
}

#[tokio::test]
async fn all_at_once_swaps_whole_formation() {
    let h = Harness::new();
    h.seed("r1", &[("web", 2), ("worker", 1)]);
    let d = h.deploy(DeploymentStrategy::AllAtOnce);

    let scheduler = Arc::new(SimulatedScheduler::new(h.store.clone()));
    h.engine(scheduler.clone()).run(&d).await.unwrap();

    let events = h.events(&d);
    assert_eq!(events.len(), 6);
    assert!(events[..3].iter().all(|e| e.job_state == JobState::Up));
    assert!(events[3..].iter().all(|e| e.job_state == JobState::Down));
    assert_eq!(events[5].status, DeploymentEventStatus::Complete);

    assert_eq!(scheduler.writes().len(), 2);
    assert_eq!(h.store.get_formation("app", "r1").unwrap().total(), 0);
    assert_eq!(h.store.get_formation("app", "r2").unwrap().total(), 3);
    assert!(h.repo.get(&d.id).unwrap().is_finished());
}

#[tokio::test]
async fn cancellation_leaves_deployment_unfinished() {
    let h = Harness::new();
    h.seed("r1", &[("web", 1)]);
    let d = h.deploy(DeploymentStrategy::OneByOne);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let scheduler = Arc::new(SimulatedScheduler::new(h.store.clone()).silent_for("app"));
    let engine = h.engine(scheduler).with_cancel(cancel_rx);

    let run = {
        let d = d.clone();
        tokio::spawn(async move { engine.run(&d).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel_tx.send(true).unwrap();

    let err = run.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(h.events(&d).is_empty());
    assert!(!h.repo.get(&d.id).unwrap().is_finished());
}

#[tokio::test]
async fn tail_observes_deployment_while_it_runs() {
    let h = Harness::new();
    h.seed("r1", &[("web", 2)]);
    let d = h.deploy(DeploymentStrategy::OneByOne);

    let mut tail = h.log.tail(d.id, 0, Duration::from_secs(30)).unwrap();

    let scheduler = Arc::new(SimulatedScheduler::new(h.store.clone()));
    let engine = h.engine(scheduler);
    let run = {
        let d = d.clone();
        tokio::spawn(async move { engine.run(&d).await })
    };

    let mut seen = Vec::new();
    while seen.len() < 4 {
        match tail.next().await {
            Some(Ok(TailItem::Event(e))) => seen.push(e),
            Some(Ok(TailItem::KeepAlive)) => {}
            other => panic!("tail ended early: {other:?}"),
        }
    }
    run.await.unwrap().unwrap();

    let ids: Vec<EventId> = seen.iter().map(|e| e.id).collect();
    let logged: Vec<EventId> = h.events(&d).iter().map(|e| e.id).collect();
    assert_eq!(ids, logged);
    assert_eq!(seen[3].status, DeploymentEventStatus::Complete);
}

#[tokio::test]
async fn worker_runs_admitted_deployment_once() {
    let h = Harness::new();
    h.seed("r1", &[("web", 1)]);
    let d = h.deploy(DeploymentStrategy::OneByOne);

    let scheduler = Arc::new(SimulatedScheduler::new(h.store.clone()));
    let worker = DeploymentWorker::new(
        h.repo.clone(),
        h.engine(scheduler),
        Duration::from_millis(10),
    );

    assert!(worker.work_once().await.unwrap());
    assert!(h.repo.get(&d.id).unwrap().is_finished());
    assert!(h.repo.queue().list().unwrap().is_empty());
    assert_eq!(h.events(&d).len(), 2);

    // Redelivery of a finished deployment is acknowledged without running.
    h.repo
        .queue()
        .enqueue(DEPLOYMENT_JOB, &DeployId { id: d.id })
        .unwrap();
    assert!(worker.work_once().await.unwrap());
    assert!(h.repo.queue().list().unwrap().is_empty());
    assert_eq!(h.events(&d).len(), 2);

    assert!(!worker.work_once().await.unwrap());
}

#[tokio::test]
async fn worker_parks_job_on_transient_failure() {
    let h = Harness::new();
    // No old formation: the engine fails with not-found.
    let d = h.deploy(DeploymentStrategy::OneByOne);

    let scheduler = Arc::new(SimulatedScheduler::new(h.store.clone()));
    let worker = DeploymentWorker::new(
        h.repo.clone(),
        h.engine(scheduler),
        Duration::from_millis(10),
    );

    assert!(worker.work_once().await.unwrap());
    let jobs = h.repo.queue().list().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].error_count, 1);
    assert!(jobs[0].last_error.is_some());
    assert!(!h.repo.get(&d.id).unwrap().is_finished());
}

#[tokio::test]
async fn worker_completes_crashed_deployment_job() {
    let h = Harness::new();
    h.seed("r1", &[("web", 1)]);
    let d = h.deploy(DeploymentStrategy::OneByOne);

    let scheduler = Arc::new(SimulatedScheduler::new(h.store.clone()).crashing("r2"));
    let worker = DeploymentWorker::new(
        h.repo.clone(),
        h.engine(scheduler),
        Duration::from_millis(10),
    );

    assert!(worker.work_once().await.unwrap());
    assert!(h.repo.queue().list().unwrap().is_empty());
    assert!(h.repo.get(&d.id).unwrap().is_finished());
}

#[tokio::test]
async fn worker_run_stops_on_shutdown() {
    let h = Harness::new();
    h.seed("r1", &[("web", 1)]);
    let d = h.deploy(DeploymentStrategy::OneByOne);

    let scheduler = Arc::new(SimulatedScheduler::new(h.store.clone()));
    let worker = DeploymentWorker::new(
        h.repo.clone(),
        h.engine(scheduler),
        Duration::from_millis(10),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    for _ in 0..100 {
        if h.repo.get(&d.id).unwrap().is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.repo.get(&d.id).unwrap().is_finished());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn stalled_deployment_does_not_block_other_apps() {
    let h = Harness::new();
    h.seed_app("a", "r1", &[("web", 1)]);
    h.seed_app("b", "r1", &[("web", 1)]);
    // Claimed first, and its scheduler never answers.
    let stalled = h.deploy_app("a", DeploymentStrategy::OneByOne);
    let d = h.deploy_app("b", DeploymentStrategy::OneByOne);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(SimulatedScheduler::new(h.store.clone()).silent_for("a"));
    let worker = DeploymentWorker::new(
        h.repo.clone(),
        h.engine(scheduler).with_cancel(shutdown_rx.clone()),
        Duration::from_millis(10),
    );
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    for _ in 0..200 {
        if h.repo.get(&d.id).unwrap().is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.repo.get(&d.id).unwrap().is_finished());
    assert_eq!(h.events(&d).len(), 2);
    assert!(!h.repo.get(&stalled.id).unwrap().is_finished());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();

    // The interrupted job stays claimed for redelivery.
    let jobs = h.repo.queue().list().unwrap();
    assert_eq!(jobs.len(), 1);
    let args: DeployId = jobs[0].decode_args().unwrap();
    assert_eq!(args.id, stalled.id);
}

#[tokio::test]
async fn worker_respects_concurrency_cap() {
    let h = Harness::new();
    h.seed_app("a", "r1", &[("web", 1)]);
    h.seed_app("b", "r1", &[("web", 1)]);
    h.deploy_app("a", DeploymentStrategy::OneByOne);
    let queued = h.deploy_app("b", DeploymentStrategy::OneByOne);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(
        SimulatedScheduler::new(h.store.clone())
            .silent_for("a")
            .silent_for("b"),
    );
    let worker = DeploymentWorker::new(
        h.repo.clone(),
        h.engine(scheduler).with_cancel(shutdown_rx.clone()),
        Duration::from_millis(10),
    )
    .with_max_concurrent(1);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    // Only app a's new release was written; b was never started.
    assert!(h.store.get_formation("a", "r2").is_ok());
    assert!(h.store.get_formation("b", "r2").unwrap_err().is_not_found());
    assert!(!h.repo.get(&queued.id).unwrap().is_finished());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}
