//! The scheduler core: a ticker and a dispatcher.
//!
//! Two cooperating tasks run inside the scheduler process:
//!
//! - The **ticker** owns the next-check instant — the minimum of every
//!   project's `cron.next(now)` — sleeps until it arrives and then signals
//!   the dispatcher. Ticks that fire while a check is still pending coalesce
//!   into one.
//! - The **dispatcher** owns the queue, the store handle and the reply duty
//!   of the runner endpoint. It consumes one event at a time from a single
//!   channel, so the queue is never mutated concurrently: a check pass,
//!   a runner request and the stop signal serialize naturally.
//!
//! Failure policy: everything that goes wrong *inside* a pass is absorbed
//! and logged — a failing probe skips its project for this pass, a failing
//! store insert drops that task — so one misbehaving project cannot stop
//! the others.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use kiln_kernel::cron::Clock;
use kiln_kernel::message::Message;
use kiln_kernel::runner::RunnerId;
use kiln_kernel::store::StoreError;
use kiln_kernel::task::Task;

use crate::endpoint::EventPublisher;
use crate::project::ProjectRegistry;
use crate::queue::TaskQueue;

/// Everything the dispatcher reacts to.
pub enum DispatcherEvent {
    /// Ticker signal: run a check pass over all projects.
    Check,
    /// A decoded runner request; the reply goes back through the slot
    /// (`None` when the request is dropped without a reply).
    Request {
        message: Message,
        reply: oneshot::Sender<Option<Message>>,
    },
    /// Orderly shutdown.
    Stop,
}

/// Channel between the event sources (ticker, endpoint, signal handler) and
/// the dispatcher.
pub fn channel() -> (mpsc::Sender<DispatcherEvent>, mpsc::Receiver<DispatcherEvent>) {
    mpsc::channel(64)
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// The serial executor owning queue and store mutation.
pub struct Dispatcher {
    registry: Arc<ProjectRegistry>,
    queue: TaskQueue,
    publisher: Box<dyn EventPublisher>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProjectRegistry>,
        queue: TaskQueue,
        publisher: Box<dyn EventPublisher>,
    ) -> Self {
        Self { registry, queue, publisher }
    }

    /// One check pass: probe every project, enqueue what they produce, and
    /// publish a change event when anything was added.
    pub async fn handle_check(&mut self) {
        tracing::debug!("checking projects");
        let mut changed = false;
        let registry = self.registry.clone();
        for project in registry.iter() {
            match project.check().await {
                Ok(Some(task)) => changed |= self.enqueue(task).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(project = %project.name(), error = %e, "scm check failed");
                }
            }
        }
        if changed {
            self.publish_changed().await;
        }
    }

    async fn enqueue(&mut self, task: Task) -> bool {
        match self.queue.add(task).await {
            Ok(added) => added,
            Err(e) => {
                tracing::error!(error = %e, "could not persist task, dropping it");
                false
            }
        }
    }

    async fn publish_changed(&mut self) {
        tracing::debug!("publishing change event");
        if let Err(e) = self.publisher.publish().await {
            tracing::warn!(error = %e, "could not publish change event");
        }
    }

    /// Answer one runner request. Unexpected message kinds are dropped.
    pub async fn handle_request(&mut self, message: Message) -> Option<Message> {
        match message {
            Message::QueryGetTask { runner } => Some(self.handle_get_task(runner).await),
            Message::QuerySetResult { runner, task, success } => {
                Some(self.handle_set_result(runner, task, success).await)
            }
            Message::ReplyGetTask { .. } | Message::ReplySetResult { .. } => {
                tracing::warn!("unexpected message");
                None
            }
        }
    }

    async fn handle_get_task(&mut self, runner: RunnerId) -> Message {
        let picked = self
            .queue
            .pick(&runner, &self.registry)
            .map(|task| (task.id(), task.descriptor().clone()));

        let Some((id, descriptor)) = picked else {
            tracing::info!(runner = %runner, "no suitable task");
            return Message::ReplyGetTask { runner, scm: None, task: None };
        };

        if let Err(e) = self.queue.mark_dispatched(id).await {
            tracing::error!(id, error = %e, "could not dispatch task");
            return Message::ReplyGetTask { runner, scm: None, task: None };
        }

        tracing::info!(id, runner = %runner, "sending task");
        let scm = kiln_kernel::json::find_str(&descriptor, "project")
            .and_then(|name| self.registry.get(name))
            .map(|project| project.scm_descriptor().clone());

        Message::ReplyGetTask { runner, scm, task: Some(descriptor) }
    }

    async fn handle_set_result(
        &mut self,
        runner: RunnerId,
        descriptor: serde_json::Value,
        success: bool,
    ) -> Message {
        let reply = Message::ReplySetResult { runner };

        let task = match self.queue.resolve(&descriptor).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                tracing::warn!("result for unknown task ignored");
                return reply;
            }
            Err(e) => {
                tracing::error!(error = %e, "could not resolve reported task");
                return reply;
            }
        };

        let outcome = if success {
            self.queue.mark_done(task.id()).await
        } else {
            self.queue.mark_aborted(task.id()).await
        };

        let mut changed = match outcome {
            Ok(()) => {
                tracing::info!(id = task.id(), success, "task finished");
                true
            }
            Err(StoreError::IllegalTransition { id, from, to }) => {
                // Runner retries land here; the duplicate is not an error.
                tracing::warn!(id, ?from, ?to, "result ignored, task already settled");
                false
            }
            Err(e) => {
                tracing::error!(id = task.id(), error = %e, "could not record task result");
                false
            }
        };

        if success && changed {
            if let Some(follow_up) = task
                .project_name()
                .and_then(|name| self.registry.get(name))
                .and_then(|project| project.next_task(&task))
            {
                changed |= self.enqueue(follow_up).await;
            }
        }

        if changed {
            self.publish_changed().await;
        }
        reply
    }
}

// ---------------------------------------------------------------------------
// Ticker
// ---------------------------------------------------------------------------

/// Sleep when no project has an upcoming check; the loop still wakes to
/// honor cancellation.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

async fn ticker_loop(
    registry: Arc<ProjectRegistry>,
    clock: Arc<dyn Clock>,
    dispatcher: mpsc::Sender<DispatcherEvent>,
    check_pending: Arc<AtomicBool>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    loop {
        let now = clock.now();
        let wait = match registry.next_check(now) {
            Some(next) => {
                tracing::debug!(next = %next, "next check time");
                (next - now).to_std().unwrap_or(Duration::ZERO)
            }
            None => IDLE_WAIT,
        };

        tokio::select! {
            _ = &mut cancel_rx => return,
            _ = tokio::time::sleep(wait) => {
                // Coalesce: while a check is pending, further ticks are no-ops.
                if !check_pending.swap(true, Ordering::SeqCst)
                    && dispatcher.send(DispatcherEvent::Check).await.is_err()
                {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Owns the dispatcher and spawns the ticker; `run` consumes events until
/// stopped.
pub struct Scheduler {
    registry: Arc<ProjectRegistry>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<ProjectRegistry>,
        queue: TaskQueue,
        publisher: Box<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dispatcher = Dispatcher::new(registry.clone(), queue, publisher);
        Self { registry, dispatcher, clock }
    }

    /// Run until a `Stop` event arrives (or every sender is gone).
    ///
    /// `sender` is the same side of the channel the endpoint and signal
    /// handler use; the ticker gets a clone of it.
    pub async fn run(
        mut self,
        sender: mpsc::Sender<DispatcherEvent>,
        mut events: mpsc::Receiver<DispatcherEvent>,
    ) {
        let check_pending = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let ticker = tokio::spawn(ticker_loop(
            self.registry.clone(),
            self.clock.clone(),
            sender,
            check_pending.clone(),
            cancel_rx,
        ));

        tracing::info!(projects = self.registry.len(), "scheduler running");
        while let Some(event) = events.recv().await {
            match event {
                DispatcherEvent::Check => {
                    check_pending.store(false, Ordering::SeqCst);
                    self.dispatcher.handle_check().await;
                }
                DispatcherEvent::Request { message, reply } => {
                    let response = self.dispatcher.handle_request(message).await;
                    let _ = reply.send(response);
                }
                DispatcherEvent::Stop => {
                    tracing::info!("stop requested");
                    break;
                }
            }
        }

        let _ = cancel_tx.send(());
        let _ = ticker.await;
        tracing::info!("scheduler stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointError;
    use crate::project::Project;
    use crate::scm::StubProbe;
    use crate::store::SqliteTaskStore;
    use async_trait::async_trait;
    use kiln_kernel::cron::CronSpec;
    use kiln_kernel::scm::ScmError;
    use kiln_kernel::store::TaskStore;
    use kiln_kernel::task::TaskStatus;
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicUsize;

    /// Counts published change events instead of touching a socket.
    struct ChannelPublisher {
        published: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventPublisher for ChannelPublisher {
        async fn publish(&mut self) -> Result<(), EndpointError> {
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<SqliteTaskStore>,
        published: Arc<AtomicUsize>,
    }

    async fn harness(projects: Vec<Project>) -> Harness {
        let store = Arc::new(SqliteTaskStore::in_memory().await.unwrap());
        harness_with_store(projects, store).await
    }

    async fn harness_with_store(projects: Vec<Project>, store: Arc<SqliteTaskStore>) -> Harness {
        let registry = Arc::new(ProjectRegistry::from_projects(projects));
        let queue = TaskQueue::restore(store.clone()).await.unwrap();
        let published = Arc::new(AtomicUsize::new(0));
        let publisher = Box::new(ChannelPublisher { published: published.clone() });
        Harness {
            dispatcher: Dispatcher::new(registry, queue, publisher),
            store,
            published,
        }
    }

    fn project(name: &str, probe: StubProbe, criteria: Value) -> Project {
        Project::new(
            name,
            CronSpec::parse("* * * * *").unwrap(),
            Arc::new(probe),
            criteria,
        )
    }

    fn task_for(project: &str, step: &str) -> Task {
        Task::new(json!({"project": project, "run": step}))
    }

    fn get_task(runner: RunnerId) -> Message {
        Message::QueryGetTask { runner }
    }

    fn set_result(descriptor: Value, success: bool) -> Message {
        Message::QuerySetResult {
            runner: RunnerId::default(),
            task: descriptor,
            success,
        }
    }

    #[tokio::test]
    async fn check_pass_enqueues_and_publishes() {
        let mut h = harness(vec![project(
            "demo",
            StubProbe::yielding(vec![task_for("demo", "build")]),
            json!({}),
        )])
        .await;

        h.dispatcher.handle_check().await;
        assert_eq!(h.dispatcher.queue.pending(), 1);
        assert_eq!(h.published.load(Ordering::SeqCst), 1);

        // Nothing new on the second pass: no event either.
        h.dispatcher.handle_check().await;
        assert_eq!(h.dispatcher.queue.pending(), 1);
        assert_eq!(h.published.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_probe_skips_only_its_project() {
        let mut h = harness(vec![
            project(
                "broken",
                StubProbe::new(vec![Err(ScmError::Failure("boom".into()))]),
                json!({}),
            ),
            project(
                "healthy",
                StubProbe::yielding(vec![task_for("healthy", "build")]),
                json!({}),
            ),
        ])
        .await;

        h.dispatcher.handle_check().await;
        assert_eq!(h.dispatcher.queue.pending(), 1);
        assert_eq!(
            h.dispatcher.queue.tasks()[0].project_name(),
            Some("healthy")
        );
    }

    #[tokio::test]
    async fn identical_descriptors_collapse_to_one_task() {
        let mut h = harness(vec![project("demo", StubProbe::empty(), json!({}))]).await;
        h.dispatcher.enqueue(task_for("demo", "build")).await;
        h.dispatcher.enqueue(task_for("demo", "build")).await;
        assert_eq!(h.dispatcher.queue.pending(), 1);
        assert_eq!(h.store.load_new().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn requests_drain_tasks_in_id_order() {
        let mut h = harness(vec![project("demo", StubProbe::empty(), json!({}))]).await;
        h.dispatcher.enqueue(task_for("demo", "t1")).await;
        h.dispatcher.enqueue(task_for("demo", "t2")).await;

        let reply = h.dispatcher.handle_request(get_task(RunnerId::default())).await;
        let Some(Message::ReplyGetTask { task: Some(first), scm: Some(_), .. }) = reply else {
            panic!("expected a task in the first reply");
        };
        assert_eq!(first["run"], "t1");

        let reply = h.dispatcher.handle_request(get_task(RunnerId::default())).await;
        let Some(Message::ReplyGetTask { task: Some(second), .. }) = reply else {
            panic!("expected a task in the second reply");
        };
        assert_eq!(second["run"], "t2");

        // Both rows moved to running.
        for task in h.dispatcher.queue.tasks() {
            assert_eq!(task.status(), TaskStatus::Running);
            assert_eq!(h.store.status_of(task.id()).await, Some(TaskStatus::Running));
        }

        let reply = h.dispatcher.handle_request(get_task(RunnerId::default())).await;
        assert!(matches!(
            reply,
            Some(Message::ReplyGetTask { task: None, scm: None, .. })
        ));
    }

    #[tokio::test]
    async fn mismatched_runner_gets_nothing() {
        let mut h = harness(vec![project(
            "demo",
            StubProbe::empty(),
            json!({"name": "special"}),
        )])
        .await;
        h.dispatcher.enqueue(task_for("demo", "t1")).await;

        let stranger = RunnerId::new(Some("other".into()), None);
        let reply = h.dispatcher.handle_request(get_task(stranger)).await;
        assert!(matches!(
            reply,
            Some(Message::ReplyGetTask { task: None, .. })
        ));

        let matching = RunnerId::new(Some("special".into()), None);
        let reply = h.dispatcher.handle_request(get_task(matching)).await;
        assert!(matches!(
            reply,
            Some(Message::ReplyGetTask { task: Some(_), .. })
        ));
    }

    #[tokio::test]
    async fn failed_result_aborts_and_leaves_the_rest() {
        let mut h = harness(vec![project("demo", StubProbe::empty(), json!({}))]).await;
        h.dispatcher.enqueue(task_for("demo", "t1")).await;
        h.dispatcher.enqueue(task_for("demo", "t2")).await;

        let Some(Message::ReplyGetTask { task: Some(first), .. }) =
            h.dispatcher.handle_request(get_task(RunnerId::default())).await
        else {
            panic!("expected a task");
        };

        let reply = h
            .dispatcher
            .handle_request(set_result(first.clone(), false))
            .await;
        assert!(matches!(reply, Some(Message::ReplySetResult { .. })));

        let aborted = h.store.find_active(&first).await.unwrap();
        assert!(aborted.is_none(), "failed task should be terminal");

        let Some(Message::ReplyGetTask { task: Some(next), .. }) =
            h.dispatcher.handle_request(get_task(RunnerId::default())).await
        else {
            panic!("expected the second task");
        };
        assert_eq!(next["run"], "t2");
    }

    #[tokio::test]
    async fn successful_result_marks_done_and_publishes() {
        let mut h = harness(vec![project("demo", StubProbe::empty(), json!({}))]).await;
        h.dispatcher.enqueue(task_for("demo", "t1")).await;
        let id = h.dispatcher.queue.tasks()[0].id();

        h.dispatcher.handle_request(get_task(RunnerId::default())).await;
        let before = h.published.load(Ordering::SeqCst);
        h.dispatcher
            .handle_request(set_result(task_for("demo", "t1").descriptor().clone(), true))
            .await;

        assert_eq!(h.store.status_of(id).await, Some(TaskStatus::Done));
        assert!(h.dispatcher.queue.is_empty());
        assert_eq!(h.published.load(Ordering::SeqCst), before + 1);
    }

    #[tokio::test]
    async fn duplicate_results_are_acknowledged_but_ignored() {
        let mut h = harness(vec![project("demo", StubProbe::empty(), json!({}))]).await;
        h.dispatcher.enqueue(task_for("demo", "t1")).await;
        let id = h.dispatcher.queue.tasks()[0].id();
        let descriptor = task_for("demo", "t1").descriptor().clone();

        h.dispatcher.handle_request(get_task(RunnerId::default())).await;
        h.dispatcher
            .handle_request(set_result(descriptor.clone(), true))
            .await;

        // Retry with the opposite outcome: acknowledged, state unchanged.
        let reply = h
            .dispatcher
            .handle_request(set_result(descriptor, false))
            .await;
        assert!(matches!(reply, Some(Message::ReplySetResult { .. })));
        assert_eq!(h.store.status_of(id).await, Some(TaskStatus::Done));
    }

    #[tokio::test]
    async fn results_for_unknown_tasks_are_acknowledged() {
        let mut h = harness(vec![project("demo", StubProbe::empty(), json!({}))]).await;
        let reply = h
            .dispatcher
            .handle_request(set_result(json!({"project": "demo", "run": "ghost"}), true))
            .await;
        assert!(matches!(reply, Some(Message::ReplySetResult { .. })));
    }

    #[tokio::test]
    async fn replies_as_requests_are_dropped() {
        let mut h = harness(vec![]).await;
        let reply = h
            .dispatcher
            .handle_request(Message::ReplySetResult { runner: RunnerId::default() })
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn restart_recovers_pending_and_accepts_late_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let t1 = task_for("demo", "t1");

        {
            let store = Arc::new(SqliteTaskStore::open(&path).await.unwrap());
            let mut h =
                harness_with_store(vec![project("demo", StubProbe::empty(), json!({}))], store)
                    .await;
            h.dispatcher.enqueue(t1.clone()).await;
            h.dispatcher.enqueue(task_for("demo", "t2")).await;
            h.dispatcher.handle_request(get_task(RunnerId::default())).await;
            // Process dies here with t1 running.
        }

        let store = Arc::new(SqliteTaskStore::open(&path).await.unwrap());
        let mut h = harness_with_store(
            vec![project("demo", StubProbe::empty(), json!({}))],
            store.clone(),
        )
        .await;

        assert_eq!(h.dispatcher.queue.pending(), 1);
        assert!(h.dispatcher.queue.tasks()[0].same_as(&task_for("demo", "t2")));

        // The runner finally reports t1: accepted via the store lookup.
        let reply = h
            .dispatcher
            .handle_request(set_result(t1.descriptor().clone(), true))
            .await;
        assert!(matches!(reply, Some(Message::ReplySetResult { .. })));
        let done = store.find_active(t1.descriptor()).await.unwrap();
        assert!(done.is_none(), "t1 should be terminal after the late result");
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_signals_and_coalesces() {
        struct FixedClock(chrono::NaiveDateTime);
        impl Clock for FixedClock {
            fn now(&self) -> chrono::NaiveDateTime {
                self.0
            }
        }

        let registry = Arc::new(ProjectRegistry::from_projects(vec![project(
            "demo",
            StubProbe::empty(),
            json!({}),
        )]));
        let clock = Arc::new(FixedClock(
            chrono::NaiveDate::from_ymd_opt(2021, 6, 15)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
        ));

        let (tx, mut rx) = channel();
        let pending = Arc::new(AtomicBool::new(false));
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(ticker_loop(registry, clock, tx, pending.clone(), cancel_rx));

        // First tick arrives after the virtual minute elapses.
        let event = rx.recv().await;
        assert!(matches!(event, Some(DispatcherEvent::Check)));
        assert!(pending.load(Ordering::SeqCst));

        // With the check still pending, further ticks coalesce: the channel
        // stays empty even though virtual time keeps advancing.
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn scheduler_run_stops_on_request() {
        let store = Arc::new(SqliteTaskStore::in_memory().await.unwrap());
        let registry = Arc::new(ProjectRegistry::from_projects(vec![]));
        let queue = TaskQueue::restore(store).await.unwrap();
        let published = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(
            registry,
            queue,
            Box::new(ChannelPublisher { published }),
            Arc::new(kiln_kernel::cron::SystemClock),
        );

        let (tx, rx) = channel();
        let runner = tokio::spawn(scheduler.run(tx.clone(), rx));
        tx.send(DispatcherEvent::Stop).await.unwrap();
        runner.await.unwrap();
    }
}
