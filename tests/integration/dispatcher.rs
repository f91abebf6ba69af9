#[path = "common/mod.rs"]
mod common;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, mpsc},
    thread,
    time::{Duration, Instant},
};

use subsys::{
    DispatcherConfig, Job, RuntimeError, StopPolicy, SubsystemState, Task, TaskDispatcher,
    TaskState, Timeout, WorkerInfo, task_fn,
};

fn dispatcher(name: &str, workers: usize, stop_policy: StopPolicy) -> TaskDispatcher {
    TaskDispatcher::new(
        name,
        DispatcherConfig {
            workers,
            stop_policy,
            poll_interval: Timeout::from_millis(20),
            ..DispatcherConfig::default()
        },
    )
    .unwrap()
}

#[test]
fn drain_policy_executes_everything_before_stop_returns() {
    let dispatcher = dispatcher("drain", 2, StopPolicy::Drain);
    dispatcher.start().unwrap();

    let statuses: Vec<_> = (0..5)
        .map(|i| {
            dispatcher
                .push(task_fn(format!("task-{i}"), |_| {
                    thread::sleep(Duration::from_millis(50))
                }))
                .unwrap()
        })
        .collect();

    dispatcher.stop().unwrap();
    for status in &statuses {
        assert_eq!(status.state(), TaskState::Done);
    }
    assert_eq!(dispatcher.state(), SubsystemState::Idling);
}

#[test]
fn abandon_policy_stops_within_bounded_time() {
    let dispatcher = dispatcher("abandon", 2, StopPolicy::Abandon);
    dispatcher.start().unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let statuses: Vec<_> = (0..5)
        .map(|i| {
            let started_tx = started_tx.clone();
            dispatcher
                .push(task_fn(format!("slow-{i}"), move |_| {
                    let _ = started_tx.send(());
                    thread::sleep(Duration::from_secs(1))
                }))
                .unwrap()
        })
        .collect();
    for _ in 0..2 {
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    assert_eq!(dispatcher.pending(), 3);

    let began = Instant::now();
    let outcome = dispatcher.stop_within(Timeout::from_millis(100));
    assert!(began.elapsed() < Duration::from_millis(900));
    assert!(matches!(outcome, Err(RuntimeError::StopTimedOut { .. })));
    let executed = statuses.iter().filter(|s| s.is_executed()).count();
    assert!(executed <= 2);

    assert!(
        dispatcher
            .subsystem()
            .wait_for(SubsystemState::Idling, Timeout::from_secs(5))
    );
    let executed = statuses.iter().filter(|s| s.is_executed()).count();
    let abandoned = statuses
        .iter()
        .filter(|s| s.state() == TaskState::Abandoned)
        .count();
    assert_eq!((executed, abandoned), (2, 3));
}

#[test]
fn k_tasks_execute_exactly_k_times_across_workers() {
    const WORKERS: usize = 4;
    const TASKS: usize = 400;
    let dispatcher = dispatcher("spread", WORKERS, StopPolicy::Drain);
    dispatcher.start().unwrap();

    let per_worker = Arc::new(Mutex::new(HashMap::<usize, usize>::new()));
    for i in 0..TASKS {
        let per_worker = Arc::clone(&per_worker);
        dispatcher
            .push(task_fn(format!("t{i}"), move |worker: &WorkerInfo| {
                thread::sleep(Duration::from_micros(200));
                *per_worker.lock().unwrap().entry(worker.id()).or_default() += 1;
            }))
            .unwrap();
    }
    dispatcher.stop().unwrap();

    let per_worker = per_worker.lock().unwrap();
    assert_eq!(per_worker.values().sum::<usize>(), TASKS);
    assert!(per_worker.keys().all(|id| *id < WORKERS));
    assert_eq!(dispatcher.counters().executed, TASKS as u64);
}

#[test]
fn dispatcher_can_be_restarted() {
    let dispatcher = dispatcher("restart", 2, StopPolicy::Drain);
    for round in 0..3 {
        dispatcher.start().unwrap();
        let status = dispatcher
            .push(task_fn(format!("round-{round}"), |_| {}))
            .unwrap();
        dispatcher.stop().unwrap();
        assert!(status.is_executed());
    }
    assert_eq!(dispatcher.counters().executed, 3);
}

#[test]
fn a_pushed_job_cannot_run_twice() {
    struct Reports(mpsc::Sender<usize>);

    impl Task for Reports {
        fn run(self: Box<Self>, worker: &WorkerInfo) {
            let _ = self.0.send(worker.id());
        }
    }

    let dispatcher = dispatcher("once", 1, StopPolicy::Drain);
    dispatcher.start().unwrap();

    let (tx, rx) = mpsc::channel();
    let mut stolen = Job::new(Reports(tx.clone()));
    stolen.execute(&WorkerInfo::new(99, "test")).unwrap();
    // Already executed outside the pool; the worker must refuse it.
    let status = dispatcher.push_job(stolen).unwrap();
    dispatcher.push(Reports(tx)).unwrap();
    dispatcher.stop().unwrap();

    let ran: Vec<usize> = rx.try_iter().collect();
    assert_eq!(ran, [99, 0]);
    assert_eq!(status.state(), TaskState::Done);
    assert_eq!(dispatcher.counters().executed, 1);
}

#[test]
fn sender_outlives_the_running_phase() {
    let dispatcher = dispatcher("sender", 1, StopPolicy::Drain);
    let sender = dispatcher.sender();
    assert!(matches!(
        sender.push(task_fn("early", |_| {})),
        Err(RuntimeError::NotRunning { .. })
    ));

    dispatcher.start().unwrap();
    let status = sender.push(task_fn("on-time", |_| {})).unwrap();
    dispatcher.stop().unwrap();
    assert!(status.is_executed());

    assert!(sender.push(task_fn("late", |_| {})).is_err());
    assert_eq!(dispatcher.counters().rejected, 2);
}
