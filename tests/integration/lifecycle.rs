#[path = "common/mod.rs"]
mod common;

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use common::{assert_tree_state, wait_until};
use subsys::{
    HookError, NoHooks, RuntimeError, Subsystem, SubsystemHooks, SubsystemState, ThreadOptions,
    Timeout,
};

/// Spawns `threads` bound threads that idle until told to terminate.
struct Busy {
    threads: usize,
    options: ThreadOptions,
}

impl SubsystemHooks for Busy {
    fn on_start(&self, subsystem: &Subsystem) -> Result<(), HookError> {
        for i in 0..self.threads {
            subsystem.spawn_thread(
                format!("{}-{i}", subsystem.name()),
                self.options,
                |ctx| while !ctx.await_termination(Timeout::from_millis(50)) {},
            )?;
        }
        Ok(())
    }
}

/// Appends "<name>:start" / "<name>:stop" to a shared journal.
struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl SubsystemHooks for Journal {
    fn on_start(&self, subsystem: &Subsystem) -> Result<(), HookError> {
        self.entries
            .lock()
            .unwrap()
            .push(format!("{}:start", subsystem.name()));
        Ok(())
    }

    fn on_stop(&self, subsystem: &Subsystem) {
        self.entries
            .lock()
            .unwrap()
            .push(format!("{}:stop", subsystem.name()));
    }
}

fn build_tree(depth: usize, fanout: usize, threads: usize) -> (Subsystem, usize) {
    fn grow(node: &Subsystem, depth: usize, fanout: usize, threads: usize, mode: usize) -> usize {
        if depth == 0 {
            return 0;
        }
        let mut total = 0;
        for i in 0..fanout {
            let options = if (mode + i) % 2 == 0 {
                ThreadOptions::derived()
            } else {
                ThreadOptions::independent()
            };
            let child = node.add_child(format!("{}.{i}", node.name()), Busy { threads, options });
            total += threads + grow(&child, depth - 1, fanout, threads, mode + i + 1);
        }
        total
    }

    let root = Subsystem::root(
        "root",
        Busy {
            threads,
            options: ThreadOptions::independent(),
        },
    );
    let total = threads + grow(&root, depth, fanout, threads, 0);
    (root, total)
}

#[test]
fn deep_tree_stops_with_no_live_threads() {
    let (root, total) = build_tree(3, 2, 2);
    // 1 + 2 + 4 + 8 nodes, two threads each.
    assert_eq!(total, 30);

    root.start().unwrap();
    assert_tree_state(&root, SubsystemState::Running);

    root.stop().unwrap();
    assert_tree_state(&root, SubsystemState::Idling);

    fn live(node: &Subsystem) -> usize {
        node.live_threads() + node.children().iter().map(live).sum::<usize>()
    }
    assert_eq!(live(&root), 0);
}

#[test]
fn start_and_stop_order_follows_the_tree() {
    let entries = Arc::new(Mutex::new(Vec::new()));
    let root = Subsystem::root(
        "root",
        Journal {
            entries: Arc::clone(&entries),
        },
    );
    let left = root.add_child(
        "left",
        Journal {
            entries: Arc::clone(&entries),
        },
    );
    left.add_child(
        "left.leaf",
        Journal {
            entries: Arc::clone(&entries),
        },
    );
    root.add_child(
        "right",
        Journal {
            entries: Arc::clone(&entries),
        },
    );

    root.start().unwrap();
    root.stop().unwrap();

    let entries = entries.lock().unwrap().clone();
    assert_eq!(
        entries,
        [
            "left.leaf:start",
            "left:start",
            "right:start",
            "root:start",
            "root:stop",
            "right:stop",
            "left:stop",
            "left.leaf:stop",
        ]
    );
}

#[test]
fn failed_setup_leaves_no_threads_behind() {
    struct SpawnsThenFails;

    impl SubsystemHooks for SpawnsThenFails {
        fn on_start(&self, subsystem: &Subsystem) -> Result<(), HookError> {
            subsystem.spawn_thread("doomed", ThreadOptions::independent(), |ctx| {
                while !ctx.await_termination(Timeout::from_millis(50)) {}
            })?;
            Err("port already taken".into())
        }
    }

    let root = Subsystem::root("root", NoHooks);
    let sibling = root.add_child(
        "sibling",
        Busy {
            threads: 2,
            options: ThreadOptions::derived(),
        },
    );
    let broken = root.add_child("broken", SpawnsThenFails);

    let err = root.start().unwrap_err();
    assert!(matches!(err, RuntimeError::StartFailed { ref subsystem, .. } if subsystem == "broken"));
    assert_tree_state(&root, SubsystemState::Idling);
    assert_eq!(sibling.live_threads(), 0);
    assert_eq!(broken.live_threads(), 0);
}

#[test]
fn thread_death_stops_only_its_subtree() {
    let root = Subsystem::root("root", NoHooks);
    let healthy = root.add_child(
        "healthy",
        Busy {
            threads: 1,
            options: ThreadOptions::derived(),
        },
    );
    let fragile = root.add_child("fragile", NoHooks);

    root.start().unwrap();
    fragile
        .spawn_thread("dies", ThreadOptions::independent(), |_| {})
        .unwrap();

    assert!(fragile.wait_for(SubsystemState::Idling, Timeout::from_secs(5)));
    assert_eq!(root.state(), SubsystemState::Running);
    assert_eq!(healthy.state(), SubsystemState::Running);

    root.stop().unwrap();
    assert_tree_state(&root, SubsystemState::Idling);
}

#[test]
fn child_stopping_during_startup_fails_the_parent() {
    /// Takes a while to come up, giving an earlier sibling time to die.
    struct SlowSetup;

    impl SubsystemHooks for SlowSetup {
        fn on_start(&self, _subsystem: &Subsystem) -> Result<(), HookError> {
            std::thread::sleep(std::time::Duration::from_millis(300));
            Ok(())
        }
    }

    /// Its only thread returns at once, so auto-stop unwinds the subsystem.
    struct ShortLived;

    impl SubsystemHooks for ShortLived {
        fn on_start(&self, subsystem: &Subsystem) -> Result<(), HookError> {
            subsystem.spawn_thread("gone", ThreadOptions::independent(), |_| {})?;
            Ok(())
        }
    }

    let root = Subsystem::root("root", NoHooks);
    let short_lived = root.add_child("short-lived", ShortLived);
    root.add_child("slow", SlowSetup);

    let err = root.start().unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ChildNotRunning { ref subsystem, ref child, .. }
            if subsystem == "root" && child == "short-lived"
    ));
    assert_tree_state(&root, SubsystemState::Idling);
    assert_eq!(short_lived.live_threads(), 0);

    // The failed attempt leaves the tree restartable.
    let err = root.start().unwrap_err();
    assert!(matches!(err, RuntimeError::ChildNotRunning { .. }));
    assert_tree_state(&root, SubsystemState::Idling);
}

#[test]
fn stop_within_reports_a_hung_thread_then_completes() {
    let release = subsys::TerminationFlag::new();
    let root = Subsystem::root("root", NoHooks);
    root.start().unwrap();
    {
        let release = release.clone();
        root.spawn_thread("stubborn", ThreadOptions::derived(), move |_| {
            // Ignores its own termination condition until released.
            release.wait(Timeout::from_secs(10));
        })
        .unwrap();
    }

    let err = root.stop_within(Timeout::from_millis(50)).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::StopTimedOut {
            state: SubsystemState::Stopping,
            ..
        }
    ));

    release.set();
    assert!(root.wait_for(SubsystemState::Idling, Timeout::from_secs(5)));
    assert_eq!(root.live_threads(), 0);
}

#[test]
fn concurrent_stop_requests_are_idempotent() {
    let stops = Arc::new(AtomicUsize::new(0));

    struct CountStops(Arc<AtomicUsize>);

    impl SubsystemHooks for CountStops {
        fn on_stop(&self, _subsystem: &Subsystem) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let root = Subsystem::root("root", CountStops(Arc::clone(&stops)));
    root.start().unwrap();

    let requesters: Vec<_> = (0..8)
        .map(|_| {
            let root = root.clone();
            std::thread::spawn(move || root.request_stop())
        })
        .collect();
    for requester in requesters {
        requester.join().unwrap().unwrap();
    }

    wait_until("root to stop", || root.state() == SubsystemState::Idling);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}
