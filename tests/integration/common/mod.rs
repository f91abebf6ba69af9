#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use subsys::{Subsystem, SubsystemState};

/// Polls `condition` until it holds or five seconds pass.
pub fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() >= deadline {
            panic!("Timed out waiting for {description}");
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Asserts that every node of the tree rooted at `root` is in `state`.
pub fn assert_tree_state(root: &Subsystem, state: SubsystemState) {
    assert_eq!(root.state(), state, "subsystem '{}'", root.name());
    for child in root.children() {
        assert_tree_state(&child, state);
    }
}

pub fn write_config(dir: &Path, yaml: &str) -> PathBuf {
    let path = dir.join("subsysd.yaml");
    fs::write(&path, yaml).expect("failed to write config");
    path
}
