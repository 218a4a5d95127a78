use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::workers::{Worker, WorkerError};

/// Stop drops whatever is still queued, so tests drain before stopping.
fn wait_until(check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("worker did not drain in time");
}

#[test]
fn tasks_run_in_fifo_order() {
    let worker = Worker::new(1);
    let log: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..100 {
        let log = Arc::clone(&log);
        worker
            .post("test", move || log.lock().unwrap().push(i))
            .unwrap();
    }
    wait_until(|| log.lock().unwrap().len() == 100);
    worker.stop();
    assert_eq!(*log.lock().unwrap(), (0..100).collect::<Vec<_>>());
}

#[test]
fn stop_joins_and_is_idempotent() {
    let worker = Worker::new(2);
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let ran = Arc::clone(&ran);
        worker
            .post("test", move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    wait_until(|| ran.load(Ordering::SeqCst) == 1);
    worker.stop();
    worker.stop();
    // Posts after stop are dropped, not errors.
    let ran_late = Arc::clone(&ran);
    worker
        .post("test", move || {
            ran_late.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn pause_holds_tasks_and_resume_releases_them() {
    let worker = Worker::new(3);
    let ran = Arc::new(AtomicUsize::new(0));
    worker.pause();
    for _ in 0..5 {
        let ran = Arc::clone(&ran);
        worker
            .post("test", move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    worker.resume();
    wait_until(|| ran.load(Ordering::SeqCst) == 5);
    worker.stop();
}

#[test]
fn nested_pause_needs_matching_resumes() {
    let worker = Worker::new(4);
    let ran = Arc::new(AtomicUsize::new(0));
    worker.pause();
    worker.pause();
    {
        let ran = Arc::clone(&ran);
        worker
            .post("test", move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    worker.resume();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    worker.resume();
    wait_until(|| ran.load(Ordering::SeqCst) == 1);
    worker.stop();
}

#[test]
fn clear_tagged_removes_only_matching_origins() {
    let worker = Worker::new(5);
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    worker.pause();
    for origin in ["a", "b", "a", "b", "a"] {
        let log = Arc::clone(&log);
        worker
            .post(origin, move || log.lock().unwrap().push(origin))
            .unwrap();
    }
    let removed = worker.clear_tagged("a");
    assert_eq!(removed.len(), 3);
    assert!(removed.iter().all(|task| task.origin() == "a"));
    worker.resume();
    wait_until(|| log.lock().unwrap().len() == 2);
    worker.stop();
    assert_eq!(*log.lock().unwrap(), vec!["b", "b"]);
}

#[test]
fn queue_capacity_is_enforced() {
    let worker = Worker::with_max_pending(6, 2);
    worker.pause();
    worker.post("test", || {}).unwrap();
    worker.post("test", || {}).unwrap();
    match worker.post("test", || {}) {
        Err(WorkerError::QueueFull { index }) => assert_eq!(index, 6),
        other => panic!("expected QueueFull, got {other:?}"),
    }
    worker.resume();
    worker.stop();
}

#[test]
fn clear_all_empties_the_queue() {
    let worker = Worker::new(7);
    let ran = Arc::new(AtomicUsize::new(0));
    worker.pause();
    for _ in 0..4 {
        let ran = Arc::clone(&ran);
        worker
            .post("test", move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    assert_eq!(worker.clear_all().len(), 4);
    worker.resume();
    std::thread::sleep(Duration::from_millis(50));
    worker.stop();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}
