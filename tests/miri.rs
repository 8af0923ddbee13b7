//! Tests specifically for miri

#![cfg(miri)]

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use jobsteal::JobContext;
use jobsteal::JobSystem;
use jobsteal::JobSystemConfig;
use jobsteal::WorkStealingQueue;
use tracing::info;

/// A node in a binary tree.
struct Node {
    val: u64,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

impl Node {
    // Constructs a new binary tree with the given number of layers.
    pub fn tree(layers: usize) -> Self {
        Self {
            val: 1,
            left: (layers != 1).then(|| Box::new(Self::tree(layers - 1))),
            right: (layers != 1).then(|| Box::new(Self::tree(layers - 1))),
        }
    }
}

#[test]
fn queue_round_trip() {
    let queue = Arc::new(WorkStealingQueue::<u32, 8>::new());

    // SAFETY: This thread owns the queue.
    unsafe {
        for value in 0..6 {
            assert!(queue.push(value));
        }
    }

    let thief = {
        let queue = queue.clone();
        std::thread::spawn(move || {
            let mut taken = Vec::new();
            while let Some(value) = queue.steal() {
                taken.push(value);
            }
            taken
        })
    };

    let mut owned = Vec::new();
    // SAFETY: This thread owns the queue.
    while let Some(value) = unsafe { queue.pop() } {
        owned.push(value);
    }

    let mut all = thief.join().unwrap();
    all.extend(owned);
    all.sort_unstable();
    assert_eq!(all, [0, 1, 2, 3, 4, 5]);
}

#[test]
fn tree_sum() {
    let layers = 5;
    let target = (1 << layers) - 1;

    fn sum(cx: &JobContext<'_>, node: Arc<Node>, path: Vec<bool>, total: Arc<AtomicU64>) {
        let mut here = node.as_ref();
        for &left in &path {
            here = if left { here.left.as_deref() } else { here.right.as_deref() }
                .expect("path leads to a node");
        }
        total.fetch_add(here.val, Ordering::Relaxed);

        for (child, side) in [(&here.left, true), (&here.right, false)] {
            if child.is_some() {
                let (node, total) = (node.clone(), total.clone());
                let mut path = path.clone();
                path.push(side);
                cx.spawn_child(move |cx| sum(cx, node, path, total));
            }
        }
    }

    let tree = Arc::new(Node::tree(layers));
    let total = Arc::new(AtomicU64::new(0));

    let jobs = JobSystem::start(JobSystemConfig::default().with_workers(2).with_max_jobs(64));
    info!("Work beginning");
    let root = jobs.create_job({
        let total = total.clone();
        move |cx| sum(cx, tree, Vec::new(), total)
    });
    jobs.run_and_wait(root);
    info!("Work completed");
    jobs.shutdown();

    assert_eq!(total.load(Ordering::Relaxed), target);
}
