//! CPU-indexed I/O workers.
//!
//! Each priority class has its own set of worker tasks. A queue is bound to
//! one worker index for its lifetime and its I/O task is only ever scheduled
//! there, so one queue's I/O never runs concurrently with itself.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::trace;

use super::queue::MuxQueue;
use crate::core::{PriorityClass, lock};

/// Worker tasks for both priority classes.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    throughput: Vec<UnboundedSender<Arc<MuxQueue>>>,
    latency: Vec<UnboundedSender<Arc<MuxQueue>>>,
    cpu_stride: usize,
    next: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(runtime: &Handle, workers: usize, cpu_stride: usize) -> Self {
        let mut tasks = Vec::with_capacity(workers * 2);
        let mut spawn_class = |class: PriorityClass| {
            (0..workers)
                .map(|cpu| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    tasks.push(runtime.spawn(run_worker(class, cpu, rx)));
                    tx
                })
                .collect::<Vec<_>>()
        };
        let throughput = spawn_class(PriorityClass::Throughput);
        let latency = spawn_class(PriorityClass::Latency);
        Self {
            throughput,
            latency,
            cpu_stride,
            next: AtomicUsize::new(0),
            tasks: Mutex::new(tasks),
        }
    }

    /// Worker index for the next queue: `(n * cpu_stride) % workers`.
    pub(crate) fn assign_cpu(&self) -> usize {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        (n * self.cpu_stride) % self.throughput.len()
    }

    /// Queue the I/O task of `queue` on its worker unless already pending.
    pub(crate) fn schedule(&self, queue: &Arc<MuxQueue>) {
        if queue.io_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers = match queue.class() {
            PriorityClass::Throughput => &self.throughput,
            PriorityClass::Latency => &self.latency,
        };
        if workers[queue.io_cpu()].send(Arc::clone(queue)).is_err() {
            queue.io_pending.store(false, Ordering::Release);
        }
    }

    pub(crate) fn shutdown(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

async fn run_worker(class: PriorityClass, cpu: usize, mut rx: UnboundedReceiver<Arc<MuxQueue>>) {
    while let Some(queue) = rx.recv().await {
        queue.io_work();
        tokio::task::yield_now().await;
    }
    trace!(?class, cpu, "io worker stopped");
}
