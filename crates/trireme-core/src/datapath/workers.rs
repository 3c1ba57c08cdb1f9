//! Packet worker pool.
//!
//! One worker per queue, each processing its packets serially; workers
//! run concurrently across queues. Workers block only on the queue
//! read and exit when the queue closes. A background sweeper expires
//! one connection-table shard at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::queue::{PacketQueue, QueueError};
use super::Datapath;

const SWEEP_INTERVAL: Duration = Duration::from_millis(250);
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(10);

/// Running packet workers plus the expiry sweeper.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `worker_count` workers reading from `queue`.
    #[must_use]
    pub fn spawn(
        datapath: Arc<Datapath>,
        queue: Arc<dyn PacketQueue>,
        worker_count: usize,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count.max(1))
            .map(|index| {
                let datapath = Arc::clone(&datapath);
                let queue = Arc::clone(&queue);
                std::thread::Builder::new()
                    .name(format!("trireme-worker-{index}"))
                    .spawn(move || worker_loop(&datapath, queue.as_ref()))
                    .expect("spawn packet worker")
            })
            .collect();

        let sweeper = {
            let datapath = Arc::clone(&datapath);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("trireme-sweeper".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let removed = datapath.conntrack().expire_next_shard(Instant::now());
                        if removed > 0 {
                            debug!(removed, "expired connection entries");
                        }
                        std::thread::sleep(SWEEP_INTERVAL);
                    }
                })
                .expect("spawn expiry sweeper")
        };

        Self {
            workers,
            sweeper: Some(sweeper),
            stop,
        }
    }

    /// Joins all workers. The packet queue must already be closed so
    /// blocked reads unblock.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.join();
        }
        info!("packet workers stopped");
    }
}

fn worker_loop(datapath: &Datapath, queue: &dyn PacketQueue) {
    loop {
        let packet = match queue.recv() {
            Ok(packet) => packet,
            Err(QueueError::Closed) => {
                debug!("queue closed, worker exiting");
                return;
            },
            Err(err @ QueueError::Transient { .. }) => {
                warn!(%err, "queue read failed, retrying");
                std::thread::sleep(TRANSIENT_BACKOFF);
                continue;
            },
        };

        let verdict = datapath.process(packet.direction, packet.payload);
        if let Err(err) = queue.put_verdict(packet.id, verdict) {
            warn!(%err, id = packet.id, "failed to deliver verdict");
        }
    }
}
