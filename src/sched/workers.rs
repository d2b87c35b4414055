// src/sched/workers.rs

use std::sync::atomic::Ordering;

use crossbeam_channel::{Receiver, Sender};

use super::types::{BuildDone, BuildJob};

/// Spawns the voxelization worker pool. Each worker owns its job's
/// triangle buffers and output tiles outright; the only shared state is
/// the cancel token and the channels.
pub(crate) fn spawn_workers(count: usize, rx_job: Receiver<BuildJob>, tx_done: Sender<BuildDone>) {
    for worker_idx in 0..count {
        let rx_job = rx_job.clone();
        let tx_done = tx_done.clone();

        std::thread::Builder::new()
            .name(format!("svo-nav-build-{worker_idx}"))
            .spawn(move || {
                while let Ok(mut job) = rx_job.recv() {
                    if job.cancel.load(Ordering::Relaxed) {
                        let _ = tx_done.send(BuildDone {
                            generator: job.generator,
                            canceled: true,
                        });
                        continue;
                    }

                    job.generator.do_work(&job.cancel);

                    let canceled = job.cancel.load(Ordering::Relaxed);
                    let _ = tx_done.send(BuildDone {
                        generator: job.generator,
                        canceled,
                    });
                }
            })
            .expect("spawn build worker");
    }
}
