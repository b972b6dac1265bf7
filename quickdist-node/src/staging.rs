use crossbeam_channel::{bounded, Receiver, Sender};

type Job = Box<dyn FnOnce() + Send>;

/// A fixed-size pool of threads dedicated to staging files between tiers,
/// kept separate from the process pool that runs the actual script so a
/// slow copy never delays an in-flight compute call on another slot.
///
/// Worker threads loop for the lifetime of the process; the pool is meant
/// to be created once per node and live as long as it does.
pub struct StagingPool {
    tx: Sender<Job>,
}

impl StagingPool {
    pub fn new(threads: usize) -> StagingPool {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = bounded(threads.max(1) * 8);
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("quickdist-staging-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn staging thread");
        }
        StagingPool { tx }
    }

    /// Runs `jobs` across the pool and returns their results in the same
    /// order, blocking until every job has finished.
    pub fn run_all<T, F>(&self, jobs: Vec<F>) -> Vec<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let n = jobs.len();
        let (result_tx, result_rx) = bounded(n);
        for (index, job) in jobs.into_iter().enumerate() {
            let result_tx = result_tx.clone();
            let sent = self.tx.send(Box::new(move || {
                let value = job();
                result_tx.send((index, value)).ok();
            }) as Job);
            sent.expect("staging pool channel closed while pool is alive");
        }
        drop(result_tx);

        let mut slots: Vec<Option<T>> = (0..n).map(|_| None).collect();
        for _ in 0..n {
            let (index, value) = result_rx.recv().expect("staging worker dropped a job");
            slots[index] = Some(value);
        }
        slots.into_iter().map(|v| v.expect("every slot filled")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn run_all_preserves_submission_order() {
        let pool = StagingPool::new(4);
        let jobs: Vec<_> = (0..20)
            .map(|i| {
                move || {
                    // stagger completion so results arrive out of order if
                    // the pool didn't reassemble them by index
                    std::thread::sleep(Duration::from_millis((20 - i) % 5));
                    i
                }
            })
            .collect();
        let results = pool.run_all(jobs);
        assert_eq!(results, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn run_all_on_an_empty_batch_returns_empty() {
        let pool = StagingPool::new(2);
        let jobs: Vec<Box<dyn FnOnce() -> i32 + Send>> = Vec::new();
        let results = pool.run_all(jobs);
        assert!(results.is_empty());
    }
}
