use std::sync::Arc;

use log::{error, info};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    queue::RequestQueue,
    runner::{JobExecutor, RunOutcome},
    TIME_FORMAT,
};

/// Fixed pool of workers draining the request queue.
#[derive(Debug)]
pub struct Dispatcher {
    workers: JoinSet<()>,
}

impl Dispatcher {
    pub fn start<E: JobExecutor>(
        size: usize,
        queue: Arc<RequestQueue>,
        executor: Arc<E>,
        cancel: CancellationToken,
    ) -> Self {
        let mut workers = JoinSet::new();
        for worker in 0..size.max(1) {
            workers.spawn(work(worker, queue.clone(), executor.clone(), cancel.clone()));
        }

        Self { workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every worker to observe cancellation and return.
    pub async fn join(mut self) {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(err) = joined {
                error!("worker stopped abnormally: {}", err);
            }
        }
    }
}

async fn work<E: JobExecutor>(
    worker: usize,
    queue: Arc<RequestQueue>,
    executor: Arc<E>,
    cancel: CancellationToken,
) {
    while let Some(request) = queue.dequeue(&cancel).await {
        let id = *request.id();
        info!(
            "worker {} picked up job {} (queued at {})",
            worker,
            id,
            request.received().format(TIME_FORMAT)
        );

        match executor.execute(request, cancel.clone()).await {
            Ok(RunOutcome::Completed { job_pid, supervisor, .. }) => {
                info!("job {} (pid {}) done, supervisor {}", id, job_pid, supervisor)
            }
            Ok(RunOutcome::Skipped { reason, .. }) => info!("job {} skipped: {:?}", id, reason),
            Ok(RunOutcome::Cancelled { .. }) => info!("job {} abandoned on shutdown", id),
            Err(err) => error!("job {} failed: {}", id, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use tokio_util::sync::CancellationToken;

    use super::Dispatcher;
    use crate::{
        job::JobStatus,
        queue::RequestQueue,
        request::{JobSpec, PendingRequest},
        runner::{Error, JobExecutor, RunOutcome},
    };

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl JobExecutor for Recorder {
        fn execute(
            &self,
            request: PendingRequest,
            _cancel: CancellationToken,
        ) -> impl Future<Output = Result<RunOutcome, Error>> + Send {
            let name = request.spec().executable().unwrap_or_default().to_owned();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.seen.lock().unwrap().push(name.clone());
                if name == "broken" {
                    return Err(Error::IOError(std::io::ErrorKind::NotFound.into()));
                }
                Ok(RunOutcome::Completed { supervisor: JobStatus::Exit(0), job_pid: 1, samples: 0 })
            }
        }
    }

    fn request(name: &str) -> PendingRequest {
        PendingRequest::new(JobSpec::new(vec![name.to_string()]))
    }

    async fn wait_for(recorder: &Recorder, count: usize) {
        for _ in 0..200 {
            if recorder.seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("executor saw fewer than {} jobs", count);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn given_requests_then_every_one_is_executed() {
        let queue = Arc::new(RequestQueue::new());
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::start(3, queue.clone(), recorder.clone(), cancel.clone());
        assert_eq!(dispatcher.size(), 3);

        for i in 0..10 {
            queue.enqueue(request(&i.to_string()));
        }
        wait_for(&recorder, 10).await;

        cancel.cancel();
        dispatcher.join().await;
        let mut seen = recorder.seen.lock().unwrap().clone();
        seen.sort_by_key(|s| s.parse::<u32>().unwrap());
        assert_eq!(seen, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn given_single_worker_then_jobs_run_in_submission_order() {
        let queue = Arc::new(RequestQueue::new());
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        for name in ["a", "b", "c"] {
            queue.enqueue(request(name));
        }

        let dispatcher = Dispatcher::start(1, queue, recorder.clone(), cancel.clone());
        wait_for(&recorder, 3).await;
        cancel.cancel();
        dispatcher.join().await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn given_failing_job_then_worker_keeps_going() {
        let queue = Arc::new(RequestQueue::new());
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::start(1, queue.clone(), recorder.clone(), cancel.clone());

        queue.enqueue(request("broken"));
        queue.enqueue(request("fine"));
        wait_for(&recorder, 2).await;

        cancel.cancel();
        dispatcher.join().await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["broken", "fine"]);
    }

    #[tokio::test]
    async fn given_idle_workers_then_cancel_stops_them() {
        let queue = Arc::new(RequestQueue::new());
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::start(4, queue, Arc::new(Recorder::default()), cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), dispatcher.join()).await.unwrap();
    }
}
