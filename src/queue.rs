use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::request::PendingRequest;

/// FIFO of accepted `Execute` requests shared by the dispatcher's workers.
///
/// The lock only guards the `VecDeque` push/pop; waiting happens on
/// [`Notify`] after the guard has been dropped.
#[derive(Debug, Default)]
pub struct RequestQueue {
    pending: Mutex<VecDeque<PendingRequest>>,
    available: Notify,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the tail and wakes a single waiting worker.
    pub fn enqueue(&self, request: PendingRequest) {
        self.lock().push_back(request);
        self.available.notify_one();
    }

    /// Removes the head, waiting for one to arrive when the queue is empty.
    ///
    /// Returns `None` once `cancel` fires, even if requests are left.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<PendingRequest> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(request) = self.try_dequeue() {
                return Some(request);
            }

            // A permit stored by `notify_one` between the check above and this
            // wait completes `notified()` immediately.
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.available.notified() => (),
            }
        }
    }

    pub fn try_dequeue(&self) -> Option<PendingRequest> {
        let request = self.lock().pop_front();
        // Hand a leftover wakeup on to the next idle worker.
        if request.is_some() && !self.is_empty() {
            self.available.notify_one();
        }
        request
    }

    /// Takes every request that no worker has started yet.
    pub fn drain(&self) -> Vec<PendingRequest> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingRequest>> {
        // Guarded section is a single VecDeque call, a panic there leaves
        // the deque consistent.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, time::Duration};

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::RequestQueue;
    use crate::request::{JobSpec, PendingRequest};

    fn request(name: &str) -> PendingRequest {
        PendingRequest::new(JobSpec::new(vec![name.to_string()]))
    }

    #[tokio::test]
    async fn given_requests_enqueued_in_order_then_dequeued_in_same_order() {
        let queue = RequestQueue::new();
        let cancel = CancellationToken::new();
        for name in ["first", "second", "third"] {
            queue.enqueue(request(name));
        }

        for name in ["first", "second", "third"] {
            let next = queue.dequeue(&cancel).await.unwrap();
            assert_eq!(next.spec().executable(), Some(name));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn given_empty_queue_then_dequeue_waits_for_enqueue() {
        let queue = Arc::new(RequestQueue::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        queue.enqueue(request("late"));
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.spec().executable(), Some("late"));
    }

    #[tokio::test]
    async fn given_cancelled_token_then_every_waiter_returns_none() {
        let queue = Arc::new(RequestQueue::new());
        let cancel = CancellationToken::new();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { queue.dequeue(&cancel).await })
            })
            .collect();

        cancel.cancel();
        for waiter in waiters {
            let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
            assert!(got.is_none());
        }
    }

    #[tokio::test]
    async fn given_cancelled_token_then_pending_requests_stay_queued() {
        let queue = RequestQueue::new();
        let cancel = CancellationToken::new();
        queue.enqueue(request("left"));

        cancel.cancel();
        assert!(queue.dequeue(&cancel).await.is_none());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn given_concurrent_workers_then_no_request_is_delivered_twice() {
        let queue = Arc::new(RequestQueue::new());
        let cancel = CancellationToken::new();
        let total = 200;

        let workers: Vec<_> = (0..5)
            .map(|_| {
                let queue = queue.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(req) = queue.dequeue(&cancel).await {
                        seen.push(*req.id());
                    }
                    seen
                })
            })
            .collect();

        let mut sent = HashSet::new();
        for i in 0..total {
            let req = request(&i.to_string());
            sent.insert(*req.id());
            queue.enqueue(req);
        }

        while !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let mut received: Vec<Uuid> = Vec::new();
        for worker in workers {
            received.extend(worker.await.unwrap());
        }
        assert_eq!(received.len(), total);
        assert_eq!(received.into_iter().collect::<HashSet<_>>(), sent);
    }

    #[test]
    fn given_pending_requests_then_drain_empties_queue() {
        let queue = RequestQueue::new();
        queue.enqueue(request("a"));
        queue.enqueue(request("b"));

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].spec().executable(), Some("a"));
        assert_eq!(queue.len(), 0);
        assert!(queue.try_dequeue().is_none());
    }
}
