use crate::Lease;
use gateway_controller_core::QueueOrder;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    sync::oneshot,
    time::{self, Instant},
};

/// The permit accounting of a single partition.
pub(crate) trait Algorithm: Send + 'static {
    /// Whether a lease returns its permit when it is dropped.
    const RELEASE_ON_DROP: bool;

    /// Returns permits that have become available since the last call.
    fn replenish(&mut self, now: Instant);

    fn try_acquire(&mut self) -> bool;

    /// Returns one permit.
    fn release(&mut self);

    /// When queued requests should next check for replenished permits, if ever.
    fn next_replenish(&self) -> Option<Instant>;

    /// How long until a permit can be acquired, if that can be known.
    fn retry_after(&self, now: Instant) -> Option<Duration>;

    /// Whether every permit is available.
    fn is_full(&self) -> bool;
}

/// Returns a permit to the limiter that issued it.
pub(crate) trait Release: Send + Sync {
    fn release(self: Arc<Self>);
}

/// Admits requests through an [`Algorithm`], holding at most `queue_limit` requests while they
/// wait for a permit.
///
/// Waiters are granted leases through a oneshot. A lease sent to a waiter that has gone away is
/// dropped along with the channel, which returns its permit.
#[derive(Debug)]
pub(crate) struct Limiter<A> {
    queue_limit: usize,
    order: QueueOrder,
    state: Mutex<State<A>>,
}

#[derive(Debug)]
struct State<A> {
    algorithm: A,

    /// Newest waiters at the back.
    queue: VecDeque<oneshot::Sender<Lease>>,
}

// === impl Limiter ===

impl<A: Algorithm> Limiter<A> {
    pub(crate) fn new(algorithm: A, queue_limit: u32, order: QueueOrder) -> Arc<Self> {
        Arc::new(Self {
            queue_limit: queue_limit as usize,
            order,
            state: Mutex::new(State {
                algorithm,
                queue: VecDeque::new(),
            }),
        })
    }

    /// Acquires a lease, waiting in the queue if permits are exhausted and there is room.
    ///
    /// Fails with a retry hint when the request is rejected, either immediately or because it was
    /// evicted from the queue by a newer request.
    pub(crate) async fn acquire(self: Arc<Self>) -> Result<Lease, Option<Duration>> {
        let rx = {
            let mut state = self.state.lock();
            let now = Instant::now();
            state.queue.retain(|tx| !tx.is_closed());
            state.algorithm.replenish(now);
            self.drain(&mut state);

            if state.queue.is_empty() && state.algorithm.try_acquire() {
                return Ok(self.lease());
            }

            if state.queue.len() >= self.queue_limit {
                if self.queue_limit == 0 || self.order == QueueOrder::OldestFirst {
                    return Err(state.algorithm.retry_after(now));
                }
                // Dropping the oldest waiter's sender rejects it.
                state.queue.pop_front();
            }

            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            rx
        };

        self.wait(rx).await
    }

    async fn wait(
        self: Arc<Self>,
        mut rx: oneshot::Receiver<Lease>,
    ) -> Result<Lease, Option<Duration>> {
        loop {
            let next = self.state.lock().algorithm.next_replenish();
            let replenished = async move {
                match next {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                granted = &mut rx => {
                    return granted.map_err(|_| {
                        self.state.lock().algorithm.retry_after(Instant::now())
                    });
                }

                () = replenished => {
                    let mut state = self.state.lock();
                    state.algorithm.replenish(Instant::now());
                    self.drain(&mut state);
                }
            }
        }
    }

    /// Grants leases to queued waiters while permits remain.
    fn drain(self: &Arc<Self>, state: &mut State<A>) {
        loop {
            let waiter = match self.order {
                QueueOrder::OldestFirst => state.queue.pop_front(),
                QueueOrder::NewestFirst => state.queue.pop_back(),
            };
            let Some(tx) = waiter else {
                return;
            };
            if tx.is_closed() {
                continue;
            }

            if !state.algorithm.try_acquire() {
                match self.order {
                    QueueOrder::OldestFirst => state.queue.push_front(tx),
                    QueueOrder::NewestFirst => state.queue.push_back(tx),
                }
                return;
            }

            if let Err(mut lease) = tx.send(self.lease()) {
                // The waiter went away; the permit is returned here since the state is already
                // locked.
                lease.disarm();
                state.algorithm.release();
            }
        }
    }

    fn lease(self: &Arc<Self>) -> Lease {
        if A::RELEASE_ON_DROP {
            Lease::releasing(self.clone())
        } else {
            Lease::default()
        }
    }

    /// Indicates whether the limiter holds no state worth keeping: every permit is available and
    /// nothing is waiting.
    pub(crate) fn is_idle(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.queue.retain(|tx| !tx.is_closed());
        state.algorithm.replenish(now);
        state.queue.is_empty() && state.algorithm.is_full()
    }
}

impl<A: Algorithm> Release for Limiter<A> {
    fn release(self: Arc<Self>) {
        let mut state = self.state.lock();
        state.algorithm.release();
        self.drain(&mut state);
    }
}
