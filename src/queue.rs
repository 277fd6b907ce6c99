/// Bounded FIFO Queue
///
/// Concurrent queue used for per-subscription backpressure isolation:
/// - producers write to an unbounded input and never block
/// - a background mover drains the input into an internal list
/// - consumers read a bounded output channel in strict FIFO order
///
/// No single slow subscriber can stall the notifier's core loop; the
/// worst case is memory growth inside that subscriber's own queue.
///
/// Also home to the event channel pair used for per-notification
/// delivery: a bounded channel whose receiver half stays reachable from
/// the producer side so reorg handling can drain stale items without
/// blocking.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::errors::NotifierError;

/// Unbounded-in, bounded-out FIFO channel with a background mover.
pub struct ConcurrentQueue<T> {
    in_tx: mpsc::UnboundedSender<T>,
    stop: CancellationToken,
    mover: std::sync::Mutex<Option<JoinHandle<()>>>,
    pending: std::sync::Mutex<Option<(mpsc::UnboundedReceiver<T>, mpsc::Sender<T>)>>,
}

impl<T: Send + 'static> ConcurrentQueue<T> {
    /// Create a queue whose output channel holds at most `out_capacity`
    /// items. The returned receiver is the consumer's end; it closes when
    /// the queue is stopped.
    pub fn new(out_capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(out_capacity);

        let queue = Self {
            in_tx,
            stop: CancellationToken::new(),
            mover: std::sync::Mutex::new(None),
            pending: std::sync::Mutex::new(Some((in_rx, out_tx))),
        };
        (queue, out_rx)
    }

    /// Spawn the background mover. Idempotent; later calls are no-ops.
    pub fn start(&self) {
        let taken = self.pending.lock().expect("queue pending lock").take();
        let Some((in_rx, out_tx)) = taken else {
            return;
        };
        let stop = self.stop.clone();
        let handle = tokio::spawn(run_mover(in_rx, out_tx, stop));
        *self.mover.lock().expect("queue mover lock") = Some(handle);
    }

    /// Enqueue an item. Never blocks; items sent after stop are dropped.
    pub fn send(&self, item: T) {
        let _ = self.in_tx.send(item);
    }

    /// Producer handle usable from callbacks without borrowing the queue.
    pub fn sender(&self) -> mpsc::UnboundedSender<T> {
        self.in_tx.clone()
    }

    /// Stop the mover, flush what still fits into the output buffer, and
    /// close the output channel.
    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self.mover.lock().expect("queue mover lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_mover<T: Send + 'static>(
    mut in_rx: mpsc::UnboundedReceiver<T>,
    out_tx: mpsc::Sender<T>,
    stop: CancellationToken,
) {
    let mut backlog: VecDeque<T> = VecDeque::new();
    let mut in_open = true;

    loop {
        if backlog.is_empty() {
            if !in_open {
                break;
            }
            tokio::select! {
                _ = stop.cancelled() => break,
                item = in_rx.recv() => match item {
                    Some(item) => backlog.push_back(item),
                    None => in_open = false,
                },
            }
        } else {
            tokio::select! {
                _ = stop.cancelled() => break,
                item = in_rx.recv(), if in_open => match item {
                    Some(item) => backlog.push_back(item),
                    None => in_open = false,
                },
                permit = out_tx.reserve() => match permit {
                    Ok(permit) => {
                        if let Some(item) = backlog.pop_front() {
                            permit.send(item);
                        }
                    }
                    // Consumer dropped its receiver; nothing left to do.
                    Err(_) => return,
                },
            }
        }
    }

    // Pull anything that was still sitting on the input at stop time,
    // then flush whatever fits without waiting on the consumer.
    while let Ok(item) = in_rx.try_recv() {
        backlog.push_back(item);
    }
    let mut flushed = 0usize;
    while let Some(item) = backlog.pop_front() {
        if out_tx.try_send(item).is_err() {
            break;
        }
        flushed += 1;
    }
    trace!(flushed, remaining = backlog.len(), "queue mover exiting");
}

/// Bounded event channel whose receiver stays reachable from the sender
/// side. This is what lets `disconnect_tip` drain a stale confirmation
/// count or a superseded `Confirmed` value without blocking: the drain is
/// a `try_lock` + `try_recv`, and a subscriber currently blocked in
/// `recv` simply wins the race.
pub fn event_channel<T>(capacity: usize) -> (EventSender<T>, EventReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let shared = Arc::new(Mutex::new(rx));
    (
        EventSender {
            tx,
            rx: shared.clone(),
        },
        EventReceiver { rx: shared },
    )
}

pub struct EventSender<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> EventSender<T> {
    /// Send guarded by the shutdown signal. Returns `Exiting` if the
    /// notifier shuts down while the send is parked on a full buffer.
    pub async fn send(&self, item: T, quit: &CancellationToken) -> Result<(), NotifierError> {
        tokio::select! {
            biased;
            _ = quit.cancelled() => Err(NotifierError::Exiting),
            res = self.tx.send(item) => {
                // The receiver half is kept alive through the shared Arc,
                // so the channel cannot close underneath us.
                debug_assert!(res.is_ok());
                Ok(())
            }
        }
    }

    /// Best-effort removal of one pending item from the producer side.
    pub fn try_drain(&self) -> Option<T> {
        match self.rx.try_lock() {
            Ok(mut rx) => rx.try_recv().ok(),
            Err(_) => None,
        }
    }
}

/// Subscriber half of an [`event_channel`]. `recv` returning `None`
/// signifies cancellation or shutdown; receivers must tolerate it.
pub struct EventReceiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> EventReceiver<T> {
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_queue_preserves_fifo_order() {
        let (queue, mut out) = ConcurrentQueue::new(4);
        queue.start();

        for i in 0..100u32 {
            queue.send(i);
        }

        for expected in 0..100u32 {
            assert_eq!(out.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_producer_never_blocks_on_slow_consumer() {
        let (queue, mut out) = ConcurrentQueue::new(1);
        queue.start();

        // Output capacity is 1 and nobody is reading yet; all sends must
        // still return immediately.
        for i in 0..1000u32 {
            queue.send(i);
        }

        // A late consumer still sees everything, in order.
        tokio::time::sleep(Duration::from_millis(20)).await;
        for expected in 0..1000u32 {
            assert_eq!(out.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_stop_closes_output() {
        let (queue, mut out) = ConcurrentQueue::new(4);
        queue.start();
        queue.send(1u32);
        queue.stop().await;

        // The buffered item is flushed, then the channel closes.
        assert_eq!(out.recv().await, Some(1));
        assert_eq!(out.recv().await, None);
    }

    #[tokio::test]
    async fn test_event_channel_producer_drain() {
        let quit = CancellationToken::new();
        let (tx, rx) = event_channel::<u32>(2);

        tx.send(7, &quit).await.unwrap();
        tx.send(8, &quit).await.unwrap();

        // Producer-side drain removes the oldest pending item.
        assert_eq!(tx.try_drain(), Some(7));
        assert_eq!(rx.recv().await, Some(8));
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_event_channel_send_aborts_on_shutdown() {
        let quit = CancellationToken::new();
        let (tx, _rx) = event_channel::<u32>(1);

        tx.send(1, &quit).await.unwrap();

        // Buffer full and nobody reading: a shutdown must unblock the send.
        let quit_clone = quit.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            quit_clone.cancel();
        });
        assert_eq!(tx.send(2, &quit).await, Err(NotifierError::Exiting));
    }

    #[tokio::test]
    async fn test_event_channel_closes_when_sender_dropped() {
        let quit = CancellationToken::new();
        let (tx, rx) = event_channel::<u32>(1);
        tx.send(5, &quit).await.unwrap();
        drop(tx);

        assert_eq!(rx.recv().await, Some(5));
        assert_eq!(rx.recv().await, None);
    }
}
