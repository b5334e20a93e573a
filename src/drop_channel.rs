use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

/// Bounded queue connecting a producer to a single consumer task. When the queue is
/// full, `push` discards the oldest entry, so a slow consumer never blocks the socket
/// reader or the sending application thread.
pub(crate) struct DropChannel<T> {
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> DropChannel<T> {
    pub fn new(capacity: usize) -> DropChannel<T> {
        DropChannel {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, item: T) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.len() == self.capacity {
                debug!("queue full, dropping oldest entry");
                inner.pop_front();
            }
            inner.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Waits for the next entry. Cancel safe: aborting the returned future never loses
    /// a queued entry.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.notify.notified();

            if let Some(item) = self.inner.lock().unwrap().pop_front() {
                return item;
            }

            notified.await;
        }
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_push_pop_in_order() {
        let channel = DropChannel::new(5);

        channel.push(1);
        channel.push(2);
        channel.push(3);

        assert_eq!(channel.pop().await, 1);
        assert_eq!(channel.pop().await, 2);
        assert_eq!(channel.pop().await, 3);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let channel = DropChannel::new(3);

        for i in 0..5 {
            channel.push(i);
        }

        assert_eq!(channel.len(), 3);
        assert_eq!(channel.pop().await, 2);
        assert_eq!(channel.pop().await, 3);
        assert_eq!(channel.pop().await, 4);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let channel = std::sync::Arc::new(DropChannel::new(3));

        let consumer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.push(42);

        let received = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should be woken")
            .unwrap();
        assert_eq!(received, 42);
    }

    #[tokio::test]
    async fn test_cancelled_pop_loses_nothing() {
        let channel = DropChannel::new(3);

        {
            let pop = channel.pop();
            tokio::pin!(pop);
            let timeout = tokio::time::timeout(Duration::from_millis(10), &mut pop).await;
            assert!(timeout.is_err());
        }

        channel.push(7);
        assert_eq!(channel.pop().await, 7);
    }

    #[tokio::test]
    async fn test_clear() {
        let channel = DropChannel::new(3);
        channel.push(1);
        channel.push(2);

        channel.clear();
        assert_eq!(channel.len(), 0);
    }
}
