//! Listener registration over broadcast event streams.
//!
//! Every listener runs on its own task and is owned by the [`Subscription`]
//! returned at registration; detaching (or dropping) the handle stops delivery.
//!
//! Event streams are bounded. A listener that falls more than the channel
//! capacity behind loses the oldest events; the loss is logged and counted in
//! [`Subscription::dropped_events`].

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::{sync::broadcast, task::JoinHandle};

#[must_use = "dropping a Subscription detaches the listener"]
pub struct Subscription {
    name: &'static str,
    task: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Events this listener never saw because it lagged behind the stream.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_attached(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn detach(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::trace!(subscription = self.name, "listener detached");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("attached", &self.is_attached())
            .field("dropped", &self.dropped_events())
            .finish()
    }
}

/// Delivers every event from `rx` to `handler`, in order, until detached or
/// the sender side is gone.
pub fn listen<E, F>(name: &'static str, rx: broadcast::Receiver<E>, mut handler: F) -> Subscription
where
    E: Clone + Send + 'static,
    F: FnMut(E) + Send + 'static,
{
    listen_async(name, rx, move |event| {
        handler(event);
        std::future::ready(())
    })
}

/// Like [`listen`], but awaits the handler before taking the next event.
pub fn listen_async<E, F, Fut>(
    name: &'static str,
    mut rx: broadcast::Receiver<E>,
    mut handler: F,
) -> Subscription
where
    E: Clone + Send + 'static,
    F: FnMut(E) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let dropped = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&dropped);
    let task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => handler(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let total = counter.fetch_add(skipped, Ordering::Relaxed) + skipped;
                    tracing::warn!(
                        subscription = name,
                        skipped,
                        total,
                        "listener lagged; events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    Subscription {
        name,
        task: Some(task),
        dropped,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn delivers_in_order_until_detached() {
        let (tx, rx) = broadcast::channel(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = listen("test", rx, move |n: u32| sink.lock().expect("lock").push(n));

        for n in 0..5 {
            tx.send(n).expect("send");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().expect("lock"), vec![0, 1, 2, 3, 4]);

        subscription.detach();
        tokio::task::yield_now().await;
        let _ = tx.send(99);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!seen.lock().expect("lock").contains(&99));
    }

    #[tokio::test]
    async fn finishes_when_sender_is_dropped() {
        let (tx, rx) = broadcast::channel::<u32>(4);
        let subscription = listen("closing", rx, |_| {});
        drop(tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!subscription.is_attached());
    }

    #[tokio::test]
    async fn lagging_listener_counts_dropped_events() {
        let (tx, rx) = broadcast::channel(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = listen("slow", rx, move |n: u32| sink.lock().expect("lock").push(n));

        // The listener task has not run yet, so only the newest two survive.
        for n in 0..5 {
            tx.send(n).expect("send");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().expect("lock"), vec![3, 4]);
        assert_eq!(subscription.dropped_events(), 3);
        assert!(subscription.is_attached());
    }
}
