//! Per-entity notification fan-out.
//!
//! Every entity that produces notifications (sockets, servers, messages) owns an
//! [`Emitter`]. Consumers register either a persistent subscription (an
//! unbounded channel receiving every event) or a fire-once subscription (a
//! oneshot that is deregistered after its first delivery).
//!
//! # Design Decisions
//! - Delivery is a non-blocking channel send, so emitting from inside a
//!   consumer's own handling code can never deadlock or re-enter
//! - Dropped receivers are pruned lazily on the next emit
//! - Events are cloned per subscriber; payloads are cheap handles

use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};

type Filter<E> = Box<dyn Fn(&E) -> bool + Send>;

enum Subscriber<E> {
    Persistent(mpsc::UnboundedSender<E>),
    Once {
        filter: Option<Filter<E>>,
        tx: oneshot::Sender<E>,
    },
}

/// Registry of subscribers for one entity.
pub struct Emitter<E> {
    subscribers: Mutex<Vec<Subscriber<E>>>,
}

impl<E: Clone + Send + 'static> Emitter<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a persistent subscription receiving every subsequent event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(Subscriber::Persistent(tx));
        rx
    }

    /// Register a subscription that receives only the next event.
    pub fn once(&self) -> oneshot::Receiver<E> {
        let (tx, rx) = oneshot::channel();
        self.lock().push(Subscriber::Once { filter: None, tx });
        rx
    }

    /// Register a subscription that receives the next event matching `filter`.
    pub fn once_where<F>(&self, filter: F) -> oneshot::Receiver<E>
    where
        F: Fn(&E) -> bool + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.lock().push(Subscriber::Once {
            filter: Some(Box::new(filter)),
            tx,
        });
        rx
    }

    /// Deliver `event` to every live subscriber.
    ///
    /// Returns `true` if at least one subscriber received it.
    pub fn emit(&self, event: E) -> bool {
        let mut subscribers = self.lock();
        let mut delivered = false;
        let mut kept = Vec::with_capacity(subscribers.len());

        for subscriber in subscribers.drain(..) {
            match subscriber {
                Subscriber::Persistent(tx) => {
                    if tx.send(event.clone()).is_ok() {
                        delivered = true;
                        kept.push(Subscriber::Persistent(tx));
                    }
                }
                Subscriber::Once { filter, tx } => {
                    if tx.is_closed() {
                        continue;
                    }
                    let matches = filter.as_ref().map_or(true, |f| f(&event));
                    if matches {
                        delivered |= tx.send(event.clone()).is_ok();
                    } else {
                        kept.push(Subscriber::Once { filter, tx });
                    }
                }
            }
        }

        *subscribers = kept;
        delivered
    }

    /// Number of registered subscribers that have not been dropped.
    pub fn listener_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|s| match s {
                Subscriber::Persistent(tx) => !tx.is_closed(),
                Subscriber::Once { tx, .. } => !tx.is_closed(),
            })
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber<E>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: Clone + Send + 'static> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Ping {
        A,
        B,
    }

    #[test]
    fn persistent_receives_everything_in_order() {
        let emitter = Emitter::new();
        let mut rx = emitter.subscribe();

        assert!(emitter.emit(Ping::A));
        assert!(emitter.emit(Ping::B));

        assert_eq!(rx.try_recv().unwrap(), Ping::A);
        assert_eq!(rx.try_recv().unwrap(), Ping::B);
    }

    #[test]
    fn once_is_deregistered_after_first_delivery() {
        let emitter = Emitter::new();
        let mut rx = emitter.once();
        assert_eq!(emitter.listener_count(), 1);

        emitter.emit(Ping::A);
        assert_eq!(emitter.listener_count(), 0);
        assert_eq!(rx.try_recv().unwrap(), Ping::A);

        assert!(!emitter.emit(Ping::B));
    }

    #[test]
    fn once_where_skips_non_matching_events() {
        let emitter = Emitter::new();
        let mut rx = emitter.once_where(|p| *p == Ping::B);

        emitter.emit(Ping::A);
        assert!(rx.try_recv().is_err());

        emitter.emit(Ping::B);
        assert_eq!(rx.try_recv().unwrap(), Ping::B);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let emitter = Emitter::new();
        let rx = emitter.subscribe();
        drop(rx);

        assert!(!emitter.emit(Ping::A));
        assert_eq!(emitter.listener_count(), 0);
    }
}
