use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

/// Producer half of a latest-wins relay.
///
/// Holds a receiver clone of its own slot so a stale item can be evicted
/// without waiting for the consumer.
#[derive(Debug)]
pub struct RelayPublisher<T> {
    tx: Sender<T>,
    evict: Receiver<T>,
}

/// Consumer half of a latest-wins relay.
#[derive(Debug)]
pub struct RelayConsumer<T> {
    rx: Receiver<T>,
}

/// Builds a single-slot relay where a new item replaces any pending one.
pub fn relay<T>() -> (RelayPublisher<T>, RelayConsumer<T>) {
    let (tx, rx) = bounded(1);
    (
        RelayPublisher {
            tx,
            evict: rx.clone(),
        },
        RelayConsumer { rx },
    )
}

impl<T> RelayPublisher<T> {
    /// Stores `item` as the pending one, evicting anything older. Never
    /// blocks and never refuses the new item.
    pub fn publish(&self, item: T) {
        let mut item = item;
        loop {
            // `evict` keeps the channel connected, so only `Full` can fail
            match self.tx.try_send(item) {
                Err(TrySendError::Full(back)) => {
                    // the consumer may have taken it already; either way retry
                    let _ = self.evict.try_recv();
                    item = back;
                }
                _ => return,
            }
        }
    }
}

impl<T> RelayConsumer<T> {
    /// Takes the pending item, if any. Never blocks.
    pub fn try_consume(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}
