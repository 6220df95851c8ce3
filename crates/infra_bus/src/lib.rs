use tokio::sync::broadcast;

/// Lossy fan-out bus. Publishing never blocks; slow subscribers lag and skip.
#[derive(Clone)]
pub struct EventBus<T: Clone + Send + Sync + 'static> {
    tx: broadcast::Sender<T>,
    name: &'static str,
}

impl<T: Clone + Send + Sync + 'static> EventBus<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx, name }
    }

    /// Returns false when nobody is listening. That is not an error for a
    /// notification bus, so callers usually ignore it.
    pub fn publish(&self, event: T) -> bool {
        match self.tx.send(event) {
            Ok(_) => true,
            Err(_) => {
                metrics::counter!("bus.publish_unobserved", "bus" => self.name).increment(1);
                false
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
