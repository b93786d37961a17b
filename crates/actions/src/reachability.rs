use tokio::sync::watch;

/// Whether the companion link can carry a message right now.
pub trait ReachabilityGateway: Send + Sync {
    fn is_immediately_reachable(&self) -> bool;
}

/// Reachability flipped by whoever owns the companion connection.
#[derive(Debug)]
pub struct LinkReachability {
    tx: watch::Sender<bool>,
}

impl Default for LinkReachability {
    fn default() -> Self {
        Self::new(false)
    }
}

impl LinkReachability {
    pub fn new(reachable: bool) -> Self {
        let (tx, _rx) = watch::channel(reachable);
        Self { tx }
    }

    pub fn set(&self, reachable: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != reachable;
            *current = reachable;
            changed
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl ReachabilityGateway for LinkReachability {
    fn is_immediately_reachable(&self) -> bool {
        *self.tx.borrow()
    }
}
