use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

/// Where the shell should go next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Connected; the address has already been committed.
    Main,
    Onboarding { error_message: Option<String> },
    RetryWait { retry_after: Option<Duration> },
}

/// Fire-and-forget page transitions.
pub trait Navigator: Send + Sync {
    fn navigate(&self, destination: Destination);
}

#[derive(Debug, Clone)]
pub struct ChannelNavigator {
    tx: mpsc::UnboundedSender<Destination>,
}

impl ChannelNavigator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Destination>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Navigator for ChannelNavigator {
    fn navigate(&self, destination: Destination) {
        info!(?destination, "navigating");
        if self.tx.send(destination).is_err() {
            warn!("navigation receiver dropped");
        }
    }
}
