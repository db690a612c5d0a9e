use tokio::sync::watch;

/// One-shot "transport closed" flag that pending receivers can await.
#[derive(Debug)]
pub(crate) struct CloseSignal(watch::Sender<bool>);

impl CloseSignal {
    pub(crate) fn new() -> Self {
        Self(watch::channel(false).0)
    }

    /// Returns `true` the first time it is called.
    pub(crate) fn close(&self) -> bool {
        !self.0.send_replace(true)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once `close()` has been called.
    pub(crate) async fn closed(&self) {
        let mut rx = self.0.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                return;
            }
        }
    }
}
