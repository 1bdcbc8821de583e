//! UI marshaling gateway. Workers never touch front-end state; they queue events here and the
//! front end drains them on its own task.

use lanchat_core::Event;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Gateway {
    tx: mpsc::UnboundedSender<Event>,
}

impl Gateway {
    /// New gateway and the receiving end the front end consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue `event` for the front end. Dropped if nobody is listening any more.
    pub fn emit(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            debug!(event = ?e.0, "front end gone, event dropped");
        }
    }

    pub fn notice(&self, text: impl Into<String>) {
        self.emit(Event::Notice(text.into()));
    }
}
