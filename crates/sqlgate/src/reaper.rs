//! Background sweep evicting idle sessions and engine pool entries.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::manager::SessionManager;

#[derive(Debug)]
enum ReaperMessage {
    Sweep,
    Close,
}

/// Drives periodic sweeps over a [`SessionManager`].
///
/// A ticker task feeds `Sweep` messages into a listener at the configured
/// interval; the listener holds only a weak reference to the manager so a
/// dropped manager shuts the loop down on its own.
pub(crate) struct Reaper {
    sender: mpsc::UnboundedSender<ReaperMessage>,
    listen: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Reaper {
    pub fn start(manager: Weak<SessionManager>, interval: Duration) -> Reaper {
        let (sender, receiver) = mpsc::unbounded_channel();

        let sender_clone = sender.clone();
        tokio::spawn(async move {
            let sender = sender_clone;
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it so a sweep
            // doesn't race the session open that started us.
            ticker.tick().await;
            loop {
                let _ = ticker.tick().await;
                if sender.send(ReaperMessage::Sweep).is_err() {
                    debug!("exiting reaper ticker");
                    return;
                }
            }
        });

        let listen = tokio::spawn(Self::listen(manager, receiver));
        Reaper {
            sender,
            listen: Arc::new(Mutex::new(Some(listen))),
        }
    }

    async fn listen(
        manager: Weak<SessionManager>,
        mut receiver: mpsc::UnboundedReceiver<ReaperMessage>,
    ) {
        while let Some(msg) = receiver.recv().await {
            match msg {
                ReaperMessage::Sweep => match manager.upgrade() {
                    Some(manager) => manager.sweep().await,
                    None => break,
                },
                ReaperMessage::Close => {
                    receiver.close();
                    break;
                }
            }
        }
        debug!("reaper listener exited");
    }

    /// Stop sweeping and wait for the listener to exit.
    pub async fn close(&self) {
        let _ = self.sender.send(ReaperMessage::Close);
        let handle = self.listen.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
