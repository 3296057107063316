//! Event bus for broadcasting accepted detections

use crate::db::StoredDetection;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<StoredDetection>>,
}

impl EventBus {
    pub fn new(sender: broadcast::Sender<Arc<StoredDetection>>) -> Self {
        Self { sender }
    }

    pub fn publish(&self, detection: StoredDetection) {
        let _ = self.sender.send(Arc::new(detection));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StoredDetection>> {
        self.sender.subscribe()
    }
}
