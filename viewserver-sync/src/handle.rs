//! Channel-backed subscriber handle.
//!
//! The connection task owns the receiving end and forwards payloads to the
//! socket; the core only ever sees [`ChannelHandle`] through
//! [`SubscriberHandle`]. Sends never wait: a full buffer means the peer is
//! not keeping up, and it is dropped rather than stalling fan-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::TransportError;
use crate::protocol::Payload;
use crate::subscription::{HandleId, SubscriberHandle};

#[derive(Debug)]
pub struct ChannelHandle {
    id: HandleId,
    tx: mpsc::Sender<Payload>,
    closed: AtomicBool,
}

impl ChannelHandle {
    /// New handle with an outbound buffer of `capacity` payloads.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Arc::new(Self {
            id: HandleId::new(),
            tx,
            closed: AtomicBool::new(false),
        });
        (handle, rx)
    }

    /// Mark the handle closed; later sends fail with [`TransportError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl SubscriberHandle for ChannelHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn send(&self, payload: Payload) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed(self.id));
        }
        self.tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backlogged(self.id),
            TrySendError::Closed(_) => TransportError::Closed(self.id),
        })
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }
}
