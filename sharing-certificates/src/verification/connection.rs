//! Byte-frame transport used by the verification protocol.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{CertificateError, Result};

/// A reliable, ordered, message-framed connection to one peer.
#[async_trait]
pub trait FrameConnection: Send + Sync {
    async fn write(&self, frame: Vec<u8>) -> Result<()>;

    /// Next frame from the peer, `None` once the peer has gone away.
    async fn read(&self) -> Option<Vec<u8>>;
}

/// One end of an in-process connection pair.
pub struct InMemoryConnection {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    incoming: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl InMemoryConnection {
    /// Two connected ends; what one writes the other reads.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self {
                outgoing: a_tx,
                incoming: Mutex::new(a_rx),
            },
            Self {
                outgoing: b_tx,
                incoming: Mutex::new(b_rx),
            },
        )
    }
}

#[async_trait]
impl FrameConnection for InMemoryConnection {
    async fn write(&self, frame: Vec<u8>) -> Result<()> {
        self.outgoing
            .send(frame)
            .map_err(|_| CertificateError::Connection("peer closed the connection".into()))
    }

    async fn read(&self) -> Option<Vec<u8>> {
        self.incoming.lock().await.recv().await
    }
}
