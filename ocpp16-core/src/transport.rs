//! Transport capability for sessions
//!
//! The engine never touches a WebSocket directly. A session sends and
//! receives text frames through a pair of bounded channels; the node
//! binaries pump those channels from a tungstenite stream, and tests drive
//! them directly. `link` builds two symmetric halves of such a connection:
//! frames sent on one half arrive at the other.

use thiserror::Error;
use tokio::sync::mpsc;

/// Transport-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The other end of the link is gone.
    #[error("transport closed")]
    Closed,
}

/// Sending half of a transport. Cheap to clone; every clone feeds the same
/// peer.
#[derive(Debug, Clone)]
pub struct TransportSink {
    tx: mpsc::Sender<String>,
}

impl TransportSink {
    /// Send one text frame. Suspends while the channel is full.
    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        self.tx.send(text).await.map_err(|_| TransportError::Closed)
    }
}

/// Receiving half of a transport. Owned by the session's frame loop.
#[derive(Debug)]
pub struct TransportSource {
    rx: mpsc::Receiver<String>,
}

impl TransportSource {
    /// Receive the next text frame. Suspends until a frame arrives or the
    /// peer closes.
    pub async fn receive(&mut self) -> Result<String, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

/// One endpoint of a frame link
#[derive(Debug)]
pub struct Transport {
    pub sink: TransportSink,
    pub source: TransportSource,
}

/// Create a connected pair of transports. Frames sent on one endpoint's
/// sink arrive at the other endpoint's source. Dropping an endpoint closes
/// the link for its peer.
pub fn link(capacity: usize) -> (Transport, Transport) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    let a = Transport {
        sink: TransportSink { tx: a_tx },
        source: TransportSource { rx: a_rx },
    };
    let b = Transport {
        sink: TransportSink { tx: b_tx },
        source: TransportSource { rx: b_rx },
    };

    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_the_link() {
        let (mut a, mut b) = link(4);

        a.sink.send("[2,\"id\",\"Heartbeat\",{}]".to_string()).await.unwrap();
        assert_eq!(b.source.receive().await.unwrap(), "[2,\"id\",\"Heartbeat\",{}]");

        b.sink.send("[3,\"id\",{}]".to_string()).await.unwrap();
        assert_eq!(a.source.receive().await.unwrap(), "[3,\"id\",{}]");
    }

    #[test]
    fn dropping_an_endpoint_closes_the_peer() {
        tokio_test::block_on(async {
            let (a, mut b) = link(4);
            drop(a);

            assert_eq!(b.source.receive().await, Err(TransportError::Closed));
            assert_eq!(b.sink.send("frame".to_string()).await, Err(TransportError::Closed));
        });
    }
}
