//! Module providing a single multiplexed connection to a broker node.
//!
//! A connection is driven by two tasks: a writer draining outgoing frames from a channel and a
//! reader dispatching incoming frames to waiting requests by correlation id. When either side
//! fails, every request still waiting on the connection is failed with `ConnectionLost`.

use super::super::{
    error::{Error, Result},
    protocol::frame::{read_frame, write_frame, Frame},
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error_span, warn, Instrument};

pub const OUTGOING_FRAME_BUFFER_SIZE: usize = 1024;

type ResponseSender = oneshot::Sender<Result<Bytes>>;

#[derive(Default)]
struct PendingRequests {
    alive: bool,
    senders: HashMap<u64, ResponseSender>,
}

struct Shared {
    pending: Mutex<PendingRequests>,
    alive: AtomicBool,
}

impl Shared {
    fn fail_all(&self, reason: &str) {
        let senders = match self.pending.lock() {
            Ok(mut pending) => {
                pending.alive = false;
                std::mem::take(&mut pending.senders)
            }
            Err(poisoned) => {
                let mut pending = poisoned.into_inner();
                pending.alive = false;
                std::mem::take(&mut pending.senders)
            }
        };

        self.alive.store(false, Ordering::Release);

        if !senders.is_empty() {
            warn!(
                in_flight = senders.len(),
                reason, "failing in-flight requests"
            );
        }

        for (_, sender) in senders {
            let _ = sender.send(Err(Error::connection_lost(reason.to_owned())));
        }
    }

    fn register(&self, correlation_id: u64, sender: ResponseSender) -> Result<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| Error::connection_lost("pending request table poisoned"))?;

        if !pending.alive {
            return Err(Error::connection_lost("connection is closed"));
        }

        pending.senders.insert(correlation_id, sender);

        Ok(())
    }

    fn take(&self, correlation_id: u64) -> Option<ResponseSender> {
        self.pending
            .lock()
            .ok()
            .and_then(|mut x| x.senders.remove(&correlation_id))
    }

    fn in_flight(&self) -> usize {
        self.pending.lock().map(|x| x.senders.len()).unwrap_or(0)
    }
}

pub struct BrokerConnection {
    address: String,
    frame_tx: mpsc::Sender<Frame>,
    shared: Arc<Shared>,

    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl BrokerConnection {
    /// Spawns the reader and writer tasks for the given stream. Must be called from within a
    /// tokio runtime.
    pub fn spawn<S>(address: &str, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(OUTGOING_FRAME_BUFFER_SIZE);

        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingRequests {
                alive: true,
                senders: HashMap::new(),
            }),
            alive: AtomicBool::new(true),
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(
            async move {
                loop {
                    match read_frame(&mut read_half).await {
                        Ok(Some(frame)) => match reader_shared.take(frame.correlation_id) {
                            Some(sender) => {
                                let _ = sender.send(Ok(frame.payload));
                            }
                            None => debug!(
                                correlation_id = frame.correlation_id,
                                "dropping response with no waiting request"
                            ),
                        },
                        Ok(None) => {
                            reader_shared.fail_all("connection closed by peer");
                            break;
                        }
                        Err(err) => {
                            reader_shared.fail_all(&err.to_string());
                            break;
                        }
                    }
                }
            }
            .instrument(error_span!("broker_connection_reader", address)),
        );

        let writer_shared = shared.clone();
        let writer = tokio::spawn(
            async move {
                while let Some(frame) = frame_rx.recv().await {
                    if let Err(err) = write_frame(&mut write_half, &frame).await {
                        writer_shared.fail_all(&err.to_string());
                        return;
                    }
                }

                let _ = write_half.shutdown().await;
            }
            .instrument(error_span!("broker_connection_writer", address)),
        );

        Self {
            address: address.to_owned(),
            frame_tx,
            shared,
            reader,
            writer,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Number of requests awaiting a response on this connection.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    /// Sends `payload` tagged with `correlation_id` and waits up to `timeout` for the matching
    /// response.
    pub async fn round_trip(
        &self,
        correlation_id: u64,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes> {
        let (response_tx, response_rx) = oneshot::channel();

        self.shared.register(correlation_id, response_tx)?;

        if self
            .frame_tx
            .send(Frame::new(correlation_id, payload))
            .await
            .is_err()
        {
            self.shared.take(correlation_id);
            return Err(Error::connection_lost("connection writer stopped"));
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Err(Error::connection_lost("connection dropped request")),
            Err(_) => {
                self.shared.take(correlation_id);
                Err(Error::timed_out(format!(
                    "no response from {} within {:?}",
                    self.address, timeout
                )))
            }
        }
    }

    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
        self.shared.fail_all("connection closed");
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::{super::super::error::ErrorKind, *};

    #[tokio::test]
    async fn test_responses_matched_by_correlation_id() {
        let (client, mut server) = tokio::io::duplex(1024);
        let connection = BrokerConnection::spawn("loopback", client);

        // echo server answering requests in reverse order
        let server_task = tokio::spawn(async move {
            let first = read_frame(&mut server).await.unwrap().unwrap();
            let second = read_frame(&mut server).await.unwrap().unwrap();

            write_frame(&mut server, &second).await.unwrap();
            write_frame(&mut server, &first).await.unwrap();

            server
        });

        let (first, second) = tokio::join!(
            connection.round_trip(1, Bytes::from_static(b"first"), Duration::from_secs(5)),
            connection.round_trip(2, Bytes::from_static(b"second"), Duration::from_secs(5)),
        );

        assert_eq!(first.unwrap(), Bytes::from_static(b"first"));
        assert_eq!(second.unwrap(), Bytes::from_static(b"second"));
        assert_eq!(connection.in_flight(), 0);

        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn test_in_flight_requests_fail_on_connection_loss() {
        let (client, mut server) = tokio::io::duplex(1024);
        let connection = Arc::new(BrokerConnection::spawn("loopback", client));

        let waiting = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .round_trip(1, Bytes::from_static(b"lost"), Duration::from_secs(5))
                    .await
            })
        };

        // receive the request, then hang up without answering
        read_frame(&mut server).await.unwrap().unwrap();
        drop(server);

        assert_eq!(
            waiting.await.unwrap().unwrap_err().kind(),
            ErrorKind::ConnectionLost
        );
        assert!(!connection.is_alive());

        assert_eq!(
            connection
                .round_trip(2, Bytes::new(), Duration::from_secs(5))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::ConnectionLost
        );
    }

    #[tokio::test]
    async fn test_round_trip_timeout() {
        let (client, _server) = tokio::io::duplex(1024);
        let connection = BrokerConnection::spawn("loopback", client);

        assert_eq!(
            connection
                .round_trip(1, Bytes::new(), Duration::from_millis(20))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::TimedOut
        );
        assert_eq!(connection.in_flight(), 0);
        assert!(connection.is_alive());
    }
}
