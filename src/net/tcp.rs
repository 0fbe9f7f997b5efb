use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{Notify, mpsc},
};

use codec::{identity::SIGNATURE_SIZE, packet};
use overlay::{
    Overlay,
    register::Direction,
    sink::{PacketSink, SinkError},
};

/// Depth of the per-connection write queue; the high-water mark beyond
/// which sends fail with Overloaded.
const WRITE_QUEUE_DEPTH: usize = 512;

/// Largest frame accepted off the wire: a full header, the payload bound
/// and the signature.
const MAX_FRAME_SIZE: usize = packet::HEADER_SIZE + packet::MAX_PAYLOAD_SIZE + SIGNATURE_SIZE;

/// How many queued frames are coalesced behind a single write.
const COALESCE_BYTES: usize = 64 * 1024;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// The transport half of a connection as the overlay sees it: a bounded
/// enqueue and a close signal.
struct TcpSink {
    tx: mpsc::Sender<Bytes>,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
}

impl PacketSink for TcpSink {
    fn send(&self, frame: Bytes) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }

        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SinkError::Overloaded),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }
}

/// Accept overlay connections until the listener dies or the task is
/// aborted.
pub async fn listen(listener: TcpListener, overlay: Overlay) {
    let local_addr = listener.local_addr().ok();

    while let Ok((socket, address)) = listener.accept().await {
        log::info!("tcp socket accept: addr={address}, interface={local_addr:?}");
        tokio::spawn(connection(socket, Direction::Incoming, None, overlay.clone()));
    }

    log::info!("tcp server close: interface={local_addr:?}");
}

/// Strip the transport scheme off a peer uri. Bare `host:port` strings
/// are accepted as well.
pub fn host_port(uri: &str) -> Option<&str> {
    match uri.split_once("://") {
        Some(("tcp", rest)) => Some(rest),
        Some(_) => None,
        None => Some(uri),
    }
}

/// Open an outgoing connection and run it to completion.
pub async fn dial(uri: String, overlay: Overlay) {
    let Some(address) = host_port(&uri) else {
        log::warn!("unsupported peer uri: uri={uri}");
        return;
    };

    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(socket)) => {
            log::info!("tcp socket connect: uri={uri}");
            connection(socket, Direction::Outgoing, Some(uri), overlay).await;
        }
        Ok(Err(error)) => {
            log::debug!("dial failed: uri={uri}, err={error}");
        }
        Err(_) => {
            log::debug!("dial timed out: uri={uri}");
        }
    }
}

/// One connection's whole life: attach to the overlay, shuttle frames in
/// both directions, detach on any exit path.
///
/// Frames carry a 4-byte big-endian length prefix. Inbound frames are
/// dispatched to the overlay synchronously in arrival order; outbound
/// frames drain from the bounded queue the sink feeds, coalescing bursts
/// behind a single write.
async fn connection(
    mut socket: TcpStream,
    direction: Direction,
    uri: Option<String>,
    overlay: Overlay,
) {
    // Any frame should go out as soon as it is written; latency beats
    // throughput everywhere in the overlay.
    if let Err(error) = socket.set_nodelay(true) {
        log::error!("tcp socket set nodelay failed!: err={error}");
    }

    let peer = socket
        .peer_addr()
        .map(|address| address.to_string())
        .unwrap_or_default();

    let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);
    let shutdown = Arc::new(Notify::new());
    let sink = Arc::new(TcpSink {
        tx,
        closed: AtomicBool::new(false),
        shutdown: shutdown.clone(),
    });

    let handle = overlay.attach(sink, direction, uri);
    let mut buffer = BytesMut::with_capacity(8192);

    'conn: loop {
        tokio::select! {
            result = socket.read_buf(&mut buffer) => {
                match result {
                    // Zero read: the peer closed the stream.
                    Ok(0) => break,
                    Ok(_) => loop {
                        if buffer.len() < 4 {
                            break;
                        }

                        let frame_len = u32::from_be_bytes([
                            buffer[0], buffer[1], buffer[2], buffer[3],
                        ]) as usize;

                        if frame_len > MAX_FRAME_SIZE {
                            log::warn!(
                                "tcp frame too large: size={frame_len}, max={MAX_FRAME_SIZE}, addr={peer}"
                            );
                            break 'conn;
                        }

                        if buffer.len() < 4 + frame_len {
                            break;
                        }

                        buffer.advance(4);
                        let frame = buffer.split_to(frame_len).freeze();
                        overlay.on_frame(handle, &frame);
                    },
                    Err(error) => {
                        log::debug!("tcp read failed: addr={peer}, err={error}");
                        break;
                    }
                }
            }
            Some(frame) = rx.recv() => {
                let mut out = BytesMut::with_capacity(4 + frame.len());
                out.put_u32(frame.len() as u32);
                out.put_slice(&frame);

                // Drain whatever else is already queued into the same
                // write.
                while out.len() < COALESCE_BYTES {
                    match rx.try_recv() {
                        Ok(frame) => {
                            out.put_u32(frame.len() as u32);
                            out.put_slice(&frame);
                        }
                        Err(_) => break,
                    }
                }

                if socket.write_all(&out).await.is_err() {
                    break;
                }
            }
            _ = shutdown.notified() => {
                break;
            }
        }
    }

    overlay.on_disconnect(handle);
    log::info!("tcp socket disconnect: addr={peer}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_parsing() {
        assert_eq!(host_port("tcp://127.0.0.1:1337"), Some("127.0.0.1:1337"));
        assert_eq!(host_port("127.0.0.1:1337"), Some("127.0.0.1:1337"));
        assert_eq!(host_port("udp://127.0.0.1:1337"), None);
    }
}
