//! Outbound peer sockets for the dispatcher side.
//!
//! `PeerLink` is the seam the dispatcher drives: send one envelope, poll for
//! one reply's frames. The TCP implementation keeps the socket non-blocking
//! and reassembles replies through a `FrameReader`.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use crate::wire::envelope::Envelope;
use crate::wire::framing::{FrameReader, FramingError};

use super::TransportError;

const READ_CHUNK_SIZE: usize = 4096;
const WRITE_RETRY_MAX: usize = 50;
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(2);

#[derive(Debug)]
pub enum LinkError {
    Io(io::Error),
    Framing(FramingError),
    Closed,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(source) => write!(f, "peer link IO error: {source}"),
            Self::Framing(source) => write!(f, "peer link framing error: {source}"),
            Self::Closed => write!(f, "peer closed the connection"),
        }
    }
}

impl std::error::Error for LinkError {}

pub trait PeerLink {
    fn send_envelope(&mut self, envelope: &Envelope) -> io::Result<()>;

    /// One complete reply's frames, or `None` when no full message has
    /// arrived yet.
    fn poll_reply_frames(&mut self) -> Result<Option<Vec<Vec<u8>>>, LinkError>;
}

pub trait PeerConnector {
    type Link: PeerLink;

    fn connect(&self, address: &str) -> Result<Self::Link, TransportError>;
}

pub struct PeerSocket {
    stream: TcpStream,
    reader: FrameReader,
}

impl PeerSocket {
    pub fn connect(address: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(address).map_err(|source| TransportError::Connect {
            address: address.to_owned(),
            source,
        })?;
        stream
            .set_nodelay(true)
            .map_err(|source| TransportError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| TransportError::SetNonBlocking { source })?;

        Ok(Self {
            stream,
            reader: FrameReader::new(),
        })
    }

    /// Writes pre-framed bytes, retrying through short `WouldBlock` stalls.
    pub fn send_raw(&mut self, message: &[u8]) -> io::Result<()> {
        let mut written = 0;
        let mut retries = 0;
        while written < message.len() {
            match self.stream.write(&message[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer socket accepted zero bytes",
                    ))
                }
                Ok(count) => {
                    written += count;
                    retries = 0;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    retries += 1;
                    if retries > WRITE_RETRY_MAX {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "peer socket send stalled",
                        ));
                    }
                    thread::sleep(WRITE_RETRY_BACKOFF);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }
}

impl PeerLink for PeerSocket {
    fn send_envelope(&mut self, envelope: &Envelope) -> io::Result<()> {
        let message = envelope
            .to_message()
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        self.send_raw(&message)
    }

    fn poll_reply_frames(&mut self) -> Result<Option<Vec<Vec<u8>>>, LinkError> {
        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(LinkError::Closed),
                Ok(count) => self.reader.extend_from_slice(&chunk[..count]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(LinkError::Io(error)),
            }
        }

        self.reader.next_message().map_err(LinkError::Framing)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TcpPeerConnector;

impl PeerConnector for TcpPeerConnector {
    type Link = PeerSocket;

    fn connect(&self, address: &str) -> Result<Self::Link, TransportError> {
        PeerSocket::connect(address)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::{PeerConnector, PeerLink, PeerSocket, TcpPeerConnector};
    use crate::transport::{TcpServer, TransportError};
    use crate::wire::envelope::{Control, Envelope};
    use crate::wire::framing::{pack_frames, unpack_frames};

    fn accept_one(server: &TcpServer) -> std::sync::Arc<crate::transport::PersistentConnection> {
        for _ in 0..50 {
            if let Some(conn) = server
                .try_accept_persistent()
                .expect("accept poll should not fail")
            {
                return conn;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("server should accept a connection");
    }

    #[test]
    fn connect_fails_fast_on_refused_address() {
        // Port 1 is virtually never listening on loopback.
        let result = PeerSocket::connect("127.0.0.1:1");
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[test]
    fn sent_envelope_arrives_framed_on_the_wire() {
        let server = TcpServer::bind("127.0.0.1", 0).expect("server should bind");
        let addr = server.local_addr().expect("local addr should exist");

        let mut peer = TcpPeerConnector
            .connect(&addr.to_string())
            .expect("peer should connect");
        let conn = accept_one(&server);

        let envelope = Envelope::ping("pulse:workers:127.0.0.1:5555", 1);
        peer.send_envelope(&envelope).expect("send should succeed");

        let mut received = Vec::new();
        let mut chunk = [0_u8; 256];
        for _ in 0..50 {
            match conn.try_read(&mut chunk) {
                Ok(0) => break,
                Ok(count) => received.extend_from_slice(&chunk[..count]),
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(error) => panic!("unexpected read error: {error}"),
            }
            if received.len() >= 4 {
                let declared =
                    u32::from_be_bytes([received[0], received[1], received[2], received[3]])
                        as usize;
                if received.len() >= 4 + declared {
                    break;
                }
            }
        }

        let frames = unpack_frames(&received[4..]).expect("received body should unpack");
        let decoded = Envelope::from_frames(&frames).expect("envelope should decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn poll_assembles_reply_sent_in_two_chunks() {
        let server = TcpServer::bind("127.0.0.1", 0).expect("server should bind");
        let addr = server.local_addr().expect("local addr should exist");

        let mut peer = PeerSocket::connect(&addr.to_string()).expect("peer should connect");
        let conn = accept_one(&server);

        let reply = Envelope::pong("pulse:workers:127.0.0.1:5555", 9);
        let message = pack_frames(&reply.to_frames()).expect("reply should pack");
        let split = message.len() / 2;

        assert!(peer
            .poll_reply_frames()
            .expect("empty poll should not fail")
            .is_none());

        write_all(&conn, &message[..split]);
        thread::sleep(Duration::from_millis(20));
        assert!(peer
            .poll_reply_frames()
            .expect("partial poll should not fail")
            .is_none());

        write_all(&conn, &message[split..]);

        let mut frames = None;
        for _ in 0..50 {
            if let Some(found) = peer
                .poll_reply_frames()
                .expect("poll should not fail")
            {
                frames = Some(found);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let decoded = Envelope::from_frames(&frames.expect("reply should arrive"))
            .expect("reply should decode");
        assert_eq!(decoded.control, Control::Pong);
        assert_eq!(decoded.sequence, 9);
    }

    #[test]
    fn poll_reports_closed_peer() {
        let server = TcpServer::bind("127.0.0.1", 0).expect("server should bind");
        let addr = server.local_addr().expect("local addr should exist");

        let mut peer = PeerSocket::connect(&addr.to_string()).expect("peer should connect");
        let conn = accept_one(&server);
        conn.shutdown().expect("server side should close");

        let mut closed = false;
        for _ in 0..50 {
            match peer.poll_reply_frames() {
                Err(super::LinkError::Closed) => {
                    closed = true;
                    break;
                }
                Err(error) => panic!("unexpected link error: {error}"),
                Ok(_) => thread::sleep(Duration::from_millis(10)),
            }
        }
        assert!(closed, "closed peer should surface LinkError::Closed");
    }

    fn write_all(conn: &crate::transport::PersistentConnection, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            match conn.try_write(bytes) {
                Ok(count) => bytes = &bytes[count..],
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(error) => panic!("unexpected write error: {error}"),
            }
        }
    }
}
