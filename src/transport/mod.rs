//! Non-blocking TCP plumbing shared by both roles: the listener side used
//! by the ingestion handler and the outbound peer sockets used by the
//! dispatcher.

pub mod peer;

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub enum TransportError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
    StreamClone {
        source: io::Error,
    },
    Connect {
        address: String,
        source: io::Error,
    },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP listener on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set socket to non-blocking mode: {source}")
            }
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone TCP stream for full duplex IO: {source}")
            }
            Self::Connect { address, source } => {
                write!(f, "failed to connect to {address}: {source}")
            }
        }
    }
}

impl std::error::Error for TransportError {}

pub struct PersistentConnection {
    id: u64,
    peer_addr: SocketAddr,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
}

impl PersistentConnection {
    fn new(id: u64, stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, TransportError> {
        stream
            .set_nodelay(true)
            .map_err(|source| TransportError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| TransportError::ConfigureAcceptedStream { source })?;

        let writer = stream
            .try_clone()
            .map_err(|source| TransportError::StreamClone { source })?;

        Ok(Self {
            id,
            peer_addr,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn try_read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.reader
            .lock()
            .expect("connection reader lock poisoned")
            .read(buffer)
    }

    pub fn try_write(&self, payload: &[u8]) -> io::Result<usize> {
        self.writer
            .lock()
            .expect("connection writer lock poisoned")
            .write(payload)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        let _ = self
            .reader
            .lock()
            .expect("connection reader lock poisoned")
            .shutdown(Shutdown::Both);
        self.writer
            .lock()
            .expect("connection writer lock poisoned")
            .shutdown(Shutdown::Both)
    }
}

pub struct TcpServer {
    listener: TcpListener,
    next_connection_id: AtomicU64,
    active_connections: Mutex<HashMap<u64, Arc<PersistentConnection>>>,
}

impl TcpServer {
    pub fn bind(host: &str, port: u16) -> Result<Self, TransportError> {
        let address = format!("{host}:{port}");
        let listener =
            TcpListener::bind(&address).map_err(|source| TransportError::Bind { address, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            next_connection_id: AtomicU64::new(1),
            active_connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn try_accept_persistent(&self) -> Result<Option<Arc<PersistentConnection>>, TransportError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                let connection = Arc::new(PersistentConnection::new(id, stream, peer_addr)?);
                self.active_connections
                    .lock()
                    .expect("active connections lock poisoned")
                    .insert(id, Arc::clone(&connection));
                Ok(Some(connection))
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(TransportError::ConfigureAcceptedStream { source }),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.active_connections
            .lock()
            .expect("active connections lock poisoned")
            .len()
    }

    pub fn drop_connection(&self, id: u64) {
        self.active_connections
            .lock()
            .expect("active connections lock poisoned")
            .remove(&id);
    }

    pub fn shutdown_all_connections(&self) {
        let mut connections = self
            .active_connections
            .lock()
            .expect("active connections lock poisoned");

        for connection in connections.values() {
            let _ = connection.shutdown();
        }
        connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::TcpServer;

    #[test]
    fn accept_poll_returns_none_without_pending_clients() {
        let server = TcpServer::bind("127.0.0.1", 0).expect("server should bind");
        let accepted = server
            .try_accept_persistent()
            .expect("accept poll should not fail");
        assert!(accepted.is_none());
    }

    #[test]
    fn accepts_persistent_full_duplex_connection() {
        let server = TcpServer::bind("127.0.0.1", 0).expect("server should bind");
        let addr = server.local_addr().expect("local addr should exist");

        let client = std::net::TcpStream::connect(addr).expect("client should connect");
        client
            .set_nonblocking(true)
            .expect("client should be nonblocking");

        let mut accepted = None;
        for _ in 0..20 {
            if let Some(conn) = server
                .try_accept_persistent()
                .expect("accept poll should not fail")
            {
                accepted = Some(conn);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let conn = accepted.expect("server should accept connection");
        assert_eq!(server.connection_count(), 1);

        let write_result = conn.try_write(b"ping");
        assert!(write_result.is_ok() || write_result.err().is_some());

        let mut buf = [0_u8; 16];
        let read_result = conn.try_read(&mut buf);
        assert!(read_result.is_ok() || read_result.err().is_some());

        server.drop_connection(conn.id());
        assert_eq!(server.connection_count(), 0);
    }
}
