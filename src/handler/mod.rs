//! Worker-side ingestion handler.
//!
//! Listens for dispatcher connections, acks jobs into the local work queue,
//! answers liveness probes, and manages its own registry lifecycle:
//! register on start, exit when an operator parks the identity, deregister
//! on the way out.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use crate::config::{HandlerConfig, RegistryConfig};
use crate::logging::Logger;
use crate::queue::{QueueError, WorkQueue};
use crate::registry::{compose_identity, Registry, RegistryError};
use crate::transport::{PersistentConnection, TcpServer, TransportError};
use crate::wire::envelope::{Control, Envelope};
use crate::wire::framing::FrameReader;

const LOG_CONTEXT: &str = "handler";
const READ_CHUNK_SIZE: usize = 4096;
const WRITE_RETRY_MAX: usize = 50;
const WRITE_RETRY_BACKOFF: StdDuration = StdDuration::from_millis(2);

#[derive(Debug)]
pub enum HandlerError {
    Transport(TransportError),
    Registry(RegistryError),
    Io(io::Error),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(source) => write!(f, "{source}"),
            Self::Registry(source) => write!(f, "{source}"),
            Self::Io(source) => write!(f, "handler IO error: {source}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<TransportError> for HandlerError {
    fn from(source: TransportError) -> Self {
        Self::Transport(source)
    }
}

impl From<RegistryError> for HandlerError {
    fn from(source: RegistryError) -> Self {
        Self::Registry(source)
    }
}

#[derive(Clone, Debug)]
pub struct HandlerSettings {
    pub host: String,
    pub port: u16,
    pub role_key: String,
    pub drain_check_interval: Duration,
    pub poll_interval: StdDuration,
}

impl HandlerSettings {
    pub fn from_config(handler: &HandlerConfig, registry: &RegistryConfig) -> Self {
        Self {
            host: handler.host.clone(),
            port: handler.port,
            role_key: registry.role_key.clone(),
            drain_check_interval: Duration::seconds(handler.drain_check_interval_secs as i64),
            poll_interval: StdDuration::from_millis(100),
        }
    }
}

/// What to do with one decoded inbound envelope. Pure so the protocol
/// surface is testable without sockets.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundAction {
    Reply(Envelope),
    Stop,
    Drop { reason: String },
}

pub fn evaluate_inbound(envelope: &Envelope, queue: &WorkQueue) -> InboundAction {
    match envelope.control {
        Control::Ping => InboundAction::Reply(Envelope::pong(
            envelope.destination.clone(),
            envelope.sequence,
        )),
        Control::Job => {
            let Some(payload) = &envelope.payload else {
                return InboundAction::Drop {
                    reason: "job without payload".to_owned(),
                };
            };
            match queue.try_push(payload.clone()) {
                Ok(()) => InboundAction::Reply(Envelope::ok(
                    envelope.destination.clone(),
                    envelope.sequence,
                )),
                // No ack is sent: the dispatcher's timeout redelivers the
                // job once there is room again.
                Err(QueueError::Full { capacity }) => InboundAction::Drop {
                    reason: format!("work queue full ({capacity} entries), job not acked"),
                },
                Err(QueueError::Disconnected) => InboundAction::Drop {
                    reason: "work queue consumer has gone away".to_owned(),
                },
            }
        }
        Control::Shutdown => InboundAction::Stop,
        Control::Pong | Control::Ok => InboundAction::Drop {
            reason: format!("unexpected reply verb '{}'", envelope.control),
        },
    }
}

struct Client {
    conn: Arc<PersistentConnection>,
    reader: FrameReader,
}

enum ClientVerdict {
    Keep,
    Close,
    StopRequested,
}

pub struct IngestionHandler {
    server: TcpServer,
    registry: Box<dyn Registry>,
    logger: Arc<Logger>,
    queue: WorkQueue,
    settings: HandlerSettings,
    identity: String,
    clients: HashMap<u64, Client>,
    next_drain_check_at: DateTime<Utc>,
}

impl IngestionHandler {
    pub fn bind(
        registry: Box<dyn Registry>,
        logger: Arc<Logger>,
        queue: WorkQueue,
        settings: HandlerSettings,
    ) -> Result<Self, HandlerError> {
        let server = TcpServer::bind(&settings.host, settings.port)?;
        let bound_port = server.local_addr().map_err(HandlerError::Io)?.port();
        let identity = compose_identity(&settings.role_key, &settings.host, bound_port);

        Ok(Self {
            server,
            registry,
            logger,
            queue,
            settings,
            identity,
            clients: HashMap::new(),
            next_drain_check_at: Utc::now(),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Announces this worker: a leftover parked flag from a previous run
    /// is cleared first so the dispatcher will adopt the identity again.
    pub fn register(&mut self) -> Result<(), HandlerError> {
        self.registry
            .clear_inactive(&self.settings.role_key, &self.identity)?;
        self.registry
            .append_identity(&self.settings.role_key, &self.identity)?;
        self.logger.info(
            Some(LOG_CONTEXT),
            &format!("registered as {}", self.identity),
        );
        Ok(())
    }

    pub fn deregister(&mut self) -> Result<(), HandlerError> {
        self.registry
            .remove_identity(&self.settings.role_key, &self.identity)?;
        self.logger.info(
            Some(LOG_CONTEXT),
            &format!("deregistered {}", self.identity),
        );
        Ok(())
    }

    pub fn run(&mut self, stop: Arc<AtomicBool>) -> Result<(), HandlerError> {
        self.register()?;
        self.logger.info(
            Some(LOG_CONTEXT),
            &format!("ingestion loop started on {}", self.identity),
        );

        let result = self.serve(stop);

        self.server.shutdown_all_connections();
        self.clients.clear();
        // The identity comes off the active list even when the loop died
        // on an error.
        if let Err(error) = self.deregister() {
            self.logger.error(
                Some(LOG_CONTEXT),
                &format!("deregistration failed: {error}"),
            );
            result?;
            return Err(error);
        }
        self.logger.info(Some(LOG_CONTEXT), "ingestion loop stopped");
        result
    }

    fn serve(&mut self, stop: Arc<AtomicBool>) -> Result<(), HandlerError> {
        let mut stopping = false;
        while !stopping {
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let mut busy = false;

            while let Some(conn) = self.server.try_accept_persistent()? {
                busy = true;
                self.logger.info(
                    Some(LOG_CONTEXT),
                    &format!("dispatcher connected from {}", conn.peer_addr()),
                );
                self.clients.insert(
                    conn.id(),
                    Client {
                        conn,
                        reader: FrameReader::new(),
                    },
                );
            }

            let ids: Vec<u64> = self.clients.keys().copied().collect();
            for id in ids {
                let Some(mut client) = self.clients.remove(&id) else {
                    continue;
                };
                let (verdict, handled) = self.service_client(&mut client);
                busy |= handled > 0;
                match verdict {
                    ClientVerdict::Keep => {
                        self.clients.insert(id, client);
                    }
                    ClientVerdict::Close => {
                        self.server.drop_connection(id);
                        let _ = client.conn.shutdown();
                        self.logger.info(
                            Some(LOG_CONTEXT),
                            &format!("connection from {} closed", client.conn.peer_addr()),
                        );
                    }
                    ClientVerdict::StopRequested => {
                        self.logger
                            .info(Some(LOG_CONTEXT), "shutdown requested over the wire");
                        self.clients.insert(id, client);
                        stopping = true;
                    }
                }
            }

            let now = Utc::now();
            if now >= self.next_drain_check_at {
                self.next_drain_check_at = now + self.settings.drain_check_interval;
                if self
                    .registry
                    .is_inactive(&self.settings.role_key, &self.identity)?
                {
                    self.logger
                        .info(Some(LOG_CONTEXT), "identity parked by operator, draining");
                    stopping = true;
                }
            }

            if !busy && !stopping {
                thread::sleep(self.settings.poll_interval);
            }
        }

        Ok(())
    }

    fn service_client(&mut self, client: &mut Client) -> (ClientVerdict, usize) {
        let mut handled = 0;
        let mut chunk = [0_u8; READ_CHUNK_SIZE];

        loop {
            match client.conn.try_read(&mut chunk) {
                Ok(0) => return (ClientVerdict::Close, handled),
                Ok(count) => client.reader.extend_from_slice(&chunk[..count]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    self.logger
                        .warn(Some(LOG_CONTEXT), &format!("read failed: {error}"));
                    return (ClientVerdict::Close, handled);
                }
            }
        }

        loop {
            let frames = match client.reader.next_message() {
                Ok(Some(frames)) => frames,
                Ok(None) => break,
                // A framing violation poisons the byte stream.
                Err(error) => {
                    self.logger.warn(
                        Some(LOG_CONTEXT),
                        &format!("framing violation, dropping connection: {error}"),
                    );
                    return (ClientVerdict::Close, handled);
                }
            };
            handled += 1;

            let envelope = match Envelope::from_frames(&frames) {
                Ok(envelope) => envelope,
                Err(error) => {
                    self.logger
                        .warn(Some(LOG_CONTEXT), &format!("dropping message: {error}"));
                    continue;
                }
            };

            match evaluate_inbound(&envelope, &self.queue) {
                InboundAction::Reply(reply) => {
                    let message = match reply.to_message() {
                        Ok(message) => message,
                        Err(error) => {
                            self.logger
                                .error(Some(LOG_CONTEXT), &format!("reply encode failed: {error}"));
                            continue;
                        }
                    };
                    if let Err(error) = write_message(&client.conn, &message) {
                        self.logger.warn(
                            Some(LOG_CONTEXT),
                            &format!("reply send failed, dropping connection: {error}"),
                        );
                        return (ClientVerdict::Close, handled);
                    }
                }
                InboundAction::Stop => return (ClientVerdict::StopRequested, handled),
                InboundAction::Drop { reason } => {
                    self.logger.warn(Some(LOG_CONTEXT), &reason);
                }
            }
        }

        (ClientVerdict::Keep, handled)
    }
}

fn write_message(conn: &PersistentConnection, message: &[u8]) -> io::Result<()> {
    let mut written = 0;
    let mut retries = 0;
    while written < message.len() {
        match conn.try_write(&message[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer accepted zero bytes",
                ))
            }
            Ok(count) => {
                written += count;
                retries = 0;
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                retries += 1;
                if retries > WRITE_RETRY_MAX {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "reply send stalled"));
                }
                thread::sleep(WRITE_RETRY_BACKOFF);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration as StdDuration, Instant};

    use chrono::Duration;

    use super::{evaluate_inbound, HandlerSettings, InboundAction, IngestionHandler};
    use crate::logging::{Logger, LoggerConfig};
    use crate::queue::WorkQueue;
    use crate::registry::{MemoryRegistry, Registry, RegistryError};
    use crate::transport::peer::{PeerLink, PeerSocket};
    use crate::wire::envelope::{Control, Envelope};

    const ROLE: &str = "pulse:workers";

    fn settings() -> HandlerSettings {
        HandlerSettings {
            host: "127.0.0.1".to_owned(),
            port: 0,
            role_key: ROLE.to_owned(),
            drain_check_interval: Duration::milliseconds(20),
            poll_interval: StdDuration::from_millis(5),
        }
    }

    struct RunningHandler {
        identity: String,
        address: String,
        registry: Arc<MemoryRegistry>,
        queue: WorkQueue,
        stop: Arc<AtomicBool>,
        thread: Option<thread::JoinHandle<()>>,
    }

    impl RunningHandler {
        fn start(queue_capacity: usize) -> Self {
            let registry = Arc::new(MemoryRegistry::new());
            let queue = WorkQueue::with_capacity(queue_capacity);
            let logger = Arc::new(Logger::new(LoggerConfig::default()));
            let stop = Arc::new(AtomicBool::new(false));

            let mut handler = IngestionHandler::bind(
                Box::new(Arc::clone(&registry)),
                logger,
                queue.clone(),
                settings(),
            )
            .expect("handler should bind");
            let identity = handler.identity().to_owned();
            let address = crate::registry::dial_address(ROLE, &identity)
                .expect("identity should be dialable")
                .to_owned();

            let stop_flag = Arc::clone(&stop);
            let thread = thread::spawn(move || {
                handler.run(stop_flag).expect("handler run should succeed");
            });

            Self {
                identity,
                address,
                registry,
                queue,
                stop,
                thread: Some(thread),
            }
        }

        fn connect(&self) -> PeerSocket {
            for _ in 0..50 {
                if let Ok(peer) = PeerSocket::connect(&self.address) {
                    return peer;
                }
                thread::sleep(StdDuration::from_millis(10));
            }
            panic!("handler should accept connections on {}", self.address);
        }

        fn await_reply(&self, peer: &mut PeerSocket) -> Envelope {
            let deadline = Instant::now() + StdDuration::from_secs(5);
            while Instant::now() < deadline {
                if let Some(frames) = peer
                    .poll_reply_frames()
                    .expect("reply poll should not fail")
                {
                    return Envelope::from_frames(&frames).expect("reply should decode");
                }
                thread::sleep(StdDuration::from_millis(5));
            }
            panic!("no reply from handler within deadline");
        }

        fn join(mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(thread) = self.thread.take() {
                thread.join().expect("handler thread should join");
            }
        }
    }

    impl Drop for RunningHandler {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    #[test]
    fn registers_on_start_and_deregisters_on_stop() {
        let handler = RunningHandler::start(4);

        let deadline = Instant::now() + StdDuration::from_secs(5);
        while Instant::now() < deadline {
            let listed = handler
                .registry
                .list_identities(ROLE)
                .expect("list should succeed");
            if listed.contains(&handler.identity) {
                break;
            }
            thread::sleep(StdDuration::from_millis(5));
        }
        assert!(handler
            .registry
            .list_identities(ROLE)
            .expect("list should succeed")
            .contains(&handler.identity));

        let registry = Arc::clone(&handler.registry);
        let identity = handler.identity.clone();
        handler.join();

        assert!(!registry
            .list_identities(ROLE)
            .expect("list should succeed")
            .contains(&identity));
    }

    #[test]
    fn answers_ping_with_matching_pong() {
        let handler = RunningHandler::start(4);
        let mut peer = handler.connect();

        peer.send_envelope(&Envelope::ping(&handler.identity, 7))
            .expect("ping should send");
        let reply = handler.await_reply(&mut peer);

        assert_eq!(reply.control, Control::Pong);
        assert_eq!(reply.sequence, 7);
        handler.join();
    }

    #[test]
    fn acks_job_and_queues_its_payload() {
        let handler = RunningHandler::start(4);
        let mut peer = handler.connect();

        peer.send_envelope(&Envelope::job(
            &handler.identity,
            3,
            "{\"event\":\"build-started\"}",
        ))
        .expect("job should send");
        let reply = handler.await_reply(&mut peer);

        assert_eq!(reply.control, Control::Ok);
        assert_eq!(reply.sequence, 3);
        assert_eq!(
            handler.queue.try_pop().as_deref(),
            Some("{\"event\":\"build-started\"}")
        );
        handler.join();
    }

    #[test]
    fn malformed_message_is_dropped_but_connection_survives() {
        let handler = RunningHandler::start(4);
        let mut peer = handler.connect();

        // Unknown verb: decodes as frames, fails as an envelope.
        let bogus = crate::wire::framing::pack_frames(&[
            handler.identity.clone().into_bytes(),
            b"1".to_vec(),
            b"reboot".to_vec(),
        ])
        .expect("frames should pack");
        peer.send_raw(&bogus).expect("raw send should succeed");

        peer.send_envelope(&Envelope::ping(&handler.identity, 2))
            .expect("ping should send");
        let reply = handler.await_reply(&mut peer);

        assert_eq!(reply.control, Control::Pong);
        assert_eq!(reply.sequence, 2);
        handler.join();
    }

    #[test]
    fn shutdown_control_stops_the_loop_and_deregisters() {
        let handler = RunningHandler::start(4);
        let mut peer = handler.connect();

        peer.send_envelope(&Envelope::shutdown(&handler.identity, 1))
            .expect("shutdown should send");

        let registry = Arc::clone(&handler.registry);
        let identity = handler.identity.clone();
        let deadline = Instant::now() + StdDuration::from_secs(5);
        while Instant::now() < deadline {
            if !registry
                .list_identities(ROLE)
                .expect("list should succeed")
                .contains(&identity)
            {
                break;
            }
            thread::sleep(StdDuration::from_millis(5));
        }

        assert!(!registry
            .list_identities(ROLE)
            .expect("list should succeed")
            .contains(&identity));
        handler.join();
    }

    #[test]
    fn parked_identity_drains_the_handler() {
        let handler = RunningHandler::start(4);

        handler
            .registry
            .mark_inactive(ROLE, &handler.identity)
            .expect("mark should succeed");

        let registry = Arc::clone(&handler.registry);
        let identity = handler.identity.clone();
        let deadline = Instant::now() + StdDuration::from_secs(5);
        while Instant::now() < deadline {
            if !registry
                .list_identities(ROLE)
                .expect("list should succeed")
                .contains(&identity)
            {
                break;
            }
            thread::sleep(StdDuration::from_millis(5));
        }

        assert!(!registry
            .list_identities(ROLE)
            .expect("list should succeed")
            .contains(&identity));
        handler.join();
    }

    /// Delegates everything to a [`MemoryRegistry`] except the inactive
    /// check, which always errors.
    struct BrokenInactiveChecks {
        inner: Arc<MemoryRegistry>,
    }

    impl Registry for BrokenInactiveChecks {
        fn list_identities(&self, role: &str) -> Result<Vec<String>, RegistryError> {
            self.inner.list_identities(role)
        }

        fn append_identity(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
            self.inner.append_identity(role, identity)
        }

        fn remove_identity(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
            self.inner.remove_identity(role, identity)
        }

        fn mark_inactive(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
            self.inner.mark_inactive(role, identity)
        }

        fn clear_inactive(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
            self.inner.clear_inactive(role, identity)
        }

        fn is_inactive(&self, _role: &str, _identity: &str) -> Result<bool, RegistryError> {
            Err(RegistryError::Deserialize(
                serde_json::from_str::<bool>("").expect_err("empty input should not parse"),
            ))
        }
    }

    #[test]
    fn error_exit_still_deregisters_the_identity() {
        let inner = Arc::new(MemoryRegistry::new());
        let registry = BrokenInactiveChecks {
            inner: Arc::clone(&inner),
        };
        let queue = WorkQueue::with_capacity(4);
        let logger = Arc::new(Logger::new(LoggerConfig::default()));

        let mut handler =
            IngestionHandler::bind(Box::new(registry), logger, queue, settings())
                .expect("handler should bind");
        let identity = handler.identity().to_owned();

        // The first drain check is due immediately and errors out.
        let result = handler.run(Arc::new(AtomicBool::new(false)));
        assert!(result.is_err(), "drain check failure should surface");
        assert!(!inner
            .list_identities(ROLE)
            .expect("list should succeed")
            .contains(&identity));
    }

    #[test]
    fn full_queue_withholds_the_ack() {
        let queue = WorkQueue::with_capacity(1);
        queue
            .try_push("{\"event\":\"occupant\"}".to_owned())
            .expect("push should succeed");

        let job = Envelope::job("pulse:workers:127.0.0.1:5555", 4, "{\"event\":\"late\"}");
        let action = evaluate_inbound(&job, &queue);
        assert!(matches!(action, InboundAction::Drop { .. }));
    }

    #[test]
    fn unexpected_reply_verbs_are_dropped() {
        let queue = WorkQueue::with_capacity(1);
        let pong = Envelope::pong("pulse:workers:127.0.0.1:5555", 4);
        assert!(matches!(
            evaluate_inbound(&pong, &queue),
            InboundAction::Drop { .. }
        ));
    }
}
