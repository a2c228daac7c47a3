//! The dispatcher reactor: one thread driving every worker connection,
//! the event channel, and registry discovery.
//!
//! Each loop iteration handles at most one queued event, then drains link
//! replies, advances per-connection timers, and refreshes the worker set
//! from the registry on its own cadence. Idle iterations sleep for the
//! poll interval.

pub mod connection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::json;

use crate::archive::ArchiveWriter;
use crate::config::{ArchiveConfig, DispatcherConfig, RegistryConfig};
use crate::logging::Logger;
use crate::registry::{dial_address, Registry};
use crate::transport::peer::PeerConnector;
use crate::wire::envelope::Control;

use self::connection::{ConnectionSettings, PollError, ReplyOutcome, TickAction, WorkerConnection};

const LOG_CONTEXT: &str = "dispatcher";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobTicket {
    pub payload: String,
    pub attempts: u32,
}

impl JobTicket {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            attempts: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatcherEvent {
    /// Dial and adopt a worker identity immediately.
    Connect(String),
    /// Drop a worker and park its identity in the inactive set.
    Disconnect(String),
    /// Probe one worker out of cadence.
    Ping(String),
    /// Deliver a payload to some live worker.
    Job(JobTicket),
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoWorkerPolicy {
    Requeue,
    Drop,
    Archive,
}

impl NoWorkerPolicy {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value {
            "requeue" => Some(Self::Requeue),
            "drop" => Some(Self::Drop),
            "archive" => Some(Self::Archive),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    pub role_key: String,
    pub poll_interval: StdDuration,
    pub server_check_interval: Duration,
    pub connection: ConnectionSettings,
    pub no_worker_policy: NoWorkerPolicy,
    pub job_retry_max_attempts: u32,
}

impl DispatcherSettings {
    pub fn from_config(
        dispatcher: &DispatcherConfig,
        registry: &RegistryConfig,
        archive: &ArchiveConfig,
    ) -> Option<Self> {
        let no_worker_policy = NoWorkerPolicy::from_config_value(&archive.no_worker_policy)?;
        Some(Self {
            role_key: registry.role_key.clone(),
            poll_interval: StdDuration::from_millis(dispatcher.poll_interval_ms),
            server_check_interval: Duration::seconds(dispatcher.server_check_interval_secs as i64),
            connection: ConnectionSettings {
                msg_timeout: Duration::seconds(dispatcher.msg_timeout_secs as i64),
                ping_interval: Duration::seconds(dispatcher.ping_interval_secs as i64),
                ping_fail_max: dispatcher.ping_fail_max,
            },
            no_worker_policy,
            job_retry_max_attempts: dispatcher.job_retry_max_attempts,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Iteration {
    pub busy: bool,
    pub shutdown: bool,
}

pub struct Dispatcher<C: PeerConnector> {
    connector: C,
    registry: Box<dyn Registry>,
    logger: Arc<Logger>,
    archive: Option<Arc<ArchiveWriter>>,
    settings: DispatcherSettings,
    connections: HashMap<String, WorkerConnection<C::Link>>,
    rr_order: Vec<String>,
    rr_cursor: usize,
    assigned_attempts: HashMap<String, u32>,
    events_tx: Sender<DispatcherEvent>,
    events_rx: Receiver<DispatcherEvent>,
    next_discovery_at: DateTime<Utc>,
}

impl<C: PeerConnector> Dispatcher<C> {
    pub fn new(
        connector: C,
        registry: Box<dyn Registry>,
        logger: Arc<Logger>,
        archive: Option<Arc<ArchiveWriter>>,
        settings: DispatcherSettings,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            connector,
            registry,
            logger,
            archive,
            settings,
            connections: HashMap::new(),
            rr_order: Vec::new(),
            rr_cursor: 0,
            assigned_attempts: HashMap::new(),
            events_tx,
            events_rx,
            next_discovery_at: Utc::now(),
        }
    }

    /// Handle for feeding events from outside the reactor thread.
    pub fn event_sender(&self) -> Sender<DispatcherEvent> {
        self.events_tx.clone()
    }

    pub fn run(&mut self, stop: Arc<AtomicBool>) {
        self.logger.info(Some(LOG_CONTEXT), "dispatch loop started");
        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let outcome = self.run_iteration(Utc::now());
            if outcome.shutdown {
                break;
            }
            if !outcome.busy {
                thread::sleep(self.settings.poll_interval);
            }
        }
        self.broadcast_shutdown();
        self.logger.info(Some(LOG_CONTEXT), "dispatch loop stopped");
    }

    /// One reactor pass at the given instant. Time is a parameter so the
    /// timeout and cadence paths are testable without sleeping.
    pub fn run_iteration(&mut self, now: DateTime<Utc>) -> Iteration {
        let mut busy = false;
        let mut shutdown = false;

        if let Ok(event) = self.events_rx.try_recv() {
            busy = true;
            match event {
                DispatcherEvent::Connect(identity) => self.connect_worker(&identity, now),
                DispatcherEvent::Disconnect(identity) => self.evict_worker(&identity, true),
                DispatcherEvent::Ping(identity) => self.ping_worker(&identity, now),
                DispatcherEvent::Job(ticket) => self.dispatch_job(ticket, now),
                DispatcherEvent::Shutdown => shutdown = true,
            }
        }

        let handled = self.poll_replies(now);
        busy |= handled > 0;
        // Timeout bookkeeping only runs on quiet passes; a fresh reply has
        // already reset the deadlines it would inspect.
        if handled == 0 {
            self.tick_connections(now);
        }

        if now >= self.next_discovery_at {
            self.discover_workers(now);
        }

        Iteration { busy, shutdown }
    }

    fn poll_replies(&mut self, now: DateTime<Utc>) -> usize {
        let ids: Vec<String> = self.connections.keys().cloned().collect();
        let mut handled = 0;

        for id in ids {
            loop {
                let polled = match self.connections.get_mut(&id) {
                    Some(conn) => conn.poll_reply(),
                    None => break,
                };
                match polled {
                    Ok(Some(reply)) => {
                        handled += 1;
                        let outcome = self
                            .connections
                            .get_mut(&id)
                            .map(|conn| conn.on_reply(&reply, now));
                        match outcome {
                            Some(ReplyOutcome::Accepted(control)) => {
                                if control == Control::Ok {
                                    self.assigned_attempts.remove(&id);
                                }
                                self.logger.debug(
                                    Some(LOG_CONTEXT),
                                    &format!("'{control}' reply accepted from {id}"),
                                );
                            }
                            Some(ReplyOutcome::Stale { expected, received }) => {
                                self.logger.log(
                                    crate::logging::LogLevel::Warn,
                                    Some(LOG_CONTEXT),
                                    &format!("reply received out of sequence from {id}"),
                                    Some(json!({"expected": expected, "received": received})),
                                );
                            }
                            None => break,
                        }
                    }
                    Ok(None) => break,
                    Err(PollError::Envelope(error)) => {
                        self.logger.warn(
                            Some(LOG_CONTEXT),
                            &format!("dropping reply from {id}: {error}"),
                        );
                    }
                    Err(PollError::Link(error)) => {
                        self.logger.warn(
                            Some(LOG_CONTEXT),
                            &format!("link to {id} failed: {error}"),
                        );
                        self.evict_worker(&id, true);
                        break;
                    }
                }
            }
        }

        handled
    }

    fn tick_connections(&mut self, now: DateTime<Utc>) {
        let ids: Vec<String> = self.connections.keys().cloned().collect();
        for id in ids {
            let ticked = match self.connections.get_mut(&id) {
                Some(conn) => conn.tick(now),
                None => continue,
            };
            match ticked {
                Ok(TickAction::Idle) => {}
                Ok(TickAction::Pinged) => {
                    self.logger
                        .debug(Some(LOG_CONTEXT), &format!("pinged {id}"));
                }
                Ok(TickAction::RePinged) => {
                    self.logger
                        .warn(Some(LOG_CONTEXT), &format!("ping to {id} expired, retrying"));
                }
                Ok(TickAction::Evict) => {
                    self.logger.warn(
                        Some(LOG_CONTEXT),
                        &format!("{id} exhausted its ping failure budget"),
                    );
                    self.evict_worker(&id, true);
                }
                Ok(TickAction::JobTimedOut { payload }) => {
                    self.logger.warn(
                        Some(LOG_CONTEXT),
                        &format!("job on {id} timed out, redelivering"),
                    );
                    let attempts = self.assigned_attempts.remove(&id).unwrap_or(0);
                    self.redeliver(payload, attempts + 1);
                }
                Err(error) => {
                    self.logger.warn(
                        Some(LOG_CONTEXT),
                        &format!("probe send to {id} failed: {error}"),
                    );
                    self.evict_worker(&id, true);
                }
            }
        }
    }

    fn discover_workers(&mut self, now: DateTime<Utc>) {
        self.next_discovery_at = now + self.settings.server_check_interval;
        let role = self.settings.role_key.clone();

        let identities = match self.registry.list_identities(&role) {
            Ok(identities) => identities,
            Err(error) => {
                self.logger
                    .error(Some(LOG_CONTEXT), &format!("registry listing failed: {error}"));
                return;
            }
        };

        for identity in identities {
            let inactive = match self.registry.is_inactive(&role, &identity) {
                Ok(inactive) => inactive,
                Err(error) => {
                    self.logger.error(
                        Some(LOG_CONTEXT),
                        &format!("registry inactive check failed: {error}"),
                    );
                    continue;
                }
            };

            if inactive {
                if self.connections.contains_key(&identity) {
                    self.logger.info(
                        Some(LOG_CONTEXT),
                        &format!("{identity} was parked, dropping its connection"),
                    );
                    self.evict_worker(&identity, false);
                }
                continue;
            }

            if !self.connections.contains_key(&identity) {
                self.connect_worker(&identity, now);
            }
        }
    }

    fn connect_worker(&mut self, identity: &str, now: DateTime<Utc>) {
        if self.connections.contains_key(identity) {
            return;
        }
        let role = self.settings.role_key.clone();

        let Some(address) = dial_address(&role, identity).map(str::to_owned) else {
            self.logger.warn(
                Some(LOG_CONTEXT),
                &format!("identity '{identity}' does not match role '{role}', parking it"),
            );
            self.park_identity(identity);
            return;
        };

        match self.connector.connect(&address) {
            Ok(link) => {
                let mut conn =
                    WorkerConnection::new(identity, link, self.settings.connection, now);
                if let Err(error) = conn.ping(true, now) {
                    self.logger.warn(
                        Some(LOG_CONTEXT),
                        &format!("initial probe to {identity} failed: {error}"),
                    );
                    self.park_identity(identity);
                    return;
                }
                self.logger
                    .info(Some(LOG_CONTEXT), &format!("connected to {identity}"));
                self.connections.insert(identity.to_owned(), conn);
                self.rr_order.push(identity.to_owned());
            }
            Err(error) => {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("dial to {identity} failed: {error}"),
                );
                self.park_identity(identity);
            }
        }
    }

    fn ping_worker(&mut self, identity: &str, now: DateTime<Utc>) {
        let Some(conn) = self.connections.get_mut(identity) else {
            self.logger.warn(
                Some(LOG_CONTEXT),
                &format!("ping requested for unknown worker {identity}"),
            );
            return;
        };
        // A forced probe would displace the outstanding job and leave its
        // acknowledgment stale.
        if conn.has_job_in_flight() {
            self.logger.debug(
                Some(LOG_CONTEXT),
                &format!("probe for {identity} skipped, a job is outstanding"),
            );
            return;
        }
        let pinged = conn.ping(true, now);
        if let Err(error) = pinged {
            self.logger.warn(
                Some(LOG_CONTEXT),
                &format!("probe send to {identity} failed: {error}"),
            );
            self.evict_worker(identity, true);
        }
    }

    fn dispatch_job(&mut self, ticket: JobTicket, now: DateTime<Utc>) {
        let count = self.rr_order.len();
        for step in 0..count {
            let index = (self.rr_cursor + step) % count;
            let id = self.rr_order[index].clone();
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            if !conn.is_available() {
                continue;
            }
            match conn.request(&ticket.payload, now) {
                Ok(true) => {
                    self.assigned_attempts.insert(id.clone(), ticket.attempts);
                    self.rr_cursor = (index + 1) % count;
                    self.logger
                        .debug(Some(LOG_CONTEXT), &format!("job dispatched to {id}"));
                    return;
                }
                Ok(false) => continue,
                Err(error) => {
                    self.logger.warn(
                        Some(LOG_CONTEXT),
                        &format!("job send to {id} failed: {error}"),
                    );
                    self.evict_worker(&id, true);
                    return self.dispatch_job(ticket, now);
                }
            }
        }
        self.handle_no_worker(ticket);
    }

    fn handle_no_worker(&mut self, ticket: JobTicket) {
        match self.settings.no_worker_policy {
            NoWorkerPolicy::Requeue => {
                self.logger
                    .debug(Some(LOG_CONTEXT), "no live worker available, requeueing job");
                self.redeliver(ticket.payload, ticket.attempts + 1);
            }
            NoWorkerPolicy::Drop => {
                self.logger
                    .warn(Some(LOG_CONTEXT), "no live worker available, dropping job");
            }
            NoWorkerPolicy::Archive => {
                self.archive_payload(&ticket.payload, "no-worker");
            }
        }
    }

    fn redeliver(&mut self, payload: String, attempts: u32) {
        if attempts >= self.settings.job_retry_max_attempts {
            self.logger.warn(
                Some(LOG_CONTEXT),
                &format!("delivery attempts exhausted after {attempts} tries"),
            );
            self.archive_payload(&payload, "retries-exhausted");
            return;
        }
        let _ = self
            .events_tx
            .send(DispatcherEvent::Job(JobTicket { payload, attempts }));
    }

    fn archive_payload(&self, payload: &str, reason: &str) {
        match &self.archive {
            Some(archive) => match archive.append(payload, reason) {
                Ok(id) => self.logger.info(
                    Some(LOG_CONTEXT),
                    &format!("payload archived as {id} ({reason})"),
                ),
                Err(error) => self
                    .logger
                    .error(Some(LOG_CONTEXT), &format!("{error}")),
            },
            None => self.logger.warn(
                Some(LOG_CONTEXT),
                &format!("archive disabled, payload dropped ({reason})"),
            ),
        }
    }

    fn evict_worker(&mut self, identity: &str, park: bool) {
        let Some(mut conn) = self.connections.remove(identity) else {
            return;
        };
        if let Some(payload) = conn.take_in_flight_payload() {
            let attempts = self.assigned_attempts.remove(identity).unwrap_or(0);
            self.redeliver(payload, attempts + 1);
        }
        self.assigned_attempts.remove(identity);
        self.rr_order.retain(|entry| entry != identity);
        if self.rr_cursor >= self.rr_order.len() {
            self.rr_cursor = 0;
        }
        if park {
            self.park_identity(identity);
        }
        self.logger
            .info(Some(LOG_CONTEXT), &format!("worker {identity} evicted"));
    }

    fn park_identity(&mut self, identity: &str) {
        let role = self.settings.role_key.clone();
        if let Err(error) = self.registry.mark_inactive(&role, identity) {
            self.logger.error(
                Some(LOG_CONTEXT),
                &format!("failed to park {identity}: {error}"),
            );
        }
    }

    fn broadcast_shutdown(&mut self) {
        let ids: Vec<String> = self.connections.keys().cloned().collect();
        for id in ids {
            if let Some(conn) = self.connections.get_mut(&id) {
                if let Err(error) = conn.send_shutdown() {
                    self.logger.debug(
                        Some(LOG_CONTEXT),
                        &format!("shutdown notice to {id} failed: {error}"),
                    );
                }
            }
        }
    }
}
