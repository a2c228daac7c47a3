//! Per-worker connection state machine.
//!
//! At most one request is in flight per worker. The dispatcher owns the
//! sequence counter; a reply is accepted only when its echoed sequence
//! matches the outstanding one. A ping optimistically charges one error
//! and marks the worker not alive, so a lost ping is already counted when
//! its deadline passes.

use std::fmt;
use std::io;

use chrono::{DateTime, Duration, Utc};

use crate::transport::peer::{LinkError, PeerLink};
use crate::wire::envelope::{Control, Envelope, EnvelopeError};

#[derive(Clone, Copy, Debug)]
pub struct ConnectionSettings {
    pub msg_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_fail_max: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReplyOutcome {
    Accepted(Control),
    Stale { expected: u64, received: u64 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum TickAction {
    Idle,
    Pinged,
    RePinged,
    Evict,
    JobTimedOut { payload: String },
}

#[derive(Debug)]
pub enum PollError {
    Link(LinkError),
    Envelope(EnvelopeError),
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Link(source) => write!(f, "{source}"),
            Self::Envelope(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for PollError {}

pub struct WorkerConnection<L: PeerLink> {
    id: String,
    link: L,
    alive: bool,
    in_flight: Option<Envelope>,
    sequence: u64,
    expires_at: Option<DateTime<Utc>>,
    error_count: u32,
    last_ping_at: DateTime<Utc>,
    settings: ConnectionSettings,
}

impl<L: PeerLink> WorkerConnection<L> {
    pub fn new(id: impl Into<String>, link: L, settings: ConnectionSettings, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            link,
            alive: false,
            in_flight: None,
            sequence: 0,
            expires_at: None,
            error_count: 0,
            last_ping_at: now,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_available(&self) -> bool {
        self.alive && self.in_flight.is_none()
    }

    pub fn has_job_in_flight(&self) -> bool {
        matches!(&self.in_flight, Some(envelope) if envelope.control == Control::Job)
    }

    /// Recovers the payload of an in-flight job, e.g. when the link died
    /// and the job must go to another worker.
    pub fn take_in_flight_payload(&mut self) -> Option<String> {
        match self.in_flight.take() {
            Some(envelope) if envelope.control == Control::Job => envelope.payload,
            other => {
                self.in_flight = other;
                None
            }
        }
    }

    /// Sends a job if the worker is alive and idle. Returns whether the
    /// job was taken.
    pub fn request(&mut self, payload: &str, now: DateTime<Utc>) -> io::Result<bool> {
        if !self.is_available() {
            return Ok(false);
        }

        self.sequence += 1;
        let envelope = Envelope::job(self.id.clone(), self.sequence, payload);
        self.link.send_envelope(&envelope)?;
        self.expires_at = Some(now + self.settings.msg_timeout);
        self.in_flight = Some(envelope);
        Ok(true)
    }

    /// Sends a liveness probe. Without `force` the ping is skipped while a
    /// request is outstanding or the ping interval has not elapsed.
    /// Charges one error up front; the matching reply refunds it.
    pub fn ping(&mut self, force: bool, now: DateTime<Utc>) -> io::Result<bool> {
        if !force
            && (self.in_flight.is_some() || now - self.last_ping_at < self.settings.ping_interval)
        {
            return Ok(false);
        }

        self.sequence += 1;
        self.error_count += 1;
        self.alive = false;
        let envelope = Envelope::ping(self.id.clone(), self.sequence);
        self.link.send_envelope(&envelope)?;
        self.expires_at = Some(now + self.settings.msg_timeout);
        self.in_flight = Some(envelope);
        self.last_ping_at = now;
        Ok(true)
    }

    /// Matches a reply against the outstanding request. Anything that does
    /// not echo the current sequence is stale and must not touch state.
    pub fn on_reply(&mut self, reply: &Envelope, now: DateTime<Utc>) -> ReplyOutcome {
        if self.in_flight.is_none() || reply.sequence != self.sequence {
            return ReplyOutcome::Stale {
                expected: self.sequence,
                received: reply.sequence,
            };
        }

        self.in_flight = None;
        self.expires_at = None;
        self.error_count = 0;
        self.alive = true;
        self.last_ping_at = now;
        ReplyOutcome::Accepted(reply.control)
    }

    /// Advances timers: expires overdue requests and schedules pings.
    pub fn tick(&mut self, now: DateTime<Utc>) -> io::Result<TickAction> {
        let expired = matches!(self.expires_at, Some(deadline) if now >= deadline);
        if expired {
            let envelope = self
                .in_flight
                .take()
                .unwrap_or_else(|| Envelope::ping(self.id.clone(), self.sequence));
            self.expires_at = None;
            self.alive = false;

            if envelope.control == Control::Job {
                let payload = envelope.payload.unwrap_or_default();
                self.ping(true, now)?;
                return Ok(TickAction::JobTimedOut { payload });
            }

            if self.error_count >= self.settings.ping_fail_max {
                return Ok(TickAction::Evict);
            }
            self.ping(true, now)?;
            return Ok(TickAction::RePinged);
        }

        if self.ping(false, now)? {
            return Ok(TickAction::Pinged);
        }
        Ok(TickAction::Idle)
    }

    /// Fire-and-forget shutdown notice. No reply is expected, so the
    /// in-flight slot is left untouched.
    pub fn send_shutdown(&mut self) -> io::Result<()> {
        self.sequence += 1;
        let envelope = Envelope::shutdown(self.id.clone(), self.sequence);
        self.link.send_envelope(&envelope)
    }

    /// One decoded reply from the link, if a complete message has arrived.
    pub fn poll_reply(&mut self) -> Result<Option<Envelope>, PollError> {
        let frames = match self.link.poll_reply_frames().map_err(PollError::Link)? {
            Some(frames) => frames,
            None => return Ok(None),
        };
        Envelope::from_frames(&frames)
            .map(Some)
            .map_err(PollError::Envelope)
    }
}
