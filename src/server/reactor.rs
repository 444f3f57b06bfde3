// src/server/reactor.rs

//! The single readiness loop of a server instance.

use super::{ServerShared, WAKE_TOKEN, pump};
use crate::connection::ConnectionId;
use crate::core::events::panic_message;
use crate::core::fault::{FaultLevel, FaultMonitor};
use crate::core::{FcgiError, Result, metrics};
use mio::{Events, Poll, Token};
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    buffer: Vec<u8>,
    shared: Arc<ServerShared>,
    faults: FaultMonitor,
}

impl Reactor {
    pub(crate) fn new(poll: Poll, shared: Arc<ServerShared>) -> Self {
        let options = &shared.options;
        Self {
            events: Events::with_capacity(options.max_events),
            buffer: vec![0; options.read_buffer_size],
            faults: FaultMonitor::new(options.fault_escalation_threshold, options.fault_window),
            poll,
            shared,
        }
    }

    /// Runs until the server stops, then closes whatever connections are
    /// still tracked and hands the poll instance back for a later restart.
    pub(crate) fn run(mut self) -> Poll {
        info!("Reactor loop started.");
        while self.shared.is_running() {
            let faulted = self.turn();
            let now = Instant::now();
            for _ in 0..faulted {
                self.escalate(now);
            }
            if faulted == 0
                && let Some(faults) = self.faults.record_quiet(now)
            {
                info!(
                    "Reactor recovered after {} faults; none in the last {:?}.",
                    faults,
                    self.shared.options.fault_window
                );
            }
        }

        for entry in self.shared.connections.snapshot() {
            self.shared.close_abruptly(&entry);
        }
        info!("Reactor loop exited.");
        self.poll
    }

    /// One readiness wait plus servicing of every reported socket. Returns how
    /// many faults reached the loop boundary.
    fn turn(&mut self) -> usize {
        if let Err(e) = self.poll.poll(&mut self.events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                return 0;
            }
            report_fault(&self.shared, &e.into(), "Readiness wait failed");
            return 1;
        }

        let mut faulted = 0;
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            if !self.shared.is_running() {
                break;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                service(&self.shared, token, &mut self.buffer)
            }));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => FcgiError::Internal(panic_message(panic.as_ref())),
            };
            faulted += 1;
            report_fault(
                &self.shared,
                &error,
                &format!("Unexpected fault while servicing token {}", token.0),
            );
        }
        faulted
    }

    fn escalate(&mut self, now: Instant) {
        if let FaultLevel::Escalated { faults, window } = self.faults.record_fault(now) {
            let error = FcgiError::Internal(format!(
                "{faults} reactor faults within {window:?}"
            ));
            error!("Reactor is degraded: {}", error);
            if let Some(logger) = self.shared.logger() {
                logger.server_error(&error, "Reactor fault escalation");
            }
        }
    }
}

/// Routes one ready token to the accept step or the record pump.
fn service(shared: &Arc<ServerShared>, token: Token, buffer: &mut [u8]) -> Result<()> {
    if shared.listeners.contains(token) {
        shared.accept_from(token);
        return Ok(());
    }
    // The entry may have been removed since the wait returned.
    let Some(entry) = shared.connections.get(ConnectionId(token.0)) else {
        return Ok(());
    };
    pump::pump_once(shared, &entry, buffer)
}

fn report_fault(shared: &ServerShared, error: &FcgiError, description: &str) {
    metrics::REACTOR_FAULTS_TOTAL.inc();
    warn!("{}: {}", description, error);
    if let Some(logger) = shared.logger() {
        logger.server_error(error, description);
    }
}
