// src/server/pump.rs

//! The record pump: one bounded read per readiness report, decoding, and
//! routing of the resulting records to the request and the event dispatcher.

use super::ServerShared;
use crate::connection::ConnectionEntry;
use crate::core::events::EventKind;
use crate::core::metrics;
use crate::core::protocol::record::{
    FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS, HEADER_LEN, parse_name_value_pairs,
    put_name_value_pair,
};
use crate::core::protocol::{BeginRequestBody, Record, RecordCodec, RecordKind};
use crate::core::{FcgiError, Result};
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// How a receive-side I/O error affects the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReceiveError {
    /// A race with a concurrent closure or a spurious wakeup.
    Benign,
    /// The peer reset or aborted the connection.
    PeerClosed,
    /// Anything else. Propagates to the reactor boundary.
    Fatal,
}

pub(crate) fn classify_receive_error(e: &io::Error) -> ReceiveError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::NotConnected => {
            ReceiveError::Benign
        }
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ReceiveError::PeerClosed,
        _ => ReceiveError::Fatal,
    }
}

/// What the pump does after routing one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Continue,
    Invalid,
    Aborted,
}

/// Services one readiness report for `entry`.
pub(crate) fn pump_once(
    shared: &Arc<ServerShared>,
    entry: &Arc<ConnectionEntry>,
    buf: &mut [u8],
) -> Result<()> {
    match entry.stream().read(buf) {
        Ok(0) => {
            // A lone zero-length read is inconclusive; a second one in a row
            // means the peer is gone.
            if entry.note_zero_read() >= 2 {
                debug!("Connection {} reached end of stream", entry.info());
                shared.close_abruptly(entry);
            } else {
                entry.rearm(&shared.poll_registry)?;
            }
            Ok(())
        }
        Ok(n) => {
            entry.note_data_read();
            process_batch(shared, entry, &buf[..n]);
            if !entry.request().is_closed() {
                entry.rearm(&shared.poll_registry)?;
            }
            Ok(())
        }
        Err(e) => match classify_receive_error(&e) {
            ReceiveError::Benign => {
                if e.kind() == io::ErrorKind::Interrupted {
                    entry.rearm(&shared.poll_registry)?;
                }
                Ok(())
            }
            ReceiveError::PeerClosed => {
                debug!("Connection {} closed by peer: {}", entry.info(), e);
                shared.close_abruptly(entry);
                Ok(())
            }
            ReceiveError::Fatal => Err(e.into()),
        },
    }
}

/// Feeds `chunk` to the connection's decoder and routes every record it
/// completes, in order, until the batch ends or the connection closes.
fn process_batch(shared: &Arc<ServerShared>, entry: &Arc<ConnectionEntry>, chunk: &[u8]) {
    let mut decoder = entry.decoder().lock();
    let mut undecodable = None;
    for item in decoder.feed(chunk) {
        // A handler may have ended or closed the request mid-batch.
        if entry.request().is_closed() {
            break;
        }
        let record = match item {
            Ok(record) => record,
            Err(e) => {
                undecodable = Some(e);
                break;
            }
        };
        metrics::RECORDS_PROCESSED_TOTAL.inc();

        match route_record(shared, entry, &record) {
            Ok(Verdict::Continue) => {}
            Ok(Verdict::Invalid) => {
                reject_record(shared, entry, &record);
                break;
            }
            Ok(Verdict::Aborted) => {
                debug!(
                    "Request {} aborted by the web server on connection {}",
                    record.request_id,
                    entry.info()
                );
                shared.close_abruptly(entry);
                break;
            }
            Err(e @ FcgiError::Handler(_)) => {
                metrics::HANDLER_FAULTS_TOTAL.inc();
                let description = format!(
                    "Handler failed on {} for connection {}",
                    record.kind,
                    entry.info()
                );
                warn!("{}: {}", description, e);
                if let Some(logger) = shared.logger() {
                    logger.server_error(&e, &description);
                }
                shared.close_abruptly(entry);
                break;
            }
            Err(e) if e.is_protocol_violation() => {
                debug!("Rejecting {} on connection {}: {}", record, entry.info(), e);
                reject_record(shared, entry, &record);
                break;
            }
            Err(e) => {
                debug!(
                    "Failed to process {} on connection {}: {}",
                    record,
                    entry.info(),
                    e
                );
                shared.close_abruptly(entry);
                break;
            }
        }
    }

    if let Some(e) = undecodable {
        debug!("Undecodable input on connection {}: {}", entry.info(), e);
        let record = undecodable_record(decoder.take_rejected());
        drop(decoder);
        reject_record(shared, entry, &record);
    }
}

/// Stands in for the bytes that could not be framed: the type code and
/// request id are read from where a header would hold them, and the content
/// is the offending header itself.
fn undecodable_record(mut raw: Bytes) -> Record {
    let kind = RecordKind::Unknown(raw.get(1).copied().unwrap_or(0));
    let request_id = match raw.get(2..4) {
        Some(id) => u16::from_be_bytes([id[0], id[1]]),
        None => 0,
    };
    raw.truncate(HEADER_LEN);
    Record::new(kind, request_id, raw)
}

fn reject_record(shared: &Arc<ServerShared>, entry: &Arc<ConnectionEntry>, record: &Record) {
    warn!("Invalid record {} on connection {}", record, entry.info());
    metrics::INVALID_RECORDS_TOTAL.inc();
    if let Some(logger) = shared.logger() {
        logger.invalid_record(entry.info(), record);
    }
    shared.close_abruptly(entry);
}

fn route_record(
    shared: &Arc<ServerShared>,
    entry: &Arc<ConnectionEntry>,
    record: &Record,
) -> Result<Verdict> {
    let request = entry.request();
    match record.kind {
        RecordKind::BeginRequest => {
            if record.is_management() {
                return Ok(Verdict::Invalid);
            }
            let body = BeginRequestBody::parse(&record.content)?;
            request.begin(record.request_id, body, shared.closure_hook())?;
            shared
                .events
                .dispatch(EventKind::BeginRequest, request, record)?;
        }
        RecordKind::Params | RecordKind::Stdin | RecordKind::Stdout => {
            if !request.is_active_for(record.request_id) {
                return Ok(Verdict::Invalid);
            }
            let options = &shared.options;
            match record.kind {
                RecordKind::Params => {
                    request.append_params(&record.content, options.max_params_bytes)?
                }
                RecordKind::Stdin => {
                    request.append_stdin(&record.content, options.max_stdin_bytes)?
                }
                _ => {}
            }
            if let Some(kind) = EventKind::for_record(record.kind) {
                shared.events.dispatch(kind, request, record)?;
            }
        }
        RecordKind::GetValues if record.is_management() => {
            answer_get_values(shared, entry, record)?;
        }
        RecordKind::AbortRequest if request.is_active_for(record.request_id) => {
            return Ok(Verdict::Aborted);
        }
        _ => return Ok(Verdict::Invalid),
    }
    Ok(Verdict::Continue)
}

/// Replies to a GET_VALUES management record with the variables this server
/// knows. Unknown names are left out of the reply.
fn answer_get_values(
    shared: &Arc<ServerShared>,
    entry: &Arc<ConnectionEntry>,
    record: &Record,
) -> Result<()> {
    let max_conns = shared.options.max_connections.to_string();
    let mut reply = BytesMut::new();
    for (name, _) in parse_name_value_pairs(&record.content)? {
        let value = match std::str::from_utf8(&name) {
            Ok(FCGI_MAX_CONNS) | Ok(FCGI_MAX_REQS) => max_conns.as_str(),
            Ok(FCGI_MPXS_CONNS) => "0",
            _ => continue,
        };
        put_name_value_pair(&mut reply, &name, value.as_bytes());
    }
    let bytes = RecordCodec::encode_to_vec(Record::new(
        RecordKind::GetValuesResult,
        record.request_id,
        reply.freeze(),
    ))?;
    entry.stream().write_all(&bytes)?;
    Ok(())
}
