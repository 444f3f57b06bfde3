// tests/integration/lifecycle_test.rs

use super::test_helpers::{
    FcgiClient, LogEvent, TestServer, begin, init_tracing, simple_request, wait_until,
};
use fcgi_reactor::FcgiServer;
use fcgi_reactor::config::ServerOptions;
use fcgi_reactor::core::FcgiError;
use fcgi_reactor::core::protocol::{Record, RecordKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[test]
fn test_start_without_bound_socket_fails() {
    init_tracing();
    let server = FcgiServer::new(ServerOptions::default()).unwrap();
    let err = server.start(true).unwrap_err();
    assert!(matches!(err, FcgiError::InvalidState(_)));
    assert!(!server.is_running());
    let err = server.start(false).unwrap_err();
    assert!(matches!(err, FcgiError::InvalidState(_)));
    assert!(!server.is_running());
}

#[test]
fn test_start_and_stop_emit_lifecycle_events() {
    let ctx = TestServer::started();
    assert!(ctx.server.is_running());
    assert!(matches!(
        ctx.server.start(true),
        Err(FcgiError::InvalidState(_))
    ));

    ctx.server.stop();
    ctx.server.stop();
    assert!(!ctx.server.is_running());
    assert_eq!(ctx.logger.count(|e| *e == LogEvent::Started), 1);
    assert_eq!(ctx.logger.count(|e| *e == LogEvent::Stopped), 1);
}

#[test]
fn test_registry_tracks_accepted_connections() {
    let ctx = TestServer::started();
    let c1 = ctx.connect();
    let _c2 = ctx.connect();
    let _c3 = ctx.connect();
    assert!(ctx.wait_for_connections(3));
    assert_eq!(
        ctx.logger
            .count(|e| matches!(e, LogEvent::Received { .. })),
        3
    );

    drop(c1);
    assert!(ctx.wait_for_connections(2));
    assert!(wait_until(|| ctx.logger.abrupt_closures().len() == 1));
}

#[test]
fn test_connection_closed_before_begin_has_no_request_context() {
    let ctx = TestServer::started();
    let client = ctx.connect();
    assert!(ctx.wait_for_connections(1));
    drop(client);

    assert!(ctx.wait_for_connections(0));
    assert!(wait_until(|| ctx.logger.abrupt_closures().len() == 1));
    let (_, request_id) = ctx.logger.abrupt_closures()[0];
    assert_eq!(request_id, None);
    assert_eq!(ctx.logger.normal_closures(), 0);
}

#[test]
fn test_stop_closes_every_open_connection_abruptly() {
    let ctx = TestServer::started();
    let mut clients: Vec<_> = (0..4).map(|_| ctx.connect()).collect();
    assert!(ctx.wait_for_connections(4));

    ctx.server.stop();
    assert_eq!(ctx.server.connection_count(), 0);
    assert_eq!(ctx.logger.abrupt_closures().len(), 4);
    for client in clients.iter_mut() {
        assert!(client.is_closed_by_server());
    }

    ctx.server.dispose();
    ctx.server.dispose();
    assert_eq!(ctx.logger.abrupt_closures().len(), 4);
    assert_eq!(ctx.logger.count(|e| *e == LogEvent::Shutdown), 1);
    assert_eq!(ctx.logger.count(|e| *e == LogEvent::Stopped), 1);
}

#[test]
fn test_stop_reports_request_context_for_begun_requests() {
    let ctx = TestServer::bound();
    let begun = Arc::new(AtomicBool::new(false));
    let flag = begun.clone();
    ctx.server.events().on_begin_request(move |_, _| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    ctx.start();

    let mut client = ctx.connect();
    client.send(&[begin(3)]).unwrap();
    assert!(wait_until(|| begun.load(Ordering::SeqCst)));

    ctx.server.stop();
    let closures = ctx.logger.abrupt_closures();
    assert_eq!(closures.len(), 1);
    assert_eq!(closures[0].1, Some(3));
}

#[test]
fn test_restart_requires_a_new_bind() {
    let ctx = TestServer::started();
    ctx.server.stop();

    assert!(matches!(
        ctx.server.start(true),
        Err(FcgiError::InvalidState(_))
    ));

    let addr = ctx.server.bind("127.0.0.1:0").unwrap();
    ctx.server.start(true).unwrap();
    let _client = std::net::TcpStream::connect(addr).unwrap();
    assert!(ctx.wait_for_connections(1));
    ctx.server.stop();
    assert_eq!(ctx.logger.count(|e| *e == LogEvent::Started), 2);
}

#[test]
fn test_foreground_start_returns_after_stop() {
    let ctx = TestServer::bound();
    let server = Arc::new(ctx.server);
    let runner = {
        let server = server.clone();
        thread::spawn(move || server.start(false))
    };
    assert!(wait_until(|| server.is_running()));

    let mut client = FcgiClient::new(std::net::TcpStream::connect(ctx.addr).unwrap());
    assert!(wait_until(|| server.connection_count() == 1));

    server.stop();
    assert!(runner.join().unwrap().is_ok());
    assert!(client.is_closed_by_server());
    assert!(!server.is_running());
}

#[test]
fn test_dispose_releases_listeners_and_rejects_reuse() {
    let ctx = TestServer::started();
    let addr = ctx.addr;
    ctx.server.dispose();

    assert!(!ctx.server.is_running());
    assert!(std::net::TcpStream::connect(addr).is_err());
    assert!(matches!(
        ctx.server.bind("127.0.0.1:0"),
        Err(FcgiError::InvalidState(_))
    ));
    assert!(matches!(
        ctx.server.start(true),
        Err(FcgiError::InvalidState(_))
    ));
}

#[test]
fn test_independent_servers_in_one_process() {
    let a = TestServer::started();
    let b = TestServer::started();
    let mut client = b.connect();
    client.send(&simple_request(1, &[])).unwrap();
    assert!(b.wait_for_connections(1));
    assert_eq!(a.server.connection_count(), 0);
    a.server.stop();
    assert!(b.server.is_running());
}

#[test]
fn test_max_connections_refuses_extra_clients() {
    let ctx = TestServer::bound_with(ServerOptions {
        max_connections: 1,
        ..ServerOptions::default()
    });
    ctx.start();
    let _first = ctx.connect();
    assert!(ctx.wait_for_connections(1));

    let mut second = ctx.connect();
    assert!(second.is_closed_by_server());
    assert_eq!(ctx.server.connection_count(), 1);
}

#[test]
fn test_reactor_survives_and_escalates_repeated_faults() {
    let ctx = TestServer::bound_with(ServerOptions {
        fault_escalation_threshold: 3,
        ..ServerOptions::default()
    });
    ctx.server.events().on_stdin(|request, record| {
        if record.is_stream_end() {
            request.end(0)?;
        }
        Ok(())
    });
    ctx.logger.panic_on_invalid_records();
    ctx.start();

    // Every bad request faults at the reactor boundary, with clean accept
    // turns in between.
    let mut faulty = Vec::new();
    for n in 1..=3u16 {
        let mut client = ctx.connect();
        client
            .send(&[begin(n), Record::new(RecordKind::Unknown(42), n, "")])
            .unwrap();
        faulty.push(client);
        assert!(wait_until(|| {
            ctx.logger
                .server_errors_containing("Unexpected fault while servicing token")
                == n as usize
        }));
    }
    assert!(wait_until(|| {
        ctx.logger.server_errors_containing("Reactor fault escalation") == 1
    }));
    assert!(ctx.server.is_running());

    let mut healthy = ctx.connect();
    healthy.send(&simple_request(9, &[])).unwrap();
    let records = healthy.read_until_closed();
    assert_eq!(records.last().map(|r| r.kind), Some(RecordKind::EndRequest));
    assert!(wait_until(|| ctx.logger.normal_closures() == 1));
    assert_eq!(
        ctx.logger.server_errors_containing("Reactor fault escalation"),
        1
    );
}
