// tests/integration/unix_socket_test.rs

use super::test_helpers::{FcgiClient, LogEvent, TestServer, simple_request, wait_until};
use fcgi_reactor::LOCAL_SOCKETS_SUPPORTED;
use fcgi_reactor::core::protocol::RecordKind;
use std::os::unix::net::UnixStream;

#[test]
fn test_local_sockets_are_supported_on_unix() {
    assert!(LOCAL_SOCKETS_SUPPORTED);
}

#[test]
fn test_request_over_local_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fcgi.sock");

    let ctx = TestServer::bound();
    ctx.server.bind_unix(&path).unwrap();
    ctx.server.events().on_stdin(|request, record| {
        if record.is_stream_end() {
            let name = request.param("SCRIPT_NAME").unwrap_or_default();
            request.write_stdout(format!("\r\n{name}").as_bytes())?;
            request.end(0)?;
        }
        Ok(())
    });
    ctx.start();

    let mut client = FcgiClient::new_unix(UnixStream::connect(&path).unwrap());
    client
        .send(&simple_request(5, &[("SCRIPT_NAME", "/local")]))
        .unwrap();
    let records = client.read_until_closed();
    assert_eq!(records.first().map(|r| r.kind), Some(RecordKind::Stdout));
    assert!(records[0].content.ends_with(b"/local"));
    assert_eq!(records.last().map(|r| r.kind), Some(RecordKind::EndRequest));

    assert!(wait_until(|| ctx.logger.normal_closures() == 1));
    assert_eq!(
        ctx.logger
            .count(|e| matches!(e, LogEvent::Received { .. })),
        1
    );

    ctx.server.dispose();
    assert!(!path.exists());
}

#[test]
fn test_bind_unix_fails_for_missing_directory() {
    let ctx = TestServer::bound();
    assert!(
        ctx.server
            .bind_unix("/nonexistent-dir/for/fcgi.sock")
            .is_err()
    );
}
