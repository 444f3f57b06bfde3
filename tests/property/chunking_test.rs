// tests/property/chunking_test.rs

//! Properties of record reassembly under arbitrary byte chunking.

use crate::test_helpers::{FcgiClient, TestServer, begin, params, stdin};
use bytes::Bytes;
use fcgi_reactor::core::protocol::{Record, RecordCodec, RecordDecoder, RecordKind};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;

fn arb_record() -> impl Strategy<Value = Record> {
    let kind = prop_oneof![
        Just(RecordKind::Params),
        Just(RecordKind::Stdin),
        Just(RecordKind::Stdout),
        Just(RecordKind::Data),
    ];
    (kind, 1u16..=u16::MAX, prop::collection::vec(any::<u8>(), 0..300))
        .prop_map(|(kind, id, content)| Record::new(kind, id, Bytes::from(content)))
}

fn encode_all(records: &[Record]) -> Vec<u8> {
    records
        .iter()
        .flat_map(|r| RecordCodec::encode_to_vec(r.clone()).unwrap())
        .collect()
}

/// Splits `bytes` at the given cut points (taken modulo the length).
fn split_at_cuts(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return vec![];
    }
    let mut points: Vec<usize> = cuts.iter().map(|c| c % bytes.len()).collect();
    points.push(0);
    points.push(bytes.len());
    points.sort_unstable();
    points.dedup();
    points
        .windows(2)
        .map(|w| bytes[w[0]..w[1]].to_vec())
        .collect()
}

proptest! {
    #[test]
    fn test_chunking_does_not_change_decoded_records(
        records in prop::collection::vec(arb_record(), 1..12),
        cuts in prop::collection::vec(any::<usize>(), 0..40),
    ) {
        let bytes = encode_all(&records);
        let mut decoder = RecordDecoder::new();
        let mut decoded = Vec::new();
        for chunk in split_at_cuts(&bytes, &cuts) {
            for record in decoder.feed(&chunk) {
                decoded.push(record.unwrap());
            }
        }
        prop_assert_eq!(decoded, records);
        prop_assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_foreign_first_byte_poisons_decoder(
        first in 2u8..=u8::MAX,
        rest in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut bytes = vec![first];
        bytes.extend(rest);
        let mut decoder = RecordDecoder::new();
        let results: Vec<_> = decoder.feed(&bytes).collect();
        prop_assert_eq!(results.len(), 1);
        prop_assert!(results[0].is_err());
        prop_assert!(decoder.is_poisoned());
        prop_assert_eq!(decoder.feed(&encode_all(&[begin(1)])).count(), 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn test_live_server_sees_records_in_order_however_chunked(
        body in prop::collection::vec(any::<u8>(), 0..2000),
        cuts in prop::collection::vec(any::<usize>(), 0..20),
    ) {
        let ctx = TestServer::bound();
        let seen = Arc::new(Mutex::new(Vec::<RecordKind>::new()));
        let received = Arc::new(Mutex::new(Vec::<u8>::new()));
        {
            let seen = seen.clone();
            ctx.server.events().on_begin_request(move |_, r| {
                seen.lock().push(r.kind);
                Ok(())
            });
        }
        {
            let seen = seen.clone();
            ctx.server.events().on_params(move |_, r| {
                seen.lock().push(r.kind);
                Ok(())
            });
        }
        {
            let seen = seen.clone();
            let received = received.clone();
            ctx.server.events().on_stdin(move |request, r| {
                seen.lock().push(r.kind);
                received.lock().extend_from_slice(&r.content);
                if r.is_stream_end() {
                    request.end(0)?;
                }
                Ok(())
            });
        }
        ctx.start();

        let mut records = vec![
            begin(9),
            params(9, &[("REQUEST_METHOD", "POST")]),
            params(9, &[]),
        ];
        if !body.is_empty() {
            records.push(stdin(9, &body));
        }
        records.push(stdin(9, b""));
        let expected: Vec<RecordKind> = records.iter().map(|r| r.kind).collect();

        let mut client: FcgiClient<_> = ctx.connect();
        for chunk in split_at_cuts(&encode_all(&records), &cuts) {
            client.send_raw(&chunk).unwrap();
        }
        let reply = client.read_until_closed();

        prop_assert_eq!(reply.last().map(|r| r.kind), Some(RecordKind::EndRequest));
        prop_assert_eq!(seen.lock().clone(), expected);
        prop_assert_eq!(received.lock().clone(), body);
        ctx.server.dispose();
    }
}
