// src/core/protocol/codec.rs

//! Implements the `Encoder` and `Decoder` for FastCGI records, plus the stateful
//! per-connection `RecordDecoder` fed by the record pump.

use super::record::{FCGI_VERSION_1, HEADER_LEN, MAX_CONTENT_LEN, Record, RecordKind};
use crate::core::FcgiError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Padding aligns every record to an 8-byte boundary.
fn padding_for(content_len: usize) -> usize {
    (8 - content_len % 8) % 8
}

/// A `tokio_util::codec` implementation for encoding and decoding `Record`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordCodec;

impl Encoder<Record> for RecordCodec {
    type Error = FcgiError;

    /// Encodes a record. Content larger than a single record can carry is split
    /// across consecutive records of the same kind and request id.
    fn encode(&mut self, item: Record, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.content.is_empty() {
            put_record(dst, item.kind, item.request_id, &[]);
            return Ok(());
        }
        for chunk in item.content.chunks(MAX_CONTENT_LEN) {
            put_record(dst, item.kind, item.request_id, chunk);
        }
        Ok(())
    }
}

fn put_record(dst: &mut BytesMut, kind: RecordKind, request_id: u16, content: &[u8]) {
    let padding = padding_for(content.len());
    dst.reserve(HEADER_LEN + content.len() + padding);
    dst.put_u8(FCGI_VERSION_1);
    dst.put_u8(kind.as_u8());
    dst.put_u16(request_id);
    dst.put_u16(content.len() as u16);
    dst.put_u8(padding as u8);
    dst.put_u8(0);
    dst.extend_from_slice(content);
    dst.put_bytes(0, padding);
}

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = FcgiError;

    /// Decodes one record once its header, content and padding are all buffered.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        // Reject foreign protocols as soon as the first byte arrives.
        if src[0] != FCGI_VERSION_1 {
            return Err(FcgiError::UnsupportedVersion(src[0]));
        }
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let content_len = u16::from_be_bytes([src[4], src[5]]) as usize;
        let padding_len = src[6] as usize;
        let total = HEADER_LEN + content_len + padding_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let kind = RecordKind::from_u8(src[1]);
        let request_id = u16::from_be_bytes([src[2], src[3]]);
        src.advance(HEADER_LEN);
        let content = src.split_to(content_len).freeze();
        src.advance(padding_len);

        Ok(Some(Record {
            kind,
            request_id,
            content,
        }))
    }
}

impl RecordCodec {
    /// Encodes a record into a fresh buffer.
    pub fn encode_to_vec(record: Record) -> Result<Vec<u8>, FcgiError> {
        let mut buf = BytesMut::new();
        RecordCodec.encode(record, &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// Stateful, per-connection decoder: consumes raw byte chunks and yields the
/// records that became complete, carrying partial records over to the next feed.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    codec: RecordCodec,
    buffer: BytesMut,
    poisoned: bool,
    /// The bytes that could not be framed, kept for reporting.
    rejected: Bytes,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns a lazy iterator over the records it completed.
    ///
    /// After the first decoding error the stream cannot be resynchronised, so the
    /// decoder yields nothing further, now or on later feeds.
    pub fn feed(&mut self, chunk: &[u8]) -> Records<'_> {
        if !self.poisoned {
            self.buffer.extend_from_slice(chunk);
        }
        Records { decoder: self }
    }

    /// Bytes held back waiting for the rest of a record.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Takes the bytes buffered when decoding failed. Empty unless poisoned.
    pub fn take_rejected(&mut self) -> Bytes {
        std::mem::take(&mut self.rejected)
    }
}

/// Records produced by a single `RecordDecoder::feed` call.
pub struct Records<'a> {
    decoder: &'a mut RecordDecoder,
}

impl Iterator for Records<'_> {
    type Item = Result<Record, FcgiError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.decoder.poisoned {
            return None;
        }
        match self.decoder.codec.decode(&mut self.decoder.buffer) {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.decoder.poisoned = true;
                self.decoder.rejected = self.decoder.buffer.split().freeze();
                Some(Err(e))
            }
        }
    }
}
