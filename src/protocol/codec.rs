//! Frame codec
//!
//! ## Frame Format
//!
//! ```text
//! +---------+--------+-------------+-----------------+
//! | version | kind   | payload len | payload         |
//! | 1 byte  | 1 byte | 4 bytes LE  | len bytes       |
//! +---------+--------+-------------+-----------------+
//! ```
//!
//! Payload fields are written in declaration order, integers little-endian:
//! - `str16`: u16 length then UTF-8, `str32`/`bytes32`: u32 length then bytes
//! - `opt<T>`: one flag byte (0 absent, 1 present) then `T`
//! - `list<u32>`: u32 count then the items
//!
//! | kind | payload |
//! |------|---------|
//! | Text (1) | ciphertext str32, key str16, sender opt<identity>, decrypted opt<str32>, positions opt<list<u32>> |
//! | File (2) | name str16, declared_len u64, category u8, data bytes32, sender opt<identity> |
//! | KeyExchange (3) | key str16 |
//! | PhrasePositions (4) | phrase str16, positions list<u32> |
//! | Identity (5) | id u64, username str16 |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::envelope::{
    Envelope, EnvelopeKind, FilePayload, Identity, KeyExchangePayload, MediaCategory,
    PhrasePositionsPayload, TextPayload,
};
use super::{ProtocolError, ProtocolResult};

/// Version byte at the start of every frame
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame header size: version(1) + kind(1) + length(4)
pub const FRAME_HEADER_SIZE: usize = 6;

/// Default upper bound on a frame payload
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

impl Envelope {
    /// Serialize to one complete frame
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload)?;

        let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.put_u8(PROTOCOL_VERSION);
        frame.put_u8(self.kind() as u8);
        frame.put_u32_le(len);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Parse one frame from the start of `buf`
    ///
    /// Returns the envelope and the number of bytes consumed. A buffer that
    /// stops before the end of the frame yields [`ProtocolError::EndOfStream`].
    pub fn decode(buf: &[u8]) -> ProtocolResult<(Envelope, usize)> {
        Self::decode_with_limit(buf, DEFAULT_MAX_FRAME_LEN)
    }

    /// Same as [`Envelope::decode`] with an explicit payload limit
    pub fn decode_with_limit(buf: &[u8], max_frame_len: usize) -> ProtocolResult<(Envelope, usize)> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::EndOfStream);
        }
        let header = FrameHeader::parse(&buf[..FRAME_HEADER_SIZE], max_frame_len)?;

        let end = FRAME_HEADER_SIZE + header.len;
        if buf.len() < end {
            return Err(ProtocolError::EndOfStream);
        }

        let envelope = decode_payload(header.kind, &buf[FRAME_HEADER_SIZE..end])?;
        Ok((envelope, end))
    }

    fn encode_payload(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        match self {
            Envelope::Text(text) => {
                put_str32(buf, &text.ciphertext, "ciphertext")?;
                put_str16(buf, &text.key, "key")?;
                put_opt(buf, text.sender.as_ref(), put_identity)?;
                put_opt(buf, text.decrypted.as_deref(), |b, s| put_str32(b, s, "decrypted"))?;
                put_opt(buf, text.positions.as_deref(), put_positions)?;
            }
            Envelope::File(file) => {
                put_str16(buf, &file.name, "file name")?;
                buf.put_u64_le(file.declared_len);
                buf.put_u8(file.category as u8);
                put_bytes32(buf, &file.data, "file data")?;
                put_opt(buf, file.sender.as_ref(), put_identity)?;
            }
            Envelope::KeyExchange(exchange) => {
                put_str16(buf, &exchange.key, "key")?;
            }
            Envelope::PhrasePositions(result) => {
                put_str16(buf, &result.phrase, "phrase")?;
                put_positions(buf, &result.positions)?;
            }
            Envelope::Identity(identity) => {
                put_identity(buf, identity)?;
            }
        }
        Ok(())
    }
}

/// Read one envelope from an async byte stream
///
/// Returns `Ok(None)` when the stream closes cleanly between frames and
/// [`ProtocolError::EndOfStream`] when it closes inside a frame.
pub async fn read_envelope<R>(reader: &mut R, max_frame_len: usize) -> ProtocolResult<Option<Envelope>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::EndOfStream)
            };
        }
        filled += n;
    }

    let header = FrameHeader::parse(&header, max_frame_len)?;
    let mut payload = vec![0u8; header.len];
    reader.read_exact(&mut payload).await?;

    decode_payload(header.kind, &payload).map(Some)
}

/// Encode and write one envelope, then flush
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = envelope.encode()?;
    write_frame(writer, &frame).await
}

/// Write an already encoded frame, then flush
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

struct FrameHeader {
    kind: EnvelopeKind,
    len: usize,
}

impl FrameHeader {
    fn parse(mut bytes: &[u8], max_frame_len: usize) -> ProtocolResult<Self> {
        let version = bytes.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let kind = EnvelopeKind::try_from(bytes.get_u8())?;

        let len = bytes.get_u32_le() as usize;
        if len > max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: max_frame_len,
            });
        }

        Ok(FrameHeader { kind, len })
    }
}

fn decode_payload(kind: EnvelopeKind, payload: &[u8]) -> ProtocolResult<Envelope> {
    let mut reader = PayloadReader { buf: payload };

    let envelope = match kind {
        EnvelopeKind::Text => {
            let ciphertext = reader.str32("ciphertext")?;
            let key = reader.str16("key")?;
            let sender = reader.opt("sender", PayloadReader::identity)?;
            let decrypted = reader.opt("decrypted", |r| r.str32("decrypted"))?;
            let positions = reader.opt("positions", PayloadReader::positions)?;
            Envelope::Text(TextPayload {
                ciphertext,
                key,
                sender,
                decrypted,
                positions,
            })
        }
        EnvelopeKind::File => {
            let name = reader.str16("file name")?;
            let declared_len = reader.u64("declared length")?;
            let category = MediaCategory::try_from(reader.u8("category")?)?;
            let data = reader.bytes32("file data")?;
            let sender = reader.opt("sender", PayloadReader::identity)?;
            let file = FilePayload {
                name,
                declared_len,
                category,
                data,
                sender,
            };
            file.validate()?;
            Envelope::File(file)
        }
        EnvelopeKind::KeyExchange => Envelope::KeyExchange(KeyExchangePayload {
            key: reader.str16("key")?,
        }),
        EnvelopeKind::PhrasePositions => {
            let phrase = reader.str16("phrase")?;
            let positions = reader.positions()?;
            Envelope::PhrasePositions(PhrasePositionsPayload { phrase, positions })
        }
        EnvelopeKind::Identity => Envelope::Identity(reader.identity()?),
    };

    reader.finish()?;
    Ok(envelope)
}

/// Cursor over one frame payload
///
/// Running short inside a complete frame is a malformed payload, not an end
/// of stream: the frame length already told us everything had arrived.
struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn need(&self, n: usize, field: &str) -> ProtocolResult<()> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::Malformed(format!("truncated {field}")));
        }
        Ok(())
    }

    fn u8(&mut self, field: &str) -> ProtocolResult<u8> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &str) -> ProtocolResult<u16> {
        self.need(2, field)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self, field: &str) -> ProtocolResult<u32> {
        self.need(4, field)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self, field: &str) -> ProtocolResult<u64> {
        self.need(8, field)?;
        Ok(self.buf.get_u64_le())
    }

    fn take(&mut self, len: usize, field: &str) -> ProtocolResult<&'a [u8]> {
        self.need(len, field)?;
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    fn utf8(&mut self, len: usize, field: &str) -> ProtocolResult<String> {
        let raw = self.take(len, field)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::Malformed(format!("{field} is not valid UTF-8")))
    }

    fn str16(&mut self, field: &str) -> ProtocolResult<String> {
        let len = self.u16(field)? as usize;
        self.utf8(len, field)
    }

    fn str32(&mut self, field: &str) -> ProtocolResult<String> {
        let len = self.u32(field)? as usize;
        self.utf8(len, field)
    }

    fn bytes32(&mut self, field: &str) -> ProtocolResult<Vec<u8>> {
        let len = self.u32(field)? as usize;
        Ok(self.take(len, field)?.to_vec())
    }

    fn opt<T>(
        &mut self,
        field: &str,
        read: impl FnOnce(&mut Self) -> ProtocolResult<T>,
    ) -> ProtocolResult<Option<T>> {
        match self.u8(field)? {
            0 => Ok(None),
            1 => read(self).map(Some),
            flag => Err(ProtocolError::Malformed(format!(
                "invalid presence flag {flag} for {field}"
            ))),
        }
    }

    fn identity(&mut self) -> ProtocolResult<Identity> {
        let id = self.u64("identity id")?;
        let username = self.str16("username")?;
        Ok(Identity { id, username })
    }

    fn positions(&mut self) -> ProtocolResult<Vec<u32>> {
        let count = self.u32("position count")? as usize;
        let bytes = count
            .checked_mul(4)
            .ok_or_else(|| ProtocolError::Malformed("position count overflow".to_string()))?;
        self.need(bytes, "positions")?;
        Ok((0..count).map(|_| self.buf.get_u32_le()).collect())
    }

    fn finish(self) -> ProtocolResult<()> {
        if !self.buf.is_empty() {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes after payload",
                self.buf.len()
            )));
        }
        Ok(())
    }
}

fn length_prefix<T: TryFrom<usize>>(len: usize, field: &'static str) -> ProtocolResult<T> {
    T::try_from(len).map_err(|_| ProtocolError::FieldTooLong { field, len })
}

fn put_str16(buf: &mut BytesMut, value: &str, field: &'static str) -> ProtocolResult<()> {
    buf.put_u16_le(length_prefix(value.len(), field)?);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_str32(buf: &mut BytesMut, value: &str, field: &'static str) -> ProtocolResult<()> {
    put_bytes32(buf, value.as_bytes(), field)
}

fn put_bytes32(buf: &mut BytesMut, value: &[u8], field: &'static str) -> ProtocolResult<()> {
    buf.put_u32_le(length_prefix(value.len(), field)?);
    buf.put_slice(value);
    Ok(())
}

fn put_identity(buf: &mut BytesMut, identity: &Identity) -> ProtocolResult<()> {
    buf.put_u64_le(identity.id);
    put_str16(buf, &identity.username, "username")
}

fn put_positions(buf: &mut BytesMut, positions: &[u32]) -> ProtocolResult<()> {
    buf.put_u32_le(length_prefix(positions.len(), "positions")?);
    for position in positions {
        buf.put_u32_le(*position);
    }
    Ok(())
}

fn put_opt<T: ?Sized>(
    buf: &mut BytesMut,
    value: Option<&T>,
    put: impl FnOnce(&mut BytesMut, &T) -> ProtocolResult<()>,
) -> ProtocolResult<()> {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put(buf, value)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelopes() -> Vec<Envelope> {
        let alice = Identity::new(7, "alice");
        vec![
            Envelope::Text(TextPayload::encrypt("hello world", "TESTKEY")),
            Envelope::Text(TextPayload {
                ciphertext: "KGYVRV".to_string(),
                key: "PLAYFAIR".to_string(),
                sender: Some(alice.clone()),
                decrypted: Some("HELXLO".to_string()),
                positions: Some(vec![0, 3]),
            }),
            Envelope::File(FilePayload::new("photo.png", vec![0x89, b'P', b'N', b'G'])),
            Envelope::File(FilePayload::new("empty.bin", vec![]).with_sender(alice.clone())),
            Envelope::key_exchange("TESTKEY"),
            Envelope::PhrasePositions(PhrasePositionsPayload {
                phrase: "xin chào".to_string(),
                positions: vec![0, 9],
            }),
            Envelope::PhrasePositions(PhrasePositionsPayload {
                phrase: String::new(),
                positions: vec![],
            }),
            Envelope::Identity(alice),
        ]
    }

    #[test]
    fn test_roundtrip_every_kind() {
        for envelope in sample_envelopes() {
            let frame = envelope.encode().unwrap();
            let (decoded, used) = Envelope::decode(&frame).unwrap();
            assert_eq!(decoded, envelope);
            assert_eq!(used, frame.len());
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = Envelope::key_exchange("AB").encode().unwrap();
        assert_eq!(
            frame.as_ref(),
            &[PROTOCOL_VERSION, 3, 4, 0, 0, 0, 2, 0, b'A', b'B']
        );
    }

    #[test]
    fn test_every_truncation_is_end_of_stream() {
        for envelope in sample_envelopes() {
            let frame = envelope.encode().unwrap();
            for cut in 0..frame.len() {
                let err = Envelope::decode(&frame[..cut]).unwrap_err();
                assert!(err.is_end_of_stream(), "cut at {cut}: {err}");
            }
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut frame = Envelope::key_exchange("K").encode().unwrap().to_vec();
        frame[1] = 99;
        assert!(matches!(
            Envelope::decode(&frame),
            Err(ProtocolError::UnknownKind(99))
        ));
    }

    #[test]
    fn test_bad_version_is_rejected() {
        let mut frame = Envelope::key_exchange("K").encode().unwrap().to_vec();
        frame[0] = 2;
        assert!(matches!(
            Envelope::decode(&frame),
            Err(ProtocolError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_before_payload() {
        let frame = Envelope::Text(TextPayload::new("A".repeat(100), "K"))
            .encode()
            .unwrap();
        let err = Envelope::decode_with_limit(&frame[..FRAME_HEADER_SIZE], 16).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { max: 16, .. }));
    }

    #[test]
    fn test_file_length_mismatch_is_rejected() {
        let mut file = FilePayload::new("a.txt", vec![1, 2, 3]);
        file.declared_len = 4;
        let frame = Envelope::File(file).encode().unwrap();
        assert!(matches!(
            Envelope::decode(&frame),
            Err(ProtocolError::LengthMismatch {
                declared: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_trailing_payload_bytes_are_malformed() {
        let mut frame = Envelope::key_exchange("K").encode().unwrap().to_vec();
        frame.push(0xAA);
        frame[2] += 1;
        assert!(matches!(
            Envelope::decode(&frame),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_short_field_inside_frame_is_malformed() {
        // Frame claims 2 payload bytes, but a str16 key needs 2 + len
        let frame = [PROTOCOL_VERSION, 3, 2, 0, 0, 0, 5, 0];
        let err = Envelope::decode(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert!(!err.is_end_of_stream());
    }

    #[test]
    fn test_decode_consecutive_frames() {
        let mut stream = Vec::new();
        for envelope in sample_envelopes() {
            stream.extend_from_slice(&envelope.encode().unwrap());
        }

        let mut rest = stream.as_slice();
        let mut decoded = Vec::new();
        while !rest.is_empty() {
            let (envelope, used) = Envelope::decode(rest).unwrap();
            decoded.push(envelope);
            rest = &rest[used..];
        }
        assert_eq!(decoded, sample_envelopes());
    }

    #[tokio::test]
    async fn test_async_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            for envelope in sample_envelopes() {
                write_envelope(&mut client, &envelope).await.unwrap();
            }
        });

        let mut received = Vec::new();
        while let Some(envelope) = read_envelope(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap() {
            received.push(envelope);
        }
        writer.await.unwrap();

        assert_eq!(received, sample_envelopes());
    }

    #[tokio::test]
    async fn test_async_truncated_stream() {
        let frame = Envelope::key_exchange("TESTKEY").encode().unwrap();
        let mut partial: &[u8] = &frame[..frame.len() - 2];

        let err = read_envelope(&mut partial, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap_err();
        assert!(err.is_end_of_stream());

        let mut header_only: &[u8] = &frame[..3];
        let err = read_envelope(&mut header_only, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap_err();
        assert!(err.is_end_of_stream());

        let mut empty: &[u8] = &[];
        assert!(read_envelope(&mut empty, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap()
            .is_none());
    }
}
