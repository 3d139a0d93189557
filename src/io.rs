//! Reading and writing messages through byte streams.
//!
//! The slice-level framing helpers return [`Status`](crate::Status) like the
//! rest of the crate. The reader and writer helpers sit on top of them and
//! report `anyhow` errors with context, for both blocking (`std::io`) and
//! async (`futures::io`) streams.

use anyhow::{Context, bail};
use futures::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::arena::Arena;
use crate::message::Message;
use crate::options::{DecodeOptions, EncodeOptions};
use crate::status::Result;
use crate::tables::{ExtensionRegistry, MiniTable};
use crate::wire::{MAX_VARINT_LEN, ReadCursor, encode_varint};

/// Parses one varint-length-prefixed message from the front of `buf`.
/// Returns the message and the number of bytes consumed.
pub fn parse_length_prefixed<'m>(
    arena: &'m Arena<'m>,
    table: &'static MiniTable,
    buf: &[u8],
    registry: Option<&ExtensionRegistry>,
    options: &DecodeOptions,
) -> Result<(Message<'m>, usize)> {
    let mut cur = ReadCursor::new(buf);
    let len = cur.read_size()?;
    let body = cur.read_bytes(len)?;
    let msg = Message::parse(arena, table, body, registry, options)?;
    Ok((msg, cur.pos()))
}

/// Appends the byte count of `msg` as a varint, then `msg` itself, to `out`.
/// Returns the number of bytes appended.
pub fn serialize_length_prefixed(msg: &Message<'_>, options: &EncodeOptions, out: &mut Vec<u8>) -> Result<usize> {
    let size = msg.compute_size(options)?;
    let mut prefix = [0u8; MAX_VARINT_LEN];
    let n = encode_varint(size as u64, &mut prefix);
    let start = out.len();
    out.extend_from_slice(&prefix[..n]);
    out.resize(start + n + size, 0);
    match msg.serialize_into(&mut out[start + n..], options) {
        Ok(written) => {
            debug_assert_eq!(written, size);
            Ok(n + written)
        }
        Err(e) => {
            out.truncate(start);
            Err(e)
        }
    }
}

// Shared varint accumulation for the stream readers. `Ok(None)` from `byte`
// is end of stream.
struct VarintReader {
    value: u64,
    count: usize,
}

impl VarintReader {
    fn new() -> Self {
        VarintReader { value: 0, count: 0 }
    }

    // Feeds one byte; returns the value once complete.
    fn feed(&mut self, byte: u8) -> anyhow::Result<Option<u64>> {
        if self.count == MAX_VARINT_LEN {
            bail!("length prefix longer than {MAX_VARINT_LEN} bytes");
        }
        self.value |= ((byte & 0x7f) as u64) << (7 * self.count);
        self.count += 1;
        Ok((byte < 0x80).then_some(self.value))
    }

    fn finish_len(value: u64) -> anyhow::Result<usize> {
        if value > i32::MAX as u64 {
            bail!("message length {value} exceeds 2 GiB");
        }
        Ok(value as usize)
    }
}

/// Reads `reader` to the end and parses the bytes as one message.
pub fn read_message<'m>(
    reader: &mut impl std::io::Read,
    arena: &'m Arena<'m>,
    table: &'static MiniTable,
    options: &DecodeOptions,
) -> anyhow::Result<Message<'m>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).context("reading message")?;
    Message::parse(arena, table, &buf, None, options)
        .with_context(|| format!("parsing {} byte message", buf.len()))
}

/// Reads one length-prefixed message. Returns `None` on a clean end of stream
/// before the prefix.
pub fn read_delimited<'m>(
    reader: &mut impl std::io::BufRead,
    arena: &'m Arena<'m>,
    table: &'static MiniTable,
    options: &DecodeOptions,
) -> anyhow::Result<Option<Message<'m>>> {
    let mut varint = VarintReader::new();
    let len = loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).context("reading length prefix")? == 0 {
            if varint.count == 0 {
                return Ok(None);
            }
            bail!("stream ended inside a length prefix");
        }
        if let Some(value) = varint.feed(byte[0])? {
            break VarintReader::finish_len(value)?;
        }
    };
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).context("reading delimited message body")?;
    let msg = Message::parse(arena, table, &buf, None, options)
        .with_context(|| format!("parsing {len} byte delimited message"))?;
    Ok(Some(msg))
}

pub fn write_message(writer: &mut impl std::io::Write, msg: &Message<'_>, options: &EncodeOptions) -> anyhow::Result<()> {
    let bytes = msg.serialize(options).context("serializing message")?;
    writer.write_all(&bytes).context("writing message")?;
    Ok(())
}

pub fn write_delimited(writer: &mut impl std::io::Write, msg: &Message<'_>, options: &EncodeOptions) -> anyhow::Result<()> {
    let mut bytes = Vec::new();
    serialize_length_prefixed(msg, options, &mut bytes).context("serializing delimited message")?;
    writer.write_all(&bytes).context("writing delimited message")?;
    Ok(())
}

/// Parses a message delivered in chunks by `provider`, which returns `None`
/// once the input is exhausted.
///
/// The chunks are collected into one buffer and parsed once the provider is
/// drained, so memory use is the full message size plus its decoded form.
pub fn read_chunks<'m, 'c, E>(
    provider: &mut impl FnMut() -> core::result::Result<Option<&'c [u8]>, E>,
    arena: &'m Arena<'m>,
    table: &'static MiniTable,
    options: &DecodeOptions,
) -> anyhow::Result<Message<'m>>
where
    E: core::error::Error + Send + Sync + 'static,
{
    let mut buf = Vec::new();
    while let Some(chunk) = provider()? {
        buf.extend_from_slice(chunk);
    }
    Message::parse(arena, table, &buf, None, options)
        .with_context(|| format!("parsing {} byte message", buf.len()))
}

pub async fn read_message_async<'m>(
    reader: &mut (impl AsyncRead + Unpin),
    arena: &'m Arena<'m>,
    table: &'static MiniTable,
    options: &DecodeOptions,
) -> anyhow::Result<Message<'m>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.context("reading message")?;
    Message::parse(arena, table, &buf, None, options)
        .with_context(|| format!("parsing {} byte message", buf.len()))
}

pub async fn read_delimited_async<'m>(
    reader: &mut (impl AsyncBufRead + Unpin),
    arena: &'m Arena<'m>,
    table: &'static MiniTable,
    options: &DecodeOptions,
) -> anyhow::Result<Option<Message<'m>>> {
    let mut varint = VarintReader::new();
    let len = loop {
        let available = reader.fill_buf().await.context("reading length prefix")?;
        let Some(&byte) = available.first() else {
            if varint.count == 0 {
                return Ok(None);
            }
            bail!("stream ended inside a length prefix");
        };
        reader.consume_unpin(1);
        if let Some(value) = varint.feed(byte)? {
            break VarintReader::finish_len(value)?;
        }
    };
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .context("reading delimited message body")?;
    let msg = Message::parse(arena, table, &buf, None, options)
        .with_context(|| format!("parsing {len} byte delimited message"))?;
    Ok(Some(msg))
}

pub async fn write_message_async(
    writer: &mut (impl AsyncWrite + Unpin),
    msg: &Message<'_>,
    options: &EncodeOptions,
) -> anyhow::Result<()> {
    let bytes = msg.serialize(options).context("serializing message")?;
    writer.write_all(&bytes).await.context("writing message")?;
    Ok(())
}

pub async fn write_delimited_async(
    writer: &mut (impl AsyncWrite + Unpin),
    msg: &Message<'_>,
    options: &EncodeOptions,
) -> anyhow::Result<()> {
    let mut bytes = Vec::new();
    serialize_length_prefixed(msg, options, &mut bytes).context("serializing delimited message")?;
    writer.write_all(&bytes).await.context("writing delimited message")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Value;
    use crate::mini_descriptor::{MiniDescriptorEncoder, build_mini_table};
    use crate::status::ErrorCode;
    use crate::tables::FieldType;

    fn table() -> &'static MiniTable {
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(0);
        e.put_field(FieldType::UInt64, 1, 0).unwrap();
        e.put_field(FieldType::Bytes, 2, 0).unwrap();
        build_mini_table(e.as_str()).unwrap()
    }

    fn sample<'m>(arena: &'m Arena<'m>, n: u64) -> Message<'m> {
        let m = Message::new(arena, table()).unwrap();
        m.set(1, Value::U64(n)).unwrap();
        m.set(2, Value::Bytes(&[7; 200])).unwrap();
        m
    }

    #[test]
    fn delimited_framing() {
        let arena = Arena::new();
        let t = table();
        let mut out = Vec::new();
        let a = Message::new(&arena, t).unwrap();
        a.set(1, Value::U64(150)).unwrap();
        assert_eq!(serialize_length_prefixed(&a, &EncodeOptions::default(), &mut out).unwrap(), 4);
        assert_eq!(out, [0x03, 0x08, 0x96, 0x01]);

        out.push(0x00);
        let (back, used) = parse_length_prefixed(&arena, t, &out, None, &DecodeOptions::default()).unwrap();
        assert_eq!(used, 4);
        assert!(back.equal(&a));
        let (empty, used) = parse_length_prefixed(&arena, t, &out[4..], None, &DecodeOptions::default()).unwrap();
        assert_eq!(used, 1);
        assert!(!empty.has(1));

        let err = parse_length_prefixed(&arena, t, &[0x05, 0x08], None, &DecodeOptions::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LengthOutOfBounds);
    }

    #[test]
    fn std_streams() {
        let arena = Arena::new();
        let t = table();
        let options = EncodeOptions::default();
        let mut out = Vec::new();
        for n in 0..3 {
            write_delimited(&mut out, &sample(&arena, n), &options).unwrap();
        }
        let mut reader = std::io::BufReader::new(&out[..]);
        let mut seen = Vec::new();
        while let Some(m) = read_delimited(&mut reader, &arena, t, &DecodeOptions::default()).unwrap() {
            seen.push(m.get(1).and_then(|v| v.as_u64()).unwrap());
        }
        assert_eq!(seen, [0, 1, 2]);

        let mut cut = &out[..out.len() - 1];
        read_delimited(&mut cut, &arena, t, &DecodeOptions::default()).unwrap();
        read_delimited(&mut cut, &arena, t, &DecodeOptions::default()).unwrap();
        assert!(read_delimited(&mut cut, &arena, t, &DecodeOptions::default()).is_err());

        let mut plain = Vec::new();
        write_message(&mut plain, &sample(&arena, 9), &options).unwrap();
        let m = read_message(&mut &plain[..], &arena, t, &DecodeOptions::default()).unwrap();
        assert_eq!(m.get(1), Some(Value::U64(9)));
    }

    #[test]
    fn chunked_provider() {
        let arena = Arena::new();
        let t = table();
        let bytes = sample(&arena, 42).serialize(&EncodeOptions::default()).unwrap();
        let mut chunks = bytes.chunks(7);
        let mut provider = || Ok::<_, std::io::Error>(chunks.next());
        let m = read_chunks(&mut provider, &arena, t, &DecodeOptions::default()).unwrap();
        assert_eq!(m.get(1), Some(Value::U64(42)));
        assert_eq!(m.get(2).and_then(|v| v.as_bytes()).map(<[u8]>::len), Some(200));

        // Single-byte chunks split every varint and length prefix.
        let mut bytes_iter = bytes.chunks(1);
        let mut provider = || Ok::<_, std::io::Error>(bytes_iter.next());
        let m = read_chunks(&mut provider, &arena, t, &DecodeOptions::default()).unwrap();
        assert_eq!(m.get(1), Some(Value::U64(42)));

        let mut failing = || Err::<Option<&[u8]>, _>(std::io::Error::other("gone"));
        assert!(read_chunks(&mut failing, &arena, t, &DecodeOptions::default()).is_err());
    }

    #[test]
    fn async_streams() {
        futures::executor::block_on(async {
            let arena = Arena::new();
            let t = table();
            let options = EncodeOptions::default();
            let mut out = futures::io::Cursor::new(Vec::new());
            write_delimited_async(&mut out, &sample(&arena, 1), &options).await.unwrap();
            write_delimited_async(&mut out, &sample(&arena, 2), &options).await.unwrap();
            let bytes = out.into_inner();

            let mut reader = futures::io::BufReader::new(&bytes[..]);
            let first = read_delimited_async(&mut reader, &arena, t, &DecodeOptions::default()).await.unwrap();
            let second = read_delimited_async(&mut reader, &arena, t, &DecodeOptions::default()).await.unwrap();
            let end = read_delimited_async(&mut reader, &arena, t, &DecodeOptions::default()).await.unwrap();
            assert_eq!(first.and_then(|m| m.get(1)), Some(Value::U64(1)));
            assert_eq!(second.and_then(|m| m.get(1)), Some(Value::U64(2)));
            assert!(end.is_none());

            let mut plain = futures::io::Cursor::new(Vec::new());
            write_message_async(&mut plain, &sample(&arena, 5), &options).await.unwrap();
            let plain = plain.into_inner();
            let m = read_message_async(&mut &plain[..], &arena, t, &DecodeOptions::default()).await.unwrap();
            assert_eq!(m.get(1), Some(Value::U64(5)));
        });
    }
}
