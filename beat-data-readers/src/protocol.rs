//! Message framing and commands of the remote data source protocol
//!
//! A message is a sequence of parts. On the wire, each message is one
//! length-delimited frame whose body holds the parts, each prefixed by its
//! length as a big-endian `u32`.
//!
//! The consumer sends `ifo <input>`, `get <input> <index>` or `don`; the
//! server answers with the interval list, one record, or an
//! `err <kind> <message>` frame.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value as JsonValue;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use beat_data_core::{Error, ErrorKind, Result};

/// Wire kind of errors raised by user code
pub const USER_ERROR: &str = "usr";

/// Wire kind of errors raised by the infrastructure
pub const SYSTEM_ERROR: &str = "sys";

const READ_CHUNK: usize = 8 * 1024;

/// A multi-part message
pub type Message = Vec<Bytes>;

/// Options for [`MultipartCodec`]
#[derive(Debug, Clone, Copy)]
pub struct CodecOptions {
    /// Largest accepted frame, in bytes
    pub max_frame_length: usize,
    /// Longest wait for incoming bytes; `None` blocks forever
    pub read_timeout: Option<Duration>,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            max_frame_length: 256 * 1024 * 1024,
            read_timeout: None,
        }
    }
}

/// Codec turning multi-part messages into length-delimited frames
#[derive(Debug)]
pub struct MultipartCodec {
    codec: LengthDelimitedCodec,
}

impl MultipartCodec {
    /// Create a codec
    pub fn new(options: CodecOptions) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(options.max_frame_length)
            .new_codec();
        Self { codec }
    }
}

impl Default for MultipartCodec {
    fn default() -> Self {
        Self::new(CodecOptions::default())
    }
}

impl Decoder for MultipartCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        let Some(mut body) = self.codec.decode(src)? else {
            return Ok(None);
        };

        let mut parts = Vec::new();
        while body.has_remaining() {
            if body.remaining() < 4 {
                return Err(Error::Format("truncated part length in message".to_owned()));
            }
            let size = body.get_u32() as usize;
            if body.remaining() < size {
                return Err(Error::Format(format!(
                    "message part of {size} bytes exceeds the {} remaining",
                    body.remaining()
                )));
            }
            parts.push(body.split_to(size).freeze());
        }
        Ok(Some(parts))
    }
}

impl Encoder<Message> for MultipartCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let size = item.iter().map(|p| 4 + p.len()).sum();
        let mut body = BytesMut::with_capacity(size);
        for part in &item {
            let length = u32::try_from(part.len())
                .map_err(|_| Error::InvalidArgument(format!("message part of {} bytes", part.len())))?;
            body.put_u32(length);
            body.put_slice(part);
        }
        Ok(self.codec.encode(body.freeze(), dst)?)
    }
}

/// Blocking, ordered, duplex message transport
pub trait MessageChannel: Send + fmt::Debug {
    /// Send one message
    fn send(&mut self, message: Message) -> Result<()>;

    /// Receive one message, or `None` once the peer hung up
    fn recv(&mut self) -> Result<Option<Message>>;
}

/// Streams able to bound the time a read blocks
pub trait ReadTimeout {
    /// Set or clear the read timeout
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl ReadTimeout for UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }
}

impl ReadTimeout for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// [`MessageChannel`] over any byte stream
#[derive(Debug)]
pub struct FramedChannel<S> {
    stream: S,
    codec: MultipartCodec,
    buffer: BytesMut,
}

impl<S: Read + Write> FramedChannel<S> {
    /// Frame messages over `stream`
    pub fn new(stream: S, options: CodecOptions) -> Self {
        Self {
            stream,
            codec: MultipartCodec::new(options),
            buffer: BytesMut::new(),
        }
    }

    /// Recover the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write + ReadTimeout> FramedChannel<S> {
    /// Frame messages over `stream`, applying `options.read_timeout` to it
    pub fn with_timeout(stream: S, options: CodecOptions) -> Result<Self> {
        stream.set_read_timeout(options.read_timeout)?;
        Ok(Self::new(stream, options))
    }
}

impl<S: Read + Write + Send + fmt::Debug> MessageChannel for FramedChannel<S> {
    fn send(&mut self, message: Message) -> Result<()> {
        let mut frame = BytesMut::new();
        self.codec.encode(message, &mut frame)?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Message>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(message) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(message));
            }
            let n = match self.stream.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    tracing::warn!(target: "beat::remote", "no message from peer before timeout");
                    return Err(Error::remote(SYSTEM_ERROR, "timed out waiting for a message"));
                }
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Format(format!(
                    "connection closed with {} bytes of an incomplete frame",
                    self.buffer.len()
                )));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// A message sent by the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `ifo <input>`: list the intervals of an input
    Infos(String),
    /// `get <input> <index>`: fetch one record, the index kept as sent
    Get(String, String),
    /// `don [statistics]`: end of session
    Done(Option<String>),
    /// `err <kind> <message>`: the consumer failed
    Error {
        /// Wire error kind
        kind: String,
        /// Description
        message: String,
    },
    /// Anything else: command name and raw arguments
    Unknown(String, Vec<Bytes>),
}

impl Request {
    /// Decode a received message
    pub fn parse(message: &[Bytes]) -> Result<Self> {
        let Some((command, args)) = message.split_first() else {
            return Err(Error::Format("empty message".to_owned()));
        };
        let command = text(command)?;
        let arg = |i: usize| -> Result<String> {
            let part = args
                .get(i)
                .ok_or_else(|| Error::Format(format!("`{command}' expects {} arguments", i + 1)))?;
            Ok(text(part)?.to_owned())
        };

        Ok(match command {
            "ifo" => Request::Infos(arg(0)?),
            "get" => Request::Get(arg(0)?, arg(1)?),
            "don" => Request::Done(args.first().map(text).transpose()?.map(str::to_owned)),
            "err" => Request::Error {
                kind: arg(0)?,
                message: arg(1)?,
            },
            other => Request::Unknown(other.to_owned(), args.to_vec()),
        })
    }

    /// Encode for sending
    pub fn into_message(self) -> Message {
        match self {
            Request::Infos(input) => vec![Bytes::from_static(b"ifo"), Bytes::from(input)],
            Request::Get(input, index) => {
                vec![Bytes::from_static(b"get"), Bytes::from(input), Bytes::from(index)]
            }
            Request::Done(None) => vec![Bytes::from_static(b"don")],
            Request::Done(Some(statistics)) => {
                vec![Bytes::from_static(b"don"), Bytes::from(statistics)]
            }
            Request::Error { kind, message } => {
                vec![Bytes::from_static(b"err"), Bytes::from(kind), Bytes::from(message)]
            }
            Request::Unknown(command, args) => {
                let mut message = Vec::with_capacity(args.len() + 1);
                message.push(Bytes::from(command));
                message.extend(args);
                message
            }
        }
    }
}

/// UTF-8 content of a textual part
pub fn text(part: &Bytes) -> Result<&str> {
    std::str::from_utf8(part).map_err(|e| Error::Format(format!("message part is not UTF-8: {e}")))
}

/// Decimal integer content of a textual part
pub fn integer(part: &Bytes) -> Result<i64> {
    let value = text(part)?;
    value
        .parse()
        .map_err(|_| Error::Format(format!("`{value}' is not an integer")))
}

/// The `err` frame describing `error`
pub fn error_message(error: &Error) -> Message {
    let kind = match error.kind() {
        ErrorKind::User => USER_ERROR,
        _ => SYSTEM_ERROR,
    };
    let message = match error {
        Error::NotFound(message) | Error::OutOfRange(message) => message.clone(),
        other => other.to_string(),
    };
    vec![Bytes::from_static(b"err"), Bytes::from(kind), Bytes::from(message)]
}

/// Fail with [`Error::Remote`] if `reply` is an `err` frame
pub fn check_reply(reply: &[Bytes]) -> Result<()> {
    match reply.first().map(|p| &p[..]) {
        Some(b"err") => {
            let kind = reply.get(1).map(text).transpose()?.unwrap_or(SYSTEM_ERROR);
            let message = reply.get(2).map(text).transpose()?.unwrap_or_default();
            Err(Error::remote(kind, message))
        }
        Some(_) => Ok(()),
        None => Err(Error::Format("empty reply".to_owned())),
    }
}

/// Terminate a session, handing optional statistics to the server
///
/// The server does not answer.
pub fn send_done(channel: &mut dyn MessageChannel, statistics: Option<&JsonValue>) -> Result<()> {
    let statistics = statistics.map(ToString::to_string);
    tracing::debug!(target: "beat::remote", "send: don");
    channel.send(Request::Done(statistics).into_message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use test_case::test_case;

    fn parts(items: &[&str]) -> Message {
        items.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
    }

    #[test]
    fn test_codec_handles_partial_frames() {
        let mut codec = MultipartCodec::default();
        let mut encoded = BytesMut::new();
        codec.encode(parts(&["get", "a", "3"]), &mut encoded).unwrap();
        codec.encode(vec![Bytes::new()], &mut encoded).unwrap();

        let mut src = encoded.split_to(7);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.unsplit(encoded);
        assert_eq!(codec.decode(&mut src).unwrap().unwrap(), parts(&["get", "a", "3"]));
        assert_eq!(codec.decode(&mut src).unwrap().unwrap(), vec![Bytes::new()]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_codec_rejects_oversized_frame() {
        let mut codec = MultipartCodec::new(CodecOptions {
            max_frame_length: 8,
            ..CodecOptions::default()
        });
        let mut encoded = BytesMut::new();
        MultipartCodec::default()
            .encode(parts(&["a long payload"]), &mut encoded)
            .unwrap();
        assert_eq!(codec.decode(&mut encoded).unwrap_err().kind(), ErrorKind::Io);
    }

    #[test]
    fn test_codec_rejects_bad_part_length() {
        let mut src = BytesMut::new();
        src.put_u32(6);
        src.put_u32(10);
        src.put_slice(b"ab");
        let err = MultipartCodec::default().decode(&mut src).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test_case(&["ifo", "a"] => Request::Infos("a".into()); "infos")]
    #[test_case(&["get", "a", "12"] => Request::Get("a".into(), "12".into()); "get")]
    #[test_case(&["don"] => Request::Done(None); "done")]
    #[test_case(&["don", "{}"] => Request::Done(Some("{}".into())); "done with statistics")]
    #[test_case(&["err", "usr", "boom"] => Request::Error { kind: "usr".into(), message: "boom".into() }; "error")]
    #[test_case(&["xyz", "1"] => Request::Unknown("xyz".into(), vec![Bytes::from_static(b"1")]); "unknown")]
    #[test_case(&["nop"] => Request::Unknown("nop".into(), vec![]); "unknown without arguments")]
    fn test_parse_request(items: &[&str]) -> Request {
        let request = Request::parse(&parts(items)).unwrap();
        assert_eq!(request.clone().into_message(), parts(items));
        request
    }

    #[test]
    fn test_parse_missing_argument() {
        let err = Request::parse(&parts(&["get", "a"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(Request::parse(&[]).is_err());
    }

    #[test]
    fn test_error_replies() {
        let reply = error_message(&Error::User(anyhow::anyhow!("bad sample")));
        assert_eq!(text(&reply[1]).unwrap(), USER_ERROR);
        match check_reply(&reply).unwrap_err() {
            Error::Remote { kind, message } => {
                assert_eq!(kind, "usr");
                assert_eq!(message, "User error: bad sample");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let reply = error_message(&Error::NotFound("Unknown input: b".into()));
        assert_eq!(reply, parts(&["err", "sys", "Unknown input: b"]));
        assert!(check_reply(&parts(&["0", "1"])).is_ok());
    }

    #[test]
    fn test_channel_over_socket_pair() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut left = FramedChannel::new(left, CodecOptions::default());
        let mut right = FramedChannel::new(right, CodecOptions::default());

        left.send(parts(&["ifo", "a"])).unwrap();
        let payload = vec![Bytes::from(vec![7u8; 3 * READ_CHUNK])];
        left.send(payload.clone()).unwrap();
        assert_eq!(right.recv().unwrap().unwrap(), parts(&["ifo", "a"]));
        assert_eq!(right.recv().unwrap().unwrap(), payload);

        drop(left);
        assert!(right.recv().unwrap().is_none());
    }

    #[test]
    fn test_recv_times_out_on_silent_peer() {
        let (left, right) = UnixStream::pair().unwrap();
        let options = CodecOptions {
            read_timeout: Some(Duration::from_millis(50)),
            ..CodecOptions::default()
        };
        let mut left = FramedChannel::with_timeout(left, options).unwrap();
        left.send(parts(&["ifo", "a"])).unwrap();

        // the peer stays connected and never answers
        let err = left.recv().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Remote);
        drop(right);
    }

    #[test]
    fn test_recv_after_peer_hung_up() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut left = FramedChannel::with_timeout(left, CodecOptions::default()).unwrap();
        drop(right);
        assert!(left.recv().unwrap().is_none());
    }

    #[test]
    fn test_integer_parts() {
        assert_eq!(integer(&Bytes::from_static(b"-1")).unwrap(), -1);
        assert_eq!(integer(&Bytes::from_static(b"x")).unwrap_err().kind(), ErrorKind::Format);
    }
}
