//! View server answering the requests of remote data sources

use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::Value as JsonValue;

use beat_data_core::{json, Error, ErrorKind, Result};

use crate::data_source::DataSource;
use crate::protocol::{self, Message, MessageChannel, Request};

/// Serves a set of named data sources over one channel
///
/// Requests are answered strictly in order. The session ends when the
/// consumer sends `don` or `err`, hangs up, or a request fails; in the last
/// case the consumer receives an `err` frame first.
#[derive(Debug)]
pub struct MessageHandler<C> {
    channel: C,
    sources: BTreeMap<String, Box<dyn DataSource>>,
    user_error: Option<String>,
    system_error: Option<String>,
    statistics: Option<JsonValue>,
}

enum Flow {
    Continue,
    Stop,
}

impl<C: MessageChannel> MessageHandler<C> {
    /// Serve `sources`, keyed by input name
    pub fn new(channel: C, sources: BTreeMap<String, Box<dyn DataSource>>) -> Self {
        Self {
            channel,
            sources,
            user_error: None,
            system_error: None,
            statistics: None,
        }
    }

    /// Last error raised by user code, sent or received
    pub fn user_error(&self) -> Option<&str> {
        self.user_error.as_deref()
    }

    /// Last infrastructure error, sent or received
    pub fn system_error(&self) -> Option<&str> {
        self.system_error.as_deref()
    }

    /// Statistics handed over by the consumer with `don`
    pub fn statistics(&self) -> Option<&JsonValue> {
        self.statistics.as_ref()
    }

    /// Release the served sources
    pub fn into_sources(self) -> BTreeMap<String, Box<dyn DataSource>> {
        self.sources
    }

    /// Answer requests until the session ends
    ///
    /// Only transport failures are returned; request failures are sent to
    /// the consumer and recorded.
    pub fn run(&mut self) -> Result<()> {
        tracing::debug!(target: "beat::server", inputs = self.sources.len(), "view server started");
        while let Some(message) = self.channel.recv()? {
            let flow = match Request::parse(&message) {
                Ok(request) => self.dispatch(request)?,
                Err(e) => self.fail(&e)?,
            };
            if let Flow::Stop = flow {
                break;
            }
        }
        tracing::debug!(target: "beat::server", "view server stopped");
        Ok(())
    }

    fn dispatch(&mut self, request: Request) -> Result<Flow> {
        let reply = match request {
            Request::Infos(name) => self.infos(&name),
            Request::Get(name, index) => self.get(&name, &index),
            Request::Done(statistics) => {
                tracing::debug!(target: "beat::server", "recv: don");
                if let Some(text) = statistics {
                    match json::parse_strict(&text) {
                        Ok(value) => self.statistics = Some(value),
                        Err(e) => tracing::warn!(target: "beat::server", error = %e, "ignoring malformed statistics"),
                    }
                }
                return Ok(Flow::Stop);
            }
            Request::Error { kind, message } => {
                tracing::debug!(target: "beat::server", %kind, size = message.len(), "recv: err");
                if kind == protocol::USER_ERROR {
                    self.user_error = Some(message);
                } else {
                    self.system_error = Some(message);
                }
                return Ok(Flow::Stop);
            }
            Request::Unknown(command, _) => Err(Error::InvalidOperation(format!(
                "Command `{command}' is not implemented - stopping user process"
            ))),
        };

        match reply {
            Ok(reply) => {
                self.channel.send(reply)?;
                Ok(Flow::Continue)
            }
            Err(e) => self.fail(&e),
        }
    }

    fn fail(&mut self, error: &Error) -> Result<Flow> {
        let reply = protocol::error_message(error);
        let message = protocol::text(&reply[2])?.to_owned();
        tracing::warn!(target: "beat::server", error = %message, "request failed, stopping");
        if error.kind() == ErrorKind::User {
            self.user_error = Some(message);
        } else {
            self.system_error = Some(message);
        }
        self.channel.send(reply)?;
        Ok(Flow::Stop)
    }

    fn source(&mut self, name: &str) -> Result<&mut Box<dyn DataSource>> {
        self.sources
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("Unknown input: {name}")))
    }

    fn infos(&mut self, name: &str) -> Result<Message> {
        tracing::debug!(target: "beat::server", input = name, "recv: ifo");
        let intervals = self.source(name)?.data_indices()?;

        let mut reply = Vec::with_capacity(1 + 2 * intervals.len());
        reply.push(Bytes::from(intervals.len().to_string()));
        for (start, end) in intervals {
            reply.push(Bytes::from(start.to_string()));
            reply.push(Bytes::from(end.to_string()));
        }
        Ok(reply)
    }

    fn get(&mut self, name: &str, index: &str) -> Result<Message> {
        tracing::debug!(target: "beat::server", input = name, index, "recv: get");
        let source = self.source(name)?;
        let invalid = || Error::NotFound(format!("Invalid index: {index}"));
        let position: i64 = index.parse().map_err(|_| invalid())?;
        let (data, start, end) = source.get(position)?.ok_or_else(invalid)?;

        let packed = data.to_packed()?;
        tracing::debug!(target: "beat::server", size = packed.len(), start, end, "send: <bin>");
        Ok(vec![
            Bytes::from(start.to_string()),
            Bytes::from(end.to_string()),
            Bytes::from(packed),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use crate::data_source::tests::IntervalSource;

    /// Channel replaying scripted requests and keeping the replies
    #[derive(Debug, Default)]
    struct ScriptedChannel {
        requests: VecDeque<Message>,
        replies: Vec<Message>,
    }

    impl MessageChannel for ScriptedChannel {
        fn send(&mut self, message: Message) -> Result<()> {
            self.replies.push(message);
            Ok(())
        }

        fn recv(&mut self) -> Result<Option<Message>> {
            Ok(self.requests.pop_front())
        }
    }

    fn message(items: &[&str]) -> Message {
        items.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
    }

    fn scripted(requests: &[&[&str]]) -> MessageHandler<ScriptedChannel> {
        let mut sources: BTreeMap<String, Box<dyn DataSource>> = BTreeMap::new();
        sources.insert(
            "a".to_owned(),
            Box::new(IntervalSource {
                intervals: vec![(0, 1), (2, 2)],
                closed: false,
            }),
        );
        let channel = ScriptedChannel {
            requests: requests.iter().map(|r| message(r)).collect(),
            replies: Vec::new(),
        };
        MessageHandler::new(channel, sources)
    }

    #[test]
    fn test_infos_and_get() {
        let mut handler = scripted(&[&["ifo", "a"], &["get", "a", "1"], &["don"]]);
        handler.run().unwrap();

        let replies = &handler.channel.replies;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], message(&["2", "0", "1", "2", "2"]));
        assert_eq!(replies[1][..2], message(&["2", "2"])[..]);
        assert_eq!(&replies[1][2][..], &2i64.to_le_bytes()[..]);
        assert!(handler.system_error().is_none());
    }

    #[test]
    fn test_invalid_index_stops_server() {
        let mut handler = scripted(&[&["get", "a", "x"], &["ifo", "a"]]);
        handler.run().unwrap();

        assert_eq!(handler.channel.replies, vec![message(&["err", "sys", "Invalid index: x"])]);
        assert_eq!(handler.system_error(), Some("Invalid index: x"));
        assert_eq!(handler.channel.requests.len(), 1);
    }

    #[test]
    fn test_out_of_range_index() {
        let mut handler = scripted(&[&["get", "a", "2"]]);
        handler.run().unwrap();
        assert_eq!(handler.channel.replies, vec![message(&["err", "sys", "Invalid index: 2"])]);
    }

    #[test]
    fn test_unknown_command() {
        let mut handler = scripted(&[&["val", "x"]]);
        handler.run().unwrap();
        assert_eq!(handler.channel.replies[0][..2], message(&["err", "sys"])[..]);
        assert!(handler.system_error().unwrap().contains("`val' is not implemented"));
    }

    #[test]
    fn test_consumer_error_and_hang_up() {
        let mut handler = scripted(&[&["err", "usr", "algorithm crashed"]]);
        handler.run().unwrap();
        assert!(handler.channel.replies.is_empty());
        assert_eq!(handler.user_error(), Some("algorithm crashed"));

        let mut handler = scripted(&[]);
        handler.run().unwrap();
        assert!(handler.channel.replies.is_empty());
    }

    #[test]
    fn test_done_statistics() {
        let mut handler = scripted(&[&["don", "{\"data\": {\"volume\": 3}}"]]);
        handler.run().unwrap();
        assert_eq!(handler.statistics(), Some(&serde_json::json!({"data": {"volume": 3}})));

        let mut handler = scripted(&[&["don", "not json"]]);
        handler.run().unwrap();
        assert!(handler.statistics().is_none());
    }
}
