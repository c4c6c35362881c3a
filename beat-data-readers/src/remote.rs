//! Data source reading from a view server

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;

use beat_data_core::{DataFormat, Error, IoStatistics, Record, Result};

use crate::data_source::{Block, DataRecord, DataSource, Interval};
use crate::protocol::{self, integer, Message, MessageChannel, Request};

/// Source fetching the records of one input over a [`MessageChannel`]
///
/// The interval list is requested on first use. Several sources may share
/// one channel; each request holds the channel until its reply arrived.
#[derive(Debug)]
pub struct RemoteDataSource {
    channel: Arc<Mutex<dyn MessageChannel>>,
    input_name: String,
    format: Arc<DataFormat>,
    unpack: bool,
    infos: Option<Vec<Interval>>,
    stats: IoStatistics,
}

impl RemoteDataSource {
    /// Read `input_name`, whose records have format `format`
    pub fn new(
        channel: Arc<Mutex<dyn MessageChannel>>,
        input_name: &str,
        format: Arc<DataFormat>,
        unpack: bool,
    ) -> Self {
        Self {
            channel,
            input_name: input_name.to_owned(),
            format,
            unpack,
            infos: None,
            stats: IoStatistics::default(),
        }
    }

    /// Name of the remote input
    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    fn lock(&self) -> Result<MutexGuard<'_, dyn MessageChannel + 'static>> {
        self.channel
            .lock()
            .map_err(|_| Error::InvalidOperation("message channel lock poisoned".to_owned()))
    }

    fn request(&self, request: Request) -> Result<Message> {
        let mut channel = self.lock()?;
        channel.send(request.into_message())?;
        let reply = channel
            .recv()?
            .ok_or_else(|| Error::remote(protocol::SYSTEM_ERROR, "server hung up"))?;
        protocol::check_reply(&reply)?;
        Ok(reply)
    }

    fn fetch_infos(&self) -> Result<Vec<Interval>> {
        tracing::debug!(target: "beat::remote", input = %self.input_name, "send: ifo");
        let reply = self.request(Request::Infos(self.input_name.clone()))?;

        let (count, pairs) = reply
            .split_first()
            .ok_or_else(|| Error::Format("empty ifo reply".to_owned()))?;
        let count = usize::try_from(integer(count)?)
            .map_err(|_| Error::Format("negative interval count".to_owned()))?;
        if pairs.len() != 2 * count {
            return Err(Error::Format(format!(
                "ifo reply announces {count} intervals but carries {} values",
                pairs.len()
            )));
        }
        let infos = pairs
            .chunks_exact(2)
            .map(|pair| Ok((integer(&pair[0])?, integer(&pair[1])?)))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(target: "beat::remote", input = %self.input_name, count, "recv: infos");
        Ok(infos)
    }

    fn decode(&self, payload: Bytes) -> Result<DataRecord> {
        if !self.unpack {
            return Ok(DataRecord::Packed(payload.to_vec()));
        }
        let mut record = self.format.new_record();
        record.unpack(&payload)?;
        Ok(DataRecord::Unpacked(Box::new(record)))
    }
}

impl DataSource for RemoteDataSource {
    fn intervals(&mut self) -> Result<&[Interval]> {
        if self.infos.is_none() {
            self.infos = Some(self.fetch_infos()?);
        }
        Ok(self.infos.as_deref().unwrap_or_default())
    }

    fn get(&mut self, index: i64) -> Result<Option<Block>> {
        let intervals = self.intervals()?;
        let Some(&(start, end)) = usize::try_from(index).ok().and_then(|i| intervals.get(i)) else {
            return Ok(None);
        };

        tracing::debug!(target: "beat::remote", input = %self.input_name, index, "send: get");
        let started = Instant::now();
        let reply = self.request(Request::Get(self.input_name.clone(), index.to_string()));
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.stats.record(0, started.elapsed());
                return Err(e);
            }
        };

        let [sent_start, sent_end, payload] = <[Bytes; 3]>::try_from(reply)
            .map_err(|r| Error::Format(format!("get reply has {} parts instead of 3", r.len())))?;
        let (sent_start, sent_end) = (integer(&sent_start)?, integer(&sent_end)?);
        if (sent_start, sent_end) != (start, end) {
            tracing::warn!(
                target: "beat::remote",
                input = %self.input_name,
                index,
                expected = ?(start, end),
                received = ?(sent_start, sent_end),
                "server sent a different interval"
            );
        }

        self.stats.record(payload.len(), started.elapsed());
        tracing::debug!(target: "beat::remote", size = payload.len(), start, end, "recv: <bin>");
        Ok(Some((self.decode(payload)?, start, end)))
    }

    fn close(&mut self) {
        self.infos = None;
    }

    fn statistics(&self) -> IoStatistics {
        self.stats
    }
}
