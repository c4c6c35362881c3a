//! Wiring of inputs and outputs from an execution configuration
//!
//! The configuration names, for every input and output of an algorithm
//! block, the cache stream it reads or writes and the channel it belongs to.
//! [`FlowBuilder`] turns it into input groups, data loaders and outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use beat_data_core::{
    json, AlgorithmDeclaration, DataFormat, DataFormatCache, DataIndex, Error, ErrorKind, Result,
};
use beat_data_readers::{
    shard, CachedDataSink, CachedDataSource, CachedSourceOptions, DataSource, Encoding,
    MessageChannel, RemoteDataSource,
};

use crate::input::{Input, InputGroup, InputList};
use crate::loader::{DataLoader, DataLoaderList};
use crate::output::{Output, OutputList, SynchronizationListener};

/// Name of the output holding the results of an analyzer
pub const RESULT_OUTPUT: &str = "result";

/// Configuration of one input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Channel the input belongs to
    pub channel: String,

    /// Cache stream, relative to the cache root and without extension
    pub path: String,

    /// Database the input is read from, through a view server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Protocol of the database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Set of the protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<String>,

    /// Output of the set feeding this input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl InputConfig {
    /// Whether the input is served by a database view
    pub fn is_database(&self) -> bool {
        self.database.is_some()
    }
}

/// Configuration of one output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Channel the output belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Cache stream, relative to the cache root and without extension
    pub path: String,
}

/// Execution configuration of an algorithm block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Full name of the algorithm
    pub algorithm: String,

    /// Channel the block is synchronized on
    pub channel: String,

    /// Algorithm parameters, passed through untouched
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub parameters: JsonValue,

    /// Window of data indices to process on the main channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(DataIndex, DataIndex)>,

    /// Inputs by name
    #[serde(default)]
    pub inputs: BTreeMap<String, InputConfig>,

    /// Outputs by name, for block algorithms
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputConfig>,

    /// Result stream, for analyzers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OutputConfig>,
}

impl ExecutionConfig {
    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse a configuration from its JSON text
    pub fn parse(text: &str) -> Result<Self> {
        let value = json::parse_strict(text)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// How an algorithm consumes its inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlgorithmKind {
    /// Every channel is an input group; the main one is stepped by the runtime
    Legacy,
    /// The main channel is an input group; other channels are data loaders
    #[default]
    Sequential,
    /// Every channel is a data loader
    Autonomous,
}

/// Builder of the inputs and outputs of an algorithm block
pub struct FlowBuilder<'a> {
    config: &'a ExecutionConfig,
    cache_root: PathBuf,
    kind: AlgorithmKind,
    remote: Option<Arc<Mutex<dyn MessageChannel>>>,
    memory_map: bool,
}

impl<'a> FlowBuilder<'a> {
    /// Create a builder for `config`, whose streams live below `cache_root`
    pub fn new<P: Into<PathBuf>>(config: &'a ExecutionConfig, cache_root: P) -> Self {
        Self {
            config,
            cache_root: cache_root.into(),
            kind: AlgorithmKind::default(),
            remote: None,
            memory_map: false,
        }
    }

    /// Set how the algorithm consumes its inputs
    pub fn kind(mut self, kind: AlgorithmKind) -> Self {
        self.kind = kind;
        self
    }

    /// Read database inputs through this channel to a view server
    pub fn remote(mut self, channel: Arc<Mutex<dyn MessageChannel>>) -> Self {
        self.remote = Some(channel);
        self
    }

    /// Memory-map the cache shards read
    pub fn memory_map(mut self, memory_map: bool) -> Self {
        self.memory_map = memory_map;
        self
    }

    /// Open every input declared by `algorithm`
    ///
    /// Groups of the main channel come first, so they become the main group
    /// or the main loader.
    pub fn build_inputs(
        &self,
        algorithm: &AlgorithmDeclaration,
        formats: &mut DataFormatCache,
    ) -> Result<(InputList, DataLoaderList)> {
        let mut channels = Vec::new();
        for group in algorithm.groups() {
            let Some(first) = group.inputs.keys().next() else {
                continue;
            };
            let channel = self.input_config(first)?.channel.as_str();
            channels.push((channel, group));
        }
        channels.sort_by_key(|(channel, _)| *channel != self.config.channel);

        let mut inputs = InputList::new();
        let mut loaders = DataLoaderList::new();
        for (channel, group) in channels {
            let main = channel == self.config.channel;
            let as_group = match self.kind {
                AlgorithmKind::Legacy => true,
                AlgorithmKind::Sequential => main,
                AlgorithmKind::Autonomous => false,
            };

            if as_group {
                let listener = main.then(SynchronizationListener::new);
                let mut input_group = InputGroup::new(channel, listener, main);
                for (name, endpoint) in &group.inputs {
                    let source = self.open_source(name, &endpoint.type_name, formats)?;
                    input_group.add(Input::new(name, &endpoint.type_name, source)?);
                }
                inputs.add(input_group);
            } else {
                let mut loader = DataLoader::new(channel);
                for (name, endpoint) in &group.inputs {
                    loader.add(name, self.open_source(name, &endpoint.type_name, formats)?)?;
                }
                loaders.add(loader);
            }

            tracing::debug!(
                target: "beat::config",
                channel,
                inputs = group.inputs.len(),
                kind = ?self.kind,
                "inputs ready"
            );
        }
        Ok((inputs, loaders))
    }

    /// Create the outputs of `algorithm`, bound to the main input group
    ///
    /// Every output covers the configured range or, by default, the range of
    /// the main channel.
    pub fn build_outputs(
        &self,
        algorithm: &AlgorithmDeclaration,
        formats: &mut DataFormatCache,
        inputs: &InputList,
        loaders: &DataLoaderList,
    ) -> Result<OutputList> {
        let listener = inputs.main_group().and_then(InputGroup::listener).cloned();
        let (start, end) = self.output_range(inputs, loaders)?;

        let mut outputs = OutputList::new();
        if algorithm.is_analyzer() {
            let result = self.config.result.as_ref().ok_or_else(|| {
                Error::InvalidArgument(format!("analyzer `{}' has no result stream", algorithm.name()))
            })?;
            let format = formats.result_format(algorithm.name())?;
            outputs.add(self.create_output(RESULT_OUTPUT, &result.path, format, listener, (start, end))?);
            return Ok(outputs);
        }

        for (name, output) in &self.config.outputs {
            let type_name = algorithm.output_type(name).ok_or_else(|| {
                Error::NotFound(format!("output `{name}' of algorithm `{}'", algorithm.name()))
            })?;
            let format = formats.resolve(type_name)?;
            outputs.add(self.create_output(name, &output.path, format, listener.clone(), (start, end))?);
        }
        Ok(outputs)
    }

    fn input_config(&self, name: &str) -> Result<&'a InputConfig> {
        self.config
            .inputs
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("configuration of input `{name}'")))
    }

    fn data_path(&self, path: &str) -> PathBuf {
        self.cache_root.join(format!("{path}.data"))
    }

    fn open_source(
        &self,
        name: &str,
        type_name: &str,
        formats: &mut DataFormatCache,
    ) -> Result<Box<dyn DataSource>> {
        let input = self.input_config(name)?;

        if input.is_database() {
            let channel = self.remote.as_ref().ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "input `{name}' is served by a database view, a remote channel is required"
                ))
            })?;
            let format = formats.resolve(type_name)?;
            return Ok(Box::new(RemoteDataSource::new(Arc::clone(channel), name, format, true)));
        }

        let window = self.config.range.filter(|_| input.channel == self.config.channel);
        let options = CachedSourceOptions {
            start_index: window.map(|(start, _)| start),
            end_index: window.map(|(_, end)| end),
            memory_map: self.memory_map,
            ..CachedSourceOptions::default()
        };
        let source = CachedDataSource::open(&self.data_path(&input.path), formats, options)?;
        if source.format_name() != type_name {
            return Err(Error::SchemaMismatch {
                expected: type_name.to_owned(),
                actual: source.format_name().to_owned(),
            });
        }
        Ok(Box::new(source))
    }

    fn output_range(&self, inputs: &InputList, loaders: &DataLoaderList) -> Result<(DataIndex, DataIndex)> {
        if let Some(range) = self.config.range {
            return Ok(range);
        }

        let cached = self
            .config
            .inputs
            .values()
            .find(|i| i.channel == self.config.channel && !i.is_database());
        if let Some(input) = cached {
            let hash_path = format!("{}.data", input.path);
            match shard::load_data_index(&self.cache_root, Path::new(&hash_path)) {
                Ok(indices) => {
                    if let Some(&last) = indices.last() {
                        return Ok((0, last - 1));
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        let from_group = inputs
            .main_group()
            .and_then(|g| g.iter().filter_map(|i| i.data_indices().last().map(|r| r.1)).max());
        let from_loader = loaders
            .main_loader()
            .map(DataLoader::data_index_end)
            .filter(|&end| end >= 0);
        from_group
            .or(from_loader)
            .map(|end| (0, end))
            .ok_or_else(|| Error::InvalidArgument("cannot determine the range of the outputs".to_owned()))
    }

    fn create_output(
        &self,
        name: &str,
        path: &str,
        format: Arc<DataFormat>,
        listener: Option<SynchronizationListener>,
        (start, end): (DataIndex, DataIndex),
    ) -> Result<Output> {
        let path = self.data_path(path);
        let sink = CachedDataSink::setup(&path, format, start, end, Encoding::Binary)?;

        tracing::debug!(target: "beat::config", output = name, start, end, "output ready");
        Ok(Output::new(name, Box::new(sink), listener, start))
    }
}
