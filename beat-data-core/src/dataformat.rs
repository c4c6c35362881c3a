//! Data format declarations and the format cache
//!
//! A data format is a named set of typed fields, declared in JSON under
//! `<prefix>/dataformats/<name>.json`. The [`DataFormatCache`] loads
//! declarations once and acts as the record factory keyed by format name.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::algorithm::AlgorithmDeclaration;
use crate::error::{Error, Result};
use crate::json;
use crate::record::DynamicRecord;

/// Name given to formats declared inline, without a file of their own
pub const UNNAMED_DATAFORMAT: &str = "__unnamed_dataformat__";

/// Header prefix marking formats derived from an analyzer's results
pub const ANALYSIS_PREFIX: &str = "analysis:";

/// Element type of a scalar field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    /// Boolean stored as one byte
    Bool,
    /// 8-bit signed integer
    Int8,
    /// 16-bit signed integer
    Int16,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 8-bit unsigned integer
    UInt8,
    /// 16-bit unsigned integer
    UInt16,
    /// 32-bit unsigned integer
    UInt32,
    /// 64-bit unsigned integer
    UInt64,
    /// 32-bit floating point
    Float32,
    /// 64-bit floating point
    Float64,
    /// Pair of 32-bit floats (real, imaginary)
    Complex64,
    /// Pair of 64-bit floats (real, imaginary)
    Complex128,
}

impl ScalarType {
    /// Parse a declared type name
    pub fn from_name(name: &str) -> Option<Self> {
        let scalar = match name {
            "bool" => ScalarType::Bool,
            "int8" => ScalarType::Int8,
            "int16" => ScalarType::Int16,
            "int32" => ScalarType::Int32,
            "int64" => ScalarType::Int64,
            "uint8" => ScalarType::UInt8,
            "uint16" => ScalarType::UInt16,
            "uint32" => ScalarType::UInt32,
            "uint64" => ScalarType::UInt64,
            "float32" => ScalarType::Float32,
            "float64" => ScalarType::Float64,
            "complex64" => ScalarType::Complex64,
            "complex128" => ScalarType::Complex128,
            _ => return None,
        };
        Some(scalar)
    }

    /// Declared name of this type
    pub fn name(self) -> &'static str {
        match self {
            ScalarType::Bool => "bool",
            ScalarType::Int8 => "int8",
            ScalarType::Int16 => "int16",
            ScalarType::Int32 => "int32",
            ScalarType::Int64 => "int64",
            ScalarType::UInt8 => "uint8",
            ScalarType::UInt16 => "uint16",
            ScalarType::UInt32 => "uint32",
            ScalarType::UInt64 => "uint64",
            ScalarType::Float32 => "float32",
            ScalarType::Float64 => "float64",
            ScalarType::Complex64 => "complex64",
            ScalarType::Complex128 => "complex128",
        }
    }

    /// Size of one packed value in bytes
    pub fn size_bytes(self) -> usize {
        match self {
            ScalarType::Bool | ScalarType::Int8 | ScalarType::UInt8 => 1,
            ScalarType::Int16 | ScalarType::UInt16 => 2,
            ScalarType::Int32 | ScalarType::UInt32 | ScalarType::Float32 => 4,
            ScalarType::Int64 | ScalarType::UInt64 | ScalarType::Float64 | ScalarType::Complex64 => 8,
            ScalarType::Complex128 => 16,
        }
    }

    /// Whether this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ScalarType::Int8
                | ScalarType::Int16
                | ScalarType::Int32
                | ScalarType::Int64
                | ScalarType::UInt8
                | ScalarType::UInt16
                | ScalarType::UInt32
                | ScalarType::UInt64
        )
    }

    /// Whether this is a real floating point type
    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::Float32 | ScalarType::Float64)
    }

    /// Whether this is a complex type
    pub fn is_complex(self) -> bool {
        matches!(self, ScalarType::Complex64 | ScalarType::Complex128)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declared type of a field
#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    /// Numeric or boolean scalar
    Scalar(ScalarType),

    /// UTF-8 string
    String,

    /// Nested data format
    Format(Arc<DataFormat>),

    /// Multi-dimensional array; a zero dimension accepts any length
    Array {
        /// Declared shape
        shape: Vec<usize>,
        /// Element type, never itself an array
        item: Box<DataType>,
    },
}

impl DataType {
    /// Name of the element type as written in declarations
    pub fn type_name(&self) -> String {
        match self {
            DataType::Scalar(s) => s.name().to_owned(),
            DataType::String => "string".to_owned(),
            DataType::Format(f) => f.name().to_owned(),
            DataType::Array { item, .. } => item.type_name(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Array { shape, item } => {
                write!(f, "[")?;
                for dim in shape {
                    write!(f, "{dim}, ")?;
                }
                write!(f, "{item}]")
            }
            other => f.write_str(&other.type_name()),
        }
    }
}

/// A named, typed field of a data format
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Name of the field
    pub name: String,

    /// Declared type of the field
    pub data_type: DataType,
}

impl Field {
    /// Create a new field
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_owned(),
            data_type,
        }
    }
}

/// A resolved data format
///
/// Fields are kept sorted by name, which is also the order of the binary
/// encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFormat {
    name: String,
    fields: Vec<Field>,
    description: Option<String>,
    schema_version: u64,
    extends: Option<String>,
}

impl DataFormat {
    /// Create a format from already resolved fields
    pub fn new(name: &str, mut fields: Vec<Field>) -> Self {
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            name: name.to_owned(),
            fields,
            description: None,
            schema_version: 1,
            extends: None,
        }
    }

    /// Full name of this format, e.g. `user/single_integer/1`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in encoding order
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Look a field up by name
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields
            .binary_search_by(|f| f.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.fields[i])
    }

    /// Short description, if declared
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Declared schema version, 1 when absent
    pub fn schema_version(&self) -> u64 {
        self.schema_version
    }

    /// Name of the parent format, if this one extends another
    pub fn extends(&self) -> Option<&str> {
        self.extends.as_deref()
    }

    /// Whether `other` is this format or one of its ancestors
    pub fn is_parent(&self, other: &DataFormat, cache: &DataFormatCache) -> bool {
        if self.name == other.name {
            return true;
        }
        match &self.extends {
            Some(parent) => cache
                .lookup(parent)
                .is_some_and(|p| p.is_parent(other, cache)),
            None => false,
        }
    }

    /// Create an empty record of this format, every field at its default
    pub fn new_record(self: &Arc<Self>) -> DynamicRecord {
        DynamicRecord::new(Arc::clone(self))
    }
}

/// Loads data formats below a prefix and hands out records by format name
#[derive(Debug, Default)]
pub struct DataFormatCache {
    /// Installation prefix holding `dataformats/` and `algorithms/`
    prefix: PathBuf,

    /// Loaded formats; `None` marks a format whose load is in progress
    formats: HashMap<String, Option<Arc<DataFormat>>>,
}

impl DataFormatCache {
    /// Create an empty cache reading declarations below `prefix`
    pub fn new<P: AsRef<Path>>(prefix: P) -> Self {
        Self {
            prefix: prefix.as_ref().to_path_buf(),
            formats: HashMap::new(),
        }
    }

    /// Installation prefix of this cache
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Path of the declaration file of a named format
    pub fn declaration_path(&self, name: &str) -> PathBuf {
        self.prefix.join("dataformats").join(format!("{name}.json"))
    }

    /// Register an already built format under its own name
    pub fn register(&mut self, format: DataFormat) -> Arc<DataFormat> {
        let format = Arc::new(format);
        self.formats
            .insert(format.name().to_owned(), Some(Arc::clone(&format)));
        format
    }

    /// Return a loaded format without touching the filesystem
    pub fn lookup(&self, name: &str) -> Option<Arc<DataFormat>> {
        self.formats.get(name).cloned().flatten()
    }

    /// Return a format, loading its declaration on first use
    pub fn get(&mut self, name: &str) -> Result<Arc<DataFormat>> {
        match self.formats.get(name) {
            Some(Some(format)) => return Ok(Arc::clone(format)),
            Some(None) => {
                return Err(Error::Format(format!(
                    "data format `{name}' refers to itself"
                )))
            }
            None => {}
        }

        let path = self.declaration_path(name);
        if !path.is_file() {
            return Err(Error::NotFound(format!(
                "data format declaration `{}'",
                path.display()
            )));
        }

        let text = std::fs::read_to_string(&path)?;
        let declaration = json::parse_strict(&text).map_err(|e| {
            Error::Format(format!("invalid declaration `{}': {e}", path.display()))
        })?;

        self.formats.insert(name.to_owned(), None);
        let loaded = self.build(name, &declaration);
        match loaded {
            Ok(format) => {
                tracing::debug!(target: "beat::dataformat", name, "loaded data format");
                Ok(self.register(format))
            }
            Err(e) => {
                self.formats.remove(name);
                Err(e)
            }
        }
    }

    /// Resolve the format identifier found in a shard header
    ///
    /// Identifiers of the form `analysis:<algorithm>` name the result
    /// format of an analyzer; anything else is a data format name.
    pub fn resolve(&mut self, identifier: &str) -> Result<Arc<DataFormat>> {
        match identifier.strip_prefix(ANALYSIS_PREFIX) {
            Some(algorithm) => self.result_format(algorithm),
            None => self.get(identifier),
        }
    }

    /// Build the format of an analyzer's results
    pub fn result_format(&mut self, algorithm: &str) -> Result<Arc<DataFormat>> {
        let identifier = format!("{ANALYSIS_PREFIX}{algorithm}");
        if let Some(format) = self.lookup(&identifier) {
            return Ok(format);
        }

        let declaration = AlgorithmDeclaration::load(&self.prefix, algorithm)?;
        let results = declaration.results().ok_or_else(|| {
            Error::TypeMismatch(format!(
                "algorithm `{algorithm}' is a block algorithm, not an analyzer"
            ))
        })?;

        let mut object = serde_json::Map::new();
        for (name, type_name) in results {
            object.insert(name.clone(), JsonValue::String(type_name.clone()));
        }
        let format = self.build(&identifier, &JsonValue::Object(object))?;
        Ok(self.register(format))
    }

    /// Create an empty record of the named format
    pub fn new_record(&mut self, name: &str) -> Result<DynamicRecord> {
        Ok(self.resolve(name)?.new_record())
    }

    /// Build a format from its parsed declaration
    pub fn build(&mut self, name: &str, declaration: &JsonValue) -> Result<DataFormat> {
        let object = declaration.as_object().ok_or_else(|| {
            Error::Format(format!("declaration of `{name}' is not a JSON object"))
        })?;

        let mut fields: Vec<Field> = Vec::new();
        let mut description = None;
        let mut schema_version = 1;
        let mut extends = None;

        for (key, value) in object {
            match key.as_str() {
                "#description" => description = value.as_str().map(str::to_owned),
                "#schema_version" => {
                    schema_version = value.as_u64().ok_or_else(|| {
                        Error::Format(format!("`{name}': #schema_version must be an integer"))
                    })?;
                }
                "#extends" => {
                    let parent = value.as_str().ok_or_else(|| {
                        Error::Format(format!("`{name}': #extends must be a format name"))
                    })?;
                    extends = Some(parent.to_owned());
                }
                k if k.starts_with("__") && k.ends_with("__") => {}
                k if k.starts_with('#') => {
                    return Err(Error::Format(format!(
                        "`{name}': unknown meta attribute `{k}'"
                    )))
                }
                field => {
                    let data_type = self.parse_type(name, field, value)?;
                    fields.push(Field::new(field, data_type));
                }
            }
        }

        if let Some(parent) = &extends {
            let base = self.get(parent)?;
            for inherited in base.fields() {
                if !fields.iter().any(|f| f.name == inherited.name) {
                    fields.push(inherited.clone());
                }
            }
        }

        let mut format = DataFormat::new(name, fields);
        format.description = description;
        format.schema_version = schema_version;
        format.extends = extends;
        Ok(format)
    }

    fn parse_type(&mut self, format: &str, field: &str, value: &JsonValue) -> Result<DataType> {
        match value {
            JsonValue::String(type_name) => self.parse_element(format, field, type_name),
            JsonValue::Object(_) => {
                let nested = self.build(UNNAMED_DATAFORMAT, value)?;
                Ok(DataType::Format(Arc::new(nested)))
            }
            JsonValue::Array(items) => {
                let (last, dims) = items.split_last().ok_or_else(|| {
                    Error::Format(format!("`{format}': array field `{field}' has no type"))
                })?;
                if dims.is_empty() {
                    return Err(Error::Format(format!(
                        "`{format}': array field `{field}' has no dimensions"
                    )));
                }
                let shape = dims
                    .iter()
                    .map(|d| {
                        d.as_u64().map(|d| d as usize).ok_or_else(|| {
                            Error::Format(format!(
                                "`{format}': dimension of `{field}' must be a non-negative integer"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let item = match self.parse_type(format, field, last)? {
                    DataType::Array { .. } => {
                        return Err(Error::Format(format!(
                            "`{format}': array field `{field}' nests another array"
                        )))
                    }
                    other => other,
                };
                Ok(DataType::Array {
                    shape,
                    item: Box::new(item),
                })
            }
            _ => Err(Error::Format(format!(
                "`{format}': field `{field}' has an invalid type declaration"
            ))),
        }
    }

    fn parse_element(&mut self, format: &str, field: &str, type_name: &str) -> Result<DataType> {
        let type_name = json::canonical_type_name(type_name);
        if type_name == "string" {
            return Ok(DataType::String);
        }
        if let Some(scalar) = ScalarType::from_name(type_name) {
            return Ok(DataType::Scalar(scalar));
        }
        if type_name.contains('/') {
            let nested = self.get(type_name)?;
            return Ok(DataType::Format(nested));
        }
        Err(Error::Format(format!(
            "`{format}': field `{field}' has unknown type `{type_name}'"
        )))
    }
}

/// Build an anonymous format directly from a declaration, without a prefix
pub fn format_from_declaration(name: &str, declaration: &JsonValue) -> Result<DataFormat> {
    DataFormatCache::default().build(name, declaration)
}
