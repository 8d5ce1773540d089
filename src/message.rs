// MIT License - Copyright (c) 2021 TJForc
// Message envelope exchanged with the gateway

use std::borrow::Cow;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{AtsError, Result};

/// Dynamically typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    #[serde(rename = "string")]
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Bytes(_) => "bytes",
        }
    }

    fn mismatch(&self, id: &str, expected: &'static str) -> AtsError {
        AtsError::PropertyType {
            property: id.to_string(),
            expected,
            found: self.type_name(),
        }
    }

    pub fn as_str(&self, id: &str) -> Result<&str> {
        match self {
            Self::Str(s) => Ok(s),
            other => Err(other.mismatch(id, "string")),
        }
    }

    pub fn as_int(&self, id: &str) -> Result<i64> {
        match self {
            Self::Int(v) => Ok(*v),
            other => Err(other.mismatch(id, "int")),
        }
    }

    pub fn as_bool(&self, id: &str) -> Result<bool> {
        match self {
            Self::Bool(v) => Ok(*v),
            other => Err(other.mismatch(id, "bool")),
        }
    }

    /// Raw bytes, or a base64 string from transports that cannot carry bytes.
    pub fn as_bytes(&self, id: &str) -> Result<Cow<'_, [u8]>> {
        match self {
            Self::Bytes(b) => Ok(Cow::Borrowed(b)),
            Self::Str(s) => STANDARD
                .decode(s.trim())
                .map(Cow::Owned)
                .map_err(|e| AtsError::Codec(format!("{id}: {e}"))),
            other => Err(other.mismatch(id, "bytes")),
        }
    }

    /// Loose truthiness for result fields (`"1"`, `1`, `true`).
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Str(s) => s == "1" || s.eq_ignore_ascii_case("true"),
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::Bool(v) => *v,
            Self::Bytes(b) => !b.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// One entry of a message's property list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: String,
    #[serde(default)]
    pub index: i32,
    pub value: Value,
}

impl Property {
    pub fn new(id: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            index: 0,
            value: value.into(),
        }
    }
}

/// Named message with an ordered property list. Requests, responses and
/// pushes all share this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl Message {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    /// Append a property, builder style.
    pub fn with(mut self, id: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.push(Property::new(id, value));
        self
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn is_error(&self) -> bool {
        self.is(crate::constants::msg::RETURN_ERROR)
    }

    /// First property with the given id.
    pub fn property(&self, id: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.id == id)
    }

    pub fn value(&self, id: &str) -> Option<&Value> {
        self.property(id).map(|p| &p.value)
    }

    pub fn values<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.properties.iter().filter(move |p| p.id == id).map(|p| &p.value)
    }

    pub fn require(&self, id: &str) -> Result<&Value> {
        self.value(id).ok_or_else(|| AtsError::MissingProperty {
            message: self.name.clone(),
            property: id.to_string(),
        })
    }

    /// Error text of an error-shaped message: the first property's value.
    pub fn error_text(&self) -> String {
        self.properties
            .first()
            .map(|p| p.value.to_string())
            .unwrap_or_default()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for p in &self.properties {
            write!(f, " {}[{}]={}", p.id, p.index, p.value)?;
        }
        Ok(())
    }
}
