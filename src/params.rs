//! Transformation parameters and per-request context

use crate::error::{Result, RelayError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the parameter selecting the output format
pub const FORMAT_PARAM: &str = "format";

/// Output formats understood by format negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Avif,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(OutputFormat::Jpeg),
            "png" => Some(OutputFormat::Png),
            "gif" => Some(OutputFormat::Gif),
            "webp" => Some(OutputFormat::Webp),
            "avif" => Some(OutputFormat::Avif),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::Gif => "gif",
            OutputFormat::Webp => "webp",
            OutputFormat::Avif => "avif",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Gif => "image/gif",
            OutputFormat::Webp => "image/webp",
            OutputFormat::Avif => "image/avif",
        }
    }
}

/// Ordered set of transformation operations
///
/// Raw form is a comma-separated list of `name:value` pairs, e.g.
/// `width:300,op:resize`. Pairs are kept sorted by name, so two parameter
/// strings naming the same operations normalize to the same text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    ops: BTreeMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw parameter string
    ///
    /// An empty string yields empty params. Fails with `InvalidRequest` when
    /// any pair is malformed.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut params = Params::new();
        if raw.is_empty() {
            return Ok(params);
        }

        for pair in raw.split(',') {
            let (name, value) = pair.split_once(':').ok_or_else(|| {
                RelayError::InvalidRequest(format!("expected name:value, got '{}'", pair))
            })?;
            if !is_valid_name(name) {
                return Err(RelayError::InvalidRequest(format!(
                    "invalid parameter name '{}'",
                    name
                )));
            }
            if value.is_empty() || value.contains('/') {
                return Err(RelayError::InvalidRequest(format!(
                    "invalid value for parameter '{}'",
                    name
                )));
            }
            params.ops.insert(name.to_string(), value.to_string());
        }

        Ok(params)
    }

    /// Add or replace an operation
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.ops.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.ops.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.ops.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Requested output format, if any
    pub fn format(&self) -> Option<OutputFormat> {
        self.get(FORMAT_PARAM).and_then(OutputFormat::parse)
    }

    /// Canonical text form, sorted by name
    pub fn normalized(&self) -> String {
        self.ops
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

/// Output formats the caller declared it can display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptHint {
    pub webp: bool,
    pub avif: bool,
}

impl AcceptHint {
    /// Read support flags from an HTTP `Accept` header value
    pub fn from_accept(accept: &str) -> Self {
        let mut hint = AcceptHint::default();
        for item in accept.split(',') {
            let media = item.split(';').next().unwrap_or("").trim();
            match media {
                "image/webp" => hint.webp = true,
                "image/avif" => hint.avif = true,
                _ => {}
            }
        }
        hint
    }
}

/// A request for a transformed image
///
/// Holds the resource key, the raw and parsed parameters, and how the
/// request authenticates itself. Created at request entry and dropped once
/// the response is produced.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub key: String,
    pub raw_params: String,
    pub params: Params,
    pub signature: Option<String>,
    pub is_unsafe: bool,
    pub accept: AcceptHint,
}

impl ImageRequest {
    /// Build a request, parsing `raw_params`
    pub fn new(key: impl Into<String>, raw_params: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(RelayError::InvalidRequest("empty resource key".to_string()));
        }
        let raw_params = raw_params.into();
        let params = Params::parse(&raw_params)?;

        Ok(ImageRequest {
            key,
            raw_params,
            params,
            signature: None,
            is_unsafe: false,
            accept: AcceptHint::default(),
        })
    }

    /// Mark the request as trusted; signature verification is skipped
    pub fn unsafe_request(mut self) -> Self {
        self.is_unsafe = true;
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_accept(mut self, accept: AcceptHint) -> Self {
        self.accept = accept;
        self
    }

    /// The text a signature is computed over: `params/key`, or `key` alone
    pub fn signed_path(&self) -> String {
        signed_path(&self.raw_params, &self.key)
    }
}

/// Join raw params and key the way signatures expect them
pub fn signed_path(raw_params: &str, key: &str) -> String {
    if raw_params.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", raw_params, key)
    }
}
