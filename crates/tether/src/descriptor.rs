//! Declarative schema shared by host and client

use crate::error::DescriptorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tether_proto::Address;

/// How a property is exposed across the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    /// A single resolvable value
    Value,
    /// A callable returning a single resolvable value
    Function,
    /// A continuous sequence of values
    ValueStream,
    /// A callable returning a continuous sequence of values
    FunctionStream,
}

impl PropertyKind {
    /// Whether the client side needs a stream constructor for this kind
    pub fn is_stream(self) -> bool {
        matches!(self, Self::ValueStream | Self::FunctionStream)
    }

    /// Whether the property is invoked with arguments
    pub fn is_callable(self) -> bool {
        matches!(self, Self::Function | Self::FunctionStream)
    }
}

/// Channel name plus the kind of every exposed property
///
/// Immutable once built; both sides must agree on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    channel: String,
    properties: BTreeMap<String, PropertyKind>,
}

impl Descriptor {
    /// Start building a descriptor for a channel
    pub fn builder(channel: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            channel: channel.into(),
            properties: Vec::new(),
        }
    }

    /// Build a descriptor from an already assembled property map
    pub fn new(
        channel: impl Into<String>,
        properties: BTreeMap<String, PropertyKind>,
    ) -> Result<Self, DescriptorError> {
        let descriptor = Self {
            channel: channel.into(),
            properties,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Parse and validate a JSON descriptor
    ///
    /// ```json
    /// { "channel": "calc", "properties": { "add": "function", "ticks": "value_stream" } }
    /// ```
    pub fn from_json(source: &str) -> Result<Self, DescriptorError> {
        let descriptor: Self =
            serde_json::from_str(source).map_err(|e| DescriptorError::Parse(e.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> String {
        // a map of strings to unit enums always serializes
        serde_json::to_string(self).unwrap_or_default()
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        if self.channel.is_empty() {
            return Err(DescriptorError::EmptyChannel);
        }
        if self.properties.keys().any(|name| name.is_empty()) {
            return Err(DescriptorError::EmptyPropertyName);
        }
        Ok(())
    }

    /// Channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Transport address requests for this descriptor travel on
    pub fn address(&self) -> Address {
        Address::channel(self.channel.clone())
    }

    /// Kind of a declared property
    pub fn kind(&self, key: &str) -> Option<PropertyKind> {
        self.properties.get(key).copied()
    }

    /// Declared properties in name order
    pub fn properties(&self) -> impl Iterator<Item = (&str, PropertyKind)> {
        self.properties.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    /// Number of declared properties
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether no property is declared
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Whether any property is stream-shaped
    pub fn has_streams(&self) -> bool {
        self.properties.values().any(|kind| kind.is_stream())
    }
}

/// Builder for [`Descriptor`]
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    channel: String,
    properties: Vec<(String, PropertyKind)>,
}

impl DescriptorBuilder {
    /// Declare a property of any kind
    pub fn property(mut self, name: impl Into<String>, kind: PropertyKind) -> Self {
        self.properties.push((name.into(), kind));
        self
    }

    /// Declare a `Value` property
    pub fn value(self, name: impl Into<String>) -> Self {
        self.property(name, PropertyKind::Value)
    }

    /// Declare a `Function` property
    pub fn function(self, name: impl Into<String>) -> Self {
        self.property(name, PropertyKind::Function)
    }

    /// Declare a `ValueStream` property
    pub fn value_stream(self, name: impl Into<String>) -> Self {
        self.property(name, PropertyKind::ValueStream)
    }

    /// Declare a `FunctionStream` property
    pub fn function_stream(self, name: impl Into<String>) -> Self {
        self.property(name, PropertyKind::FunctionStream)
    }

    /// Validate and build
    pub fn build(self) -> Result<Descriptor, DescriptorError> {
        let mut properties = BTreeMap::new();
        for (name, kind) in self.properties {
            if properties.contains_key(&name) {
                return Err(DescriptorError::DuplicateProperty(name));
            }
            properties.insert(name, kind);
        }
        Descriptor::new(self.channel, properties)
    }
}
