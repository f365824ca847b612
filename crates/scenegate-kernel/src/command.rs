//! Inbound command model shared by both intake channels.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// Capability tag that marks a command as read-only.
pub const READ_CAPABILITY: &str = "read";

/// Declared permission tag on a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    Read,
    Mutate(String),
}

impl Capability {
    /// Parses a declared tag. Empty tags mean "not declared".
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        if tag.is_empty() {
            None
        } else if tag.eq_ignore_ascii_case(READ_CAPABILITY) {
            Some(Capability::Read)
        } else {
            Some(Capability::Mutate(tag.to_string()))
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Capability::Read)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Capability::Read => READ_CAPABILITY,
            Capability::Mutate(tag) => tag,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized request as it appears in a mailbox file or inside a recipe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCommand {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    #[serde(default)]
    pub values: Option<Vec<String>>,
}

/// A parsed, immutable command. Consumed exactly once by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    action: String,
    id: Option<String>,
    capability: Option<Capability>,
    args: IndexMap<String, String>,
}

impl Command {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            id: None,
            capability: None,
            args: IndexMap::new(),
        }
    }

    pub fn with_capability(mut self, tag: &str) -> Self {
        self.capability = Capability::parse(tag);
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Builds a command from parallel key/value arrays; duplicate keys keep the
    /// last value.
    pub fn from_pairs<I, K, V>(
        action: impl Into<String>,
        capability: Option<&str>,
        pairs: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut args = IndexMap::new();
        for (key, value) in pairs {
            args.insert(key.into(), value.into());
        }
        Self {
            action: action.into(),
            id: None,
            capability: capability.and_then(Capability::parse),
            args,
        }
    }

    pub fn from_wire(wire: WireCommand) -> Result<Self, KernelError> {
        if wire.action.trim().is_empty() {
            return Err(KernelError::MalformedCommand("missing action".into()));
        }
        let keys = wire.keys.unwrap_or_default();
        let values = wire.values.unwrap_or_default();
        if keys.len() != values.len() {
            return Err(KernelError::MalformedCommand(format!(
                "{} keys but {} values",
                keys.len(),
                values.len()
            )));
        }
        let mut cmd = Command::from_pairs(
            wire.action,
            wire.capability.as_deref(),
            keys.into_iter().zip(values),
        );
        cmd.id = wire.id;
        Ok(cmd)
    }

    /// Parses a JSON mailbox payload.
    pub fn from_json(text: &str) -> Result<Self, KernelError> {
        let wire: WireCommand = serde_json::from_str(text)
            .map_err(|err| KernelError::MalformedCommand(err.to_string()))?;
        Command::from_wire(wire)
    }

    pub fn to_wire(&self) -> WireCommand {
        WireCommand {
            action: self.action.clone(),
            id: self.id.clone(),
            capability: self.capability.as_ref().map(|c| c.as_str().to_string()),
            keys: Some(self.args.keys().cloned().collect()),
            values: Some(self.args.values().cloned().collect()),
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn capability(&self) -> Option<&Capability> {
        self.capability.as_ref()
    }

    pub fn args(&self) -> &IndexMap<String, String> {
        &self.args
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

/// Ordered list of sub-commands executed as one implicit transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub tools: Vec<WireCommand>,
}

impl Recipe {
    pub fn from_json(text: &str) -> Result<Self, KernelError> {
        serde_json::from_str(text)
            .map_err(|err| KernelError::MalformedCommand(format!("malformed recipe: {err}")))
    }
}
