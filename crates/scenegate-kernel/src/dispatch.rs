//! Static handler table mapping normalized action names to capability
//! handlers supplied by the host adapter.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use crate::host::ObjectHandle;

/// Declared access class of a routed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    Read,
    Mutate,
}

impl OperationClass {
    pub fn is_read(self) -> bool {
        matches!(self, OperationClass::Read)
    }
}

/// Lower-cases `action` and collapses every run of separators (`/ \ . _ -`
/// and whitespace) into a single `/`, trimming them at both ends.
///
/// `Light/Set-Intensity`, `light_set_intensity` and `/light/set/intensity/`
/// all map to `light/set/intensity`.
pub fn normalize_action(action: &str) -> String {
    let mut key = String::with_capacity(action.len());
    let mut pending_sep = false;
    for ch in action.chars() {
        if matches!(ch, '/' | '\\' | '.' | '_' | '-') || ch.is_whitespace() {
            pending_sep = !key.is_empty();
            continue;
        }
        if pending_sep {
            key.push('/');
            pending_sep = false;
        }
        key.extend(ch.to_lowercase());
    }
    key
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("missing argument '{0}'")]
    MissingArgument(String),
    #[error("invalid argument '{key}': {reason}")]
    InvalidArgument { key: String, reason: String },
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(reason: impl fmt::Display) -> Self {
        HandlerError::Failed(reason.to_string())
    }
}

/// What a handler sees: the host, the argument map, the resolved target (if
/// the handler declares one), and a sink for objects it creates.
pub struct HandlerContext<'a, H: ?Sized> {
    pub host: &'a mut H,
    args: &'a IndexMap<String, String>,
    target: Option<ObjectHandle>,
    target_arg: Option<&'a str>,
    created: Vec<ObjectHandle>,
}

impl<'a, H: ?Sized> HandlerContext<'a, H> {
    pub fn new(
        host: &'a mut H,
        args: &'a IndexMap<String, String>,
        target_arg: Option<&'a str>,
        target: Option<ObjectHandle>,
    ) -> Self {
        Self {
            host,
            args,
            target,
            target_arg,
            created: Vec::new(),
        }
    }

    pub fn args(&self) -> &IndexMap<String, String> {
        self.args
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, HandlerError> {
        self.arg(key)
            .ok_or_else(|| HandlerError::MissingArgument(key.to_string()))
    }

    /// Parses an optional argument. Present but unparseable is an error.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, HandlerError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.arg(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|err| HandlerError::InvalidArgument {
                    key: key.to_string(),
                    reason: err.to_string(),
                })
            })
            .transpose()
    }

    /// The resolved target object.
    pub fn target(&self) -> Result<ObjectHandle, HandlerError> {
        self.target.ok_or_else(|| {
            HandlerError::MissingArgument(self.target_arg.unwrap_or("target").to_string())
        })
    }

    /// Reports an object created by this handler so the session can track it.
    pub fn created(&mut self, handle: ObjectHandle) {
        self.created.push(handle);
    }

    pub fn into_created(self) -> Vec<ObjectHandle> {
        self.created
    }
}

pub type HandlerFn<H> =
    Arc<dyn Fn(&mut HandlerContext<'_, H>) -> Result<Value, HandlerError> + Send + Sync>;

pub struct HandlerSpec<H: ?Sized> {
    pub name: String,
    pub class: OperationClass,
    /// Argument carrying the target reference, resolved through the registry
    /// before the handler runs.
    pub target_arg: Option<&'static str>,
    pub handler: HandlerFn<H>,
}

impl<H: ?Sized> Clone for HandlerSpec<H> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            class: self.class,
            target_arg: self.target_arg,
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<H: ?Sized> fmt::Debug for HandlerSpec<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSpec")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("target_arg", &self.target_arg)
            .finish_non_exhaustive()
    }
}

/// Explicit, statically-built handler table keyed by normalized action.
pub struct HandlerTable<H: ?Sized> {
    routes: BTreeMap<String, HandlerSpec<H>>,
}

impl<H: ?Sized> Default for HandlerTable<H> {
    fn default() -> Self {
        Self {
            routes: BTreeMap::new(),
        }
    }
}

impl<H: ?Sized> HandlerTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler with no target argument.
    pub fn register<F>(&mut self, name: &str, class: OperationClass, handler: F) -> &mut Self
    where
        F: Fn(&mut HandlerContext<'_, H>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.insert(name, class, None, handler)
    }

    /// Registers a handler whose `target_arg` is resolved to a live handle
    /// first.
    pub fn register_targeted<F>(
        &mut self,
        name: &str,
        class: OperationClass,
        target_arg: &'static str,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(&mut HandlerContext<'_, H>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.insert(name, class, Some(target_arg), handler)
    }

    fn insert<F>(
        &mut self,
        name: &str,
        class: OperationClass,
        target_arg: Option<&'static str>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(&mut HandlerContext<'_, H>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        let key = normalize_action(name);
        let spec = HandlerSpec {
            name: name.to_string(),
            class,
            target_arg,
            handler: Arc::new(handler),
        };
        if self.routes.insert(key, spec).is_some() {
            log::warn!("handler '{name}' registered twice; keeping the latest");
        }
        self
    }

    pub fn get(&self, action: &str) -> Option<&HandlerSpec<H>> {
        self.routes.get(&normalize_action(action))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.routes.values().map(|spec| spec.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalization_collapses_separators() {
        assert_eq!(normalize_action("Light/Set-Intensity"), "light/set/intensity");
        assert_eq!(normalize_action("light_set_intensity"), "light/set/intensity");
        assert_eq!(normalize_action("//light//set intensity/"), "light/set/intensity");
        assert_eq!(normalize_action("STATUS"), "status");
        assert_eq!(normalize_action("--"), "");
    }

    #[test]
    fn lookup_is_separator_insensitive() {
        let mut table: HandlerTable<()> = HandlerTable::new();
        table.register("object/set-value", OperationClass::Mutate, |_| Ok(json!({})));
        assert!(table.get("Object_Set_Value").is_some());
        assert!(table.get("object/set").is_none());
        assert_eq!(table.names().collect::<Vec<_>>(), ["object/set-value"]);
    }

    #[test]
    fn context_argument_helpers() {
        let mut host = ();
        let args: IndexMap<String, String> = [("count".to_string(), "x".to_string())].into();
        let ctx = HandlerContext::new(&mut host, &args, Some("path"), None);
        assert_eq!(
            ctx.require("name"),
            Err(HandlerError::MissingArgument("name".into()))
        );
        assert!(matches!(
            ctx.parse::<u32>("count"),
            Err(HandlerError::InvalidArgument { .. })
        ));
        assert_eq!(ctx.parse::<u32>("absent"), Ok(None));
        assert_eq!(ctx.target(), Err(HandlerError::MissingArgument("path".into())));
    }
}
