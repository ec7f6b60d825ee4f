//! Initial values for blocks inserted from a toolbar.
//!
//! Resolution may be slow (a remote template, a user prompt). When it takes
//! longer than the configured threshold a [`Notice::ResolvingInitialValue`]
//! goes out, followed by [`Notice::InitialValueResolved`] once it finishes or
//! [`Notice::InitialValueFailed`] if it does not.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use web_time::Instant;

use crate::document::{BLOCK_TYPE, Block, InlineObject, ObjectBlock, Span, TextBlock};
use crate::events::{EventBus, Notice};

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{0}")]
pub struct ResolveError(pub String);

/// Supplies the starting value for a new block of a given type.
#[async_trait]
pub trait InitialValueResolver: Send + Sync {
    /// `Ok(None)` means the type has no initial value.
    async fn resolve(&self, type_name: &str) -> Result<Option<Value>, ResolveError>;
}

/// Fixed values per type, with optional latency and failures.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    values: HashMap<String, Value>,
    failures: HashMap<String, String>,
    delay: Duration,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, type_name: impl Into<String>, value: Value) -> Self {
        self.values.insert(type_name.into(), value);
        self
    }

    pub fn with_failure(mut self, type_name: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.insert(type_name.into(), message.into());
        self
    }

    /// Wait this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl InitialValueResolver for StaticResolver {
    async fn resolve(&self, type_name: &str) -> Result<Option<Value>, ResolveError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = self.failures.get(type_name) {
            return Err(ResolveError(message.clone()));
        }
        Ok(self.values.get(type_name).cloned())
    }
}

/// Resolve `type_name`, emitting notices when it is slow or fails.
///
/// A failed resolution is reported and yields an empty value.
pub async fn resolve_with_notice(
    resolver: &dyn InitialValueResolver,
    type_name: &str,
    slow_notice: Duration,
    notices: &Arc<EventBus<Notice>>,
) -> Value {
    let started = Instant::now();
    let mut resolution = resolver.resolve(type_name);

    let result = match tokio::time::timeout(slow_notice, &mut resolution).await {
        Ok(result) => result,
        Err(_) => {
            notices.emit(Notice::ResolvingInitialValue {
                type_name: type_name.to_string(),
            });
            let result = resolution.await;
            if result.is_ok() {
                notices.emit(Notice::InitialValueResolved {
                    type_name: type_name.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            result
        }
    };

    match result {
        Ok(value) => {
            debug!(type_name, elapsed = ?started.elapsed(), "Resolved initial value");
            value.unwrap_or_else(|| Value::Object(Map::new()))
        }
        Err(error) => {
            let message = format!("Unable to resolve initial value for type: {type_name}: {error}.");
            warn!("{message}");
            notices.emit(Notice::InitialValueFailed { message });
            Value::Object(Map::new())
        }
    }
}

/// Build an unkeyed block of `type_name` from its initial value.
///
/// Keys are assigned when the block is inserted.
pub fn initial_block(type_name: &str, value: Value) -> Block {
    let mut fields = match value {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };

    if type_name == BLOCK_TYPE {
        fields.insert("_key".into(), Value::String(String::new()));
        fields.insert("_type".into(), Value::String(BLOCK_TYPE.into()));
        let mut block =
            Block::try_from(Value::Object(fields)).unwrap_or_else(|_| TextBlock::new("", Vec::new()).into());
        if let Block::Text(text) = &mut block {
            if text.children.is_empty() {
                text.children.push(Span::new("", "").into());
            }
        }
        return block;
    }

    let mut object = ObjectBlock::new("", type_name);
    object.fields = initial_fields(Value::Object(fields));
    object.into()
}

/// Build an unkeyed inline object of `type_name` from its initial value.
pub fn initial_inline_object(type_name: &str, value: Value) -> InlineObject {
    InlineObject {
        key: "".into(),
        object_type: type_name.to_string(),
        fields: initial_fields(value),
    }
}

/// Fields of an annotation of some type, from its initial value.
pub fn initial_fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(fields) => fields.into_iter().filter(|(k, _)| !k.starts_with('_')).collect(),
        _ => Map::new(),
    }
}
