use std::sync::Arc;

use tabflow_api::{Part, Schema};

use crate::buffer::Buffer;
use crate::error::EngineError;

/// A schema plus the Parts it describes; the unit a Plan runs over.
///
/// Cheap to clone. Every plan execution opens its own Buffer, so one Frame
/// can serve any number of plans.
#[derive(Clone)]
pub struct Frame {
    schema: Arc<Schema>,
    parts: Arc<[Arc<dyn Part>]>,
}

impl Frame {
    /// Build a Frame whose schema is the union of every Part's schema.
    ///
    /// Fails with a Schema error when there are no Parts, when a Part can't
    /// report its schema, or when the union has no columns.
    pub fn from_parts(parts: Vec<Arc<dyn Part>>) -> Result<Self, EngineError> {
        if parts.is_empty() {
            return Err(EngineError::Schema("frame has no parts".into()));
        }

        let mut merged: Option<Schema> = None;
        for part in &parts {
            let schema = part
                .schema()
                .map_err(|e| EngineError::Schema(format!("part '{}': {e}", part.name())))?;
            merged = Some(match merged {
                Some(acc) => acc.merge(&schema),
                None => schema,
            });
        }

        let schema = merged.unwrap_or_default();
        if schema.is_empty() {
            return Err(EngineError::Schema("frame schema has no columns".into()));
        }

        tracing::debug!(parts = parts.len(), columns = schema.len(), "frame schema merged");
        Ok(Self::with_schema(schema, parts))
    }

    /// Build a Frame with an explicit schema. Part columns missing from it
    /// are dropped; frame columns missing from a Part read as null.
    pub fn with_schema(schema: Schema, parts: Vec<Arc<dyn Part>>) -> Self {
        Self {
            schema: Arc::new(schema),
            parts: parts.into(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn parts(&self) -> &[Arc<dyn Part>] {
        &self.parts
    }

    /// Open a fresh Buffer over all Parts.
    pub fn buffer(&self) -> Buffer {
        Buffer::new(Arc::clone(&self.schema), &self.parts)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("schema", &self.schema.to_string())
            .field("parts", &self.parts.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}
