//! Render engine plugins and their registry.
//!
//! A serializer configuration may name a render engine by plugin class.
//! The registry resolves that name to a loaded plugin.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::domain::ModelObject;

/// Plugin class of the built-in bounding box engine
pub const BOUNDING_BOX_ENGINE: &str = "bounding-box";

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("render engine plugin '{0}' is not installed")]
    MissingRenderEngine(String),
}

/// Axis-aligned bounds of an object
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

/// Computes geometry for model objects
pub trait RenderEnginePlugin: Send + Sync {
    /// Plugin class name
    fn name(&self) -> &str;

    /// Bounds of the object, if it has geometry
    fn bounds(&self, object: &ModelObject) -> Option<Bounds>;
}

/// Resolves plugins by class name
pub trait PluginManager: Send + Sync {
    /// Look up a render engine.
    ///
    /// Returns `Ok(None)` for a missing engine unless `required` is set.
    fn render_engine(
        &self,
        plugin_class: &str,
        required: bool,
    ) -> Result<Option<Arc<dyn RenderEnginePlugin>>, PluginError>;
}

/// In-process plugin registry
pub struct PluginRegistry {
    render_engines: HashMap<String, Arc<dyn RenderEnginePlugin>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_render_engine(Arc::new(BoundingBoxRenderEngine));
        registry
    }
}

impl PluginRegistry {
    /// Registry without any plugins
    pub fn empty() -> Self {
        Self {
            render_engines: HashMap::new(),
        }
    }

    pub fn register_render_engine(&mut self, engine: Arc<dyn RenderEnginePlugin>) {
        self.render_engines.insert(engine.name().to_string(), engine);
    }

    pub fn render_engine_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.render_engines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl PluginManager for PluginRegistry {
    fn render_engine(
        &self,
        plugin_class: &str,
        required: bool,
    ) -> Result<Option<Arc<dyn RenderEnginePlugin>>, PluginError> {
        match self.render_engines.get(plugin_class) {
            Some(engine) => Ok(Some(Arc::clone(engine))),
            None if required => Err(PluginError::MissingRenderEngine(plugin_class.to_string())),
            None => Ok(None),
        }
    }
}

/// Derives bounds from `placement` and `extent` attributes.
///
/// Both attributes are `[x, y, z]` arrays; `extent` defaults to zero.
pub struct BoundingBoxRenderEngine;

impl RenderEnginePlugin for BoundingBoxRenderEngine {
    fn name(&self) -> &str {
        BOUNDING_BOX_ENGINE
    }

    fn bounds(&self, object: &ModelObject) -> Option<Bounds> {
        let placement = vector(object.attributes.get("placement")?)?;
        let extent = match object.attributes.get("extent") {
            Some(value) => vector(value)?,
            None => [0.0; 3],
        };

        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for axis in 0..3 {
            let end = placement[axis] + extent[axis];
            min[axis] = placement[axis].min(end);
            max[axis] = placement[axis].max(end);
        }

        Some(Bounds { min, max })
    }
}

fn vector(value: &Value) -> Option<[f64; 3]> {
    let items = value.as_array()?;
    if items.len() != 3 {
        return None;
    }
    Some([items[0].as_f64()?, items[1].as_f64()?, items[2].as_f64()?])
}
