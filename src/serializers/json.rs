//! JSON document serializer.
//!
//! Output shape:
//! `{"name": ..., "revision": n, "objects": [{"oid", "type", "attributes", "bounds"?}, ...]}`
//!
//! Output depends only on the model and the request parameters, which is
//! what makes it safe to cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::domain::Model;
use crate::plugins::{Bounds, RenderEnginePlugin};

use super::{batch_size, SerializerContext, SerializerError, Serializer, TypeFilter};

const DEFAULT_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Objects,
    Done,
}

#[derive(Serialize)]
struct ObjectView<'a> {
    oid: i64,
    #[serde(rename = "type")]
    type_name: &'a str,
    attributes: &'a BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bounds: Option<Bounds>,
}

pub struct JsonSerializer {
    model: Arc<Model>,
    render_engine: Option<Arc<dyn RenderEnginePlugin>>,
    filter: TypeFilter,
    batch: usize,
    stage: Stage,
    position: usize,
    wrote_object: bool,
}

impl JsonSerializer {
    pub fn new(context: SerializerContext) -> Result<Self, SerializerError> {
        Ok(Self {
            filter: TypeFilter::from_params(&context.params)?,
            batch: batch_size(&context.params, DEFAULT_BATCH)?,
            model: context.model,
            render_engine: context.render_engine,
            stage: Stage::Header,
            position: 0,
            wrote_object: false,
        })
    }

    fn header(&self) -> Result<Vec<u8>, SerializerError> {
        let mut out = Vec::new();
        out.extend_from_slice(b"{\"name\":");
        serde_json::to_writer(&mut out, &self.model.name)?;
        out.extend_from_slice(format!(",\"revision\":{},\"objects\":[", self.model.revision_number).as_bytes());
        Ok(out)
    }

    fn next_batch(&mut self) -> Result<Option<Vec<u8>>, SerializerError> {
        let mut out = Vec::new();
        let mut written = 0;

        while written < self.batch && self.position < self.model.objects.len() {
            let object = &self.model.objects[self.position];
            self.position += 1;
            if !self.filter.matches(object) {
                continue;
            }

            if self.wrote_object {
                out.push(b',');
            }
            let view = ObjectView {
                oid: object.oid,
                type_name: &object.type_name,
                attributes: &object.attributes,
                bounds: self.render_engine.as_ref().and_then(|engine| engine.bounds(object)),
            };
            serde_json::to_writer(&mut out, &view)?;
            self.wrote_object = true;
            written += 1;
        }

        Ok(if written == 0 { None } else { Some(out) })
    }
}

impl Serializer for JsonSerializer {
    fn allow_caching(&self) -> bool {
        true
    }

    fn extension(&self) -> &str {
        "json"
    }

    fn next_chunk(&mut self) -> Result<Option<Bytes>, SerializerError> {
        match self.stage {
            Stage::Header => {
                self.stage = Stage::Objects;
                Ok(Some(Bytes::from(self.header()?)))
            }
            Stage::Objects => match self.next_batch()? {
                Some(chunk) => Ok(Some(Bytes::from(chunk))),
                None => {
                    self.stage = Stage::Done;
                    Ok(Some(Bytes::from_static(b"]}")))
                }
            },
            Stage::Done => Ok(None),
        }
    }
}
