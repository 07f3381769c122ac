pub mod memory;

use std::collections::HashMap;

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::feature::{AttrType, Feature, Value};
use crate::geometry::GeometryKind;
use crate::params::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasourceType {
    Vector,
    Raster,
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub attr_type: AttrType,
}

/// What a datasource exposes: its backend name, data class, geometry class
/// (when a single one is known), and the declared attribute schema.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub name: &'static str,
    pub ds_type: DatasourceType,
    pub geometry_kind: Option<GeometryKind>,
    pub fields: Vec<FieldDescriptor>,
    pub encoding: String,
}

/// A bounding-box query with an optional attribute-name restriction.
/// `properties: None` requests every attribute.
#[derive(Debug, Clone)]
pub struct Query {
    pub bbox: Envelope<f64>,
    pub properties: Option<Vec<String>>,
    pub variables: HashMap<String, Value>,
}

impl Query {
    pub fn new(bbox: Envelope<f64>) -> Self {
        Query {
            bbox,
            properties: None,
            variables: HashMap::new(),
        }
    }

    pub fn with_properties<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub(crate) fn wants(&self, name: &str) -> bool {
        match &self.properties {
            None => true,
            Some(names) => names.iter().any(|n| n == name),
        }
    }
}

/// Lazy, single-pass sequence of features produced by a query. `next` may
/// block on I/O; per-record failures surface as `Err` items, after which a
/// non-strict featureset keeps yielding the remaining valid features.
pub trait Featureset {
    fn next(&mut self) -> Option<Result<Feature>>;
}

/// The backend-agnostic datasource handle. Implementations are read-only
/// after construction, so a datasource may be shared across threads while
/// each query owns its private featureset.
pub trait Datasource: Send + Sync {
    fn descriptor(&self) -> &Descriptor;

    /// Full-data envelope, from the index, a bulk scan, or the `extent`
    /// parameter.
    fn envelope(&self) -> Envelope<f64>;

    fn features(&self, query: &Query) -> Result<Box<dyn Featureset + Send>>;

    fn features_at_point(&self, x: f64, y: f64, tolerance: f64) -> Result<Box<dyn Featureset + Send>> {
        let bbox = Envelope::new(x - tolerance, y - tolerance, x + tolerance, y + tolerance);
        self.features(&Query::new(bbox))
    }
}

impl std::fmt::Debug for dyn Datasource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datasource")
            .field("descriptor", self.descriptor())
            .finish()
    }
}

type Constructor = fn(&Params) -> Result<Box<dyn Datasource>>;

/// Static backend registry, looked up by the `type` parameter. Registration
/// is a table entry, not a dynamic library.
pub static PLUGINS: &[(&str, Constructor)] = &[
    ("csv", crate::csv::create),
    ("geojson", crate::geojson::create),
    ("topojson", crate::topojson::create),
    ("geobuf", crate::geobuf::create),
    ("shape", crate::shape::create),
    ("memory", memory::create),
];

/// Constructs a datasource from a parameter bag.
pub fn open(params: &Params) -> Result<Box<dyn Datasource>> {
    let kind = params.required_text("type")?;
    match PLUGINS.iter().find(|(name, _)| *name == kind) {
        Some((_, constructor)) => constructor(params),
        None => Err(Error::UnknownBackend(kind)),
    }
}

/// Clones a feature keeping only the attributes a query asked for.
pub(crate) fn restrict_to_query(feature: &Feature, query: &Query) -> Feature {
    match &query.properties {
        None => feature.clone(),
        Some(_) => {
            let mut out = Feature::new(feature.id(), feature.context().clone());
            out.geometry = feature.geometry.clone();
            for (name, value) in feature.iter() {
                if query.wants(name) {
                    if let Some(index) = feature.context().lookup(name) {
                        out.put_by_index(index, value.clone());
                    }
                }
            }
            out
        }
    }
}
