//! Geospatial tabular-data ingestion and spatial indexing: CSV, GeoJSON,
//! TopoJSON, Geobuf, and ESRI shapefile sources behind one datasource and
//! featureset interface, accelerated by a disk-serializable quadtree.

pub mod csv;
pub mod datasource;
pub mod envelope;
pub mod error;
pub mod feature;
pub mod geobuf;
pub mod geojson;
pub mod geometry;
pub mod index;
pub mod params;
pub mod shape;
pub mod source;
pub mod topojson;

pub use datasource::{open, Datasource, Descriptor, Featureset, Query};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use feature::{AttrType, Context, Feature, Value};
pub use geometry::{Geometry, GeometryKind};
pub use params::{ParamValue, Params};
