use std::collections::BTreeMap;
use std::sync::Arc;

use geo::{LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};
use serde::Deserialize;

use crate::datasource::{Datasource, DatasourceType, Descriptor, Featureset, FieldDescriptor, Query};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::feature::{AttrType, Context, Feature};
use crate::geojson::{json_to_value, CachedFeatureset};
use crate::geometry::Geometry;
use crate::index::{IndexRecord, QuadTree};
use crate::params::Params;
use crate::source::ByteSource;

/// A TopoJSON topology: shared arcs plus named geometry objects that
/// reference them by signed index.
#[derive(Debug, Deserialize)]
pub struct Topology {
    #[serde(rename = "type")]
    topo_type: String,
    objects: BTreeMap<String, TopoGeometry>,
    arcs: Vec<Vec<Vec<f64>>>,
    #[serde(default)]
    transform: Option<Transform>,
}

/// Quantization transform: arc positions are delta-encoded integers which,
/// after a cumulative sum, map through `(x * sx + tx, y * sy + ty)`.
#[derive(Debug, Deserialize)]
struct Transform {
    scale: [f64; 2],
    translate: [f64; 2],
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum TopoGeometry {
    Point {
        coordinates: Vec<f64>,
        #[serde(default)]
        properties: Option<serde_json::Map<String, serde_json::Value>>,
    },
    MultiPoint {
        coordinates: Vec<Vec<f64>>,
        #[serde(default)]
        properties: Option<serde_json::Map<String, serde_json::Value>>,
    },
    LineString {
        arcs: Vec<i64>,
        #[serde(default)]
        properties: Option<serde_json::Map<String, serde_json::Value>>,
    },
    MultiLineString {
        arcs: Vec<Vec<i64>>,
        #[serde(default)]
        properties: Option<serde_json::Map<String, serde_json::Value>>,
    },
    Polygon {
        arcs: Vec<Vec<i64>>,
        #[serde(default)]
        properties: Option<serde_json::Map<String, serde_json::Value>>,
    },
    MultiPolygon {
        arcs: Vec<Vec<Vec<i64>>>,
        #[serde(default)]
        properties: Option<serde_json::Map<String, serde_json::Value>>,
    },
    GeometryCollection {
        geometries: Vec<TopoGeometry>,
        #[serde(default)]
        properties: Option<serde_json::Map<String, serde_json::Value>>,
    },
}

impl TopoGeometry {
    fn properties(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self {
            TopoGeometry::Point { properties, .. }
            | TopoGeometry::MultiPoint { properties, .. }
            | TopoGeometry::LineString { properties, .. }
            | TopoGeometry::MultiLineString { properties, .. }
            | TopoGeometry::Polygon { properties, .. }
            | TopoGeometry::MultiPolygon { properties, .. }
            | TopoGeometry::GeometryCollection { properties, .. } => properties.as_ref(),
        }
    }
}

pub struct TopojsonDatasource {
    features: Arc<Vec<Feature>>,
    tree: QuadTree,
    extent: Envelope<f64>,
    desc: Descriptor,
}

pub fn create(params: &Params) -> Result<Box<dyn Datasource>> {
    Ok(Box::new(TopojsonDatasource::from_params(params)?))
}

impl TopojsonDatasource {
    pub fn from_params(params: &Params) -> Result<Self> {
        let strict = params.get_bool("strict")?.unwrap_or(false);
        let encoding = params.get_text("encoding").unwrap_or_else(|| "utf-8".into());
        let path = params.resolve_path()?;
        let source = ByteSource::open(&path)?;
        let data = source.read_all()?;

        let topology: Topology = serde_json::from_slice(&data)
            .map_err(|err| Error::MalformedFile(format!("invalid topology: {err}")))?;
        if topology.topo_type != "Topology" {
            return Err(Error::MalformedFile(format!(
                "expected type 'Topology', found '{}'",
                topology.topo_type
            )));
        }

        let arcs = decode_arcs(&topology);
        let transform = topology.transform.as_ref();

        // Flatten the named objects: a GeometryCollection contributes one
        // feature per member, anything else is a single feature.
        let mut raw: Vec<(Geometry, Option<serde_json::Map<String, serde_json::Value>>)> =
            Vec::new();
        for object in topology.objects.values() {
            match object {
                TopoGeometry::GeometryCollection { geometries, .. } => {
                    for member in geometries {
                        if matches!(member, TopoGeometry::GeometryCollection { .. }) {
                            return Err(Error::MalformedFile(
                                "GeometryCollection may not contain another GeometryCollection"
                                    .into(),
                            ));
                        }
                        raw.push((
                            materialize(member, &arcs, transform)?,
                            member.properties().cloned(),
                        ));
                    }
                }
                other => raw.push((
                    materialize(other, &arcs, transform)?,
                    other.properties().cloned(),
                )),
            }
        }

        // Schema: union of property names, reported alphabetically.
        let mut types: BTreeMap<String, AttrType> = BTreeMap::new();
        for (_, properties) in &raw {
            if let Some(map) = properties {
                for (name, value) in map {
                    types.entry(name.clone()).or_insert_with(|| match value {
                        serde_json::Value::Bool(_) => AttrType::Bool,
                        serde_json::Value::Number(n) if n.is_i64() => AttrType::Integer,
                        serde_json::Value::Number(_) => AttrType::Double,
                        _ => AttrType::Text,
                    });
                }
            }
        }
        let ctx = Arc::new(Context::from_names(types.keys().cloned()));

        let mut extent = Envelope::invalid();
        let mut envelopes = Vec::with_capacity(raw.len());
        for (geometry, _) in &raw {
            let env = geometry.envelope();
            extent.expand_to_include(&env);
            envelopes.push(env);
        }

        let mut features = Vec::with_capacity(raw.len());
        let mut tree = QuadTree::new(extent.to_f32());
        let mut geometry_kind = None;
        for (i, (geometry, properties)) in raw.into_iter().enumerate() {
            if geometry_kind.is_none() {
                geometry_kind = geometry.kind();
            }
            let mut feature = Feature::new(features.len() as u64 + 1, ctx.clone());
            feature.geometry = geometry;
            if let Some(map) = properties {
                for (name, value) in &map {
                    if let Some(slot) = ctx.lookup(name) {
                        feature.put_by_index(slot, json_to_value(value));
                    }
                }
            }
            if envelopes[i].valid() {
                tree.insert(IndexRecord {
                    offset: features.len() as u64,
                    size: 0,
                    envelope: envelopes[i].to_f32(),
                });
            } else if strict {
                return Err(Error::MalformedFile(format!(
                    "object {i} has no usable geometry"
                )));
            } else {
                log::warn!("topojson: object {i} has no usable geometry");
            }
            features.push(feature);
        }
        tree.trim();

        let extent = match params.get_text("extent") {
            Some(text) => text.parse()?,
            None => extent,
        };

        let desc = Descriptor {
            name: "topojson",
            ds_type: DatasourceType::Vector,
            geometry_kind,
            fields: types
                .into_iter()
                .map(|(name, attr_type)| FieldDescriptor { name, attr_type })
                .collect(),
            encoding,
        };

        Ok(TopojsonDatasource {
            features: Arc::new(features),
            tree,
            extent,
            desc,
        })
    }
}

impl Datasource for TopojsonDatasource {
    fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    fn envelope(&self) -> Envelope<f64> {
        self.extent
    }

    fn features(&self, query: &Query) -> Result<Box<dyn Featureset + Send>> {
        let mut hits: Vec<usize> = self
            .tree
            .query(&query.bbox)
            .iter()
            .map(|r| r.offset as usize)
            .collect();
        hits.sort_unstable();
        Ok(Box::new(CachedFeatureset::new(
            self.features.clone(),
            hits,
            query,
        )))
    }
}

/// Undoes quantization: cumulative sum of the deltas, then the affine
/// transform. Untransformed topologies pass positions through unchanged.
fn decode_arcs(topology: &Topology) -> Vec<Vec<(f64, f64)>> {
    topology
        .arcs
        .iter()
        .map(|arc| match &topology.transform {
            Some(transform) => {
                let mut x = 0.0f64;
                let mut y = 0.0f64;
                arc.iter()
                    .filter(|pos| pos.len() >= 2)
                    .map(|pos| {
                        x += pos[0];
                        y += pos[1];
                        (
                            x * transform.scale[0] + transform.translate[0],
                            y * transform.scale[1] + transform.translate[1],
                        )
                    })
                    .collect()
            }
            None => arc
                .iter()
                .filter(|pos| pos.len() >= 2)
                .map(|pos| (pos[0], pos[1]))
                .collect(),
        })
        .collect()
}

fn transform_point(pos: &[f64], transform: Option<&Transform>, what: &str) -> Result<Point<f64>> {
    if pos.len() < 2 {
        return Err(Error::MalformedFile(format!(
            "{what} with fewer than two coordinates"
        )));
    }
    Ok(match transform {
        Some(t) => Point::new(
            pos[0] * t.scale[0] + t.translate[0],
            pos[1] * t.scale[1] + t.translate[1],
        ),
        None => Point::new(pos[0], pos[1]),
    })
}

/// Stitches an arc-index chain into one coordinate run. A negative index
/// `-i-1` walks arc `i` backwards; consecutive arcs share their join point,
/// which is emitted once.
fn stitch(indices: &[i64], arcs: &[Vec<(f64, f64)>]) -> Result<Vec<(f64, f64)>> {
    let mut run: Vec<(f64, f64)> = Vec::new();
    for &signed in indices {
        let (index, reversed) = if signed < 0 {
            ((-signed - 1) as usize, true)
        } else {
            (signed as usize, false)
        };
        let arc = arcs.get(index).ok_or_else(|| {
            Error::MalformedFile(format!("arc index {signed} out of range"))
        })?;
        let points: Vec<(f64, f64)> = if reversed {
            arc.iter().rev().copied().collect()
        } else {
            arc.clone()
        };
        let skip_join = match (run.last(), points.first()) {
            (Some(last), Some(first)) => last == first,
            _ => false,
        };
        run.extend(points.into_iter().skip(skip_join as usize));
    }
    Ok(run)
}

fn stitch_ring(indices: &[i64], arcs: &[Vec<(f64, f64)>]) -> Result<LineString<f64>> {
    let mut run = stitch(indices, arcs)?;
    if run.first() != run.last() {
        if let Some(first) = run.first().copied() {
            run.push(first);
        }
    }
    Ok(LineString::from(run))
}

fn stitch_polygon(rings: &[Vec<i64>], arcs: &[Vec<(f64, f64)>]) -> Result<Polygon<f64>> {
    let mut iter = rings.iter();
    let exterior = match iter.next() {
        Some(ring) => stitch_ring(ring, arcs)?,
        None => {
            return Err(Error::MalformedFile("polygon without an exterior ring".into()))
        }
    };
    let mut interiors = Vec::new();
    for ring in iter {
        interiors.push(stitch_ring(ring, arcs)?);
    }
    Ok(Polygon::new(exterior, interiors))
}

fn materialize(
    object: &TopoGeometry,
    arcs: &[Vec<(f64, f64)>],
    transform: Option<&Transform>,
) -> Result<Geometry> {
    Ok(match object {
        TopoGeometry::Point { coordinates, .. } => {
            Geometry::Point(transform_point(coordinates, transform, "point")?)
        }
        TopoGeometry::MultiPoint { coordinates, .. } => {
            let mut points = Vec::with_capacity(coordinates.len());
            for pos in coordinates {
                points.push(transform_point(pos, transform, "point")?);
            }
            Geometry::MultiPoint(MultiPoint(points))
        }
        TopoGeometry::LineString { arcs: indices, .. } => {
            Geometry::LineString(LineString::from(stitch(indices, arcs)?))
        }
        TopoGeometry::MultiLineString { arcs: lines, .. } => {
            let mut parts = Vec::with_capacity(lines.len());
            for indices in lines {
                parts.push(LineString::from(stitch(indices, arcs)?));
            }
            Geometry::MultiLineString(MultiLineString(parts))
        }
        TopoGeometry::Polygon { arcs: rings, .. } => {
            Geometry::Polygon(stitch_polygon(rings, arcs)?)
        }
        TopoGeometry::MultiPolygon { arcs: polys, .. } => {
            let mut parts = Vec::with_capacity(polys.len());
            for rings in polys {
                parts.push(stitch_polygon(rings, arcs)?);
            }
            Geometry::MultiPolygon(MultiPolygon(parts))
        }
        TopoGeometry::GeometryCollection { .. } => {
            // Collections are flattened by the caller; reaching one here
            // means it was nested.
            return Err(Error::MalformedFile(
                "GeometryCollection may not contain another GeometryCollection".into(),
            ));
        }
    })
}
