pub mod extract;
mod featureset;

use std::collections::BTreeMap;
use std::sync::Arc;

use geo::{LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};

use crate::datasource::{Datasource, DatasourceType, Descriptor, Featureset, FieldDescriptor, Query};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::feature::{AttrType, Context, Feature, Value};
use crate::geometry::Geometry;
use crate::index::file::open_sidecar;
use crate::index::{IndexRecord, QuadTree, SpatialIndex};
use crate::params::Params;
use crate::source::ByteSource;
use extract::{extract_feature_boxes, TopLevel};
use featureset::GeojsonFeatureset;
pub(crate) use featureset::CachedFeatureset;

/// Shared, immutable pieces a featureset needs to materialize records.
#[derive(Debug)]
pub(crate) struct GeojsonLayout {
    pub ctx: Arc<Context>,
    pub kind: TopLevel,
    pub strict: bool,
}

enum Mode {
    /// The quadtree holds byte ranges; hits are re-parsed on demand.
    Indexed(SpatialIndex),
    /// Everything parsed up front; the quadtree holds vector indices.
    Cached {
        features: Arc<Vec<Feature>>,
        tree: QuadTree,
    },
}

pub struct GeojsonDatasource {
    source: Arc<ByteSource>,
    layout: Arc<GeojsonLayout>,
    mode: Mode,
    extent: Envelope<f64>,
    desc: Descriptor,
}

pub fn create(params: &Params) -> Result<Box<dyn Datasource>> {
    Ok(Box::new(GeojsonDatasource::from_params(params)?))
}

impl GeojsonDatasource {
    pub fn from_params(params: &Params) -> Result<Self> {
        let strict = params.get_bool("strict")?.unwrap_or(false);
        let cache_features = params.get_bool("cache_features")?.unwrap_or(false);
        // Negative means "sample every feature"; the indexed default keeps
        // schema discovery to the first record.
        let sample = params.get_int("num_features_to_query")?.unwrap_or(1);
        let encoding = params.get_text("encoding").unwrap_or_else(|| "utf-8".into());

        let inline = params.get_text("inline");
        if inline.is_some() && params.contains("file") {
            return Err(Error::InvalidParam {
                key: "inline".into(),
                reason: "'inline' and 'file' are mutually exclusive".into(),
            });
        }
        let (source, path) = match inline {
            Some(text) => (ByteSource::from_bytes(text.into_bytes()), None),
            None => {
                let path = params.resolve_path()?;
                (ByteSource::open(&path)?, Some(path))
            }
        };
        let source = Arc::new(source);
        let data = source.read_all()?;

        let extracted = extract_feature_boxes(&data)?;
        if strict {
            let trailing = data[extracted.consumed..]
                .iter()
                .any(|c| !c.is_ascii_whitespace());
            if trailing {
                return Err(Error::MalformedFile(
                    "trailing content after top-level JSON value".into(),
                ));
            }
        }

        let explicit_sample = params.contains("num_features_to_query");
        let sample_count = if sample < 0 || (cache_features && !explicit_sample) {
            extracted.boxes.len()
        } else {
            (sample.max(1) as usize).min(extracted.boxes.len())
        };
        let (ctx, fields, geometry_kind) =
            discover_schema(&data, &extracted.boxes[..sample_count], extracted.kind, strict)?;
        let ctx = Arc::new(ctx);
        let layout = Arc::new(GeojsonLayout {
            ctx: ctx.clone(),
            kind: extracted.kind,
            strict,
        });

        let mut extent = Envelope::invalid();
        for feature_box in &extracted.boxes {
            extent.expand_to_include(&feature_box.envelope);
        }

        let mode = if cache_features {
            let mut features = Vec::with_capacity(extracted.boxes.len());
            let mut tree = QuadTree::new(extent.to_f32());
            for (i, feature_box) in extracted.boxes.iter().enumerate() {
                let slice = source.read(feature_box.offset, feature_box.size as usize)?;
                match parse_feature_slice(
                    &slice,
                    feature_box.offset,
                    features.len() as u64 + 1,
                    &layout,
                    &None,
                ) {
                    Ok(feature) => {
                        tree.insert(IndexRecord {
                            offset: features.len() as u64,
                            size: 0,
                            envelope: feature_box.envelope.to_f32(),
                        });
                        features.push(feature);
                    }
                    Err(err) if strict => return Err(err),
                    Err(err) => {
                        log::warn!("geojson: skipping feature {i}: {err}");
                    }
                }
            }
            tree.trim();
            Mode::Cached {
                features: Arc::new(features),
                tree,
            }
        } else {
            let sidecar = match &path {
                Some(path) => open_sidecar(path, strict)?,
                None => None,
            };
            let index = match sidecar {
                Some(file) => SpatialIndex::Disk(file),
                None => {
                    let mut tree = QuadTree::new(extent.to_f32());
                    for feature_box in &extracted.boxes {
                        if !feature_box.envelope.valid() {
                            if strict {
                                return Err(Error::malformed_record(
                                    feature_box.offset,
                                    "feature without a usable geometry",
                                    &data[feature_box.offset as usize..],
                                ));
                            }
                            log::warn!(
                                "geojson: feature at byte {} has no usable geometry",
                                feature_box.offset
                            );
                            continue;
                        }
                        tree.insert(IndexRecord {
                            offset: feature_box.offset,
                            size: feature_box.size,
                            envelope: feature_box.envelope.to_f32(),
                        });
                    }
                    tree.trim();
                    SpatialIndex::Memory(tree)
                }
            };
            Mode::Indexed(index)
        };

        if let Some(text) = params.get_text("extent") {
            extent = text.parse()?;
        }

        let desc = Descriptor {
            name: "geojson",
            ds_type: DatasourceType::Vector,
            geometry_kind,
            fields,
            encoding,
        };

        Ok(GeojsonDatasource {
            // Clone rather than move: `data` still borrows the source here.
            source: source.clone(),
            layout,
            mode,
            extent,
            desc,
        })
    }
}

impl Datasource for GeojsonDatasource {
    fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    fn envelope(&self) -> Envelope<f64> {
        self.extent
    }

    fn features(&self, query: &Query) -> Result<Box<dyn Featureset + Send>> {
        match &self.mode {
            Mode::Indexed(index) => {
                let candidates = index.query(&query.bbox)?;
                Ok(Box::new(GeojsonFeatureset::new(
                    self.source.clone(),
                    self.layout.clone(),
                    candidates,
                    query.properties.clone(),
                )))
            }
            Mode::Cached { features, tree } => {
                let mut hits: Vec<usize> =
                    tree.query(&query.bbox).iter().map(|r| r.offset as usize).collect();
                hits.sort_unstable();
                Ok(Box::new(CachedFeatureset::new(features.clone(), hits, query)))
            }
        }
    }
}

/// Parses the sampled features and reports the declared schema. Attribute
/// names are alphabetical regardless of their order in the source; the
/// first value seen for a name decides its declared type.
fn discover_schema(
    data: &[u8],
    sample: &[extract::FeatureBox],
    kind: TopLevel,
    strict: bool,
) -> Result<(Context, Vec<FieldDescriptor>, Option<crate::geometry::GeometryKind>)> {
    let mut types: BTreeMap<String, AttrType> = BTreeMap::new();
    let mut geometry_kind = None;
    for feature_box in sample {
        let slice = &data[feature_box.offset as usize..(feature_box.offset + feature_box.size) as usize];
        if kind == TopLevel::Geometry {
            let geometry: geojson::Geometry = serde_json::from_slice(slice).map_err(|err| {
                Error::malformed_record(feature_box.offset, err.to_string(), slice)
            })?;
            geometry_kind = convert_geometry(&geometry.value, 0, feature_box.offset)?.kind();
            continue;
        }
        let feature: geojson::Feature = match serde_json::from_slice(slice) {
            Ok(feature) => feature,
            Err(err) if strict => {
                return Err(Error::malformed_record(feature_box.offset, err.to_string(), slice))
            }
            Err(err) => {
                log::warn!(
                    "geojson: cannot sample feature at byte {}: {err}",
                    feature_box.offset
                );
                continue;
            }
        };
        if geometry_kind.is_none() {
            if let Some(geometry) = &feature.geometry {
                geometry_kind = convert_geometry(&geometry.value, 0, feature_box.offset)
                    .ok()
                    .and_then(|g| g.kind());
            }
        }
        if let Some(properties) = &feature.properties {
            for (name, value) in properties {
                types
                    .entry(name.clone())
                    .or_insert_with(|| json_attr_type(value));
            }
        }
    }
    let ctx = Context::from_names(types.keys().cloned());
    let fields = types
        .into_iter()
        .map(|(name, attr_type)| FieldDescriptor { name, attr_type })
        .collect();
    Ok((ctx, fields, geometry_kind))
}

fn json_attr_type(value: &serde_json::Value) -> AttrType {
    match value {
        serde_json::Value::Bool(_) => AttrType::Bool,
        serde_json::Value::Number(n) if n.is_i64() => AttrType::Integer,
        serde_json::Value::Number(_) => AttrType::Double,
        _ => AttrType::Text,
    }
}

/// JSON attribute -> value. Nested containers keep their canonical JSON
/// serialization as one text attribute.
pub(crate) fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        container => Value::Text(container.to_string()),
    }
}

/// Materializes one indexed slice into a feature.
pub(crate) fn parse_feature_slice(
    slice: &[u8],
    offset: u64,
    id: u64,
    layout: &GeojsonLayout,
    properties: &Option<Vec<String>>,
) -> Result<Feature> {
    let wants = |name: &str| match properties {
        None => true,
        Some(names) => names.iter().any(|n| n == name),
    };
    let mut feature = Feature::new(id, layout.ctx.clone());
    match layout.kind {
        TopLevel::Geometry => {
            let geometry: geojson::Geometry = serde_json::from_slice(slice)
                .map_err(|err| Error::malformed_record(offset, err.to_string(), slice))?;
            feature.geometry = convert_geometry(&geometry.value, 0, offset)?;
        }
        TopLevel::Feature | TopLevel::FeatureCollection => {
            let parsed: geojson::Feature = serde_json::from_slice(slice)
                .map_err(|err| Error::malformed_record(offset, err.to_string(), slice))?;
            let geometry = parsed.geometry.as_ref().ok_or_else(|| {
                Error::malformed_record(offset, "feature without geometry", slice)
            })?;
            feature.geometry = convert_geometry(&geometry.value, 0, offset)?;
            if let Some(props) = &parsed.properties {
                for (name, value) in props {
                    if !wants(name) {
                        continue;
                    }
                    if let Some(slot) = layout.ctx.lookup(name) {
                        feature.put_by_index(slot, json_to_value(value));
                    }
                }
            }
        }
    }
    Ok(feature)
}

/// Full-parses one extracted slice without materializing a feature; used by
/// the index builder's `--validate-features` pass.
pub fn validate_feature_slice(slice: &[u8], offset: u64, kind: TopLevel) -> Result<()> {
    match kind {
        TopLevel::Geometry => {
            let geometry: geojson::Geometry = serde_json::from_slice(slice)
                .map_err(|err| Error::malformed_record(offset, err.to_string(), slice))?;
            convert_geometry(&geometry.value, 0, offset)?;
        }
        TopLevel::Feature | TopLevel::FeatureCollection => {
            let feature: geojson::Feature = serde_json::from_slice(slice)
                .map_err(|err| Error::malformed_record(offset, err.to_string(), slice))?;
            if let Some(geometry) = &feature.geometry {
                convert_geometry(&geometry.value, 0, offset)?;
            }
        }
    }
    Ok(())
}

fn position(pos: &[f64], offset: u64) -> Result<(f64, f64)> {
    if pos.len() < 2 {
        return Err(Error::malformed_record(
            offset,
            "position with fewer than two coordinates",
            &[],
        ));
    }
    Ok((pos[0], pos[1]))
}

fn line_string(coords: &[Vec<f64>], offset: u64) -> Result<LineString<f64>> {
    let mut points = Vec::with_capacity(coords.len());
    for pos in coords {
        points.push(position(pos, offset)?);
    }
    Ok(LineString::from(points))
}

fn polygon(rings: &[Vec<Vec<f64>>], offset: u64) -> Result<Polygon<f64>> {
    let mut iter = rings.iter();
    let exterior = match iter.next() {
        Some(ring) => line_string(ring, offset)?,
        None => {
            return Err(Error::malformed_record(
                offset,
                "polygon without an exterior ring",
                &[],
            ))
        }
    };
    let mut interiors = Vec::new();
    for ring in iter {
        interiors.push(line_string(ring, offset)?);
    }
    Ok(Polygon::new(exterior, interiors))
}

/// GeoJSON geometry -> the geometry sum type, enforcing the restrictions
/// the streaming extractor cannot: points need coordinates, line strings
/// need two of them, and geometry collections do not nest.
pub(crate) fn convert_geometry(
    value: &geojson::Value,
    depth: usize,
    offset: u64,
) -> Result<Geometry> {
    match value {
        geojson::Value::Point(pos) => {
            let (x, y) = position(pos, offset)?;
            Ok(Geometry::Point(Point::new(x, y)))
        }
        geojson::Value::MultiPoint(coords) => {
            let mut points = Vec::with_capacity(coords.len());
            for pos in coords {
                let (x, y) = position(pos, offset)?;
                points.push(Point::new(x, y));
            }
            Ok(Geometry::MultiPoint(MultiPoint(points)))
        }
        geojson::Value::LineString(coords) => {
            if coords.len() < 2 {
                return Err(Error::malformed_record(
                    offset,
                    "line string with fewer than two positions",
                    &[],
                ));
            }
            Ok(Geometry::LineString(line_string(coords, offset)?))
        }
        geojson::Value::MultiLineString(lines) => {
            let mut parts = Vec::with_capacity(lines.len());
            for coords in lines {
                if coords.len() < 2 {
                    return Err(Error::malformed_record(
                        offset,
                        "line string with fewer than two positions",
                        &[],
                    ));
                }
                parts.push(line_string(coords, offset)?);
            }
            Ok(Geometry::MultiLineString(MultiLineString(parts)))
        }
        geojson::Value::Polygon(rings) => Ok(Geometry::Polygon(polygon(rings, offset)?)),
        geojson::Value::MultiPolygon(polys) => {
            let mut parts = Vec::with_capacity(polys.len());
            for rings in polys {
                parts.push(polygon(rings, offset)?);
            }
            Ok(Geometry::MultiPolygon(MultiPolygon(parts)))
        }
        geojson::Value::GeometryCollection(members) => {
            if depth > 0 {
                return Err(Error::MalformedFile(
                    "GeometryCollection may not contain another GeometryCollection".into(),
                ));
            }
            let mut children = Vec::with_capacity(members.len());
            for member in members {
                children.push(convert_geometry(&member.value, depth + 1, offset)?);
            }
            Ok(Geometry::Collection(children))
        }
    }
}
