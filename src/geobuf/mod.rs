use std::sync::Arc;

use geo::{LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};

use crate::datasource::{Datasource, DatasourceType, Descriptor, Featureset, FieldDescriptor, Query};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::feature::{AttrType, Context, Feature, Value};
use crate::geojson::CachedFeatureset;
use crate::geometry::Geometry;
use crate::index::{IndexRecord, QuadTree};
use crate::params::Params;
use crate::source::ByteSource;

// Wire types of the protobuf-style encoding.
const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_BYTES: u8 = 2;
const WIRE_FIXED32: u8 = 5;

struct PbReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PbReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        PbReader { buf, pos: 0 }
    }

    fn eof(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| truncated("varint"))?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 64 {
                return Err(Error::MalformedFile("oversized varint".into()));
            }
        }
    }

    /// Zig-zag decoded signed varint.
    fn svarint(&mut self) -> Result<i64> {
        let raw = self.varint()?;
        Ok((raw >> 1) as i64 ^ -((raw & 1) as i64))
    }

    fn tag(&mut self) -> Result<(u32, u8)> {
        let key = self.varint()?;
        Ok(((key >> 3) as u32, (key & 0x7) as u8))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.varint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| truncated("length-delimited field"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn fixed64(&mut self) -> Result<f64> {
        let end = self.pos + 8;
        if end > self.buf.len() {
            return Err(truncated("fixed64"));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(f64::from_le_bytes(raw))
    }

    fn skip(&mut self, wire: u8) -> Result<()> {
        match wire {
            WIRE_VARINT => {
                self.varint()?;
            }
            WIRE_FIXED64 => {
                self.pos += 8;
            }
            WIRE_BYTES => {
                self.bytes()?;
            }
            WIRE_FIXED32 => {
                self.pos += 4;
            }
            other => {
                return Err(Error::MalformedFile(format!(
                    "unsupported wire type {other}"
                )))
            }
        }
        if self.pos > self.buf.len() {
            return Err(truncated("skipped field"));
        }
        Ok(())
    }
}

fn truncated(what: &str) -> Error {
    Error::MalformedFile(format!("truncated geobuf: unexpected end of {what}"))
}

/// Header fields of the `Data` message: the string key table plus the
/// coordinate dimensionality and decimal precision every geometry uses.
struct Header {
    keys: Vec<String>,
    dim: usize,
    factor: f64,
}

enum Payload<'a> {
    FeatureCollection(&'a [u8]),
    Feature(&'a [u8]),
    Geometry(&'a [u8]),
}

fn parse_data(buf: &[u8]) -> Result<(Header, Payload<'_>)> {
    let mut reader = PbReader::new(buf);
    let mut keys = Vec::new();
    let mut dim = 2usize;
    let mut precision = 6u32;
    let mut payload = None;
    while !reader.eof() {
        let (field, wire) = reader.tag()?;
        match field {
            1 => keys.push(String::from_utf8_lossy(reader.bytes()?).into_owned()),
            2 => dim = reader.varint()? as usize,
            3 => precision = reader.varint()? as u32,
            4 => payload = Some(Payload::FeatureCollection(reader.bytes()?)),
            5 => payload = Some(Payload::Feature(reader.bytes()?)),
            6 => payload = Some(Payload::Geometry(reader.bytes()?)),
            _ => reader.skip(wire)?,
        }
    }
    if dim < 2 {
        return Err(Error::MalformedFile("geobuf dimensions below 2".into()));
    }
    let payload = payload
        .ok_or_else(|| Error::MalformedFile("geobuf without feature or geometry data".into()))?;
    Ok((
        Header {
            keys,
            dim,
            factor: 10f64.powi(precision as i32),
        },
        payload,
    ))
}

fn parse_value(buf: &[u8]) -> Result<Value> {
    let mut reader = PbReader::new(buf);
    let mut value = Value::Null;
    while !reader.eof() {
        let (field, wire) = reader.tag()?;
        match field {
            1 => value = Value::Text(String::from_utf8_lossy(reader.bytes()?).into_owned()),
            2 => value = Value::Double(reader.fixed64()?),
            3 => value = Value::Integer(reader.varint()? as i64),
            4 => value = Value::Integer(-(reader.varint()? as i64)),
            5 => value = Value::Bool(reader.varint()? != 0),
            6 => value = Value::Text(String::from_utf8_lossy(reader.bytes()?).into_owned()),
            _ => reader.skip(wire)?,
        }
    }
    Ok(value)
}

fn parse_packed_u32(buf: &[u8]) -> Result<Vec<u64>> {
    let mut reader = PbReader::new(buf);
    let mut out = Vec::new();
    while !reader.eof() {
        out.push(reader.varint()?);
    }
    Ok(out)
}

fn parse_packed_sint(buf: &[u8]) -> Result<Vec<i64>> {
    let mut reader = PbReader::new(buf);
    let mut out = Vec::new();
    while !reader.eof() {
        out.push(reader.svarint()?);
    }
    Ok(out)
}

struct RawGeometry {
    geom_type: u64,
    lengths: Vec<u64>,
    coords: Vec<i64>,
    members: Vec<RawGeometry>,
}

fn parse_raw_geometry(buf: &[u8]) -> Result<RawGeometry> {
    let mut reader = PbReader::new(buf);
    let mut raw = RawGeometry {
        geom_type: 0,
        lengths: Vec::new(),
        coords: Vec::new(),
        members: Vec::new(),
    };
    while !reader.eof() {
        let (field, wire) = reader.tag()?;
        match field {
            1 => raw.geom_type = reader.varint()?,
            2 => raw.lengths = parse_packed_u32(reader.bytes()?)?,
            3 => raw.coords = parse_packed_sint(reader.bytes()?)?,
            4 => raw.members.push(parse_raw_geometry(reader.bytes()?)?),
            _ => reader.skip(wire)?,
        }
    }
    Ok(raw)
}

/// Decodes `count` delta-encoded positions starting at `*cursor`. Deltas
/// restart at zero for every line or ring; rings re-add their first point.
fn decode_line(
    raw: &RawGeometry,
    cursor: &mut usize,
    count: usize,
    header: &Header,
    closed: bool,
) -> Result<Vec<(f64, f64)>> {
    let need = count * header.dim;
    let end = cursor
        .checked_add(need)
        .filter(|&end| end <= raw.coords.len())
        .ok_or_else(|| Error::MalformedFile("geobuf coordinate run out of range".into()))?;
    let mut points = Vec::with_capacity(count + closed as usize);
    let mut x = 0i64;
    let mut y = 0i64;
    let mut at = *cursor;
    while at < end {
        x += raw.coords[at];
        y += raw.coords[at + 1];
        points.push((x as f64 / header.factor, y as f64 / header.factor));
        at += header.dim;
    }
    *cursor = end;
    if closed {
        if let Some(first) = points.first().copied() {
            points.push(first);
        }
    }
    Ok(points)
}

fn decode_polygon(raw: &RawGeometry, cursor: &mut usize, ring_lengths: &[u64], header: &Header) -> Result<Polygon<f64>> {
    let mut rings = Vec::with_capacity(ring_lengths.len());
    for &len in ring_lengths {
        rings.push(LineString::from(decode_line(
            raw,
            cursor,
            len as usize,
            header,
            true,
        )?));
    }
    let mut iter = rings.into_iter();
    let exterior = iter
        .next()
        .ok_or_else(|| Error::MalformedFile("geobuf polygon without rings".into()))?;
    Ok(Polygon::new(exterior, iter.collect()))
}

fn assemble_geometry(raw: &RawGeometry, header: &Header, depth: usize) -> Result<Geometry> {
    let point_count = raw.coords.len() / header.dim;
    let mut cursor = 0usize;
    Ok(match raw.geom_type {
        0 => {
            if raw.coords.len() < header.dim {
                return Err(Error::MalformedFile("geobuf point without coordinates".into()));
            }
            let points = decode_line(raw, &mut cursor, 1, header, false)?;
            Geometry::Point(Point::new(points[0].0, points[0].1))
        }
        1 => {
            let points = decode_line(raw, &mut cursor, point_count, header, false)?;
            Geometry::MultiPoint(MultiPoint(
                points.into_iter().map(|(x, y)| Point::new(x, y)).collect(),
            ))
        }
        2 => {
            let points = decode_line(raw, &mut cursor, point_count, header, false)?;
            if points.len() < 2 {
                return Err(Error::MalformedFile(
                    "geobuf line string with fewer than two positions".into(),
                ));
            }
            Geometry::LineString(LineString::from(points))
        }
        3 => {
            let lengths: Vec<u64> = if raw.lengths.is_empty() {
                vec![point_count as u64]
            } else {
                raw.lengths.clone()
            };
            let mut lines = Vec::with_capacity(lengths.len());
            for &len in &lengths {
                lines.push(LineString::from(decode_line(
                    raw,
                    &mut cursor,
                    len as usize,
                    header,
                    false,
                )?));
            }
            Geometry::MultiLineString(MultiLineString(lines))
        }
        4 => {
            let lengths: Vec<u64> = if raw.lengths.is_empty() {
                vec![point_count as u64]
            } else {
                raw.lengths.clone()
            };
            Geometry::Polygon(decode_polygon(raw, &mut cursor, &lengths, header)?)
        }
        5 => {
            if raw.lengths.is_empty() {
                let poly = decode_polygon(raw, &mut cursor, &[point_count as u64], header)?;
                Geometry::MultiPolygon(MultiPolygon(vec![poly]))
            } else {
                let mut at = 0usize;
                let polygon_count = raw.lengths[at] as usize;
                at += 1;
                let mut polys = Vec::with_capacity(polygon_count);
                for _ in 0..polygon_count {
                    let ring_count = *raw
                        .lengths
                        .get(at)
                        .ok_or_else(|| Error::MalformedFile("geobuf lengths exhausted".into()))?
                        as usize;
                    at += 1;
                    let ring_lengths = raw
                        .lengths
                        .get(at..at + ring_count)
                        .ok_or_else(|| Error::MalformedFile("geobuf lengths exhausted".into()))?;
                    at += ring_count;
                    polys.push(decode_polygon(raw, &mut cursor, ring_lengths, header)?);
                }
                Geometry::MultiPolygon(MultiPolygon(polys))
            }
        }
        6 => {
            if depth > 0 {
                return Err(Error::MalformedFile(
                    "GeometryCollection may not contain another GeometryCollection".into(),
                ));
            }
            let mut members = Vec::with_capacity(raw.members.len());
            for member in &raw.members {
                members.push(assemble_geometry(member, header, depth + 1)?);
            }
            Geometry::Collection(members)
        }
        other => {
            return Err(Error::UnsupportedGeometry(format!(
                "geobuf geometry type {other}"
            )))
        }
    })
}

struct RawFeature {
    geometry: Geometry,
    /// Explicit `id` (numeric string) or `int_id` carried by the feature;
    /// absent ones fall back to the sequential source-order id.
    id: Option<u64>,
    properties: Vec<(usize, Value)>,
}

fn parse_feature(buf: &[u8], header: &Header) -> Result<RawFeature> {
    let mut reader = PbReader::new(buf);
    let mut geometry = None;
    let mut id = None;
    let mut values = Vec::new();
    let mut pairs = Vec::new();
    while !reader.eof() {
        let (field, wire) = reader.tag()?;
        match field {
            1 => {
                let raw = parse_raw_geometry(reader.bytes()?)?;
                geometry = Some(assemble_geometry(&raw, header, 0)?);
            }
            11 => {
                let text = String::from_utf8_lossy(reader.bytes()?).into_owned();
                match text.parse::<u64>() {
                    Ok(value) => id = Some(value),
                    Err(_) => log::debug!("geobuf: ignoring non-numeric feature id '{text}'"),
                }
            }
            12 => {
                let value = reader.svarint()?;
                if value >= 0 {
                    id = Some(value as u64);
                } else {
                    log::debug!("geobuf: ignoring negative feature int_id {value}");
                }
            }
            13 => values.push(parse_value(reader.bytes()?)?),
            14 => pairs = parse_packed_u32(reader.bytes()?)?,
            _ => reader.skip(wire)?,
        }
    }
    let geometry =
        geometry.ok_or_else(|| Error::MalformedFile("geobuf feature without geometry".into()))?;
    let mut properties = Vec::with_capacity(pairs.len() / 2);
    for pair in pairs.chunks_exact(2) {
        let key = pair[0] as usize;
        let value = pair[1] as usize;
        if key >= header.keys.len() || value >= values.len() {
            return Err(Error::MalformedFile(
                "geobuf property index out of range".into(),
            ));
        }
        properties.push((key, values[value].clone()));
    }
    Ok(RawFeature {
        geometry,
        id,
        properties,
    })
}

fn parse_feature_collection(buf: &[u8], header: &Header) -> Result<Vec<RawFeature>> {
    let mut reader = PbReader::new(buf);
    let mut features = Vec::new();
    while !reader.eof() {
        let (field, wire) = reader.tag()?;
        match field {
            1 => features.push(parse_feature(reader.bytes()?, header)?),
            _ => reader.skip(wire)?,
        }
    }
    Ok(features)
}

pub struct GeobufDatasource {
    features: Arc<Vec<Feature>>,
    tree: QuadTree,
    extent: Envelope<f64>,
    desc: Descriptor,
}

pub fn create(params: &Params) -> Result<Box<dyn Datasource>> {
    Ok(Box::new(GeobufDatasource::from_params(params)?))
}

impl GeobufDatasource {
    pub fn from_params(params: &Params) -> Result<Self> {
        let encoding = params.get_text("encoding").unwrap_or_else(|| "utf-8".into());
        let path = params.resolve_path()?;
        let source = ByteSource::open(&path)?;
        let data = source.read_all()?;
        let (header, payload) = parse_data(&data)?;

        let raw_features = match payload {
            Payload::FeatureCollection(buf) => parse_feature_collection(buf, &header)?,
            Payload::Feature(buf) => vec![parse_feature(buf, &header)?],
            Payload::Geometry(buf) => {
                let raw = parse_raw_geometry(buf)?;
                vec![RawFeature {
                    geometry: assemble_geometry(&raw, &header, 0)?,
                    id: None,
                    properties: Vec::new(),
                }]
            }
        };

        // The key table is the schema, in table order.
        let ctx = Arc::new(Context::from_names(header.keys.iter().cloned()));
        let mut field_types: Vec<Option<AttrType>> = vec![None; header.keys.len()];

        let mut extent = Envelope::invalid();
        let mut tree_records = Vec::with_capacity(raw_features.len());
        let mut features = Vec::with_capacity(raw_features.len());
        let mut geometry_kind = None;
        for raw in raw_features {
            let id = raw.id.unwrap_or(features.len() as u64 + 1);
            let env = raw.geometry.envelope();
            if geometry_kind.is_none() {
                geometry_kind = raw.geometry.kind();
            }
            let mut feature = Feature::new(id, ctx.clone());
            feature.geometry = raw.geometry;
            for (key, value) in raw.properties {
                if field_types[key].is_none() {
                    field_types[key] = Some(match &value {
                        Value::Bool(_) => AttrType::Bool,
                        Value::Integer(_) => AttrType::Integer,
                        Value::Double(_) => AttrType::Double,
                        _ => AttrType::Text,
                    });
                }
                feature.put_by_index(key, value);
            }
            if env.valid() {
                extent.expand_to_include(&env);
                tree_records.push(Some(IndexRecord {
                    offset: features.len() as u64,
                    size: 0,
                    envelope: env.to_f32(),
                }));
            } else {
                tree_records.push(None);
            }
            features.push(feature);
        }

        let mut tree = QuadTree::new(extent.to_f32());
        for record in tree_records.into_iter().flatten() {
            tree.insert(record);
        }
        tree.trim();

        let extent = match params.get_text("extent") {
            Some(text) => text.parse()?,
            None => extent,
        };

        let desc = Descriptor {
            name: "geobuf",
            ds_type: DatasourceType::Vector,
            geometry_kind,
            fields: header
                .keys
                .iter()
                .zip(field_types)
                .map(|(name, attr_type)| FieldDescriptor {
                    name: name.clone(),
                    attr_type: attr_type.unwrap_or(AttrType::Text),
                })
                .collect(),
            encoding,
        };

        Ok(GeobufDatasource {
            features: Arc::new(features),
            tree,
            extent,
            desc,
        })
    }
}

impl Datasource for GeobufDatasource {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn varint(out: &mut Vec<u8>, mut value: u64) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    fn zigzag(value: i64) -> u64 {
        ((value << 1) ^ (value >> 63)) as u64
    }

    fn field(out: &mut Vec<u8>, number: u32, wire: u8) {
        varint(out, ((number as u64) << 3) | wire as u64);
    }

    fn bytes_field(out: &mut Vec<u8>, number: u32, payload: &[u8]) {
        field(out, number, WIRE_BYTES);
        varint(out, payload.len() as u64);
        out.extend_from_slice(payload);
    }

    fn point_geometry(x: f64, y: f64, factor: f64) -> Vec<u8> {
        let mut coords = Vec::new();
        varint(&mut coords, zigzag((x * factor) as i64));
        varint(&mut coords, zigzag((y * factor) as i64));
        let mut geom = Vec::new();
        field(&mut geom, 1, WIRE_VARINT);
        varint(&mut geom, 0);
        bytes_field(&mut geom, 3, &coords);
        geom
    }

    /// keys=["name"], one feature: Point(100, 0) with name="Winthrop".
    fn sample_data() -> Vec<u8> {
        let geom = point_geometry(100.0, 0.0, 1e6);

        let mut value = Vec::new();
        bytes_field(&mut value, 1, b"Winthrop");

        let mut props = Vec::new();
        varint(&mut props, 0);
        varint(&mut props, 0);

        let mut feature = Vec::new();
        bytes_field(&mut feature, 1, &geom);
        bytes_field(&mut feature, 13, &value);
        bytes_field(&mut feature, 14, &props);

        let mut fc = Vec::new();
        bytes_field(&mut fc, 1, &feature);

        let mut data = Vec::new();
        bytes_field(&mut data, 1, b"name");
        bytes_field(&mut data, 4, &fc);
        data
    }

    #[test]
    fn zigzag_round_trip() {
        for value in [0i64, 1, -1, 63, -64, 100_000_000, -123456789] {
            let mut out = Vec::new();
            varint(&mut out, zigzag(value));
            let mut reader = PbReader::new(&out);
            assert_eq!(reader.svarint().unwrap(), value);
        }
    }

    #[test]
    fn decodes_a_feature_collection() {
        let data = sample_data();
        let (header, payload) = parse_data(&data).unwrap();
        assert_eq!(header.keys, vec!["name".to_string()]);
        assert_eq!(header.dim, 2);
        let features = match payload {
            Payload::FeatureCollection(buf) => parse_feature_collection(buf, &header).unwrap(),
            _ => panic!("expected a feature collection"),
        };
        assert_eq!(features.len(), 1);
        match &features[0].geometry {
            Geometry::Point(p) => {
                assert!((p.x() - 100.0).abs() < 1e-6);
                assert!(p.y().abs() < 1e-6);
            }
            other => panic!("expected point, got {other:?}"),
        }
        assert_eq!(
            features[0].properties,
            vec![(0, Value::Text("Winthrop".into()))]
        );
    }

    #[test]
    fn polygon_rings_are_reclosed() {
        // One square ring, quantized at precision 0.
        let mut coords = Vec::new();
        for delta in [0i64, 0, 4, 0, 0, 4, -4, 0] {
            varint(&mut coords, zigzag(delta));
        }
        let mut lengths = Vec::new();
        varint(&mut lengths, 4);
        let mut geom = Vec::new();
        field(&mut geom, 1, WIRE_VARINT);
        varint(&mut geom, 4);
        bytes_field(&mut geom, 2, &lengths);
        bytes_field(&mut geom, 3, &coords);

        let header = Header {
            keys: vec![],
            dim: 2,
            factor: 1.0,
        };
        let raw = parse_raw_geometry(&geom).unwrap();
        match assemble_geometry(&raw, &header, 0).unwrap() {
            Geometry::Polygon(p) => {
                assert_eq!(p.exterior().0.len(), 5);
                assert_eq!(p.exterior().0.first(), p.exterior().0.last());
            }
            other => panic!("expected polygon, got {other:?}"),
        }
    }

    #[test]
    fn truncated_buffers_error_cleanly() {
        let data = sample_data();
        for cut in 0..data.len() {
            match parse_data(&data[..cut]) {
                Ok((header, Payload::FeatureCollection(buf))) => {
                    let _ = parse_feature_collection(buf, &header);
                }
                Ok(_) | Err(_) => {}
            }
        }
    }

    #[test]
    fn nested_collection_is_rejected() {
        let inner_point = point_geometry(1.0, 1.0, 1.0);
        let mut inner = Vec::new();
        field(&mut inner, 1, WIRE_VARINT);
        varint(&mut inner, 6);
        bytes_field(&mut inner, 4, &inner_point);
        let mut outer = Vec::new();
        field(&mut outer, 1, WIRE_VARINT);
        varint(&mut outer, 6);
        bytes_field(&mut outer, 4, &inner);

        let header = Header {
            keys: vec![],
            dim: 2,
            factor: 1.0,
        };
        let raw = parse_raw_geometry(&outer).unwrap();
        assert!(assemble_geometry(&raw, &header, 0).is_err());
    }
}
