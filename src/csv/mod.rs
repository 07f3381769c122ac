pub mod dialect;
mod featureset;

use std::sync::Arc;

use geo::Point;
use wkt::TryFromWkt;

use crate::datasource::{Datasource, DatasourceType, Descriptor, Featureset, FieldDescriptor, Query};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::feature::{decode_text, AttrType, Context, Value};
use crate::geometry::{Geometry, GeometryKind};
use crate::index::file::open_sidecar;
use crate::index::{IndexRecord, QuadTree, SpatialIndex};
use crate::params::Params;
use crate::source::ByteSource;
use dialect::{detect, next_record, split_record, Dialect};
use featureset::CsvFeatureset;

/// Where the geometry lives in a row: a WKT column, a GeoJSON fragment
/// column, or a pair of numeric lon/lat columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryColumns {
    Wkt(usize),
    GeoJson(usize),
    LonLat(usize, usize),
}

/// Everything a featureset needs to turn a raw record back into a feature.
/// Shared between the datasource and its featuresets.
#[derive(Debug)]
pub(crate) struct CsvLayout {
    pub headers: Vec<String>,
    /// Column index -> context slot; geometry-only and duplicate columns
    /// carry no slot.
    pub slots: Vec<Option<usize>>,
    pub column_types: Vec<AttrType>,
    pub locator: GeometryColumns,
    pub dialect: Dialect,
    pub encoding: String,
    pub strict: bool,
}

pub struct CsvDatasource {
    source: Arc<ByteSource>,
    layout: Arc<CsvLayout>,
    ctx: Arc<Context>,
    index: SpatialIndex,
    extent: Envelope<f64>,
    row_limit: u64,
    desc: Descriptor,
}

pub fn create(params: &Params) -> Result<Box<dyn Datasource>> {
    Ok(Box::new(CsvDatasource::from_params(params)?))
}

impl CsvDatasource {
    pub fn from_params(params: &Params) -> Result<Self> {
        let strict = params.get_bool("strict")?.unwrap_or(false);
        let row_limit = params.get_int("row_limit")?.unwrap_or(0).max(0) as u64;
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
        if source.is_empty() {
            return Err(Error::MalformedFile("csv file is empty".into()));
        }
        let source = Arc::new(source);
        let data = source.read_all()?;

        let dialect = detect(
            &data,
            params.get_char("separator")?,
            params.get_char("quote")?,
        );

        let (headers, data_start) = match params.get_text("headers") {
            Some(manual) => {
                let fields = split_record(manual.as_bytes(), dialect.separator, dialect.quote)?;
                let headers = resolve_headers(fields, &encoding, strict)?;
                (headers, 0)
            }
            None => read_header_line(&data, &dialect, &encoding, strict)?,
        };

        let locator = locate_geometry_columns(&headers).ok_or(Error::NoGeometryColumn)?;
        let (ctx, slots) = build_context(&headers, &locator);
        let ctx = Arc::new(ctx);

        let sidecar = match &path {
            Some(path) => open_sidecar(path, strict)?,
            None => None,
        };

        let mut column_types: Vec<Option<AttrType>> = vec![None; headers.len()];
        let mut geometry_kind = None;
        let mut extent = Envelope::invalid();

        let index = match sidecar {
            Some(index_file) => {
                // The index replaces the box scan; the first record alone
                // seeds the schema types and the geometry class.
                scan(
                    &data, data_start, &dialect, &headers, &locator, &encoding, strict, 1,
                    &mut column_types, &mut geometry_kind, &mut extent,
                    &mut |_record: IndexRecord| {},
                )?;
                extent = index_file.bounds()?.to_f64();
                SpatialIndex::Disk(index_file)
            }
            None => {
                let mut boxes = Vec::new();
                scan(
                    &data, data_start, &dialect, &headers, &locator, &encoding, strict, row_limit,
                    &mut column_types, &mut geometry_kind, &mut extent,
                    &mut |record| boxes.push(record),
                )?;
                let mut tree = QuadTree::new(extent.to_f32());
                for record in boxes {
                    tree.insert(record);
                }
                tree.trim();
                SpatialIndex::Memory(tree)
            }
        };

        if let Some(text) = params.get_text("extent") {
            extent = text.parse()?;
        }

        let column_types: Vec<AttrType> =
            column_types.into_iter().map(|t| t.unwrap_or(AttrType::Text)).collect();
        let fields = headers
            .iter()
            .zip(&slots)
            .zip(&column_types)
            .filter(|((_, slot), _)| slot.is_some())
            .map(|((name, _), attr_type)| FieldDescriptor {
                name: name.clone(),
                attr_type: *attr_type,
            })
            .collect();

        let desc = Descriptor {
            name: "csv",
            ds_type: DatasourceType::Vector,
            geometry_kind,
            fields,
            encoding: encoding.clone(),
        };

        Ok(CsvDatasource {
            // Clone rather than move: `data` still borrows the source here.
            source: source.clone(),
            layout: Arc::new(CsvLayout {
                headers,
                slots,
                column_types,
                locator,
                dialect,
                encoding,
                strict,
            }),
            ctx,
            index,
            extent,
            row_limit,
            desc,
        })
    }
}

impl Datasource for CsvDatasource {
    fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    fn envelope(&self) -> Envelope<f64> {
        self.extent
    }

    fn features(&self, query: &Query) -> Result<Box<dyn Featureset + Send>> {
        let candidates = self.index.query(&query.bbox)?;
        Ok(Box::new(CsvFeatureset::new(
            self.source.clone(),
            self.layout.clone(),
            self.ctx.clone(),
            candidates,
            query.properties.clone(),
            self.row_limit,
        )))
    }
}

/// Box-scan entry point for the index builder: dialect detection, header
/// and geometry-column resolution, then the full record scan, without
/// constructing a datasource.
pub fn scan_for_index(
    path: &std::path::Path,
    separator: Option<u8>,
    quote: Option<u8>,
    manual_headers: Option<&str>,
) -> Result<(Vec<IndexRecord>, Envelope<f64>)> {
    let source = ByteSource::open(path)?;
    if source.is_empty() {
        return Err(Error::MalformedFile("csv file is empty".into()));
    }
    let data = source.read_all()?;
    let dialect = detect(&data, separator, quote);
    let (headers, data_start) = match manual_headers {
        Some(manual) => {
            let fields = split_record(manual.as_bytes(), dialect.separator, dialect.quote)?;
            (resolve_headers(fields, "utf-8", false)?, 0)
        }
        None => read_header_line(&data, &dialect, "utf-8", false)?,
    };
    let locator = locate_geometry_columns(&headers).ok_or(Error::NoGeometryColumn)?;

    let mut column_types: Vec<Option<AttrType>> = vec![None; headers.len()];
    let mut geometry_kind = None;
    let mut extent = Envelope::invalid();
    let mut boxes = Vec::new();
    scan(
        &data, data_start, &dialect, &headers, &locator, "utf-8", false, 0,
        &mut column_types, &mut geometry_kind, &mut extent,
        &mut |record| boxes.push(record),
    )?;
    Ok((boxes, extent))
}

fn resolve_headers(fields: Vec<Vec<u8>>, encoding: &str, strict: bool) -> Result<Vec<String>> {
    let mut headers = Vec::with_capacity(fields.len());
    for (column, field) in fields.into_iter().enumerate() {
        let name = decode_text(&field, encoding).trim().to_string();
        if name.is_empty() {
            if strict {
                return Err(Error::MissingHeader { line: 1, column });
            }
            headers.push(format!("_{column}"));
        } else {
            headers.push(name);
        }
    }
    Ok(headers)
}

/// First non-blank line names the columns; returns them plus the offset of
/// the first data byte.
fn read_header_line(
    data: &[u8],
    dialect: &Dialect,
    encoding: &str,
    strict: bool,
) -> Result<(Vec<String>, u64)> {
    let mut pos = 0usize;
    loop {
        match next_record(data, pos, dialect.newline, dialect.quote)? {
            None => return Err(Error::MalformedFile("no header row found".into())),
            Some((start, end, next)) => {
                pos = next;
                let fields = split_record(&data[start..end], dialect.separator, dialect.quote)?;
                if fields.is_empty() || fields.iter().all(|f| f.is_empty()) {
                    continue;
                }
                let headers = resolve_headers(fields, encoding, strict)?;
                return Ok((headers, next as u64));
            }
        }
    }
}

/// Case-insensitive geometry column search over the header names. A WKT
/// column wins over a GeoJSON column, which wins over a lon/lat pair; the
/// pair only counts when both halves are present.
fn locate_geometry_columns(headers: &[String]) -> Option<GeometryColumns> {
    let mut wkt = None;
    let mut geojson = None;
    let mut lon = None;
    let mut lat = None;
    for (i, header) in headers.iter().enumerate() {
        let lower = header.to_lowercase();
        if lower == "wkt" || lower.contains("geom") {
            wkt.get_or_insert(i);
        } else if lower == "geojson" {
            geojson.get_or_insert(i);
        } else if lower == "x"
            || lower == "lon"
            || lower == "lng"
            || lower == "long"
            || lower.contains("longitude")
        {
            lon.get_or_insert(i);
        } else if lower == "y" || lower == "lat" || lower.contains("latitude") {
            lat.get_or_insert(i);
        }
    }
    if let Some(i) = wkt {
        Some(GeometryColumns::Wkt(i))
    } else if let Some(i) = geojson {
        Some(GeometryColumns::GeoJson(i))
    } else if let (Some(x), Some(y)) = (lon, lat) {
        Some(GeometryColumns::LonLat(x, y))
    } else {
        None
    }
}

/// Builds the shared schema. WKT and GeoJSON columns carry the geometry,
/// not an attribute; duplicate header names keep the first column.
fn build_context(headers: &[String], locator: &GeometryColumns) -> (Context, Vec<Option<usize>>) {
    let geometry_only = |i: usize| match locator {
        GeometryColumns::Wkt(w) => i == *w,
        GeometryColumns::GeoJson(g) => i == *g,
        GeometryColumns::LonLat(_, _) => false,
    };
    let mut ctx = Context::new();
    let mut slots = Vec::with_capacity(headers.len());
    for (i, header) in headers.iter().enumerate() {
        if geometry_only(i) || ctx.lookup(header).is_some() {
            slots.push(None);
        } else {
            slots.push(Some(ctx.push(header.clone())));
        }
    }
    (ctx, slots)
}

/// Walks data records, emitting `(envelope, offset, size)` for the index and
/// folding in extent, type inference, and the geometry class. `limit` of 0
/// means unlimited. Per-record failures are logged and skipped, or abort the
/// scan under strict.
#[allow(clippy::too_many_arguments)]
fn scan(
    data: &[u8],
    data_start: u64,
    dialect: &Dialect,
    headers: &[String],
    locator: &GeometryColumns,
    encoding: &str,
    strict: bool,
    limit: u64,
    column_types: &mut [Option<AttrType>],
    geometry_kind: &mut Option<GeometryKind>,
    extent: &mut Envelope<f64>,
    emit: &mut dyn FnMut(IndexRecord),
) -> Result<()> {
    let mut pos = data_start as usize;
    let mut emitted = 0u64;
    loop {
        if limit > 0 && emitted >= limit {
            log::debug!("csv: row limit hit, stopping scan after {emitted} records");
            break;
        }
        let (start, end, next) = match next_record(data, pos, dialect.newline, dialect.quote)? {
            Some(range) => range,
            None => break,
        };
        pos = next;
        let record = &data[start..end];
        if is_blank_record(record) {
            continue;
        }
        let offset = start as u64;
        match scan_record(record, offset, dialect, headers, locator, encoding) {
            Ok((geom, env, fields)) => {
                extent.expand_to_include(&env);
                emit(IndexRecord {
                    offset,
                    size: (end - start) as u64,
                    envelope: env.to_f32(),
                });
                emitted += 1;
                if geometry_kind.is_none() {
                    *geometry_kind = geom.kind();
                }
                if column_types.iter().any(|t| t.is_none()) {
                    for (i, field) in fields.iter().enumerate() {
                        if i < column_types.len() && column_types[i].is_none() && !field.is_empty()
                        {
                            column_types[i] = Some(infer_type(field));
                        }
                    }
                }
            }
            Err(err) if strict => return Err(err),
            Err(err) => log::warn!("csv: skipping record at byte {offset}: {err}"),
        }
    }
    Ok(())
}

fn is_blank_record(record: &[u8]) -> bool {
    record.len() <= 10
        && record
            .iter()
            .all(|c| matches!(c, b'"' | b',' | b'\'' | b'\r' | b'\n' | b' ' | b'\t'))
}

/// Splits, decodes, and geometrizes one record.
fn scan_record(
    record: &[u8],
    offset: u64,
    dialect: &Dialect,
    headers: &[String],
    locator: &GeometryColumns,
    encoding: &str,
) -> Result<(Geometry, Envelope<f64>, Vec<String>)> {
    let fields = split_fields(record, offset, dialect, headers, encoding)?;
    let geom = extract_geometry(&fields, locator, offset)?;
    let env = geom.envelope();
    if !env.valid() {
        return Err(Error::malformed_record(
            offset,
            "geometry has no extent",
            record,
        ));
    }
    Ok((geom, env, fields))
}

pub(crate) fn split_fields(
    record: &[u8],
    offset: u64,
    dialect: &Dialect,
    headers: &[String],
    encoding: &str,
) -> Result<Vec<String>> {
    let raw = split_record(record, dialect.separator, dialect.quote)
        .map_err(|err| Error::malformed_record(offset, err.to_string(), record))?;
    if raw.len() != headers.len() {
        return Err(Error::malformed_record(
            offset,
            format!(
                "column count ({}) does not match header count ({})",
                raw.len(),
                headers.len()
            ),
            record,
        ));
    }
    Ok(raw.iter().map(|f| decode_text(f, encoding)).collect())
}

pub(crate) fn extract_geometry(
    fields: &[String],
    locator: &GeometryColumns,
    offset: u64,
) -> Result<Geometry> {
    match *locator {
        GeometryColumns::Wkt(i) => {
            let text = &fields[i];
            let geom = geo::Geometry::<f64>::try_from_wkt_str(text).map_err(|_| {
                Error::malformed_record(
                    offset,
                    format!("failed to parse WKT: '{text}'"),
                    text.as_bytes(),
                )
            })?;
            let mut geom = Geometry::from(geom);
            if geom.is_empty() {
                return Err(Error::malformed_record(offset, "empty geometry", text.as_bytes()));
            }
            geom.correct();
            Ok(geom)
        }
        GeometryColumns::GeoJson(i) => {
            let text = &fields[i];
            let fragment: geojson::Geometry = serde_json::from_str(text).map_err(|_| {
                Error::malformed_record(
                    offset,
                    format!("failed to parse GeoJSON: '{text}'"),
                    text.as_bytes(),
                )
            })?;
            crate::geojson::convert_geometry(&fragment.value, 0, offset)
        }
        GeometryColumns::LonLat(ix, iy) => {
            let x: f64 = fields[ix].trim().parse().map_err(|_| {
                Error::malformed_record(
                    offset,
                    format!("failed to parse longitude: '{}'", fields[ix]),
                    fields[ix].as_bytes(),
                )
            })?;
            let y: f64 = fields[iy].trim().parse().map_err(|_| {
                Error::malformed_record(
                    offset,
                    format!("failed to parse latitude: '{}'", fields[iy]),
                    fields[iy].as_bytes(),
                )
            })?;
            Ok(Geometry::Point(Point::new(x, y)))
        }
    }
}

fn is_likely_number(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b"e-.+0123456789".contains(&b))
}

/// Type inference from the first non-empty cell of a column. Long values
/// and integers with a leading zero are not safe to treat as numbers.
fn infer_type(value: &str) -> AttrType {
    let has_dot = value.contains('.');
    if value.len() > 20 || (value.len() > 1 && !has_dot && value.starts_with('0')) {
        return AttrType::Text;
    }
    if is_likely_number(value) {
        if has_dot || value.contains('e') {
            if value.parse::<f64>().is_ok() {
                return AttrType::Double;
            }
        } else if value.parse::<i64>().is_ok() {
            return AttrType::Integer;
        }
    }
    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
        return AttrType::Bool;
    }
    AttrType::Text
}

/// Writes a cell through the column's inferred type. Empty cells are null;
/// a cell that refuses the type is kept as text (or rejected under strict).
pub(crate) fn typed_value(
    raw: &str,
    attr_type: AttrType,
    offset: u64,
    strict: bool,
) -> Result<Value> {
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    let parsed = match attr_type {
        AttrType::Integer => raw.trim().parse::<i64>().ok().map(Value::Integer),
        AttrType::Double => raw.trim().parse::<f64>().ok().map(Value::Double),
        AttrType::Bool => {
            if raw.eq_ignore_ascii_case("true") {
                Some(Value::Bool(true))
            } else if raw.eq_ignore_ascii_case("false") {
                Some(Value::Bool(false))
            } else {
                None
            }
        }
        AttrType::Text => Some(Value::Text(raw.to_string())),
    };
    match parsed {
        Some(value) => Ok(value),
        None if strict => Err(Error::malformed_record(
            offset,
            format!("cannot parse '{raw}' as the column's inferred type"),
            raw.as_bytes(),
        )),
        None => {
            log::warn!("csv: value '{raw}' at byte {offset} does not match its column type");
            Ok(Value::Text(raw.to_string()))
        }
    }
}
