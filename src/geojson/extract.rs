//! Streaming bounding-box extraction. One pass over the raw bytes finds
//! every top-level feature's byte range and envelope without building a
//! JSON tree: braces and brackets are counted with full string/escape
//! awareness, and coordinates are folded into an envelope as they stream
//! past. The full JSON parser only ever sees the records a query hits.

use crate::envelope::Envelope;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureBox {
    pub offset: u64,
    pub size: u64,
    pub envelope: Envelope<f64>,
}

/// Shape of the document's top level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopLevel {
    FeatureCollection,
    Feature,
    Geometry,
}

#[derive(Debug)]
pub struct Extract {
    pub kind: TopLevel,
    pub boxes: Vec<FeatureBox>,
    /// Byte position just past the top-level value; anything but trailing
    /// whitespace after it is an error under strict.
    pub consumed: usize,
}

const GEOMETRY_TYPES: [&str; 7] = [
    "Point",
    "MultiPoint",
    "LineString",
    "MultiLineString",
    "Polygon",
    "MultiPolygon",
    "GeometryCollection",
];

pub fn extract_feature_boxes(data: &[u8]) -> Result<Extract> {
    let start = skip_ws(data, 0);
    if start >= data.len() || data[start] != b'{' {
        return Err(Error::MalformedFile("expected a top-level JSON object".into()));
    }

    let mut type_name: Option<String> = None;
    let mut features_span: Option<(usize, usize)> = None;
    let mut geometry_span: Option<(usize, usize)> = None;

    let end = each_member(data, start, |key, value_start, value_end| {
        match key {
            b"type" => type_name = Some(string_token(data, value_start, value_end)?),
            b"features" => features_span = Some((value_start, value_end)),
            b"geometry" => geometry_span = Some((value_start, value_end)),
            _ => {}
        }
        Ok(())
    })?;

    let kind = match type_name.as_deref() {
        Some("FeatureCollection") => TopLevel::FeatureCollection,
        Some("Feature") => TopLevel::Feature,
        Some(name) if GEOMETRY_TYPES.contains(&name) => TopLevel::Geometry,
        Some(name) => {
            return Err(Error::MalformedFile(format!(
                "unexpected top-level type '{name}'"
            )))
        }
        None => return Err(Error::MalformedFile("missing top-level 'type' member".into())),
    };

    let boxes = match kind {
        TopLevel::FeatureCollection => {
            let (fs, fe) = features_span.ok_or_else(|| {
                Error::MalformedFile("FeatureCollection without a 'features' array".into())
            })?;
            collection_boxes(data, fs, fe)?
        }
        TopLevel::Feature => {
            let envelope = match geometry_span {
                Some((gs, ge)) => geometry_envelope(&data[gs..ge])?,
                None => Envelope::invalid(),
            };
            vec![FeatureBox {
                offset: start as u64,
                size: (end - start) as u64,
                envelope,
            }]
        }
        TopLevel::Geometry => vec![FeatureBox {
            offset: start as u64,
            size: (end - start) as u64,
            envelope: geometry_envelope(&data[start..end])?,
        }],
    };

    Ok(Extract {
        kind,
        boxes,
        consumed: end,
    })
}

fn collection_boxes(data: &[u8], fs: usize, fe: usize) -> Result<Vec<FeatureBox>> {
    if data[fs] != b'[' {
        return Err(Error::MalformedFile("'features' is not an array".into()));
    }
    let mut boxes = Vec::new();
    let mut pos = skip_ws(data, fs + 1);
    if pos < fe && data[pos] == b']' {
        return Ok(boxes);
    }
    loop {
        let element_start = pos;
        let element_end = skip_value(data, pos)?;
        let envelope = feature_envelope(&data[element_start..element_end])?;
        boxes.push(FeatureBox {
            offset: element_start as u64,
            size: (element_end - element_start) as u64,
            envelope,
        });
        pos = skip_ws(data, element_end);
        match data.get(pos) {
            Some(b',') => pos = skip_ws(data, pos + 1),
            Some(b']') => return Ok(boxes),
            _ => return Err(Error::MalformedFile("unterminated 'features' array".into())),
        }
    }
}

/// Envelope of one feature object: only its `geometry` member is scanned,
/// so attributes that happen to be called "coordinates" cannot leak in.
fn feature_envelope(feature: &[u8]) -> Result<Envelope<f64>> {
    let start = skip_ws(feature, 0);
    if start >= feature.len() || feature[start] != b'{' {
        return Err(Error::MalformedFile("feature is not an object".into()));
    }
    let mut envelope = Envelope::invalid();
    each_member(feature, start, |key, value_start, value_end| {
        if key == b"geometry" {
            envelope = geometry_envelope(&feature[value_start..value_end])?;
        }
        Ok(())
    })?;
    Ok(envelope)
}

/// Envelope of a geometry object: every `coordinates` key inside (one per
/// member of a GeometryCollection) contributes its positions.
fn geometry_envelope(geometry: &[u8]) -> Result<Envelope<f64>> {
    let mut envelope = Envelope::invalid();
    let mut pos = 0usize;
    while pos < geometry.len() {
        match geometry[pos] {
            b'"' => {
                let end = skip_string(geometry, pos)?;
                let key = &geometry[pos + 1..end - 1];
                let after = skip_ws(geometry, end);
                if key == b"coordinates" && geometry.get(after) == Some(&b':') {
                    let value_start = skip_ws(geometry, after + 1);
                    let value_end = scan_positions(geometry, value_start, &mut envelope)?;
                    pos = value_end;
                } else {
                    pos = end;
                }
            }
            _ => pos += 1,
        }
    }
    Ok(envelope)
}

/// Folds a coordinates array into the envelope. Within each innermost
/// array the first two numbers are x and y; extra dimensions are ignored.
fn scan_positions(data: &[u8], start: usize, envelope: &mut Envelope<f64>) -> Result<usize> {
    if data.get(start) != Some(&b'[') {
        return Err(Error::MalformedFile("'coordinates' is not an array".into()));
    }
    let mut stack: Vec<usize> = vec![];
    let mut pending_x = 0.0f64;
    let mut pos = start;
    loop {
        match data.get(pos) {
            Some(b'[') => {
                stack.push(0);
                pos += 1;
            }
            Some(b']') => {
                stack.pop();
                pos += 1;
                if stack.is_empty() {
                    return Ok(pos);
                }
                if let Some(count) = stack.last_mut() {
                    *count += 1;
                }
            }
            Some(b',') | Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => pos += 1,
            Some(c) if c.is_ascii_digit() || *c == b'-' || *c == b'+' || *c == b'.' => {
                let (value, end) = scan_number(data, pos)?;
                let axis = stack.last().copied().unwrap_or(0);
                if axis == 0 {
                    pending_x = value;
                } else if axis == 1 {
                    envelope.expand_to_include_point(pending_x, value);
                }
                if let Some(count) = stack.last_mut() {
                    *count += 1;
                }
                pos = end;
            }
            _ => {
                return Err(Error::MalformedFile(
                    "unexpected byte inside 'coordinates'".into(),
                ))
            }
        }
    }
}

fn scan_number(data: &[u8], start: usize) -> Result<(f64, usize)> {
    let mut end = start;
    while end < data.len()
        && matches!(data[end], b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E')
    {
        end += 1;
    }
    let text = std::str::from_utf8(&data[start..end])
        .map_err(|_| Error::MalformedFile("invalid number".into()))?;
    let value = text
        .parse::<f64>()
        .map_err(|_| Error::MalformedFile(format!("invalid number '{text}'")))?;
    Ok((value, end))
}

/// Walks the members of the object opening at `start`, invoking the visitor
/// with each raw key and its value's byte range. Returns the position just
/// past the closing brace.
fn each_member<F>(data: &[u8], start: usize, mut visit: F) -> Result<usize>
where
    F: FnMut(&[u8], usize, usize) -> Result<()>,
{
    let mut pos = skip_ws(data, start + 1);
    if data.get(pos) == Some(&b'}') {
        return Ok(pos + 1);
    }
    loop {
        if data.get(pos) != Some(&b'"') {
            return Err(Error::MalformedFile("expected an object key".into()));
        }
        let key_end = skip_string(data, pos)?;
        let key_range = (pos + 1, key_end - 1);
        pos = skip_ws(data, key_end);
        if data.get(pos) != Some(&b':') {
            return Err(Error::MalformedFile("expected ':' after object key".into()));
        }
        pos = skip_ws(data, pos + 1);
        let value_start = pos;
        let value_end = skip_value(data, pos)?;
        visit(&data[key_range.0..key_range.1], value_start, value_end)?;
        pos = skip_ws(data, value_end);
        match data.get(pos) {
            Some(b',') => pos = skip_ws(data, pos + 1),
            Some(b'}') => return Ok(pos + 1),
            _ => return Err(Error::MalformedFile("unterminated object".into())),
        }
    }
}

fn skip_ws(data: &[u8], mut pos: usize) -> usize {
    while pos < data.len() && data[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

/// Past the closing quote of the string opening at `start`.
fn skip_string(data: &[u8], start: usize) -> Result<usize> {
    let mut pos = start + 1;
    while pos < data.len() {
        match data[pos] {
            b'\\' => pos += 2,
            b'"' => return Ok(pos + 1),
            _ => pos += 1,
        }
    }
    Err(Error::MalformedFile("unterminated string".into()))
}

/// Past the end of any JSON value starting at `pos`. Containers are crossed
/// by depth counting; strings inside them (including ones full of braces)
/// are skipped whole.
fn skip_value(data: &[u8], pos: usize) -> Result<usize> {
    match data.get(pos) {
        None => Err(Error::MalformedFile("unexpected end of input".into())),
        Some(b'"') => skip_string(data, pos),
        Some(b'{') | Some(b'[') => {
            let mut depth = 0usize;
            let mut cursor = pos;
            while cursor < data.len() {
                match data[cursor] {
                    b'"' => {
                        cursor = skip_string(data, cursor)?;
                        continue;
                    }
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' => {
                        depth -= 1;
                        if depth == 0 {
                            return Ok(cursor + 1);
                        }
                    }
                    _ => {}
                }
                cursor += 1;
            }
            Err(Error::MalformedFile("unterminated container".into()))
        }
        Some(_) => {
            let mut cursor = pos;
            while cursor < data.len()
                && !matches!(data[cursor], b',' | b'}' | b']')
                && !data[cursor].is_ascii_whitespace()
            {
                cursor += 1;
            }
            Ok(cursor)
        }
    }
}

fn string_token(data: &[u8], start: usize, end: usize) -> Result<String> {
    if end <= start + 1 || data[start] != b'"' {
        return Err(Error::MalformedFile("expected a string value".into()));
    }
    Ok(String::from_utf8_lossy(&data[start + 1..end - 1]).into_owned())
}
