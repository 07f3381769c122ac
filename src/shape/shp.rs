use byteorder::{BigEndian, ByteOrder, LittleEndian};
use geo::{LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::source::ByteSource;

pub const FILE_HEADER_SIZE: u64 = 100;
pub const RECORD_HEADER_SIZE: u64 = 8;
const FILE_MAGIC: u32 = 9994;

pub const SHAPE_NULL: i32 = 0;
pub const SHAPE_POINT: i32 = 1;
pub const SHAPE_POLYLINE: i32 = 3;
pub const SHAPE_POLYGON: i32 = 5;
pub const SHAPE_MULTIPOINT: i32 = 8;
pub const SHAPE_MULTIPATCH: i32 = 31;

/// Collapses the Z (11/13/15/18) and M (21/23/25/28) variants onto their 2D
/// base code; Z and M blocks trail the 2D payload and are never read.
pub fn base_type(code: i32) -> i32 {
    match code {
        11 | 21 => SHAPE_POINT,
        13 | 23 => SHAPE_POLYLINE,
        15 | 25 => SHAPE_POLYGON,
        18 | 28 => SHAPE_MULTIPOINT,
        other => other,
    }
}

pub fn has_z(code: i32) -> bool {
    matches!(code, 11 | 13 | 15 | 18)
}

pub fn has_m_block(code: i32) -> bool {
    matches!(code, 21 | 23 | 25 | 28)
}

#[derive(Debug, Clone, Copy)]
pub struct ShpHeader {
    /// Total file length in bytes (declared in 16-bit words, big-endian).
    pub file_length: u64,
    pub shape_type: i32,
    pub bbox: Envelope<f64>,
}

pub fn read_file_header(source: &ByteSource) -> Result<ShpHeader> {
    let head = source
        .read(0, FILE_HEADER_SIZE as usize)
        .map_err(|_| Error::MalformedFile("shp header shorter than 100 bytes".into()))?;
    if BigEndian::read_u32(&head[0..4]) != FILE_MAGIC {
        return Err(Error::MalformedFile("not a shapefile (bad magic)".into()));
    }
    let file_length = u64::from(BigEndian::read_u32(&head[24..28])) * 2;
    let shape_type = LittleEndian::read_i32(&head[32..36]);
    let bbox = Envelope::new(
        LittleEndian::read_f64(&head[36..44]),
        LittleEndian::read_f64(&head[44..52]),
        LittleEndian::read_f64(&head[52..60]),
        LittleEndian::read_f64(&head[60..68]),
    );
    Ok(ShpHeader {
        file_length,
        shape_type,
        bbox,
    })
}

/// The big-endian record header: 1-based record number and content length
/// in 16-bit words.
pub fn read_record_header(source: &ByteSource, offset: u64) -> Result<(u32, usize)> {
    let head = source
        .read(offset, RECORD_HEADER_SIZE as usize)
        .map_err(|_| Error::malformed_record(offset, "truncated record header", &[]))?;
    let number = BigEndian::read_u32(&head[0..4]);
    let content_len = BigEndian::read_u32(&head[4..8]) as usize * 2;
    Ok((number, content_len))
}

/// Record envelope without a full parse, for the bulk scan. Points carry no
/// bbox, so theirs is computed; every other type declares one.
pub fn read_record_envelope(content: &[u8], offset: u64) -> Result<Envelope<f64>> {
    let code = content_type(content, offset)?;
    match base_type(code) {
        SHAPE_NULL => Ok(Envelope::invalid()),
        SHAPE_POINT => {
            require(content, 20, offset)?;
            let x = LittleEndian::read_f64(&content[4..12]);
            let y = LittleEndian::read_f64(&content[12..20]);
            Ok(Envelope::from_point(x, y))
        }
        _ => {
            require(content, 36, offset)?;
            Ok(Envelope::new(
                LittleEndian::read_f64(&content[4..12]),
                LittleEndian::read_f64(&content[12..20]),
                LittleEndian::read_f64(&content[20..28]),
                LittleEndian::read_f64(&content[28..36]),
            ))
        }
    }
}

fn content_type(content: &[u8], offset: u64) -> Result<i32> {
    require(content, 4, offset)?;
    Ok(LittleEndian::read_i32(&content[0..4]))
}

fn require(content: &[u8], len: usize, offset: u64) -> Result<()> {
    if content.len() < len {
        return Err(Error::malformed_record(
            offset,
            format!("record content shorter than {len} bytes"),
            content,
        ));
    }
    Ok(())
}

/// Parses one record's content into a geometry. Z and M blocks are skipped
/// by construction (nothing past the 2D payload is read); `validate` adds
/// the content-length check for files whose declared sizes disagree with
/// either layout.
pub fn parse_record(content: &[u8], offset: u64, validate: bool) -> Result<Geometry> {
    let code = content_type(content, offset)?;
    if code == SHAPE_MULTIPATCH {
        return Err(Error::UnsupportedGeometry("MultiPatch shape".into()));
    }
    if validate {
        validate_content_len(content, code, offset)?;
    }
    match base_type(code) {
        SHAPE_NULL => Ok(Geometry::Empty),
        SHAPE_POINT => {
            require(content, 20, offset)?;
            Ok(Geometry::Point(Point::new(
                LittleEndian::read_f64(&content[4..12]),
                LittleEndian::read_f64(&content[12..20]),
            )))
        }
        SHAPE_MULTIPOINT => {
            require(content, 40, offset)?;
            let count = LittleEndian::read_i32(&content[36..40]).max(0) as usize;
            let points = read_points(content, 40, count, offset)?;
            Ok(Geometry::MultiPoint(MultiPoint(
                points.into_iter().map(|(x, y)| Point::new(x, y)).collect(),
            )))
        }
        SHAPE_POLYLINE => {
            let parts = read_parts(content, offset)?;
            let mut lines: Vec<LineString<f64>> =
                parts.into_iter().map(LineString::from).collect();
            if lines.len() == 1 {
                Ok(Geometry::LineString(lines.swap_remove(0)))
            } else {
                Ok(Geometry::MultiLineString(MultiLineString(lines)))
            }
        }
        SHAPE_POLYGON => {
            let parts = read_parts(content, offset)?;
            Ok(group_rings(parts))
        }
        other => Err(Error::UnsupportedGeometry(format!(
            "shape type code {other}"
        ))),
    }
}

fn read_points(
    content: &[u8],
    start: usize,
    count: usize,
    offset: u64,
) -> Result<Vec<(f64, f64)>> {
    let end = start
        .checked_add(count.checked_mul(16).ok_or_else(|| {
            Error::malformed_record(offset, "point count overflow", content)
        })?)
        .ok_or_else(|| Error::malformed_record(offset, "point count overflow", content))?;
    require(content, end, offset)?;
    let mut points = Vec::with_capacity(count);
    for i in 0..count {
        let at = start + i * 16;
        points.push((
            LittleEndian::read_f64(&content[at..at + 8]),
            LittleEndian::read_f64(&content[at + 8..at + 16]),
        ));
    }
    Ok(points)
}

/// Shared PolyLine/Polygon layout: bbox, part offsets, points; returns one
/// coordinate run per part.
fn read_parts(content: &[u8], offset: u64) -> Result<Vec<Vec<(f64, f64)>>> {
    require(content, 44, offset)?;
    let num_parts = LittleEndian::read_i32(&content[36..40]).max(0) as usize;
    let num_points = LittleEndian::read_i32(&content[40..44]).max(0) as usize;
    let points_start = 44 + num_parts * 4;
    require(content, points_start, offset)?;
    let mut starts = Vec::with_capacity(num_parts);
    for i in 0..num_parts {
        let at = 44 + i * 4;
        starts.push(LittleEndian::read_u32(&content[at..at + 4]) as usize);
    }
    let points = read_points(content, points_start, num_points, offset)?;
    let mut parts = Vec::with_capacity(num_parts);
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(num_points);
        if start > end || end > num_points {
            return Err(Error::malformed_record(
                offset,
                "part offsets out of order",
                content,
            ));
        }
        parts.push(points[start..end].to_vec());
    }
    Ok(parts)
}

fn ring_area(ring: &[(f64, f64)]) -> f64 {
    let mut sum = 0.0;
    for window in ring.windows(2) {
        let (x1, y1) = window[0];
        let (x2, y2) = window[1];
        sum += x1 * y2 - x2 * y1;
    }
    sum / 2.0
}

/// Splits a polygon record's rings into exteriors and holes by winding:
/// ESRI exteriors are clockwise (negative signed area). Holes attach to the
/// most recent exterior; a leading counter-clockwise ring is tolerated as
/// an exterior. Orientation is normalized afterwards.
fn group_rings(parts: Vec<Vec<(f64, f64)>>) -> Geometry {
    let mut polygons: Vec<Polygon<f64>> = Vec::new();
    let mut exterior: Option<LineString<f64>> = None;
    let mut holes: Vec<LineString<f64>> = Vec::new();
    for ring in parts {
        if ring.len() < 4 {
            continue;
        }
        let is_exterior = ring_area(&ring) < 0.0 || exterior.is_none();
        let line = LineString::from(ring);
        if is_exterior {
            if let Some(prev) = exterior.take() {
                polygons.push(Polygon::new(prev, std::mem::take(&mut holes)));
            }
            exterior = Some(line);
        } else {
            holes.push(line);
        }
    }
    if let Some(prev) = exterior.take() {
        polygons.push(Polygon::new(prev, holes));
    }
    let mut geom = if polygons.len() == 1 {
        Geometry::Polygon(polygons.swap_remove(0))
    } else {
        Geometry::MultiPolygon(MultiPolygon(polygons))
    };
    geom.correct();
    geom
}

/// Declared content length vs the possible layouts: the plain 2D size, plus
/// a Z block and an optional M block for Z types, or an optional M block
/// for M types. The M block's presence is decided purely by this length
/// comparison.
fn validate_content_len(content: &[u8], code: i32, offset: u64) -> Result<()> {
    let actual = content.len();
    let allowed: Vec<usize> = match base_type(code) {
        SHAPE_NULL => vec![4],
        SHAPE_POINT => with_zm_point(code),
        SHAPE_MULTIPOINT => {
            require(content, 40, offset)?;
            let n = LittleEndian::read_i32(&content[36..40]).max(0) as usize;
            with_zm(40 + n * 16, n, code)
        }
        SHAPE_POLYLINE | SHAPE_POLYGON => {
            require(content, 44, offset)?;
            let parts = LittleEndian::read_i32(&content[36..40]).max(0) as usize;
            let n = LittleEndian::read_i32(&content[40..44]).max(0) as usize;
            with_zm(44 + parts * 4 + n * 16, n, code)
        }
        _ => return Ok(()),
    };
    if !allowed.contains(&actual) {
        return Err(Error::malformed_record(
            offset,
            format!(
                "content length {actual} matches no layout for shape type {code} (expected one of {allowed:?})"
            ),
            content,
        ));
    }
    Ok(())
}

/// Possible total sizes once Z/M blocks are appended: a block is a min/max
/// pair plus one f64 per point.
fn with_zm(base: usize, n: usize, code: i32) -> Vec<usize> {
    let block = 16 + n * 8;
    if has_z(code) {
        vec![base + block, base + 2 * block]
    } else if has_m_block(code) {
        vec![base, base + block]
    } else {
        vec![base]
    }
}

fn with_zm_point(code: i32) -> Vec<usize> {
    if has_z(code) {
        // x, y, z, then optional m.
        vec![28, 36]
    } else if has_m_block(code) {
        vec![20, 28]
    } else {
        vec![20]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_f64(out: &mut Vec<u8>, v: f64) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn le_i32(out: &mut Vec<u8>, v: i32) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn square_polygon_content() -> Vec<u8> {
        // Exterior ring, clockwise as ESRI writes them.
        let ring = [(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)];
        let mut out = Vec::new();
        le_i32(&mut out, SHAPE_POLYGON);
        for v in [0.0, 0.0, 1.0, 1.0] {
            le_f64(&mut out, v);
        }
        le_i32(&mut out, 1);
        le_i32(&mut out, ring.len() as i32);
        le_i32(&mut out, 0);
        for (x, y) in ring {
            le_f64(&mut out, x);
            le_f64(&mut out, y);
        }
        out
    }

    #[test]
    fn parses_a_point() {
        let mut content = Vec::new();
        le_i32(&mut content, SHAPE_POINT);
        le_f64(&mut content, 120.15);
        le_f64(&mut content, 48.47);
        match parse_record(&content, 0, true).unwrap() {
            Geometry::Point(p) => {
                assert_eq!(p.x(), 120.15);
                assert_eq!(p.y(), 48.47);
            }
            other => panic!("expected point, got {other:?}"),
        }
    }

    #[test]
    fn parses_a_square_polygon() {
        let content = square_polygon_content();
        let geom = parse_record(&content, 0, true).unwrap();
        assert_eq!(geom.envelope(), Envelope::new(0.0, 0.0, 1.0, 1.0));
        match geom {
            Geometry::Polygon(p) => {
                use geo::algorithm::winding_order::Winding;
                assert!(p.exterior().is_ccw());
                assert!(p.interiors().is_empty());
            }
            other => panic!("expected polygon, got {other:?}"),
        }
        assert_eq!(
            read_record_envelope(&content, 0).unwrap(),
            Envelope::new(0.0, 0.0, 1.0, 1.0)
        );
    }

    #[test]
    fn polygon_with_hole_groups_rings() {
        let exterior = [(0.0, 0.0), (0.0, 4.0), (4.0, 4.0), (4.0, 0.0), (0.0, 0.0)];
        let hole = [(1.0, 1.0), (2.0, 1.0), (2.0, 2.0), (1.0, 2.0), (1.0, 1.0)];
        let mut out = Vec::new();
        le_i32(&mut out, SHAPE_POLYGON);
        for v in [0.0, 0.0, 4.0, 4.0] {
            le_f64(&mut out, v);
        }
        le_i32(&mut out, 2);
        le_i32(&mut out, (exterior.len() + hole.len()) as i32);
        le_i32(&mut out, 0);
        le_i32(&mut out, exterior.len() as i32);
        for (x, y) in exterior.iter().chain(hole.iter()) {
            le_f64(&mut out, *x);
            le_f64(&mut out, *y);
        }
        match parse_record(&out, 0, true).unwrap() {
            Geometry::Polygon(p) => assert_eq!(p.interiors().len(), 1),
            other => panic!("expected polygon, got {other:?}"),
        }
    }

    #[test]
    fn polyline_single_part_is_a_line_string() {
        let mut out = Vec::new();
        le_i32(&mut out, SHAPE_POLYLINE);
        for v in [0.0, 0.0, 2.0, 2.0] {
            le_f64(&mut out, v);
        }
        le_i32(&mut out, 1);
        le_i32(&mut out, 2);
        le_i32(&mut out, 0);
        for (x, y) in [(0.0, 0.0), (2.0, 2.0)] {
            le_f64(&mut out, x);
            le_f64(&mut out, y);
        }
        assert!(matches!(
            parse_record(&out, 0, true).unwrap(),
            Geometry::LineString(_)
        ));
    }

    #[test]
    fn pointz_reads_2d_and_validates_length() {
        let mut content = Vec::new();
        le_i32(&mut content, 11);
        le_f64(&mut content, 1.0);
        le_f64(&mut content, 2.0);
        le_f64(&mut content, 30.0);
        // Without M: 28 bytes, valid.
        assert!(matches!(
            parse_record(&content, 0, true).unwrap(),
            Geometry::Point(_)
        ));
        // A length matching neither layout fails validation.
        content.extend_from_slice(&[0u8; 3]);
        assert!(parse_record(&content, 0, true).is_err());
        assert!(parse_record(&content, 0, false).is_ok());
    }

    #[test]
    fn multipatch_is_unsupported() {
        let mut content = Vec::new();
        le_i32(&mut content, SHAPE_MULTIPATCH);
        assert!(matches!(
            parse_record(&content, 0, true),
            Err(Error::UnsupportedGeometry(_))
        ));
    }

    #[test]
    fn null_shape_is_empty() {
        let mut content = Vec::new();
        le_i32(&mut content, SHAPE_NULL);
        assert!(parse_record(&content, 0, true).unwrap().is_empty());
    }
}
