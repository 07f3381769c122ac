//! Fixture builders shared by the integration suites. Binary fixtures are
//! synthesized here rather than checked in, so every byte is visible next
//! to the assertions that depend on it.
#![allow(dead_code)]

use std::fs;
use std::path::Path;

pub fn le_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn le_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn be_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Assembles a `.shp` file: the 100-byte header followed by the records'
/// contents, each behind its big-endian `(record_number, content_words)`
/// header.
pub fn shp_bytes(shape_type: i32, bbox: (f64, f64, f64, f64), contents: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = 100 + contents.iter().map(|c| 8 + c.len()).sum::<usize>();
    let mut out = Vec::with_capacity(total);
    be_u32(&mut out, 9994);
    out.extend_from_slice(&[0u8; 20]);
    be_u32(&mut out, (total / 2) as u32);
    le_i32(&mut out, 1000);
    le_i32(&mut out, shape_type);
    for v in [bbox.0, bbox.1, bbox.2, bbox.3] {
        le_f64(&mut out, v);
    }
    out.resize(100, 0);
    for (i, content) in contents.iter().enumerate() {
        be_u32(&mut out, i as u32 + 1);
        be_u32(&mut out, (content.len() / 2) as u32);
        out.extend_from_slice(content);
    }
    out
}

pub fn point_content(x: f64, y: f64) -> Vec<u8> {
    let mut out = Vec::new();
    le_i32(&mut out, 1);
    le_f64(&mut out, x);
    le_f64(&mut out, y);
    out
}

/// Polygon record content from explicit rings (already closed).
pub fn polygon_content(rings: &[Vec<(f64, f64)>]) -> Vec<u8> {
    let mut bbox = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for (x, y) in rings.iter().flatten() {
        bbox.0 = bbox.0.min(*x);
        bbox.1 = bbox.1.min(*y);
        bbox.2 = bbox.2.max(*x);
        bbox.3 = bbox.3.max(*y);
    }
    let num_points: usize = rings.iter().map(|r| r.len()).sum();
    let mut out = Vec::new();
    le_i32(&mut out, 5);
    for v in [bbox.0, bbox.1, bbox.2, bbox.3] {
        le_f64(&mut out, v);
    }
    le_i32(&mut out, rings.len() as i32);
    le_i32(&mut out, num_points as i32);
    let mut start = 0i32;
    for ring in rings {
        le_i32(&mut out, start);
        start += ring.len() as i32;
    }
    for (x, y) in rings.iter().flatten() {
        le_f64(&mut out, *x);
        le_f64(&mut out, *y);
    }
    out
}

/// dBASE III table with the given `(name, type, length, decimals)` fields.
pub fn dbf_bytes(fields: &[(&str, u8, u8, u8)], rows: &[Vec<&str>]) -> Vec<u8> {
    let header_len = 32 + fields.len() * 32 + 1;
    let record_len: usize = 1 + fields.iter().map(|f| f.2 as usize).sum::<usize>();
    let mut out = Vec::new();
    out.push(0x03);
    out.extend_from_slice(&[26, 8, 1]);
    out.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    out.extend_from_slice(&(header_len as u16).to_le_bytes());
    out.extend_from_slice(&(record_len as u16).to_le_bytes());
    out.resize(32, 0);
    for (name, ftype, length, decimals) in fields {
        let mut desc = [0u8; 32];
        desc[..name.len()].copy_from_slice(name.as_bytes());
        desc[11] = *ftype;
        desc[16] = *length;
        desc[17] = *decimals;
        out.extend_from_slice(&desc);
    }
    out.push(0x0d);
    for row in rows {
        out.push(b' ');
        for ((_, _, length, _), cell) in fields.iter().zip(row) {
            let mut cell_bytes = cell.as_bytes().to_vec();
            cell_bytes.resize(*length as usize, b' ');
            out.extend_from_slice(&cell_bytes);
        }
    }
    out.push(0x1a);
    out
}

/// Writes a `<stem>.shp` + `<stem>.dbf` pair into `dir`.
pub fn write_shapefile(
    dir: &Path,
    stem: &str,
    shape_type: i32,
    bbox: (f64, f64, f64, f64),
    contents: &[Vec<u8>],
    fields: &[(&str, u8, u8, u8)],
    rows: &[Vec<&str>],
) {
    fs::write(dir.join(format!("{stem}.shp")), shp_bytes(shape_type, bbox, contents)).unwrap();
    fs::write(dir.join(format!("{stem}.dbf")), dbf_bytes(fields, rows)).unwrap();
}

// Protobuf-wire helpers for geobuf fixtures.

pub fn varint(out: &mut Vec<u8>, mut value: u64) {
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

pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn pb_field(out: &mut Vec<u8>, number: u32, wire: u8) {
    varint(out, ((number as u64) << 3) | wire as u64);
}

pub fn pb_bytes(out: &mut Vec<u8>, number: u32, payload: &[u8]) {
    pb_field(out, number, 2);
    varint(out, payload.len() as u64);
    out.extend_from_slice(payload);
}
