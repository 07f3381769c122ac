pub mod dbf;
mod featureset;
pub mod shp;

use std::sync::Arc;

use crate::datasource::{Datasource, DatasourceType, Descriptor, Featureset, FieldDescriptor, Query};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::feature::Context;
use crate::geometry::GeometryKind;
use crate::index::file::open_sidecar;
use crate::index::{IndexRecord, QuadTree, SpatialIndex};
use crate::params::Params;
use crate::source::ByteSource;
use dbf::DbfFile;
use featureset::ShapeFeatureset;

pub struct ShapeDatasource {
    shp: Arc<ByteSource>,
    dbf: Arc<DbfFile>,
    ctx: Arc<Context>,
    index: SpatialIndex,
    extent: Envelope<f64>,
    strict: bool,
    encoding: String,
    row_limit: u64,
    desc: Descriptor,
}

pub fn create(params: &Params) -> Result<Box<dyn Datasource>> {
    Ok(Box::new(ShapeDatasource::from_params(params)?))
}

impl ShapeDatasource {
    pub fn from_params(params: &Params) -> Result<Self> {
        let strict = params.get_bool("strict")?.unwrap_or(false);
        let row_limit = params.get_int("row_limit")?.unwrap_or(0).max(0) as u64;
        let encoding = params.get_text("encoding").unwrap_or_else(|| "utf-8".into());

        // `file` names the triple with or without its .shp extension.
        let stem = {
            let path = params.resolve_path()?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("shp") => path.with_extension(""),
                _ => path,
            }
        };
        let shp_path = stem.with_extension("shp");
        let dbf_path = stem.with_extension("dbf");

        let shp = Arc::new(ByteSource::open(&shp_path)?);
        let header = shp::read_file_header(&shp)?;
        if header.shape_type == shp::SHAPE_MULTIPATCH {
            return Err(Error::UnsupportedGeometry("MultiPatch shapefile".into()));
        }
        let dbf = Arc::new(DbfFile::open(&dbf_path)?);

        let ctx = Arc::new(Context::from_names(
            dbf.fields().iter().map(|f| f.name.clone()),
        ));
        let fields = dbf
            .fields()
            .iter()
            .map(|f| FieldDescriptor {
                name: f.name.clone(),
                attr_type: f.attr_type(),
            })
            .collect();

        // The sidecar sits next to the triple as `<stem>.index`.
        let index = match open_sidecar(&stem, strict)? {
            Some(file) => SpatialIndex::Disk(file),
            None => SpatialIndex::Memory(scan(&shp, &header, strict)?),
        };

        let extent = match params.get_text("extent") {
            Some(text) => text.parse()?,
            None => header.bbox,
        };

        let desc = Descriptor {
            name: "shape",
            ds_type: DatasourceType::Vector,
            geometry_kind: geometry_kind(header.shape_type),
            fields,
            encoding: encoding.clone(),
        };

        Ok(ShapeDatasource {
            shp,
            dbf,
            ctx,
            index,
            extent,
            strict,
            encoding,
            row_limit,
            desc,
        })
    }
}

fn geometry_kind(shape_type: i32) -> Option<GeometryKind> {
    match shp::base_type(shape_type) {
        shp::SHAPE_POINT | shp::SHAPE_MULTIPOINT => Some(GeometryKind::Point),
        shp::SHAPE_POLYLINE => Some(GeometryKind::LineString),
        shp::SHAPE_POLYGON => Some(GeometryKind::Polygon),
        _ => None,
    }
}

/// Without a sidecar index the whole `.shp` is walked once at open: record
/// headers give the offsets, record bboxes give the envelopes.
fn scan(shp: &ByteSource, header: &shp::ShpHeader, strict: bool) -> Result<QuadTree> {
    let mut tree = QuadTree::new(header.bbox.to_f32());
    let file_end = header.file_length.min(shp.len());
    let mut offset = shp::FILE_HEADER_SIZE;
    while offset + shp::RECORD_HEADER_SIZE <= file_end {
        let (_, content_len) = shp::read_record_header(shp, offset)?;
        let content_at = offset + shp::RECORD_HEADER_SIZE;
        if content_at + content_len as u64 > file_end {
            return Err(Error::malformed_record(
                offset,
                "record content runs past end of file",
                &[],
            ));
        }
        let content = shp.read(content_at, content_len)?;
        match shp::read_record_envelope(&content, offset) {
            Ok(env) if env.valid() => {
                tree.insert(IndexRecord {
                    offset,
                    size: shp::RECORD_HEADER_SIZE + content_len as u64,
                    envelope: env.to_f32(),
                });
            }
            Ok(_) => {
                log::debug!("shape: record at byte {offset} has no extent (null shape?)");
            }
            Err(err) if strict => return Err(err),
            Err(err) => log::warn!("shape: skipping record at byte {offset}: {err}"),
        }
        offset = content_at + content_len as u64;
    }
    tree.trim();
    Ok(tree)
}

impl Datasource for ShapeDatasource {
    fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    fn envelope(&self) -> Envelope<f64> {
        self.extent
    }

    fn features(&self, query: &Query) -> Result<Box<dyn Featureset + Send>> {
        let candidates = self.index.query(&query.bbox)?;
        Ok(Box::new(ShapeFeatureset::new(
            self.shp.clone(),
            self.dbf.clone(),
            self.ctx.clone(),
            candidates,
            query.properties.clone(),
            self.strict,
            self.encoding.clone(),
            self.row_limit,
        )))
    }
}
