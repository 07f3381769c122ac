use std::sync::Arc;

use crate::datasource::Featureset;
use crate::error::Result;
use crate::feature::{Context, Feature};
use crate::index::IndexRecord;
use crate::source::ByteSource;

use super::dbf::DbfFile;
use super::shp;

/// Seeks to each candidate record, parses the shape, and joins the DBF row
/// by record number. Feature ids are the 1-based record numbers, so full
/// scans count 1..n.
pub(crate) struct ShapeFeatureset {
    shp: Arc<ByteSource>,
    dbf: Arc<DbfFile>,
    ctx: Arc<Context>,
    candidates: std::vec::IntoIter<IndexRecord>,
    properties: Option<Vec<String>>,
    strict: bool,
    encoding: String,
    remaining: Option<u64>,
}

impl ShapeFeatureset {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shp: Arc<ByteSource>,
        dbf: Arc<DbfFile>,
        ctx: Arc<Context>,
        candidates: Vec<IndexRecord>,
        properties: Option<Vec<String>>,
        strict: bool,
        encoding: String,
        row_limit: u64,
    ) -> Self {
        ShapeFeatureset {
            shp,
            dbf,
            ctx,
            candidates: candidates.into_iter(),
            properties,
            strict,
            encoding,
            remaining: (row_limit > 0).then_some(row_limit),
        }
    }

    fn wants(&self, name: &str) -> bool {
        match &self.properties {
            None => true,
            Some(names) => names.iter().any(|n| n == name),
        }
    }

    fn parse(&self, record: &IndexRecord) -> Result<Feature> {
        let (number, content_len) = shp::read_record_header(&self.shp, record.offset)?;
        let content = self
            .shp
            .read(record.offset + shp::RECORD_HEADER_SIZE, content_len)?;
        let geometry = shp::parse_record(&content, record.offset, self.strict)?;

        let mut feature = Feature::new(u64::from(number), self.ctx.clone());
        feature.geometry = geometry;
        let row = self.dbf.record(number.saturating_sub(1))?;
        for (i, field) in self.dbf.fields().iter().enumerate() {
            if !self.wants(&field.name) {
                continue;
            }
            feature.put_by_index(i, self.dbf.value(&row, i, &self.encoding));
        }
        Ok(feature)
    }
}

impl Featureset for ShapeFeatureset {
    fn next(&mut self) -> Option<Result<Feature>> {
        loop {
            if self.remaining == Some(0) {
                return None;
            }
            let record = self.candidates.next()?;
            match self.parse(&record) {
                Ok(feature) => {
                    if let Some(left) = self.remaining.as_mut() {
                        *left -= 1;
                    }
                    return Some(Ok(feature));
                }
                Err(err) if self.strict => return Some(Err(err)),
                Err(err) => {
                    log::warn!("shape: skipping record at byte {}: {err}", record.offset);
                }
            }
        }
    }
}
