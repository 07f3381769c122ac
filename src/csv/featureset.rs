use std::sync::Arc;

use crate::datasource::Featureset;
use crate::error::Result;
use crate::feature::{Context, Feature};
use crate::index::IndexRecord;
use crate::source::ByteSource;

use super::{extract_geometry, split_fields, typed_value, CsvLayout};

/// Lazily re-reads and re-parses the records the index flagged for a query,
/// in ascending offset order.
pub(crate) struct CsvFeatureset {
    source: Arc<ByteSource>,
    layout: Arc<CsvLayout>,
    ctx: Arc<Context>,
    candidates: std::vec::IntoIter<IndexRecord>,
    properties: Option<Vec<String>>,
    feature_id: u64,
    remaining: Option<u64>,
}

impl CsvFeatureset {
    pub fn new(
        source: Arc<ByteSource>,
        layout: Arc<CsvLayout>,
        ctx: Arc<Context>,
        candidates: Vec<IndexRecord>,
        properties: Option<Vec<String>>,
        row_limit: u64,
    ) -> Self {
        CsvFeatureset {
            source,
            layout,
            ctx,
            candidates: candidates.into_iter(),
            properties,
            feature_id: 0,
            remaining: (row_limit > 0).then_some(row_limit),
        }
    }

    fn wants(&self, name: &str) -> bool {
        match &self.properties {
            None => true,
            Some(names) => names.iter().any(|n| n == name),
        }
    }

    fn parse(&self, record: &IndexRecord, id: u64) -> Result<Feature> {
        let layout = &self.layout;
        let bytes = self.source.read(record.offset, record.size as usize)?;
        let fields = split_fields(
            &bytes,
            record.offset,
            &layout.dialect,
            &layout.headers,
            &layout.encoding,
        )?;
        let mut feature = Feature::new(id, self.ctx.clone());
        feature.geometry = extract_geometry(&fields, &layout.locator, record.offset)?;
        for (column, field) in fields.iter().enumerate() {
            let slot = match layout.slots[column] {
                Some(slot) => slot,
                None => continue,
            };
            if !self.wants(&layout.headers[column]) {
                continue;
            }
            let value = typed_value(
                field,
                layout.column_types[column],
                record.offset,
                layout.strict,
            )?;
            feature.put_by_index(slot, value);
        }
        Ok(feature)
    }
}

impl Featureset for CsvFeatureset {
    fn next(&mut self) -> Option<Result<Feature>> {
        loop {
            if self.remaining == Some(0) {
                return None;
            }
            let record = self.candidates.next()?;
            match self.parse(&record, self.feature_id + 1) {
                Ok(feature) => {
                    self.feature_id += 1;
                    if let Some(left) = self.remaining.as_mut() {
                        *left -= 1;
                    }
                    return Some(Ok(feature));
                }
                Err(err) if self.layout.strict => return Some(Err(err)),
                Err(err) => {
                    log::warn!("csv: skipping record at byte {}: {err}", record.offset);
                }
            }
        }
    }
}
