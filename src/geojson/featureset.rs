use std::sync::Arc;

use crate::datasource::{restrict_to_query, Featureset, Query};
use crate::error::Result;
use crate::feature::Feature;
use crate::index::IndexRecord;
use crate::source::ByteSource;

use super::{parse_feature_slice, GeojsonLayout};

/// Indexed mode: hits are byte ranges, re-parsed one at a time.
pub(crate) struct GeojsonFeatureset {
    source: Arc<ByteSource>,
    layout: Arc<GeojsonLayout>,
    candidates: std::vec::IntoIter<IndexRecord>,
    properties: Option<Vec<String>>,
    feature_id: u64,
}

impl GeojsonFeatureset {
    pub fn new(
        source: Arc<ByteSource>,
        layout: Arc<GeojsonLayout>,
        candidates: Vec<IndexRecord>,
        properties: Option<Vec<String>>,
    ) -> Self {
        GeojsonFeatureset {
            source,
            layout,
            candidates: candidates.into_iter(),
            properties,
            feature_id: 0,
        }
    }
}

impl Featureset for GeojsonFeatureset {
    fn next(&mut self) -> Option<Result<Feature>> {
        loop {
            let record = self.candidates.next()?;
            let parsed = self
                .source
                .read(record.offset, record.size as usize)
                .and_then(|slice| {
                    parse_feature_slice(
                        &slice,
                        record.offset,
                        self.feature_id + 1,
                        &self.layout,
                        &self.properties,
                    )
                });
            match parsed {
                Ok(feature) => {
                    self.feature_id += 1;
                    return Some(Ok(feature));
                }
                Err(err) if self.layout.strict => return Some(Err(err)),
                Err(err) => {
                    log::warn!("geojson: skipping feature at byte {}: {err}", record.offset);
                }
            }
        }
    }
}

/// Cached mode: hits are indices into the up-front parsed feature vector.
pub(crate) struct CachedFeatureset {
    features: Arc<Vec<Feature>>,
    hits: std::vec::IntoIter<usize>,
    query: Query,
}

impl CachedFeatureset {
    pub fn new(features: Arc<Vec<Feature>>, hits: Vec<usize>, query: &Query) -> Self {
        CachedFeatureset {
            features,
            hits: hits.into_iter(),
            query: query.clone(),
        }
    }
}

impl Featureset for CachedFeatureset {
    fn next(&mut self) -> Option<Result<Feature>> {
        let index = self.hits.next()?;
        self.features
            .get(index)
            .map(|feature| Ok(restrict_to_query(feature, &self.query)))
    }
}
