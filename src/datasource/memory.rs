use crate::datasource::{
    restrict_to_query, Datasource, DatasourceType, Descriptor, Featureset, Query,
};
use crate::envelope::Envelope;
use crate::error::Result;
use crate::feature::Feature;
use crate::params::Params;

/// In-memory datasource fed programmatically. Mostly useful for tests and
/// for callers that synthesize features; queries filter linearly on the
/// stored envelopes.
pub struct MemoryDatasource {
    features: Vec<Feature>,
    envelopes: Vec<Envelope<f64>>,
    extent: Envelope<f64>,
    desc: Descriptor,
}

impl MemoryDatasource {
    pub fn new() -> Self {
        MemoryDatasource {
            features: Vec::new(),
            envelopes: Vec::new(),
            extent: Envelope::invalid(),
            desc: Descriptor {
                name: "memory",
                ds_type: DatasourceType::Vector,
                geometry_kind: None,
                fields: Vec::new(),
                encoding: "utf-8".to_string(),
            },
        }
    }

    pub fn push(&mut self, feature: Feature) {
        let env = feature.envelope();
        self.extent.expand_to_include(&env);
        if self.desc.geometry_kind.is_none() {
            self.desc.geometry_kind = feature.geometry.kind();
        }
        self.envelopes.push(env);
        self.features.push(feature);
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

impl Default for MemoryDatasource {
    fn default() -> Self {
        MemoryDatasource::new()
    }
}

pub fn create(_params: &Params) -> Result<Box<dyn Datasource>> {
    Ok(Box::new(MemoryDatasource::new()))
}

impl Datasource for MemoryDatasource {
    fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    fn envelope(&self) -> Envelope<f64> {
        self.extent
    }

    fn features(&self, query: &Query) -> Result<Box<dyn Featureset + Send>> {
        let hits: Vec<Feature> = self
            .features
            .iter()
            .zip(&self.envelopes)
            .filter(|(_, env)| env.intersects(&query.bbox))
            .map(|(feature, _)| restrict_to_query(feature, query))
            .collect();
        Ok(Box::new(MemoryFeatureset {
            features: hits.into_iter(),
        }))
    }
}

struct MemoryFeatureset {
    features: std::vec::IntoIter<Feature>,
}

impl Featureset for MemoryFeatureset {
    fn next(&mut self) -> Option<Result<Feature>> {
        self.features.next().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::feature::{Context, Value};
    use crate::geometry::Geometry;
    use geo::Point;

    fn point_feature(id: u64, ctx: &Arc<Context>, x: f64, y: f64) -> Feature {
        let mut f = Feature::new(id, ctx.clone());
        f.geometry = Geometry::Point(Point::new(x, y));
        f.put_by_index(0, Value::Integer(id as i64));
        f
    }

    #[test]
    fn query_filters_by_envelope() {
        let ctx = Arc::new(Context::from_names(["n"]));
        let mut ds = MemoryDatasource::new();
        ds.push(point_feature(1, &ctx, 0.0, 0.0));
        ds.push(point_feature(2, &ctx, 5.0, 5.0));

        let mut fs = ds.features(&Query::new(Envelope::new(-1.0, -1.0, 1.0, 1.0))).unwrap();
        let hit = fs.next().unwrap().unwrap();
        assert_eq!(hit.id(), 1);
        assert!(fs.next().is_none());
        assert_eq!(ds.envelope(), Envelope::new(0.0, 0.0, 5.0, 5.0));
    }
}
