use std::fs;

use terrasource::datasource::open;
use terrasource::{Datasource, Envelope, Error, Feature, Featureset, Params, Query, Value};

const COLLECTION: &str = r#"{"type":"FeatureCollection","features":[
    {"type":"Feature","geometry":{"type":"Point","coordinates":[0,0]},"properties":{"name":"origin","rank":1}},
    {"type":"Feature","geometry":{"type":"Point","coordinates":[5,5]},"properties":{"name":"mid","rank":2,"extra":true}},
    {"type":"Feature","geometry":{"type":"LineString","coordinates":[[8,8],[9,9]]},"properties":{"name":"line","rank":3}}
]}"#;

fn inline(json: &str) -> Params {
    Params::new().with("type", "geojson").with("inline", json)
}

fn world() -> Query {
    Query::new(Envelope::new(-180.0, -90.0, 180.0, 90.0))
}

fn collect(params: &Params, query: &Query) -> Vec<Feature> {
    let ds = open(params).unwrap();
    let mut fs = ds.features(query).unwrap();
    let mut out = Vec::new();
    while let Some(feature) = fs.next() {
        out.push(feature.unwrap());
    }
    out
}

#[test]
fn single_feature_point() {
    let params = inline(
        r#"{"type":"Feature","geometry":{"type":"Point","coordinates":[100,0]},"properties":{}}"#,
    );
    let ds = open(&params).unwrap();
    assert_eq!(ds.envelope(), Envelope::new(100.0, 0.0, 100.0, 0.0));
    let features = collect(&params, &world());
    assert_eq!(features.len(), 1);
    assert_eq!(features[0].envelope(), Envelope::new(100.0, 0.0, 100.0, 0.0));
}

#[test]
fn bare_geometry_becomes_one_feature() {
    let params = inline(r#"{"type":"Point","coordinates":[3,4]}"#);
    let features = collect(&params, &world());
    assert_eq!(features.len(), 1);
    assert!(features[0].iter().next().is_none());
}

#[test]
fn collection_queries_filter_by_bbox() {
    let params = inline(COLLECTION).with("num_features_to_query", -1i64);
    let ds = open(&params).unwrap();
    assert_eq!(ds.envelope(), Envelope::new(0.0, 0.0, 9.0, 9.0));

    let hits = collect(&params, &Query::new(Envelope::new(4.0, 4.0, 6.0, 6.0)));
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].get("name"), Some(&Value::Text("mid".into())));

    let all = collect(&params, &world());
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].id(), 1);
    assert_eq!(all[2].id(), 3);
}

#[test]
fn schema_is_alphabetical_and_mode_independent() {
    let indexed = inline(COLLECTION).with("num_features_to_query", -1i64);
    let cached = inline(COLLECTION).with("cache_features", true);
    let indexed_fields: Vec<String> = open(&indexed)
        .unwrap()
        .descriptor()
        .fields
        .iter()
        .map(|f| f.name.clone())
        .collect();
    let cached_fields: Vec<String> = open(&cached)
        .unwrap()
        .descriptor()
        .fields
        .iter()
        .map(|f| f.name.clone())
        .collect();
    assert_eq!(indexed_fields, vec!["extra", "name", "rank"]);
    assert_eq!(indexed_fields, cached_fields);
}

#[test]
fn cached_and_indexed_agree_on_results() {
    let query = Query::new(Envelope::new(-1.0, -1.0, 6.0, 6.0));
    let indexed = collect(&inline(COLLECTION).with("num_features_to_query", -1i64), &query);
    let cached = collect(
        &inline(COLLECTION).with("cache_features", true),
        &query,
    );
    assert_eq!(indexed.len(), 2);
    assert_eq!(indexed.len(), cached.len());
    for (a, b) in indexed.iter().zip(&cached) {
        assert_eq!(a.get("name"), b.get("name"));
        assert_eq!(a.envelope(), b.envelope());
    }
}

#[test]
fn nested_collections_become_one_feature_attribute_free() {
    let params = inline(
        r#"{"type":"GeometryCollection","geometries":[
            {"type":"Point","coordinates":[1,1]},
            {"type":"LineString","coordinates":[[2,2],[3,3]]}
        ]}"#,
    );
    let features = collect(&params, &world());
    assert_eq!(features.len(), 1);
    assert_eq!(features[0].envelope(), Envelope::new(1.0, 1.0, 3.0, 3.0));
}

#[test]
fn nested_geometry_collection_is_rejected() {
    let params = inline(
        r#"{"type":"Feature","properties":{},"geometry":{"type":"GeometryCollection","geometries":[
            {"type":"GeometryCollection","geometries":[{"type":"Point","coordinates":[1,1]}]}
        ]}}"#,
    )
    .with("strict", true);
    let ds = open(&params).unwrap();
    let mut fs = ds.features(&world()).unwrap();
    assert!(matches!(fs.next(), Some(Err(Error::MalformedFile(_)))));
}

#[test]
fn empty_point_coordinates_are_rejected() {
    let params = inline(
        r#"{"type":"FeatureCollection","features":[
            {"type":"Feature","geometry":{"type":"Point","coordinates":[]},"properties":{}}
        ]}"#,
    );
    // The extractor finds no usable envelope, so nothing is indexed.
    let features = collect(&params, &world());
    assert!(features.is_empty());
}

#[test]
fn trailing_garbage_is_strict_only() {
    let doc = r#"{"type":"Point","coordinates":[1,1]} trailing"#;
    assert!(open(&inline(doc)).is_ok());
    assert!(matches!(
        open(&inline(doc).with("strict", true)),
        Err(Error::MalformedFile(_))
    ));
}

#[test]
fn nested_json_attributes_serialize_canonically() {
    let params = inline(
        r#"{"type":"FeatureCollection","features":[
            {"type":"Feature","geometry":{"type":"Point","coordinates":[0,0]},
             "properties":{"meta":{"a":[1,2,3]}}}
        ]}"#,
    );
    let features = collect(&params, &world());
    match features[0].get("meta") {
        Some(Value::Text(text)) => {
            let value: serde_json::Value = serde_json::from_str(text).unwrap();
            assert_eq!(value["a"][2], 3);
        }
        other => panic!("expected text attribute, got {other:?}"),
    }
}

#[test]
fn file_backed_collection_with_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.geojson");
    fs::write(&path, COLLECTION).unwrap();

    let params = Params::new()
        .with("type", "geojson")
        .with("file", path.to_str().unwrap())
        .with("num_features_to_query", -1i64);
    let before = collect(&params, &world());
    assert_eq!(before.len(), 3);

    // Build the sidecar from the extractor's boxes, as the CLI does.
    let data = fs::read(&path).unwrap();
    let extracted = terrasource::geojson::extract::extract_feature_boxes(&data).unwrap();
    let mut extent = Envelope::invalid();
    for feature_box in &extracted.boxes {
        extent.expand_to_include(&feature_box.envelope);
    }
    let mut tree = terrasource::index::QuadTree::new(extent.to_f32());
    for feature_box in &extracted.boxes {
        tree.insert(terrasource::index::IndexRecord {
            offset: feature_box.offset,
            size: feature_box.size,
            envelope: feature_box.envelope.to_f32(),
        });
    }
    tree.trim();
    let mut file = fs::File::create(terrasource::index::file::sidecar_path(&path)).unwrap();
    tree.write(&mut file).unwrap();

    let after = collect(&params, &world());
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.get("name"), b.get("name"));
        assert_eq!(a.envelope(), b.envelope());
    }
}
