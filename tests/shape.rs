mod common;

use terrasource::datasource::open;
use terrasource::{
    Datasource, Envelope, Error, Feature, Featureset, GeometryKind, Params, Query, Value,
};

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

fn shape_params(dir: &std::path::Path, stem: &str) -> Params {
    Params::new()
        .with("type", "shape")
        .with("file", dir.join(stem).to_str().unwrap())
}

#[test]
fn square_polygon_with_dbf_attribute() {
    let dir = tempfile::tempdir().unwrap();
    let square = vec![vec![
        (0.0, 0.0),
        (0.0, 1.0),
        (1.0, 1.0),
        (1.0, 0.0),
        (0.0, 0.0),
    ]];
    common::write_shapefile(
        dir.path(),
        "square",
        5,
        (0.0, 0.0, 1.0, 1.0),
        &[common::polygon_content(&square)],
        &[("NAME", b'C', 12, 0)],
        &[vec!["unit square"]],
    );

    let params = shape_params(dir.path(), "square");
    let ds = open(&params).unwrap();
    assert_eq!(ds.envelope(), Envelope::new(0.0, 0.0, 1.0, 1.0));
    assert_eq!(ds.descriptor().geometry_kind, Some(GeometryKind::Polygon));

    let features = collect(&params, &world());
    assert_eq!(features.len(), 1);
    assert_eq!(features[0].id(), 1);
    assert_eq!(features[0].envelope(), Envelope::new(0.0, 0.0, 1.0, 1.0));
    assert_eq!(
        features[0].get("NAME"),
        Some(&Value::Text("unit square".into()))
    );
}

#[test]
fn point_records_query_by_bbox_in_record_order() {
    let dir = tempfile::tempdir().unwrap();
    common::write_shapefile(
        dir.path(),
        "pts",
        1,
        (0.0, 0.0, 10.0, 10.0),
        &[
            common::point_content(0.0, 0.0),
            common::point_content(5.0, 5.0),
            common::point_content(10.0, 10.0),
        ],
        &[("ID", b'N', 4, 0)],
        &[vec!["10"], vec!["20"], vec!["30"]],
    );

    let params = shape_params(dir.path(), "pts");
    let all = collect(&params, &world());
    assert_eq!(all.len(), 3);
    assert_eq!(
        all.iter().map(|f| f.id()).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(all[1].get("ID"), Some(&Value::Integer(20)));

    let hits = collect(&params, &Query::new(Envelope::new(4.0, 4.0, 6.0, 6.0)));
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id(), 2);
}

#[test]
fn file_param_may_carry_the_extension() {
    let dir = tempfile::tempdir().unwrap();
    common::write_shapefile(
        dir.path(),
        "ext",
        1,
        (0.0, 0.0, 1.0, 1.0),
        &[common::point_content(0.5, 0.5)],
        &[("ID", b'N', 4, 0)],
        &[vec!["1"]],
    );
    let params = Params::new()
        .with("type", "shape")
        .with("file", dir.path().join("ext.shp").to_str().unwrap());
    assert_eq!(collect(&params, &world()).len(), 1);
}

#[test]
fn multipatch_is_rejected_at_open() {
    let dir = tempfile::tempdir().unwrap();
    common::write_shapefile(
        dir.path(),
        "patch",
        31,
        (0.0, 0.0, 1.0, 1.0),
        &[],
        &[("ID", b'N', 4, 0)],
        &[],
    );
    assert!(matches!(
        open(&shape_params(dir.path(), "patch")),
        Err(Error::UnsupportedGeometry(_))
    ));
}

#[test]
fn missing_dbf_is_no_such_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("lonely.shp"),
        common::shp_bytes(1, (0.0, 0.0, 1.0, 1.0), &[common::point_content(0.0, 0.0)]),
    )
    .unwrap();
    assert!(matches!(
        open(&shape_params(dir.path(), "lonely")),
        Err(Error::NoSuchFile(_))
    ));
}

#[test]
fn row_limit_applies_to_featuresets() {
    let dir = tempfile::tempdir().unwrap();
    common::write_shapefile(
        dir.path(),
        "lim",
        1,
        (0.0, 0.0, 10.0, 10.0),
        &[
            common::point_content(1.0, 1.0),
            common::point_content(2.0, 2.0),
            common::point_content(3.0, 3.0),
        ],
        &[("ID", b'N', 4, 0)],
        &[vec!["1"], vec!["2"], vec!["3"]],
    );
    let params = shape_params(dir.path(), "lim").with("row_limit", 2i64);
    assert_eq!(collect(&params, &world()).len(), 2);
}

#[test]
fn sidecar_index_serves_shape_queries() {
    let dir = tempfile::tempdir().unwrap();
    common::write_shapefile(
        dir.path(),
        "idx",
        1,
        (0.0, 0.0, 10.0, 10.0),
        &[
            common::point_content(1.0, 1.0),
            common::point_content(9.0, 9.0),
        ],
        &[("ID", b'N', 4, 0)],
        &[vec!["1"], vec!["2"]],
    );

    // Offsets mirror the sequential record layout after the 100-byte header.
    let content_len = common::point_content(1.0, 1.0).len() as u64;
    let mut tree = terrasource::index::QuadTree::new(Envelope::new(0.0f32, 0.0, 10.0, 10.0));
    tree.insert(terrasource::index::IndexRecord {
        offset: 100,
        size: 8 + content_len,
        envelope: Envelope::new(1.0, 1.0, 1.0, 1.0),
    });
    tree.insert(terrasource::index::IndexRecord {
        offset: 100 + 8 + content_len,
        size: 8 + content_len,
        envelope: Envelope::new(9.0, 9.0, 9.0, 9.0),
    });
    tree.trim();
    let index_path = dir.path().join("idx.index");
    let mut file = std::fs::File::create(index_path).unwrap();
    tree.write(&mut file).unwrap();

    let params = shape_params(dir.path(), "idx");
    let hits = collect(&params, &Query::new(Envelope::new(8.0, 8.0, 10.0, 10.0)));
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id(), 2);
    assert_eq!(hits[0].get("ID"), Some(&Value::Integer(2)));
}
