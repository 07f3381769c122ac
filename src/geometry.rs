use geo::algorithm::orient::{Direction, Orient};
use geo::BoundingRect;
use geo::{LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};

use crate::envelope::Envelope;

/// The geometry sum type produced by every backend. Multi variants own their
/// parts; `Collection` may hold any variant except another `Collection`
/// (enforced by the parsers that honour that restriction, not by the type).
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Empty,
    Point(Point<f64>),
    LineString(LineString<f64>),
    Polygon(Polygon<f64>),
    MultiPoint(MultiPoint<f64>),
    MultiLineString(MultiLineString<f64>),
    MultiPolygon(MultiPolygon<f64>),
    Collection(Vec<Geometry>),
}

/// Geometry class reported by a datasource descriptor. Multi variants report
/// the class of their parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryKind {
    Point,
    LineString,
    Polygon,
    Collection,
}

impl Geometry {
    pub fn is_empty(&self) -> bool {
        matches!(self, Geometry::Empty)
    }

    pub fn kind(&self) -> Option<GeometryKind> {
        match self {
            Geometry::Empty => None,
            Geometry::Point(_) | Geometry::MultiPoint(_) => Some(GeometryKind::Point),
            Geometry::LineString(_) | Geometry::MultiLineString(_) => Some(GeometryKind::LineString),
            Geometry::Polygon(_) | Geometry::MultiPolygon(_) => Some(GeometryKind::Polygon),
            Geometry::Collection(_) => Some(GeometryKind::Collection),
        }
    }

    /// Recursive envelope. `Empty` yields the invalid sentinel, and empty
    /// members nested inside a collection do not poison the union.
    pub fn envelope(&self) -> Envelope<f64> {
        match self {
            Geometry::Empty => Envelope::invalid(),
            Geometry::Point(p) => Envelope::from_point(p.x(), p.y()),
            Geometry::LineString(l) => rect_envelope(l.bounding_rect()),
            Geometry::Polygon(p) => rect_envelope(p.bounding_rect()),
            Geometry::MultiPoint(m) => rect_envelope(m.bounding_rect()),
            Geometry::MultiLineString(m) => rect_envelope(m.bounding_rect()),
            Geometry::MultiPolygon(m) => rect_envelope(m.bounding_rect()),
            Geometry::Collection(members) => {
                let mut env = Envelope::invalid();
                for member in members {
                    env.expand_to_include(&member.envelope());
                }
                env
            }
        }
    }

    /// Re-orients polygon rings so exteriors wind counter-clockwise and
    /// holes clockwise. Applied to WKT-sourced polygons and to shapefile
    /// rings after exterior/hole grouping.
    pub fn correct(&mut self) {
        match self {
            Geometry::Polygon(p) => *p = p.orient(Direction::Default),
            Geometry::MultiPolygon(m) => *m = m.orient(Direction::Default),
            Geometry::Collection(members) => {
                for member in members {
                    member.correct();
                }
            }
            _ => {}
        }
    }
}

fn rect_envelope(rect: Option<geo::Rect<f64>>) -> Envelope<f64> {
    rect.map(Envelope::from_rect).unwrap_or_else(Envelope::invalid)
}

/// Adapts the geo-types sum (as produced by the WKT parser) into ours.
/// Lines, rects, and triangles flatten into their general counterparts.
impl From<geo::Geometry<f64>> for Geometry {
    fn from(geom: geo::Geometry<f64>) -> Self {
        match geom {
            geo::Geometry::Point(p) => Geometry::Point(p),
            geo::Geometry::Line(l) => Geometry::LineString(LineString::from(vec![l.start, l.end])),
            geo::Geometry::LineString(l) => Geometry::LineString(l),
            geo::Geometry::Polygon(p) => Geometry::Polygon(p),
            geo::Geometry::MultiPoint(m) => Geometry::MultiPoint(m),
            geo::Geometry::MultiLineString(m) => Geometry::MultiLineString(m),
            geo::Geometry::MultiPolygon(m) => Geometry::MultiPolygon(m),
            geo::Geometry::Rect(r) => Geometry::Polygon(r.to_polygon()),
            geo::Geometry::Triangle(t) => Geometry::Polygon(t.to_polygon()),
            geo::Geometry::GeometryCollection(gc) => {
                Geometry::Collection(gc.0.into_iter().map(Geometry::from).collect())
            }
        }
    }
}
