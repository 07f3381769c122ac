use std::fmt;
use std::str::FromStr;

use geo::{CoordFloat, Rect};

use crate::error::Error;

/// Axis-aligned bounding box over `f32` (index storage) or `f64` (query
/// space). An envelope whose minimum exceeds its maximum on either axis is
/// the *invalid* sentinel; expanding an invalid envelope by a valid one
/// yields the valid one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope<T: CoordFloat> {
    pub min_x: T,
    pub min_y: T,
    pub max_x: T,
    pub max_y: T,
}

impl<T: CoordFloat> Envelope<T> {
    /// Normalizing constructor: swaps coordinates so min <= max per axis.
    pub fn new(x0: T, y0: T, x1: T, y1: T) -> Self {
        Envelope {
            min_x: x0.min(x1),
            min_y: y0.min(y1),
            max_x: x0.max(x1),
            max_y: y0.max(y1),
        }
    }

    /// The invalid sentinel.
    pub fn invalid() -> Self {
        Envelope {
            min_x: T::max_value(),
            min_y: T::max_value(),
            max_x: -T::max_value(),
            max_y: -T::max_value(),
        }
    }

    pub fn from_point(x: T, y: T) -> Self {
        Envelope {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    pub fn valid(&self) -> bool {
        self.min_x <= self.max_x && self.min_y <= self.max_y
    }

    pub fn width(&self) -> T {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> T {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (T, T) {
        let two = T::one() + T::one();
        (
            (self.min_x + self.max_x) / two,
            (self.min_y + self.max_y) / two,
        )
    }

    pub fn expand_to_include(&mut self, other: &Envelope<T>) {
        if !other.valid() {
            return;
        }
        if !self.valid() {
            *self = *other;
            return;
        }
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    pub fn expand_to_include_point(&mut self, x: T, y: T) {
        self.expand_to_include(&Envelope::from_point(x, y));
    }

    /// Closed-edge intersection test: envelopes sharing only an edge or a
    /// corner still intersect, so features on tile seams are never lost.
    pub fn intersects(&self, other: &Envelope<T>) -> bool {
        self.valid()
            && other.valid()
            && self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// True when `other` lies entirely inside this envelope, edges included.
    pub fn contains(&self, other: &Envelope<T>) -> bool {
        self.valid()
            && other.valid()
            && other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    pub fn contains_point(&self, x: T, y: T) -> bool {
        self.valid() && x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

impl Envelope<f64> {
    pub fn to_f32(&self) -> Envelope<f32> {
        Envelope {
            min_x: self.min_x as f32,
            min_y: self.min_y as f32,
            max_x: self.max_x as f32,
            max_y: self.max_y as f32,
        }
    }

    pub fn from_rect(rect: Rect<f64>) -> Self {
        Envelope::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }
}

impl Envelope<f32> {
    pub fn to_f64(&self) -> Envelope<f64> {
        Envelope {
            min_x: self.min_x as f64,
            min_y: self.min_y as f64,
            max_x: self.max_x as f64,
            max_y: self.max_y as f64,
        }
    }
}

impl<T: CoordFloat> fmt::Display for Envelope<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},{})",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}

/// Parses the `"minx,miny,maxx,maxy"` form used by the `extent` datasource
/// parameter and the index builder's `--bbox` option.
impl<T: CoordFloat + FromStr> FromStr for Envelope<T> {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut coords = s.split(',').map(|part| {
            part.trim().parse::<T>().map_err(|_| Error::InvalidParam {
                key: "extent".into(),
                reason: format!("cannot parse '{}' as a number", part.trim()),
            })
        });
        let mut next = || {
            coords.next().unwrap_or(Err(Error::InvalidParam {
                key: "extent".into(),
                reason: "expected four comma separated numbers".into(),
            }))
        };
        let env = Envelope::new(next()?, next()?, next()?, next()?);
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_expands_to_other() {
        let mut env = Envelope::<f64>::invalid();
        assert!(!env.valid());
        env.expand_to_include(&Envelope::new(0.0, 0.0, 1.0, 2.0));
        assert_eq!(env, Envelope::new(0.0, 0.0, 1.0, 2.0));
    }

    #[test]
    fn expand_ignores_invalid() {
        let mut env = Envelope::new(0.0, 0.0, 1.0, 1.0);
        env.expand_to_include(&Envelope::<f64>::invalid());
        assert_eq!(env, Envelope::new(0.0, 0.0, 1.0, 1.0));
    }

    #[test]
    fn shared_edge_intersects() {
        let a = Envelope::new(0.0, 0.0, 1.0, 1.0);
        let b = Envelope::new(1.0, 0.0, 2.0, 1.0);
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
    }

    #[test]
    fn zero_area_envelope_behaves_as_closed_rect() {
        let point = Envelope::from_point(0.5, 0.5);
        assert!(point.valid());
        assert!(Envelope::new(0.0, 0.0, 1.0, 1.0).contains(&point));
        assert!(point.intersects(&Envelope::new(0.5, 0.5, 2.0, 2.0)));
    }

    #[test]
    fn parse_extent_string() {
        let env: Envelope<f64> = "-10.5, -2, 4, 8".parse().unwrap();
        assert_eq!(env, Envelope::new(-10.5, -2.0, 4.0, 8.0));
        assert!("1,2,3".parse::<Envelope<f64>>().is_err());
        assert!("a,b,c,d".parse::<Envelope<f64>>().is_err());
    }
}
