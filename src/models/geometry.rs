use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

impl Display for Point {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1}, {:.1})", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn area(&self) -> f64 {
        self.width * self.height
    }
}

/// Four card corners, always ordered top-left, top-right, bottom-left,
/// bottom-right. Build one through `detect::geometry::order_corners` or
/// [`Quad::from_rect`] to keep that order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quad {
    pub top_left: Point,
    pub top_right: Point,
    pub bottom_left: Point,
    pub bottom_right: Point,
}

impl Quad {
    pub fn from_rect(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            top_left: Point::new(x, y),
            top_right: Point::new(x + width, y),
            bottom_left: Point::new(x, y + height),
            bottom_right: Point::new(x + width, y + height),
        }
    }

    pub fn points(&self) -> [Point; 4] {
        [
            self.top_left,
            self.top_right,
            self.bottom_left,
            self.bottom_right,
        ]
    }

    /// Shoelace area, walking the outline TL -> TR -> BR -> BL.
    pub fn area(&self) -> f64 {
        let outline = [
            self.top_left,
            self.top_right,
            self.bottom_right,
            self.bottom_left,
        ];
        let twice: f64 = (0..4)
            .map(|i| {
                let a = outline[i];
                let b = outline[(i + 1) % 4];
                a.x * b.y - b.x * a.y
            })
            .sum();
        twice.abs() / 2.0
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let points = self.points();
        let min_x = points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
        let max_x = points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
        let min_y = points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
        let max_y = points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
        BoundingBox {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        }
    }

    pub fn scaled(&self, sx: f64, sy: f64) -> Self {
        let scale = |p: Point| Point::new(p.x * sx, p.y * sy);
        Self {
            top_left: scale(self.top_left),
            top_right: scale(self.top_right),
            bottom_left: scale(self.bottom_left),
            bottom_right: scale(self.bottom_right),
        }
    }

    /// True when the corners form an upright rectangle (within `tolerance` px).
    pub fn is_axis_aligned(&self, tolerance: f64) -> bool {
        (self.top_left.y - self.top_right.y).abs() <= tolerance
            && (self.bottom_left.y - self.bottom_right.y).abs() <= tolerance
            && (self.top_left.x - self.bottom_left.x).abs() <= tolerance
            && (self.top_right.x - self.bottom_right.x).abs() <= tolerance
    }
}
