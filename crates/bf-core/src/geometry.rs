//! Geometry shared by the overlay, selection and drag code.
//!
//! Frame layout is measured in frame *document* coordinates. The authority
//! draws its toolbar in *host* coordinates, which depend on where the frame
//! sits in the host page, how far the frame is scrolled and any zoom.

use kurbo::{Point, Rect, Vec2};
use serde::{Deserialize, Serialize};

/// Wire form of a rectangle: `{ x, y, width, height }`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl From<Bounds> for Rect {
    fn from(b: Bounds) -> Self {
        Rect::new(b.x, b.y, b.x + b.width, b.y + b.height)
    }
}

impl From<Rect> for Bounds {
    fn from(r: Rect) -> Self {
        let r = r.abs();
        Bounds::new(r.x0, r.y0, r.width(), r.height())
    }
}

/// Visible part of the frame document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    /// Scroll offset of the frame document.
    #[serde(default)]
    pub scroll_x: f64,
    #[serde(default)]
    pub scroll_y: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            scroll_x: 0.0,
            scroll_y: 0.0,
        }
    }

    pub fn scroll(&self) -> Vec2 {
        Vec2::new(self.scroll_x, self.scroll_y)
    }

    /// Viewport-relative point → document point.
    pub fn to_document(&self, p: Point) -> Point {
        p + self.scroll()
    }

    /// The visible region in document coordinates.
    pub fn visible_rect(&self) -> Rect {
        Rect::from_origin_size(
            Point::new(self.scroll_x, self.scroll_y),
            (self.width, self.height),
        )
    }

    pub fn contains(&self, viewport_point: Point) -> bool {
        viewport_point.x >= 0.0
            && viewport_point.y >= 0.0
            && viewport_point.x <= self.width
            && viewport_point.y <= self.height
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(1024.0, 768.0)
    }
}

/// Maps frame document coordinates to host page coordinates:
/// `host = offset + (frame - scroll) * zoom`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameTransform {
    /// Top-left of the frame element in the host page.
    pub offset_x: f64,
    pub offset_y: f64,
    /// Frame document scroll.
    pub scroll_x: f64,
    pub scroll_y: f64,
    pub zoom: f64,
}

impl Default for FrameTransform {
    fn default() -> Self {
        Self {
            offset_x: 0.0,
            offset_y: 0.0,
            scroll_x: 0.0,
            scroll_y: 0.0,
            zoom: 1.0,
        }
    }
}

impl FrameTransform {
    pub fn to_host_point(&self, p: Point) -> Point {
        Point::new(
            self.offset_x + (p.x - self.scroll_x) * self.zoom,
            self.offset_y + (p.y - self.scroll_y) * self.zoom,
        )
    }

    pub fn to_host(&self, r: Rect) -> Rect {
        let p0 = self.to_host_point(Point::new(r.x0, r.y0));
        let p1 = self.to_host_point(Point::new(r.x1, r.y1));
        Rect::from_points(p0, p1)
    }
}
