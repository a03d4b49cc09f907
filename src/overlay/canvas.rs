//! Drawing surface abstraction

use serde::Serialize;

/// Axis-aligned rectangle in surface pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const RED: Color = Color { r: 255, g: 0, b: 0 };
    pub const WHITE: Color = Color {
        r: 255,
        g: 255,
        b: 255,
    };
}

/// The small subset of a 2D canvas the overlay needs
pub trait Canvas: Send {
    fn size(&self) -> (u32, u32);

    /// Resize the surface; contents are discarded
    fn resize(&mut self, width: u32, height: u32);

    fn clear(&mut self);

    fn stroke_rect(&mut self, rect: Rect, color: Color, line_width: f32);

    fn fill_rect(&mut self, rect: Rect, color: Color);

    /// `y` is the text baseline
    fn fill_text(&mut self, text: &str, x: f32, y: f32, font_px: f32, color: Color);

    /// Advance width of `text` in pixels
    fn measure_text(&self, text: &str, font_px: f32) -> f32;
}

/// One recorded drawing command
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DrawOp {
    StrokeRect {
        rect: Rect,
        color: Color,
        line_width: f32,
    },
    FillRect {
        rect: Rect,
        color: Color,
    },
    FillText {
        text: String,
        x: f32,
        y: f32,
        font_px: f32,
        color: Color,
    },
}

/// Canvas that records what was drawn since the last clear
///
/// Serializes to JSON so a UI can replay it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DisplayList {
    width: u32,
    height: u32,
    ops: Vec<DrawOp>,
}

/// Average glyph advance for a sans-serif face, as a fraction of font size
const GLYPH_ADVANCE: f32 = 0.55;

impl DisplayList {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ops: Vec::new(),
        }
    }

    pub fn ops(&self) -> &[DrawOp] {
        &self.ops
    }

    /// Every stroked rectangle, in draw order
    pub fn boxes(&self) -> Vec<Rect> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DrawOp::StrokeRect { rect, .. } => Some(*rect),
                _ => None,
            })
            .collect()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DrawOp::FillText { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Canvas for DisplayList {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.ops.clear();
    }

    fn clear(&mut self) {
        self.ops.clear();
    }

    fn stroke_rect(&mut self, rect: Rect, color: Color, line_width: f32) {
        self.ops.push(DrawOp::StrokeRect {
            rect,
            color,
            line_width,
        });
    }

    fn fill_rect(&mut self, rect: Rect, color: Color) {
        self.ops.push(DrawOp::FillRect { rect, color });
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, font_px: f32, color: Color) {
        self.ops.push(DrawOp::FillText {
            text: text.to_string(),
            x,
            y,
            font_px,
            color,
        });
    }

    fn measure_text(&self, text: &str, font_px: f32) -> f32 {
        text.chars().count() as f32 * font_px * GLYPH_ADVANCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_and_resize_drop_ops() {
        let mut canvas = DisplayList::new(100, 50);
        let rect = Rect {
            x: 1.0,
            y: 2.0,
            width: 3.0,
            height: 4.0,
        };
        canvas.stroke_rect(rect, Color::RED, 2.0);
        canvas.fill_text("a: 0.50", 0.0, 12.0, 14.0, Color::WHITE);
        assert_eq!(canvas.boxes(), [rect]);
        assert_eq!(canvas.labels(), ["a: 0.50"]);

        canvas.clear();
        assert!(canvas.ops().is_empty());

        canvas.fill_rect(rect, Color::RED);
        canvas.resize(200, 100);
        assert!(canvas.ops().is_empty());
        assert_eq!(canvas.size(), (200, 100));
    }

    #[test]
    fn test_ops_serialize_tagged() {
        let mut canvas = DisplayList::new(10, 10);
        canvas.fill_rect(
            Rect {
                x: 0.0,
                y: 0.0,
                width: 1.0,
                height: 1.0,
            },
            Color::RED,
        );
        let json = serde_json::to_value(&canvas).unwrap();
        assert_eq!(json["ops"][0]["op"], "fill_rect");
        assert_eq!(json["ops"][0]["color"]["r"], 255);
    }
}
