//! Detection overlay drawn over the displayed video

pub mod canvas;
pub mod renderer;

pub use canvas::{Canvas, Color, DisplayList, DrawOp, Rect};
pub use renderer::{badge_text, OverlayRenderer, VideoGeometry};
