use ab_glyph::{FontArc, PxScale};
use headcount_common::VideoFrame;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::{debug, info};

use crate::config::AnnotationConfig;
use crate::error::{CounterError, Result};
use crate::processing::tracker::{BoundingBox, CentroidTracker};

const COUNT_ORIGIN: (i32, i32) = (30, 30);
const LINE_SPACING: i32 = 10;

/// DejaVu Sans, used unless `annotation.font_path` overrides it.
static BUILTIN_FONT: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

/// Draws tracker output onto RGB24 frames.
pub struct FrameAnnotator {
    config: AnnotationConfig,
    font: FontArc,
}

impl FrameAnnotator {
    pub fn new(config: AnnotationConfig) -> Result<Self> {
        let font = match &config.font_path {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .map_err(|e| CounterError::ConfigError(format!("font {}: {}", path.display(), e)))?;
                let font = FontArc::try_from_vec(bytes)
                    .map_err(|e| CounterError::ConfigError(format!("font {}: {}", path.display(), e)))?;
                info!("Loaded annotation font {}", path.display());
                font
            }
            None => {
                debug!("Using built-in annotation font");
                FontArc::try_from_slice(BUILTIN_FONT)
                    .map_err(|e| CounterError::ConfigError(format!("built-in font: {}", e)))?
            }
        };
        Ok(Self { config, font })
    }

    /// Overlays the latest assignments of `tracker` and the running `unique_count`.
    /// Frame dimensions and depth are left unchanged.
    pub fn annotate(&self, frame: &mut VideoFrame, tracker: &CentroidTracker, unique_count: u64) -> Result<()> {
        if !frame.is_consistent() {
            return Err(CounterError::InvalidFrame(format!(
                "frame {} carries {} bytes, expected {} for {}x{}",
                frame.sequence_num,
                frame.data.len(),
                frame.expected_len(),
                frame.width,
                frame.height
            )));
        }

        let data = std::mem::take(&mut frame.data);
        let mut canvas = RgbImage::from_raw(frame.width, frame.height, data)
            .ok_or_else(|| CounterError::InvalidFrame(format!("frame {} buffer rejected", frame.sequence_num)))?;

        if self.config.draw_trails {
            for track in tracker.tracks() {
                self.draw_trail(&mut canvas, track.history.iter().map(|c| (c.cx, c.cy)));
            }
        }

        let box_color = Rgb(self.config.box_color);
        for assignment in tracker.assignments() {
            self.draw_box(&mut canvas, &assignment.bbox, box_color);
            let label = format!("ID {}", assignment.track_id);
            let scale = PxScale::from(self.config.label_font_size);
            let x = assignment.bbox.x.round() as i32;
            let y = (assignment.bbox.y - self.config.label_font_size - 2.0).max(0.0).round() as i32;
            draw_text_mut(&mut canvas, box_color, x, y, scale, &self.font, &label);
        }

        let (x, y) = COUNT_ORIGIN;
        let count_text = format!("{}: {}", self.config.count_label, unique_count);
        draw_text_mut(
            &mut canvas,
            Rgb(self.config.count_color),
            x,
            y,
            PxScale::from(self.config.count_font_size),
            &self.font,
            &count_text,
        );

        if self.config.show_frame_number {
            let frame_y = y + self.config.count_font_size.round() as i32 + LINE_SPACING;
            draw_text_mut(
                &mut canvas,
                Rgb(self.config.frame_text_color),
                x,
                frame_y,
                PxScale::from(self.config.label_font_size),
                &self.font,
                &format!("Frame: {}", frame.sequence_num),
            );
        }

        frame.data = canvas.into_raw();
        Ok(())
    }

    /// Hollow rectangle clipped to the canvas, `box_thickness` pixels wide, drawn inwards.
    fn draw_box(&self, canvas: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
        let (canvas_w, canvas_h) = (canvas.width() as f32, canvas.height() as f32);
        let x0 = bbox.x.max(0.0).min(canvas_w);
        let y0 = bbox.y.max(0.0).min(canvas_h);
        let x1 = (bbox.x + bbox.width).max(0.0).min(canvas_w);
        let y1 = (bbox.y + bbox.height).max(0.0).min(canvas_h);

        for inset in 0..self.config.box_thickness {
            let inset = inset as f32;
            let width = (x1 - x0 - 2.0 * inset).round();
            let height = (y1 - y0 - 2.0 * inset).round();
            if width < 1.0 || height < 1.0 {
                break;
            }
            let rect = Rect::at((x0 + inset).round() as i32, (y0 + inset).round() as i32)
                .of_size(width as u32, height as u32);
            draw_hollow_rect_mut(canvas, rect, color);
        }
    }

    fn draw_trail(&self, canvas: &mut RgbImage, points: impl Iterator<Item = (f32, f32)>) {
        let color = Rgb(self.config.box_color);
        let mut previous: Option<(f32, f32)> = None;
        for point in points {
            if let Some(prev) = previous {
                draw_line_segment_mut(canvas, prev, point, color);
            }
            previous = Some(point);
        }
        if let Some((cx, cy)) = previous {
            draw_filled_circle_mut(canvas, (cx.round() as i32, cy.round() as i32), 3, color);
        }
    }
}
