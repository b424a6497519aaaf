//! Geometric plausibility gates applied to raw detections.
//!
//! The cascade is tuned for recall, so it surfaces boxes that are clearly
//! not faces: wide strips of texture, specks, detections hugging the
//! frame edge where half the face is missing. Three cheap checks remove
//! most of them before an alert is built.

use tracing::debug;

use super::detector::Detection;

#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Acceptable width/height ratio band. Faces are roughly square.
    pub min_aspect: f64,
    pub max_aspect: f64,
    /// Acceptable box area as a fraction of the frame area.
    pub min_area_fraction: f64,
    pub max_area_fraction: f64,
    /// Boxes closer than this many pixels to any frame edge are rejected.
    pub edge_margin: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_aspect: 0.5,
            max_aspect: 1.5,
            min_area_fraction: 0.0005,
            max_area_fraction: 0.25,
            edge_margin: 4,
        }
    }
}

impl FilterConfig {
    /// Whether one detection passes all three gates.
    pub fn validate(&self, d: &Detection, frame_w: u32, frame_h: u32) -> bool {
        if d.width == 0 || d.height == 0 || frame_w == 0 || frame_h == 0 {
            return false;
        }

        let aspect = f64::from(d.width) / f64::from(d.height);
        if !(self.min_aspect..=self.max_aspect).contains(&aspect) {
            debug!(aspect, "detection rejected: implausible aspect ratio");
            return false;
        }

        let area = f64::from(d.width) * f64::from(d.height);
        let frame_area = f64::from(frame_w) * f64::from(frame_h);
        let fraction = area / frame_area;
        if !(self.min_area_fraction..=self.max_area_fraction).contains(&fraction) {
            debug!(fraction, "detection rejected: implausible size");
            return false;
        }

        let margin = self.edge_margin as i32;
        let right = d.x + d.width as i32;
        let bottom = d.y + d.height as i32;
        if d.x < margin
            || d.y < margin
            || right > frame_w as i32 - margin
            || bottom > frame_h as i32 - margin
        {
            debug!(x = d.x, y = d.y, "detection rejected: touches frame edge");
            return false;
        }

        true
    }

    pub fn filter(&self, detections: Vec<Detection>, frame_w: u32, frame_h: u32) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| self.validate(d, frame_w, frame_h))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: i32, y: i32, w: u32, h: u32) -> Detection {
        Detection {
            x,
            y,
            width: w,
            height: h,
            score: 5.0,
        }
    }

    #[test]
    fn accepts_plausible_centered_face() {
        let cfg = FilterConfig::default();
        assert!(cfg.validate(&det(300, 200, 80, 90), 1280, 720));
    }

    #[test]
    fn rejects_wide_aspect_ratio() {
        let cfg = FilterConfig::default();
        // 2.0 aspect, well outside the 0.5..=1.5 band.
        assert!(!cfg.validate(&det(300, 200, 160, 80), 1280, 720));
    }

    #[test]
    fn rejects_boxes_touching_the_edge() {
        let cfg = FilterConfig::default();
        assert!(!cfg.validate(&det(0, 200, 80, 90), 1280, 720));
        assert!(!cfg.validate(&det(1210, 200, 80, 90), 1280, 720));
        assert!(!cfg.validate(&det(300, 640, 80, 90), 1280, 720));
    }

    #[test]
    fn rejects_specks_and_giant_boxes() {
        let cfg = FilterConfig::default();
        assert!(!cfg.validate(&det(300, 200, 8, 8), 1280, 720));
        assert!(!cfg.validate(&det(100, 100, 900, 600), 1280, 720));
    }

    #[test]
    fn filter_keeps_only_valid_detections() {
        let cfg = FilterConfig::default();
        let kept = cfg.filter(
            vec![det(300, 200, 80, 90), det(0, 0, 80, 90), det(300, 200, 160, 80)],
            1280,
            720,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].x, 300);
    }
}
