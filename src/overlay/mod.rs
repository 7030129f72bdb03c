//! Hand skeleton overlay
//!
//! The renderer holds two single-slot handoffs: the latest [`KeypointSet`],
//! published from the detector's completion context, and the
//! [`ViewportTransform`], published on layout changes. Both are `ArcSwap`
//! cells. A store publishes a fully built `Arc` with release ordering and every
//! load acquires it, so a reader observes either the previous value or the
//! complete new one, never a mix. Readers never block writers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::trace;

use crate::detection::HAND_POINTS;

/// Bones of the 21-point hand topology.
pub const HAND_CONNECTIONS: [(usize, usize); 23] = [
    // thumb
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 4),
    // index
    (0, 5),
    (5, 6),
    (6, 7),
    (7, 8),
    // middle
    (0, 9),
    (9, 10),
    (10, 11),
    (11, 12),
    // ring
    (0, 13),
    (13, 14),
    (14, 15),
    (15, 16),
    // pinky
    (0, 17),
    (17, 18),
    (18, 19),
    (19, 20),
    // palm
    (5, 9),
    (9, 13),
    (13, 17),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub hand_index: usize,
    pub point_index: usize,
}

/// Keypoints of one detection, immutable once built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeypointSet {
    points: Vec<Keypoint>,
}

impl KeypointSet {
    pub fn new(points: Vec<Keypoint>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keypoint> {
        self.points.iter()
    }

    /// Distinct hand indices, ascending.
    pub fn hand_indices(&self) -> Vec<usize> {
        let mut hands: Vec<usize> = self.points.iter().map(|kp| kp.hand_index).collect();
        hands.sort_unstable();
        hands.dedup();
        hands
    }

    pub fn hand(&self, hand_index: usize) -> impl Iterator<Item = &Keypoint> {
        self.points
            .iter()
            .filter(move |kp| kp.hand_index == hand_index)
    }
}

impl From<Vec<Keypoint>> for KeypointSet {
    fn from(points: Vec<Keypoint>) -> Self {
        Self::new(points)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenPoint {
    pub x: f32,
    pub y: f32,
}

/// Normalized keypoint space → viewport pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportTransform {
    pub width: f32,
    pub height: f32,
    pub vertical_offset: f32,
}

impl Default for ViewportTransform {
    fn default() -> Self {
        Self {
            width: 1.0,
            height: 1.0,
            vertical_offset: 0.0,
        }
    }
}

impl ViewportTransform {
    pub fn new(width: f32, height: f32, vertical_offset: f32) -> Self {
        Self {
            width,
            height,
            vertical_offset,
        }
    }

    /// Fit an image of `image_aspect` (width / height) to the view width and
    /// centre it vertically.
    pub fn for_layout(view_width: f32, view_height: f32, image_aspect: f32) -> Self {
        let aspect = if image_aspect > 0.0 { image_aspect } else { 1.0 };
        let height = view_width / aspect;
        Self {
            width: view_width,
            height,
            vertical_offset: (view_height - height) / 2.0,
        }
    }

    pub fn map(&self, keypoint: &Keypoint) -> ScreenPoint {
        ScreenPoint {
            x: keypoint.x * self.width,
            y: keypoint.y * self.height + self.vertical_offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const GREEN: Color = Color::rgb(0, 255, 0);
    pub const BLUE: Color = Color::rgb(0, 0, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }
}

#[derive(Debug, Clone)]
pub struct OverlayStyle {
    /// Indexed by hand index, wrapping around
    pub hand_colors: Vec<Color>,
    pub point_radius: f32,
    pub line_width: f32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            hand_colors: vec![Color::GREEN, Color::BLUE],
            point_radius: 8.0,
            line_width: 6.0,
        }
    }
}

impl OverlayStyle {
    pub fn hand_color(&self, hand_index: usize) -> Color {
        match self.hand_colors.len() {
            0 => Color::GREEN,
            n => self.hand_colors[hand_index % n],
        }
    }
}

/// Drawing surface the overlay renders onto.
pub trait OverlayCanvas {
    /// Clear to transparent.
    fn clear(&mut self);

    fn draw_point(&mut self, at: ScreenPoint, radius: f32, color: Color);

    fn draw_line(&mut self, from: ScreenPoint, to: ScreenPoint, width: f32, color: Color);
}

pub struct OverlayRenderer {
    keypoints: ArcSwap<KeypointSet>,
    viewport: ArcSwap<ViewportTransform>,
    generation: AtomicU64,
    style: OverlayStyle,
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::new(OverlayStyle::default())
    }
}

impl OverlayRenderer {
    pub fn new(style: OverlayStyle) -> Self {
        Self {
            keypoints: ArcSwap::from_pointee(KeypointSet::default()),
            viewport: ArcSwap::from_pointee(ViewportTransform::default()),
            generation: AtomicU64::new(0),
            style,
        }
    }

    /// Replace the current keypoints. Safe from any thread.
    pub fn publish(&self, keypoints: KeypointSet) {
        trace!(points = keypoints.len(), "publishing keypoints");
        self.keypoints.store(Arc::new(keypoints));
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn set_viewport(&self, viewport: ViewportTransform) {
        self.viewport.store(Arc::new(viewport));
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn keypoints(&self) -> Arc<KeypointSet> {
        self.keypoints.load_full()
    }

    pub fn viewport(&self) -> ViewportTransform {
        **self.viewport.load()
    }

    /// Bumped on every publish or viewport change; lets a display skip
    /// redraws when nothing moved.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Render the current keypoints. Returns the generation that was drawn.
    pub fn draw<C: OverlayCanvas + ?Sized>(&self, canvas: &mut C) -> u64 {
        let generation = self.generation();
        let keypoints = self.keypoints.load();
        let viewport = **self.viewport.load();

        canvas.clear();
        for hand_index in keypoints.hand_indices() {
            let color = self.style.hand_color(hand_index);
            let mut by_point: [Option<ScreenPoint>; HAND_POINTS] = [None; HAND_POINTS];

            for kp in keypoints.hand(hand_index) {
                let at = viewport.map(kp);
                canvas.draw_point(at, self.style.point_radius, color);
                if let Some(slot) = by_point.get_mut(kp.point_index) {
                    *slot = Some(at);
                }
            }

            for &(from, to) in &HAND_CONNECTIONS {
                if let (Some(a), Some(b)) = (by_point[from], by_point[to]) {
                    canvas.draw_line(a, b, self.style.line_width, color);
                }
            }
        }
        generation
    }
}
