//! SDL2 Window Display Module
//! Shows the detector input with the hand skeleton drawn on top.
//! Uses the sdl2 crate for window management and rendering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use sdl2::event::{Event, WindowEvent};
use sdl2::keyboard::Scancode;
use sdl2::pixels::PixelFormatEnum;
use sdl2::rect::{Point, Rect};
use sdl2::render::{BlendMode, Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tracing::{debug, error, info, warn};

use super::snapshot::save_snapshot;
use crate::overlay::{Color, OverlayCanvas, OverlayRenderer, ScreenPoint, ViewportTransform};
use crate::pipeline::{Pipeline, PipelineEvent, PreprocessedImage};

const TITLE: &str = "Handlens";

/// Idle wait between polls when nothing changed
const IDLE_WAIT: Duration = Duration::from_millis(4);

/// Overlay canvas backed by the SDL renderer. The window is cleared before
/// the preview is blitted, so `clear` leaves the picture alone.
struct SdlOverlay<'a> {
    canvas: &'a mut Canvas<Window>,
    error: Option<String>,
}

impl<'a> SdlOverlay<'a> {
    fn new(canvas: &'a mut Canvas<Window>) -> Self {
        Self {
            canvas,
            error: None,
        }
    }

    fn record(&mut self, result: std::result::Result<(), String>) {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
    }

    fn finish(self) -> Result<()> {
        match self.error {
            Some(e) => Err(eyre!(e)),
            None => Ok(()),
        }
    }
}

fn sdl_color(color: Color) -> sdl2::pixels::Color {
    sdl2::pixels::Color::RGBA(color.r, color.g, color.b, color.a)
}

impl OverlayCanvas for SdlOverlay<'_> {
    fn clear(&mut self) {}

    fn draw_point(&mut self, at: ScreenPoint, radius: f32, color: Color) {
        self.canvas.set_draw_color(sdl_color(color));
        // Filled disc as one horizontal span per row
        let r = radius.max(1.0);
        let rows = r.ceil() as i32;
        for dy in -rows..=rows {
            let fy = dy as f32;
            if fy.abs() > r {
                continue;
            }
            let half = (r * r - fy * fy).sqrt();
            let y = (at.y + fy).round() as i32;
            let result = self.canvas.draw_line(
                Point::new((at.x - half).round() as i32, y),
                Point::new((at.x + half).round() as i32, y),
            );
            self.record(result);
        }
    }

    fn draw_line(&mut self, from: ScreenPoint, to: ScreenPoint, width: f32, color: Color) {
        self.canvas.set_draw_color(sdl_color(color));
        let (dx, dy) = (to.x - from.x, to.y - from.y);
        let length = (dx * dx + dy * dy).sqrt();
        if length < f32::EPSILON {
            return;
        }
        // Thick line as parallel strokes along the normal
        let (nx, ny) = (-dy / length, dx / length);
        let strokes = width.max(1.0).round() as i32;
        for k in 0..strokes {
            let offset = k as f32 - (strokes - 1) as f32 / 2.0;
            let (ox, oy) = (nx * offset, ny * offset);
            let result = self.canvas.draw_line(
                Point::new((from.x + ox).round() as i32, (from.y + oy).round() as i32),
                Point::new((to.x + ox).round() as i32, (to.y + oy).round() as i32),
            );
            self.record(result);
        }
    }
}

/// SDL2 Window Display
/// Handles window creation, the event loop and preview rendering.
/// The preview fills the window width and is centred vertically; the
/// overlay viewport follows the same layout.
pub struct Sdl2Display {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    width: u32,
    height: u32,
    /// Keeps the camera failure in the title over later notices
    camera_failed: bool,
}

impl Sdl2Display {
    pub fn new(sdl_context: &sdl2::Sdl, width: u32, height: u32) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(|e| eyre!(e))?;

        let window_builder = video_subsystem
            .window(TITLE, width, height)
            .position_centered()
            .resizable()
            .build()?;

        let canvas_builder = window_builder.into_canvas().present_vsync();

        let mut canvas = canvas_builder.build()?;
        canvas.set_blend_mode(BlendMode::Blend);
        let texture_creator = canvas.texture_creator();

        Ok(Self {
            canvas,
            texture_creator,
            width,
            height,
            camera_failed: false,
        })
    }

    /// Square preview area: full width, centred vertically.
    fn preview_rect(&self) -> Rect {
        let offset = (self.height as i32 - self.width as i32) / 2;
        Rect::new(0, offset, self.width, self.width)
    }

    fn viewport(&self) -> ViewportTransform {
        ViewportTransform::for_layout(self.width as f32, self.height as f32, 1.0)
    }

    pub fn render_frame(
        &mut self,
        preview: Option<&PreprocessedImage>,
        renderer: &OverlayRenderer,
    ) -> Result<u64> {
        self.canvas.set_draw_color(sdl2::pixels::Color::RGB(0, 0, 0));
        self.canvas.clear();

        if let Some(image) = preview {
            let mut texture = self
                .texture_creator
                .create_texture_streaming(PixelFormatEnum::RGB24, image.size, image.size)
                .map_err(|e| eyre!(e))?;

            texture
                .update(None, &image.pixels, (image.size * 3) as usize)
                .map_err(|e| eyre!(e))?;

            let target = self.preview_rect();
            self.canvas
                .copy(&texture, None, Some(target))
                .map_err(|e| eyre!(e))?;
        }

        let mut overlay = SdlOverlay::new(&mut self.canvas);
        let generation = renderer.draw(&mut overlay);
        overlay.finish()?;

        self.canvas.present();
        Ok(generation)
    }

    fn set_title(&mut self, title: &str) {
        if let Err(e) = self.canvas.window_mut().set_title(title) {
            warn!("Failed to set window title: {}", e);
        }
    }

    fn resize(&mut self, width: i32, height: i32, renderer: &OverlayRenderer) {
        self.width = width.max(1) as u32;
        self.height = height.max(1) as u32;
        renderer.set_viewport(self.viewport());
        debug!("Window resized to {}x{}", self.width, self.height);
    }

    fn take_snapshot(&self, pipeline: &Pipeline) {
        let Some(image) = pipeline.preview() else {
            info!("No frame to snapshot yet");
            return;
        };
        let dir = crate::CONFIG.load().debug.snapshot_dir.clone();
        if let Err(e) = save_snapshot(&image, &dir) {
            error!("Snapshot failed: {}", e);
        }
    }

    fn handle_pipeline_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::CaptureFailed(reason) => {
                error!("Camera unavailable: {}", reason);
                self.camera_failed = true;
                self.set_title(&format!("{TITLE} - camera unavailable: {reason}"));
            }
            PipelineEvent::DetectionFailed(reason) => {
                debug!("Detection failed: {}", reason);
                if !self.camera_failed {
                    self.set_title(&format!("{TITLE} - {reason}"));
                }
            }
        }
    }

    /// Run until the window closes, Esc is pressed or `quit` is raised.
    /// `S` writes the current detector input to the snapshot directory.
    pub fn run(
        &mut self,
        sdl_context: &sdl2::Sdl,
        pipeline: &Pipeline,
        quit: &AtomicBool,
    ) -> Result<()> {
        let mut event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;
        let renderer = pipeline.renderer().clone();
        renderer.set_viewport(self.viewport());

        let stats_interval =
            Duration::from_millis(crate::CONFIG.load().pipeline.stats_interval_ms.max(1));
        let mut last_stats = Instant::now();
        let mut drawn: Option<(u64, Option<u64>)> = None;

        'running: loop {
            for event in event_pump.poll_iter() {
                match event {
                    Event::Quit { .. }
                    | Event::KeyDown {
                        scancode: Some(Scancode::Escape),
                        ..
                    } => {
                        info!("Quit event received");
                        break 'running;
                    }
                    Event::KeyDown {
                        scancode: Some(Scancode::S),
                        repeat: false,
                        ..
                    } => self.take_snapshot(pipeline),
                    Event::Window {
                        win_event: WindowEvent::SizeChanged(w, h),
                        ..
                    } => self.resize(w, h, &renderer),
                    _ => {}
                }
            }
            if quit.load(Ordering::Relaxed) {
                info!("Interrupt received");
                break;
            }

            while let Some(event) = pipeline.try_event() {
                self.handle_pipeline_event(event);
            }

            let preview = pipeline.preview();
            let state = (
                renderer.generation(),
                preview.as_ref().map(|image| image.sequence),
            );
            if drawn != Some(state) {
                let generation = self.render_frame(preview.as_deref(), &renderer)?;
                drawn = Some((generation, state.1));
            } else {
                std::thread::sleep(IDLE_WAIT);
            }

            if last_stats.elapsed() >= stats_interval {
                let metrics = pipeline.metrics();
                info!(
                    captured = metrics.frames_captured,
                    dropped = metrics.frames_dropped,
                    processed = metrics.frames_processed,
                    corrupt = metrics.frames_corrupt,
                    rejected = metrics.submissions_rejected,
                    detections = metrics.detections,
                    errors = metrics.detection_errors,
                    state = ?pipeline.detector_state(),
                    "pipeline stats"
                );
                last_stats = Instant::now();
            }
        }

        Ok(())
    }
}
