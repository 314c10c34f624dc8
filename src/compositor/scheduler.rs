//! Repaint scheduler
//!
//! A frame goes through `ResetPass`, `BackgroundPaint`, `PerWindowPaint`,
//! `Flush`, `VsyncWait` and `Finalize` before returning to `Idle`. Requests
//! are flushed before waiting for the vertical blank so their transmission
//! overlaps the wait.

use tracing::{debug, trace, warn};

use super::renderer::OPAQUE;
use super::{Compositor, plugin_context};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    ResetPass,
    BackgroundPaint,
    PerWindowPaint,
    Flush,
    VsyncWait,
    Finalize,
}

impl Compositor {
    /// One tick of the repaint timer, returns whether a frame was painted
    ///
    /// Pre-paint hooks run before the damaged region is consulted, they may
    /// still add to it.
    pub fn repaint(&mut self) -> bool {
        self.plugins.pre_paint(&mut plugin_context!(self));

        let paint = self.damaged.is_damaged() || self.force_repaint || self.background_reset;
        if paint {
            self.paint_all();
        }

        self.damaged.reset();
        self.plugins.post_paint(&mut plugin_context!(self));
        self.force_repaint = false;

        paint
    }

    fn enter(&mut self, phase: FramePhase) {
        trace!("Frame phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Paint one frame
    pub fn paint_all(&mut self) {
        self.enter(FramePhase::ResetPass);
        if self.background_reset {
            // No clip: the whole screen is repainted
            self.damaged.reset();
        }

        self.enter(FramePhase::BackgroundPaint);
        self.backend.paint_background(self.damaged.id());

        self.enter(FramePhase::PerWindowPaint);
        let (width, height) = (self.screen.width, self.screen.height);
        let force = self.force_repaint;
        let server = &self.server;
        let plugins = &self.plugins;
        let backend = &mut self.backend;

        self.registry.for_each_mut(|window| {
            if force && window.is_visible(width, height) {
                window.damaged = true;
                window.damaged_ratio = 1.0;
            }

            if window.damaged {
                // Shaped windows are painted through their clip region
                window.is_rectangular(server.as_ref());
                let opacity = plugins.window_opacity(window).unwrap_or(OPAQUE);
                trace!(
                    "Painting window {:#x}, damaged_ratio={:.2}, opacity={:#06x}",
                    window.id, window.damaged_ratio, opacity
                );
                backend.paint_window(window, opacity);
            }

            // Painted, or damaged but no longer visible
            if window.damaged_ratio != 0.0 {
                window.damaged_ratio = 0.0;
                window.damage_notify_counter = 0;

                // Delta reporting stays silent for areas reported and not subtracted
                if let Some(damage) = window.damage() {
                    if let Err(e) = server.subtract_damage(damage) {
                        warn!("Cannot subtract damage of window {:#x}: {}", window.id, e);
                    }
                }
            }
        });

        self.enter(FramePhase::Flush);
        if let Err(e) = self.server.flush() {
            warn!("Flush before vsync failed: {}", e);
        }

        self.enter(FramePhase::VsyncWait);
        self.frame_clock.wait_for_next_frame();

        self.enter(FramePhase::Finalize);
        self.backend.paint_all(self.damaged.id());
        self.background_reset = false;
        if let Err(e) = self.server.sync() {
            warn!("Sync after frame failed: {}", e);
        }

        self.enter(FramePhase::Idle);
        if let Some(fps) = self.fps.tick() {
            debug!("{:.1} frames per second", fps);
        }
    }
}
