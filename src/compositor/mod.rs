//! Compositor core
//!
//! One [`Compositor`] owns the window registry, the damaged region and the
//! plugins for the whole process lifetime. Events update the first two, the
//! repaint tick consumes them (see `scheduler`).

pub mod damage;
mod events;
pub mod fps;
mod manage;
pub mod registry;
pub mod renderer;
mod scheduler;
pub mod window;

use std::collections::HashSet;
use std::rc::Rc;

use tracing::{debug, info};

use crate::atoms::Atoms;
use crate::display::{Extensions, Screen};
use crate::plugin::{ControlError, Plugins};
use crate::server::{WindowId, XServer};
use crate::vsync::FrameClock;

use damage::DamagedRegion;
use fps::FpsCounter;
use registry::Registry;
use renderer::RenderBackend;

pub use scheduler::FramePhase;

/// Borrow the plugin-visible parts of a compositor as a `PluginContext`
///
/// A macro rather than a method so the other fields stay borrowable.
macro_rules! plugin_context {
    ($compositor:expr) => {
        crate::plugin::PluginContext {
            server: &$compositor.server,
            screen: &$compositor.screen,
            atoms: &$compositor.atoms,
            registry: &$compositor.registry,
            damaged: &mut $compositor.damaged,
        }
    };
}
pub(crate) use plugin_context;

pub struct Compositor {
    server: Rc<dyn XServer>,
    screen: Screen,
    atoms: Atoms,
    extensions: Extensions,

    /// Our own windows, never managed
    ignored: HashSet<WindowId>,

    registry: Registry,
    damaged: DamagedRegion,
    plugins: Plugins,
    backend: Box<dyn RenderBackend>,
    frame_clock: Box<dyn FrameClock>,

    /// Repaint every visible window on the next frame
    force_repaint: bool,
    /// Root background changed, repaint the whole screen
    background_reset: bool,
    /// RandR reported a screen change not handled by the caller yet
    screen_changed: bool,

    phase: FramePhase,
    fps: FpsCounter,
}

impl Compositor {
    pub fn new(
        server: Rc<dyn XServer>,
        screen: Screen,
        atoms: Atoms,
        extensions: Extensions,
        plugins: Plugins,
        backend: Box<dyn RenderBackend>,
        frame_clock: Box<dyn FrameClock>,
    ) -> Self {
        Self {
            registry: Registry::new(server.clone()),
            damaged: DamagedRegion::new(server.clone()),
            server,
            screen,
            atoms,
            extensions,
            ignored: HashSet::new(),
            plugins,
            backend,
            frame_clock,
            // The first frame paints everything
            force_repaint: true,
            background_reset: true,
            screen_changed: false,
            phase: FramePhase::Idle,
            fps: FpsCounter::default(),
        }
    }

    /// Never manage `window` (compositing manager window, overlay)
    pub fn ignore(&mut self, window: WindowId) {
        self.ignored.insert(window);
    }

    /// Whether a screen change was reported since the last call
    pub fn take_screen_changed(&mut self) -> bool {
        std::mem::take(&mut self.screen_changed)
    }

    /// Control message for a plugin
    pub fn control(
        &mut self,
        plugin: &str,
        member: &str,
        args: &[String],
    ) -> Result<String, ControlError> {
        debug!("Control message {}.{}({:?})", plugin, member, args);
        let result = self
            .plugins
            .control(plugin, member, args, &mut plugin_context!(self));

        // Effects appear or disappear everywhere at once
        if result.is_ok() && matches!(member, "Activate" | "Deactivate") {
            self.force_repaint = true;
        }
        result
    }

    /// Stop managing every window, releasing their server resources
    pub fn shutdown(&mut self) {
        if !self.registry.is_empty() {
            info!("Releasing {} windows", self.registry.len());
        }
        let windows = self.registry.clear();
        for window in &windows {
            self.backend.free_window(window.id);
        }
        drop(windows);
        self.damaged.reset();

        if let Err(e) = self.server.flush() {
            debug!("Flush on shutdown failed: {}", e);
        }
        info!("Compositor shut down");
    }
}
