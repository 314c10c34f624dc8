//! `_NET_WM_WINDOW_OPACITY` support

use std::collections::HashMap;

use tracing::{debug, warn};
use x11rb::protocol::Event;
use x11rb::protocol::xproto::AtomEnum;

use crate::compositor::window::Window;
use crate::server::{Pending, WindowId};

use super::{EventKinds, Plugin, PluginContext};

/// Convert the 32-bit property value to the 16-bit alpha used for painting
fn to_alpha(value: u32) -> u16 {
    (value >> 16) as u16
}

#[derive(Debug, Default)]
pub struct OpacityPlugin {
    opacities: HashMap<WindowId, u16>,
}

impl OpacityPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn request(ctx: &PluginContext<'_>, window: WindowId) -> Pending<Option<u32>> {
        ctx.server.get_property32(
            window,
            ctx.atoms.net_wm_window_opacity,
            AtomEnum::CARDINAL.into(),
        )
    }

    /// Store the fetched value, returns whether it changed
    fn store(
        &mut self,
        window: WindowId,
        pending: Pending<Option<u32>>,
        ctx: &PluginContext<'_>,
    ) -> bool {
        if !pending.is_sent() {
            return false;
        }

        let opacity = match pending.finish(ctx.server.as_ref()) {
            Ok(value) => value.map(to_alpha),
            Err(e) => {
                debug!("Opacity of window {:#x} unavailable: {}", window, e);
                None
            }
        };

        let previous = match opacity {
            Some(opacity) => self.opacities.insert(window, opacity),
            None => self.opacities.remove(&window),
        };
        previous != opacity
    }

    fn refresh(&mut self, window: WindowId, ctx: &mut PluginContext<'_>) {
        let pending = Self::request(ctx, window);
        if !self.store(window, pending, ctx) {
            return;
        }

        debug!("Window {:#x} opacity now {:?}", window, self.opacities.get(&window));
        // Hidden windows are repainted with their new opacity once shown
        let (width, height) = (ctx.screen.width, ctx.screen.height);
        let region = ctx
            .registry
            .get(window)
            .filter(|window| window.is_visible(width, height))
            .and_then(Window::region);
        if let Err(e) = ctx.damaged.add_copy(region) {
            warn!("Failed to damage window {:#x}: {}", window, e);
        }
    }
}

impl Plugin for OpacityPlugin {
    fn name(&self) -> &'static str {
        "opacity"
    }

    fn events(&self) -> EventKinds {
        EventKinds::PROPERTY | EventKinds::MAP | EventKinds::DESTROY
    }

    fn handle_event(
        &mut self,
        event: &Event,
        window: Option<&Window>,
        ctx: &mut PluginContext<'_>,
    ) {
        match event {
            Event::PropertyNotify(e) if e.atom == ctx.atoms.net_wm_window_opacity => {
                if window.is_some() {
                    self.refresh(e.window, ctx);
                }
            }
            Event::MapNotify(e) if window.is_some() => self.refresh(e.window, ctx),
            Event::DestroyNotify(e) => {
                self.opacities.remove(&e.window);
            }
            _ => {}
        }
    }

    fn manage_existing(&mut self, windows: &[WindowId], ctx: &mut PluginContext<'_>) {
        let pending: Vec<_> = windows
            .iter()
            .map(|&window| (window, Self::request(ctx, window)))
            .collect();

        for (window, request) in pending {
            self.store(window, request, ctx);
        }
    }

    fn window_opacity(&self, window: &Window) -> Option<u16> {
        self.opacities.get(&window.id).copied()
    }
}
