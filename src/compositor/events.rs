//! Protocol event handling
//!
//! Events are applied to the registry and the damaged region one at a time,
//! in delivery order. Plugins see every forwarded event after the core has
//! handled it, except DestroyNotify which they see while the window still
//! exists.

use tracing::{debug, info, trace, warn};
use x11rb::NONE;
use x11rb::protocol::Event;
use x11rb::protocol::damage::NotifyEvent as DamageNotifyEvent;
use x11rb::protocol::shape::{NotifyEvent as ShapeNotifyEvent, SK};
use x11rb::protocol::xproto::{
    CirculateNotifyEvent, ConfigureNotifyEvent, CreateNotifyEvent, DestroyNotifyEvent,
    MapNotifyEvent, MapState, Place, PropertyNotifyEvent, Rectangle, ReparentNotifyEvent,
    UnmapNotifyEvent,
};

use crate::server::{WindowAttributes, WindowGeometry, WindowId};

use super::manage::register_notify;
use super::{Compositor, plugin_context};

/// DamageNotify events after which the whole window is repainted
const DAMAGE_NOTIFY_THRESHOLD: u32 = 10;

/// Window an event is about, if any
fn event_window(event: &Event) -> Option<WindowId> {
    match event {
        Event::DamageNotify(e) => Some(e.drawable),
        Event::CirculateNotify(e) => Some(e.window),
        Event::ConfigureNotify(e) => Some(e.window),
        Event::CreateNotify(e) => Some(e.window),
        Event::DestroyNotify(e) => Some(e.window),
        Event::MapNotify(e) => Some(e.window),
        Event::ReparentNotify(e) => Some(e.window),
        Event::UnmapNotify(e) => Some(e.window),
        Event::PropertyNotify(e) => Some(e.window),
        Event::ShapeNotify(e) => Some(e.affected_window),
        _ => None,
    }
}

impl Compositor {
    pub fn handle_event(&mut self, event: &Event) {
        // Plugins never see windows kept only for stacking
        let window = event_window(event).filter(|id| !self.ignored.contains(id));
        let destroy = matches!(event, Event::DestroyNotify(_));

        if destroy {
            self.plugins
                .dispatch_event(event, window, &mut plugin_context!(self));
        }

        match event {
            Event::DamageNotify(e) => self.on_damage(e),
            Event::CreateNotify(e) => self.on_create(e),
            Event::ConfigureNotify(e) => self.on_configure(e),
            Event::CirculateNotify(e) => self.on_circulate(e),
            Event::MapNotify(e) => self.on_map(e),
            Event::UnmapNotify(e) => self.on_unmap(e),
            Event::ReparentNotify(e) => self.on_reparent(e),
            Event::DestroyNotify(e) => self.on_destroy(e),
            Event::PropertyNotify(e) => self.on_property(e),
            Event::ShapeNotify(e) => self.on_shape(e),
            Event::RandrScreenChangeNotify(e) => {
                info!("Screen changed to {}x{}", e.width, e.height);
                self.screen_changed = true;
                self.background_reset = true;
                self.force_repaint = true;
            }
            Event::Error(e) => debug!(
                "X11 error: {:?} in {} (error_code={}, request_code={}, minor_code={}, \
                 bad_value={:#x})",
                e.error_kind,
                e.request_name.unwrap_or("unknown request"),
                e.error_code,
                e.major_opcode,
                e.minor_opcode,
                e.bad_value
            ),
            _ => {}
        }

        if !destroy {
            self.plugins
                .dispatch_event(event, window, &mut plugin_context!(self));
        }
    }

    /// Add the on-screen area of a visible window to the damaged region
    fn damage_window(&mut self, id: WindowId) {
        let (width, height) = (self.screen.width, self.screen.height);
        let Some(window) = self.registry.get(id) else {
            return;
        };
        if !window.is_visible(width, height) {
            return;
        }

        let result = match (window.region(), window.geometry) {
            (Some(region), _) => self.damaged.add_copy(Some(region)),
            (None, Some(geometry)) => self.damaged.add_rectangles(&[geometry.bounds()]),
            (None, None) => Ok(()),
        };

        if let Err(e) = result {
            warn!("Cannot damage window {:#x}: {}", id, e);
        }
    }

    fn on_damage(&mut self, e: &DamageNotifyEvent) {
        let (width, height) = (self.screen.width, self.screen.height);
        let Some(window) = self.registry.get_mut(e.drawable) else {
            return;
        };
        let Some(geometry) = window.geometry else {
            return;
        };
        if !window.is_visible(width, height) {
            return;
        }

        let whole = !window.damaged
            || window.damaged_ratio >= 1.0
            || window.damage_notify_counter >= DAMAGE_NOTIFY_THRESHOLD;

        let result = if whole {
            window.damaged_ratio = 1.0;
            match window.region() {
                Some(region) => self.damaged.add_copy(Some(region)),
                None => self.damaged.add_rectangles(&[geometry.bounds()]),
            }
        } else {
            // Delta rectangles are relative to the window origin, inside the border
            let (dx, dy) = geometry.content_origin();
            let area = Rectangle {
                x: e.area.x.saturating_add(dx),
                y: e.area.y.saturating_add(dy),
                ..e.area
            };

            let window_area = geometry.outer_width() as f32 * geometry.outer_height() as f32;
            let share = e.area.width as f32 * e.area.height as f32 / window_area.max(1.0);
            // Never back to 0, the damage must still be acknowledged after painting
            window.damaged_ratio = (window.damaged_ratio + share).clamp(f32::MIN_POSITIVE, 1.0);
            window.damage_notify_counter += 1;

            self.damaged.add_rectangles(&[area])
        };

        window.damaged = true;
        trace!(
            "Window {:#x} damaged: ratio {:.2}, {} notifications",
            e.drawable, window.damaged_ratio, window.damage_notify_counter
        );

        if let Err(err) = result {
            warn!("Cannot damage window {:#x}: {}", e.drawable, err);
        }
    }

    fn on_create(&mut self, e: &CreateNotifyEvent) {
        if e.parent != self.screen.root {
            return;
        }

        let geometry = WindowGeometry::new(
            e.x.into(),
            e.y.into(),
            e.width.into(),
            e.height.into(),
            e.border_width.into(),
        );
        self.add_window(e.window, Some(geometry));
    }

    fn on_configure(&mut self, e: &ConfigureNotifyEvent) {
        if e.window == self.screen.root {
            info!("Root window resized to {}x{}", e.width, e.height);
            self.screen.width = e.width;
            self.screen.height = e.height;
            self.backend.screen_resized(e.width, e.height);
            self.background_reset = true;
            self.force_repaint = true;
            return;
        }

        if !self.registry.contains(e.window) {
            return;
        }
        if self.is_managed(e.window) {
            self.update_geometry(e);
        }

        let sibling = (e.above_sibling != NONE).then_some(e.above_sibling);
        self.registry.raise_above(e.window, sibling);
        trace!("Stacking order: {:x?}", self.registry.ids());
    }

    fn update_geometry(&mut self, e: &ConfigureNotifyEvent) {
        self.damage_window(e.window);

        let (width, height) = (self.screen.width, self.screen.height);
        let geometry = WindowGeometry::new(
            e.x.into(),
            e.y.into(),
            e.width.into(),
            e.height.into(),
            e.border_width.into(),
        );

        if let Some(window) = self.registry.get_mut(e.window) {
            let resized = window.geometry.is_none_or(|old| {
                (old.width, old.height, old.border_width)
                    != (geometry.width, geometry.height, geometry.border_width)
            });
            window.geometry = Some(geometry);

            if window.is_visible(width, height) {
                if resized || window.pixmap().is_none() {
                    if let Err(err) = window.refresh_pixmap(&self.server, self.backend.as_mut()) {
                        warn!("Cannot get pixmap of window {:#x}: {}", e.window, err);
                    }
                }
                if let Err(err) = window.refresh_region(&self.server, true, resized) {
                    warn!("Cannot get region of window {:#x}: {}", e.window, err);
                }
            }
        }

        self.damage_window(e.window);
    }

    fn on_circulate(&mut self, e: &CirculateNotifyEvent) {
        if e.place == Place::ON_TOP {
            self.registry.move_to_top(e.window);
        } else {
            self.registry.move_to_bottom(e.window);
        }
        trace!("Stacking order: {:x?}", self.registry.ids());
        self.damage_window(e.window);
    }

    fn on_map(&mut self, e: &MapNotifyEvent) {
        if !self.is_managed(e.window) {
            return;
        }
        let has_shape = self.extensions.has_shape();
        let Some(window) = self.registry.get_mut(e.window) else {
            return;
        };

        window.attributes = window.attributes.map(|attributes| WindowAttributes {
            map_state: MapState::VIEWABLE,
            override_redirect: e.override_redirect,
            ..attributes
        });
        // Painted once its contents are reported
        window.damaged = false;

        if let Err(err) = register_notify(self.server.as_ref(), e.window, has_shape) {
            warn!("Cannot select events on window {:#x}: {}", e.window, err);
        }
        if let Err(err) = window.refresh_pixmap(&self.server, self.backend.as_mut()) {
            warn!("Cannot get pixmap of window {:#x}: {}", e.window, err);
        }
        if let Err(err) = window.refresh_region(&self.server, true, true) {
            warn!("Cannot get region of window {:#x}: {}", e.window, err);
        }

        debug!("Window {:#x} mapped", e.window);
    }

    fn on_unmap(&mut self, e: &UnmapNotifyEvent) {
        self.damage_window(e.window);

        let Some(window) = self.registry.get_mut(e.window) else {
            return;
        };
        window.attributes = window
            .attributes
            .map(|attributes| attributes.with_map_state(MapState::UNMAPPED));
        window.free_pixmap(self.backend.as_mut());
        window.damaged = false;

        debug!("Window {:#x} unmapped", e.window);
    }

    fn on_reparent(&mut self, e: &ReparentNotifyEvent) {
        if e.parent == self.screen.root {
            if self.add_window(e.window, None) {
                self.setup_visible(e.window);
            }
            return;
        }

        self.damage_window(e.window);
        self.remove_window(e.window);
    }

    fn on_destroy(&mut self, e: &DestroyNotifyEvent) {
        self.damage_window(e.window);
        self.remove_window(e.window);
    }

    fn remove_window(&mut self, id: WindowId) {
        if !self.registry.contains(id) {
            return;
        }

        self.backend.free_window(id);
        self.registry.remove(id, true);
        debug!("Window {:#x} removed", id);
    }

    fn on_property(&mut self, e: &PropertyNotifyEvent) {
        let background = self.atoms.background_properties().contains(&e.atom);
        if e.window != self.screen.root || !background {
            return;
        }

        debug!("Root background changed");
        self.backend.background_changed();
        self.background_reset = true;
        self.force_repaint = true;
    }

    fn on_shape(&mut self, e: &ShapeNotifyEvent) {
        if e.shape_kind != SK::BOUNDING || !self.is_managed(e.affected_window) {
            return;
        }

        self.damage_window(e.affected_window);

        let (width, height) = (self.screen.width, self.screen.height);
        if let Some(window) = self.registry.get_mut(e.affected_window) {
            window.invalidate_shape(self.server.as_ref());
            if window.is_visible(width, height) {
                if let Err(err) = window.refresh_region(&self.server, true, true) {
                    warn!("Cannot get region of window {:#x}: {}", e.affected_window, err);
                }
            }
        }

        self.damage_window(e.affected_window);
    }
}
