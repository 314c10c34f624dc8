//! Window management: startup enumeration, addition and resource setup

use std::rc::Rc;

use tracing::{debug, info, warn};
use x11rb::protocol::xproto::EventMask;

use crate::server::{
    OwnedDamage, Pending, RequestError, WindowAttributes, WindowGeometry, WindowId, XServer,
};

use super::window::Window;
use super::{Compositor, plugin_context};

/// Requests issued for a window before it is inserted
struct AddRequests {
    attributes: Pending<WindowAttributes>,
    geometry: Option<Pending<WindowGeometry>>,
}

impl AddRequests {
    fn begin(server: &dyn XServer, window: WindowId, fetch_geometry: bool) -> Self {
        Self {
            attributes: server.get_window_attributes(window),
            geometry: fetch_geometry.then(|| server.get_geometry(window)),
        }
    }

    fn discard(self, server: &dyn XServer) {
        self.attributes.discard(server);
        if let Some(geometry) = self.geometry {
            geometry.discard(server);
        }
    }

    /// Collect the attributes into `window` and send its DamageCreate
    ///
    /// The geometry stays pending. On error nothing is left pending.
    fn begin_setup(
        self,
        window: &mut Window,
        server: &Rc<dyn XServer>,
    ) -> Result<WindowSetup, RequestError> {
        let Self {
            attributes,
            geometry,
        } = self;

        let damage = attributes
            .finish_if_sent(server.as_ref())
            .and_then(|attributes| {
                window.attributes = Some(attributes);
                begin_damage(window, server)
            });

        match damage {
            Ok(damage) => Ok(WindowSetup { damage, geometry }),
            Err(e) => {
                if let Some(geometry) = geometry {
                    geometry.discard(server.as_ref());
                }
                Err(e)
            }
        }
    }
}

fn begin_damage(
    window: &Window,
    server: &Rc<dyn XServer>,
) -> Result<Option<(OwnedDamage, Pending<()>)>, RequestError> {
    // Nothing is ever painted in an InputOnly window
    if window.attributes.is_some_and(|attributes| attributes.is_input_only()) {
        return Ok(None);
    }

    let id = server.generate_id()?;
    let request = server.create_damage(id, window.id);
    Ok(Some((OwnedDamage::adopt(server.clone(), id), request)))
}

/// Replies still expected once the attributes of a window are known
struct WindowSetup {
    damage: Option<(OwnedDamage, Pending<()>)>,
    geometry: Option<Pending<WindowGeometry>>,
}

impl WindowSetup {
    fn discard(self, server: &dyn XServer) {
        // The damage object is destroyed when dropped here
        if let Some((_damage, request)) = self.damage {
            request.discard(server);
        }
        if let Some(geometry) = self.geometry {
            geometry.discard(server);
        }
    }

    /// Check the damage object, then collect the geometry
    ///
    /// On error the window may hold part of its resources; removing it with
    /// resource destruction releases whatever was created.
    fn finish(self, window: &mut Window, server: &dyn XServer) -> Result<(), RequestError> {
        let Self { damage, geometry } = self;

        if let Some((damage, request)) = damage {
            if let Err(e) = request.finish_if_sent(server) {
                // Never created on the server side
                damage.forget();
                if let Some(geometry) = geometry {
                    geometry.discard(server);
                }
                return Err(e);
            }
            window.set_damage(damage);
        }

        if let Some(geometry) = geometry {
            window.geometry = Some(geometry.finish_if_sent(server)?);
        }
        Ok(())
    }
}

impl Compositor {
    /// Manage the windows found on startup
    ///
    /// Every request is issued before any reply is waited for, and every
    /// window is inserted before any is finalized. Ignored windows only
    /// keep their place in the stacking order.
    pub fn manage_existing(&mut self, ids: &[WindowId]) {
        let requests: Vec<_> = ids
            .iter()
            .map(|&id| {
                (!self.ignored.contains(&id))
                    .then(|| AddRequests::begin(self.server.as_ref(), id, true))
            })
            .collect();

        let mut inserted = Vec::with_capacity(ids.len());
        for (&id, requests) in ids.iter().zip(requests) {
            let Some(requests) = requests else {
                self.insert_placeholder(id);
                continue;
            };
            match self.registry.insert(id) {
                Ok(_) => inserted.push((id, requests)),
                Err(e) => {
                    warn!("{}", e);
                    requests.discard(self.server.as_ref());
                }
            }
        }

        let accepted = self.finish_add(inserted);
        for &id in &accepted {
            self.setup_visible(id);
        }

        info!("Managing {} existing windows", accepted.len());
        self.plugins
            .manage_existing(&accepted, &mut plugin_context!(self));
    }

    /// Manage a window appearing at runtime, on top of the stack
    ///
    /// With a known `geometry` (CreateNotify) only the attributes are fetched.
    pub fn add_window(&mut self, id: WindowId, geometry: Option<WindowGeometry>) -> bool {
        if self.ignored.contains(&id) {
            if !self.registry.contains(id) {
                self.insert_placeholder(id);
            }
            return false;
        }

        let requests = AddRequests::begin(self.server.as_ref(), id, geometry.is_none());
        match self.registry.insert(id) {
            Ok(window) => window.geometry = geometry,
            Err(e) => {
                warn!("{}", e);
                requests.discard(self.server.as_ref());
                return false;
            }
        }

        if self.finish_add(vec![(id, requests)]).is_empty() {
            return false;
        }

        debug!("Added window {:#x}", id);
        true
    }

    /// Whether `id` is managed rather than only stacked
    pub(super) fn is_managed(&self, id: WindowId) -> bool {
        self.registry.contains(id) && !self.ignored.contains(&id)
    }

    /// Keep an ignored window in the stacking order, without any resource
    ///
    /// Siblings in ConfigureNotify may name it.
    fn insert_placeholder(&mut self, id: WindowId) {
        match self.registry.insert(id) {
            Ok(_) => debug!("Window {:#x} kept for stacking only", id),
            Err(e) => warn!("{}", e),
        }
    }

    /// Finalize inserted windows, returning those kept
    ///
    /// Attributes are collected first since InputOnly windows get no damage
    /// object. Every DamageCreate is then sent before any of them is checked.
    fn finish_add(&mut self, batch: Vec<(WindowId, AddRequests)>) -> Vec<WindowId> {
        let mut setups = Vec::with_capacity(batch.len());
        for (id, requests) in batch {
            let Some(window) = self.registry.get_mut(id) else {
                requests.discard(self.server.as_ref());
                continue;
            };
            match requests.begin_setup(window, &self.server) {
                Ok(setup) => setups.push((id, setup)),
                Err(e) => self.drop_window(id, &e),
            }
        }

        let mut accepted = Vec::with_capacity(setups.len());
        for (id, setup) in setups {
            let Some(window) = self.registry.get_mut(id) else {
                setup.discard(self.server.as_ref());
                continue;
            };
            match setup.finish(window, self.server.as_ref()) {
                Ok(()) => accepted.push(id),
                Err(e) => self.drop_window(id, &e),
            }
        }
        accepted
    }

    fn drop_window(&mut self, id: WindowId, e: &RequestError) {
        warn!("Cannot manage window {:#x}: {}", id, e);
        self.backend.free_window(id);
        self.registry.remove(id, true);
    }

    /// Notifications, pixmap and clip region for a window shown on screen
    pub(super) fn setup_visible(&mut self, id: WindowId) {
        let (width, height) = (self.screen.width, self.screen.height);
        let Some(window) = self.registry.get_mut(id) else {
            return;
        };
        if !window.is_visible(width, height) {
            return;
        }

        if let Err(e) = register_notify(self.server.as_ref(), id, self.extensions.has_shape()) {
            warn!("Cannot select events on window {:#x}: {}", id, e);
        }
        if let Err(e) = window.refresh_pixmap(&self.server, self.backend.as_mut()) {
            warn!("Cannot get pixmap of window {:#x}: {}", id, e);
        }
        if let Err(e) = window.refresh_region(&self.server, true, true) {
            warn!("Cannot get region of window {:#x}: {}", id, e);
        }
    }
}

/// Property changes (opacity) and bounding shape changes of a window
pub(super) fn register_notify(
    server: &dyn XServer,
    window: WindowId,
    shape: bool,
) -> Result<(), RequestError> {
    server.select_window_input(window, EventMask::PROPERTY_CHANGE)?;
    if shape {
        server.select_shape_input(window, true)?;
    }
    Ok(())
}
