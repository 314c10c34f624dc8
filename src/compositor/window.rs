use std::rc::Rc;

use tracing::{debug, trace};
use x11rb::protocol::xproto::Rectangle;

use crate::server::{
    DamageId, OwnedDamage, OwnedPixmap, OwnedRegion, Pending, PixmapId, RegionId, RequestError,
    WindowAttributes, WindowGeometry, WindowId, XServer,
};

use super::renderer::RenderBackend;

/// Compositor view of a server-side window
///
/// Owned server resources are released when the window is dropped, in
/// field declaration order: pixmap, damage object, clip region.
#[derive(Debug)]
pub struct Window {
    pub id: WindowId,

    /// Last GetWindowAttributes reply, replaced wholesale
    pub attributes: Option<WindowAttributes>,

    /// Last known geometry, replaced wholesale
    pub geometry: Option<WindowGeometry>,

    /// Contents named with NameWindowPixmap, only while mapped
    pixmap: Option<OwnedPixmap>,

    /// Absent for InputOnly windows
    damage: Option<OwnedDamage>,

    /// Bounding shape in screen coordinates
    region: Option<OwnedRegion>,

    /// FetchRegion on the clip region, resolved by `is_rectangular`
    shape_query: Option<Pending<Vec<Rectangle>>>,
    is_rectangular: bool,

    /// Has contents waiting to be painted
    pub damaged: bool,

    /// Share of the window repainted this frame, 0 when not painted
    pub damaged_ratio: f32,

    /// DamageNotify events since the last paint
    pub damage_notify_counter: u32,
}

impl Window {
    pub fn new(id: WindowId) -> Self {
        Self {
            id,
            attributes: None,
            geometry: None,
            pixmap: None,
            damage: None,
            region: None,
            shape_query: None,
            is_rectangular: true,
            damaged: false,
            damaged_ratio: 0.0,
            damage_notify_counter: 0,
        }
    }

    /// Mapped and overlapping the screen by at least one pixel
    pub fn is_visible(&self, screen_width: u16, screen_height: u16) -> bool {
        let (Some(attributes), Some(geometry)) = (&self.attributes, &self.geometry) else {
            return false;
        };

        attributes.is_viewable()
            && geometry.x + geometry.width as i32 >= 1
            && geometry.y + geometry.height as i32 >= 1
            && geometry.x < screen_width as i32
            && geometry.y < screen_height as i32
    }

    pub fn pixmap(&self) -> Option<PixmapId> {
        self.pixmap.as_ref().map(OwnedPixmap::id)
    }

    pub fn damage(&self) -> Option<DamageId> {
        self.damage.as_ref().map(OwnedDamage::id)
    }

    pub fn region(&self) -> Option<RegionId> {
        self.region.as_ref().map(OwnedRegion::id)
    }

    pub fn set_damage(&mut self, damage: OwnedDamage) {
        self.damage = Some(damage);
    }

    /// Name a fresh pixmap for the window contents, releasing the old one first
    pub fn refresh_pixmap(
        &mut self,
        server: &Rc<dyn XServer>,
        backend: &mut dyn RenderBackend,
    ) -> Result<(), RequestError> {
        self.free_pixmap(backend);
        self.pixmap = Some(OwnedPixmap::name_window(server, self.id)?);
        trace!("Window {:#x}: new pixmap {:?}", self.id, self.pixmap);
        Ok(())
    }

    /// Release the pixmap after the backend dropped what it built on it
    pub fn free_pixmap(&mut self, backend: &mut dyn RenderBackend) {
        if self.pixmap.is_some() {
            backend.free_window_pixmap(self.id);
            self.pixmap = None;
        }
    }

    /// Recompute the clip region from the bounding shape
    ///
    /// With `check_shape` a FetchRegion is issued so that `is_rectangular`
    /// can be answered later without an extra round-trip now.
    pub fn refresh_region(
        &mut self,
        server: &Rc<dyn XServer>,
        screen_relative: bool,
        check_shape: bool,
    ) -> Result<(), RequestError> {
        let region = OwnedRegion::from_window(server, self.id)?;

        if screen_relative {
            if let Some(geometry) = &self.geometry {
                let (dx, dy) = geometry.content_origin();
                region.translate(dx, dy)?;
            }
        }

        if check_shape {
            if let Some(stale) = self.shape_query.take() {
                stale.discard(server.as_ref());
            }
            self.shape_query = Some(server.fetch_region(region.id()));
            server.flush()?;
        }

        debug!("Window {:#x}: new region {:?}", self.id, region);
        self.region = Some(region);
        Ok(())
    }

    /// Whether the bounding shape is a single rectangle
    pub fn is_rectangular(&mut self, server: &dyn XServer) -> bool {
        let Some(query) = self.shape_query.take() else {
            return self.is_rectangular;
        };

        if !query.is_sent() {
            return self.is_rectangular;
        }

        self.is_rectangular = match query.finish(server) {
            Ok(rectangles) => rectangles.len() <= 1,
            Err(e) => {
                debug!("Window {:#x}: shape fetch failed: {}", self.id, e);
                true
            }
        };

        self.is_rectangular
    }

    /// Region to clip painting to, only once the window is known to be shaped
    ///
    /// Rectangular windows are painted over their bounds without a clip.
    pub fn paint_clip(&self) -> Option<RegionId> {
        if self.is_rectangular || self.shape_query.is_some() {
            return None;
        }
        self.region()
    }

    /// Forget the cached shape so the next clip region refresh resolves it again
    pub fn invalidate_shape(&mut self, server: &dyn XServer) {
        if let Some(query) = self.shape_query.take() {
            query.discard(server);
        }
        self.is_rectangular = true;
    }

    /// Release every owned server resource: pixmap, damage object, region
    pub fn release_resources(&mut self, server: &dyn XServer) {
        self.pixmap = None;
        self.damage = None;
        self.region = None;
        self.invalidate_shape(server);
    }
}
