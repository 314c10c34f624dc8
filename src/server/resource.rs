//! Owned server-side resources
//!
//! A [`Resource`] releases its server object when dropped. Failures to
//! release are logged, never propagated.

use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use tracing::warn;
use x11rb::protocol::xproto::Rectangle;

use super::{RequestError, WindowId, XServer};

/// Kind of server object a [`Resource`] owns
pub trait ResourceKind {
    const NAME: &'static str;

    fn release(server: &dyn XServer, id: u32) -> Result<(), RequestError>;
}

#[derive(Debug)]
pub enum Pixmap {}

#[derive(Debug)]
pub enum Damage {}

#[derive(Debug)]
pub enum Region {}

impl ResourceKind for Pixmap {
    const NAME: &'static str = "pixmap";

    fn release(server: &dyn XServer, id: u32) -> Result<(), RequestError> {
        server.free_pixmap(id)
    }
}

impl ResourceKind for Damage {
    const NAME: &'static str = "damage";

    fn release(server: &dyn XServer, id: u32) -> Result<(), RequestError> {
        server.destroy_damage(id)
    }
}

impl ResourceKind for Region {
    const NAME: &'static str = "region";

    fn release(server: &dyn XServer, id: u32) -> Result<(), RequestError> {
        server.destroy_region(id)
    }
}

pub type OwnedPixmap = Resource<Pixmap>;
pub type OwnedDamage = Resource<Damage>;
pub type OwnedRegion = Resource<Region>;

pub struct Resource<K: ResourceKind> {
    id: u32,
    server: Rc<dyn XServer>,
    armed: bool,
    _kind: PhantomData<K>,
}

impl<K: ResourceKind> Resource<K> {
    /// Take ownership of an object whose creation request has been issued
    pub fn adopt(server: Rc<dyn XServer>, id: u32) -> Self {
        Self {
            id,
            server,
            armed: true,
            _kind: PhantomData,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Give up ownership without releasing, for objects the server never
    /// created (failed checked creation) or whose release is handled elsewhere
    pub fn forget(mut self) -> u32 {
        self.armed = false;
        self.id
    }
}

impl OwnedPixmap {
    /// NameWindowPixmap: current off-screen contents of `window`
    pub fn name_window(server: &Rc<dyn XServer>, window: WindowId) -> Result<Self, RequestError> {
        let id = server.generate_id()?;
        server.name_window_pixmap(window, id)?;
        Ok(Self::adopt(server.clone(), id))
    }
}

impl OwnedRegion {
    pub fn create(
        server: &Rc<dyn XServer>,
        rectangles: &[Rectangle],
    ) -> Result<Self, RequestError> {
        let id = server.generate_id()?;
        server.create_region(id, rectangles)?;
        Ok(Self::adopt(server.clone(), id))
    }

    /// Bounding shape of `window`, in window coordinates
    pub fn from_window(server: &Rc<dyn XServer>, window: WindowId) -> Result<Self, RequestError> {
        let id = server.generate_id()?;
        server.create_region_from_window(id, window)?;
        Ok(Self::adopt(server.clone(), id))
    }

    pub fn translate(&self, dx: i16, dy: i16) -> Result<(), RequestError> {
        self.server.translate_region(self.id, dx, dy)
    }
}

impl<K: ResourceKind> Drop for Resource<K> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        if let Err(e) = K::release(self.server.as_ref(), self.id) {
            warn!("Failed to release {} {:#x}: {}", K::NAME, self.id, e);
        }
    }
}

impl<K: ResourceKind> fmt::Debug for Resource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#x})", K::NAME, self.id)
    }
}
