//! X server access
//!
//! Everything the compositor asks of the X server goes through the
//! [`XServer`] trait: round-trip requests hand back a [`Pending`] token,
//! fire-and-forget requests return immediately. The production
//! implementation lives in [`x11`], tests use an in-memory fake.

pub mod pipeline;
pub mod resource;
pub mod x11;

use x11rb::protocol::xproto::{EventMask, MapState, Rectangle, Visualid, WindowClass};

pub use pipeline::{FromReply, Pending, Reply, ReplyKind, RequestError, Sequence};
pub use resource::{OwnedDamage, OwnedPixmap, OwnedRegion};

pub type WindowId = u32;
pub type PixmapId = u32;
pub type DamageId = u32;
pub type RegionId = u32;
pub type AtomId = u32;

/// Snapshot of a GetWindowAttributes reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAttributes {
    pub map_state: MapState,
    pub class: WindowClass,
    pub override_redirect: bool,
    pub visual: Visualid,
}

impl WindowAttributes {
    /// Same snapshot with another map state
    pub fn with_map_state(self, map_state: MapState) -> Self {
        Self { map_state, ..self }
    }

    pub fn is_viewable(&self) -> bool {
        self.map_state == MapState::VIEWABLE
    }

    pub fn is_input_only(&self) -> bool {
        self.class == WindowClass::INPUT_ONLY
    }
}

/// Snapshot of a GetGeometry reply, relative to the parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowGeometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub border_width: u32,
}

impl WindowGeometry {
    pub fn new(x: i32, y: i32, width: u32, height: u32, border_width: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            border_width,
        }
    }

    /// Width including both borders
    pub fn outer_width(&self) -> u32 {
        self.width + 2 * self.border_width
    }

    /// Height including both borders
    pub fn outer_height(&self) -> u32 {
        self.height + 2 * self.border_width
    }

    /// Area covered on screen, borders included
    pub fn bounds(&self) -> Rectangle {
        Rectangle {
            x: clamp_i16(self.x),
            y: clamp_i16(self.y),
            width: clamp_u16(self.outer_width()),
            height: clamp_u16(self.outer_height()),
        }
    }

    /// Offset to apply to a window-relative region to get screen coordinates
    pub fn content_origin(&self) -> (i16, i16) {
        let border = self.border_width as i32;
        (clamp_i16(self.x + border), clamp_i16(self.y + border))
    }
}

fn clamp_i16(value: i32) -> i16 {
    value.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

fn clamp_u16(value: u32) -> u16 {
    value.min(u16::MAX as u32) as u16
}

/// Requests the compositor core issues
///
/// Round-trip requests never block: they return a [`Pending`] token which is
/// unsent when the connection could not take the request. One-way requests
/// only fail when the connection is gone. Errors for one-way requests arrive
/// later as events.
pub trait XServer {
    /// Allocate a fresh resource identifier
    fn generate_id(&self) -> Result<u32, RequestError>;

    /// Block until the reply (or error) for `sequence` arrives
    fn wait_for_reply(&self, sequence: Sequence, kind: ReplyKind) -> Result<Reply, RequestError>;

    /// Drop the reply (or error) for `sequence` whenever it arrives
    fn discard_reply(&self, sequence: Sequence, kind: ReplyKind);

    fn get_window_attributes(&self, window: WindowId) -> Pending<WindowAttributes>;

    fn get_geometry(&self, window: WindowId) -> Pending<WindowGeometry>;

    /// Children of `window`, bottom-most first
    fn query_tree(&self, window: WindowId) -> Pending<Vec<WindowId>>;

    /// Rectangles making up an XFixes region
    fn fetch_region(&self, region: RegionId) -> Pending<Vec<Rectangle>>;

    /// First 32-bit item of a property of the given type
    fn get_property32(
        &self,
        window: WindowId,
        property: AtomId,
        type_: AtomId,
    ) -> Pending<Option<u32>>;

    /// Checked DamageCreate reporting raw delta rectangles
    fn create_damage(&self, damage: DamageId, window: WindowId) -> Pending<()>;

    fn name_window_pixmap(&self, window: WindowId, pixmap: PixmapId) -> Result<(), RequestError>;

    fn free_pixmap(&self, pixmap: PixmapId) -> Result<(), RequestError>;

    fn destroy_damage(&self, damage: DamageId) -> Result<(), RequestError>;

    /// Acknowledge everything the damage object reported so far
    fn subtract_damage(&self, damage: DamageId) -> Result<(), RequestError>;

    fn create_region(&self, region: RegionId, rectangles: &[Rectangle]) -> Result<(), RequestError>;

    /// Region of the bounding shape of `window`, window-relative
    fn create_region_from_window(
        &self,
        region: RegionId,
        window: WindowId,
    ) -> Result<(), RequestError>;

    fn translate_region(&self, region: RegionId, dx: i16, dy: i16) -> Result<(), RequestError>;

    fn copy_region(&self, source: RegionId, destination: RegionId) -> Result<(), RequestError>;

    /// `destination = first ∪ second`
    fn union_region(
        &self,
        first: RegionId,
        second: RegionId,
        destination: RegionId,
    ) -> Result<(), RequestError>;

    fn destroy_region(&self, region: RegionId) -> Result<(), RequestError>;

    fn select_window_input(&self, window: WindowId, mask: EventMask) -> Result<(), RequestError>;

    fn select_shape_input(&self, window: WindowId, enable: bool) -> Result<(), RequestError>;

    /// Keep the window manager away from `window` while it is mapped
    fn set_override_redirect(&self, window: WindowId, enable: bool) -> Result<(), RequestError>;

    fn map_window(&self, window: WindowId) -> Result<(), RequestError>;

    fn unmap_window(&self, window: WindowId) -> Result<(), RequestError>;

    fn flush(&self) -> Result<(), RequestError>;

    /// Round-trip making sure every previous request has been processed
    fn sync(&self) -> Result<(), RequestError>;
}
