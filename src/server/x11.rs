//! [`XServer`] over an x11rb connection
//!
//! Round-trip requests keep only the sequence number of their cookie; the
//! reply is fetched (or thrown away) later through the connection using
//! that number.

use std::sync::Arc;

use tracing::{trace, warn};
use x11rb::NONE;
use x11rb::connection::{Connection, DiscardMode, RequestConnection, RequestKind};
use x11rb::protocol::composite::ConnectionExt as CompositeExt;
use x11rb::protocol::damage::{ConnectionExt as DamageExt, ReportLevel};
use x11rb::protocol::shape::{ConnectionExt as ShapeExt, SK};
use x11rb::protocol::xfixes::{ConnectionExt as XFixesExt, FetchRegionReply};
use x11rb::protocol::xproto::{
    ChangeWindowAttributesAux, ConnectionExt as XprotoExt, EventMask, GetGeometryReply,
    GetPropertyReply, GetWindowAttributesReply, QueryTreeReply, Rectangle,
};
use x11rb::rust_connection::RustConnection;
use x11rb::x11_utils::TryParse;

use super::{
    AtomId, DamageId, Pending, PixmapId, RegionId, Reply, ReplyKind, RequestError, Sequence,
    WindowAttributes, WindowGeometry, WindowId, XServer,
};

/// Turn a cookie into a pending token
///
/// The cookie is forgotten so its destructor does not discard the reply.
macro_rules! begin {
    ($name:literal, $request:expr) => {
        match $request {
            Ok(cookie) => {
                let sequence = cookie.sequence_number();
                std::mem::forget(cookie);
                trace!("{} sent as request {}", $name, sequence);
                Pending::sent(sequence)
            }
            Err(e) => {
                warn!("Could not send {}: {}", $name, e);
                Pending::unsent()
            }
        }
    };
}

pub struct X11Server {
    conn: Arc<RustConnection>,
    has_shape: bool,
}

impl X11Server {
    pub fn new(conn: Arc<RustConnection>, has_shape: bool) -> Self {
        Self { conn, has_shape }
    }

    fn parse<R: TryParse>(buf: &[u8]) -> Result<R, RequestError> {
        let (reply, _) = R::try_parse(buf)?;
        Ok(reply)
    }
}

impl From<GetWindowAttributesReply> for WindowAttributes {
    fn from(reply: GetWindowAttributesReply) -> Self {
        Self {
            map_state: reply.map_state,
            class: reply.class,
            override_redirect: reply.override_redirect,
            visual: reply.visual,
        }
    }
}

impl From<GetGeometryReply> for WindowGeometry {
    fn from(reply: GetGeometryReply) -> Self {
        Self::new(
            reply.x.into(),
            reply.y.into(),
            reply.width.into(),
            reply.height.into(),
            reply.border_width.into(),
        )
    }
}

impl XServer for X11Server {
    fn generate_id(&self) -> Result<u32, RequestError> {
        Ok(self.conn.generate_id()?)
    }

    fn wait_for_reply(&self, sequence: Sequence, kind: ReplyKind) -> Result<Reply, RequestError> {
        if kind == ReplyKind::Void {
            self.conn.check_for_error(sequence)?;
            return Ok(Reply::Void);
        }

        let buf = self.conn.wait_for_reply_or_error(sequence)?;
        let reply = match kind {
            ReplyKind::Void => Reply::Void,
            ReplyKind::WindowAttributes => {
                Reply::WindowAttributes(Self::parse::<GetWindowAttributesReply>(&buf)?.into())
            }
            ReplyKind::Geometry => Reply::Geometry(Self::parse::<GetGeometryReply>(&buf)?.into()),
            ReplyKind::Tree => Reply::Tree(Self::parse::<QueryTreeReply>(&buf)?.children),
            ReplyKind::RegionRectangles => {
                Reply::RegionRectangles(Self::parse::<FetchRegionReply>(&buf)?.rectangles)
            }
            ReplyKind::Property32 => {
                let reply = Self::parse::<GetPropertyReply>(&buf)?;
                Reply::Property32(reply.value32().and_then(|mut values| values.next()))
            }
        };
        Ok(reply)
    }

    fn discard_reply(&self, sequence: Sequence, kind: ReplyKind) {
        let kind = match kind {
            ReplyKind::Void => RequestKind::IsVoid,
            _ => RequestKind::HasResponse,
        };
        self.conn
            .discard_reply(sequence, kind, DiscardMode::DiscardReplyAndError);
    }

    fn get_window_attributes(&self, window: WindowId) -> Pending<WindowAttributes> {
        begin!("GetWindowAttributes", self.conn.get_window_attributes(window))
    }

    fn get_geometry(&self, window: WindowId) -> Pending<WindowGeometry> {
        begin!("GetGeometry", self.conn.get_geometry(window))
    }

    fn query_tree(&self, window: WindowId) -> Pending<Vec<WindowId>> {
        begin!("QueryTree", self.conn.query_tree(window))
    }

    fn fetch_region(&self, region: RegionId) -> Pending<Vec<Rectangle>> {
        begin!("FetchRegion", self.conn.xfixes_fetch_region(region))
    }

    fn get_property32(
        &self,
        window: WindowId,
        property: AtomId,
        type_: AtomId,
    ) -> Pending<Option<u32>> {
        begin!(
            "GetProperty",
            self.conn.get_property(false, window, property, type_, 0, 1)
        )
    }

    fn create_damage(&self, damage: DamageId, window: WindowId) -> Pending<()> {
        begin!(
            "DamageCreate",
            self.conn
                .damage_create(damage, window, ReportLevel::RAW_RECTANGLES)
        )
    }

    fn name_window_pixmap(&self, window: WindowId, pixmap: PixmapId) -> Result<(), RequestError> {
        self.conn.composite_name_window_pixmap(window, pixmap)?;
        Ok(())
    }

    fn free_pixmap(&self, pixmap: PixmapId) -> Result<(), RequestError> {
        self.conn.free_pixmap(pixmap)?;
        Ok(())
    }

    fn destroy_damage(&self, damage: DamageId) -> Result<(), RequestError> {
        self.conn.damage_destroy(damage)?;
        Ok(())
    }

    fn subtract_damage(&self, damage: DamageId) -> Result<(), RequestError> {
        self.conn.damage_subtract(damage, NONE, NONE)?;
        Ok(())
    }

    fn create_region(
        &self,
        region: RegionId,
        rectangles: &[Rectangle],
    ) -> Result<(), RequestError> {
        self.conn.xfixes_create_region(region, rectangles)?;
        Ok(())
    }

    fn create_region_from_window(
        &self,
        region: RegionId,
        window: WindowId,
    ) -> Result<(), RequestError> {
        self.conn
            .xfixes_create_region_from_window(region, window, SK::BOUNDING)?;
        Ok(())
    }

    fn translate_region(&self, region: RegionId, dx: i16, dy: i16) -> Result<(), RequestError> {
        self.conn.xfixes_translate_region(region, dx, dy)?;
        Ok(())
    }

    fn copy_region(&self, source: RegionId, destination: RegionId) -> Result<(), RequestError> {
        self.conn.xfixes_copy_region(source, destination)?;
        Ok(())
    }

    fn union_region(
        &self,
        first: RegionId,
        second: RegionId,
        destination: RegionId,
    ) -> Result<(), RequestError> {
        self.conn.xfixes_union_region(first, second, destination)?;
        Ok(())
    }

    fn destroy_region(&self, region: RegionId) -> Result<(), RequestError> {
        self.conn.xfixes_destroy_region(region)?;
        Ok(())
    }

    fn select_window_input(&self, window: WindowId, mask: EventMask) -> Result<(), RequestError> {
        let aux = ChangeWindowAttributesAux::new().event_mask(mask);
        self.conn.change_window_attributes(window, &aux)?;
        Ok(())
    }

    fn select_shape_input(&self, window: WindowId, enable: bool) -> Result<(), RequestError> {
        if self.has_shape {
            self.conn.shape_select_input(window, enable)?;
        }
        Ok(())
    }

    fn set_override_redirect(&self, window: WindowId, enable: bool) -> Result<(), RequestError> {
        let aux = ChangeWindowAttributesAux::new().override_redirect(u32::from(enable));
        self.conn.change_window_attributes(window, &aux)?;
        Ok(())
    }

    fn map_window(&self, window: WindowId) -> Result<(), RequestError> {
        self.conn.map_window(window)?;
        Ok(())
    }

    fn unmap_window(&self, window: WindowId) -> Result<(), RequestError> {
        self.conn.unmap_window(window)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), RequestError> {
        self.conn.flush()?;
        Ok(())
    }

    fn sync(&self) -> Result<(), RequestError> {
        self.conn.get_input_focus()?.reply()?;
        Ok(())
    }
}
