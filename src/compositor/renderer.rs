//! Rendering backends
//!
//! The repaint loop only talks to [`RenderBackend`]. Painting is best
//! effort: backends log their failures and never report them back.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use x11rb::NONE;
use x11rb::connection::Connection;
use x11rb::protocol::render::{
    Color, ConnectionExt as RenderExt, CreatePictureAux, PictOp, PictType, Pictformat, Picture,
    Repeat,
};
use x11rb::protocol::xfixes::ConnectionExt as XFixesExt;
use x11rb::protocol::xproto::{
    AtomEnum, ConnectionExt as XprotoExt, Pixmap, Rectangle, SubwindowMode, Visualid,
};
use x11rb::rust_connection::RustConnection;

use crate::atoms::Atoms;
use crate::display::Screen;
use crate::server::{RegionId, WindowId};

use super::window::Window;

/// Fully opaque window
pub const OPAQUE: u16 = 0xffff;

pub trait RenderBackend {
    /// Paint the root background, clipped to `damaged` when set
    fn paint_background(&mut self, damaged: Option<RegionId>);

    /// Composite one window on top of what has been painted so far
    fn paint_window(&mut self, window: &Window, opacity: u16);

    /// Present the frame
    fn paint_all(&mut self, damaged: Option<RegionId>);

    /// Drop everything kept for a window about to be forgotten
    fn free_window(&mut self, window: WindowId);

    /// Drop what was built on the window pixmap about to be released
    fn free_window_pixmap(&mut self, window: WindowId);

    /// The root background property changed
    fn background_changed(&mut self) {}

    fn screen_resized(&mut self, _width: u16, _height: u16) {}
}

struct VisualFormat {
    format: Pictformat,
    has_alpha: bool,
}

/// XRender compositing into an off-screen buffer copied to the overlay window
pub struct XRenderBackend {
    conn: Arc<RustConnection>,
    root: WindowId,
    root_depth: u8,
    root_format: Pictformat,
    atoms: Atoms,
    width: u16,
    height: u16,

    overlay_picture: Picture,
    buffer: Option<(Pixmap, Picture)>,
    /// Clip of the frame being painted, `None` for the whole screen
    damaged: Option<RegionId>,
    background: Option<Picture>,
    background_color: Color,

    formats: HashMap<Visualid, VisualFormat>,
    alpha_format: Option<Pictformat>,
    pictures: HashMap<WindowId, Picture>,
}

impl XRenderBackend {
    pub fn new(
        conn: Arc<RustConnection>,
        screen: &Screen,
        overlay: WindowId,
        atoms: Atoms,
        background_color: u32,
    ) -> Result<Self> {
        let reply = conn
            .render_query_pict_formats()?
            .reply()
            .context("Failed to query XRender picture formats")?;

        let alpha_of: HashMap<Pictformat, bool> = reply
            .formats
            .iter()
            .map(|f| (f.id, f.type_ == PictType::DIRECT && f.direct.alpha_mask != 0))
            .collect();

        let formats: HashMap<Visualid, VisualFormat> = reply
            .screens
            .iter()
            .flat_map(|s| s.depths.iter())
            .flat_map(|d| d.visuals.iter())
            .map(|v| {
                let has_alpha = alpha_of.get(&v.format).copied().unwrap_or(false);
                (
                    v.visual,
                    VisualFormat {
                        format: v.format,
                        has_alpha,
                    },
                )
            })
            .collect();

        let alpha_format = reply
            .formats
            .iter()
            .find(|f| f.depth == 8 && f.type_ == PictType::DIRECT && f.direct.alpha_mask == 0xff)
            .map(|f| f.id);

        let root_format = formats
            .get(&screen.root_visual)
            .map(|f| f.format)
            .context("No XRender format for the root visual")?;

        let overlay_picture = conn.generate_id()?;
        conn.render_create_picture(
            overlay_picture,
            overlay,
            root_format,
            &CreatePictureAux::new().subwindowmode(SubwindowMode::INCLUDE_INFERIORS),
        )?;

        info!(
            "XRender backend ready ({} visual formats, overlay {:#x})",
            formats.len(),
            overlay
        );

        let mut backend = Self {
            conn,
            root: screen.root,
            root_depth: screen.root_depth,
            root_format,
            atoms,
            width: screen.width,
            height: screen.height,
            overlay_picture,
            buffer: None,
            damaged: None,
            background: None,
            background_color: rgb_to_color(background_color),
            formats,
            alpha_format,
            pictures: HashMap::new(),
        };
        backend.create_buffer()?;
        Ok(backend)
    }

    fn create_buffer(&mut self) -> Result<()> {
        self.free_buffer();

        let pixmap = self.conn.generate_id()?;
        self.conn
            .create_pixmap(self.root_depth, pixmap, self.root, self.width, self.height)?;
        let picture = self.conn.generate_id()?;
        self.conn
            .render_create_picture(picture, pixmap, self.root_format, &CreatePictureAux::new())?;

        self.buffer = Some((pixmap, picture));
        Ok(())
    }

    fn free_buffer(&mut self) {
        if let Some((pixmap, picture)) = self.buffer.take() {
            released("buffer picture", picture, self.conn.render_free_picture(picture));
            released("buffer pixmap", pixmap, self.conn.free_pixmap(pixmap));
        }
    }

    /// Picture of the root background pixmap, when one is advertised
    fn root_background(&mut self) -> Result<Option<Picture>> {
        if let Some(picture) = self.background {
            return Ok(Some(picture));
        }

        let cookies = self
            .atoms
            .background_properties()
            .into_iter()
            .map(|atom| {
                self.conn
                    .get_property(false, self.root, atom, AtomEnum::PIXMAP, 0, 1)
            })
            .collect::<Vec<_>>();

        let mut pixmap = None;
        for cookie in cookies {
            let Ok(reply) = cookie?.reply() else {
                continue;
            };
            if pixmap.is_none() {
                pixmap = reply.value32().and_then(|mut values| values.next());
            }
        }

        let Some(pixmap) = pixmap.filter(|&p| p != NONE) else {
            debug!("No root background pixmap, using solid color");
            return Ok(None);
        };

        let picture = self.conn.generate_id()?;
        self.conn.render_create_picture(
            picture,
            pixmap,
            self.root_format,
            &CreatePictureAux::new().repeat(Repeat::NORMAL),
        )?;
        self.background = Some(picture);
        Ok(Some(picture))
    }

    fn window_picture(&mut self, window: &Window) -> Result<Option<(Picture, bool)>> {
        let (Some(pixmap), Some(attributes)) = (window.pixmap(), window.attributes) else {
            return Ok(None);
        };
        let Some(format) = self.formats.get(&attributes.visual) else {
            return Ok(None);
        };
        let has_alpha = format.has_alpha;

        if let Some(&picture) = self.pictures.get(&window.id) {
            return Ok(Some((picture, has_alpha)));
        }

        let picture = self.conn.generate_id()?;
        self.conn.render_create_picture(
            picture,
            pixmap,
            format.format,
            &CreatePictureAux::new().subwindowmode(SubwindowMode::INCLUDE_INFERIORS),
        )?;
        self.pictures.insert(window.id, picture);
        Ok(Some((picture, has_alpha)))
    }

    fn clip(&self, picture: Picture, region: Option<RegionId>) -> Result<()> {
        self.conn
            .xfixes_set_picture_clip_region(picture, region.unwrap_or(NONE), 0, 0)?;
        Ok(())
    }

    /// Restrict the buffer to `shape` within the damaged area
    ///
    /// Returns the temporary region, destroyed once the window is painted.
    fn clip_to_shape(&self, buffer: Picture, shape: RegionId) -> Result<RegionId> {
        let clip = self.conn.generate_id()?;
        self.conn.xfixes_create_region(clip, &[])?;
        match self.damaged {
            Some(damaged) => self.conn.xfixes_intersect_region(shape, damaged, clip)?,
            None => self.conn.xfixes_copy_region(shape, clip)?,
        };
        self.clip(buffer, Some(clip))?;
        Ok(clip)
    }

    fn try_paint_background(&mut self, damaged: Option<RegionId>) -> Result<()> {
        self.damaged = damaged;
        let Some((_, buffer)) = self.buffer else {
            return Ok(());
        };
        self.clip(buffer, damaged)?;

        match self.root_background()? {
            Some(background) => {
                self.conn.render_composite(
                    PictOp::SRC,
                    background,
                    NONE,
                    buffer,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                    self.width,
                    self.height,
                )?;
            }
            None => {
                let screen = Rectangle {
                    x: 0,
                    y: 0,
                    width: self.width,
                    height: self.height,
                };
                self.conn
                    .render_fill_rectangles(PictOp::SRC, buffer, self.background_color, &[screen])?;
            }
        }
        Ok(())
    }

    fn try_paint_window(&mut self, window: &Window, opacity: u16) -> Result<()> {
        let (Some((_, buffer)), Some(geometry)) = (self.buffer, window.geometry) else {
            return Ok(());
        };
        if opacity == 0 || !window.is_visible(self.width, self.height) {
            return Ok(());
        }
        let Some((picture, has_alpha)) = self.window_picture(window)? else {
            return Ok(());
        };

        let mask = if opacity < OPAQUE {
            self.opacity_mask(opacity)?
        } else {
            None
        };
        let op = if has_alpha || mask.is_some() {
            PictOp::OVER
        } else {
            PictOp::SRC
        };

        let shape_clip = match window.paint_clip() {
            Some(shape) => Some(self.clip_to_shape(buffer, shape)?),
            None => None,
        };

        let bounds = geometry.bounds();
        self.conn.render_composite(
            op,
            picture,
            mask.unwrap_or(NONE),
            buffer,
            0,
            0,
            0,
            0,
            bounds.x,
            bounds.y,
            bounds.width,
            bounds.height,
        )?;

        if let Some(mask) = mask {
            self.conn.render_free_picture(mask)?;
        }
        if let Some(clip) = shape_clip {
            self.clip(buffer, self.damaged)?;
            self.conn.xfixes_destroy_region(clip)?;
        }
        Ok(())
    }

    fn opacity_mask(&self, opacity: u16) -> Result<Option<Picture>> {
        if self.alpha_format.is_none() {
            return Ok(None);
        }

        let mask = self.conn.generate_id()?;
        self.conn.render_create_solid_fill(
            mask,
            Color {
                red: 0,
                green: 0,
                blue: 0,
                alpha: opacity,
            },
        )?;
        Ok(Some(mask))
    }

    fn try_paint_all(&mut self, damaged: Option<RegionId>) -> Result<()> {
        let Some((_, buffer)) = self.buffer else {
            return Ok(());
        };

        self.clip(buffer, None)?;
        self.clip(self.overlay_picture, damaged)?;
        self.conn.render_composite(
            PictOp::SRC,
            buffer,
            NONE,
            self.overlay_picture,
            0,
            0,
            0,
            0,
            0,
            0,
            self.width,
            self.height,
        )?;
        Ok(())
    }

    fn free_picture(&mut self, window: WindowId) {
        if let Some(picture) = self.pictures.remove(&window) {
            if let Err(e) = self.conn.render_free_picture(picture) {
                warn!("Failed to free picture of window {:#x}: {}", window, e);
            }
        }
    }
}

/// Log a release the connection did not take, returns whether it was sent
fn released<T, E: fmt::Display>(what: &str, id: u32, result: Result<T, E>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => {
            warn!("Failed to free {} {:#x}: {}", what, id, e);
            false
        }
    }
}

impl RenderBackend for XRenderBackend {
    fn paint_background(&mut self, damaged: Option<RegionId>) {
        if let Err(e) = self.try_paint_background(damaged) {
            warn!("Background paint failed: {:#}", e);
        }
    }

    fn paint_window(&mut self, window: &Window, opacity: u16) {
        if let Err(e) = self.try_paint_window(window, opacity) {
            warn!("Painting window {:#x} failed: {:#}", window.id, e);
        }
    }

    fn paint_all(&mut self, damaged: Option<RegionId>) {
        if let Err(e) = self.try_paint_all(damaged) {
            warn!("Presenting frame failed: {:#}", e);
        }
    }

    fn free_window(&mut self, window: WindowId) {
        self.free_picture(window);
    }

    fn free_window_pixmap(&mut self, window: WindowId) {
        self.free_picture(window);
    }

    fn background_changed(&mut self) {
        if let Some(picture) = self.background.take() {
            released("background picture", picture, self.conn.render_free_picture(picture));
        }
    }

    fn screen_resized(&mut self, width: u16, height: u16) {
        self.width = width;
        self.height = height;
        if let Err(e) = self.create_buffer() {
            warn!("Failed to recreate paint buffer: {:#}", e);
        }
    }
}

impl Drop for XRenderBackend {
    fn drop(&mut self) {
        for (window, picture) in self.pictures.drain() {
            if let Err(e) = self.conn.render_free_picture(picture) {
                warn!("Failed to free picture of window {:#x}: {}", window, e);
            }
        }
        if let Some(picture) = self.background.take() {
            released("background picture", picture, self.conn.render_free_picture(picture));
        }
        self.free_buffer();
        let overlay = self.overlay_picture;
        released("overlay picture", overlay, self.conn.render_free_picture(overlay));
    }
}

/// `0xRRGGBB` to a 16-bit per channel opaque color
fn rgb_to_color(rgb: u32) -> Color {
    let channel = |shift: u32| ((rgb >> shift) & 0xff) as u16 * 0x101;
    Color {
        red: channel(16),
        green: channel(8),
        blue: channel(0),
        alpha: OPAQUE,
    }
}
