//! Display and session bootstrap
//!
//! Connects to the X server, negotiates extensions, claims the
//! `_NET_WM_CM_Sn` selection, redirects the root children and gathers the
//! screen facts (refresh interval, outputs) the repaint loop relies on.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::Event;
use x11rb::protocol::composite::{self, ConnectionExt as CompositeExt, Redirect};
use x11rb::protocol::damage::{self, ConnectionExt as DamageExt};
use x11rb::protocol::randr::{self, ConnectionExt as RandrExt, NotifyMask};
use x11rb::protocol::shape::{self, ConnectionExt as ShapeExt, SK, SO};
use x11rb::protocol::xfixes::{self, ConnectionExt as XFixesExt};
use x11rb::protocol::xproto::{
    ChangeWindowAttributesAux, ClipOrdering, ConnectionExt as XprotoExt, CreateWindowAux,
    EventMask, PropMode, Timestamp, Visualid, WindowClass,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as WrapperExt;
use x11rb::{COPY_DEPTH_FROM_PARENT, COPY_FROM_PARENT, NONE};

use crate::atoms::Atoms;
use crate::server::WindowId;

/// Repaint interval when the refresh rate is unknown (50 Hz)
pub const DEFAULT_REPAINT_INTERVAL: Duration = Duration::from_millis(20);

/// Shortest repaint interval accepted (200 Hz)
pub const MINIMUM_REPAINT_INTERVAL: Duration = Duration::from_millis(5);

/// Static facts about the managed screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Screen {
    pub num: usize,
    pub root: WindowId,
    pub root_visual: Visualid,
    pub root_depth: u8,
    pub width: u16,
    pub height: u16,
}

impl Screen {
    pub fn from_setup(conn: &RustConnection, num: usize) -> Result<Self> {
        let screen = conn
            .setup()
            .roots
            .get(num)
            .with_context(|| format!("Screen {} does not exist", num))?;

        Ok(Self {
            num,
            root: screen.root,
            root_visual: screen.root_visual,
            root_depth: screen.root_depth,
            width: screen.width_in_pixels,
            height: screen.height_in_pixels,
        })
    }
}

/// Negotiated extension versions, `None` when unavailable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extensions {
    pub composite: Option<(u32, u32)>,
    pub xfixes: Option<(u32, u32)>,
    pub damage: Option<(u32, u32)>,
    pub randr: Option<(u32, u32)>,
    pub shape: Option<(u32, u32)>,
}

impl Extensions {
    pub fn has_randr(&self) -> bool {
        self.randr.is_some()
    }

    pub fn has_shape(&self) -> bool {
        self.shape.is_some()
    }

    /// Fail unless the mandatory extensions are recent enough
    pub fn check_required(&self) -> Result<()> {
        match self.composite {
            None => bail!("No Composite extension"),
            // NameWindowPixmap appeared in 0.2
            Some(version) if version < (0, 2) => bail!("Need Composite extension 0.2 at least"),
            _ => {}
        }

        match self.xfixes {
            None => bail!("No XFixes extension"),
            // Region objects appeared in 2.0
            Some((major, _)) if major < 2 => bail!("Need XFixes extension 2.0 at least"),
            _ => {}
        }

        if self.damage.is_none() {
            bail!("No Damage extension");
        }

        Ok(())
    }
}

/// RandR is only useful from 1.1 on (refresh rates)
fn randr_usable(version: (u32, u32)) -> bool {
    version >= (1, 1)
}

/// One monitor area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
}

/// Screen facts that may change at runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenFacts {
    pub refresh_interval: Duration,
    pub outputs: Vec<Output>,
}

impl ScreenFacts {
    /// Defaults used without RandR
    pub fn fallback(screen: &Screen) -> Self {
        Self {
            refresh_interval: refresh_interval(None),
            outputs: outputs_or_screen(Vec::new(), screen),
        }
    }
}

/// Repaint interval for a refresh rate in Hz
pub fn refresh_interval(rate: Option<u16>) -> Duration {
    let Some(rate) = rate.filter(|&rate| rate > 0) else {
        warn!(
            "Could not get screen refresh rate with RandR, using {} Hz",
            1000 / DEFAULT_REPAINT_INTERVAL.as_millis()
        );
        return DEFAULT_REPAINT_INTERVAL;
    };

    let interval = Duration::from_secs_f64(1.0 / rate as f64);
    if interval < MINIMUM_REPAINT_INTERVAL {
        warn!("Got refresh rate {} Hz, capping to 200 Hz", rate);
        return MINIMUM_REPAINT_INTERVAL;
    }

    debug!("Refresh interval {:?} ({} Hz)", interval, rate);
    interval
}

/// Active CRTC areas, or the whole screen when none is known
pub fn outputs_or_screen(outputs: Vec<Output>, screen: &Screen) -> Vec<Output> {
    if !outputs.is_empty() {
        return outputs;
    }

    warn!("Could not get CRTC sizes with RandR, assuming root window size");
    vec![Output {
        x: 0,
        y: 0,
        width: screen.width,
        height: screen.height,
    }]
}

/// A bootstrapped compositing session
pub struct Session {
    pub conn: Arc<RustConnection>,
    pub screen: Screen,
    pub extensions: Extensions,
    pub atoms: Atoms,
    /// Window holding the `_NET_WM_CM_Sn` selection
    pub cm_window: WindowId,
    /// Composite overlay window painted into
    pub overlay: WindowId,
}

impl Session {
    /// Connect and become the compositing manager of the default screen
    pub fn connect(replace: bool) -> Result<Self> {
        let (conn, screen_num) = x11rb::connect(None).context("Failed to connect to X server")?;
        let conn = Arc::new(conn);
        let screen = Screen::from_setup(&conn, screen_num)?;

        info!(
            "Connected to X server, screen {}, root {:#x}, {}x{}",
            screen_num, screen.root, screen.width, screen.height
        );

        let extensions = negotiate_extensions(&conn)?;
        extensions.check_required()?;

        let atoms = Atoms::new(conn.as_ref(), screen_num)?;
        let cm_window = acquire_cm_selection(&conn, &screen, &atoms, replace)?;
        let overlay = create_overlay(&conn, &screen, &extensions)?;

        Ok(Self {
            conn,
            screen,
            extensions,
            atoms,
            cm_window,
            overlay,
        })
    }

    /// Redirect every child of the root and listen to its structure changes
    pub fn redirect(&self) -> Result<()> {
        let root = self.screen.root;

        self.conn
            .composite_redirect_subwindows(root, Redirect::MANUAL)?;

        let mask = EventMask::SUBSTRUCTURE_NOTIFY
            | EventMask::STRUCTURE_NOTIFY
            | EventMask::PROPERTY_CHANGE;
        self.conn
            .change_window_attributes(root, &ChangeWindowAttributesAux::new().event_mask(mask))?;

        if self.extensions.has_randr() {
            self.conn
                .randr_select_input(root, NotifyMask::SCREEN_CHANGE)?;
        }

        self.conn.flush()?;
        info!("Redirected children of root {:#x}", root);
        Ok(())
    }

    /// Refresh interval and output geometries, with documented fallbacks
    pub fn query_screen_facts(&self) -> ScreenFacts {
        if !self.extensions.has_randr() {
            return ScreenFacts::fallback(&self.screen);
        }

        match query_randr(&self.conn, &self.screen) {
            Ok((rate, outputs)) => ScreenFacts {
                refresh_interval: refresh_interval(rate),
                outputs: outputs_or_screen(outputs, &self.screen),
            },
            Err(e) => {
                warn!("RandR query failed: {:#}", e);
                ScreenFacts::fallback(&self.screen)
            }
        }
    }
}

fn negotiate_extensions(conn: &RustConnection) -> Result<Extensions> {
    for name in [
        composite::X11_EXTENSION_NAME,
        xfixes::X11_EXTENSION_NAME,
        damage::X11_EXTENSION_NAME,
        randr::X11_EXTENSION_NAME,
        shape::X11_EXTENSION_NAME,
    ] {
        conn.prefetch_extension_information(name)?;
    }

    let present = |name| -> Result<bool> { Ok(conn.extension_information(name)?.is_some()) };

    // Issue every version query before waiting for any of them
    let composite = present(composite::X11_EXTENSION_NAME)?
        .then(|| conn.composite_query_version(0, 4))
        .transpose()?;
    let xfixes = present(xfixes::X11_EXTENSION_NAME)?
        .then(|| conn.xfixes_query_version(5, 0))
        .transpose()?;
    let damage = present(damage::X11_EXTENSION_NAME)?
        .then(|| conn.damage_query_version(1, 1))
        .transpose()?;
    let randr = present(randr::X11_EXTENSION_NAME)?
        .then(|| conn.randr_query_version(1, 5))
        .transpose()?;
    let shape = present(shape::X11_EXTENSION_NAME)?
        .then(|| conn.shape_query_version())
        .transpose()?;

    let extensions = Extensions {
        composite: negotiated("Composite", composite.map(|c| c.reply()))
            .map(|r| (r.major_version, r.minor_version)),
        xfixes: negotiated("XFixes", xfixes.map(|c| c.reply()))
            .map(|r| (r.major_version, r.minor_version)),
        damage: negotiated("Damage", damage.map(|c| c.reply()))
            .map(|r| (r.major_version, r.minor_version)),
        randr: negotiated("RandR", randr.map(|c| c.reply()))
            .map(|r| (r.major_version, r.minor_version))
            .filter(|&version| randr_usable(version)),
        shape: negotiated("Shape", shape.map(|c| c.reply()))
            .map(|r| (r.major_version as u32, r.minor_version as u32)),
    };

    info!("Extensions: {:?}", extensions);
    if !extensions.has_randr() {
        warn!("RandR 1.1 not available, refresh rate and outputs will use defaults");
    }
    Ok(extensions)
}

/// QueryVersion reply of a present extension
///
/// A failed query leaves the extension unusable, the reason is logged here.
fn negotiated<R, E: fmt::Display>(name: &str, reply: Option<Result<R, E>>) -> Option<R> {
    match reply? {
        Ok(reply) => Some(reply),
        Err(e) => {
            warn!("{} version query failed, treating it as missing: {}", name, e);
            None
        }
    }
}

/// Claim `_NET_WM_CM_Sn` with a dedicated override-redirect window
fn acquire_cm_selection(
    conn: &RustConnection,
    screen: &Screen,
    atoms: &Atoms,
    replace: bool,
) -> Result<WindowId> {
    let owner = conn
        .get_selection_owner(atoms.net_wm_cm)?
        .reply()
        .context("Failed to get compositing manager selection owner")?
        .owner;

    if owner != NONE {
        if !replace {
            bail!(
                "Another compositing manager is already running (window {:#x}). \
                 Use --replace to replace it.",
                owner
            );
        }
        info!("Replacing compositing manager (window {:#x})", owner);
    }

    let window = conn.generate_id()?;
    conn.create_window(
        COPY_DEPTH_FROM_PARENT,
        window,
        screen.root,
        0,
        0,
        1,
        1,
        0,
        WindowClass::COPY_FROM_PARENT,
        COPY_FROM_PARENT,
        &CreateWindowAux::new()
            .override_redirect(1)
            .event_mask(EventMask::PROPERTY_CHANGE),
    )?;

    // The PropertyNotify for the name gives a server timestamp for the selection
    conn.change_property8(
        PropMode::REPLACE,
        window,
        atoms.net_wm_name,
        atoms.utf8_string,
        env!("CARGO_PKG_NAME").as_bytes(),
    )?;
    conn.flush()?;

    let time = wait_for_property_time(conn, window)?;
    conn.set_selection_owner(window, atoms.net_wm_cm, time)?;

    let owner = conn
        .get_selection_owner(atoms.net_wm_cm)?
        .reply()
        .context("Failed to verify compositing manager selection")?
        .owner;
    if owner != window {
        bail!(
            "Could not acquire compositing manager ownership (owner is {:#x})",
            owner
        );
    }

    info!("Compositing manager selection acquired by window {:#x}", window);
    Ok(window)
}

fn wait_for_property_time(conn: &RustConnection, window: WindowId) -> Result<Timestamp> {
    loop {
        match conn.wait_for_event()? {
            Event::PropertyNotify(e) if e.window == window => return Ok(e.time),
            Event::Error(e) => debug!("Error during bootstrap: {:?}", e),
            other => debug!("Ignoring event during bootstrap: {:?}", other),
        }
    }
}

/// Overlay window, made transparent to input
fn create_overlay(
    conn: &RustConnection,
    screen: &Screen,
    extensions: &Extensions,
) -> Result<WindowId> {
    let overlay = conn
        .composite_get_overlay_window(screen.root)?
        .reply()
        .context("Failed to get Composite overlay window")?
        .overlay_win;

    if extensions.shape.is_some_and(|version| version >= (1, 1)) {
        conn.shape_rectangles(SO::SET, SK::INPUT, ClipOrdering::UNSORTED, overlay, 0, 0, &[])?;
    } else {
        warn!("Shape 1.1 not available, overlay window will intercept input");
    }

    info!("Using Composite overlay window {:#x}", overlay);
    Ok(overlay)
}

/// Refresh rate and active CRTCs, all CRTC queries in flight at once
fn query_randr(conn: &RustConnection, screen: &Screen) -> Result<(Option<u16>, Vec<Output>)> {
    let info = conn.randr_get_screen_info(screen.root)?;
    let resources = conn.randr_get_screen_resources(screen.root)?;

    let rate = info.reply().ok().map(|reply| reply.rate);
    let resources = resources
        .reply()
        .context("Failed to get RandR screen resources")?;

    let cookies = resources
        .crtcs
        .iter()
        .map(|&crtc| conn.randr_get_crtc_info(crtc, resources.config_timestamp))
        .collect::<Result<Vec<_>, _>>()?;

    let mut outputs = Vec::new();
    for (index, cookie) in cookies.into_iter().enumerate() {
        match cookie.reply() {
            Ok(crtc) if crtc.mode != NONE => {
                debug!("CRTC {}: {}x{} +{} +{}", index, crtc.width, crtc.height, crtc.x, crtc.y);
                outputs.push(Output {
                    x: crtc.x,
                    y: crtc.y,
                    width: crtc.width,
                    height: crtc.height,
                });
            }
            Ok(_) => {}
            Err(e) => warn!("Could not get CRTC {} information with RandR: {}", index, e),
        }
    }

    Ok((rate, outputs))
}
