//! Interned atoms

use anyhow::{Context, Result};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{Atom, ConnectionExt as _};

/// Atoms the compositor reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Atoms {
    pub net_wm_window_opacity: Atom,
    pub net_wm_name: Atom,
    pub utf8_string: Atom,
    /// Root background pixmap, set by most wallpaper setters
    pub xrootpmap_id: Atom,
    /// Root background pixmap, set by xsetroot
    pub xsetroot_id: Atom,
    /// `_NET_WM_CM_Sn` for the managed screen
    pub net_wm_cm: Atom,
}

impl Atoms {
    /// Intern every atom in a single round-trip batch
    pub fn new<C: Connection>(conn: &C, screen_num: usize) -> Result<Self> {
        let cm_selection = format!("_NET_WM_CM_S{}", screen_num);
        let names: [&str; 6] = [
            "_NET_WM_WINDOW_OPACITY",
            "_NET_WM_NAME",
            "UTF8_STRING",
            "_XROOTPMAP_ID",
            "_XSETROOT_ID",
            &cm_selection,
        ];

        let cookies = names
            .iter()
            .map(|name| conn.intern_atom(false, name.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut atoms = [0; 6];
        for ((atom, cookie), name) in atoms.iter_mut().zip(cookies).zip(names) {
            *atom = cookie
                .reply()
                .with_context(|| format!("Failed to intern {}", name))?
                .atom;
        }

        let [
            net_wm_window_opacity,
            net_wm_name,
            utf8_string,
            xrootpmap_id,
            xsetroot_id,
            net_wm_cm,
        ] = atoms;

        Ok(Self {
            net_wm_window_opacity,
            net_wm_name,
            utf8_string,
            xrootpmap_id,
            xsetroot_id,
            net_wm_cm,
        })
    }

    /// Properties holding the root background pixmap, in lookup order
    pub fn background_properties(&self) -> [Atom; 2] {
        [self.xrootpmap_id, self.xsetroot_id]
    }
}
