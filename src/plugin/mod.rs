//! Effect plugins
//!
//! Plugins are kept in registration order and never reordered. A plugin hook
//! runs only when the plugin is both enabled (its requirements were met at
//! startup) and activated (switched on, possibly later over D-Bus). Every
//! eligible plugin sees every hook; none can stop the others.

pub mod opacity;

use std::rc::Rc;

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, info, warn};
use x11rb::protocol::Event;

use crate::atoms::Atoms;
use crate::compositor::damage::DamagedRegion;
use crate::compositor::registry::Registry;
use crate::compositor::window::Window;
use crate::display::{Extensions, Screen};
use crate::server::{RequestError, WindowId, XServer};

bitflags! {
    /// Events a plugin wants to be told about
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventKinds: u32 {
        const DAMAGE              = 1 << 0;
        const RANDR_SCREEN_CHANGE = 1 << 1;
        const KEY_PRESS           = 1 << 2;
        const KEY_RELEASE         = 1 << 3;
        const MAPPING             = 1 << 4;
        const BUTTON_RELEASE      = 1 << 5;
        const MOTION              = 1 << 6;
        const CIRCULATE           = 1 << 7;
        const CONFIGURE           = 1 << 8;
        const CREATE              = 1 << 9;
        const DESTROY             = 1 << 10;
        const MAP                 = 1 << 11;
        const REPARENT            = 1 << 12;
        const UNMAP               = 1 << 13;
        const PROPERTY            = 1 << 14;
        const SHAPE               = 1 << 15;
    }
}

impl EventKinds {
    /// Kind of a forwarded event, `None` for events plugins never see
    pub fn of(event: &Event) -> Option<Self> {
        let kind = match event {
            Event::DamageNotify(_) => Self::DAMAGE,
            Event::RandrScreenChangeNotify(_) => Self::RANDR_SCREEN_CHANGE,
            Event::KeyPress(_) => Self::KEY_PRESS,
            Event::KeyRelease(_) => Self::KEY_RELEASE,
            Event::MappingNotify(_) => Self::MAPPING,
            Event::ButtonRelease(_) => Self::BUTTON_RELEASE,
            Event::MotionNotify(_) => Self::MOTION,
            Event::CirculateNotify(_) => Self::CIRCULATE,
            Event::ConfigureNotify(_) => Self::CONFIGURE,
            Event::CreateNotify(_) => Self::CREATE,
            Event::DestroyNotify(_) => Self::DESTROY,
            Event::MapNotify(_) => Self::MAP,
            Event::ReparentNotify(_) => Self::REPARENT,
            Event::UnmapNotify(_) => Self::UNMAP,
            Event::PropertyNotify(_) => Self::PROPERTY,
            Event::ShapeNotify(_) => Self::SHAPE,
            _ => return None,
        };
        Some(kind)
    }
}

/// What a plugin may touch while one of its hooks runs
pub struct PluginContext<'a> {
    pub server: &'a Rc<dyn XServer>,
    pub screen: &'a Screen,
    pub atoms: &'a Atoms,
    pub registry: &'a Registry,
    pub damaged: &'a mut DamagedRegion,
}

// Services for effects showing windows that are not on screen, none of the
// bundled plugins needs them
#[allow(dead_code)]
impl PluginContext<'_> {
    /// Map a hidden window behind the window manager's back
    ///
    /// The window turns override-redirect first so that no window manager
    /// decorates or places it. Its pixmap is named once the MapNotify
    /// arrives, as for any window. Returns false when there was nothing to
    /// do. Undo with [`PluginContext::hide_window_again`] once done.
    pub fn show_hidden_window(&self, window: &Window) -> Result<bool, RequestError> {
        let Some(attributes) = window.attributes else {
            return Ok(false);
        };
        if attributes.is_viewable() {
            return Ok(false);
        }

        debug!("Mapping hidden window {:#x} for its contents", window.id);
        if !attributes.override_redirect {
            self.server.set_override_redirect(window.id, true)?;
        }
        self.server.map_window(window.id)?;
        self.server.flush()?;
        Ok(true)
    }

    /// Restore a window shown with [`PluginContext::show_hidden_window`]
    pub fn hide_window_again(&self, window: WindowId) -> Result<(), RequestError> {
        self.server.set_override_redirect(window, false)?;
        self.server.unmap_window(window)?;
        self.server.flush()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("no plugin named {0}")]
    UnknownPlugin(String),

    #[error("plugin {0} is not enabled")]
    Disabled(String),

    #[error("plugin {plugin} does not understand {member}")]
    Unsupported { plugin: String, member: String },

    #[error("{0}")]
    Failed(String),
}

/// An effect plugin
///
/// Every hook has a no-op default: not overriding a hook is the same as not
/// providing it.
pub trait Plugin {
    fn name(&self) -> &'static str;

    /// Whether the plugin runs as soon as its requirements are met
    fn activated_by_default(&self) -> bool {
        true
    }

    /// Events routed to [`Plugin::handle_event`]
    fn events(&self) -> EventKinds {
        EventKinds::empty()
    }

    /// Called once at startup, the plugin stays disabled when it returns false
    fn check_requirements(&mut self, _extensions: &Extensions) -> bool {
        true
    }

    fn handle_event(
        &mut self,
        _event: &Event,
        _window: Option<&Window>,
        _ctx: &mut PluginContext<'_>,
    ) {
    }

    /// Windows found on startup, once all of them are managed
    fn manage_existing(&mut self, _windows: &[WindowId], _ctx: &mut PluginContext<'_>) {}

    /// Opacity of a window, `None` to leave the decision to others
    fn window_opacity(&self, _window: &Window) -> Option<u16> {
        None
    }

    /// Before the repaint decision, may still add damage
    fn pre_paint(&mut self, _ctx: &mut PluginContext<'_>) {}

    fn post_paint(&mut self, _ctx: &mut PluginContext<'_>) {}

    /// Control message, `None` when the member is not understood
    fn control_message(
        &mut self,
        _member: &str,
        _args: &[String],
        _ctx: &mut PluginContext<'_>,
    ) -> Option<Result<String, ControlError>> {
        None
    }
}

/// Built-in plugin by name
pub fn builtin(name: &str) -> Option<Box<dyn Plugin>> {
    match name {
        "opacity" => Some(Box::new(opacity::OpacityPlugin::new())),
        _ => None,
    }
}

pub struct PluginEntry {
    plugin: Box<dyn Plugin>,
    enabled: bool,
    activated: bool,
}

impl PluginEntry {
    pub fn name(&self) -> &'static str {
        self.plugin.name()
    }

    fn runs(&self) -> bool {
        self.enabled && self.activated
    }
}

#[derive(Default)]
pub struct Plugins {
    entries: Vec<PluginEntry>,
}

impl Plugins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in plugins in the given order, unknown names are skipped
    pub fn load(names: &[String]) -> Self {
        let mut plugins = Self::new();
        for name in names {
            match builtin(name) {
                Some(plugin) => plugins.register(plugin),
                None => warn!("Unknown plugin {:?}, ignored", name),
            }
        }
        plugins
    }

    /// Append a plugin, disabled until its requirements are checked
    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        debug!("Registered plugin {}", plugin.name());
        let activated = plugin.activated_by_default();
        self.entries.push(PluginEntry {
            plugin,
            enabled: false,
            activated,
        });
    }

    pub fn check_requirements(&mut self, extensions: &Extensions) {
        for entry in &mut self.entries {
            entry.enabled = entry.plugin.check_requirements(extensions);
            if entry.enabled {
                info!(
                    "Plugin {} enabled ({})",
                    entry.name(),
                    if entry.activated { "active" } else { "inactive" }
                );
            } else {
                warn!("Plugin {} requirements not met, disabled", entry.name());
            }
        }
    }

    fn running(&mut self) -> impl Iterator<Item = &mut PluginEntry> {
        self.entries.iter_mut().filter(|entry| entry.runs())
    }

    pub fn dispatch_event(
        &mut self,
        event: &Event,
        window: Option<WindowId>,
        ctx: &mut PluginContext<'_>,
    ) {
        let Some(kind) = EventKinds::of(event) else {
            return;
        };

        let registry = ctx.registry;
        let window = window.and_then(|id| registry.get(id));

        for entry in self.running() {
            if entry.plugin.events().contains(kind) {
                entry.plugin.handle_event(event, window, ctx);
            }
        }
    }

    pub fn manage_existing(&mut self, windows: &[WindowId], ctx: &mut PluginContext<'_>) {
        for entry in self.running() {
            entry.plugin.manage_existing(windows, ctx);
        }
    }

    /// Opacity answered by the first plugin that knows
    pub fn window_opacity(&self, window: &Window) -> Option<u16> {
        self.entries
            .iter()
            .filter(|entry| entry.runs())
            .find_map(|entry| entry.plugin.window_opacity(window))
    }

    pub fn pre_paint(&mut self, ctx: &mut PluginContext<'_>) {
        for entry in self.running() {
            entry.plugin.pre_paint(ctx);
        }
    }

    pub fn post_paint(&mut self, ctx: &mut PluginContext<'_>) {
        for entry in self.running() {
            entry.plugin.post_paint(ctx);
        }
    }

    /// Handle a control message for `plugin`
    ///
    /// `Activate` and `Deactivate` toggle the plugin, anything else goes to
    /// its message hook.
    pub fn control(
        &mut self,
        plugin: &str,
        member: &str,
        args: &[String],
        ctx: &mut PluginContext<'_>,
    ) -> Result<String, ControlError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.name() == plugin)
            .ok_or_else(|| ControlError::UnknownPlugin(plugin.to_string()))?;

        if !entry.enabled {
            return Err(ControlError::Disabled(plugin.to_string()));
        }

        match member {
            "Activate" => {
                entry.activated = true;
                info!("Plugin {} activated", plugin);
                Ok("activated".to_string())
            }
            "Deactivate" => {
                entry.activated = false;
                info!("Plugin {} deactivated", plugin);
                Ok("deactivated".to_string())
            }
            _ => entry
                .plugin
                .control_message(member, args, ctx)
                .unwrap_or_else(|| {
                    Err(ControlError::Unsupported {
                        plugin: plugin.to_string(),
                        member: member.to_string(),
                    })
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::WindowGeometry;
    use crate::testing::{Call, FakeServer, Harness, Hook, RecordingPlugin};
    use x11rb::protocol::xproto::DestroyNotifyEvent;

    fn destroy(window: WindowId) -> Event {
        Event::DestroyNotify(DestroyNotifyEvent {
            response_type: 17,
            sequence: 0,
            event: window,
            window,
        })
    }

    #[test]
    fn test_disabled_plugin_never_runs() {
        let mut harness = Harness::new();
        let (plugin, log) = RecordingPlugin::new("broken", EventKinds::all());
        let mut plugins = Plugins::new();
        plugins.register(Box::new(plugin.failing_requirements()));
        plugins.check_requirements(&Extensions::default());

        let window = Window::new(1);
        harness.with_context(|ctx| {
            plugins.dispatch_event(&destroy(1), Some(1), ctx);
            plugins.manage_existing(&[1], ctx);
            plugins.pre_paint(ctx);
            plugins.post_paint(ctx);
            assert_eq!(
                plugins.control("broken", "Activate", &[], ctx),
                Err(ControlError::Disabled("broken".into()))
            );
        });
        assert_eq!(plugins.window_opacity(&window), None);

        assert_eq!(log.borrow().as_slice(), &[Hook::CheckRequirements("broken")]);
    }

    #[test]
    fn test_registration_order_without_short_circuit() {
        let mut harness = Harness::new();
        let (first, log) = RecordingPlugin::new("first", EventKinds::DESTROY);
        let second = RecordingPlugin::with_log("second", EventKinds::DESTROY, log.clone());
        let third = RecordingPlugin::with_log("third", EventKinds::MAP, log.clone());

        let mut plugins = Plugins::new();
        plugins.register(Box::new(first));
        plugins.register(Box::new(second));
        plugins.register(Box::new(third));
        plugins.check_requirements(&Extensions::default());
        log.borrow_mut().clear();

        harness.with_context(|ctx| plugins.dispatch_event(&destroy(7), Some(7), ctx));

        assert_eq!(
            log.borrow().as_slice(),
            &[Hook::Event("first", EventKinds::DESTROY), Hook::Event("second", EventKinds::DESTROY)]
        );
    }

    #[test]
    fn test_deactivated_plugin_is_skipped_until_activated() {
        let mut harness = Harness::new();
        let (plugin, log) = RecordingPlugin::new("fade", EventKinds::DESTROY);
        let mut plugins = Plugins::new();
        plugins.register(Box::new(plugin.inactive()));
        plugins.check_requirements(&Extensions::default());
        log.borrow_mut().clear();

        harness.with_context(|ctx| {
            plugins.dispatch_event(&destroy(1), None, ctx);
            assert!(log.borrow().is_empty());

            assert_eq!(plugins.control("fade", "Activate", &[], ctx), Ok("activated".into()));
            plugins.dispatch_event(&destroy(1), None, ctx);
        });

        assert_eq!(log.borrow().as_slice(), &[Hook::Event("fade", EventKinds::DESTROY)]);
    }

    #[test]
    fn test_control_routing() {
        let mut harness = Harness::new();
        let (plugin, log) = RecordingPlugin::new("echo", EventKinds::empty());
        let mut plugins = Plugins::new();
        plugins.register(Box::new(plugin));
        plugins.check_requirements(&Extensions::default());

        harness.with_context(|ctx| {
            assert_eq!(
                plugins.control("echo", "Echo", &["hi".into()], ctx),
                Ok("hi".into())
            );
            assert_eq!(
                plugins.control("echo", "Bogus", &[], ctx),
                Err(ControlError::Unsupported {
                    plugin: "echo".into(),
                    member: "Bogus".into()
                })
            );
            assert_eq!(
                plugins.control("nope", "Activate", &[], ctx),
                Err(ControlError::UnknownPlugin("nope".into()))
            );
        });

        assert!(log.borrow().contains(&Hook::Control("echo", "Echo".into())));
    }

    #[test]
    fn test_first_opacity_answer_wins() {
        let (quiet, _) = RecordingPlugin::new("quiet", EventKinds::empty());
        let (half, _) = RecordingPlugin::new("half", EventKinds::empty());
        let (full, _) = RecordingPlugin::new("full", EventKinds::empty());

        let mut plugins = Plugins::new();
        plugins.register(Box::new(quiet));
        plugins.register(Box::new(half.with_opacity(0x8000)));
        plugins.register(Box::new(full.with_opacity(0xffff)));
        plugins.check_requirements(&Extensions::default());

        assert_eq!(plugins.window_opacity(&Window::new(1)), Some(0x8000));
    }

    #[test]
    fn test_load_skips_unknown() {
        let plugins = Plugins::load(&["opacity".into(), "wobbly".into()]);
        let names: Vec<_> = plugins.entries.iter().map(PluginEntry::name).collect();
        assert_eq!(names, vec!["opacity"]);
        assert!(!plugins.entries[0].enabled);
    }

    #[test]
    fn test_hidden_window_shown_and_restored() {
        let mut harness = Harness::new();
        harness.manage(7, WindowGeometry::new(0, 0, 10, 10, 0));
        harness.registry.get_mut(7).unwrap().attributes = Some(FakeServer::unmapped());
        harness.fake.clear_calls();

        let shown = harness.with_context(|ctx| {
            let window = ctx.registry.get(7).unwrap();
            ctx.show_hidden_window(window).unwrap()
        });
        assert!(shown);
        assert_eq!(
            harness.fake.calls(),
            vec![Call::SetOverrideRedirect(7, true), Call::MapWindow(7), Call::Flush]
        );
        let attributes = harness.fake.attributes(7).unwrap();
        assert!(attributes.is_viewable() && attributes.override_redirect);

        harness.fake.clear_calls();
        harness.with_context(|ctx| ctx.hide_window_again(7)).unwrap();
        assert_eq!(
            harness.fake.calls(),
            vec![Call::SetOverrideRedirect(7, false), Call::UnmapWindow(7), Call::Flush]
        );
        let attributes = harness.fake.attributes(7).unwrap();
        assert!(!attributes.is_viewable() && !attributes.override_redirect);
    }

    #[test]
    fn test_visible_window_is_not_shown_again() {
        let mut harness = Harness::new();
        harness.manage(7, WindowGeometry::new(0, 0, 10, 10, 0));
        harness.fake.clear_calls();

        let shown = harness.with_context(|ctx| {
            let window = ctx.registry.get(7).unwrap();
            ctx.show_hidden_window(window).unwrap()
        });

        assert!(!shown);
        assert!(harness.fake.calls().is_empty());
    }
}
