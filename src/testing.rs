//! In-memory X server and recording doubles for unit tests

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use x11rb::errors::ConnectionError;
use x11rb::protocol::Event;
use x11rb::protocol::xproto::{EventMask, MapState, Rectangle, WindowClass};

use crate::atoms::Atoms;
use crate::compositor::Compositor;
use crate::compositor::damage::DamagedRegion;
use crate::compositor::registry::Registry;
use crate::compositor::renderer::RenderBackend;
use crate::compositor::window::Window;
use crate::display::{Extensions, Screen};
use crate::plugin::{ControlError, EventKinds, Plugin, PluginContext, Plugins};
use crate::server::{
    AtomId, DamageId, Pending, PixmapId, RegionId, Reply, ReplyKind, RequestError, Sequence,
    WindowAttributes, WindowGeometry, WindowId, XServer,
};
use crate::vsync::FrameClock;

pub const ROOT: WindowId = 0x100;
pub const SCREEN_WIDTH: u16 = 800;
pub const SCREEN_HEIGHT: u16 = 600;

pub fn screen() -> Screen {
    Screen {
        num: 0,
        root: ROOT,
        root_visual: 0x21,
        root_depth: 24,
        width: SCREEN_WIDTH,
        height: SCREEN_HEIGHT,
    }
}

pub fn atoms() -> Atoms {
    Atoms {
        net_wm_window_opacity: 0x1001,
        net_wm_name: 0x1002,
        utf8_string: 0x1003,
        xrootpmap_id: 0x1004,
        xsetroot_id: 0x1005,
        net_wm_cm: 0x1006,
    }
}

pub fn rect(x: i16, y: i16, width: u16, height: u16) -> Rectangle {
    Rectangle {
        x,
        y,
        width,
        height,
    }
}

/// Everything observable done through the fakes, in issue order
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    GetWindowAttributes(WindowId),
    GetGeometry(WindowId),
    QueryTree(WindowId),
    FetchRegion(RegionId),
    GetProperty(WindowId, AtomId),
    CreateDamage(DamageId, WindowId),
    NameWindowPixmap(WindowId, PixmapId),
    FreePixmap(PixmapId),
    DestroyDamage(DamageId),
    SubtractDamage(DamageId),
    CreateRegion(RegionId),
    CreateRegionFromWindow(RegionId, WindowId),
    TranslateRegion(RegionId, i16, i16),
    CopyRegion(RegionId, RegionId),
    UnionRegion(RegionId, RegionId, RegionId),
    DestroyRegion(RegionId),
    SelectInput(WindowId, EventMask),
    SelectShapeInput(WindowId, bool),
    SetOverrideRedirect(WindowId, bool),
    MapWindow(WindowId),
    UnmapWindow(WindowId),
    Flush,
    Sync,

    PaintBackground(Option<RegionId>),
    PaintWindow(WindowId, u16),
    /// Painted through the clip region of a shaped window
    PaintClip(WindowId, RegionId),
    PaintAll(Option<RegionId>),
    FreeWindow(WindowId),
    FreeWindowPixmap(WindowId),
    BackgroundChanged,
    ScreenResized(u16, u16),

    WaitForFrame,
}

type Journal = Rc<RefCell<Vec<Call>>>;
type FakeReply = Result<Reply, (&'static str, u32)>;

#[derive(Default)]
struct State {
    next_sequence: Sequence,
    next_id: u32,
    windows: HashMap<WindowId, (WindowAttributes, WindowGeometry)>,
    /// Children of the root as QueryTree reports them, bottom-most first
    children: Vec<WindowId>,
    shapes: HashMap<WindowId, Vec<Rectangle>>,
    properties: HashMap<(WindowId, AtomId), u32>,
    regions: HashMap<RegionId, Vec<Rectangle>>,
    pixmaps: HashSet<PixmapId>,
    replies: HashMap<Sequence, (Call, FakeReply)>,
    /// Requests whose reply was collected, with the journal length at that time
    waited: Vec<(Call, usize)>,
    failing_damage: HashSet<WindowId>,
    broken: bool,
}

/// X server answering from an in-memory window table
///
/// Replies are computed when the request is issued, like a real server
/// processing requests in order.
pub struct FakeServer {
    state: RefCell<State>,
    journal: Journal,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_id: 0x20_0000,
                ..Default::default()
            }),
            journal: Rc::default(),
        }
    }

    /// The fake together with the trait object the code under test holds
    pub fn shared() -> (Rc<FakeServer>, Rc<dyn XServer>) {
        let fake = Rc::new(Self::new());
        let server: Rc<dyn XServer> = fake.clone();
        (fake, server)
    }

    pub fn viewable() -> WindowAttributes {
        WindowAttributes {
            map_state: MapState::VIEWABLE,
            class: WindowClass::INPUT_OUTPUT,
            override_redirect: false,
            visual: 0x21,
        }
    }

    pub fn unmapped() -> WindowAttributes {
        Self::viewable().with_map_state(MapState::UNMAPPED)
    }

    /// A root child, stacked on top of the existing ones
    pub fn add_window(&self, id: WindowId, attributes: WindowAttributes, geometry: WindowGeometry) {
        let mut state = self.state.borrow_mut();
        state.windows.insert(id, (attributes, geometry));
        if !state.children.contains(&id) {
            state.children.push(id);
        }
    }

    /// The window is gone but QueryTree still lists it
    pub fn vanish_window(&self, id: WindowId) {
        self.state.borrow_mut().windows.remove(&id);
    }

    pub fn set_shape(&self, id: WindowId, rectangles: Vec<Rectangle>) {
        self.state.borrow_mut().shapes.insert(id, rectangles);
    }

    pub fn set_property(&self, id: WindowId, atom: AtomId, value: u32) {
        self.state.borrow_mut().properties.insert((id, atom), value);
    }

    /// CreateDamage on `id` fails from now on
    pub fn fail_damage(&self, id: WindowId) {
        self.state.borrow_mut().failing_damage.insert(id);
    }

    /// Every request fails as on a closed connection, replies included
    pub fn set_broken(&self, broken: bool) {
        self.state.borrow_mut().broken = broken;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.journal.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.journal.borrow_mut().clear();
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.journal.borrow().iter().filter(|call| predicate(call)).count()
    }

    pub fn region_exists(&self, id: RegionId) -> bool {
        self.state.borrow().regions.contains_key(&id)
    }

    pub fn region_rects(&self, id: RegionId) -> Vec<Rectangle> {
        self.state.borrow().regions.get(&id).cloned().unwrap_or_default()
    }

    pub fn live_regions(&self) -> usize {
        self.state.borrow().regions.len()
    }

    pub fn pixmap_exists(&self, id: PixmapId) -> bool {
        self.state.borrow().pixmaps.contains(&id)
    }

    pub fn attributes(&self, id: WindowId) -> Option<WindowAttributes> {
        self.state.borrow().windows.get(&id).map(|(attributes, _)| *attributes)
    }

    /// Round-trip requests in the order their replies were collected
    ///
    /// Each comes with the number of calls journaled when it was collected.
    pub fn waited(&self) -> Vec<(Call, usize)> {
        self.state.borrow().waited.clone()
    }

    /// Replies issued and neither collected nor discarded
    pub fn outstanding_replies(&self) -> usize {
        self.state.borrow().replies.len()
    }

    fn record(&self, call: Call) {
        self.journal.borrow_mut().push(call);
    }

    fn is_broken(&self) -> bool {
        self.state.borrow().broken
    }

    fn one_way(&self, call: Call) -> Result<(), RequestError> {
        if self.is_broken() {
            return Err(ConnectionError::UnknownError.into());
        }
        self.record(call);
        Ok(())
    }

    fn begin<T: crate::server::FromReply>(&self, call: Call, reply: FakeReply) -> Pending<T> {
        if self.is_broken() {
            return Pending::unsent();
        }
        self.record(call.clone());

        let mut state = self.state.borrow_mut();
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.replies.insert(sequence, (call, reply));
        Pending::sent(sequence)
    }

    fn update_attributes(&self, id: WindowId, f: impl FnOnce(&mut WindowAttributes)) {
        if let Some((attributes, _)) = self.state.borrow_mut().windows.get_mut(&id) {
            f(attributes);
        }
    }

    fn window(
        &self,
        id: WindowId,
    ) -> Result<(WindowAttributes, WindowGeometry), (&'static str, u32)> {
        self.state
            .borrow()
            .windows
            .get(&id)
            .copied()
            .ok_or(("Window", id))
    }
}

impl XServer for FakeServer {
    fn generate_id(&self) -> Result<u32, RequestError> {
        if self.is_broken() {
            return Err(ConnectionError::UnknownError.into());
        }
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        Ok(state.next_id)
    }

    fn wait_for_reply(&self, sequence: Sequence, _kind: ReplyKind) -> Result<Reply, RequestError> {
        let journaled = self.journal.borrow().len();
        let mut state = self.state.borrow_mut();
        let Some((call, reply)) = state.replies.remove(&sequence) else {
            return Err(ConnectionError::UnknownError.into());
        };
        state.waited.push((call, journaled));

        if state.broken {
            return Err(ConnectionError::UnknownError.into());
        }
        reply.map_err(|(kind, bad_value)| RequestError::Protocol {
            kind: kind.to_string(),
            bad_value,
        })
    }

    fn discard_reply(&self, sequence: Sequence, _kind: ReplyKind) {
        self.state.borrow_mut().replies.remove(&sequence);
    }

    fn get_window_attributes(&self, window: WindowId) -> Pending<WindowAttributes> {
        let reply = self
            .window(window)
            .map(|(attributes, _)| Reply::WindowAttributes(attributes));
        self.begin(Call::GetWindowAttributes(window), reply)
    }

    fn get_geometry(&self, window: WindowId) -> Pending<WindowGeometry> {
        let reply = self.window(window).map(|(_, geometry)| Reply::Geometry(geometry));
        self.begin(Call::GetGeometry(window), reply)
    }

    fn query_tree(&self, window: WindowId) -> Pending<Vec<WindowId>> {
        let reply = if window == ROOT {
            Ok(Reply::Tree(self.state.borrow().children.clone()))
        } else {
            self.window(window).map(|_| Reply::Tree(Vec::new()))
        };
        self.begin(Call::QueryTree(window), reply)
    }

    fn fetch_region(&self, region: RegionId) -> Pending<Vec<Rectangle>> {
        let reply = self
            .state
            .borrow()
            .regions
            .get(&region)
            .cloned()
            .map(Reply::RegionRectangles)
            .ok_or(("Region", region));
        self.begin(Call::FetchRegion(region), reply)
    }

    fn get_property32(
        &self,
        window: WindowId,
        property: AtomId,
        _type: AtomId,
    ) -> Pending<Option<u32>> {
        let reply = self.window(window).map(|_| {
            Reply::Property32(self.state.borrow().properties.get(&(window, property)).copied())
        });
        self.begin(Call::GetProperty(window, property), reply)
    }

    fn create_damage(&self, damage: DamageId, window: WindowId) -> Pending<()> {
        let reply = match self.window(window) {
            Ok(_) if self.state.borrow().failing_damage.contains(&window) => {
                Err(("Drawable", window))
            }
            Ok(_) => Ok(Reply::Void),
            Err(e) => Err(e),
        };
        self.begin(Call::CreateDamage(damage, window), reply)
    }

    fn name_window_pixmap(&self, window: WindowId, pixmap: PixmapId) -> Result<(), RequestError> {
        self.one_way(Call::NameWindowPixmap(window, pixmap))?;
        self.state.borrow_mut().pixmaps.insert(pixmap);
        Ok(())
    }

    fn free_pixmap(&self, pixmap: PixmapId) -> Result<(), RequestError> {
        self.one_way(Call::FreePixmap(pixmap))?;
        self.state.borrow_mut().pixmaps.remove(&pixmap);
        Ok(())
    }

    fn destroy_damage(&self, damage: DamageId) -> Result<(), RequestError> {
        self.one_way(Call::DestroyDamage(damage))
    }

    fn subtract_damage(&self, damage: DamageId) -> Result<(), RequestError> {
        self.one_way(Call::SubtractDamage(damage))
    }

    fn create_region(
        &self,
        region: RegionId,
        rectangles: &[Rectangle],
    ) -> Result<(), RequestError> {
        self.one_way(Call::CreateRegion(region))?;
        self.state.borrow_mut().regions.insert(region, rectangles.to_vec());
        Ok(())
    }

    fn create_region_from_window(
        &self,
        region: RegionId,
        window: WindowId,
    ) -> Result<(), RequestError> {
        self.one_way(Call::CreateRegionFromWindow(region, window))?;

        let mut state = self.state.borrow_mut();
        let rectangles = match (state.shapes.get(&window), state.windows.get(&window)) {
            (Some(shape), _) => shape.clone(),
            (None, Some((_, geometry))) => {
                let border = geometry.border_width as i16;
                vec![rect(
                    -border,
                    -border,
                    geometry.outer_width() as u16,
                    geometry.outer_height() as u16,
                )]
            }
            (None, None) => Vec::new(),
        };
        state.regions.insert(region, rectangles);
        Ok(())
    }

    fn translate_region(&self, region: RegionId, dx: i16, dy: i16) -> Result<(), RequestError> {
        self.one_way(Call::TranslateRegion(region, dx, dy))?;
        if let Some(rectangles) = self.state.borrow_mut().regions.get_mut(&region) {
            for r in rectangles {
                r.x += dx;
                r.y += dy;
            }
        }
        Ok(())
    }

    fn copy_region(&self, source: RegionId, destination: RegionId) -> Result<(), RequestError> {
        self.one_way(Call::CopyRegion(source, destination))?;
        let mut state = self.state.borrow_mut();
        let rectangles = state.regions.get(&source).cloned().unwrap_or_default();
        state.regions.insert(destination, rectangles);
        Ok(())
    }

    fn union_region(
        &self,
        first: RegionId,
        second: RegionId,
        destination: RegionId,
    ) -> Result<(), RequestError> {
        self.one_way(Call::UnionRegion(first, second, destination))?;
        let mut state = self.state.borrow_mut();
        let mut rectangles = state.regions.get(&first).cloned().unwrap_or_default();
        for r in state.regions.get(&second).cloned().unwrap_or_default() {
            if !rectangles.contains(&r) {
                rectangles.push(r);
            }
        }
        state.regions.insert(destination, rectangles);
        Ok(())
    }

    fn destroy_region(&self, region: RegionId) -> Result<(), RequestError> {
        self.one_way(Call::DestroyRegion(region))?;
        self.state.borrow_mut().regions.remove(&region);
        Ok(())
    }

    fn select_window_input(&self, window: WindowId, mask: EventMask) -> Result<(), RequestError> {
        self.one_way(Call::SelectInput(window, mask))
    }

    fn select_shape_input(&self, window: WindowId, enable: bool) -> Result<(), RequestError> {
        self.one_way(Call::SelectShapeInput(window, enable))
    }

    fn set_override_redirect(&self, window: WindowId, enable: bool) -> Result<(), RequestError> {
        self.one_way(Call::SetOverrideRedirect(window, enable))?;
        self.update_attributes(window, |attributes| attributes.override_redirect = enable);
        Ok(())
    }

    fn map_window(&self, window: WindowId) -> Result<(), RequestError> {
        self.one_way(Call::MapWindow(window))?;
        self.update_attributes(window, |attributes| attributes.map_state = MapState::VIEWABLE);
        Ok(())
    }

    fn unmap_window(&self, window: WindowId) -> Result<(), RequestError> {
        self.one_way(Call::UnmapWindow(window))?;
        self.update_attributes(window, |attributes| attributes.map_state = MapState::UNMAPPED);
        Ok(())
    }

    fn flush(&self) -> Result<(), RequestError> {
        self.one_way(Call::Flush)
    }

    fn sync(&self) -> Result<(), RequestError> {
        self.one_way(Call::Sync)
    }
}

/// Render backend logging into the fake's journal
pub struct RecordingBackend {
    journal: Journal,
}

impl RecordingBackend {
    pub fn new(fake: &FakeServer) -> Self {
        Self {
            journal: fake.journal.clone(),
        }
    }

    fn record(&self, call: Call) {
        self.journal.borrow_mut().push(call);
    }
}

impl RenderBackend for RecordingBackend {
    fn paint_background(&mut self, damaged: Option<RegionId>) {
        self.record(Call::PaintBackground(damaged));
    }

    fn paint_window(&mut self, window: &Window, opacity: u16) {
        self.record(Call::PaintWindow(window.id, opacity));
        if let Some(clip) = window.paint_clip() {
            self.record(Call::PaintClip(window.id, clip));
        }
    }

    fn paint_all(&mut self, damaged: Option<RegionId>) {
        self.record(Call::PaintAll(damaged));
    }

    fn free_window(&mut self, window: WindowId) {
        self.record(Call::FreeWindow(window));
    }

    fn free_window_pixmap(&mut self, window: WindowId) {
        self.record(Call::FreeWindowPixmap(window));
    }

    fn background_changed(&mut self) {
        self.record(Call::BackgroundChanged);
    }

    fn screen_resized(&mut self, width: u16, height: u16) {
        self.record(Call::ScreenResized(width, height));
    }
}

/// Frame clock logging into the fake's journal
pub struct RecordingClock {
    journal: Journal,
}

impl RecordingClock {
    pub fn new(fake: &FakeServer) -> Self {
        Self {
            journal: fake.journal.clone(),
        }
    }
}

impl FrameClock for RecordingClock {
    fn wait_for_next_frame(&mut self) {
        self.journal.borrow_mut().push(Call::WaitForFrame);
    }
}

/// Plugin hook invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Hook {
    CheckRequirements(&'static str),
    Event(&'static str, EventKinds),
    /// The event came with a managed window
    Window(&'static str, WindowId),
    ManageExisting(&'static str, Vec<WindowId>),
    PrePaint(&'static str),
    PostPaint(&'static str),
    Control(&'static str, String),
}

pub type HookLog = Rc<RefCell<Vec<Hook>>>;

/// Plugin recording every hook it receives
pub struct RecordingPlugin {
    name: &'static str,
    events: EventKinds,
    log: HookLog,
    requirements_met: bool,
    active: bool,
    opacity: Option<u16>,
    pre_paint_damage: Option<Rectangle>,
}

impl RecordingPlugin {
    pub fn new(name: &'static str, events: EventKinds) -> (Self, HookLog) {
        let log = HookLog::default();
        (Self::with_log(name, events, log.clone()), log)
    }

    pub fn with_log(name: &'static str, events: EventKinds, log: HookLog) -> Self {
        Self {
            name,
            events,
            log,
            requirements_met: true,
            active: true,
            opacity: None,
            pre_paint_damage: None,
        }
    }

    pub fn failing_requirements(mut self) -> Self {
        self.requirements_met = false;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn with_opacity(mut self, opacity: u16) -> Self {
        self.opacity = Some(opacity);
        self
    }

    /// Damage `area` from every pre-paint hook
    pub fn damaging(mut self, area: Rectangle) -> Self {
        self.pre_paint_damage = Some(area);
        self
    }

    fn log(&self, hook: Hook) {
        self.log.borrow_mut().push(hook);
    }
}

impl Plugin for RecordingPlugin {
    fn name(&self) -> &'static str {
        self.name
    }

    fn activated_by_default(&self) -> bool {
        self.active
    }

    fn events(&self) -> EventKinds {
        self.events
    }

    fn check_requirements(&mut self, _extensions: &Extensions) -> bool {
        self.log(Hook::CheckRequirements(self.name));
        self.requirements_met
    }

    fn handle_event(
        &mut self,
        event: &Event,
        window: Option<&Window>,
        _ctx: &mut PluginContext<'_>,
    ) {
        if let Some(kind) = EventKinds::of(event) {
            self.log(Hook::Event(self.name, kind));
        }
        if let Some(window) = window {
            self.log(Hook::Window(self.name, window.id));
        }
    }

    fn manage_existing(&mut self, windows: &[WindowId], _ctx: &mut PluginContext<'_>) {
        self.log(Hook::ManageExisting(self.name, windows.to_vec()));
    }

    fn window_opacity(&self, _window: &Window) -> Option<u16> {
        self.opacity
    }

    fn pre_paint(&mut self, ctx: &mut PluginContext<'_>) {
        self.log(Hook::PrePaint(self.name));
        if let Some(area) = self.pre_paint_damage {
            let _ = ctx.damaged.add_rectangles(&[area]);
        }
    }

    fn post_paint(&mut self, _ctx: &mut PluginContext<'_>) {
        self.log(Hook::PostPaint(self.name));
    }

    fn control_message(
        &mut self,
        member: &str,
        args: &[String],
        _ctx: &mut PluginContext<'_>,
    ) -> Option<Result<String, ControlError>> {
        self.log(Hook::Control(self.name, member.to_string()));
        match member {
            "Echo" => Some(Ok(args.join(" "))),
            _ => None,
        }
    }
}

/// Just enough compositor state to run plugin hooks
pub struct Harness {
    pub fake: Rc<FakeServer>,
    pub server: Rc<dyn XServer>,
    pub screen: Screen,
    pub atoms: Atoms,
    pub registry: Registry,
    pub damaged: DamagedRegion,
}

impl Harness {
    pub fn new() -> Self {
        let (fake, server) = FakeServer::shared();
        Self {
            registry: Registry::new(server.clone()),
            damaged: DamagedRegion::new(server.clone()),
            fake,
            server,
            screen: screen(),
            atoms: atoms(),
        }
    }

    /// A viewable window known to both the fake server and the registry
    pub fn manage(&mut self, id: WindowId, geometry: WindowGeometry) {
        self.fake.add_window(id, FakeServer::viewable(), geometry);

        let window = self.registry.insert(id).unwrap();
        window.attributes = Some(FakeServer::viewable());
        window.geometry = Some(geometry);
        window.refresh_region(&self.server, true, false).unwrap();
    }

    pub fn with_context<R>(&mut self, f: impl FnOnce(&mut PluginContext<'_>) -> R) -> R {
        let mut ctx = PluginContext {
            server: &self.server,
            screen: &self.screen,
            atoms: &self.atoms,
            registry: &self.registry,
            damaged: &mut self.damaged,
        };
        f(&mut ctx)
    }
}

/// Compositor over a fresh fake, painting and pacing into its journal
pub fn compositor(plugins: Plugins) -> (Rc<FakeServer>, Compositor) {
    let (fake, server) = FakeServer::shared();
    let extensions = Extensions {
        composite: Some((0, 4)),
        xfixes: Some((5, 0)),
        damage: Some((1, 1)),
        randr: Some((1, 5)),
        shape: Some((1, 1)),
    };

    let compositor = Compositor::new(
        server,
        screen(),
        atoms(),
        extensions,
        plugins,
        Box::new(RecordingBackend::new(&fake)),
        Box::new(RecordingClock::new(&fake)),
    );
    (fake, compositor)
}
