//! Window registry
//!
//! Windows are kept twice: in paint order (bottom to top) and in an index
//! keyed by id. Both are private and only mutated together, so they always
//! hold the same set of windows.

use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;
use tracing::trace;

use crate::server::{WindowId, XServer};

use super::window::Window;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("window {0:#x} is already managed")]
    Duplicate(WindowId),
}

pub struct Registry {
    server: Rc<dyn XServer>,
    /// Paint order, bottom-most first
    order: Vec<WindowId>,
    windows: HashMap<WindowId, Window>,
}

impl Registry {
    pub fn new(server: Rc<dyn XServer>) -> Self {
        Self {
            server,
            order: Vec::new(),
            windows: HashMap::new(),
        }
    }

    /// Add a window on top of the stack
    pub fn insert(&mut self, id: WindowId) -> Result<&mut Window, RegistryError> {
        if self.windows.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }

        self.order.push(id);
        trace!("Registry: inserted {:#x} ({} windows)", id, self.order.len());
        Ok(self.windows.entry(id).or_insert_with(|| Window::new(id)))
    }

    pub fn get(&self, id: WindowId) -> Option<&Window> {
        self.windows.get(&id)
    }

    pub fn get_mut(&mut self, id: WindowId) -> Option<&mut Window> {
        self.windows.get_mut(&id)
    }

    pub fn contains(&self, id: WindowId) -> bool {
        self.windows.contains_key(&id)
    }

    /// Unlink a window, releasing its pixmap, damage and region if asked
    pub fn remove(&mut self, id: WindowId, destroy_resources: bool) -> Option<Window> {
        let mut window = self.windows.remove(&id)?;
        self.order.retain(|&w| w != id);

        if destroy_resources {
            window.release_resources(self.server.as_ref());
        }

        trace!("Registry: removed {:#x} ({} windows)", id, self.order.len());
        Some(window)
    }

    /// Place `id` immediately below `successor`, or at the bottom for `None`
    ///
    /// Nothing happens when `successor` is the window itself or unknown.
    pub fn restack(&mut self, id: WindowId, successor: Option<WindowId>) {
        if !self.contains(id) {
            return;
        }

        match successor {
            None => self.move_to(id, |_| 0),
            Some(successor) if successor == id || !self.contains(successor) => {}
            Some(successor) => self.move_to(id, |order| position(order, successor)),
        }
    }

    /// Place `id` immediately above `sibling`, or at the bottom for `None`
    ///
    /// This is how ConfigureNotify reports the new stacking position.
    pub fn raise_above(&mut self, id: WindowId, sibling: Option<WindowId>) {
        match sibling {
            None => self.restack(id, None),
            Some(sibling) if sibling == id || !self.contains(sibling) => {}
            Some(sibling) => {
                let successor = self
                    .order
                    .iter()
                    .copied()
                    .filter(|&w| w != id)
                    .skip_while(|&w| w != sibling)
                    .nth(1);
                match successor {
                    Some(successor) => self.restack(id, Some(successor)),
                    None => self.move_to_top(id),
                }
            }
        }
    }

    pub fn move_to_top(&mut self, id: WindowId) {
        if self.contains(id) {
            self.move_to(id, |order| order.len());
        }
    }

    pub fn move_to_bottom(&mut self, id: WindowId) {
        if self.contains(id) {
            self.move_to(id, |_| 0);
        }
    }

    /// Unlink `id` then insert it at the index computed on the shortened order
    fn move_to(&mut self, id: WindowId, index: impl FnOnce(&Vec<WindowId>) -> usize) {
        self.order.retain(|&w| w != id);
        let index = index(&self.order).min(self.order.len());
        self.order.insert(index, id);
    }

    /// Window ids in paint order
    pub fn ids(&self) -> &[WindowId] {
        &self.order
    }

    /// Visit every window in paint order
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut Window)) {
        for id in &self.order {
            if let Some(window) = self.windows.get_mut(id) {
                f(window);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Remove every window, top-most first, releasing their resources
    pub fn clear(&mut self) -> Vec<Window> {
        let ids: Vec<_> = self.order.iter().rev().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id, true))
            .collect()
    }

    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        use std::collections::HashSet;

        let ordered: HashSet<_> = self.order.iter().copied().collect();
        let indexed: HashSet<_> = self.windows.keys().copied().collect();
        ordered.len() == self.order.len() && ordered == indexed
    }
}

fn position(order: &[WindowId], id: WindowId) -> usize {
    order.iter().position(|&w| w == id).unwrap_or(order.len())
}
