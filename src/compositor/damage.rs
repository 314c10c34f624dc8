//! Screen damage accumulated between two repaints
//!
//! The accumulator only grows until the next repaint resets it. Regions
//! handed over by value are consumed: the first one of a frame becomes the
//! accumulator itself, later ones are unioned in and destroyed. Borrowed
//! regions are copied and stay valid for the caller.

use std::rc::Rc;

use tracing::trace;
use x11rb::NONE;
use x11rb::protocol::xproto::Rectangle;

use crate::server::{OwnedRegion, RegionId, RequestError, XServer};

pub struct DamagedRegion {
    server: Rc<dyn XServer>,
    region: Option<OwnedRegion>,
}

impl DamagedRegion {
    pub fn new(server: Rc<dyn XServer>) -> Self {
        Self {
            server,
            region: None,
        }
    }

    /// Add a region the caller no longer needs
    pub fn add(&mut self, region: Option<OwnedRegion>) -> Result<(), RequestError> {
        let Some(region) = region else {
            return Ok(());
        };

        match &self.region {
            Some(damaged) => {
                self.server.union_region(damaged.id(), region.id(), damaged.id())?;
                trace!("Added {:?} to damaged {:?}", region, damaged);
            }
            None => {
                trace!("Damaged region initialised to {:?}", region);
                self.region = Some(region);
            }
        }

        Ok(())
    }

    /// Add a region the caller keeps using afterwards
    pub fn add_copy(&mut self, region: Option<RegionId>) -> Result<(), RequestError> {
        let Some(region) = region.filter(|&id| id != NONE) else {
            return Ok(());
        };

        match &self.region {
            Some(damaged) => {
                self.server.union_region(damaged.id(), region, damaged.id())?;
                trace!("Added {:#x} to damaged {:?}", region, damaged);
            }
            None => {
                let damaged = OwnedRegion::create(&self.server, &[])?;
                self.server.copy_region(region, damaged.id())?;
                trace!("Damaged region initialised to {:?} (copy of {:#x})", damaged, region);
                self.region = Some(damaged);
            }
        }

        Ok(())
    }

    /// Add plain screen rectangles
    pub fn add_rectangles(&mut self, rectangles: &[Rectangle]) -> Result<(), RequestError> {
        if rectangles.is_empty() {
            return Ok(());
        }

        let region = OwnedRegion::create(&self.server, rectangles)?;
        self.add(Some(region))
    }

    /// Drop everything accumulated so far
    pub fn reset(&mut self) {
        self.region = None;
    }

    pub fn id(&self) -> Option<RegionId> {
        self.region.as_ref().map(OwnedRegion::id)
    }

    pub fn is_damaged(&self) -> bool {
        self.region.is_some()
    }
}
