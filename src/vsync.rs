//! Frame clock
//!
//! The repaint loop blocks on [`FrameClock::wait_for_next_frame`] between
//! flushing its requests and presenting the frame. Without a usable clock the
//! wait returns at once and pacing falls back to the repaint interval timer.

use std::fs::{File, OpenOptions};
use std::os::raw::{c_long, c_uint, c_ulong};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{Context, Result};
use nix::errno::Errno;
use tracing::{info, warn};

pub trait FrameClock {
    /// Block until the next vertical blank
    fn wait_for_next_frame(&mut self);
}

/// No pacing at all
#[derive(Debug, Default)]
pub struct NoFrameClock;

impl FrameClock for NoFrameClock {
    fn wait_for_next_frame(&mut self) {}
}

const DRM_VBLANK_RELATIVE: c_uint = 0x1;

#[repr(C)]
#[derive(Clone, Copy)]
struct DrmVblankRequest {
    type_: c_uint,
    sequence: c_uint,
    signal: c_ulong,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct DrmVblankReply {
    type_: c_uint,
    sequence: c_uint,
    tval_sec: c_long,
    tval_usec: c_long,
}

#[repr(C)]
#[allow(dead_code)]
union DrmWaitVblank {
    request: DrmVblankRequest,
    reply: DrmVblankReply,
}

nix::ioctl_readwrite!(drm_ioctl_wait_vblank, b'd', 0x3a, DrmWaitVblank);

/// Vertical blank wait on a DRM device node
pub struct DrmVblank {
    device: File,
    failed: bool,
}

impl DrmVblank {
    pub fn open(path: &Path) -> Result<Self> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open DRM device {}", path.display()))?;

        info!("VSync with DRM device {}", path.display());
        Ok(Self {
            device,
            failed: false,
        })
    }
}

impl FrameClock for DrmVblank {
    fn wait_for_next_frame(&mut self) {
        if self.failed {
            return;
        }

        let mut vblank = DrmWaitVblank {
            request: DrmVblankRequest {
                type_: DRM_VBLANK_RELATIVE,
                sequence: 1,
                signal: 0,
            },
        };

        loop {
            // SAFETY: `vblank` is a properly laid out drm_wait_vblank union
            // living for the whole call, the fd is owned by `self.device`
            let result = unsafe { drm_ioctl_wait_vblank(self.device.as_raw_fd(), &mut vblank) };

            match result {
                Ok(_) => return,
                Err(Errno::EINTR) => {
                    // The kernel rewrote the request with an absolute sequence
                    // SAFETY: both variants are plain integers
                    unsafe { vblank.request.type_ &= !DRM_VBLANK_RELATIVE };
                }
                Err(e) => {
                    warn!("VBlank ioctl failed ({}), disabling VSync", e);
                    self.failed = true;
                    return;
                }
            }
        }
    }
}

/// DRM clock when enabled and available, otherwise no pacing
pub fn frame_clock(vsync: bool, device: &Path) -> Box<dyn FrameClock> {
    if !vsync {
        info!("VSync disabled");
        return Box::new(NoFrameClock);
    }

    match DrmVblank::open(device) {
        Ok(clock) => Box::new(clock),
        Err(e) => {
            warn!("{:#}, disabling VSync with DRM", e);
            Box::new(NoFrameClock)
        }
    }
}
