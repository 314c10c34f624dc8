//! Split-phase requests
//!
//! Every request that needs a round-trip is issued by a non-blocking call on
//! [`XServer`](super::XServer) that hands back a [`Pending`] token. The reply
//! is collected later with [`Pending::finish`], which blocks until that
//! particular reply (or error) has arrived.
//!
//! Callers are expected to issue all the requests they will need before
//! finishing any of them, so that the latency of several round-trips
//! overlaps:
//!
//! ```ignore
//! let attributes: Vec<_> = ids.iter().map(|&id| server.get_window_attributes(id)).collect();
//! let geometries: Vec<_> = ids.iter().map(|&id| server.get_geometry(id)).collect();
//! for (attributes, geometry) in attributes.into_iter().zip(geometries) {
//!     let attributes = attributes.finish(&*server)?;
//!     let geometry = geometry.finish(&*server)?;
//! }
//! ```
//!
//! Requests reach the server in issue order. Replies may be collected in any
//! order; a token always yields its own reply.

use std::marker::PhantomData;

use thiserror::Error;
use x11rb::errors::{ConnectionError, ParseError, ReplyError, ReplyOrIdError};
use x11rb::protocol::xproto::Rectangle;

use super::{WindowAttributes, WindowGeometry, WindowId, XServer};

/// Raw request sequence number
pub type Sequence = u64;

/// Errors surfaced by the wire layer
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("X11 connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("X server rejected the request: {kind} (bad value {bad_value:#x})")]
    Protocol { kind: String, bad_value: u32 },

    #[error("malformed reply: {0}")]
    Parse(#[from] ParseError),

    #[error("reply does not match a {0:?} request")]
    UnexpectedReply(ReplyKind),

    #[error("X resource identifiers exhausted")]
    IdsExhausted,
}

impl From<ReplyError> for RequestError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::ConnectionError(e) => Self::Connection(e),
            ReplyError::X11Error(e) => Self::Protocol {
                kind: format!("{:?}", e.error_kind),
                bad_value: e.bad_value,
            },
        }
    }
}

impl From<ReplyOrIdError> for RequestError {
    fn from(err: ReplyOrIdError) -> Self {
        match err {
            ReplyOrIdError::IdsExhausted => Self::IdsExhausted,
            ReplyOrIdError::ConnectionError(e) => Self::Connection(e),
            ReplyOrIdError::X11Error(e) => Self::Protocol {
                kind: format!("{:?}", e.error_kind),
                bad_value: e.bad_value,
            },
        }
    }
}

/// What a pending request expects back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Checked request without reply, only an error may come back
    Void,
    WindowAttributes,
    Geometry,
    Tree,
    RegionRectangles,
    Property32,
}

/// A decoded reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Void,
    WindowAttributes(WindowAttributes),
    Geometry(WindowGeometry),
    Tree(Vec<WindowId>),
    RegionRectangles(Vec<Rectangle>),
    Property32(Option<u32>),
}

/// Types a [`Pending`] token can resolve to
pub trait FromReply: Sized {
    const KIND: ReplyKind;

    fn from_reply(reply: Reply) -> Option<Self>;
}

impl FromReply for () {
    const KIND: ReplyKind = ReplyKind::Void;

    fn from_reply(reply: Reply) -> Option<Self> {
        matches!(reply, Reply::Void).then_some(())
    }
}

impl FromReply for WindowAttributes {
    const KIND: ReplyKind = ReplyKind::WindowAttributes;

    fn from_reply(reply: Reply) -> Option<Self> {
        match reply {
            Reply::WindowAttributes(attributes) => Some(attributes),
            _ => None,
        }
    }
}

impl FromReply for WindowGeometry {
    const KIND: ReplyKind = ReplyKind::Geometry;

    fn from_reply(reply: Reply) -> Option<Self> {
        match reply {
            Reply::Geometry(geometry) => Some(geometry),
            _ => None,
        }
    }
}

/// Children of a window, bottom-most first
impl FromReply for Vec<WindowId> {
    const KIND: ReplyKind = ReplyKind::Tree;

    fn from_reply(reply: Reply) -> Option<Self> {
        match reply {
            Reply::Tree(children) => Some(children),
            _ => None,
        }
    }
}

impl FromReply for Vec<Rectangle> {
    const KIND: ReplyKind = ReplyKind::RegionRectangles;

    fn from_reply(reply: Reply) -> Option<Self> {
        match reply {
            Reply::RegionRectangles(rectangles) => Some(rectangles),
            _ => None,
        }
    }
}

/// First 32-bit item of a property, `None` when unset or of another type
impl FromReply for Option<u32> {
    const KIND: ReplyKind = ReplyKind::Property32;

    fn from_reply(reply: Reply) -> Option<Self> {
        match reply {
            Reply::Property32(value) => Some(value),
            _ => None,
        }
    }
}

/// Token for a request whose reply has not been collected yet
///
/// The sequence marker is unset when the request could not be dispatched
/// (the connection is broken). Finishing such a token is a programming error.
#[must_use = "a pending request must be finished to collect its reply or error"]
#[derive(Debug)]
pub struct Pending<T> {
    sequence: Option<Sequence>,
    _reply: PhantomData<fn() -> T>,
}

impl<T: FromReply> Pending<T> {
    pub fn sent(sequence: Sequence) -> Self {
        Self {
            sequence: Some(sequence),
            _reply: PhantomData,
        }
    }

    pub fn unsent() -> Self {
        Self {
            sequence: None,
            _reply: PhantomData,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.sequence.is_some()
    }

    /// Block until the reply of this request is available
    ///
    /// # Panics
    ///
    /// If the request was never dispatched.
    pub fn finish(self, server: &dyn XServer) -> Result<T, RequestError> {
        let Some(sequence) = self.sequence else {
            panic!("finish() called on a {:?} request that was never sent", T::KIND);
        };

        let reply = server.wait_for_reply(sequence, T::KIND)?;
        T::from_reply(reply).ok_or(RequestError::UnexpectedReply(T::KIND))
    }

    /// Like [`Pending::finish`], but a request that never left reports the
    /// broken connection instead of panicking
    pub fn finish_if_sent(self, server: &dyn XServer) -> Result<T, RequestError> {
        if !self.is_sent() {
            return Err(ConnectionError::UnknownError.into());
        }
        self.finish(server)
    }

    /// Give up on the reply without waiting for it
    pub fn discard(self, server: &dyn XServer) {
        if let Some(sequence) = self.sequence {
            server.discard_reply(sequence, T::KIND);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;
    use x11rb::protocol::xproto::{MapState, WindowClass};

    #[test]
    fn test_replies_collected_out_of_order() {
        let fake = FakeServer::new();
        fake.add_window(1, FakeServer::viewable(), WindowGeometry::new(0, 0, 10, 10, 0));
        fake.add_window(2, FakeServer::unmapped(), WindowGeometry::new(5, 5, 20, 30, 1));

        let first = fake.get_geometry(1);
        let second = fake.get_geometry(2);
        let attributes = fake.get_window_attributes(2);

        assert!(first.is_sent() && second.is_sent());
        assert!(second.sequence > first.sequence);

        // Collect in reverse order, each token still yields its own reply
        let attributes = attributes.finish(&fake).unwrap();
        assert_eq!(attributes.map_state, MapState::UNMAPPED);
        assert_eq!(attributes.class, WindowClass::INPUT_OUTPUT);

        let second = second.finish(&fake).unwrap();
        assert_eq!(second.width, 20);
        let first = first.finish(&fake).unwrap();
        assert_eq!(first.width, 10);
    }

    #[test]
    fn test_server_error_is_explicit() {
        let fake = FakeServer::new();
        let pending = fake.get_window_attributes(0xdead);

        match pending.finish(&fake) {
            Err(RequestError::Protocol { bad_value, .. }) => assert_eq!(bad_value, 0xdead),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_broken_connection_leaves_token_unsent() {
        let fake = FakeServer::new();
        fake.add_window(1, FakeServer::viewable(), WindowGeometry::new(0, 0, 10, 10, 0));
        fake.set_broken(true);

        let pending = fake.get_geometry(1);

        assert!(!pending.is_sent());
        assert!(matches!(
            pending.finish_if_sent(&fake),
            Err(RequestError::Connection(_))
        ));
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_connection_lost_while_waiting() {
        let fake = FakeServer::new();
        fake.add_window(1, FakeServer::viewable(), WindowGeometry::new(0, 0, 10, 10, 0));
        let pending = fake.get_geometry(1);
        fake.set_broken(true);

        assert!(pending.is_sent());
        assert!(matches!(pending.finish(&fake), Err(RequestError::Connection(_))));
        assert_eq!(fake.outstanding_replies(), 0);
    }

    #[test]
    #[should_panic(expected = "never sent")]
    fn test_finish_unsent_panics() {
        let fake = FakeServer::new();
        let pending: Pending<WindowGeometry> = Pending::unsent();
        let _ = pending.finish(&fake);
    }
}
