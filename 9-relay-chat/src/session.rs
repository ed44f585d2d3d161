use std::{collections::HashSet, net::SocketAddr};

use bytes::{Bytes, BytesMut};

use crate::{frame, message, timer::Timer};

/// Stable identifier the server assigns to each accepted connection.
pub type ConnId = u64;

/// Lowercase display names currently claimed by active sessions.
#[derive(Debug, Default)]
pub struct NameSet {
    names: HashSet<String>,
}

impl NameSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Returns `false` when the name is already held.
    pub fn claim(&mut self, name: &str) -> bool {
        if self.names.contains(name) {
            return false;
        }
        self.names.insert(name.to_owned())
    }

    pub fn release(&mut self, name: &str) -> bool {
        self.names.remove(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingName,
    Registered,
}

/// What a complete inbound frame did to a session.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The session claimed `name` and became active.
    Joined(String),
    /// The candidate name is taken; the session has to go.
    Rejected(String),
    /// A chat line, already formatted for relay.
    Message(Vec<u8>),
}

/// Server-side state of one connection.
#[derive(Debug)]
pub struct Session {
    id: ConnId,
    peer: Option<SocketAddr>,
    state: SessionState,
    name: Option<String>,
    pending: BytesMut,
    active: bool,
    closing: bool,
    pub(crate) idle: Timer,
}

impl Session {
    pub fn new(id: ConnId, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            state: SessionState::AwaitingName,
            name: None,
            pending: BytesMut::new(),
            active: false,
            closing: false,
            idle: Timer::new(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Registered name, `None` until the session has joined.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Bytes of the frame currently being accumulated.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Extracts the complete frames in `chunk`, keeping any tail for later.
    pub fn split_frames(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        frame::split_frames(&mut self.pending, chunk).collect()
    }

    /// Advances the registration state machine with one complete frame.
    pub fn on_frame(&mut self, frame: &[u8], names: &mut NameSet) -> FrameOutcome {
        match self.state {
            SessionState::AwaitingName => {
                let candidate = String::from_utf8_lossy(frame).to_lowercase();
                if !names.claim(&candidate) {
                    return FrameOutcome::Rejected(candidate);
                }

                self.active = true;
                self.state = SessionState::Registered;
                self.name = Some(candidate.clone());
                FrameOutcome::Joined(candidate)
            }
            SessionState::Registered => {
                let name = self.name.as_deref().unwrap_or_default();
                FrameOutcome::Message(message::chat(name, frame))
            }
        }
    }

    /// Stops the session from receiving broadcasts and processing input.
    pub fn begin_close(&mut self) {
        self.active = false;
        self.closing = true;
        self.pending.clear();
        self.idle.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_registers_a_lowercased_name() {
        let mut names = NameSet::new();
        let mut session = Session::new(1, None);

        let outcome = session.on_frame(b"Alice", &mut names);

        assert_eq!(outcome, FrameOutcome::Joined("alice".into()));
        assert_eq!(session.state(), SessionState::Registered);
        assert_eq!(session.name(), Some("alice"));
        assert!(session.is_active());
        assert!(names.contains("alice"));
    }

    #[test]
    fn taken_name_is_rejected_in_any_case() {
        let mut names = NameSet::new();
        let mut first = Session::new(1, None);
        let mut second = Session::new(2, None);
        first.on_frame(b"alice", &mut names);

        let outcome = second.on_frame(b"ALICE", &mut names);

        assert_eq!(outcome, FrameOutcome::Rejected("alice".into()));
        assert_eq!(second.state(), SessionState::AwaitingName);
        assert!(!second.is_active());
        assert_eq!(second.name(), None);
        assert_eq!(first.name(), Some("alice"));
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn later_frames_are_relayed_and_never_rename() {
        let mut names = NameSet::new();
        let mut session = Session::new(1, None);
        session.on_frame(b"bob", &mut names);

        assert_eq!(
            session.on_frame(b"Hi There", &mut names),
            FrameOutcome::Message(b"bob:Hi There".to_vec())
        );
        assert_eq!(
            session.on_frame(b"carol", &mut names),
            FrameOutcome::Message(b"bob:carol".to_vec())
        );
        assert_eq!(session.name(), Some("bob"));
        assert!(!names.contains("carol"));
        assert!(!names.is_empty());
    }

    #[test]
    fn chat_bytes_that_are_not_utf8_pass_through() {
        let mut names = NameSet::new();
        let mut session = Session::new(1, None);
        session.on_frame(b"bob", &mut names);

        assert_eq!(
            session.on_frame(b"\xff\xfe", &mut names),
            FrameOutcome::Message(b"bob:\xff\xfe".to_vec())
        );
    }

    #[test]
    fn pending_bytes_clear_exactly_when_a_frame_completes() {
        let mut session = Session::new(1, None);

        assert!(session.split_frames(b"da").is_empty());
        assert_eq!(session.pending(), b"da");
        assert!(session.split_frames(b"ve").is_empty());

        let frames = session.split_frames(b"\0x");
        assert_eq!(frames, vec![Bytes::from_static(b"dave")]);
        assert_eq!(session.pending(), b"x");
    }

    #[test]
    fn closing_deactivates_and_drops_partial_input() {
        let mut names = NameSet::new();
        let mut session = Session::new(1, None);
        session.on_frame(b"erin", &mut names);
        session.split_frames(b"half a mess");

        session.begin_close();

        assert!(!session.is_active());
        assert!(session.is_closing());
        assert!(session.pending().is_empty());
    }
}
