use std::fmt::{Debug, Display, Formatter};

use crate::dbbat::common::{Error, Result};

/// The phases a proxied session moves through. Transitions only move
/// forward; any phase may jump to Closing on a fatal error.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SessionState {
    AwaitingStartup,
    ClientAuth,
    UpstreamConnect,
    UpstreamAuth,
    Ready,
    Proxying,
    Closing,
}

impl SessionState {
    pub fn transition(&mut self, to: SessionState) -> Result<()> {
        if to == SessionState::Closing || (to as u8) == (*self as u8) + 1 {
            *self = to;
            Ok(())
        } else {
            Err(Error::new(format!(
                "invalid session state transition {:?} -> {:?}",
                self, to
            )))
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::AwaitingStartup => "awaiting_startup",
            SessionState::ClientAuth => "client_auth",
            SessionState::UpstreamConnect => "upstream_connect",
            SessionState::UpstreamAuth => "upstream_auth",
            SessionState::Ready => "ready",
            SessionState::Proxying => "proxying",
            SessionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

impl Debug for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
