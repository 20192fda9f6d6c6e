//! Seams between the control core and the outside world. The firmware binds
//! each of these to real hardware; tests bind them to fakes.

use chrono::NaiveDateTime;

use crate::error::{PortError, TransportError};

/// Local wall-clock, periodically synchronised from the network.
pub trait Clock {
    /// Current local time, or `None` while the clock has never been synchronised.
    fn now_local(&self) -> Option<NaiveDateTime>;

    /// Start (or restart) network time synchronisation.
    fn resync(&mut self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound HTTP used for the license check. Timeouts are the transport's own.
pub trait LicenseTransport {
    fn post_json(&mut self, url: &str, body: &[u8]) -> Result<HttpReply, TransportError>;
}

pub trait OutputPin {
    fn set_level(&mut self, high: bool) -> Result<(), PortError>;
}

pub trait NetworkLink {
    fn is_connected(&self) -> bool;
    fn reconnect(&mut self) -> Result<(), PortError>;
}
