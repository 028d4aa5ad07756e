//! Authenticated channel to the meter.
//!
//! The meter only answers read requests on an open channel, and a channel
//! closes on its own after a period of inactivity. [`Session`] remembers when
//! the current channel expires so that value reads inside that window do not
//! pay for a new authentication round trip.
//!
//! Within one poll cycle the first failed authentication is sticky: every
//! further [`Session::ensure_open`] call returns `false` without touching the
//! bus until [`Session::begin_cycle`] is called again. On a dead bus this keeps
//! a whole cycle down to a single timeout.

use crate::deadline::Deadline;
use crate::protocol::{self as proto, Address, Password, Request};
use crate::transport::Transport;
use crate::Result;
use log::*;
use std::time::{Duration, Instant};

/// How long a successfully opened channel is considered valid.
pub const SESSION_LIFETIME: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Session {
    address: Address,
    password: Password,
    lifetime: Duration,
    expiry: Deadline,
    cycle_failed: bool,
}

impl Session {
    /// A session that is expired at `now`, so the first use authenticates.
    pub fn new(address: Address, password: Password, now: Instant) -> Self {
        Self {
            address,
            password,
            lifetime: SESSION_LIFETIME,
            expiry: Deadline::expired_at(now),
            cycle_failed: false,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn is_open(&self, now: Instant) -> bool {
        !self.expiry.expired(now)
    }

    /// Clears the failure mark of the previous cycle.
    pub fn begin_cycle(&mut self) {
        self.cycle_failed = false;
    }

    /// True if authentication already failed in the current cycle.
    pub fn cycle_failed(&self) -> bool {
        self.cycle_failed
    }

    /// Marks the channel as closed, e.g. after the meter refused a read.
    pub fn invalidate(&mut self, now: Instant) {
        self.expiry.expire(now);
    }

    /// Makes sure a channel is open, authenticating if it expired.
    ///
    /// Returns `false` if the channel could not be opened in this cycle.
    pub fn ensure_open<T: Transport + ?Sized>(&mut self, transport: &mut T, now: Instant) -> bool {
        if self.cycle_failed {
            return false;
        }
        if self.is_open(now) {
            return true;
        }
        match self.open(transport, now) {
            Ok(()) => true,
            Err(err) => {
                debug!("Opening channel to meter {} failed: {err}", self.address);
                self.cycle_failed = true;
                false
            }
        }
    }

    /// Unconditionally runs the open-channel exchange.
    ///
    /// On success the channel stays valid for the session lifetime from `now`;
    /// on failure it is left expired.
    pub fn open<T: Transport + ?Sized>(&mut self, transport: &mut T, now: Instant) -> Result<()> {
        self.expiry.expire(now);
        let request = Request::OpenChannel {
            address: self.address,
            password: self.password,
        };
        let response = transport.exchange(&request.encode(), request.response_len())?;
        proto::decode_open_channel(&response)?;
        self.expiry.rearm(now, self.lifetime);
        debug!("Channel to meter {} open for {:?}", self.address, self.lifetime);
        Ok(())
    }
}
