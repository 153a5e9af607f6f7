//! Validated messenger parameters.

use std::net::IpAddr;
use std::time::Duration;

use courier_core::config::{
    DEFAULT_INACTIVITY_TIMEOUT_MS, DEFAULT_MAX_RETRY_ROUNDS, DEFAULT_PACKET_SIZE, DEFAULT_PORT,
    GRACE_PERIOD_MS,
};
use courier_core::wire::{ENVELOPE_OVERHEAD, MAX_DATAGRAM};
use courier_core::MessengerSettings;

use crate::MessengerError;

/// Parameters of one messenger. Only constructible through validation.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    inactivity_timeout: Duration,
    port: u16,
    packet_size: usize,
    bind_address: IpAddr,
    max_retry_rounds: u8,
    grace_period: Duration,
}

impl MessengerConfig {
    pub fn new(
        inactivity_timeout: Duration,
        port: u16,
        packet_size: usize,
    ) -> Result<Self, MessengerError> {
        validate_timeout(inactivity_timeout)?;
        validate_packet_size(packet_size)?;
        Ok(Self {
            inactivity_timeout,
            port,
            packet_size,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            max_retry_rounds: DEFAULT_MAX_RETRY_ROUNDS,
            grace_period: Duration::from_millis(GRACE_PERIOD_MS),
        })
    }

    pub fn from_settings(settings: &MessengerSettings) -> Result<Self, MessengerError> {
        Ok(Self::new(
            Duration::from_millis(settings.inactivity_timeout_ms),
            settings.port,
            settings.packet_size,
        )?
        .with_bind_address(settings.bind_address)
        .with_max_retry_rounds(settings.max_retry_rounds))
    }

    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = bind_address;
        self
    }

    /// Failure notices an incomplete inbound message may send before it is
    /// abandoned. Zero abandons on the first stall.
    pub fn with_max_retry_rounds(mut self, rounds: u8) -> Self {
        self.max_retry_rounds = rounds;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn bind_address(&self) -> IpAddr {
        self.bind_address
    }

    pub fn max_retry_rounds(&self) -> u8 {
        self.max_retry_rounds
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// How long a finished message stays in the table to absorb late retries.
    pub fn retention(&self) -> Duration {
        self.inactivity_timeout + self.grace_period
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_millis(DEFAULT_INACTIVITY_TIMEOUT_MS),
            port: DEFAULT_PORT,
            packet_size: DEFAULT_PACKET_SIZE,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            max_retry_rounds: DEFAULT_MAX_RETRY_ROUNDS,
            grace_period: Duration::from_millis(GRACE_PERIOD_MS),
        }
    }
}

pub(crate) fn validate_timeout(timeout: Duration) -> Result<(), MessengerError> {
    if timeout.is_zero() {
        return Err(MessengerError::invalid("inactivity timeout must be positive"));
    }
    Ok(())
}

pub(crate) fn validate_packet_size(packet_size: usize) -> Result<(), MessengerError> {
    if packet_size <= ENVELOPE_OVERHEAD {
        return Err(MessengerError::invalid(format!(
            "packet size {packet_size} must exceed the {ENVELOPE_OVERHEAD}-byte envelope"
        )));
    }
    if packet_size > MAX_DATAGRAM {
        return Err(MessengerError::invalid(format!(
            "packet size {packet_size} exceeds the {MAX_DATAGRAM}-byte datagram limit"
        )));
    }
    Ok(())
}
