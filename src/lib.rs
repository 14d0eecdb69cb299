//! # mdb-bus
//!
//! Protocol engine for the MDB (MultiDrop Bus) used between a vending machine
//! controller (VMC) and its payment peripherals. The bus is a half-duplex
//! 9600 bps serial line carrying 9-bit words: 8 data bits plus an out-of-band
//! "mode" flag that delimits frames.
//!
//! The crate is layered bottom-up:
//!
//! 1. [`link`]: one 9-bit word at a time, over either a bit-banged GPIO pair
//!    or a hardware UART that smuggles the mode flag through a companion byte.
//! 2. [`frame`]: addressed frames with the additive mod-256 checksum, plus
//!    the single-word ACK/NAK/RET status vocabulary.
//! 3. [`command`]: the six top-level MDB commands, their sub-flows, and the
//!    poll-reply events, as typed enums with wire parse/encode.
//! 4. [`session`]: the five-state vending-session machine with its
//!    pending-action flags, shared by both bus roles.
//! 5. [`master`] / [`peripheral`]: the VMC sequencer that drives the bus and
//!    the reader responder that answers it.
//!
//! External collaborators (a BLE/MQTT bridge, a vend button, telemetry) never
//! touch the wire layers: they talk to [`peripheral::SessionHandle`] or
//! [`master::VmcHandle`], which are bounded, non-blocking channels into the
//! session machine.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(async_fn_in_trait)]

// This mod MUST go first, so that the others see its macros.
mod fmt;

pub mod command;
pub mod frame;
pub mod link;
pub mod master;
pub mod peripheral;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;

pub use command::PeripheralAddress;
pub use frame::{FrameCodec, MdbStatus, Reply};
pub use link::{BitLink, Word9};
pub use session::{SessionNotification, SessionState};

/// Protocol-level errors, generic over the transport's own error type.
///
/// Checksum and framing problems are *not* fatal on the bus: MDB recovers by
/// silence and retransmission. They are reported so callers can count and log
/// them, but the sequencer and responder treat them as "no response".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MdbError<E> {
    /// The peer did not answer within its response window.
    Timeout,
    /// A reply's final byte did not match the running additive sum.
    WrongChecksum,
    /// An incoming frame exceeded the fixed frame buffer.
    BufferOverrun,
    /// A reply that was neither a data frame nor a valid status word.
    MalformedMessage,
    /// The underlying word link failed.
    Link(E),
}

impl<E> From<E> for MdbError<E> {
    fn from(value: E) -> Self {
        Self::Link(value)
    }
}
