//! The peripheral (reader) side of the bus: answer addressed frames, never
//! speak unsolicited.
//!
//! External collaborators reach the session machine only through
//! [`SessionChannels`]: a depth-1 command channel into the responder and a
//! latest-wins notification slot out of it. The responder folds queued
//! commands into the machine between bus transactions, so collaborators
//! never touch protocol state directly.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::Instant;

use crate::command::{PeripheralAddress, VmcCommand};
use crate::frame::{FrameCodec, MAX_FRAME_LEN};
use crate::link::BitLink;
use crate::session::{SessionConfig, SessionMachine, SessionNotification, SessionState};
use crate::MdbError;

/// Inbound collaborator calls, delivered at the next bus idle point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionCommand {
    /// Open a session with funds in minor currency units.
    RequestSession { funds: u16 },
    ApproveVend,
    DenyVend,
    CancelSession,
}

/// The rendezvous between the responder and its collaborators. Lives in a
/// `static` so both sides can hold it across tasks.
///
/// The command channel has depth 1 with drop-if-full send: a vend trigger
/// arriving while one is still queued is dropped rather than stalling the
/// caller. The notification slot keeps only the latest event.
pub struct SessionChannels {
    commands: Channel<CriticalSectionRawMutex, SessionCommand, 1>,
    notifications: Signal<CriticalSectionRawMutex, SessionNotification>,
}

impl SessionChannels {
    pub const fn new() -> Self {
        Self {
            commands: Channel::new(),
            notifications: Signal::new(),
        }
    }

    pub fn handle(&self) -> SessionHandle<'_> {
        SessionHandle { channels: self }
    }
}

impl Default for SessionChannels {
    fn default() -> Self {
        Self::new()
    }
}

/// What collaborators hold. Cheap to copy, no protocol state behind it.
#[derive(Clone, Copy)]
pub struct SessionHandle<'a> {
    channels: &'a SessionChannels,
}

impl<'a> SessionHandle<'a> {
    /// Returns `false` if an earlier command is still queued and this one
    /// was dropped.
    pub fn request_session(&self, funds: u16) -> bool {
        self.send(SessionCommand::RequestSession { funds })
    }

    pub fn approve_vend(&self) -> bool {
        self.send(SessionCommand::ApproveVend)
    }

    pub fn deny_vend(&self) -> bool {
        self.send(SessionCommand::DenyVend)
    }

    pub fn cancel_session(&self) -> bool {
        self.send(SessionCommand::CancelSession)
    }

    fn send(&self, command: SessionCommand) -> bool {
        let accepted = self.channels.commands.try_send(command).is_ok();
        if !accepted {
            warn!("session command dropped, one already queued");
        }
        accepted
    }

    /// Wait for the next session/sale notification. Only the latest
    /// unconsumed one is kept.
    pub async fn next_notification(&self) -> SessionNotification {
        self.channels.notifications.wait().await
    }

    pub fn try_notification(&self) -> Option<SessionNotification> {
        self.channels.notifications.try_take()
    }
}

/// Answers addressed frames for one peripheral address.
pub struct PeripheralResponder<'a, L: BitLink> {
    codec: FrameCodec<L>,
    address: PeripheralAddress,
    machine: SessionMachine,
    channels: &'a SessionChannels,
}

impl<'a, L: BitLink> PeripheralResponder<'a, L> {
    pub fn new(
        link: L,
        address: PeripheralAddress,
        config: SessionConfig,
        channels: &'a SessionChannels,
    ) -> Self {
        Self {
            codec: FrameCodec::new(link),
            address,
            machine: SessionMachine::new(crate::session::Role::Peripheral, config, Instant::now()),
            channels,
        }
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Serve the bus forever. Returns only on a link failure.
    pub async fn run(&mut self) -> Result<(), MdbError<L::LinkError>> {
        info!("responder up at {:?}", self.address);
        loop {
            self.service().await?;
        }
    }

    /// One transaction: block for the next complete frame, answer it if it
    /// is ours. Misaddressed and malformed frames get silence.
    pub async fn service(&mut self) -> Result<(), MdbError<L::LinkError>> {
        let frame = self.codec.recv_addressed().await?;
        let Some(&first) = frame.bytes().first() else {
            return Ok(());
        };
        if !self.address.matches(first) {
            trace!("frame for {:x}, not ours", first);
            return Ok(());
        }
        self.fold_commands();
        let now = Instant::now();
        let Some(cmd) = VmcCommand::parse(frame.bytes()) else {
            debug!("malformed {:?}", frame);
            return Ok(());
        };
        let outcome = self.machine.handle_command(&cmd, now);
        match outcome.reply {
            Some(reply) => {
                let mut buf = [0u8; MAX_FRAME_LEN];
                self.codec.send_reply(reply.encode(&mut buf)).await?;
            }
            None => self.codec.send_reply(&[]).await?,
        }
        if let Some(notification) = outcome.notification {
            self.channels.notifications.signal(notification);
        }
        Ok(())
    }

    /// Apply queued collaborator commands. They only set pending flags; the
    /// wire sees them at the next POLL.
    fn fold_commands(&mut self) {
        while let Ok(command) = self.channels.commands.try_receive() {
            match command {
                SessionCommand::RequestSession { funds } => self.machine.request_session(funds),
                SessionCommand::ApproveVend => self.machine.approve_vend(),
                SessionCommand::DenyVend => self.machine.deny_vend(),
                SessionCommand::CancelSession => self.machine.cancel_session(),
            }
        }
    }
}
