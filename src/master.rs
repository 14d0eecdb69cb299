//! The VMC (master) side: owns the bus, initiates every transaction.
//!
//! Each configured address gets its own lane with its own session machine
//! and handshake progress. Lanes are serviced round-robin, one transaction
//! per turn. Silence from a peripheral is not an error; three consecutive
//! unanswered POLLs drop the lane back to the reset handshake.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration, Instant, Timer};

use crate::command::{Identity, PeripheralAddress, PollReply, VmcCommand, VmcConfig};
use crate::frame::{Frame, FrameCodec, MdbStatus, Reply};
use crate::link::BitLink;
use crate::session::{Role, SessionConfig, SessionMachine, SessionNotification, SessionState};
use crate::MdbError;

/// Unanswered POLLs before a lane is considered offline.
const OFFLINE_STRIKES: u8 = 3;

/// An item selection from the machine front panel (or its remote
/// equivalent). Price in minor currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VendSelection {
    pub price: u16,
    pub item: u16,
}

/// Collaborator rendezvous for the master role, mirroring
/// [`crate::peripheral::SessionChannels`]: depth-1 drop-if-full selections
/// in, latest-wins notifications out.
pub struct VmcChannels {
    selections: Channel<CriticalSectionRawMutex, VendSelection, 1>,
    notifications: Signal<CriticalSectionRawMutex, (PeripheralAddress, SessionNotification)>,
}

impl VmcChannels {
    pub const fn new() -> Self {
        Self {
            selections: Channel::new(),
            notifications: Signal::new(),
        }
    }

    pub fn handle(&self) -> VmcHandle<'_> {
        VmcHandle { channels: self }
    }
}

impl Default for VmcChannels {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
pub struct VmcHandle<'a> {
    channels: &'a VmcChannels,
}

impl<'a> VmcHandle<'a> {
    /// Queue an item selection for the next sessioned lane. Returns `false`
    /// if one is already queued; the new one is dropped.
    pub fn select_item(&self, price: u16, item: u16) -> bool {
        let accepted = self
            .channels
            .selections
            .try_send(VendSelection { price, item })
            .is_ok();
        if !accepted {
            warn!("vend selection dropped, one already queued");
        }
        accepted
    }

    pub async fn next_notification(&self) -> (PeripheralAddress, SessionNotification) {
        self.channels.notifications.wait().await
    }

    pub fn try_notification(&self) -> Option<(PeripheralAddress, SessionNotification)> {
        self.channels.notifications.try_take()
    }
}

/// Static configuration of the sequencer.
#[derive(Debug, Clone, Copy)]
pub struct MasterConfig {
    /// What the VMC announces about itself in SETUP/CONFIG_DATA.
    pub vmc: VmcConfig,
    /// Identification record sent with EXPANSION/REQUEST_ID.
    pub identity: Identity,
    /// Max/min vend prices announced via SETUP/MAX_MIN_PRICES, wire-scaled.
    pub max_price: u16,
    pub min_price: u16,
    /// Window to wait for any response before treating it as silence.
    pub response_timeout: Duration,
    /// Pause between round-robin cycles.
    pub poll_interval: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            vmc: VmcConfig {
                feature_level: 1,
                display_columns: 0,
                display_rows: 0,
                display_info: 1,
            },
            identity: Identity::new("UNK", "0", "VMC", 0x0100),
            max_price: 200,
            min_price: 100,
            response_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Handshake progress of one lane. Every step is one bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum LaneStep {
    Reset,
    AwaitJustReset,
    SetupConfig,
    SetupPrices,
    RequestId,
    Enable,
    Poll,
}

struct Lane {
    address: PeripheralAddress,
    machine: SessionMachine,
    step: LaneStep,
    misses: u8,
}

impl Lane {
    fn new(address: PeripheralAddress, now: Instant) -> Self {
        Self {
            address,
            machine: SessionMachine::new(Role::Master, SessionConfig::default(), now),
            step: LaneStep::Reset,
            misses: 0,
        }
    }

    fn offline(&mut self, now: Instant) {
        warn!("{:?} offline after {} misses", self.address, self.misses);
        self.machine.mark_inactive(now);
        self.step = LaneStep::Reset;
        self.misses = 0;
    }
}

/// Round-robin bus master over up to `N` peripheral addresses.
pub struct MasterSequencer<'a, L: BitLink, const N: usize> {
    codec: FrameCodec<L>,
    config: MasterConfig,
    lanes: [Lane; N],
    channels: &'a VmcChannels,
}

impl<'a, L: BitLink, const N: usize> MasterSequencer<'a, L, N> {
    pub fn new(
        link: L,
        addresses: [PeripheralAddress; N],
        config: MasterConfig,
        channels: &'a VmcChannels,
    ) -> Self {
        let now = Instant::now();
        Self {
            codec: FrameCodec::new(link),
            config,
            lanes: addresses.map(|address| Lane::new(address, now)),
            channels,
        }
    }

    pub fn state_of(&self, address: PeripheralAddress) -> Option<SessionState> {
        self.lanes
            .iter()
            .find(|lane| lane.address == address)
            .map(|lane| lane.machine.state())
    }

    /// Drive the bus forever. Returns only on a link failure.
    pub async fn run(&mut self) -> Result<(), MdbError<L::LinkError>> {
        info!("sequencer up, {} lane(s)", N);
        loop {
            self.step().await?;
            Timer::after(self.config.poll_interval).await;
        }
    }

    /// One full round: one transaction per lane.
    pub async fn step(&mut self) -> Result<(), MdbError<L::LinkError>> {
        for idx in 0..N {
            self.step_lane(idx).await?;
        }
        Ok(())
    }

    /// One transaction on one lane.
    pub async fn step_lane(&mut self, idx: usize) -> Result<(), MdbError<L::LinkError>> {
        let now = Instant::now();
        let address = self.lanes[idx].address;
        match self.lanes[idx].step {
            LaneStep::Reset => {
                let reply = self.transact(&VmcCommand::Reset.encode(address)).await?;
                if matches!(reply, Some(Reply::Status(MdbStatus::Ack))) {
                    self.lanes[idx].step = LaneStep::AwaitJustReset;
                }
            }
            LaneStep::AwaitJustReset => {
                let reply = self.transact(&VmcCommand::Poll.encode(address)).await?;
                if let Some(PollReply::JustReset) = self.parse_data(reply) {
                    self.lanes[idx].machine.observe_reply(&PollReply::JustReset, now);
                    self.lanes[idx].step = LaneStep::SetupConfig;
                } else {
                    self.miss(idx, now);
                }
            }
            LaneStep::SetupConfig => {
                let cmd = VmcCommand::SetupConfig(self.config.vmc);
                let reply = self.transact(&cmd.encode(address)).await?;
                if let Some(reply @ PollReply::ReaderConfig(_)) = self.parse_data(reply) {
                    self.lanes[idx].machine.observe_reply(&reply, now);
                    self.lanes[idx].step = LaneStep::SetupPrices;
                } else {
                    self.miss(idx, now);
                }
            }
            LaneStep::SetupPrices => {
                let cmd = VmcCommand::SetupPrices {
                    max: self.config.max_price,
                    min: self.config.min_price,
                };
                let reply = self.transact(&cmd.encode(address)).await?;
                if matches!(reply, Some(Reply::Status(MdbStatus::Ack))) {
                    self.lanes[idx].step = LaneStep::RequestId;
                } else {
                    self.miss(idx, now);
                }
            }
            LaneStep::RequestId => {
                let cmd = VmcCommand::RequestId(self.config.identity);
                let reply = self.transact(&cmd.encode(address)).await?;
                if let Some(reply @ PollReply::PeripheralId(_)) = self.parse_data(reply) {
                    self.lanes[idx].machine.observe_reply(&reply, now);
                    self.lanes[idx].step = LaneStep::Enable;
                } else {
                    self.miss(idx, now);
                }
            }
            LaneStep::Enable => {
                let reply = self.transact(&VmcCommand::ReaderEnable.encode(address)).await?;
                if matches!(reply, Some(Reply::Status(MdbStatus::Ack))) {
                    self.lanes[idx].machine.mark_enabled(now);
                    self.lanes[idx].step = LaneStep::Poll;
                    info!("{:?} enabled", address);
                } else {
                    self.miss(idx, now);
                }
            }
            LaneStep::Poll => {
                match self.lanes[idx].machine.state() {
                    SessionState::Idle => {
                        if let Ok(selection) = self.channels.selections.try_receive() {
                            return self.send_vend_request(idx, selection, now).await;
                        }
                    }
                    SessionState::Enabled => {
                        // No cashless session open: record the sale as cash.
                        if let Ok(selection) = self.channels.selections.try_receive() {
                            return self.send_cash_sale(idx, selection).await;
                        }
                    }
                    _ => {}
                }
                let reply = self.transact(&VmcCommand::Poll.encode(address)).await?;
                match reply {
                    None => self.miss(idx, now),
                    Some(Reply::Status(_)) => self.lanes[idx].misses = 0,
                    Some(Reply::Data(frame)) => {
                        self.lanes[idx].misses = 0;
                        match PollReply::parse(frame.bytes()) {
                            Some(event) => self.dispatch(idx, event, now).await?,
                            None => debug!("unparseable poll reply {:?}", frame),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// React to a peripheral-reported event during the poll loop.
    async fn dispatch(
        &mut self,
        idx: usize,
        event: PollReply,
        now: Instant,
    ) -> Result<(), MdbError<L::LinkError>> {
        let address = self.lanes[idx].address;
        let notification = self.lanes[idx].machine.observe_reply(&event, now);
        if let Some(notification) = notification {
            self.channels.notifications.signal((address, notification));
        }
        match event {
            PollReply::VendApproved { .. } => {
                // Product hand-off is the machine's job; on this level an
                // approved vend is dispensed and acknowledged in one go.
                let item = self
                    .lanes[idx]
                    .machine
                    .vend_context()
                    .map(|ctx| ctx.item)
                    .unwrap_or(0);
                let reply = self
                    .transact(&VmcCommand::VendSuccess { item }.encode(address))
                    .await?;
                if matches!(reply, Some(Reply::Status(MdbStatus::Ack))) {
                    if let Some(notification) = self.lanes[idx].machine.finish_vend(now) {
                        self.channels.notifications.signal((address, notification));
                    }
                    // One vend per session: ask the reader to wind it down.
                    self.transact(&VmcCommand::SessionComplete.encode(address))
                        .await?;
                }
            }
            PollReply::VendDenied => {
                self.transact(&VmcCommand::SessionComplete.encode(address))
                    .await?;
            }
            PollReply::SessionCancelRequest => {
                // Agree to close; the reader reports End Session afterwards.
                self.transact(&VmcCommand::SessionComplete.encode(address))
                    .await?;
            }
            PollReply::JustReset => {
                // Unexpected reset mid-operation: redo the handshake.
                self.lanes[idx].step = LaneStep::SetupConfig;
            }
            PollReply::OutOfSequence => {
                self.lanes[idx].step = LaneStep::Reset;
            }
            _ => {}
        }
        Ok(())
    }

    async fn send_cash_sale(
        &mut self,
        idx: usize,
        selection: VendSelection,
    ) -> Result<(), MdbError<L::LinkError>> {
        let address = self.lanes[idx].address;
        let scaled = self.lanes[idx].machine.scaling().to_scaled(selection.price);
        let cmd = VmcCommand::CashSale {
            price: scaled,
            item: selection.item,
        };
        let reply = self.transact(&cmd.encode(address)).await?;
        if matches!(reply, Some(Reply::Status(MdbStatus::Ack))) {
            self.channels.notifications.signal((
                address,
                SessionNotification::CashSale {
                    price: selection.price,
                    item: selection.item,
                },
            ));
        }
        Ok(())
    }

    async fn send_vend_request(
        &mut self,
        idx: usize,
        selection: VendSelection,
        now: Instant,
    ) -> Result<(), MdbError<L::LinkError>> {
        let address = self.lanes[idx].address;
        let scaled = self.lanes[idx].machine.scaling().to_scaled(selection.price);
        let cmd = VmcCommand::VendRequest {
            price: scaled,
            item: selection.item,
        };
        let reply = self.transact(&cmd.encode(address)).await?;
        if matches!(reply, Some(Reply::Status(MdbStatus::Ack))) {
            self.lanes[idx]
                .machine
                .begin_vend(selection.price, selection.item, now);
        } else {
            self.miss(idx, now);
        }
        Ok(())
    }

    /// Send one frame and wait out the response window. `None` is silence,
    /// which also swallows corrupt replies; only link failures propagate.
    async fn transact(&mut self, frame: &Frame) -> Result<Option<Reply>, MdbError<L::LinkError>> {
        self.codec.send_addressed(frame.bytes()).await?;
        let reply = match with_timeout(self.config.response_timeout, self.codec.recv_reply()).await
        {
            Err(_) => return Ok(None),
            Ok(Ok(reply)) => reply,
            Ok(Err(MdbError::Link(e))) => return Err(MdbError::Link(e)),
            Ok(Err(_)) => {
                warn!("discarding corrupt reply");
                return Ok(None);
            }
        };
        if matches!(reply, Reply::Data(_)) {
            self.codec.send_status(MdbStatus::Ack).await?;
        }
        Ok(Some(reply))
    }

    fn parse_data(&self, reply: Option<Reply>) -> Option<PollReply> {
        match reply {
            Some(Reply::Data(frame)) => PollReply::parse(frame.bytes()),
            _ => None,
        }
    }

    fn miss(&mut self, idx: usize, now: Instant) {
        self.lanes[idx].misses += 1;
        if self.lanes[idx].misses >= OFFLINE_STRIKES {
            self.lanes[idx].offline(now);
        }
    }
}
