//! Command vocabulary: the six top-level MDB commands, their sub-flows, and
//! the single-event poll replies, with wire encode/parse for both.
//!
//! Everything here is pure data. Frames come in and go out through
//! [`crate::frame::FrameCodec`]; state lives in [`crate::session`].

use fixedstr::{str16, str4};

use crate::frame::{Frame, MAX_FRAME_LEN};

/// Top 5 bits of a frame's first byte select the peripheral.
pub const ADDRESS_MASK: u8 = 0xF8;
/// Bottom 3 bits carry the command.
pub const COMMAND_MASK: u8 = 0x07;

/// Bus addresses of the peripherals this crate speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PeripheralAddress {
    CoinChanger,
    Cashless1,
    Cashless2,
}

impl PeripheralAddress {
    /// The address bits, already shifted into the top 5 bits.
    pub const fn base(self) -> u8 {
        match self {
            PeripheralAddress::CoinChanger => 0x08,
            PeripheralAddress::Cashless1 => 0x10,
            PeripheralAddress::Cashless2 => 0x60,
        }
    }

    /// Whether a frame's first byte addresses this peripheral.
    pub const fn matches(self, first_byte: u8) -> bool {
        first_byte & ADDRESS_MASK == self.base()
    }
}

impl TryFrom<u8> for PeripheralAddress {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & ADDRESS_MASK {
            0x08 => Ok(PeripheralAddress::CoinChanger),
            0x10 => Ok(PeripheralAddress::Cashless1),
            0x60 => Ok(PeripheralAddress::Cashless2),
            _ => Err(value),
        }
    }
}

/// The command bits of an address byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    Reset = 0x00,
    Setup = 0x01,
    Poll = 0x02,
    Vend = 0x03,
    Reader = 0x04,
    Expansion = 0x07,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & COMMAND_MASK {
            0x00 => Ok(Command::Reset),
            0x01 => Ok(Command::Setup),
            0x02 => Ok(Command::Poll),
            0x03 => Ok(Command::Vend),
            0x04 => Ok(Command::Reader),
            0x07 => Ok(Command::Expansion),
            other => Err(other),
        }
    }
}

mod sub {
    // SETUP
    pub const CONFIG_DATA: u8 = 0x00;
    pub const MAX_MIN_PRICES: u8 = 0x01;
    // VEND
    pub const VEND_REQUEST: u8 = 0x00;
    pub const VEND_CANCEL: u8 = 0x01;
    pub const VEND_SUCCESS: u8 = 0x02;
    pub const VEND_FAILURE: u8 = 0x03;
    pub const SESSION_COMPLETE: u8 = 0x04;
    pub const CASH_SALE: u8 = 0x05;
    // READER
    pub const READER_DISABLE: u8 = 0x00;
    pub const READER_ENABLE: u8 = 0x01;
    pub const READER_CANCEL: u8 = 0x02;
    // EXPANSION
    pub const REQUEST_ID: u8 = 0x00;
}

mod reply_id {
    pub const JUST_RESET: u8 = 0x00;
    pub const READER_CONFIG: u8 = 0x01;
    pub const BEGIN_SESSION: u8 = 0x03;
    pub const SESSION_CANCEL_REQUEST: u8 = 0x04;
    pub const VEND_APPROVED: u8 = 0x05;
    pub const VEND_DENIED: u8 = 0x06;
    pub const END_SESSION: u8 = 0x07;
    pub const CANCELLED: u8 = 0x08;
    pub const PERIPHERAL_ID: u8 = 0x09;
    pub const OUT_OF_SEQUENCE: u8 = 0x0B;
}

fn u16_be(hi: u8, lo: u8) -> u16 {
    u16::from_be_bytes([hi, lo])
}

/// Fixed-size identification record exchanged by both roles during the
/// EXPANSION/REQUEST_ID flow. 29 bytes on the wire, all text space-padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub manufacturer: str4,
    pub serial: str16,
    pub model: str16,
    pub version: u16,
}

impl Identity {
    pub const WIRE_LEN: usize = 29;

    pub fn new(manufacturer: &str, serial: &str, model: &str, version: u16) -> Self {
        Self {
            manufacturer: str4::from(manufacturer),
            serial: str16::from(serial),
            model: str16::from(model),
            version,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        pad_field(&mut buf[0..3], self.manufacturer.as_str());
        pad_field(&mut buf[3..15], self.serial.as_str());
        pad_field(&mut buf[15..27], self.model.as_str());
        buf[27..29].copy_from_slice(&self.version.to_be_bytes());
        Self::WIRE_LEN
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            manufacturer: str4::from(text_field(&bytes[0..3])),
            serial: str16::from(text_field(&bytes[3..15])),
            model: str16::from(text_field(&bytes[15..27])),
            version: u16_be(bytes[27], bytes[28]),
        })
    }
}

fn pad_field(slot: &mut [u8], text: &str) {
    slot.fill(b' ');
    let take = text.len().min(slot.len());
    slot[..take].copy_from_slice(&text.as_bytes()[..take]);
}

// Non-UTF8 garbage in an ID field degrades to empty rather than failing the
// whole record.
fn text_field(bytes: &[u8]) -> &str {
    core::str::from_utf8(bytes).unwrap_or("").trim_end_matches(' ')
}

/// Capability record a cashless reader returns to SETUP/CONFIG_DATA, and the
/// currency scaling the pair uses for the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReaderConfig {
    pub feature_level: u8,
    pub country_code: u16,
    pub scale_factor: u8,
    pub decimal_places: u8,
    /// Seconds the VMC must allow before declaring non-response.
    pub max_response_time: u8,
    pub options: u8,
}

impl ReaderConfig {
    pub const WIRE_LEN: usize = 7;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = self.feature_level;
        buf[1..3].copy_from_slice(&self.country_code.to_be_bytes());
        buf[3] = self.scale_factor;
        buf[4] = self.decimal_places;
        buf[5] = self.max_response_time;
        buf[6] = self.options;
        Self::WIRE_LEN
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            feature_level: bytes[0],
            country_code: u16_be(bytes[1], bytes[2]),
            scale_factor: bytes[3],
            decimal_places: bytes[4],
            max_response_time: bytes[5],
            options: bytes[6],
        })
    }

    /// Convert a price in minor currency units (cents) to the scaled wire
    /// integer. Saturates rather than wrapping on absurd configurations.
    pub fn to_scaled(&self, minor_units: u16) -> u16 {
        let scale = self.scale_factor.max(1) as u32 * 100;
        let value = minor_units as u32 * 10u32.pow(self.decimal_places.min(4) as u32) / scale;
        value.min(u16::MAX as u32) as u16
    }

    /// Inverse of [`Self::to_scaled`].
    pub fn from_scaled(&self, wire: u16) -> u16 {
        let scale = self.scale_factor.max(1) as u32 * 100;
        let value = wire as u32 * scale / 10u32.pow(self.decimal_places.min(4) as u32);
        value.min(u16::MAX as u32) as u16
    }
}

impl Default for ReaderConfig {
    /// Level-1 reader, no country code, prices in cents, 120 s response
    /// window, refunds + multivend flagged off.
    fn default() -> Self {
        Self {
            feature_level: 1,
            country_code: 0xFFFF,
            scale_factor: 1,
            decimal_places: 2,
            max_response_time: 120,
            options: 0b0000_1001,
        }
    }
}

/// What the VMC told its peripheral about itself in SETUP/CONFIG_DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VmcConfig {
    pub feature_level: u8,
    pub display_columns: u8,
    pub display_rows: u8,
    pub display_info: u8,
}

/// A fully decoded VMC-to-peripheral command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmcCommand {
    Reset,
    SetupConfig(VmcConfig),
    SetupPrices { max: u16, min: u16 },
    Poll,
    VendRequest { price: u16, item: u16 },
    VendCancel,
    VendSuccess { item: u16 },
    VendFailure,
    SessionComplete,
    CashSale { price: u16, item: u16 },
    ReaderDisable,
    ReaderEnable,
    ReaderCancel,
    RequestId(Identity),
}

impl VmcCommand {
    /// Decode a received frame (address byte included, checksum already
    /// stripped). `None` means the frame is malformed for its command, which
    /// the bus answers with silence.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (&first, payload) = bytes.split_first()?;
        let command = Command::try_from(first).ok()?;
        match command {
            Command::Reset => Some(VmcCommand::Reset),
            Command::Poll => Some(VmcCommand::Poll),
            Command::Setup => match (*payload.first()?, payload) {
                (sub::CONFIG_DATA, [_, level, cols, rows, info]) => {
                    Some(VmcCommand::SetupConfig(VmcConfig {
                        feature_level: *level,
                        display_columns: *cols,
                        display_rows: *rows,
                        display_info: *info,
                    }))
                }
                (sub::MAX_MIN_PRICES, [_, max_hi, max_lo, min_hi, min_lo]) => {
                    Some(VmcCommand::SetupPrices {
                        max: u16_be(*max_hi, *max_lo),
                        min: u16_be(*min_hi, *min_lo),
                    })
                }
                _ => None,
            },
            Command::Vend => match (*payload.first()?, payload) {
                (sub::VEND_REQUEST, [_, p_hi, p_lo, i_hi, i_lo]) => Some(VmcCommand::VendRequest {
                    price: u16_be(*p_hi, *p_lo),
                    item: u16_be(*i_hi, *i_lo),
                }),
                (sub::VEND_CANCEL, [_]) => Some(VmcCommand::VendCancel),
                (sub::VEND_SUCCESS, [_, i_hi, i_lo]) => Some(VmcCommand::VendSuccess {
                    item: u16_be(*i_hi, *i_lo),
                }),
                (sub::VEND_FAILURE, [_]) => Some(VmcCommand::VendFailure),
                (sub::SESSION_COMPLETE, [_]) => Some(VmcCommand::SessionComplete),
                (sub::CASH_SALE, [_, p_hi, p_lo, i_hi, i_lo]) => Some(VmcCommand::CashSale {
                    price: u16_be(*p_hi, *p_lo),
                    item: u16_be(*i_hi, *i_lo),
                }),
                _ => None,
            },
            Command::Reader => match payload {
                [sub::READER_DISABLE] => Some(VmcCommand::ReaderDisable),
                [sub::READER_ENABLE] => Some(VmcCommand::ReaderEnable),
                [sub::READER_CANCEL] => Some(VmcCommand::ReaderCancel),
                _ => None,
            },
            Command::Expansion => match payload.split_first()? {
                (&sub::REQUEST_ID, id_bytes) => Identity::parse(id_bytes).map(VmcCommand::RequestId),
                _ => None,
            },
        }
    }

    /// Encode for transmission to `addr`, address byte included, checksum
    /// left to the codec. Returns the encoded frame.
    pub fn encode(&self, addr: PeripheralAddress) -> Frame {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let (command, len) = match self {
            VmcCommand::Reset => (Command::Reset, 0),
            VmcCommand::Poll => (Command::Poll, 0),
            VmcCommand::SetupConfig(cfg) => {
                buf[1..6].copy_from_slice(&[
                    sub::CONFIG_DATA,
                    cfg.feature_level,
                    cfg.display_columns,
                    cfg.display_rows,
                    cfg.display_info,
                ]);
                (Command::Setup, 5)
            }
            VmcCommand::SetupPrices { max, min } => {
                buf[1] = sub::MAX_MIN_PRICES;
                buf[2..4].copy_from_slice(&max.to_be_bytes());
                buf[4..6].copy_from_slice(&min.to_be_bytes());
                (Command::Setup, 5)
            }
            VmcCommand::VendRequest { price, item } => {
                buf[1] = sub::VEND_REQUEST;
                buf[2..4].copy_from_slice(&price.to_be_bytes());
                buf[4..6].copy_from_slice(&item.to_be_bytes());
                (Command::Vend, 5)
            }
            VmcCommand::VendCancel => {
                buf[1] = sub::VEND_CANCEL;
                (Command::Vend, 1)
            }
            VmcCommand::VendSuccess { item } => {
                buf[1] = sub::VEND_SUCCESS;
                buf[2..4].copy_from_slice(&item.to_be_bytes());
                (Command::Vend, 3)
            }
            VmcCommand::VendFailure => {
                buf[1] = sub::VEND_FAILURE;
                (Command::Vend, 1)
            }
            VmcCommand::SessionComplete => {
                buf[1] = sub::SESSION_COMPLETE;
                (Command::Vend, 1)
            }
            VmcCommand::CashSale { price, item } => {
                buf[1] = sub::CASH_SALE;
                buf[2..4].copy_from_slice(&price.to_be_bytes());
                buf[4..6].copy_from_slice(&item.to_be_bytes());
                (Command::Vend, 5)
            }
            VmcCommand::ReaderDisable => {
                buf[1] = sub::READER_DISABLE;
                (Command::Reader, 1)
            }
            VmcCommand::ReaderEnable => {
                buf[1] = sub::READER_ENABLE;
                (Command::Reader, 1)
            }
            VmcCommand::ReaderCancel => {
                buf[1] = sub::READER_CANCEL;
                (Command::Reader, 1)
            }
            VmcCommand::RequestId(id) => {
                buf[1] = sub::REQUEST_ID;
                let written = id.encode(&mut buf[2..]);
                (Command::Expansion, 1 + written)
            }
        };
        buf[0] = addr.base() | command as u8;
        Frame::new(&buf[..1 + len])
    }
}

/// The single event a peripheral may report per POLL response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollReply {
    JustReset,
    ReaderConfig(ReaderConfig),
    BeginSession { funds: u16 },
    SessionCancelRequest,
    VendApproved { amount: u16 },
    VendDenied,
    EndSession,
    Cancelled,
    PeripheralId(Identity),
    OutOfSequence,
}

impl PollReply {
    /// Encode into `buf`, returning the slice to hand to the codec.
    pub fn encode<'a>(&self, buf: &'a mut [u8; MAX_FRAME_LEN]) -> &'a [u8] {
        let len = match self {
            PollReply::JustReset => {
                buf[0] = reply_id::JUST_RESET;
                1
            }
            PollReply::ReaderConfig(cfg) => {
                buf[0] = reply_id::READER_CONFIG;
                1 + cfg.encode(&mut buf[1..])
            }
            PollReply::BeginSession { funds } => {
                buf[0] = reply_id::BEGIN_SESSION;
                buf[1..3].copy_from_slice(&funds.to_be_bytes());
                3
            }
            PollReply::SessionCancelRequest => {
                buf[0] = reply_id::SESSION_CANCEL_REQUEST;
                1
            }
            PollReply::VendApproved { amount } => {
                buf[0] = reply_id::VEND_APPROVED;
                buf[1..3].copy_from_slice(&amount.to_be_bytes());
                3
            }
            PollReply::VendDenied => {
                buf[0] = reply_id::VEND_DENIED;
                1
            }
            PollReply::EndSession => {
                buf[0] = reply_id::END_SESSION;
                1
            }
            PollReply::Cancelled => {
                buf[0] = reply_id::CANCELLED;
                1
            }
            PollReply::PeripheralId(id) => {
                buf[0] = reply_id::PERIPHERAL_ID;
                1 + id.encode(&mut buf[1..])
            }
            PollReply::OutOfSequence => {
                buf[0] = reply_id::OUT_OF_SEQUENCE;
                1
            }
        };
        &buf[..len]
    }

    /// Decode a checksum-valid reply frame into its event.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (&id, payload) = bytes.split_first()?;
        match id {
            reply_id::JUST_RESET => Some(PollReply::JustReset),
            reply_id::READER_CONFIG => ReaderConfig::parse(payload).map(PollReply::ReaderConfig),
            reply_id::BEGIN_SESSION => match payload {
                [hi, lo] => Some(PollReply::BeginSession {
                    funds: u16_be(*hi, *lo),
                }),
                _ => None,
            },
            reply_id::SESSION_CANCEL_REQUEST => Some(PollReply::SessionCancelRequest),
            reply_id::VEND_APPROVED => match payload {
                [hi, lo] => Some(PollReply::VendApproved {
                    amount: u16_be(*hi, *lo),
                }),
                _ => None,
            },
            reply_id::VEND_DENIED => Some(PollReply::VendDenied),
            reply_id::END_SESSION => Some(PollReply::EndSession),
            reply_id::CANCELLED => Some(PollReply::Cancelled),
            reply_id::PERIPHERAL_ID => Identity::parse(payload).map(PollReply::PeripheralId),
            reply_id::OUT_OF_SEQUENCE => Some(PollReply::OutOfSequence),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_byte_splits_into_address_and_command() {
        assert!(PeripheralAddress::Cashless1.matches(0x12));
        assert!(!PeripheralAddress::Cashless1.matches(0x62));
        assert_eq!(PeripheralAddress::try_from(0x63), Ok(PeripheralAddress::Cashless2));
        // Command bits never disturb the address lookup.
        assert_eq!(PeripheralAddress::try_from(0x0A), Ok(PeripheralAddress::CoinChanger));
        // Bill validator at 0x30 is nobody we speak for.
        assert_eq!(PeripheralAddress::try_from(0x32), Err(0x32));
        assert_eq!(Command::try_from(0x12), Ok(Command::Poll));
        assert_eq!(Command::try_from(0x15), Err(0x05));
    }

    #[test]
    fn parses_setup_config() {
        let cmd = VmcCommand::parse(&[0x11, 0x00, 0x01, 0x00, 0x00, 0x01]);
        assert_eq!(
            cmd,
            Some(VmcCommand::SetupConfig(VmcConfig {
                feature_level: 1,
                display_columns: 0,
                display_rows: 0,
                display_info: 1,
            }))
        );
    }

    #[test]
    fn parses_vend_request() {
        let cmd = VmcCommand::parse(&[0x13, 0x00, 0x00, 0x96, 0x00, 0x03]);
        assert_eq!(cmd, Some(VmcCommand::VendRequest { price: 150, item: 3 }));
    }

    #[test]
    fn parses_reader_subcommands() {
        assert_eq!(VmcCommand::parse(&[0x14, 0x00]), Some(VmcCommand::ReaderDisable));
        assert_eq!(VmcCommand::parse(&[0x14, 0x01]), Some(VmcCommand::ReaderEnable));
        assert_eq!(VmcCommand::parse(&[0x14, 0x02]), Some(VmcCommand::ReaderCancel));
        assert_eq!(VmcCommand::parse(&[0x14, 0x03]), None);
    }

    #[test]
    fn rejects_truncated_payloads() {
        assert_eq!(VmcCommand::parse(&[0x13, 0x00, 0x00]), None);
        assert_eq!(VmcCommand::parse(&[0x11, 0x01, 0x00]), None);
        assert_eq!(VmcCommand::parse(&[]), None);
    }

    #[test]
    fn command_encode_parse_round_trip() {
        let commands = [
            VmcCommand::Reset,
            VmcCommand::Poll,
            VmcCommand::SetupPrices { max: 200, min: 100 },
            VmcCommand::VendRequest { price: 150, item: 3 },
            VmcCommand::VendSuccess { item: 3 },
            VmcCommand::SessionComplete,
            VmcCommand::CashSale { price: 120, item: 7 },
            VmcCommand::ReaderEnable,
        ];
        for cmd in commands {
            let frame = cmd.encode(PeripheralAddress::Cashless1);
            assert_eq!(VmcCommand::parse(frame.bytes()), Some(cmd), "{:?}", cmd);
            assert!(PeripheralAddress::Cashless1.matches(frame.bytes()[0]));
        }
    }

    #[test]
    fn identity_is_space_padded_on_the_wire() {
        let id = Identity::new("NAY", "A1-000042", "OPENVEND", 0x0102);
        let mut buf = [0u8; Identity::WIRE_LEN];
        assert_eq!(id.encode(&mut buf), Identity::WIRE_LEN);
        assert_eq!(&buf[0..3], b"NAY");
        assert_eq!(&buf[3..15], b"A1-000042   ");
        assert_eq!(&buf[15..27], b"OPENVEND    ");
        assert_eq!(&buf[27..29], [0x01, 0x02]);
        assert_eq!(Identity::parse(&buf), Some(id));
    }

    #[test]
    fn identity_survives_non_utf8_fields() {
        let mut buf = [b' '; Identity::WIRE_LEN];
        buf[0] = 0xFF;
        let id = Identity::parse(&buf).unwrap();
        assert_eq!(id.manufacturer.as_str(), "");
    }

    #[test]
    fn reader_config_wire_layout() {
        let cfg = ReaderConfig::default();
        let mut buf = [0u8; ReaderConfig::WIRE_LEN];
        cfg.encode(&mut buf);
        assert_eq!(buf, [0x01, 0xFF, 0xFF, 0x01, 0x02, 0x78, 0x09]);
        assert_eq!(ReaderConfig::parse(&buf), Some(cfg));
    }

    #[test]
    fn currency_scaling_round_trips_for_default_config() {
        let cfg = ReaderConfig::default();
        // scale 1, two decimals: cents map straight through.
        assert_eq!(cfg.to_scaled(150), 150);
        assert_eq!(cfg.from_scaled(150), 150);

        let coarse = ReaderConfig {
            scale_factor: 5,
            decimal_places: 2,
            ..cfg
        };
        assert_eq!(coarse.to_scaled(500), 100);
        assert_eq!(coarse.from_scaled(100), 500);
    }

    #[test]
    fn poll_reply_encode_parse_round_trip() {
        let replies = [
            PollReply::JustReset,
            PollReply::ReaderConfig(ReaderConfig::default()),
            PollReply::BeginSession { funds: 500 },
            PollReply::SessionCancelRequest,
            PollReply::VendApproved { amount: 150 },
            PollReply::VendDenied,
            PollReply::EndSession,
            PollReply::Cancelled,
            PollReply::PeripheralId(Identity::new("NAY", "A1-000042", "OPENVEND", 1)),
            PollReply::OutOfSequence,
        ];
        let mut buf = [0u8; MAX_FRAME_LEN];
        for reply in replies {
            let bytes = reply.encode(&mut buf);
            assert_eq!(PollReply::parse(bytes), Some(reply), "{:?}", reply);
        }
        assert_eq!(PollReply::parse(&[0x42]), None);
    }
}
