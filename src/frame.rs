//! Frame layer: grouping 9-bit words into checksummed MDB frames.
//!
//! The two bus directions delimit frames differently. The VMC raises the mode
//! flag on the *address* byte that opens a command frame; the peripheral
//! raises it on the *checksum* byte that closes a reply. Single flagged words
//! with no preceding data are the ACK/RET/NAK status vocabulary.

use crate::link::{BitLink, Word9};
use crate::MdbError;

/// Largest frame either direction carries (the 30-byte peripheral ID reply
/// plus address and some headroom).
pub const MAX_FRAME_LEN: usize = 36;

/// Additive mod-256 checksum over a byte run. The mode flag is never part
/// of the sum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// A received frame: address/command byte plus payload, checksum stripped.
#[derive(Clone, Copy)]
pub struct Frame {
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl Frame {
    pub const fn empty() -> Self {
        Self {
            buf: [0; MAX_FRAME_LEN],
            len: 0,
        }
    }

    pub fn new(bytes: &[u8]) -> Self {
        let mut frame = Self::empty();
        frame.buf[..bytes.len()].copy_from_slice(bytes);
        frame.len = bytes.len();
        frame
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn push(&mut self, byte: u8) -> Result<(), ()> {
        if self.len == MAX_FRAME_LEN {
            return Err(());
        }
        self.buf[self.len] = byte;
        self.len += 1;
        Ok(())
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl Eq for Frame {}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Frame(")?;
        for (i, b) in self.bytes().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Frame {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Frame({:02x})", self.bytes());
    }
}

/// Single-word status vocabulary. Status words carry no checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MdbStatus {
    /// Acknowledged / checksum correct.
    Ack,
    /// Retransmit the previous reply. Only the VMC may send this.
    Ret,
    /// Negative acknowledge.
    Nak,
}

impl MdbStatus {
    pub const fn to_byte(self) -> u8 {
        match self {
            MdbStatus::Ack => 0x00,
            MdbStatus::Ret => 0xAA,
            MdbStatus::Nak => 0xFF,
        }
    }

    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(MdbStatus::Ack),
            0xAA => Some(MdbStatus::Ret),
            0xFF => Some(MdbStatus::Nak),
            _ => None,
        }
    }
}

/// What came back from a peripheral: a bare status word or a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Reply {
    Status(MdbStatus),
    Data(Frame),
}

/// Frame codec over a word link. Owns the link exclusively; neither bus role
/// ever drives it from two call sites.
pub struct FrameCodec<L: BitLink> {
    link: L,
}

impl<L: BitLink> FrameCodec<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// VMC direction: mode flag on the address byte, checksum appended with
    /// the flag clear.
    pub async fn send_addressed(&mut self, bytes: &[u8]) -> Result<(), MdbError<L::LinkError>> {
        let mut sum: u8 = 0;
        for (i, b) in bytes.iter().enumerate() {
            self.link.send(Word9::new(*b, i == 0)).await?;
            sum = sum.wrapping_add(*b);
        }
        self.link.send(Word9::plain(sum)).await?;
        Ok(())
    }

    /// Peripheral direction: data bytes with the flag clear, checksum with
    /// the flag set. An empty reply degenerates to the flagged 0x00 word,
    /// which reads back as ACK.
    pub async fn send_reply(&mut self, bytes: &[u8]) -> Result<(), MdbError<L::LinkError>> {
        let mut sum: u8 = 0;
        for b in bytes {
            self.link.send(Word9::plain(*b)).await?;
            sum = sum.wrapping_add(*b);
        }
        self.link.send(Word9::flagged(sum)).await?;
        Ok(())
    }

    /// The VMC asserts the mode flag on its status words.
    pub async fn send_status(&mut self, status: MdbStatus) -> Result<(), MdbError<L::LinkError>> {
        self.link.send(Word9::flagged(status.to_byte())).await?;
        Ok(())
    }

    /// Peripheral-side read: a mode-flagged word (re)opens accumulation, and
    /// the frame closes when a word equals the running sum. That word is the
    /// checksum and is not part of the payload.
    ///
    /// Corruption never surfaces here: a frame whose checksum cannot match
    /// simply never completes, and the next flagged address byte restarts the
    /// accumulator. That silence is the MDB-mandated recovery; the VMC times
    /// out and retransmits.
    pub async fn recv_addressed(&mut self) -> Result<Frame, MdbError<L::LinkError>> {
        let mut frame = Frame::empty();
        let mut sum: u8 = 0;
        let mut in_frame = false;
        loop {
            let word = self.link.recv().await?;
            if word.mode {
                frame.clear();
                sum = 0;
                in_frame = true;
            }
            if !in_frame {
                // ACK chatter or another peripheral's reply; not ours.
                continue;
            }
            if !word.mode && word.data == sum && !frame.is_empty() {
                return Ok(frame);
            }
            if frame.push(word.data).is_err() {
                debug!("frame overflow, discarding");
                in_frame = false;
                continue;
            }
            sum = sum.wrapping_add(word.data);
        }
    }

    /// Master-side read: words accumulate until a mode-flagged word closes
    /// the reply. A flagged word with no preceding data is a status; anything
    /// longer must end in a checksum matching the running sum.
    pub async fn recv_reply(&mut self) -> Result<Reply, MdbError<L::LinkError>> {
        let mut frame = Frame::empty();
        let mut sum: u8 = 0;
        loop {
            let word = self.link.recv().await?;
            if !word.mode {
                if frame.push(word.data).is_err() {
                    return Err(MdbError::BufferOverrun);
                }
                sum = sum.wrapping_add(word.data);
                continue;
            }
            if frame.is_empty() {
                return match MdbStatus::from_byte(word.data) {
                    Some(status) => Ok(Reply::Status(status)),
                    None => {
                        error!("invalid status word {:x}", word.data);
                        Err(MdbError::MalformedMessage)
                    }
                };
            }
            if word.data == sum {
                return Ok(Reply::Data(frame));
            }
            error!("reply checksum mismatch: got {:x}, expected {:x}", word.data, sum);
            return Err(MdbError::WrongChecksum);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptLink;
    use embassy_futures::block_on;

    #[test]
    fn additive_checksum() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0x12]), 0x12);
        assert_eq!(checksum(&[0x11, 0x00, 0x01, 0x00, 0x00, 0x01]), 0x13);
        // Wraps mod 256.
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
    }

    #[test]
    fn send_addressed_flags_first_byte_only() {
        let mut codec = FrameCodec::new(ScriptLink::new());
        block_on(codec.send_addressed(&[0x13, 0x00, 0x00, 0x96])).unwrap();
        assert_eq!(
            codec.link_mut().tx,
            [
                Word9::flagged(0x13),
                Word9::plain(0x00),
                Word9::plain(0x00),
                Word9::plain(0x96),
                Word9::plain(0xA9),
            ]
        );
    }

    #[test]
    fn send_reply_flags_checksum() {
        let mut codec = FrameCodec::new(ScriptLink::new());
        block_on(codec.send_reply(&[0x03, 0x01, 0xF4])).unwrap();
        assert_eq!(
            codec.link_mut().tx,
            [
                Word9::plain(0x03),
                Word9::plain(0x01),
                Word9::plain(0xF4),
                Word9::flagged(0xF8),
            ]
        );
    }

    #[test]
    fn empty_reply_is_a_bare_ack_word() {
        let mut codec = FrameCodec::new(ScriptLink::new());
        block_on(codec.send_reply(&[])).unwrap();
        assert_eq!(codec.link_mut().tx, [Word9::flagged(0x00)]);
    }

    #[test]
    fn recv_addressed_reads_one_frame() {
        let mut link = ScriptLink::new();
        link.feed_addressed(&[0x12]);
        let mut codec = FrameCodec::new(link);
        let frame = block_on(codec.recv_addressed()).unwrap();
        assert_eq!(frame.bytes(), [0x12]);
    }

    #[test]
    fn recv_addressed_skips_corrupt_frame() {
        let mut link = ScriptLink::new();
        // A frame whose checksum byte was corrupted on the wire, followed by
        // a clean retransmission.
        link.rx.push_back(Word9::flagged(0x12));
        link.rx.push_back(Word9::plain(0xFF));
        link.feed_addressed(&[0x12]);
        let mut codec = FrameCodec::new(link);
        let frame = block_on(codec.recv_addressed()).unwrap();
        assert_eq!(frame.bytes(), [0x12]);
    }

    #[test]
    fn recv_addressed_ignores_unflagged_noise() {
        let mut link = ScriptLink::new();
        link.rx.push_back(Word9::plain(0x55));
        link.rx.push_back(Word9::plain(0xAA));
        link.feed_addressed(&[0x14, 0x01]);
        let mut codec = FrameCodec::new(link);
        let frame = block_on(codec.recv_addressed()).unwrap();
        assert_eq!(frame.bytes(), [0x14, 0x01]);
    }

    #[test]
    fn recv_addressed_handles_multibyte_payload() {
        let mut link = ScriptLink::new();
        link.feed_addressed(&[0x13, 0x00, 0x00, 0x96, 0x00, 0x03]);
        let mut codec = FrameCodec::new(link);
        let frame = block_on(codec.recv_addressed()).unwrap();
        assert_eq!(frame.bytes(), [0x13, 0x00, 0x00, 0x96, 0x00, 0x03]);
    }

    #[test]
    fn recv_reply_parses_status_words() {
        let mut link = ScriptLink::new();
        link.feed_status(MdbStatus::Ack);
        link.feed_status(MdbStatus::Nak);
        let mut codec = FrameCodec::new(link);
        block_on(async {
            assert_eq!(codec.recv_reply().await, Ok(Reply::Status(MdbStatus::Ack)));
            assert_eq!(codec.recv_reply().await, Ok(Reply::Status(MdbStatus::Nak)));
        });
    }

    #[test]
    fn recv_reply_parses_data_frame() {
        let mut link = ScriptLink::new();
        link.feed_reply(&[0x05, 0x00, 0x96]);
        let mut codec = FrameCodec::new(link);
        let reply = block_on(codec.recv_reply()).unwrap();
        assert_eq!(reply, Reply::Data(Frame::new(&[0x05, 0x00, 0x96])));
    }

    #[test]
    fn recv_reply_rejects_bad_checksum() {
        let mut link = ScriptLink::new();
        link.rx.push_back(Word9::plain(0x05));
        link.rx.push_back(Word9::flagged(0x99));
        let mut codec = FrameCodec::new(link);
        assert_eq!(
            block_on(codec.recv_reply()),
            Err(MdbError::WrongChecksum)
        );
    }

    #[test]
    fn recv_reply_rejects_unknown_status() {
        let mut link = ScriptLink::new();
        link.rx.push_back(Word9::flagged(0x42));
        let mut codec = FrameCodec::new(link);
        assert_eq!(
            block_on(codec.recv_reply()),
            Err(MdbError::MalformedMessage)
        );
    }
}
