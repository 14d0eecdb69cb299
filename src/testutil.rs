//! Shared test doubles. A scripted in-memory [`BitLink`] lets the codec,
//! sequencer, and responder run under `block_on` with no hardware.

use std::collections::VecDeque;

use crate::frame::{checksum, MdbStatus};
use crate::link::{BitLink, Word9};

/// A link whose receive side is a pre-loaded script and whose transmit side
/// records every word. When the script runs dry, `recv` pends forever, which
/// is exactly what a silent bus looks like to a timeout wrapper.
pub struct ScriptLink {
    pub rx: VecDeque<Word9>,
    pub tx: Vec<Word9>,
}

impl ScriptLink {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            tx: Vec::new(),
        }
    }

    /// Queue a VMC-direction frame: flagged first byte, plain checksum.
    pub fn feed_addressed(&mut self, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.rx.push_back(Word9::new(*b, i == 0));
        }
        self.rx.push_back(Word9::plain(checksum(bytes)));
    }

    /// Queue a peripheral-direction reply: plain data, flagged checksum.
    pub fn feed_reply(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.rx.push_back(Word9::plain(*b));
        }
        self.rx.push_back(Word9::flagged(checksum(bytes)));
    }

    /// Queue a bare status word.
    pub fn feed_status(&mut self, status: MdbStatus) {
        self.rx.push_back(Word9::flagged(status.to_byte()));
    }

    /// The words sent since the last call, decoded back into bytes with
    /// their mode flags, oldest first.
    pub fn drain_tx(&mut self) -> Vec<Word9> {
        core::mem::take(&mut self.tx)
    }
}

impl BitLink for ScriptLink {
    type LinkError = core::convert::Infallible;

    async fn send(&mut self, word: Word9) -> Result<(), Self::LinkError> {
        self.tx.push(word);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Word9, Self::LinkError> {
        match self.rx.pop_front() {
            Some(word) => Ok(word),
            None => core::future::pending().await,
        }
    }
}
