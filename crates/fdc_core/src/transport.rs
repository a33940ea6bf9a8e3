/*
    MartyPC
    https://github.com/dbalsom/martypc

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    fdc_core::transport.rs

    Block transport used to move image streams on and off the host.
    
    The protocol that actually carries blocks to a remote machine lives outside
    this crate. StreamTransport is the plain implementation over std::io used
    by the headless frontend and the tests.
*/

use std::io::{ErrorKind, Read, Write};

use crate::imagestream::record::IMD_EOF;

pub const CAN: u8 = 0x18;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlockSize {
    #[default]
    Standard,
    OneK,
}

impl BlockSize {
    pub fn from_1k(block_1k: bool) -> Self {
        if block_1k {
            BlockSize::OneK
        }
        else {
            BlockSize::Standard
        }
    }

    pub fn bytes(&self) -> usize {
        match self {
            BlockSize::Standard => 128,
            BlockSize::OneK => 1024,
        }
    }
}

/// Moves fixed size blocks. Block numbers start at 1. A handler returning false ends the
/// transfer; both calls return whether the transfer completed.
pub trait Transport {
    fn block_size(&self) -> BlockSize;

    /// Send blocks produced by `pull` until it returns false.
    fn transmit(&mut self, pull: &mut dyn FnMut(u32, &mut [u8]) -> bool) -> bool;

    /// Hand each incoming block to `push` until the sender is done or `push` returns false.
    fn receive(&mut self, push: &mut dyn FnMut(u32, &[u8]) -> bool) -> bool;
}

/// True if `block` is a cancellation request rather than data.
pub fn is_cancel(block: &[u8]) -> bool {
    block.len() >= 2 && block[0] == CAN && block[1] == CAN
}

pub struct StreamTransport<S> {
    stream: S,
    block_size: BlockSize,
    blocks: u32,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S, block_size: BlockSize) -> Self {
        Self {
            stream,
            block_size,
            blocks: 0,
        }
    }

    /// Blocks moved by the last transfer.
    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read> StreamTransport<S> {
    /// Fill `block` from the stream. A short final read is padded with EOF bytes.
    fn read_block(&mut self, block: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < block.len() {
            match self.stream.read(&mut block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        block[filled..].fill(IMD_EOF);
        Ok(filled)
    }
}

impl<S: Read + Write> Transport for StreamTransport<S> {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn transmit(&mut self, pull: &mut dyn FnMut(u32, &mut [u8]) -> bool) -> bool {
        let mut block = vec![0u8; self.block_size.bytes()];
        self.blocks = 0;
        loop {
            if !pull(self.blocks + 1, &mut block) {
                break;
            }
            if let Err(e) = self.stream.write_all(&block) {
                log::error!("transmit(): block {}: {}", self.blocks + 1, e);
                return false;
            }
            self.blocks += 1;
        }
        match self.stream.flush() {
            Ok(()) => true,
            Err(e) => {
                log::error!("transmit(): {}", e);
                false
            }
        }
    }

    fn receive(&mut self, push: &mut dyn FnMut(u32, &[u8]) -> bool) -> bool {
        let mut block = vec![0u8; self.block_size.bytes()];
        self.blocks = 0;
        loop {
            match self.read_block(&mut block) {
                Ok(0) => return true,
                Ok(_) => {}
                Err(e) => {
                    log::error!("receive(): block {}: {}", self.blocks + 1, e);
                    return false;
                }
            }
            if is_cancel(&block) {
                log::warn!("receive(): transfer cancelled by sender");
                return false;
            }
            self.blocks += 1;
            if !push(self.blocks, &block) {
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_transmit_numbers_blocks() {
        let mut transport = StreamTransport::new(Cursor::new(Vec::new()), BlockSize::Standard);
        let mut seen = Vec::new();
        let ok = transport.transmit(&mut |n, block| {
            seen.push(n);
            block.fill(n as u8);
            n < 3
        });
        assert!(ok);
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(transport.blocks(), 2);

        let out = transport.into_inner().into_inner();
        assert_eq!(out.len(), 256);
        assert_eq!(out[0], 1);
        assert_eq!(out[255], 2);
    }

    #[test]
    fn test_receive_pads_last_block() {
        let data: Vec<u8> = (0..1100u32).map(|i| i as u8).collect();
        let mut transport = StreamTransport::new(Cursor::new(data), BlockSize::OneK);
        let mut blocks = Vec::new();
        assert!(transport.receive(&mut |n, block| {
            blocks.push((n, block.to_vec()));
            true
        }));

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].0, 2);
        assert_eq!(blocks[1].1.len(), 1024);
        assert_eq!(blocks[1].1[75], 1099u32 as u8);
        assert_eq!(blocks[1].1[76], IMD_EOF);
    }

    #[test]
    fn test_receive_stops_on_handler() {
        let mut transport = StreamTransport::new(Cursor::new(vec![0u8; 128 * 4]), BlockSize::Standard);
        let mut count = 0;
        assert!(transport.receive(&mut |_, _| {
            count += 1;
            count < 2
        }));
        assert_eq!(count, 2);
    }

    #[test]
    fn test_cancel() {
        let mut data = vec![CAN, CAN];
        data.resize(128, 0);
        let mut transport = StreamTransport::new(Cursor::new(data), BlockSize::Standard);
        let mut called = false;
        assert!(!transport.receive(&mut |_, _| {
            called = true;
            true
        }));
        assert!(!called);
        assert!(!is_cancel(&[CAN]));
    }
}
