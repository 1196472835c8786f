//! Object headers: the list of messages describing a group, dataset or committed datatype.

use super::decoder::{malformed, Decoder};
use super::raw::RawFile;
use crate::error::H5LensError;

use bytes::Bytes;
use std::collections::VecDeque;

pub const NIL: u16 = 0x00;
pub const DATASPACE: u16 = 0x01;
pub const LINK_INFO: u16 = 0x02;
pub const DATATYPE: u16 = 0x03;
pub const FILL_VALUE_OLD: u16 = 0x04;
pub const FILL_VALUE: u16 = 0x05;
pub const LINK: u16 = 0x06;
pub const LAYOUT: u16 = 0x08;
pub const FILTER_PIPELINE: u16 = 0x0B;
pub const ATTRIBUTE: u16 = 0x0C;
pub const CONTINUATION: u16 = 0x10;
pub const SYMBOL_TABLE: u16 = 0x11;
pub const ATTRIBUTE_INFO: u16 = 0x15;

/// Message flag marking a message stored elsewhere.
const SHARED: u8 = 0x02;

/// Continuation blocks followed before a header is rejected.
const MAX_CONTINUATIONS: usize = 1024;

/// One header message.
#[derive(Clone, Debug)]
pub struct Message {
    pub kind: u16,
    pub flags: u8,
    pub data: Bytes,
}

/// A decoded object header.
#[derive(Clone, Debug)]
pub struct ObjectHeader {
    pub address: u64,
    pub messages: Vec<Message>,
}

impl ObjectHeader {
    /// Read the header at `address`, following continuation blocks and resolving shared
    /// messages.
    pub fn read(file: &RawFile, address: u64) -> Result<Self, H5LensError> {
        let mut header = Self::read_unshared(file, address)?;
        for message in header.messages.iter_mut() {
            if message.flags & SHARED != 0 {
                message.data = resolve_shared(file, message.kind, &message.data)?;
                message.flags &= !SHARED;
            }
        }
        Ok(header)
    }

    fn read_unshared(file: &RawFile, address: u64) -> Result<Self, H5LensError> {
        let prefix = file.read_at_most(address, 64)?;
        if prefix.starts_with(b"OHDR") {
            Self::read_v2(file, address, prefix)
        } else {
            Self::read_v1(file, address, prefix)
        }
    }

    fn read_v1(file: &RawFile, address: u64, prefix: Bytes) -> Result<Self, H5LensError> {
        let mut d = Decoder::new(prefix);
        let version = d.u8()?;
        if version != 1 {
            return Err(malformed(format!(
                "object header version {version} at {address}"
            )));
        }
        d.skip(1)?;
        let count = usize::from(d.u16()?);
        // Reference count
        d.skip(4)?;
        let size = u64::from(d.u32()?);
        // Messages start on the next eight byte boundary.
        let mut blocks = VecDeque::from([(address + 16, size)]);
        let mut messages = vec![];
        let mut seen = 0;
        let mut followed = 0;
        while let Some((block, len)) = blocks.pop_front() {
            let mut d = file.decoder(block, len)?;
            while d.remaining() >= 8 && seen < count {
                let kind = d.u16()?;
                let size = usize::from(d.u16()?);
                let flags = d.u8()?;
                d.skip(3)?;
                let data = d.take(size)?;
                seen += 1;
                push_message(file, &mut messages, &mut blocks, kind, flags, data)?;
            }
            followed += 1;
            if followed > MAX_CONTINUATIONS {
                return Err(malformed("too many object header continuations"));
            }
        }
        Ok(ObjectHeader { address, messages })
    }

    fn read_v2(file: &RawFile, address: u64, prefix: Bytes) -> Result<Self, H5LensError> {
        let mut d = Decoder::new(prefix);
        d.signature(b"OHDR")?;
        let version = d.u8()?;
        if version != 2 {
            return Err(malformed(format!(
                "object header version {version} at {address}"
            )));
        }
        let flags = d.u8()?;
        if flags & 0x20 != 0 {
            // Access, modification, change and birth times
            d.skip(16)?;
        }
        if flags & 0x10 != 0 {
            // Attribute storage phase change values
            d.skip(4)?;
        }
        let size = d.uint(1 << (flags & 0x03))?;
        let tracks_order = flags & 0x04 != 0;
        let mut blocks = VecDeque::from([(address + d.position() as u64, size, false)]);
        let mut messages = vec![];
        let mut followed = 0;
        while let Some((block, len, continuation)) = blocks.pop_front() {
            let mut d = if continuation {
                let mut d = file.decoder(block, len)?;
                d.signature(b"OCHK")?;
                // Trailing checksum
                Decoder::new(d.take(d.remaining().saturating_sub(4))?)
            } else {
                file.decoder(block, len)?
            };
            let header_len = if tracks_order { 6 } else { 4 };
            let mut continued = VecDeque::new();
            while d.remaining() >= header_len {
                let kind = u16::from(d.u8()?);
                let size = usize::from(d.u16()?);
                let flags = d.u8()?;
                if tracks_order {
                    d.skip(2)?;
                }
                let data = d.take(size)?;
                push_message(file, &mut messages, &mut continued, kind, flags, data)?;
            }
            blocks.extend(continued.into_iter().map(|(a, l)| (a, l, true)));
            followed += 1;
            if followed > MAX_CONTINUATIONS {
                return Err(malformed("too many object header continuations"));
            }
        }
        Ok(ObjectHeader { address, messages })
    }

    /// Data of the first message of a kind.
    pub fn message(&self, kind: u16) -> Option<&Bytes> {
        self.messages(kind).next()
    }

    /// Data of every message of a kind, in header order.
    pub fn messages(&self, kind: u16) -> impl Iterator<Item = &Bytes> + '_ {
        self.messages
            .iter()
            .filter(move |message| message.kind == kind)
            .map(|message| &message.data)
    }

    pub fn has(&self, kind: u16) -> bool {
        self.message(kind).is_some()
    }
}

fn push_message(
    file: &RawFile,
    messages: &mut Vec<Message>,
    blocks: &mut VecDeque<(u64, u64)>,
    kind: u16,
    flags: u8,
    data: Bytes,
) -> Result<(), H5LensError> {
    match kind {
        NIL => (),
        CONTINUATION => {
            let mut d = Decoder::new(data);
            let address = d
                .address(file.sizes)?
                .ok_or_else(|| malformed("continuation without an address"))?;
            let len = d.length(file.sizes)?;
            blocks.push_back((address, len));
        }
        _ => messages.push(Message { kind, flags, data }),
    }
    Ok(())
}

/// Fetch the body of a message shared through another object header.
pub fn resolve_shared(file: &RawFile, kind: u16, data: &Bytes) -> Result<Bytes, H5LensError> {
    let mut d = Decoder::new(data.clone());
    let version = d.u8()?;
    let location = d.u8()?;
    let address = match version {
        1 => {
            // Reserved bytes, then a symbol table entry whose name offset is skipped.
            d.skip(6)?;
            d.length(file.sizes)?;
            d.address(file.sizes)?
        }
        2 => d.address(file.sizes)?,
        3 if location == 2 => d.address(file.sizes)?,
        3 => return Err(malformed("messages in the shared message heap are not supported")),
        _ => return Err(malformed(format!("shared message version {version}"))),
    };
    let address = address.ok_or_else(|| malformed("shared message without an address"))?;
    let target = ObjectHeader::read_unshared(file, address)?;
    target
        .message(kind)
        .cloned()
        .ok_or_else(|| malformed(format!("shared message {kind:#x} not found at {address}")))
}
