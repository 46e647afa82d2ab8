// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Item Location Box (`iloc`) codec and the offset-rewrite operation
//! used by the rebuild engine.
//!
//! See ISO 14496-12:2015 § 8.11.3

use bitreader::BitReader;
use byteorder::{BigEndian, WriteBytesExt};
use log::{debug, warn};

use crate::parse::full_box_prefix;
use crate::{Error, Result};

/// One contiguous byte range of an item's data.
///
/// `offset` is absolute in the file (`base_offset + extent_offset` as
/// stored); an offset of exactly 0 is a sentinel, not a real pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

/// Where one item's bytes live, possibly split across discontiguous spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemLocation {
    pub item_id: u32,
    pub extents: Vec<Extent>,
}

/// Decoded `iloc` box.
///
/// The variable field widths observed at parse time are retained and reused
/// verbatim on encode, so a rebuild preserves the producer's layout choices.
#[derive(Debug, Clone)]
pub struct IlocBox {
    pub version: u8,
    pub flags: u32,
    pub offset_size: u8,
    pub length_size: u8,
    pub base_offset_size: u8,
    pub index_size: u8,
    pub locations: Vec<ItemLocation>,
}

/// Original-file geometry plus the per-region deltas for one rewrite pass.
#[derive(Debug, Clone, Copy)]
pub struct RewriteParams {
    pub mdat_delta: i64,
    pub original_mdat_offset: u64,
    pub original_mdat_size: u64,
    pub meta_delta: i64,
    pub original_meta_offset: u64,
    pub original_meta_size: u64,
}

fn field_size(nibble: u8) -> Result<u8> {
    match nibble {
        0 | 1 | 2 | 4 | 8 => Ok(nibble),
        _ => Err(Error::Unsupported("iloc field width must be 0, 1, 2, 4 or 8")),
    }
}

impl IlocBox {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (version, flags) =
            full_box_prefix(raw).ok_or(Error::InvalidData("iloc too short for version/flags"))?;
        if version > 2 {
            return Err(Error::Unsupported("unsupported version in 'iloc' box"));
        }

        let mut r = BitReader::new(raw.get(4..).unwrap_or_default());
        let offset_size = field_size(r.read_u8(4)?)?;
        let length_size = field_size(r.read_u8(4)?)?;
        let base_offset_size = field_size(r.read_u8(4)?)?;
        let index_size = if version >= 1 {
            field_size(r.read_u8(4)?)?
        } else {
            let _reserved = r.read_u8(4)?;
            0
        };

        let item_count = if version < 2 { r.read_u32(16)? } else { r.read_u32(32)? };

        let mut b = Self {
            version,
            flags,
            offset_size,
            length_size,
            base_offset_size,
            index_size,
            locations: Vec::new(),
        };

        for n in 0..item_count {
            match b.read_item(&mut r) {
                Ok(loc) => b.locations.push(loc),
                Err(e) => {
                    // Partial-result policy: keep what decoded cleanly.
                    debug!("iloc item {n}/{item_count} unreadable ({e}), stopping");
                    break;
                }
            }
        }
        Ok(b)
    }

    fn read_item(&self, r: &mut BitReader<'_>) -> Result<ItemLocation> {
        let item_id = if self.version < 2 { r.read_u32(16)? } else { r.read_u32(32)? };
        if self.version >= 1 {
            // reserved + construction method
            r.skip(16)?;
        }
        // data reference index
        r.skip(16)?;

        let base_offset = r.read_u64(self.base_offset_size * 8)?;
        let extent_count = r.read_u16(16)?;

        let mut extents = Vec::with_capacity(usize::from(extent_count));
        for _ in 0..extent_count {
            if self.version >= 1 && self.index_size > 0 {
                r.skip(u64::from(self.index_size) * 8)?;
            }
            let extent_offset = r.read_u64(self.offset_size * 8)?;
            let extent_length = r.read_u64(self.length_size * 8)?;
            let offset = base_offset
                .checked_add(extent_offset)
                .ok_or(Error::InvalidData("iloc offset calculation overflow"))?;
            extents.push(Extent { offset, length: extent_length });
        }
        Ok(ItemLocation { item_id, extents })
    }

    /// Encode the box body (FullBox prefix included) from current fields.
    ///
    /// `base_offset` is always re-emitted as 0 with the absolute offset
    /// folded entirely into `extent_offset`. When the file originally used a
    /// nonzero `base_offset_size` this changes meaning for producers that
    /// relied on the split, so it is logged as a compatibility risk.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.base_offset_size != 0 {
            warn!(
                "iloc base_offset_size is {}; re-emitting base_offset as 0 \
                 with absolute extent offsets",
                self.base_offset_size
            );
        }

        let mut out = Vec::new();
        out.write_u32::<BigEndian>(u32::from(self.version) << 24 | self.flags)?;
        let index_nibble = if self.version >= 1 { self.index_size } else { 0 };
        out.write_u16::<BigEndian>(
            u16::from(self.offset_size) << 12
                | u16::from(self.length_size) << 8
                | u16::from(self.base_offset_size) << 4
                | u16::from(index_nibble),
        )?;

        let count = self.locations.len();
        if self.version < 2 {
            let count =
                u16::try_from(count).map_err(|_| Error::Unsupported("too many iloc items for 16-bit count"))?;
            out.write_u16::<BigEndian>(count)?;
        } else {
            out.write_u32::<BigEndian>(count as u32)?;
        }

        for loc in &self.locations {
            if self.version < 2 {
                let id = u16::try_from(loc.item_id)
                    .map_err(|_| Error::Unsupported("item_id exceeds 16-bit iloc field"))?;
                out.write_u16::<BigEndian>(id)?;
            } else {
                out.write_u32::<BigEndian>(loc.item_id)?;
            }
            if self.version >= 1 {
                // reserved + construction method 0 (this file)
                out.write_u16::<BigEndian>(0)?;
            }
            // data reference index 0 (this file)
            out.write_u16::<BigEndian>(0)?;
            write_sized(&mut out, 0, self.base_offset_size)?;

            let extent_count = u16::try_from(loc.extents.len())
                .map_err(|_| Error::Unsupported("too many extents for 16-bit count"))?;
            out.write_u16::<BigEndian>(extent_count)?;
            for e in &loc.extents {
                if self.version >= 1 && self.index_size > 0 {
                    write_sized(&mut out, 0, self.index_size)?;
                }
                write_sized(&mut out, e.offset, self.offset_size)?;
                write_sized(&mut out, e.length, self.length_size)?;
            }
        }
        Ok(out)
    }

    /// Shift extents that point into the original `mdat` or `meta` spans by
    /// the corresponding delta.
    ///
    /// Classification is against the *original* file geometry, so this must
    /// run on as-parsed extent values — the rebuild engine re-installs a
    /// pristine copy before each pass. Offsets of exactly 0 are sentinels
    /// and stay 0; offsets outside both spans are assumed to point at
    /// non-relocating regions and stay unchanged. A delta that would drive
    /// an offset negative clamps it to 0; the returned count of clamped
    /// extents is nonzero only when the geometry model is wrong.
    pub fn rewrite_offsets(&mut self, p: &RewriteParams) -> u32 {
        let mdat_span = p.original_mdat_offset..p.original_mdat_offset.saturating_add(p.original_mdat_size);
        let meta_span = p.original_meta_offset..p.original_meta_offset.saturating_add(p.original_meta_size);
        let mut clamped = 0;

        for loc in &mut self.locations {
            for e in &mut loc.extents {
                if e.offset == 0 {
                    continue;
                }
                let delta = if mdat_span.contains(&e.offset) {
                    p.mdat_delta
                } else if meta_span.contains(&e.offset) {
                    p.meta_delta
                } else {
                    continue;
                };
                let shifted = i128::from(e.offset) + i128::from(delta);
                if shifted < 0 {
                    warn!(
                        "item {} extent offset {} + delta {} is negative, clamping to 0",
                        loc.item_id, e.offset, delta
                    );
                    e.offset = 0;
                    clamped += 1;
                } else {
                    e.offset = shifted as u64;
                }
            }
        }
        clamped
    }

    pub fn location(&self, item_id: u32) -> Option<&ItemLocation> {
        self.locations.iter().find(|loc| loc.item_id == item_id)
    }
}

/// Write `value` big-endian in exactly `size` bytes; size 0 writes nothing
/// and accepts only 0.
fn write_sized(out: &mut Vec<u8>, value: u64, size: u8) -> Result<()> {
    if size < 8 && value >> (u32::from(size) * 8) != 0 {
        return Err(Error::Unsupported("value does not fit iloc field width"));
    }
    let bytes = value.to_be_bytes();
    out.extend_from_slice(&bytes[8 - usize::from(size)..]);
    Ok(())
}
