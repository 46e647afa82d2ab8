// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Codecs for the item-metadata boxes under `meta`: `pitm`, `iinf`/`infe`,
//! `ispe`, `ipma` and `iref`.
//!
//! Each type parses from the box body (FullBox prefix included) and encodes
//! back to the same form, so the rebuild engine can re-emit mutated boxes
//! from fields.

use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::boxes::FourCC;
use crate::parse::{be_u16, be_u32, full_box_prefix, read_box_header};
use crate::tree::{BmffBox, BoxData};
use crate::{Error, Result};

fn prefix_or_eof(raw: &[u8]) -> Result<(u8, u32)> {
    full_box_prefix(raw).ok_or(Error::UnexpectedEOF)
}

/// Primary Item Box. Version 0 stores the item id in 16 bits, later
/// versions in 32.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PitmBox {
    pub version: u8,
    pub flags: u32,
    pub item_id: u32,
}

impl PitmBox {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (version, flags) = prefix_or_eof(raw)?;
        let mut src = raw.get(4..).ok_or(Error::UnexpectedEOF)?;
        let item_id = if version == 0 { u32::from(be_u16(&mut src)?) } else { be_u32(&mut src)? };
        Ok(Self { version, flags, item_id })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(u32::from(self.version) << 24 | self.flags)?;
        if self.version == 0 {
            let id = u16::try_from(self.item_id)
                .map_err(|_| Error::Unsupported("primary item id exceeds 16-bit pitm field"))?;
            out.write_u16::<BigEndian>(id)?;
        } else {
            out.write_u32::<BigEndian>(self.item_id)?;
        }
        Ok(out)
    }
}

/// Item Information Entry.
///
/// `name` holds the raw bytes up to (not including) the NUL terminator;
/// `trailing` preserves whatever follows it (content type strings and other
/// unmodeled fields) so re-encoding is lossless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfeBox {
    pub version: u8,
    pub flags: u32,
    pub item_id: u32,
    pub protection_index: u16,
    /// 4-byte item type tag; absent in versions 0 and 1.
    pub item_type: Option<FourCC>,
    pub name: Vec<u8>,
    pub trailing: Vec<u8>,
}

impl InfeBox {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (version, flags) = prefix_or_eof(raw)?;
        if version > 3 {
            return Err(Error::Unsupported("unsupported version in 'infe' box"));
        }
        let mut src = raw.get(4..).ok_or(Error::UnexpectedEOF)?;
        // Version 2 widens the item id to 32 bits; version 3 narrows it
        // back while keeping the type tag.
        let item_id = if version == 2 { be_u32(&mut src)? } else { u32::from(be_u16(&mut src)?) };
        let protection_index = be_u16(&mut src)?;
        let item_type = if version >= 2 {
            let mut tag = [0u8; 4];
            src.read_exact(&mut tag).map_err(|_| Error::UnexpectedEOF)?;
            Some(FourCC(tag))
        } else {
            None
        };
        let (name, trailing) = split_nul(src);
        Ok(Self { version, flags, item_id, protection_index, item_type, name, trailing })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(u32::from(self.version) << 24 | self.flags)?;
        if self.version == 2 {
            out.write_u32::<BigEndian>(self.item_id)?;
        } else {
            let id = u16::try_from(self.item_id)
                .map_err(|_| Error::Unsupported("item id exceeds 16-bit infe field"))?;
            out.write_u16::<BigEndian>(id)?;
        }
        out.write_u16::<BigEndian>(self.protection_index)?;
        if self.version >= 2 {
            let tag = self.item_type.ok_or(Error::InvalidData("infe version 2+ requires an item type"))?;
            out.extend_from_slice(&tag.0);
        }
        out.extend_from_slice(&self.name);
        out.push(0);
        out.extend_from_slice(&self.trailing);
        Ok(out)
    }

    /// Name as text, for display and matching. Non-UTF-8 names lose bytes
    /// here but not in `name` itself.
    pub fn name_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }
}

/// Split at the first NUL: bytes before it, bytes after it. A missing
/// terminator consumes the whole slice as the name.
fn split_nul(src: &[u8]) -> (Vec<u8>, Vec<u8>) {
    match src.iter().position(|&b| b == 0) {
        Some(n) => (src[..n].to_vec(), src[n + 1..].to_vec()),
        None => (src.to_vec(), Vec::new()),
    }
}

/// Summary row for one `infe` child, cached on the parent `iinf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfoEntry {
    pub item_id: u32,
    pub item_type: Option<FourCC>,
    pub name: Vec<u8>,
}

/// Item Information Box. The authoritative state is the `infe` children on
/// the tree node; `entries` is a summary promoted at parse time and kept in
/// step by the mutators.
#[derive(Debug, Clone)]
pub struct IinfBox {
    pub version: u8,
    pub flags: u32,
    pub entries: Vec<ItemInfoEntry>,
}

impl IinfBox {
    pub fn from_children(raw: &[u8], children: &[BmffBox]) -> Result<Self> {
        let (version, flags) = prefix_or_eof(raw)?;
        let mut entries = Vec::new();
        for child in children {
            if let BoxData::Infe(infe) = &child.data {
                entries.push(ItemInfoEntry {
                    item_id: infe.item_id,
                    item_type: infe.item_type,
                    name: infe.name.clone(),
                });
            } else {
                debug!("ignoring '{}' child of iinf", child.fourcc);
            }
        }
        Ok(Self { version, flags, entries })
    }

    /// Encode the FullBox prefix and entry count. The `infe` children are
    /// serialized separately by the tree writer; `count` must match them.
    pub fn encode_prelude(&self, count: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(u32::from(self.version) << 24 | self.flags)?;
        if self.version == 0 {
            let count = u16::try_from(count)
                .map_err(|_| Error::Unsupported("too many items for 16-bit iinf count"))?;
            out.write_u16::<BigEndian>(count)?;
        } else {
            out.write_u32::<BigEndian>(count as u32)?;
        }
        Ok(out)
    }

    pub fn entry(&self, item_id: u32) -> Option<&ItemInfoEntry> {
        self.entries.iter().find(|e| e.item_id == item_id)
    }
}

/// Image Spatial Extents property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IspeBox {
    pub version: u8,
    pub flags: u32,
    pub width: u32,
    pub height: u32,
}

impl IspeBox {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (version, flags) = prefix_or_eof(raw)?;
        let mut src = raw.get(4..).ok_or(Error::UnexpectedEOF)?;
        let width = be_u32(&mut src)?;
        let height = be_u32(&mut src)?;
        Ok(Self { version, flags, width, height })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(u32::from(self.version) << 24 | self.flags)?;
        out.write_u32::<BigEndian>(self.width)?;
        out.write_u32::<BigEndian>(self.height)?;
        Ok(out)
    }
}

/// One property association: a 1-based index into `ipco`, plus the
/// essential bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    pub essential: bool,
    pub property_index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpmaEntry {
    pub item_id: u32,
    pub associations: Vec<Association>,
}

/// Item Property Association box. Bit 0 of `flags` selects 15-bit property
/// indices; otherwise they are 7-bit.
#[derive(Debug, Clone)]
pub struct IpmaBox {
    pub version: u8,
    pub flags: u32,
    pub entries: Vec<IpmaEntry>,
}

impl IpmaBox {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (version, flags) = prefix_or_eof(raw)?;
        let mut src = raw.get(4..).ok_or(Error::UnexpectedEOF)?;
        let entry_count = be_u32(&mut src)?;
        let mut entries = Vec::new();
        for _ in 0..entry_count {
            let item_id = if version == 0 { u32::from(be_u16(&mut src)?) } else { be_u32(&mut src)? };
            let assoc_count = src.read_u8().map_err(|_| Error::UnexpectedEOF)?;
            let mut associations = Vec::with_capacity(usize::from(assoc_count));
            for _ in 0..assoc_count {
                let (essential, property_index) = if flags & 1 == 1 {
                    let word = be_u16(&mut src)?;
                    (word & 0x8000 != 0, word & 0x7FFF)
                } else {
                    let byte = src.read_u8().map_err(|_| Error::UnexpectedEOF)?;
                    (byte & 0x80 != 0, u16::from(byte & 0x7F))
                };
                if property_index == 0 {
                    debug!("discarding zero property index for item {item_id}");
                    continue;
                }
                associations.push(Association { essential, property_index });
            }
            entries.push(IpmaEntry { item_id, associations });
        }
        Ok(Self { version, flags, entries })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(u32::from(self.version) << 24 | self.flags)?;
        out.write_u32::<BigEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            if self.version == 0 {
                let id = u16::try_from(entry.item_id)
                    .map_err(|_| Error::Unsupported("item id exceeds 16-bit ipma field"))?;
                out.write_u16::<BigEndian>(id)?;
            } else {
                out.write_u32::<BigEndian>(entry.item_id)?;
            }
            let count = u8::try_from(entry.associations.len())
                .map_err(|_| Error::Unsupported("too many property associations for one item"))?;
            out.push(count);
            for a in &entry.associations {
                if self.flags & 1 == 1 {
                    if a.property_index > 0x7FFF {
                        return Err(Error::Unsupported("property index exceeds 15 bits"));
                    }
                    let word = a.property_index | if a.essential { 0x8000 } else { 0 };
                    out.write_u16::<BigEndian>(word)?;
                } else {
                    if a.property_index > 0x7F {
                        return Err(Error::Unsupported("property index exceeds 7 bits"));
                    }
                    out.push(a.property_index as u8 | if a.essential { 0x80 } else { 0 });
                }
            }
        }
        Ok(out)
    }

    pub fn entry(&self, item_id: u32) -> Option<&IpmaEntry> {
        self.entries.iter().find(|e| e.item_id == item_id)
    }
}

/// One reference sub-box of `iref`: a typed edge from one item to others.
/// Any fourcc is accepted as the relation type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub rel_type: FourCC,
    pub from_item_id: u32,
    pub to_item_ids: Vec<u32>,
}

/// Item Reference Box. Parsed into a flat relation list rather than child
/// tree nodes, so mutations serialize back from the model.
#[derive(Debug, Clone)]
pub struct IrefBox {
    pub version: u8,
    pub flags: u32,
    pub relations: Vec<Relation>,
}

impl IrefBox {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (version, flags) = prefix_or_eof(raw)?;
        if version > 1 {
            return Err(Error::Unsupported("unsupported version in 'iref' box"));
        }
        let mut relations = Vec::new();
        let mut pos = 4usize;
        while pos < raw.len() {
            let Some(head) = read_box_header(raw, pos, raw.len()) else {
                debug!("iref sub-box list ends early at {pos}");
                break;
            };
            let body_start = pos + head.header_len as usize;
            let Some(body_end) = pos.checked_add(head.size as usize) else {
                break;
            };
            let Some(mut body) = raw.get(body_start..body_end) else {
                debug!("iref sub-box at {pos} overruns the box");
                break;
            };
            let from_item_id =
                if version == 0 { u32::from(be_u16(&mut body)?) } else { be_u32(&mut body)? };
            let ref_count = be_u16(&mut body)?;
            let mut to_item_ids = Vec::with_capacity(usize::from(ref_count));
            for _ in 0..ref_count {
                let to = if version == 0 { u32::from(be_u16(&mut body)?) } else { be_u32(&mut body)? };
                to_item_ids.push(to);
            }
            relations.push(Relation { rel_type: head.fourcc, from_item_id, to_item_ids });
            pos = body_end;
        }
        Ok(Self { version, flags, relations })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(u32::from(self.version) << 24 | self.flags)?;
        for rel in &self.relations {
            let id_width = if self.version == 0 { 2 } else { 4 };
            let size = 8 + id_width + 2 + rel.to_item_ids.len() * id_width;
            out.write_u32::<BigEndian>(size as u32)?;
            out.extend_from_slice(&rel.rel_type.0);
            if self.version == 0 {
                let from = u16::try_from(rel.from_item_id)
                    .map_err(|_| Error::Unsupported("item id exceeds 16-bit iref field"))?;
                out.write_u16::<BigEndian>(from)?;
            } else {
                out.write_u32::<BigEndian>(rel.from_item_id)?;
            }
            let count = u16::try_from(rel.to_item_ids.len())
                .map_err(|_| Error::Unsupported("too many references in one iref entry"))?;
            out.write_u16::<BigEndian>(count)?;
            for &to in &rel.to_item_ids {
                if self.version == 0 {
                    let to = u16::try_from(to)
                        .map_err(|_| Error::Unsupported("item id exceeds 16-bit iref field"))?;
                    out.write_u16::<BigEndian>(to)?;
                } else {
                    out.write_u32::<BigEndian>(to)?;
                }
            }
        }
        Ok(out)
    }

    /// Relations whose source is the given item.
    pub fn relations_from(&self, item_id: u32) -> impl Iterator<Item = &Relation> {
        self.relations.iter().filter(move |r| r.from_item_id == item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pitm_item_id_width_follows_version() {
        let v0 = PitmBox { version: 0, flags: 0, item_id: 0x1234 };
        let bytes = v0.encode().unwrap();
        assert_eq!(bytes, [0, 0, 0, 0, 0x12, 0x34]);
        assert_eq!(PitmBox::parse(&bytes).unwrap(), v0);

        let v1 = PitmBox { version: 1, flags: 0, item_id: 0x0001_0000 };
        let bytes = v1.encode().unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(PitmBox::parse(&bytes).unwrap(), v1);

        // A shifted vendor id cannot be narrowed into a v0 box.
        let bad = PitmBox { version: 0, flags: 0, item_id: 0x0001_0000 };
        assert!(bad.encode().is_err());
    }

    #[test]
    fn infe_v2_round_trips_with_trailing_bytes() {
        let infe = InfeBox {
            version: 2,
            flags: 0,
            item_id: 0x0001_0000,
            protection_index: 0,
            item_type: Some(FourCC(*b"hvc1")),
            name: b"HEVC Image".to_vec(),
            trailing: b"extra\x00data".to_vec(),
        };
        let bytes = infe.encode().unwrap();
        assert_eq!(InfeBox::parse(&bytes).unwrap(), infe);
    }

    #[test]
    fn infe_v0_has_no_type_tag() {
        let body = [
            0, 0, 0, 0, // version 0, flags
            0, 5, // item_id
            0, 0, // protection
            b'i', b'm', b'g', 0, // name "img"
        ];
        let infe = InfeBox::parse(&body).unwrap();
        assert_eq!(infe.item_id, 5);
        assert_eq!(infe.item_type, None);
        assert_eq!(infe.name, b"img");
        assert!(infe.trailing.is_empty());
        assert_eq!(infe.encode().unwrap(), body);
    }

    #[test]
    fn infe_name_without_terminator_consumes_rest() {
        let body = [0, 0, 0, 0, 0, 1, 0, 0, b'a', b'b'];
        let infe = InfeBox::parse(&body).unwrap();
        assert_eq!(infe.name, b"ab");
        // Re-encode normalizes by appending the missing terminator.
        assert_eq!(infe.encode().unwrap().last(), Some(&0u8));
    }

    #[test]
    fn ispe_round_trip() {
        let ispe = IspeBox { version: 0, flags: 0, width: 4032, height: 3024 };
        assert_eq!(IspeBox::parse(&ispe.encode().unwrap()).unwrap(), ispe);
    }

    #[test]
    fn ipma_essential_bit_and_index_masks() {
        // 7-bit form.
        let narrow = IpmaBox {
            version: 0,
            flags: 0,
            entries: vec![IpmaEntry {
                item_id: 1,
                associations: vec![
                    Association { essential: true, property_index: 1 },
                    Association { essential: false, property_index: 0x7F },
                ],
            }],
        };
        let parsed = IpmaBox::parse(&narrow.encode().unwrap()).unwrap();
        assert_eq!(parsed.entries, narrow.entries);

        // 15-bit form via flags bit 0.
        let wide = IpmaBox {
            version: 1,
            flags: 1,
            entries: vec![IpmaEntry {
                item_id: 0x0002_0000,
                associations: vec![Association { essential: true, property_index: 0x7FFF }],
            }],
        };
        let parsed = IpmaBox::parse(&wide.encode().unwrap()).unwrap();
        assert_eq!(parsed.entries, wide.entries);

        // Index too wide for the 7-bit form is rejected at encode time.
        let bad = IpmaBox {
            version: 0,
            flags: 0,
            entries: vec![IpmaEntry {
                item_id: 1,
                associations: vec![Association { essential: false, property_index: 0x80 }],
            }],
        };
        assert!(bad.encode().is_err());
    }

    #[test]
    fn ipma_zero_property_index_is_dropped() {
        let body = [
            0, 0, 0, 0, // version 0, flags 0
            0, 0, 0, 1, // entry count
            0, 9, // item_id
            2, // association count
            0x00, // index 0, dropped
            0x81, // essential, index 1
        ];
        let parsed = IpmaBox::parse(&body).unwrap();
        assert_eq!(
            parsed.entries[0].associations,
            vec![Association { essential: true, property_index: 1 }]
        );
    }

    #[test]
    fn iref_round_trips_arbitrary_relation_types() {
        for version in [0u8, 1] {
            let iref = IrefBox {
                version,
                flags: 0,
                relations: vec![
                    Relation { rel_type: FourCC(*b"thmb"), from_item_id: 2, to_item_ids: vec![1] },
                    Relation { rel_type: FourCC(*b"zzzz"), from_item_id: 3, to_item_ids: vec![1, 2] },
                ],
            };
            let parsed = IrefBox::parse(&iref.encode().unwrap()).unwrap();
            assert_eq!(parsed.relations, iref.relations);
        }
    }

    #[test]
    fn iref_truncated_sub_box_yields_partial_result() {
        let iref = IrefBox {
            version: 0,
            flags: 0,
            relations: vec![
                Relation { rel_type: FourCC(*b"thmb"), from_item_id: 2, to_item_ids: vec![1] },
                Relation { rel_type: FourCC(*b"cdsc"), from_item_id: 4, to_item_ids: vec![1] },
            ],
        };
        let mut bytes = iref.encode().unwrap();
        bytes.truncate(bytes.len() - 3);
        let parsed = IrefBox::parse(&bytes).unwrap();
        assert_eq!(parsed.relations.len(), 1);
        assert_eq!(parsed.relations[0].rel_type, FourCC(*b"thmb"));
    }

    #[test]
    fn iinf_entries_promoted_from_infe_children() {
        let infe = InfeBox {
            version: 2,
            flags: 0,
            item_id: 1,
            protection_index: 0,
            item_type: Some(FourCC(*b"grid")),
            name: Vec::new(),
            trailing: Vec::new(),
        };
        let mut child = BmffBox::leaf(FourCC(*b"infe"), infe.encode().unwrap());
        child.data = BoxData::Infe(infe);
        let raw = [0u8, 0, 0, 0, 0, 1]; // version 0, count 1
        let iinf = IinfBox::from_children(&raw, &[child]).unwrap();
        assert_eq!(iinf.entries.len(), 1);
        assert_eq!(iinf.entries[0].item_type, Some(FourCC(*b"grid")));
        assert_eq!(iinf.encode_prelude(1).unwrap(), raw);
    }
}
