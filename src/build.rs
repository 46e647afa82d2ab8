// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tree serialization and the multi-pass rebuild engine.
//!
//! Serialization is bottom-up: every box size is re-derived from encoded
//! content, never taken from the parse-time header. The rebuild engine then
//! iterates layout and `iloc` offset rewriting to a fixed point, because the
//! serialized metadata length and the offsets stored inside it depend on
//! each other.

use log::{debug, warn};

use crate::boxes::FourCC;
use crate::iloc::{IlocBox, RewriteParams};
use crate::parse::container_prelude_len;
use crate::tree::{find_box_mut, BmffBox, BoxData};
use crate::{Error, Result};

/// Encode a box header for the given total size (header included).
///
/// The 16-byte large-size form is used exactly when the size does not fit
/// the 32-bit field.
pub fn encode_header(fourcc: FourCC, size: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16);
    if size > u64::from(u32::MAX) {
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&fourcc.0);
        out.extend_from_slice(&size.to_be_bytes());
    } else {
        out.extend_from_slice(&(size as u32).to_be_bytes());
        out.extend_from_slice(&fourcc.0);
    }
    Ok(out)
}

/// Serialize one box, recursively, re-encoding typed payloads from fields
/// and passing unmodeled bytes through verbatim.
pub fn serialize_box(b: &BmffBox) -> Result<Vec<u8>> {
    let body = encode_body(b)?;
    let mut size = body.len() as u64 + 8;
    if size > u64::from(u32::MAX) {
        size = body.len() as u64 + 16;
    }
    let mut out = encode_header(b.fourcc, size)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Serialize a top-level box list in order.
pub fn serialize_boxes(boxes: &[BmffBox]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for b in boxes {
        out.extend_from_slice(&serialize_box(b)?);
    }
    Ok(out)
}

fn encode_body(b: &BmffBox) -> Result<Vec<u8>> {
    match &b.data {
        BoxData::Iloc(x) => x.encode(),
        BoxData::Pitm(x) => x.encode(),
        BoxData::Infe(x) => x.encode(),
        BoxData::Ispe(x) => x.encode(),
        BoxData::Ipma(x) => x.encode(),
        BoxData::Iref(x) => x.encode(),
        BoxData::Iinf(x) => {
            // The count field tracks the `infe` children actually present,
            // not the parse-time value.
            let infe_count =
                b.children.iter().filter(|c| matches!(c.data, BoxData::Infe(_))).count();
            let mut out = x.encode_prelude(infe_count)?;
            for child in &b.children {
                out.extend_from_slice(&serialize_box(child)?);
            }
            Ok(out)
        }
        BoxData::Generic | BoxData::Full { .. } => {
            if b.children.is_empty() {
                Ok(b.raw.clone())
            } else {
                let skip = container_prelude_len(b);
                let mut out = b.raw.get(..skip).unwrap_or_default().to_vec();
                for child in &b.children {
                    out.extend_from_slice(&serialize_box(child)?);
                }
                Ok(out)
            }
        }
    }
}

/// Outcome of one rebuild.
#[derive(Debug, Clone, Copy)]
pub struct BuildReport {
    /// Absolute offset of the `mdat` header in the output.
    pub mdat_offset: u64,
    /// Shift applied to offsets inside the original `mdat` span.
    pub mdat_delta: i64,
    /// Extents whose rewritten offset went negative and was clamped to 0.
    /// Nonzero means the geometry model disagreed with the file.
    pub clamped_extents: u32,
    /// `(expected, actual)` front-section lengths when the layout failed to
    /// reach a fixed point; the actual layout is used regardless.
    pub layout_mismatch: Option<(u64, u64)>,
}

/// Rebuilds a mutated box tree into a fresh byte stream with `iloc` offsets
/// re-resolved against the new layout.
///
/// Holds the as-parsed `iloc` and the original `mdat`/`meta` geometry:
/// offset rewriting classifies extents against the *original* spans, so each
/// pass starts from a pristine copy rather than compounding shifts.
pub struct Rebuilder {
    pristine_iloc: IlocBox,
    original_mdat_offset: u64,
    original_mdat_size: u64,
    original_meta_offset: u64,
    original_meta_size: u64,
}

impl Rebuilder {
    /// Capture original geometry from a freshly parsed tree. Must be called
    /// before any mutation so the parse-time offsets are still truthful.
    pub fn new(boxes: &[BmffBox]) -> Result<Self> {
        let mdat = boxes
            .iter()
            .find(|b| b.fourcc == FourCC::MDAT)
            .ok_or(Error::MissingBox("mdat"))?;
        let meta = boxes
            .iter()
            .find(|b| b.fourcc == FourCC::META)
            .ok_or(Error::MissingBox("meta"))?;
        let iloc = meta.find_box(FourCC::ILOC).ok_or(Error::MissingBox("iloc"))?;
        let BoxData::Iloc(pristine_iloc) = &iloc.data else {
            return Err(Error::InvalidData("iloc body did not decode"));
        };
        Ok(Self {
            pristine_iloc: pristine_iloc.clone(),
            original_mdat_offset: mdat.offset,
            original_mdat_size: mdat.size,
            original_meta_offset: meta.offset,
            original_meta_size: meta.size,
        })
    }

    /// Serialize the tree into a complete file image.
    ///
    /// Output order is every non-`mdat` top-level box in stream order, then
    /// `mdat` last. The returned bytes are fully built in memory; nothing
    /// touches the filesystem here.
    pub fn build(&self, boxes: &mut [BmffBox]) -> Result<(Vec<u8>, BuildReport)> {
        // Pass 1: preliminary layout with as-parsed offsets.
        self.install_pristine(boxes)?;
        let (front, meta_off) = self.layout(boxes)?;

        // Pass 2: rewrite offsets against the preliminary layout.
        let mut clamped = self.rewrite(boxes, front.len() as u64, meta_off)?;

        // Pass 3: final layout. Field widths are fixed at parse time, so
        // this normally matches pass 1 exactly.
        let (mut front, mismatch) = {
            let (front2, meta_off2) = self.layout(boxes)?;
            if front2.len() as u64 == front.len() as u64 && meta_off2 == meta_off {
                (front2, None)
            } else {
                // Pass 4: one corrective rewrite against the final layout.
                debug!(
                    "layout moved after offset rewrite ({} -> {}), correcting",
                    front.len(),
                    front2.len()
                );
                clamped = self.rewrite(boxes, front2.len() as u64, meta_off2)?;
                let (front3, _) = self.layout(boxes)?;
                let mismatch = if front3.len() != front2.len() {
                    warn!(
                        "layout did not converge: expected {} bytes, got {}",
                        front2.len(),
                        front3.len()
                    );
                    Some((front2.len() as u64, front3.len() as u64))
                } else {
                    None
                };
                (front3, mismatch)
            }
        };
        if mismatch.is_none() {
            debug_assert_eq!(self.layout(boxes)?.0.len(), front.len());
        }

        // Pass 5: append mdat and finish.
        let mdat_offset = front.len() as u64;
        {
            let mdat = boxes
                .iter()
                .find(|b| b.fourcc == FourCC::MDAT)
                .ok_or(Error::MissingBox("mdat"))?;
            front.extend_from_slice(&serialize_box(mdat)?);
        }

        // Leave the tree holding the as-parsed offsets again, so mutating
        // and rebuilding a second time starts from the same state.
        self.install_pristine(boxes)?;

        let report = BuildReport {
            mdat_offset,
            mdat_delta: mdat_offset as i64 - self.original_mdat_offset as i64,
            clamped_extents: clamped,
            layout_mismatch: mismatch,
        };
        Ok((front, report))
    }

    /// Serialize everything except `mdat`; also returns where `meta` landed.
    fn layout(&self, boxes: &[BmffBox]) -> Result<(Vec<u8>, u64)> {
        let mut out = Vec::new();
        let mut meta_off = 0u64;
        for b in boxes {
            if b.fourcc == FourCC::MDAT {
                continue;
            }
            if b.fourcc == FourCC::META {
                meta_off = out.len() as u64;
            }
            out.extend_from_slice(&serialize_box(b)?);
        }
        Ok((out, meta_off))
    }

    fn install_pristine(&self, boxes: &mut [BmffBox]) -> Result<()> {
        let iloc = find_box_mut(boxes, FourCC::ILOC).ok_or(Error::MissingBox("iloc"))?;
        iloc.data = BoxData::Iloc(self.pristine_iloc.clone());
        Ok(())
    }

    /// Re-install the pristine `iloc` and shift its extents for the given
    /// prospective layout.
    fn rewrite(&self, boxes: &mut [BmffBox], mdat_offset: u64, meta_offset: u64) -> Result<u32> {
        self.install_pristine(boxes)?;
        let node = find_box_mut(boxes, FourCC::ILOC).ok_or(Error::MissingBox("iloc"))?;
        let BoxData::Iloc(iloc) = &mut node.data else {
            return Err(Error::InvalidData("iloc body did not decode"));
        };
        Ok(iloc.rewrite_offsets(&RewriteParams {
            mdat_delta: mdat_offset as i64 - self.original_mdat_offset as i64,
            original_mdat_offset: self.original_mdat_offset,
            original_mdat_size: self.original_mdat_size,
            meta_delta: meta_offset as i64 - self.original_meta_offset as i64,
            original_meta_offset: self.original_meta_offset,
            original_meta_size: self.original_meta_size,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iloc::{Extent, ItemLocation};
    use crate::parse::parse_boxes;
    use crate::tree::find_box;

    fn plain_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = encode_header(FourCC(*fourcc), body.len() as u64 + 8).unwrap();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn unknown_boxes_round_trip_byte_for_byte() {
        let mut data = plain_box(b"ftyp", b"heic\x00\x00\x00\x00");
        data.extend_from_slice(&plain_box(b"abcd", &[9, 8, 7, 6, 5]));
        data.extend_from_slice(&plain_box(b"free", &[]));
        let boxes = parse_boxes(&data, 0);
        assert_eq!(serialize_boxes(&boxes).unwrap(), data);
    }

    #[test]
    fn iinf_count_tracks_only_infe_children() {
        let mut rest = vec![0, 0, 0, 0, 0, 2]; // version/flags, claimed count 2
        let infe = plain_box(b"infe", &[2, 0, 0, 0, 0, 0, 0, 1, 0, 0, b'h', b'v', b'c', b'1', 0]);
        rest.extend_from_slice(&infe);
        rest.extend_from_slice(&plain_box(b"free", &[0, 0]));
        let data = plain_box(b"iinf", &rest);

        let boxes = parse_boxes(&data, 0);
        let out = serialize_box(&boxes[0]).unwrap();
        // Header, version/flags, then the entry count.
        assert_eq!(&out[12..14], &[0, 1]);
    }

    #[test]
    fn container_reserialization_rederives_sizes() {
        // ipco holding one ispe; drop the second child and sizes shrink.
        let ispe = plain_box(b"ispe", &[0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 2, 0]);
        let mut ipco_body = ispe.clone();
        ipco_body.extend_from_slice(&plain_box(b"abcd", &[1, 2, 3]));
        let data = plain_box(b"ipco", &ipco_body);

        let mut boxes = parse_boxes(&data, 0);
        boxes[0].children.pop();
        let rebuilt = serialize_boxes(&boxes).unwrap();
        assert_eq!(rebuilt, plain_box(b"ipco", &ispe));
    }

    /// Assemble ftyp + meta(iloc) + mdat with extents pointing at real mdat
    /// payload positions.
    fn synth_file(ftyp_payload: &[u8]) -> Vec<u8> {
        let ftyp = plain_box(b"ftyp", ftyp_payload);

        let iloc = IlocBox {
            version: 0,
            flags: 0,
            offset_size: 4,
            length_size: 4,
            base_offset_size: 0,
            index_size: 0,
            locations: vec![ItemLocation { item_id: 1, extents: vec![Extent { offset: 0, length: 4 }] }],
        };
        let iloc_bytes = plain_box(b"iloc", &iloc.encode().unwrap());
        let mut meta_body = vec![0, 0, 0, 0];
        meta_body.extend_from_slice(&iloc_bytes);
        let meta = plain_box(b"meta", &meta_body);

        let mdat_body_offset = (ftyp.len() + meta.len() + 8) as u64;
        let iloc = IlocBox {
            locations: vec![ItemLocation {
                item_id: 1,
                extents: vec![Extent { offset: mdat_body_offset, length: 4 }],
            }],
            ..iloc
        };
        let iloc_bytes = plain_box(b"iloc", &iloc.encode().unwrap());
        let mut meta_body = vec![0, 0, 0, 0];
        meta_body.extend_from_slice(&iloc_bytes);
        let meta = plain_box(b"meta", &meta_body);

        let mut data = ftyp;
        data.extend_from_slice(&meta);
        data.extend_from_slice(&plain_box(b"mdat", &[0xCA, 0xFE, 0xBA, 0xBE]));
        data
    }

    fn iloc_of(boxes: &[BmffBox]) -> &IlocBox {
        match &find_box(boxes, FourCC::ILOC).unwrap().data {
            BoxData::Iloc(x) => x,
            other => panic!("expected iloc payload, got {other:?}"),
        }
    }

    #[test]
    fn rebuild_shifts_offsets_by_front_growth() {
        let data = synth_file(b"heic\x00\x00\x00\x00");
        let mut boxes = parse_boxes(&data, 0);
        let original_offset = iloc_of(&boxes).locations[0].extents[0].offset;

        let rebuilder = Rebuilder::new(&boxes).unwrap();
        // Grow ftyp by 4 bytes; everything after it moves forward by 4.
        boxes[0].raw.extend_from_slice(b"msf1");

        let (bytes, report) = rebuilder.build(&mut boxes).unwrap();
        assert_eq!(report.mdat_delta, 4);
        assert_eq!(report.clamped_extents, 0);
        assert!(report.layout_mismatch.is_none());

        let out = parse_boxes(&bytes, 0);
        assert_eq!(out.last().unwrap().fourcc, FourCC::MDAT);
        assert_eq!(out.last().unwrap().raw, [0xCA, 0xFE, 0xBA, 0xBE]);
        let shifted = iloc_of(&out).locations[0].extents[0].offset;
        assert_eq!(shifted, original_offset + 4);
        // The rewritten extent points at the payload in the new image.
        assert_eq!(&bytes[shifted as usize..shifted as usize + 4], [0xCA, 0xFE, 0xBA, 0xBE]);
    }

    #[test]
    fn rebuild_is_repeatable() {
        let data = synth_file(b"heic\x00\x00\x00\x00");
        let mut boxes = parse_boxes(&data, 0);
        let rebuilder = Rebuilder::new(&boxes).unwrap();
        boxes[0].raw.extend_from_slice(b"msf1");

        let (first, _) = rebuilder.build(&mut boxes).unwrap();
        // A second build starts from the pristine iloc again, so the
        // earlier rewrite does not compound.
        let (second, _) = rebuilder.build(&mut boxes).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rebuild_requires_mdat_meta_and_iloc() {
        let data = plain_box(b"ftyp", b"heic\x00\x00\x00\x00");
        let boxes = parse_boxes(&data, 0);
        assert!(matches!(Rebuilder::new(&boxes), Err(Error::MissingBox("mdat"))));
    }
}
