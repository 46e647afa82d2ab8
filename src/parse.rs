// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Box header decoding and the recursive box-stream parser.
//!
//! Truncation is never fatal here: a box whose declared size exceeds the
//! bytes actually available ends enumeration at that point and the caller
//! gets the boxes parsed so far. Real-world files routinely carry trailing
//! vendor padding or minor corruption in regions we never touch.

use byteorder::ReadBytesExt;
use log::debug;

use crate::boxes::FourCC;
use crate::tree::{BmffBox, BoxData};
use crate::{iloc::IlocBox, meta};
use crate::{Error, Result};

/// Decoded box header.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
pub struct BoxHeader {
    pub fourcc: FourCC,
    /// Total box size in bytes, header included.
    pub size: u64,
    /// 8 for the compact form, 16 for the large-size form.
    pub header_len: u64,
}

/// Decode one header at `data[pos..]`, where `scope_len` is the total length
/// of the enclosing scope (a `size == 0` box runs to its end).
///
/// Returns `None` when the remaining bytes cannot hold the declared header,
/// or when the declared size is smaller than the header itself.
pub fn read_box_header(data: &[u8], pos: usize, scope_len: usize) -> Option<BoxHeader> {
    let rest = data.get(pos..)?;
    if rest.len() < 8 {
        return None;
    }
    let size32 = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
    let fourcc = FourCC([rest[4], rest[5], rest[6], rest[7]]);

    let (size, header_len) = match size32 {
        0 => (scope_len.checked_sub(pos)? as u64, 8),
        1 => {
            if rest.len() < 16 {
                return None;
            }
            let size64 = u64::from_be_bytes([
                rest[8], rest[9], rest[10], rest[11], rest[12], rest[13], rest[14], rest[15],
            ]);
            (size64, 16)
        }
        _ => (u64::from(size32), 8),
    };

    if size < header_len {
        debug!("malformed '{fourcc}' header: size {size} < header {header_len}");
        return None;
    }
    Some(BoxHeader { fourcc, size, header_len })
}

/// Read the 4-byte version/flags prefix of a FullBox body.
pub fn full_box_prefix(raw: &[u8]) -> Option<(u8, u32)> {
    let vf = raw.get(..4)?;
    let word = u32::from_be_bytes([vf[0], vf[1], vf[2], vf[3]]);
    Some(((word >> 24) as u8, word & 0x00FF_FFFF))
}

/// Parse a box stream, recursing into container types.
///
/// `base_offset` is the absolute file position of `data[0]`, recorded on
/// each node for diagnostics. Consumes at most `data.len()` bytes; a box
/// that declares more content than remains ends the walk with a partial
/// result.
pub fn parse_boxes(data: &[u8], base_offset: u64) -> Vec<BmffBox> {
    let mut boxes = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let Some(head) = read_box_header(data, pos, data.len()) else {
            break;
        };
        let content_len = (head.size - head.header_len) as usize;
        let body_start = pos + head.header_len as usize;
        let body = body_start
            .checked_add(content_len)
            .and_then(|end| data.get(body_start..end));
        let Some(raw) = body else {
            debug!(
                "truncated '{}' at {}: declared {} bytes, stopping enumeration",
                head.fourcc,
                base_offset + pos as u64,
                content_len
            );
            break;
        };

        let mut b = BmffBox {
            fourcc: head.fourcc,
            offset: base_offset + pos as u64,
            size: head.size,
            raw: raw.to_vec(),
            children: Vec::new(),
            data: BoxData::Generic,
        };

        if head.fourcc.is_container() {
            let skip = container_prelude_len(&b);
            if let Some(nested) = b.raw.get(skip..) {
                let nested_base = base_offset + (body_start + skip) as u64;
                b.children = parse_boxes(nested, nested_base);
            }
        }

        decode_variant(&mut b);
        debug!("parsed '{}' at {} size {}", b.fourcc, b.offset, b.size);
        boxes.push(b);

        // Advance past the declared size even when the variant codec
        // consumed fewer content bytes.
        pos += head.size as usize;
    }

    boxes
}

/// Bytes to skip between a container's body start and its first child:
/// the FullBox prefix, plus — for `iinf` only — the item count field that
/// precedes the `infe` children (16-bit for version 0, 32-bit otherwise).
pub(crate) fn container_prelude_len(b: &BmffBox) -> usize {
    if !b.fourcc.is_full_box() {
        return 0;
    }
    let mut skip = 4;
    if b.fourcc == FourCC::IINF {
        match full_box_prefix(&b.raw) {
            Some((0, _)) => skip += 2,
            Some((_, _)) => skip += 4,
            None => {}
        }
    }
    skip
}

/// Type registry: attach the typed variant for known tags.
///
/// A codec that fails on a malformed body leaves the node as a generic
/// FullBox so its raw bytes still round-trip; the failure is logged, not
/// propagated.
fn decode_variant(b: &mut BmffBox) {
    let decoded: Result<BoxData> = match &b.fourcc.0 {
        b"iloc" => IlocBox::parse(&b.raw).map(BoxData::Iloc),
        b"pitm" => meta::PitmBox::parse(&b.raw).map(BoxData::Pitm),
        b"iinf" => meta::IinfBox::from_children(&b.raw, &b.children).map(BoxData::Iinf),
        b"infe" => meta::InfeBox::parse(&b.raw).map(BoxData::Infe),
        b"ispe" => meta::IspeBox::parse(&b.raw).map(BoxData::Ispe),
        b"ipma" => meta::IpmaBox::parse(&b.raw).map(BoxData::Ipma),
        b"iref" => meta::IrefBox::parse(&b.raw).map(BoxData::Iref),
        _ => {
            if b.fourcc.is_full_box() {
                if let Some((version, flags)) = full_box_prefix(&b.raw) {
                    b.data = BoxData::Full { version, flags };
                }
            }
            return;
        }
    };

    match decoded {
        Ok(data) => b.data = data,
        Err(e) => {
            debug!("'{}' body did not decode ({e}), keeping raw bytes", b.fourcc);
            if let Some((version, flags)) = full_box_prefix(&b.raw) {
                b.data = BoxData::Full { version, flags };
            }
        }
    }
}

pub(crate) fn be_u16<T: ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::BigEndian>().map_err(Error::from)
}

pub(crate) fn be_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::encode_header;

    #[test]
    fn header_round_trip_compact_and_large() {
        // Large-size form is used exactly when total size exceeds u32::MAX.
        for &size in &[8u64, 16, 0xFFFF_FFFF, 0x1_0000_0000, 1 << 40] {
            let header = encode_header(FourCC::MDAT, size).unwrap();
            let expected_len = if size > u64::from(u32::MAX) { 16 } else { 8 };
            assert_eq!(header.len(), expected_len, "size {size}");

            // Pad so scope math is irrelevant for the decode.
            let decoded = read_box_header(&header, 0, usize::MAX).unwrap();
            assert_eq!(decoded.fourcc, FourCC::MDAT);
            assert_eq!(decoded.size, size);
            assert_eq!(decoded.header_len, expected_len as u64);
        }
    }

    #[test]
    fn header_size_zero_runs_to_scope_end() {
        let mut data = vec![0, 0, 0, 0];
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&[0xAA; 12]);
        let h = read_box_header(&data, 0, data.len()).unwrap();
        assert_eq!(h.size, 20);
        assert_eq!(h.header_len, 8);
    }

    #[test]
    fn header_size_zero_past_scope_end_is_rejected() {
        let mut data = vec![0xFF; 8];
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&[0xAA; 4]);
        // The caller's scope ends before the header starts.
        assert!(read_box_header(&data, 8, 4).is_none());
    }

    #[test]
    fn header_rejects_short_or_malformed() {
        assert!(read_box_header(&[0, 0, 0, 9, b'f'], 0, 5).is_none());
        // Declared size smaller than its own header.
        let mut data = vec![0, 0, 0, 4];
        data.extend_from_slice(b"ftyp");
        assert!(read_box_header(&data, 0, data.len()).is_none());
    }

    #[test]
    fn truncated_stream_yields_partial_tree() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 12]);
        data.extend_from_slice(b"ftyp");
        data.extend_from_slice(&[1, 2, 3, 4]);
        // Second box declares 100 bytes but only the header is present.
        data.extend_from_slice(&[0, 0, 0, 100]);
        data.extend_from_slice(b"mdat");

        let boxes = parse_boxes(&data, 0);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].fourcc, FourCC::FTYP);
        assert_eq!(boxes[0].raw, [1, 2, 3, 4]);
    }

    #[test]
    fn unknown_full_box_exposes_version_flags() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 14]);
        data.extend_from_slice(b"hdlr");
        data.extend_from_slice(&[2, 0, 0, 7, 0xDE, 0xAD]);
        let boxes = parse_boxes(&data, 0);
        assert_eq!(boxes.len(), 1);
        match boxes[0].data {
            BoxData::Full { version, flags } => {
                assert_eq!(version, 2);
                assert_eq!(flags, 7);
            }
            ref other => panic!("expected Full variant, got {other:?}"),
        }
    }
}
