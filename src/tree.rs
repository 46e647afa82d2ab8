// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The parsed box tree: one exclusively-owned node per box, with typed
//! variant data attached for the box kinds this crate understands.

use crate::boxes::FourCC;
use crate::iloc::IlocBox;
use crate::meta::{IinfBox, InfeBox, IpmaBox, IrefBox, IspeBox, PitmBox};

/// Typed payload attached to a [`BmffBox`] by the parser's post-parse hook.
///
/// The variant set is closed: every box kind the crate can re-encode from
/// fields is listed here, and anything else stays `Generic` (raw bytes
/// preserved verbatim) or `Full` (version/flags exposed, rest preserved).
#[derive(Debug, Clone)]
pub enum BoxData {
    /// Plain box, body not otherwise modeled.
    Generic,
    /// FullBox without a specialized codec.
    Full { version: u8, flags: u32 },
    Iloc(IlocBox),
    Pitm(PitmBox),
    Iinf(IinfBox),
    Infe(InfeBox),
    Ispe(IspeBox),
    Ipma(IpmaBox),
    Iref(IrefBox),
}

/// A single node of the box tree.
///
/// `offset` and `size` record where the box sat in the source stream at
/// parse time; they are informational only and are never trusted after a
/// mutation — serialized size is always re-derived from content.
#[derive(Debug, Clone)]
pub struct BmffBox {
    pub fourcc: FourCC,
    /// Absolute byte position of the box header at parse time.
    pub offset: u64,
    /// Total box size (header included) at parse time.
    pub size: u64,
    /// Body bytes as read, including any FullBox prefix. Kept even for
    /// boxes with typed `data` so unmodeled trailers survive a rebuild.
    pub raw: Vec<u8>,
    pub children: Vec<BmffBox>,
    pub data: BoxData,
}

impl BmffBox {
    /// Construct a synthetic leaf box (used by tests and tree surgery).
    pub fn leaf(fourcc: FourCC, raw: Vec<u8>) -> Self {
        Self {
            fourcc,
            offset: 0,
            size: 0,
            raw,
            children: Vec::new(),
            data: BoxData::Generic,
        }
    }

    /// Construct a synthetic container box.
    pub fn container(fourcc: FourCC, children: Vec<BmffBox>) -> Self {
        Self {
            fourcc,
            offset: 0,
            size: 0,
            raw: Vec::new(),
            children,
            data: BoxData::Generic,
        }
    }

    /// FullBox version, if this node carries one.
    pub fn version(&self) -> Option<u8> {
        match &self.data {
            BoxData::Full { version, .. } => Some(*version),
            BoxData::Iloc(b) => Some(b.version),
            BoxData::Pitm(b) => Some(b.version),
            BoxData::Iinf(b) => Some(b.version),
            BoxData::Infe(b) => Some(b.version),
            BoxData::Ispe(b) => Some(b.version),
            BoxData::Ipma(b) => Some(b.version),
            BoxData::Iref(b) => Some(b.version),
            BoxData::Generic => None,
        }
    }

    /// Depth-first search for the first descendant of the given type.
    pub fn find_box(&self, fourcc: FourCC) -> Option<&BmffBox> {
        find_box(&self.children, fourcc)
    }

    pub fn find_box_mut(&mut self, fourcc: FourCC) -> Option<&mut BmffBox> {
        find_box_mut(&mut self.children, fourcc)
    }
}

/// Depth-first search over a box list (self-or-descendant, stream order).
pub fn find_box(boxes: &[BmffBox], fourcc: FourCC) -> Option<&BmffBox> {
    for b in boxes {
        if b.fourcc == fourcc {
            return Some(b);
        }
        if let Some(found) = find_box(&b.children, fourcc) {
            return Some(found);
        }
    }
    None
}

pub fn find_box_mut(boxes: &mut [BmffBox], fourcc: FourCC) -> Option<&mut BmffBox> {
    for b in boxes {
        if b.fourcc == fourcc {
            return Some(b);
        }
        if let Some(found) = find_box_mut(&mut b.children, fourcc) {
            return Some(found);
        }
    }
    None
}

/// Remove the first box of the given type anywhere in the tree.
/// Returns the detached subtree, or `None` if no such box exists.
pub fn remove_box(boxes: &mut Vec<BmffBox>, fourcc: FourCC) -> Option<BmffBox> {
    if let Some(i) = boxes.iter().position(|b| b.fourcc == fourcc) {
        return Some(boxes.remove(i));
    }
    for b in boxes {
        if let Some(removed) = remove_box(&mut b.children, fourcc) {
            return Some(removed);
        }
    }
    None
}
