#![deny(unsafe_code)]
//! Parser, mutator and rebuilder for ISOBMFF-based HEIC containers.
//!
//! The crate turns a byte stream into a typed box tree, supports item-graph
//! surgery on it (removing items, garbage-collecting orphaned properties,
//! normalizing vendor-shifted item IDs), and re-serializes the mutated tree
//! with every absolute `iloc` offset re-resolved against the new layout.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::TryReserveError;
use std::fs;
use std::path::Path;

use log::{debug, warn};

pub mod boxes;
pub mod build;
pub mod iloc;
pub mod meta;
pub mod parse;
pub mod tree;

pub use crate::boxes::FourCC;
pub use crate::build::{serialize_box, serialize_boxes, BuildReport, Rebuilder};
pub use crate::iloc::{Extent, IlocBox, ItemLocation, RewriteParams};
pub use crate::meta::{
    Association, IinfBox, InfeBox, IpmaBox, IpmaEntry, IrefBox, IspeBox, ItemInfoEntry, PitmBox,
    Relation,
};
pub use crate::parse::{parse_boxes, read_box_header, BoxHeader};
pub use crate::tree::{find_box, find_box_mut, remove_box, BmffBox, BoxData};

/// Describes parser and rebuild failures.
///
/// This enum wraps the standard `io::Error` type, unified with
/// our own parser error states and those of crates we use.
#[derive(Debug)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Parse error caused by limited parser support rather than invalid data.
    Unsupported(&'static str),
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// A box the rebuild engine cannot run without is absent.
    MissingBox(&'static str),
    /// Out of memory
    OutOfMemory,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s) | Self::Unsupported(s) => s,
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return err.fmt(f),
            Self::MissingBox(tag) => return write!(f, "missing essential '{tag}' box"),
            Self::OutOfMemory => "OOM",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::debug!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData("truncated bits")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) => std::io::ErrorKind::InvalidData,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// File producer family, detected from the `ftyp` compatible-brand bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Samsung,
    Apple,
    Unknown,
}

/// Tiling of a grid-coded primary image, derived from the full image size
/// and the first tile's size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    pub rows: u32,
    pub columns: u32,
    pub output_width: u32,
    pub output_height: u32,
}

/// ID forms to try when looking up an item: the ID itself, then its
/// vendor-shifted form (logical `N` stored as `N << 16`), or for an
/// already-shifted ID, the logical form recovered with `>> 16`. See
/// [`HeicFile`] docs.
fn id_candidates(item_id: u32) -> Vec<u32> {
    let mut out = Vec::with_capacity(3);
    out.push(item_id);
    if item_id <= 0xFFFF {
        out.push(item_id << 16);
    } else {
        out.push(item_id >> 16);
        let low = item_id & 0xFFFF;
        if low != 0 && low != item_id >> 16 {
            out.push(low);
        }
    }
    out
}

/// A parsed HEIC file: original bytes plus the mutable box tree.
///
/// Some producers encode a logical item ID `N` as `N << 16` in one box
/// family while leaving it unshifted elsewhere. Every lookup here retries
/// the shifted and unshifted forms on a miss, and the mutators apply their
/// change under every matching form so the structures stay consistent.
pub struct HeicFile {
    data: Vec<u8>,
    boxes: Vec<BmffBox>,
    vendor: Vendor,
}

impl HeicFile {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let boxes = parse_boxes(&data, 0);
        if boxes.is_empty() {
            return Err(Error::InvalidData("no boxes found"));
        }
        let vendor = detect_vendor(&boxes);
        debug!("parsed {} top-level boxes, vendor {vendor:?}", boxes.len());
        Ok(Self { data, boxes, vendor })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::parse(fs::read(path)?)
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn boxes(&self) -> &[BmffBox] {
        &self.boxes
    }

    /// Mutable access to the tree, for surgery the dedicated operations do
    /// not cover. Parse-time offsets on the nodes stay as they were; the
    /// rebuild engine relies on them to describe the *original* geometry.
    pub fn boxes_mut(&mut self) -> &mut [BmffBox] {
        &mut self.boxes
    }

    /// First box of the given type anywhere in the tree.
    pub fn find_box(&self, fourcc: FourCC) -> Option<&BmffBox> {
        find_box(&self.boxes, fourcc)
    }

    fn iloc(&self) -> Option<&IlocBox> {
        match &self.find_box(FourCC::ILOC)?.data {
            BoxData::Iloc(x) => Some(x),
            _ => None,
        }
    }

    fn ipma(&self) -> Option<&IpmaBox> {
        match &self.find_box(FourCC::IPMA)?.data {
            BoxData::Ipma(x) => Some(x),
            _ => None,
        }
    }

    fn iref(&self) -> Option<&IrefBox> {
        match &self.find_box(FourCC::IREF)?.data {
            BoxData::Iref(x) => Some(x),
            _ => None,
        }
    }

    pub fn primary_item_id(&self) -> Option<u32> {
        match &self.find_box(FourCC::PITM)?.data {
            BoxData::Pitm(p) => Some(p.item_id),
            _ => None,
        }
    }

    /// Item IDs as stored in `iinf`, shifted forms included.
    pub fn item_ids(&self) -> Vec<u32> {
        match self.find_box(FourCC::IINF).map(|b| &b.data) {
            Some(BoxData::Iinf(iinf)) => iinf.entries.iter().map(|e| e.item_id).collect(),
            _ => Vec::new(),
        }
    }

    /// The ID form under which `iloc` actually knows this item.
    pub fn resolve_item_id(&self, item_id: u32) -> Option<u32> {
        let iloc = self.iloc()?;
        let resolved = id_candidates(item_id)
            .into_iter()
            .find(|&id| iloc.location(id).is_some());
        if resolved.is_none() {
            debug!("item {item_id} not in iloc under any ID form");
        }
        resolved
    }

    /// Concatenated bytes of all the item's extents, read from the
    /// original file image.
    pub fn item_data(&self, item_id: u32) -> Result<Vec<u8>> {
        let resolved = self
            .resolve_item_id(item_id)
            .ok_or(Error::InvalidData("item not present in iloc"))?;
        let iloc = self.iloc().ok_or(Error::MissingBox("iloc"))?;
        let location =
            iloc.location(resolved).ok_or(Error::InvalidData("item not present in iloc"))?;

        let total = location
            .extents
            .iter()
            .try_fold(0u64, |acc, e| acc.checked_add(e.length))
            .ok_or(Error::InvalidData("extent lengths overflow"))?;
        let mut out = Vec::new();
        out.try_reserve_exact(usize::try_from(total).map_err(|_| Error::OutOfMemory)?)?;
        for e in &location.extents {
            let start = usize::try_from(e.offset).map_err(|_| Error::UnexpectedEOF)?;
            let chunk = start
                .checked_add(usize::try_from(e.length).map_err(|_| Error::UnexpectedEOF)?)
                .and_then(|end| self.data.get(start..end))
                .ok_or(Error::UnexpectedEOF)?;
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }

    /// Width and height from the item's associated `ispe` property.
    pub fn image_size(&self, item_id: u32) -> Option<(u32, u32)> {
        let ipma = self.ipma()?;
        let entry = id_candidates(item_id).into_iter().find_map(|id| ipma.entry(id))?;
        let ipco = self.find_box(FourCC::IPCO)?;
        for a in &entry.associations {
            let Some(prop) = ipco.children.get(usize::from(a.property_index) - 1) else {
                warn!("property index {} out of range for ipco", a.property_index);
                continue;
            };
            if let BoxData::Ispe(ispe) = &prop.data {
                return Some((ispe.width, ispe.height));
            }
        }
        None
    }

    /// Tile item IDs of the primary image's `dimg` reference, in grid order.
    pub fn grid_tile_ids(&self) -> Option<Vec<u32>> {
        let primary = self.primary_item_id()?;
        let iref = self.iref()?;
        id_candidates(primary).into_iter().find_map(|id| {
            iref.relations
                .iter()
                .find(|r| r.rel_type == FourCC::DIMG && r.from_item_id == id)
                .map(|r| r.to_item_ids.clone())
        })
    }

    /// Grid geometry of the primary image, derived from the full size and
    /// the first tile's size.
    pub fn primary_image_grid(&self) -> Option<Grid> {
        let primary = self.primary_item_id()?;
        let (output_width, output_height) = self.image_size(primary)?;
        let tiles = self.grid_tile_ids()?;
        let (tile_width, tile_height) = self.image_size(*tiles.first()?)?;
        if tile_width == 0 || tile_height == 0 {
            return None;
        }
        Some(Grid {
            rows: output_height.div_ceil(tile_height),
            columns: output_width.div_ceil(tile_width),
            output_width,
            output_height,
        })
    }

    /// Item ID of the primary image's thumbnail, if a `thmb` reference
    /// exists for it.
    pub fn thumbnail_item_id(&self) -> Option<u32> {
        let primary = self.primary_item_id()?;
        let iref = self.iref()?;
        id_candidates(primary).into_iter().find_map(|id| {
            iref.relations
                .iter()
                .find(|r| r.rel_type == FourCC::THMB && r.from_item_id == id)
                .and_then(|r| r.to_item_ids.first().copied())
        })
    }

    /// Thumbnail bytes, or `None` when no `thmb` reference resolves.
    pub fn thumbnail_data(&self) -> Result<Option<Vec<u8>>> {
        match self.thumbnail_item_id() {
            Some(id) => self.item_data(id).map(Some),
            None => Ok(None),
        }
    }

    /// Start of an appended motion-photo video stream. Samsung files carry
    /// it inside a top-level `mpvd` box; the payload begins right after the
    /// box header.
    pub fn motion_photo_offset(&self) -> Option<u64> {
        if self.vendor != Vendor::Samsung {
            return None;
        }
        let mpvd = self.boxes.iter().find(|b| b.fourcc == FourCC::MPVD)?;
        Some(mpvd.offset + 8)
    }

    pub fn motion_photo_data(&self) -> Option<&[u8]> {
        let offset = usize::try_from(self.motion_photo_offset()?).ok()?;
        self.data.get(offset..)
    }

    /// Stamp a content-identifier string into the primary item's `infe`
    /// name field.
    pub fn set_content_identifier(&mut self, content_id: &str) -> Result<()> {
        let primary = self.primary_item_id().ok_or(Error::MissingBox("pitm"))?;
        let candidates = id_candidates(primary);
        let iinf = find_box_mut(&mut self.boxes, FourCC::IINF).ok_or(Error::MissingBox("iinf"))?;

        let mut target = None;
        for child in &mut iinf.children {
            if let BoxData::Infe(infe) = &mut child.data {
                if candidates.contains(&infe.item_id) {
                    infe.name = content_id.as_bytes().to_vec();
                    target = Some(infe.item_id);
                    break;
                }
            }
        }
        let target = target.ok_or(Error::InvalidData("primary item has no infe entry"))?;
        if let BoxData::Iinf(model) = &mut iinf.data {
            if let Some(entry) = model.entries.iter_mut().find(|e| e.item_id == target) {
                entry.name = content_id.as_bytes().to_vec();
            }
        }
        Ok(())
    }

    /// Remove an item from `iinf`, `iloc`, `iref` and `ipma`, then
    /// garbage-collect `ipco` properties no remaining item references and
    /// renumber the surviving association indices densely.
    ///
    /// The ID is matched under every vendor-shift form, so removing logical
    /// item 1 also clears structures keyed by 65536. Calling this with an
    /// absent ID is a no-op.
    pub fn remove_item(&mut self, item_id: u32) {
        let candidates = id_candidates(item_id);

        if let Some(iinf) = find_box_mut(&mut self.boxes, FourCC::IINF) {
            iinf.children.retain(|c| match &c.data {
                BoxData::Infe(infe) => !candidates.contains(&infe.item_id),
                _ => true,
            });
            if let BoxData::Iinf(model) = &mut iinf.data {
                model.entries.retain(|e| !candidates.contains(&e.item_id));
            }
        }

        if let Some(node) = find_box_mut(&mut self.boxes, FourCC::ILOC) {
            if let BoxData::Iloc(iloc) = &mut node.data {
                iloc.locations.retain(|l| !candidates.contains(&l.item_id));
            }
        }

        if let Some(node) = find_box_mut(&mut self.boxes, FourCC::IREF) {
            if let BoxData::Iref(iref) = &mut node.data {
                iref.relations.retain(|r| !candidates.contains(&r.from_item_id));
                for r in &mut iref.relations {
                    r.to_item_ids.retain(|t| !candidates.contains(t));
                }
            }
        }

        // ipma removal, then property GC. Indices held only by the removed
        // item are orphaned; drop them from ipco (highest first, so lower
        // indices stay stable) and renumber what survives.
        let mut removed_indices: Vec<u16> = Vec::new();
        let mut surviving_indices: Vec<u16> = Vec::new();
        if let Some(node) = find_box_mut(&mut self.boxes, FourCC::IPMA) {
            if let BoxData::Ipma(ipma) = &mut node.data {
                ipma.entries.retain(|e| {
                    if candidates.contains(&e.item_id) {
                        removed_indices.extend(e.associations.iter().map(|a| a.property_index));
                        false
                    } else {
                        true
                    }
                });
                for e in &ipma.entries {
                    surviving_indices.extend(e.associations.iter().map(|a| a.property_index));
                }
            }
        }
        if removed_indices.is_empty() {
            return;
        }
        removed_indices.sort_unstable();
        removed_indices.dedup();
        surviving_indices.sort_unstable();
        surviving_indices.dedup();
        let orphaned: Vec<u16> = removed_indices
            .into_iter()
            .filter(|i| surviving_indices.binary_search(i).is_err())
            .collect();
        if orphaned.is_empty() {
            return;
        }

        let Some(ipco) = find_box_mut(&mut self.boxes, FourCC::IPCO) else {
            return;
        };
        let original_count = ipco.children.len();
        for &index in orphaned.iter().rev() {
            let zero_based = usize::from(index) - 1;
            if zero_based < ipco.children.len() {
                let gone = ipco.children.remove(zero_based);
                debug!("removed orphaned property {index} ('{}') from ipco", gone.fourcc);
            } else {
                warn!("orphaned property index {index} out of bounds for ipco");
            }
        }

        // Old 1-based index -> new dense 1-based index over the survivors.
        let mut remap = vec![0u16; original_count + 1];
        let mut next = 1u16;
        for old in 1..=original_count as u16 {
            if orphaned.binary_search(&old).is_err() {
                remap[usize::from(old)] = next;
                next += 1;
            }
        }

        if let Some(node) = find_box_mut(&mut self.boxes, FourCC::IPMA) {
            if let BoxData::Ipma(ipma) = &mut node.data {
                for e in &mut ipma.entries {
                    let item_id = e.item_id;
                    e.associations.retain_mut(|a| {
                        match remap.get(usize::from(a.property_index)).copied() {
                            Some(new) if new != 0 => {
                                a.property_index = new;
                                true
                            }
                            _ => {
                                // A surviving item referenced an orphaned
                                // index; only possible when the file was
                                // inconsistent to begin with.
                                warn!(
                                    "dropping association of item {item_id} to vanished property {}",
                                    a.property_index
                                );
                                false
                            }
                        }
                    });
                }
            }
        }
    }

    /// Rewrite `ipma` entry keys and `iref` from-IDs that use the
    /// vendor-shifted form down to the logical ID known to `iloc`.
    /// Returns how many keys changed.
    pub fn normalize_vendor_ids(&mut self) -> usize {
        let iloc_ids: Vec<u32> = match self.iloc() {
            Some(iloc) => iloc.locations.iter().map(|l| l.item_id).collect(),
            None => return 0,
        };
        let wants_unshift =
            |id: u32| id > 0xFFFF && !iloc_ids.contains(&id) && iloc_ids.contains(&(id >> 16));

        let mut changed = 0;
        if let Some(node) = find_box_mut(&mut self.boxes, FourCC::IPMA) {
            if let BoxData::Ipma(ipma) = &mut node.data {
                for e in &mut ipma.entries {
                    if wants_unshift(e.item_id) {
                        debug!("normalizing ipma key {} -> {}", e.item_id, e.item_id >> 16);
                        e.item_id >>= 16;
                        changed += 1;
                    }
                }
            }
        }
        if let Some(node) = find_box_mut(&mut self.boxes, FourCC::IREF) {
            if let BoxData::Iref(iref) = &mut node.data {
                for r in &mut iref.relations {
                    if wants_unshift(r.from_item_id) {
                        debug!(
                            "normalizing iref from-ID {} -> {}",
                            r.from_item_id,
                            r.from_item_id >> 16
                        );
                        r.from_item_id >>= 16;
                        changed += 1;
                    }
                }
            }
        }
        changed
    }

    /// Re-serialize the (possibly mutated) tree into a fresh file image.
    pub fn rebuild(&mut self) -> Result<(Vec<u8>, BuildReport)> {
        let rebuilder = Rebuilder::new(&self.boxes)?;
        rebuilder.build(&mut self.boxes)
    }

    /// Rebuild and write to `path`. The bytes are fully built in memory
    /// before the destination file is created.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<BuildReport> {
        let (bytes, report) = self.rebuild()?;
        fs::write(path, bytes)?;
        Ok(report)
    }
}

fn detect_vendor(boxes: &[BmffBox]) -> Vendor {
    let Some(ftyp) = boxes.iter().find(|b| b.fourcc == FourCC::FTYP) else {
        return Vendor::Unknown;
    };
    let brands = ftyp.raw.get(4..).unwrap_or_default();
    let lower = brands.to_ascii_lowercase();
    if contains(&lower, b"samsung") {
        Vendor::Samsung
    } else if contains(&lower, b"apple") || contains(brands, b"MiHB") {
        Vendor::Apple
    } else {
        Vendor::Unknown
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
