// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Four-character box type codes and the fixed type registry sets.

use std::fmt;

/// A four-byte box type tag, e.g. `ftyp` or `iloc`.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const META: Self = Self(*b"meta");
    pub const MDAT: Self = Self(*b"mdat");
    pub const HDLR: Self = Self(*b"hdlr");
    pub const PITM: Self = Self(*b"pitm");
    pub const ILOC: Self = Self(*b"iloc");
    pub const IINF: Self = Self(*b"iinf");
    pub const INFE: Self = Self(*b"infe");
    pub const IPRP: Self = Self(*b"iprp");
    pub const IPCO: Self = Self(*b"ipco");
    pub const IPMA: Self = Self(*b"ipma");
    pub const ISPE: Self = Self(*b"ispe");
    pub const IREF: Self = Self(*b"iref");
    pub const DIMG: Self = Self(*b"dimg");
    pub const THMB: Self = Self(*b"thmb");
    pub const MPVD: Self = Self(*b"mpvd");

    pub const fn new(tag: &[u8; 4]) -> Self {
        Self(*tag)
    }

    /// True if the box body is itself a sequence of child boxes.
    ///
    /// `iref` also nests sub-boxes, but their bodies are relation payloads
    /// rather than registry-dispatched boxes, so its codec owns them
    /// (see `meta::IrefBox`). `fiin` is the FD item information box.
    pub fn is_container(self) -> bool {
        matches!(
            &self.0,
            b"meta" | b"moov" | b"trak" | b"iprp" | b"ipco" | b"dinf" | b"fiin" | b"ipro" | b"iinf"
        )
    }

    /// True if the box body begins with the 4-byte version/flags prefix.
    ///
    /// Tags in this set without a specialized codec still get their
    /// version/flags decoded so rebuilds can re-emit them.
    pub fn is_full_box(self) -> bool {
        matches!(
            &self.0,
            b"meta" | b"hdlr" | b"pitm" | b"iinf" | b"iloc" | b"ipma" | b"ispe" | b"iref" | b"infe"
        )
    }
}

impl From<u32> for FourCC {
    fn from(v: u32) -> Self {
        Self(v.to_be_bytes())
    }
}

impl From<FourCC> for u32 {
    fn from(cc: FourCC) -> Self {
        u32::from_be_bytes(cc.0)
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(tag: &[u8; 4]) -> Self {
        Self(*tag)
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.0 == **other
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{:02x?}", self.0),
        }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC(\"{self}\")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_display_and_eq() {
        let cc = FourCC::new(b"iloc");
        assert_eq!(cc.to_string(), "iloc");
        assert!(cc == b"iloc");
        assert_eq!(u32::from(cc), 0x696c_6f63);
        assert_eq!(FourCC::from(0x696c_6f63), FourCC::ILOC);
    }

    #[test]
    fn registry_sets() {
        assert!(FourCC::META.is_container());
        assert!(FourCC::META.is_full_box());
        assert!(FourCC::IPCO.is_container());
        assert!(!FourCC::IREF.is_container());
        assert!(FourCC::IREF.is_full_box());
        assert!(!FourCC::FTYP.is_full_box());
        assert!(!FourCC::MDAT.is_container());
    }
}
