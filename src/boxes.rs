// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{be_u32, be_u64, Error, Result, SubError, ToU64};
use byteorder::ReadBytesExt;
use log::debug;
use std::fmt;

macro_rules! box_database {
    ($($(#[$attr:meta])* $boxenum:ident $boxtype:expr),*,) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub(crate) enum BoxType {
            $($(#[$attr])* $boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> BoxType {
                use self::BoxType::*;
                match t {
                    $($(#[$attr])* $boxtype => $boxenum),*,
                    _ => UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> u32 {
                use self::BoxType::*;
                match b {
                    $($(#[$attr])* $boxenum => $boxtype),*,
                    UnknownBox(t) => t,
                }
            }
        }
    }
}

box_database!(
    FileTypeBox                       0x6674_7970, // "ftyp"
    MetadataBox                       0x6d65_7461, // "meta"
    HandlerBox                        0x6864_6c72, // "hdlr"
    PrimaryItemBox                    0x7069_746d, // "pitm"
    ItemInfoBox                       0x6969_6e66, // "iinf"
    ItemInfoEntry                     0x696e_6665, // "infe"
    ItemLocationBox                   0x696c_6f63, // "iloc"
    ImageReferenceBox                 0x6972_6566, // "iref"
    ItemDataBox                       0x6964_6174, // "idat"
    ImagePropertiesBox                0x6970_7270, // "iprp"
    ItemPropertyContainerBox          0x6970_636f, // "ipco"
    ItemPropertyAssociationBox        0x6970_6d61, // "ipma"
    ImageSpatialExtentsBox            0x6973_7065, // "ispe"
    ImageRotation                     0x6972_6f74, // "irot"
    ImageMirror                       0x696d_6972, // "imir"
    CleanApertureBox                  0x636c_6170, // "clap"
    ColourInformationBox              0x636f_6c72, // "colr"
    PixelInformationBox               0x7069_7869, // "pixi"
    AuxiliaryTypeProperty             0x6175_7843, // "auxC"
    PixelAspectRatioBox               0x7061_7370, // "pasp"
    HevcConfigurationBox              0x6876_6343, // "hvcC"
    AvcConfigurationBox               0x6176_6343, // "avcC"
    AV1CodecConfigurationBox          0x6176_3143, // "av1C"
    JpegConfigurationBox              0x6a70_6743, // "jpgC"
    DataInformationBox                0x6469_6e66, // "dinf"
    GroupsListBox                     0x6772_706c, // "grpl"
    MediaDataBox                      0x6d64_6174, // "mdat"
    MovieBox                          0x6d6f_6f76, // "moov"
    TrackBox                          0x7472_616b, // "trak"
    MediaBox                          0x6d64_6961, // "mdia"
    MediaInformationBox               0x6d69_6e66, // "minf"
    SampleTableBox                    0x7374_626c, // "stbl"
    FreeSpaceBox                      0x6672_6565, // "free"
    SkipBox                           0x736b_6970, // "skip"
    UuidBox                           0x7575_6964, // "uuid"
);

impl fmt::Debug for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fourcc: FourCC = From::from(*self);
        fourcc.fmt(f)
    }
}

/// A four-character code naming a box, item type, property or brand.
#[derive(Default, PartialEq, Eq, Clone, Copy, Hash)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl FourCC {
    pub const fn new(value: &[u8; 4]) -> Self {
        Self { value: *value }
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.value
    }
}

impl From<u32> for FourCC {
    fn from(number: u32) -> FourCC {
        FourCC { value: number.to_be_bytes() }
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> FourCC {
        let box_num: u32 = Into::into(t);
        From::from(box_num)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(v: [u8; 4]) -> FourCC {
        FourCC { value: v }
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        &self.value == *other
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => self.value.fmt(f),
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Basic ISO box structure.
///
/// mp4 files are a sequence of possibly-nested 'box' structures.  Each box
/// begins with a header describing the length of the box's data and a
/// four-byte box type which identifies the type of the box. Together these
/// are enough to interpret the contents of that section of the file.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
pub(crate) struct BoxHeader {
    /// Box type.
    pub name: BoxType,
    /// Size of the box in bytes. `None` when the box extends to the end of its parent.
    pub size: Option<u64>,
    /// Offset to the start of the contained data (or header size).
    pub offset: u64,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    pub const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 8-byte size
    pub const MIN_LARGE_SIZE: u64 = 16;
}

/// Read and parse a box header.
///
/// Call this first to determine the type of a particular mp4 box
/// and its length. Used internally for dispatching to specific
/// parsers for the internal content, or to get the length to
/// skip unknown or uninteresting boxes.
pub(crate) fn read_box_header<T: ReadBytesExt>(src: &mut T) -> Result<BoxHeader> {
    let size32 = be_u32(src)?;
    let name = BoxType::from(be_u32(src)?);
    let size = match size32 {
        // runs to the end of the enclosing space; only meaningful at the top level
        0 => None,
        1 => {
            let size64 = be_u64(src)?;
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::InvalidData(SubError::InvalidBoxSize, "malformed wide size"));
            }
            Some(size64)
        },
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::InvalidData(SubError::InvalidBoxSize, "malformed size"));
            }
            Some(u64::from(size32))
        },
    };
    let mut offset = match size32 {
        1 => BoxHeader::MIN_LARGE_SIZE,
        _ => BoxHeader::MIN_SIZE,
    };
    if name == BoxType::UuidBox {
        if size.map_or(true, |s| s >= offset + 16) {
            let mut buffer = [0u8; 16];
            let count = src.read(&mut buffer)?;
            offset += count.to_u64();
            if count != 16 {
                debug!("malformed uuid (short read)");
            }
        } else {
            debug!("malformed uuid, skipping");
        }
    }
    if size.is_some_and(|s| offset > s) {
        return Err(Error::InvalidData(SubError::InvalidBoxSize, "box smaller than its header"));
    }
    Ok(BoxHeader { name, size, offset })
}

#[test]
fn fourcc_display() {
    let f = FourCC::from(BoxType::ItemPropertyContainerBox);
    assert_eq!(f.to_string(), "ipco");
    assert_eq!(f, b"ipco");
    assert_eq!(FourCC::from(0x6876_6331), FourCC::new(b"hvc1"));
}

#[test]
fn box_header_sizes() {
    let mut data: &[u8] = b"\0\0\0\x10ftyp";
    let head = read_box_header(&mut data).unwrap();
    assert_eq!(head.name, BoxType::FileTypeBox);
    assert_eq!(head.size, Some(16));
    assert_eq!(head.offset, 8);

    let mut data: &[u8] = b"\0\0\0\x01mdat\0\0\0\0\0\0\0\x20";
    let head = read_box_header(&mut data).unwrap();
    assert_eq!(head.size, Some(32));
    assert_eq!(head.offset, 16);

    let mut data: &[u8] = b"\0\0\0\x04free";
    assert!(read_box_header(&mut data).is_err());

    let mut data: &[u8] = b"\0\0\0\0mdat";
    assert_eq!(read_box_header(&mut data).unwrap().size, None);
}
