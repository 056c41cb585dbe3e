#![deny(unsafe_code)]
//! Reader and image-composition engine for HEIF/HEIC-family containers.
//!
//! The crate parses the ISOBMFF box structure, resolves the items it
//! describes (primary images, thumbnails, auxiliary and depth images,
//! metadata blocks), stitches grid images, applies `irot`/`imir`/`clap`
//! transformations in container order and converts decoded pixels between
//! colorspaces, chroma layouts and bit depths.
//!
//! Entropy-coded pixel decoding is not done here. Register one or more
//! [`DecoderPlugin`] backends in a [`DecoderRegistry`] and pass it to
//! [`ImageHandle::decode`].
//!
//! ```no_run
//! use zenheif::{Chroma, Colorspace, DecoderRegistry, DecodingOptions, HeifContext};
//!
//! let bytes = std::fs::read("image.heic")?;
//! let ctx = HeifContext::from_bytes(&bytes)?;
//! let handle = ctx.primary_image_handle()?;
//! println!("{}x{}", handle.width(), handle.height());
//!
//! let registry = DecoderRegistry::new(); // register backends here
//! let image = handle.decode(&registry, Colorspace::Rgb, Chroma::InterleavedRgb, &DecodingOptions::default())?;
//! let (pixels, stride) = image.plane(zenheif::Channel::Interleaved).unwrap();
//! # let _ = (pixels, stride);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use byteorder::ReadBytesExt;
use fallible_collections::TryReserveError;
use log::warn;
use std::convert::TryInto as _;

mod boxes;
mod color;
mod context;
mod convert;
mod decoder;
mod grid;
mod image;
mod item;
mod transform;
mod tree;

pub use crate::boxes::FourCC;
pub use crate::color::{
    Chromaticities, ColorPrimaries, ColorProfileType, MatrixCoefficients, NclxColorProfile, TransferCharacteristics,
};
pub use crate::context::{exif_tiff_payload, AuxiliaryFilter, HeifContext, ImageHandle};
pub use crate::convert::{convert_colorspace, reduce_to_8bit};
pub use crate::decoder::{
    select_decoder, ChromaDownsampling, ChromaUpsampling, CodedItem, ColorConversionOptions, DecoderPlugin,
    DecoderRegistry, DecodingOptions, NoProgress, ProgressSink, ProgressStep,
};
pub use crate::grid::{GridCanvas, ImageGrid};
pub use crate::image::{Channel, Chroma, Colorspace, DecodedImage};
pub use crate::transform::{
    apply_transformations, CleanAperture, CropBorders, MirrorDirection, Orientation, PropertyType, Rotation,
    Transform,
};

pub use enough::{Stop, StopReason, Unstoppable};

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self as u64
    }
}

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

/// Statically verify that the given type can fit within a `usize`.
macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self as usize
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;
type TryString = fallible_collections::TryVec<u8>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Coarse error category, as reported by [`Error::category()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Truncated or malformed input, unsupported file type, dangling item references.
    Input,
    /// Recognized but unimplemented features, or no decoder backend for a format.
    Unsupported,
    /// Allocation failure or a configured resource limit.
    Memory,
    /// The caller passed inconsistent parameters.
    Usage,
    /// A decoder backend reported a failure.
    Decode,
}

/// Detailed error (and warning) sub-category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SubError {
    Unspecified,
    EndOfData,
    InvalidBoxSize,
    BoxNestingTooDeep,
    NoFtypBox,
    NoMetaBox,
    NoHdlrBox,
    NoIinfBox,
    NoIlocBox,
    NoIdatBox,
    NoPictHandler,
    DuplicateItemId,
    NonexistingItemReferenced,
    NoOrInvalidPrimaryItem,
    MissingGridImages,
    InvalidGridData,
    InvalidCleanAperture,
    InvalidRotation,
    InvalidMirror,
    AmbiguousTransformation,
    InvalidPropertyIndex,
    InvalidColorProfile,
    InvalidImageSize,
    InvalidIloc,
    SecurityLimitExceeded,
    UnsupportedDataVersion,
    UnsupportedCodec,
    UnsupportedImageType,
    UnsupportedConstructionMethod,
    UnsupportedColorConversion,
    NonexistingItem,
    NonexistingProperty,
    NonexistingImageChannel,
    ColorProfileDoesNotExist,
    InvalidParameter,
    TileDecodeFailed,
    AlphaDecodeFailed,
    AlphaSizeMismatch,
    ChromaPromoted,
}

/// Describes parser, conversion and decode failures.
///
/// Every variant maps to an [`ErrorCategory`] and a [`SubError`], and
/// renders a non-empty message through `Display`.
#[derive(Debug)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(SubError, &'static str),
    /// The input is not a HEIF file this crate can read.
    UnsupportedFiletype(&'static str),
    /// Parse or decode error caused by limited support rather than invalid data.
    Unsupported(SubError, &'static str),
    /// The caller passed inconsistent parameters.
    Usage(SubError, &'static str),
    /// A decoder backend failed.
    Decoder {
        decoder: std::string::String,
        message: std::string::String,
    },
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// Out of memory
    OutOfMemory,
    /// Resource limit exceeded during parsing or decoding
    ResourceLimitExceeded(&'static str),
    /// Parsing was stopped/cancelled
    Stopped(enough::StopReason),
}

impl Error {
    /// Build a backend failure. Intended for [`DecoderPlugin`] implementations.
    pub fn decoder(decoder: &str, message: impl Into<std::string::String>) -> Self {
        let mut message = message.into();
        if message.is_empty() {
            message.push_str("decoder failed");
        }
        Self::Decoder { decoder: decoder.into(), message }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidData(..) | Self::UnsupportedFiletype(_) | Self::UnexpectedEOF | Self::Io(_) => {
                ErrorCategory::Input
            },
            Self::Unsupported(..) => ErrorCategory::Unsupported,
            Self::OutOfMemory | Self::ResourceLimitExceeded(_) => ErrorCategory::Memory,
            Self::Usage(..) | Self::Stopped(_) => ErrorCategory::Usage,
            Self::Decoder { .. } => ErrorCategory::Decode,
        }
    }

    pub fn suberror(&self) -> SubError {
        match self {
            Self::InvalidData(sub, _) | Self::Unsupported(sub, _) | Self::Usage(sub, _) => *sub,
            Self::UnsupportedFiletype(_) => SubError::NoFtypBox,
            Self::UnexpectedEOF => SubError::EndOfData,
            Self::ResourceLimitExceeded(_) => SubError::SecurityLimitExceeded,
            Self::Io(_) | Self::OutOfMemory | Self::Stopped(_) | Self::Decoder { .. } => SubError::Unspecified,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(_, s)
            | Self::Unsupported(_, s)
            | Self::Usage(_, s)
            | Self::UnsupportedFiletype(s)
            | Self::ResourceLimitExceeded(s) => s,
            Self::Decoder { decoder, message } => return write!(f, "{decoder}: {message}"),
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return err.fmt(f),
            Self::OutOfMemory => "OOM",
            Self::Stopped(reason) => return write!(f, "Stopped: {}", reason),
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData(SubError::EndOfData, "truncated bits")
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

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported(SubError::Unspecified, "integer conversion failed")
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<enough::StopReason> for Error {
    fn from(reason: enough::StopReason) -> Self {
        Self::Stopped(reason)
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A recoverable malformation, recorded instead of failing in lenient mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Warning {
    pub suberror: SubError,
    pub message: &'static str,
    /// The item the warning is about, when there is one.
    pub item_id: Option<u32>,
}

impl Warning {
    pub(crate) const fn new(suberror: SubError, message: &'static str) -> Self {
        Self { suberror, message, item_id: None }
    }

    pub(crate) const fn for_item(suberror: SubError, message: &'static str, item_id: u32) -> Self {
        Self { suberror, message, item_id: Some(item_id) }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.item_id {
            Some(id) => write!(f, "item {id}: {}", self.message),
            None => f.write_str(self.message),
        }
    }
}

/// Options for parsing the box structure
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ParseOptions {
    /// When true, non-critical validation errors are recorded as warnings
    /// instead of failing the parse.
    pub lenient: bool,
}

impl ParseOptions {
    /// Fail in strict mode, record a warning in lenient mode.
    pub(crate) fn recover(&self, warnings: &mut TryVec<Warning>, warning: Warning) -> Result<()> {
        if self.lenient {
            warn!("{warning} (recovered)");
            warnings.push(warning)?;
            Ok(())
        } else {
            Err(Error::InvalidData(warning.suberror, warning.message))
        }
    }
}

/// Configuration for reading HEIF files with resource limits and validation options
///
/// Resource limits are checked **before** allocations occur, preventing out-of-memory
/// conditions from malicious files that claim unrealistic dimensions or counts.
///
/// # Examples
///
/// ```rust
/// use zenheif::ReadConfig;
///
/// // Default limits (suitable for most apps)
/// let config = ReadConfig::default();
///
/// // Strict limits for untrusted input
/// let config = ReadConfig::default()
///     .with_total_megapixels_limit(64)
///     .with_max_grid_tiles(256);
///
/// // Tolerate recoverable malformations
/// let config = ReadConfig::default().lenient(true);
/// ```
#[derive(Debug, Clone)]
pub struct ReadConfig {
    /// Maximum megapixels of any reconstructed image.
    /// Default: 512 megapixels
    pub total_megapixels_limit: Option<u32>,

    /// Maximum number of grid tiles.
    /// Default: 1,000 tiles
    pub max_grid_tiles: Option<u32>,

    /// Maximum number of items declared in `iinf`.
    /// Default: 10,000 items
    pub max_items: Option<u32>,

    /// Enable lenient parsing mode.
    /// Default: false (strict validation)
    pub lenient: bool,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            total_megapixels_limit: Some(512),
            max_grid_tiles: Some(1_000),
            max_items: Some(10_000),
            lenient: false,
        }
    }
}

impl ReadConfig {
    /// Create a configuration with no resource limits.
    pub fn unlimited() -> Self {
        Self {
            total_megapixels_limit: None,
            max_grid_tiles: None,
            max_items: None,
            lenient: false,
        }
    }

    /// Set the total megapixels limit for reconstructed images
    pub fn with_total_megapixels_limit(mut self, megapixels: u32) -> Self {
        self.total_megapixels_limit = Some(megapixels);
        self
    }

    /// Set the maximum grid tile count
    pub fn with_max_grid_tiles(mut self, tiles: u32) -> Self {
        self.max_grid_tiles = Some(tiles);
        self
    }

    /// Set the maximum item count
    pub fn with_max_items(mut self, items: u32) -> Self {
        self.max_items = Some(items);
        self
    }

    /// Enable lenient parsing mode
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    pub(crate) fn parse_options(&self) -> ParseOptions {
        ParseOptions { lenient: self.lenient }
    }
}

pub(crate) struct ResourceTracker<'a> {
    config: &'a ReadConfig,
}

impl<'a> ResourceTracker<'a> {
    pub(crate) fn new(config: &'a ReadConfig) -> Self {
        Self { config }
    }

    pub(crate) fn validate_total_megapixels(&self, width: u32, height: u32) -> Result<()> {
        if let Some(limit) = self.config.total_megapixels_limit {
            let megapixels = (width as u64)
                .checked_mul(height as u64)
                .ok_or(Error::InvalidData(SubError::InvalidImageSize, "dimension overflow"))?
                / 1_000_000;

            if megapixels > limit as u64 {
                return Err(Error::ResourceLimitExceeded("total megapixels limit exceeded"));
            }
        }

        Ok(())
    }

    pub(crate) fn validate_grid_tiles(&self, count: u32) -> Result<()> {
        if let Some(limit) = self.config.max_grid_tiles {
            if count > limit {
                return Err(Error::ResourceLimitExceeded("grid tile count limit exceeded"));
            }
        }

        Ok(())
    }

    pub(crate) fn validate_item_count(&self, count: u32) -> Result<()> {
        if let Some(limit) = self.config.max_items {
            if count > limit {
                return Err(Error::ResourceLimitExceeded("item count limit exceeded"));
            }
        }

        Ok(())
    }
}

/// Result of [`check_filetype()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTypeResult {
    /// Not a HEIF file.
    No,
    /// A HEIF image file this crate can read.
    YesSupported,
    /// A HEIF-family file, but of a kind this crate cannot read (e.g. image sequences only).
    YesUnsupported,
    /// Not enough data to tell.
    Maybe,
}

const IMAGE_BRANDS: [&[u8; 4]; 6] = [b"heic", b"heix", b"heim", b"heis", b"mif1", b"avif"];
const SEQUENCE_BRANDS: [&[u8; 4]; 5] = [b"hevc", b"hevx", b"msf1", b"avis", b"hevm"];

pub(crate) fn is_image_brand(brand: &FourCC) -> bool {
    IMAGE_BRANDS.iter().any(|b| brand == b)
}

pub(crate) fn is_sequence_brand(brand: &FourCC) -> bool {
    SEQUENCE_BRANDS.iter().any(|b| brand == b)
}

/// Sniff whether `data` starts a HEIF file. At least 12 bytes are needed for a verdict.
pub fn check_filetype(data: &[u8]) -> FileTypeResult {
    if data.len() < 12 {
        return FileTypeResult::Maybe;
    }
    if &data[4..8] != b"ftyp" {
        return FileTypeResult::No;
    }
    let declared = u32::from_be_bytes([data[0], data[1], data[2], data[3]]).to_usize();
    if declared < 16 {
        return FileTypeResult::No;
    }
    let available = declared.min(data.len());
    let mut saw_sequence = false;
    // major brand at 8, minor version at 12, compatible brands from 16
    let brands = std::iter::once(8).chain((16..available).step_by(4));
    for pos in brands {
        let Some(bytes) = data.get(pos..pos + 4) else { break };
        let brand = FourCC::from([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if is_image_brand(&brand) {
            return FileTypeResult::YesSupported;
        }
        saw_sequence |= is_sequence_brand(&brand);
    }
    if saw_sequence {
        FileTypeResult::YesUnsupported
    } else if declared > data.len() {
        FileTypeResult::Maybe
    } else {
        FileTypeResult::No
    }
}

/// Parse the extra header fields for a full box.
pub(crate) fn read_fullbox_extra<T: ReadBytesExt>(src: &mut T) -> Result<(u8, u32)> {
    let version = src.read_u8()?;
    let flags_a = src.read_u8()?;
    let flags_b = src.read_u8()?;
    let flags_c = src.read_u8()?;
    Ok((
        version,
        u32::from(flags_a) << 16 | u32::from(flags_b) << 8 | u32::from(flags_c),
    ))
}

// Parse the extra fields for a full box whose flag fields must be zero.
pub(crate) fn read_fullbox_version_no_flags<T: ReadBytesExt>(src: &mut T, options: &ParseOptions) -> Result<u8> {
    let (version, flags) = read_fullbox_extra(src)?;

    if flags != 0 && !options.lenient {
        return Err(Error::Unsupported(SubError::UnsupportedDataVersion, "expected flags to be 0"));
    }

    Ok(version)
}

/// Read a NUL-terminated string; a missing terminator takes the rest of the payload.
pub(crate) fn read_cstr(src: &mut &[u8]) -> Result<TryString> {
    let end = src.iter().position(|&b| b == 0);
    let (text, rest) = match end {
        Some(pos) => (&src[..pos], &src[pos + 1..]),
        None => (&src[..], &src[src.len()..]),
    };
    let mut out = TryVec::new();
    out.extend_from_slice(text)?;
    *src = rest;
    Ok(out)
}

/// Allocate a zero-filled byte buffer without aborting on OOM.
pub(crate) fn try_zeroed(len: usize) -> Result<TryVec<u8>> {
    try_filled(len, 0u8)
}

pub(crate) fn try_filled<T: Copy>(len: usize, value: T) -> Result<TryVec<T>> {
    let mut v = std::vec::Vec::new();
    v.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
    v.resize(len, value);
    Ok(v.into())
}

pub(crate) fn be_u16<T: ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_i32<T: ReadBytesExt>(src: &mut T) -> Result<i32> {
    src.read_i32::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_u64<T: ReadBytesExt>(src: &mut T) -> Result<u64> {
    src.read_u64::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn usize_from_u64(value: u64) -> Result<usize> {
    Ok(value.try_into()?)
}

#[test]
fn filetype_sniffing() {
    let mut heic = std::vec::Vec::new();
    heic.extend_from_slice(&24u32.to_be_bytes());
    heic.extend_from_slice(b"ftypheic\0\0\0\0mif1heic");
    assert_eq!(check_filetype(&heic), FileTypeResult::YesSupported);

    let mut seq = std::vec::Vec::new();
    seq.extend_from_slice(&20u32.to_be_bytes());
    seq.extend_from_slice(b"ftyphevc\0\0\0\0msf1");
    assert_eq!(check_filetype(&seq), FileTypeResult::YesUnsupported);

    assert_eq!(check_filetype(b"\0\0\0\x18ftypisom\0\0\0\0mp41iso2"), FileTypeResult::No);
    assert_eq!(check_filetype(b"\0\0\0\x18mo"), FileTypeResult::Maybe);
    assert_eq!(check_filetype(b"GIF89a\0\0\0\0\0\0\0\0"), FileTypeResult::No);
}

#[test]
fn error_categories() {
    assert_eq!(Error::UnexpectedEOF.category(), ErrorCategory::Input);
    assert_eq!(Error::UnexpectedEOF.suberror(), SubError::EndOfData);
    let e = Error::Unsupported(SubError::UnsupportedCodec, "no decoder");
    assert_eq!(e.category(), ErrorCategory::Unsupported);
    assert_eq!(e.suberror(), SubError::UnsupportedCodec);
    assert_eq!(Error::OutOfMemory.category(), ErrorCategory::Memory);
    let d = Error::decoder("test", "");
    assert_eq!(d.category(), ErrorCategory::Decode);
    assert!(!d.to_string().is_empty());
}
