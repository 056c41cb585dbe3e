// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{try_zeroed, Error, Result, SubError, TryVec, Warning};
use arrayvec::ArrayVec;

/// Color model of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Colorspace {
    /// Keep whatever the decoder produced.
    Undefined,
    YCbCr,
    Rgb,
    Monochrome,
}

/// Plane layout of a decoded image.
///
/// Samples deeper than 8 bits occupy two bytes. Planar layouts store them
/// little-endian; the interleaved 16-bit layouts name their byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chroma {
    /// Keep the decoder's layout, or pick the natural one for the target colorspace.
    Undefined,
    Monochrome,
    C420,
    C422,
    C444,
    InterleavedRgb,
    InterleavedRgba,
    InterleavedRrggbbBe,
    InterleavedRrggbbaaBe,
    InterleavedRrggbbLe,
    InterleavedRrggbbaaLe,
}

impl Chroma {
    pub fn is_interleaved(self) -> bool {
        matches!(
            self,
            Self::InterleavedRgb
                | Self::InterleavedRgba
                | Self::InterleavedRrggbbBe
                | Self::InterleavedRrggbbaaBe
                | Self::InterleavedRrggbbLe
                | Self::InterleavedRrggbbaaLe
        )
    }

    pub fn has_interleaved_alpha(self) -> bool {
        matches!(self, Self::InterleavedRgba | Self::InterleavedRrggbbaaBe | Self::InterleavedRrggbbaaLe)
    }

    /// Whether interleaved samples occupy two bytes each.
    pub fn is_interleaved_hdr(self) -> bool {
        matches!(
            self,
            Self::InterleavedRrggbbBe
                | Self::InterleavedRrggbbaaBe
                | Self::InterleavedRrggbbLe
                | Self::InterleavedRrggbbaaLe
        )
    }

    pub(crate) fn is_big_endian(self) -> bool {
        matches!(self, Self::InterleavedRrggbbBe | Self::InterleavedRrggbbaaBe)
    }

    /// Horizontal and vertical chroma subsampling factors.
    pub fn subsampling(self) -> (u32, u32) {
        match self {
            Self::C420 => (2, 2),
            Self::C422 => (2, 1),
            _ => (1, 1),
        }
    }

    /// Size of a Cb/Cr plane for an image of the given size.
    pub fn chroma_plane_size(self, width: u32, height: u32) -> (u32, u32) {
        let (sx, sy) = self.subsampling();
        (width.div_ceil(sx), height.div_ceil(sy))
    }

    fn interleaved_channels(self) -> usize {
        if self.has_interleaved_alpha() { 4 } else { 3 }
    }
}

/// Identifies a plane of a [`DecodedImage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Y,
    Cb,
    Cr,
    R,
    G,
    B,
    Alpha,
    /// The single plane of an interleaved layout.
    Interleaved,
}

#[derive(Debug)]
pub(crate) struct Plane {
    pub channel: Channel,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    /// Bytes per pixel; for interleaved planes this covers every channel.
    pub pixel_bytes: usize,
    pub stride: usize,
    pub data: TryVec<u8>,
}

impl Plane {
    pub fn alloc(channel: Channel, width: u32, height: u32, bit_depth: u8, pixel_bytes: usize) -> Result<Self> {
        let row = (width as usize)
            .checked_mul(pixel_bytes)
            .ok_or(Error::InvalidData(SubError::InvalidImageSize, "plane row overflow"))?;
        let stride = row.div_ceil(16) * 16;
        let len = stride
            .checked_mul(height as usize)
            .ok_or(Error::InvalidData(SubError::InvalidImageSize, "plane size overflow"))?;
        Ok(Self { channel, width, height, bit_depth, pixel_bytes, stride, data: try_zeroed(len)? })
    }

    /// A zeroed plane of a different size with the same sample format.
    pub fn alloc_like(&self, width: u32, height: u32) -> Result<Self> {
        Self::alloc(self.channel, width, height, self.bit_depth, self.pixel_bytes)
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.width as usize * self.pixel_bytes]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride;
        let len = self.width as usize * self.pixel_bytes;
        &mut self.data[start..start + len]
    }

    /// Read a planar sample.
    pub fn sample(&self, x: u32, y: u32) -> u16 {
        let at = y as usize * self.stride + x as usize * self.pixel_bytes;
        if self.pixel_bytes == 1 {
            u16::from(self.data[at])
        } else {
            u16::from_le_bytes([self.data[at], self.data[at + 1]])
        }
    }

    pub fn set_sample(&mut self, x: u32, y: u32, value: u16) {
        let at = y as usize * self.stride + x as usize * self.pixel_bytes;
        if self.pixel_bytes == 1 {
            self.data[at] = value as u8;
        } else {
            self.data[at..at + 2].copy_from_slice(&value.to_le_bytes());
        }
    }

    pub fn fill(&mut self, value: u16) {
        for y in 0..self.height {
            for x in 0..self.width {
                self.set_sample(x, y, value);
            }
        }
    }
}

pub(crate) fn planar_sample_bytes(bit_depth: u8) -> usize {
    if bit_depth > 8 { 2 } else { 1 }
}

/// Pixels produced by a decoder backend, the grid compositor or the color converter.
///
/// Planes are addressed by [`Channel`]; rows are padded to a 16-byte aligned stride.
#[derive(Debug)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    colorspace: Colorspace,
    chroma: Chroma,
    planes: ArrayVec<Plane, 4>,
    warnings: TryVec<Warning>,
}

impl DecodedImage {
    /// An image with no planes yet. Add them with [`add_plane`](Self::add_plane).
    pub fn new(width: u32, height: u32, colorspace: Colorspace, chroma: Chroma) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Usage(SubError::InvalidImageSize, "image dimensions must be non-zero"));
        }
        let valid = match colorspace {
            Colorspace::YCbCr => matches!(chroma, Chroma::C420 | Chroma::C422 | Chroma::C444),
            Colorspace::Rgb => chroma == Chroma::C444 || chroma.is_interleaved(),
            Colorspace::Monochrome => chroma == Chroma::Monochrome,
            Colorspace::Undefined => false,
        };
        if !valid {
            return Err(Error::Usage(SubError::InvalidParameter, "chroma does not fit the colorspace"));
        }
        Ok(Self { width, height, colorspace, chroma, planes: ArrayVec::new(), warnings: TryVec::new() })
    }

    /// Allocate a zeroed plane for `channel`. Its size must match what the chroma layout implies.
    pub fn add_plane(&mut self, channel: Channel, width: u32, height: u32, bit_depth: u8) -> Result<()> {
        if !(1..=16).contains(&bit_depth) {
            return Err(Error::Usage(SubError::InvalidParameter, "bit depth must be within 1..=16"));
        }
        let allowed = match (self.colorspace, channel) {
            (_, Channel::Alpha) => !self.chroma.is_interleaved(),
            (Colorspace::YCbCr, Channel::Y | Channel::Cb | Channel::Cr) => true,
            (Colorspace::Monochrome, Channel::Y) => true,
            (Colorspace::Rgb, Channel::R | Channel::G | Channel::B) => !self.chroma.is_interleaved(),
            (Colorspace::Rgb, Channel::Interleaved) => self.chroma.is_interleaved(),
            _ => false,
        };
        if !allowed {
            return Err(Error::Usage(SubError::NonexistingImageChannel, "channel does not fit the chroma layout"));
        }
        if self.has_channel(channel) {
            return Err(Error::Usage(SubError::InvalidParameter, "plane already exists"));
        }
        let expected = match channel {
            Channel::Cb | Channel::Cr => self.chroma.chroma_plane_size(self.width, self.height),
            _ => (self.width, self.height),
        };
        if (width, height) != expected {
            return Err(Error::Usage(SubError::InvalidImageSize, "plane size does not match the image"));
        }
        let pixel_bytes = if channel == Channel::Interleaved {
            let hdr = self.chroma.is_interleaved_hdr();
            if hdr != (bit_depth > 8) {
                return Err(Error::Usage(SubError::InvalidParameter, "bit depth does not fit the interleaved layout"));
            }
            self.chroma.interleaved_channels() * planar_sample_bytes(bit_depth)
        } else {
            planar_sample_bytes(bit_depth)
        };
        self.push_plane(Plane::alloc(channel, width, height, bit_depth, pixel_bytes)?)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn colorspace(&self) -> Colorspace {
        self.colorspace
    }

    pub fn chroma(&self) -> Chroma {
        self.chroma
    }

    pub fn has_channel(&self, channel: Channel) -> bool {
        self.planes.iter().any(|p| p.channel == channel)
    }

    /// Read-only plane bytes and the row stride in bytes.
    pub fn plane(&self, channel: Channel) -> Option<(&[u8], usize)> {
        self.get(channel).map(|p| (&p.data[..], p.stride))
    }

    pub fn plane_mut(&mut self, channel: Channel) -> Option<(&mut [u8], usize)> {
        self.planes.iter_mut().find(|p| p.channel == channel).map(|p| {
            let stride = p.stride;
            (&mut p.data[..], stride)
        })
    }

    pub fn plane_size(&self, channel: Channel) -> Option<(u32, u32)> {
        self.get(channel).map(|p| (p.width, p.height))
    }

    pub fn bits_per_pixel(&self, channel: Channel) -> Option<u8> {
        self.get(channel).map(|p| p.bit_depth)
    }

    /// Recoverable problems met while producing this image.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub(crate) fn get(&self, channel: Channel) -> Option<&Plane> {
        self.planes.iter().find(|p| p.channel == channel)
    }

    pub(crate) fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub(crate) fn planes_mut(&mut self) -> &mut [Plane] {
        &mut self.planes
    }

    pub(crate) fn take_plane(&mut self, channel: Channel) -> Option<Plane> {
        let index = self.planes.iter().position(|p| p.channel == channel)?;
        Some(self.planes.remove(index))
    }

    pub(crate) fn push_plane(&mut self, plane: Plane) -> Result<()> {
        self.planes
            .try_push(plane)
            .map_err(|_| Error::Usage(SubError::InvalidParameter, "too many planes"))
    }

    pub(crate) fn push_warning(&mut self, warning: Warning) -> Result<()> {
        log::warn!("{warning}");
        self.warnings.push(warning)?;
        Ok(())
    }

    pub(crate) fn take_warnings(&mut self) -> TryVec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    pub(crate) fn extend_warnings(&mut self, warnings: TryVec<Warning>) -> Result<()> {
        for w in warnings {
            self.warnings.push(w)?;
        }
        Ok(())
    }

    /// Same image with its planes replaced, keeping accumulated warnings.
    pub(crate) fn rebuild(
        &mut self,
        width: u32,
        height: u32,
        colorspace: Colorspace,
        chroma: Chroma,
        planes: ArrayVec<Plane, 4>,
    ) {
        self.width = width;
        self.height = height;
        self.colorspace = colorspace;
        self.chroma = chroma;
        self.planes = planes;
    }
}

#[test]
fn plane_layout() {
    let mut img = DecodedImage::new(5, 3, Colorspace::YCbCr, Chroma::C420).unwrap();
    img.add_plane(Channel::Y, 5, 3, 8).unwrap();
    img.add_plane(Channel::Cb, 3, 2, 8).unwrap();
    assert!(img.add_plane(Channel::Cr, 5, 3, 8).is_err());
    img.add_plane(Channel::Cr, 3, 2, 8).unwrap();
    assert!(img.add_plane(Channel::R, 5, 3, 8).is_err());

    let (y, stride) = img.plane(Channel::Y).unwrap();
    assert_eq!(stride, 16);
    assert_eq!(y.len(), 48);
    assert_eq!(img.plane_size(Channel::Cb), Some((3, 2)));
    assert!(img.plane(Channel::Alpha).is_none());
}

#[test]
fn interleaved_depths() {
    let mut img = DecodedImage::new(4, 2, Colorspace::Rgb, Chroma::InterleavedRrggbbaaLe).unwrap();
    assert!(img.add_plane(Channel::Interleaved, 4, 2, 8).is_err());
    img.add_plane(Channel::Interleaved, 4, 2, 10).unwrap();
    let (_, stride) = img.plane(Channel::Interleaved).unwrap();
    assert_eq!(stride, 32);
    assert!(DecodedImage::new(4, 2, Colorspace::Monochrome, Chroma::C420).is_err());
}

#[test]
fn high_bit_samples_are_little_endian() {
    let mut plane = Plane::alloc(Channel::Y, 2, 1, 10, 2).unwrap();
    plane.set_sample(1, 0, 0x3ff);
    assert_eq!(&plane.row(0)[2..4], &[0xff, 0x03]);
    assert_eq!(plane.sample(1, 0), 0x3ff);
}
