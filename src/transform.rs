// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Geometric transformation properties (`irot`, `imir`, `clap`) and their
//! application to decoded pixels.
//!
//! Transformations apply in the order the container associates them with
//! the item. A crop that follows a rotation is resolved against the rotated
//! size.

use crate::convert::change_chroma;
use crate::decoder::{ChromaUpsampling, ColorConversionOptions};
use crate::image::{Chroma, DecodedImage, Plane};
use crate::{be_i32, be_u32, Error, ParseOptions, Result, SubError, TryVec, Warning};
use arrayvec::ArrayVec;
use byteorder::ReadBytesExt;

/// Counter-clockwise rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rotation {
    D0,
    D90,
    D180,
    D270,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Self::D0 => 0,
            Self::D90 => 90,
            Self::D180 => 180,
            Self::D270 => 270,
        }
    }

    /// Rotation from a degree value; anything but a multiple of 90 in `0..360` is rejected.
    pub fn from_degrees(degrees: u32) -> Result<Self> {
        match degrees {
            0 => Ok(Self::D0),
            90 => Ok(Self::D90),
            180 => Ok(Self::D180),
            270 => Ok(Self::D270),
            _ => Err(Error::InvalidData(SubError::InvalidRotation, "rotation must be 0, 90, 180 or 270")),
        }
    }

    fn quarter_turns(self) -> u8 {
        (self.degrees() / 90) as u8
    }

    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Self::D90 | Self::D270)
    }
}

/// Mirroring direction of an `imir` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MirrorDirection {
    /// Flip top and bottom.
    Vertical,
    /// Flip left and right.
    Horizontal,
}

/// Clean aperture, in the fractional units the `clap` box stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanAperture {
    pub width_n: u32,
    pub width_d: u32,
    pub height_n: u32,
    pub height_d: u32,
    pub horiz_off_n: i32,
    pub horiz_off_d: u32,
    pub vert_off_n: i32,
    pub vert_off_d: u32,
}

/// Pixels to remove from each edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropBorders {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropBorders {
    pub fn cropped_size(&self, width: u32, height: u32) -> (u32, u32) {
        (width - self.left - self.right, height - self.top - self.bottom)
    }
}

/// `a/b` rounded half up.
fn round_fraction(num: i128, den: i128) -> i128 {
    (2 * num + den).div_euclid(2 * den)
}

/// First and last kept pixel along one axis.
fn aperture_span(size: u32, clean_n: u32, clean_d: u32, off_n: i32, off_d: u32) -> Result<(u32, u32)> {
    if size == 0 || clean_d == 0 || off_d == 0 {
        return Err(Error::InvalidData(SubError::InvalidCleanAperture, "clap with zero denominator"));
    }
    let (clean_n, clean_d, off_n, off_d) = (i128::from(clean_n), i128::from(clean_d), i128::from(off_n), i128::from(off_d));
    let size = i128::from(size);
    // center = off + (size-1)/2 ; half = (clean-1)/2 ; over a common denominator of 2*off_d*clean_d
    let den = 2 * off_d * clean_d;
    let center = 2 * off_n * clean_d + (size - 1) * off_d * clean_d;
    let half = (clean_n - clean_d) * off_d;
    let first = round_fraction(center - half, den).max(0);
    let last = round_fraction(center + half, den).min(size - 1);
    if first > last {
        return Err(Error::InvalidData(SubError::InvalidCleanAperture, "clean aperture is empty"));
    }
    Ok((first as u32, last as u32))
}

impl CleanAperture {
    /// Resolve to pixel borders against the image size at the point the crop applies.
    pub fn crop_borders(&self, width: u32, height: u32) -> Result<CropBorders> {
        let (left, right) = aperture_span(width, self.width_n, self.width_d, self.horiz_off_n, self.horiz_off_d)?;
        let (top, bottom) = aperture_span(height, self.height_n, self.height_d, self.vert_off_n, self.vert_off_d)?;
        Ok(CropBorders { left, top, right: width - 1 - right, bottom: height - 1 - bottom })
    }
}

/// One transformation property, in association order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Rotate(Rotation),
    Mirror(MirrorDirection),
    Crop(CleanAperture),
}

impl Transform {
    pub(crate) fn kind(&self) -> PropertyType {
        match self {
            Self::Rotate(_) => PropertyType::TransformRotation,
            Self::Mirror(_) => PropertyType::TransformMirror,
            Self::Crop(_) => PropertyType::TransformCrop,
        }
    }

    /// Image size after this step.
    pub fn output_size(&self, width: u32, height: u32) -> Result<(u32, u32)> {
        Ok(match self {
            Self::Rotate(r) if r.swaps_dimensions() => (height, width),
            Self::Rotate(_) | Self::Mirror(_) => (width, height),
            Self::Crop(clap) => clap.crop_borders(width, height)?.cropped_size(width, height),
        })
    }
}

/// Property kinds, as reported by property enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    ImageSpatialExtents,
    TransformRotation,
    TransformMirror,
    TransformCrop,
    ColorProfile,
    PixelInformation,
    AuxiliaryType,
    CodecConfiguration,
    PixelAspectRatio,
    Other,
}

pub(crate) fn read_irot(mut src: &[u8], options: &ParseOptions, warnings: &mut TryVec<Warning>) -> Result<Rotation> {
    let value = src.read_u8()?;
    if value & !0b11 != 0 {
        options.recover(warnings, Warning::new(SubError::InvalidRotation, "reserved bits set in irot"))?;
    }
    Rotation::from_degrees(u32::from(value & 0b11) * 90)
}

pub(crate) fn read_imir(mut src: &[u8], options: &ParseOptions, warnings: &mut TryVec<Warning>) -> Result<MirrorDirection> {
    let value = src.read_u8()?;
    if value & !1 != 0 {
        options.recover(warnings, Warning::new(SubError::InvalidMirror, "reserved bits set in imir"))?;
    }
    Ok(if value & 1 == 0 { MirrorDirection::Vertical } else { MirrorDirection::Horizontal })
}

/// Parse a Clean Aperture Box
/// See ISO 14496-12:2015 § 12.1.4
pub(crate) fn read_clap(mut src: &[u8]) -> Result<CleanAperture> {
    let clap = CleanAperture {
        width_n: be_u32(&mut src)?,
        width_d: be_u32(&mut src)?,
        height_n: be_u32(&mut src)?,
        height_d: be_u32(&mut src)?,
        horiz_off_n: be_i32(&mut src)?,
        horiz_off_d: be_u32(&mut src)?,
        vert_off_n: be_i32(&mut src)?,
        vert_off_d: be_u32(&mut src)?,
    };
    if clap.width_d == 0 || clap.height_d == 0 || clap.horiz_off_d == 0 || clap.vert_off_d == 0 {
        return Err(Error::InvalidData(SubError::InvalidCleanAperture, "clap with zero denominator"));
    }
    Ok(clap)
}

/// EXIF orientation tag values.
///
/// Values match the EXIF Orientation tag (TIFF tag 274).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Orientation {
    #[default]
    Normal = 1,
    /// Mirror left-right.
    FlipHorizontal = 2,
    Rotate180 = 3,
    /// Mirror top-bottom.
    FlipVertical = 4,
    Transpose = 5,
    /// Rotate 90 degrees clockwise.
    Rotate90 = 6,
    Transverse = 7,
    /// Rotate 270 degrees clockwise (90 CCW).
    Rotate270 = 8,
}

// bit 0: flip left-right, bit 1: flip top-bottom, bit 2: transpose
const BITMASK_TO_ORIENTATION: [Orientation; 8] = [
    Orientation::Normal,
    Orientation::FlipHorizontal,
    Orientation::FlipVertical,
    Orientation::Rotate180,
    Orientation::Transpose,
    Orientation::Rotate270,
    Orientation::Rotate90,
    Orientation::Transverse,
];
const ROTATION_TO_BITMASK: [u8; 4] = [0b000, 0b101, 0b011, 0b110];

impl Orientation {
    pub fn exif_value(self) -> u16 {
        self as u16
    }

    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Self::Transpose | Self::Rotate90 | Self::Transverse | Self::Rotate270)
    }

    /// Fold the rotation and mirror steps into a single EXIF orientation. Crops are ignored.
    pub fn from_transformations(transforms: &[Transform]) -> Self {
        let mut bitmask = 0u8;
        for t in transforms {
            let mut op = match t {
                Transform::Rotate(r) => ROTATION_TO_BITMASK[usize::from(r.quarter_turns())],
                Transform::Mirror(MirrorDirection::Horizontal) => 0b001,
                Transform::Mirror(MirrorDirection::Vertical) => 0b010,
                Transform::Crop(_) => continue,
            };
            if bitmask & 0b100 != 0 {
                op = (op & 0b100) | ((op & 0b001) << 1) | ((op & 0b010) >> 1);
            }
            bitmask ^= op;
        }
        BITMASK_TO_ORIENTATION[usize::from(bitmask)]
    }
}

/// Apply transformations in order.
pub fn apply_transformations(mut image: DecodedImage, transforms: &[Transform]) -> Result<DecodedImage> {
    for t in transforms {
        image = match *t {
            Transform::Rotate(Rotation::D0) => image,
            Transform::Rotate(r) => rotate(image, r)?,
            Transform::Mirror(dir) => mirror(image, dir)?,
            Transform::Crop(clap) => {
                let borders = clap.crop_borders(image.width(), image.height())?;
                crop(image, borders)?
            },
        };
    }
    Ok(image)
}

fn map_planes(
    image: &mut DecodedImage,
    width: u32,
    height: u32,
    mut f: impl FnMut(&Plane) -> Result<Plane>,
) -> Result<()> {
    let mut planes = ArrayVec::new();
    for plane in image.planes() {
        planes.push(f(plane)?);
    }
    let (colorspace, chroma) = (image.colorspace(), image.chroma());
    image.rebuild(width, height, colorspace, chroma, planes);
    Ok(())
}

fn rotate(mut image: DecodedImage, rotation: Rotation) -> Result<DecodedImage> {
    if rotation.swaps_dimensions() && image.chroma() == Chroma::C422 {
        let options = ColorConversionOptions {
            preferred_chroma_upsampling: ChromaUpsampling::NearestNeighbor,
            ..ColorConversionOptions::default()
        };
        image = change_chroma(image, Chroma::C444, &options)?;
        image.push_warning(Warning::new(SubError::ChromaPromoted, "4:2:2 promoted to 4:4:4 for rotation"))?;
    }
    let (w, h) = (image.width(), image.height());
    let (nw, nh) = if rotation.swaps_dimensions() { (h, w) } else { (w, h) };
    map_planes(&mut image, nw, nh, |src| {
        let (pw, ph) = (src.width, src.height);
        let mut dst = if rotation.swaps_dimensions() { src.alloc_like(ph, pw)? } else { src.alloc_like(pw, ph)? };
        let bytes = src.pixel_bytes;
        for y in 0..ph {
            let row = src.row(y);
            for x in 0..pw {
                let (dx, dy) = match rotation {
                    Rotation::D90 => (y, pw - 1 - x),
                    Rotation::D180 => (pw - 1 - x, ph - 1 - y),
                    Rotation::D270 => (ph - 1 - y, x),
                    Rotation::D0 => (x, y),
                };
                let from = x as usize * bytes;
                let to = dx as usize * bytes;
                dst.row_mut(dy)[to..to + bytes].copy_from_slice(&row[from..from + bytes]);
            }
        }
        Ok(dst)
    })?;
    Ok(image)
}

fn mirror(mut image: DecodedImage, direction: MirrorDirection) -> Result<DecodedImage> {
    let (w, h) = (image.width(), image.height());
    map_planes(&mut image, w, h, |src| {
        let mut dst = src.alloc_like(src.width, src.height)?;
        let bytes = src.pixel_bytes;
        for y in 0..src.height {
            match direction {
                MirrorDirection::Vertical => dst.row_mut(src.height - 1 - y).copy_from_slice(src.row(y)),
                MirrorDirection::Horizontal => {
                    let row = src.row(y);
                    let out = dst.row_mut(y);
                    for (i, px) in row.chunks_exact(bytes).rev().enumerate() {
                        out[i * bytes..(i + 1) * bytes].copy_from_slice(px);
                    }
                },
            }
        }
        Ok(dst)
    })?;
    Ok(image)
}

fn crop(mut image: DecodedImage, borders: CropBorders) -> Result<DecodedImage> {
    let (w, h) = (image.width(), image.height());
    let (nw, nh) = borders.cropped_size(w, h);
    let chroma = image.chroma();
    map_planes(&mut image, nw, nh, |src| {
        // subsampled planes crop at the containing chroma sample
        let (sx, sy) = if src.width == w && src.height == h { (1, 1) } else { chroma.subsampling() };
        let left = borders.left / sx;
        let top = borders.top / sy;
        let pw = nw.div_ceil(sx).min(src.width - left);
        let ph = nh.div_ceil(sy).min(src.height - top);
        let mut dst = src.alloc_like(pw, ph)?;
        let bytes = src.pixel_bytes;
        let from = left as usize * bytes;
        for y in 0..ph {
            dst.row_mut(y).copy_from_slice(&src.row(top + y)[from..from + pw as usize * bytes]);
        }
        Ok(dst)
    })?;
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Channel, Colorspace};

    fn clap(w: u32, h: u32) -> CleanAperture {
        CleanAperture {
            width_n: w,
            width_d: 1,
            height_n: h,
            height_d: 1,
            horiz_off_n: 0,
            horiz_off_d: 1,
            vert_off_n: 0,
            vert_off_d: 1,
        }
    }

    fn gray(width: u32, height: u32) -> DecodedImage {
        let mut img = DecodedImage::new(width, height, Colorspace::Monochrome, Chroma::Monochrome).unwrap();
        img.add_plane(Channel::Y, width, height, 8).unwrap();
        let (data, stride) = img.plane_mut(Channel::Y).unwrap();
        for y in 0..height as usize {
            for x in 0..width as usize {
                data[y * stride + x] = (y * width as usize + x) as u8;
            }
        }
        img
    }

    fn at(img: &DecodedImage, x: usize, y: usize) -> u8 {
        let (data, stride) = img.plane(Channel::Y).unwrap();
        data[y * stride + x]
    }

    #[test]
    fn centered_crop_borders() {
        let borders = clap(30, 80).crop_borders(50, 100).unwrap();
        assert_eq!(borders, CropBorders { left: 10, top: 10, right: 10, bottom: 10 });
    }

    #[test]
    fn offset_and_oversized_crop() {
        let mut c = clap(10, 10);
        c.horiz_off_n = -20;
        let b = c.crop_borders(100, 100).unwrap();
        assert_eq!((b.left, b.right), (25, 65));

        let b = clap(500, 500).crop_borders(100, 100).unwrap();
        assert_eq!(b, CropBorders::default());

        let mut c = clap(1, 1);
        c.horiz_off_n = 1000;
        assert_eq!(c.crop_borders(10, 10).unwrap_err().suberror(), SubError::InvalidCleanAperture);
    }

    #[test]
    fn rotation_directions() {
        let img = gray(3, 2); // 0 1 2 / 3 4 5
        let r = apply_transformations(img, &[Transform::Rotate(Rotation::D90)]).unwrap();
        assert_eq!((r.width(), r.height()), (2, 3));
        // counter-clockwise: the right column becomes the top row
        assert_eq!((at(&r, 0, 0), at(&r, 1, 0)), (2, 5));
        assert_eq!((at(&r, 0, 2), at(&r, 1, 2)), (0, 3));

        let r = apply_transformations(gray(3, 2), &[Transform::Rotate(Rotation::D270)]).unwrap();
        assert_eq!((at(&r, 0, 0), at(&r, 1, 0)), (3, 0));

        let r = apply_transformations(gray(3, 2), &[Transform::Rotate(Rotation::D180)]).unwrap();
        assert_eq!(at(&r, 0, 0), 5);
    }

    #[test]
    fn mirror_axes() {
        let v = apply_transformations(gray(3, 2), &[Transform::Mirror(MirrorDirection::Vertical)]).unwrap();
        assert_eq!(at(&v, 0, 0), 3);
        let h = apply_transformations(gray(3, 2), &[Transform::Mirror(MirrorDirection::Horizontal)]).unwrap();
        assert_eq!(at(&h, 0, 0), 2);
    }

    #[test]
    fn crop_after_rotation_uses_rotated_size() {
        let img = gray(100, 50);
        let out = apply_transformations(img, &[Transform::Rotate(Rotation::D90), Transform::Crop(clap(30, 80))]).unwrap();
        assert_eq!((out.width(), out.height()), (30, 80));

        let img = gray(100, 50);
        // crop first keeps at most 50 rows, giving 50x30 after rotation
        let out = apply_transformations(img, &[Transform::Crop(clap(30, 80)), Transform::Rotate(Rotation::D90)]).unwrap();
        assert_eq!((out.width(), out.height()), (50, 30));
    }

    #[test]
    fn rotated_422_is_promoted() {
        let mut img = DecodedImage::new(4, 2, Colorspace::YCbCr, Chroma::C422).unwrap();
        img.add_plane(Channel::Y, 4, 2, 8).unwrap();
        img.add_plane(Channel::Cb, 2, 2, 8).unwrap();
        img.add_plane(Channel::Cr, 2, 2, 8).unwrap();
        let out = apply_transformations(img, &[Transform::Rotate(Rotation::D90)]).unwrap();
        assert_eq!(out.chroma(), Chroma::C444);
        assert_eq!(out.plane_size(Channel::Cb), Some((2, 4)));
        assert_eq!(out.warnings()[0].suberror, SubError::ChromaPromoted);
    }

    #[test]
    fn orientation_folding() {
        use Transform::*;
        assert_eq!(Orientation::from_transformations(&[]), Orientation::Normal);
        assert_eq!(Orientation::from_transformations(&[Rotate(Rotation::D90)]), Orientation::Rotate270);
        assert_eq!(Orientation::from_transformations(&[Rotate(Rotation::D270)]), Orientation::Rotate90);
        assert_eq!(
            Orientation::from_transformations(&[Mirror(MirrorDirection::Horizontal), Mirror(MirrorDirection::Vertical)]),
            Orientation::Rotate180
        );
        assert_eq!(
            Orientation::from_transformations(&[Rotate(Rotation::D90), Mirror(MirrorDirection::Horizontal)]),
            Orientation::Transverse
        );
    }

    #[test]
    fn irot_imir_parsing() {
        let mut warnings = TryVec::new();
        let strict = ParseOptions::default();
        assert_eq!(read_irot(&[3], &strict, &mut warnings).unwrap(), Rotation::D270);
        assert!(read_irot(&[0x13], &strict, &mut warnings).is_err());
        let lenient = ParseOptions { lenient: true };
        assert_eq!(read_irot(&[0x11], &lenient, &mut warnings).unwrap(), Rotation::D90);
        assert_eq!(warnings.len(), 1);
        assert_eq!(read_imir(&[1], &strict, &mut warnings).unwrap(), MirrorDirection::Horizontal);
        assert!(read_clap(&[0; 32]).is_err());
    }
}
