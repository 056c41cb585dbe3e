// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Colorspace, chroma layout and bit depth conversion.
//!
//! Images are unpacked into full-precision planar work planes, converted,
//! and packed into the requested layout.

use crate::color::{NclxColorProfile, YCbCrMatrix};
use crate::decoder::{ChromaDownsampling, ChromaUpsampling, ColorConversionOptions};
use crate::image::{planar_sample_bytes, Channel, Chroma, Colorspace, DecodedImage, Plane};
use crate::{try_filled, Error, Result, SubError, TryVec};
use arrayvec::ArrayVec;
use log::{trace, warn};

const SHARP_ITERATIONS: usize = 4;

struct WorkPlane {
    channel: Channel,
    width: u32,
    height: u32,
    data: TryVec<i32>,
}

impl WorkPlane {
    fn new(channel: Channel, width: u32, height: u32, fill: i32) -> Result<Self> {
        Ok(Self { channel, width, height, data: try_filled(width as usize * height as usize, fill)? })
    }

    #[inline]
    fn get(&self, x: u32, y: u32) -> i32 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    #[inline]
    fn set(&mut self, x: u32, y: u32, v: i32) {
        let w = self.width as usize;
        self.data[y as usize * w + x as usize] = v;
    }
}

struct Work {
    width: u32,
    height: u32,
    colorspace: Colorspace,
    /// Planar layout only
    chroma: Chroma,
    depth: u8,
    planes: ArrayVec<WorkPlane, 4>,
}

impl Work {
    fn get(&self, channel: Channel) -> Result<&WorkPlane> {
        self.planes
            .iter()
            .find(|p| p.channel == channel)
            .ok_or(Error::Usage(SubError::NonexistingImageChannel, "image is missing a color plane"))
    }

    fn take(&mut self, channel: Channel) -> Option<WorkPlane> {
        let index = self.planes.iter().position(|p| p.channel == channel)?;
        Some(self.planes.remove(index))
    }

    fn max(&self) -> i32 {
        max_value(self.depth)
    }
}

fn max_value(depth: u8) -> i32 {
    (1i32 << depth) - 1
}

fn rescale(v: i32, from_max: i32, to_max: i32) -> i32 {
    if from_max == to_max {
        v
    } else {
        ((i64::from(v) * i64::from(to_max) + i64::from(from_max / 2)) / i64::from(from_max)) as i32
    }
}

/// Resolve `Undefined` targets against the source image.
fn resolve_target(source: &DecodedImage, colorspace: Colorspace, chroma: Chroma) -> (Colorspace, Chroma) {
    let colorspace = match colorspace {
        Colorspace::Undefined => source.colorspace(),
        cs => cs,
    };
    let chroma = match chroma {
        Chroma::Undefined if colorspace == source.colorspace() => source.chroma(),
        Chroma::Undefined => match colorspace {
            Colorspace::Monochrome => Chroma::Monochrome,
            _ => Chroma::C444,
        },
        c => c,
    };
    (colorspace, chroma)
}

/// Convert `image` to the target colorspace and chroma layout.
///
/// `nclx` supplies the YCbCr matrix and range. Converting RGB to monochrome
/// is not supported. Bit depth is kept except for the 8-bit interleaved
/// layouts, which round deeper samples down to 8 bits.
pub fn convert_colorspace(
    mut image: DecodedImage,
    colorspace: Colorspace,
    chroma: Chroma,
    nclx: &NclxColorProfile,
    options: &ColorConversionOptions,
) -> Result<DecodedImage> {
    let (colorspace, chroma) = resolve_target(&image, colorspace, chroma);
    if colorspace == image.colorspace() && chroma == image.chroma() {
        return Ok(image);
    }
    trace!("converting {:?}/{:?} to {colorspace:?}/{chroma:?}", image.colorspace(), image.chroma());
    if chroma.is_interleaved() && colorspace != Colorspace::Rgb {
        return Err(Error::Usage(SubError::InvalidParameter, "interleaved layouts are RGB only"));
    }

    let work = unpack(&image)?;
    let work = match colorspace {
        Colorspace::Rgb => to_rgb(work, nclx, options)?,
        Colorspace::YCbCr => to_ycbcr(work, chroma, nclx, options)?,
        Colorspace::Monochrome => to_monochrome(work)?,
        Colorspace::Undefined => return Err(Error::Usage(SubError::InvalidParameter, "undefined colorspace")),
    };
    let mut out = pack(work, colorspace, chroma)?;
    out.extend_warnings(image.take_warnings())?;
    Ok(out)
}

/// Change the chroma layout of a YCbCr image.
pub(crate) fn change_chroma(image: DecodedImage, chroma: Chroma, options: &ColorConversionOptions) -> Result<DecodedImage> {
    convert_colorspace(image, Colorspace::YCbCr, chroma, &NclxColorProfile::default(), options)
}

/// Round every sample deeper than 8 bits down to 8 bits.
///
/// 16-bit interleaved layouts become their 8-bit counterparts.
pub fn reduce_to_8bit(mut image: DecodedImage) -> Result<DecodedImage> {
    let chroma = image.chroma();
    if chroma.is_interleaved_hdr() {
        let target = if chroma.has_interleaved_alpha() { Chroma::InterleavedRgba } else { Chroma::InterleavedRgb };
        let work = unpack(&image)?;
        let mut out = pack(work, Colorspace::Rgb, target)?;
        out.extend_warnings(image.take_warnings())?;
        return Ok(out);
    }
    if image.planes().iter().all(|p| p.bit_depth <= 8) {
        return Ok(image);
    }
    let mut planes = ArrayVec::new();
    for plane in image.planes() {
        if plane.bit_depth <= 8 {
            let mut copy = plane.alloc_like(plane.width, plane.height)?;
            copy.data.copy_from_slice(&plane.data);
            planes.push(copy);
            continue;
        }
        let max = max_value(plane.bit_depth);
        let mut out = Plane::alloc(plane.channel, plane.width, plane.height, 8, 1)?;
        for y in 0..plane.height {
            for x in 0..plane.width {
                out.set_sample(x, y, rescale(i32::from(plane.sample(x, y)), max, 255) as u16);
            }
        }
        planes.push(out);
    }
    let (w, h, cs) = (image.width(), image.height(), image.colorspace());
    image.rebuild(w, h, cs, chroma, planes);
    Ok(image)
}

fn read_interleaved(row: &[u8], index: usize, hdr: bool, big_endian: bool) -> i32 {
    if !hdr {
        return i32::from(row[index]);
    }
    let b = [row[index * 2], row[index * 2 + 1]];
    i32::from(if big_endian { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) })
}

fn unpack(image: &DecodedImage) -> Result<Work> {
    let (width, height) = (image.width(), image.height());
    let chroma = image.chroma();
    let mut planes = ArrayVec::new();

    if chroma.is_interleaved() {
        let src = image
            .get(Channel::Interleaved)
            .ok_or(Error::Usage(SubError::NonexistingImageChannel, "missing interleaved plane"))?;
        let channels: &[Channel] = if chroma.has_interleaved_alpha() {
            &[Channel::R, Channel::G, Channel::B, Channel::Alpha]
        } else {
            &[Channel::R, Channel::G, Channel::B]
        };
        let (hdr, be) = (chroma.is_interleaved_hdr(), chroma.is_big_endian());
        for (c, &channel) in channels.iter().enumerate() {
            let mut plane = WorkPlane::new(channel, width, height, 0)?;
            for y in 0..height {
                let row = src.row(y);
                for x in 0..width {
                    plane.set(x, y, read_interleaved(row, x as usize * channels.len() + c, hdr, be));
                }
            }
            planes.push(plane);
        }
        return Ok(Work { width, height, colorspace: Colorspace::Rgb, chroma: Chroma::C444, depth: src.bit_depth, planes });
    }

    let main = match image.colorspace() {
        Colorspace::Rgb => Channel::G,
        _ => Channel::Y,
    };
    let depth = image
        .bits_per_pixel(main)
        .ok_or(Error::Usage(SubError::NonexistingImageChannel, "image is missing a color plane"))?;
    let max = max_value(depth);
    for src in image.planes() {
        let mut plane = WorkPlane::new(src.channel, src.width, src.height, 0)?;
        let src_max = max_value(src.bit_depth);
        for y in 0..src.height {
            for x in 0..src.width {
                plane.set(x, y, rescale(i32::from(src.sample(x, y)), src_max, max));
            }
        }
        planes.push(plane);
    }
    Ok(Work { width, height, colorspace: image.colorspace(), chroma, depth, planes })
}

struct SampleRange {
    luma_offset: f32,
    luma_scale: f32,
    chroma_scale: f32,
    half: f32,
    max: f32,
}

impl SampleRange {
    fn new(depth: u8, full_range: bool) -> Self {
        let max = max_value(depth) as f32;
        let half = (1i32 << (depth - 1)) as f32;
        if full_range {
            Self { luma_offset: 0.0, luma_scale: 1.0, chroma_scale: 1.0, half, max }
        } else {
            let s = (f32::from(depth) - 8.0).exp2();
            Self { luma_offset: 16.0 * s, luma_scale: 219.0 * s / max, chroma_scale: 224.0 * s / max, half, max }
        }
    }

    fn clamp(&self, v: f32) -> i32 {
        v.round().clamp(0.0, self.max) as i32
    }
}

fn ycbcr_to_rgb_planes(work: &mut Work, nclx: &NclxColorProfile) -> Result<()> {
    let matrix = YCbCrMatrix::for_profile(nclx)?;
    let range = SampleRange::new(work.depth, nclx.full_range);
    let y = work.take(Channel::Y).ok_or(Error::Usage(SubError::NonexistingImageChannel, "missing Y plane"))?;
    let cb = work.take(Channel::Cb).ok_or(Error::Usage(SubError::NonexistingImageChannel, "missing Cb plane"))?;
    let cr = work.take(Channel::Cr).ok_or(Error::Usage(SubError::NonexistingImageChannel, "missing Cr plane"))?;
    let (w, h) = (work.width, work.height);
    let mut r = WorkPlane::new(Channel::R, w, h, 0)?;
    let mut g = WorkPlane::new(Channel::G, w, h, 0)?;
    let mut b = WorkPlane::new(Channel::B, w, h, 0)?;
    for py in 0..h {
        for px in 0..w {
            let yv = (y.get(px, py) as f32 - range.luma_offset) / range.luma_scale;
            let (rv, gv, bv) = match matrix {
                YCbCrMatrix::Identity => {
                    let scale = |v: i32| (v as f32 - range.luma_offset) / range.luma_scale;
                    (scale(cr.get(px, py)), yv, scale(cb.get(px, py)))
                },
                YCbCrMatrix::KrKb { kr, kb } => {
                    let kg = 1.0 - kr - kb;
                    let u = (cb.get(px, py) as f32 - range.half) / range.chroma_scale;
                    let v = (cr.get(px, py) as f32 - range.half) / range.chroma_scale;
                    let rv = yv + 2.0 * (1.0 - kr) * v;
                    let bv = yv + 2.0 * (1.0 - kb) * u;
                    let gv = yv - (2.0 * kb * (1.0 - kb) * u + 2.0 * kr * (1.0 - kr) * v) / kg;
                    (rv, gv, bv)
                },
            };
            r.set(px, py, range.clamp(rv));
            g.set(px, py, range.clamp(gv));
            b.set(px, py, range.clamp(bv));
        }
    }
    for p in [r, g, b] {
        work.planes.push(p);
    }
    work.colorspace = Colorspace::Rgb;
    Ok(())
}

fn rgb_to_ycbcr_planes(work: &mut Work, nclx: &NclxColorProfile) -> Result<()> {
    let matrix = YCbCrMatrix::for_profile(nclx)?;
    let range = SampleRange::new(work.depth, nclx.full_range);
    let r = work.take(Channel::R).ok_or(Error::Usage(SubError::NonexistingImageChannel, "missing R plane"))?;
    let g = work.take(Channel::G).ok_or(Error::Usage(SubError::NonexistingImageChannel, "missing G plane"))?;
    let b = work.take(Channel::B).ok_or(Error::Usage(SubError::NonexistingImageChannel, "missing B plane"))?;
    let (w, h) = (work.width, work.height);
    let mut y = WorkPlane::new(Channel::Y, w, h, 0)?;
    let mut cb = WorkPlane::new(Channel::Cb, w, h, 0)?;
    let mut cr = WorkPlane::new(Channel::Cr, w, h, 0)?;
    for py in 0..h {
        for px in 0..w {
            let (rv, gv, bv) = (r.get(px, py) as f32, g.get(px, py) as f32, b.get(px, py) as f32);
            let (yv, u, v) = match matrix {
                YCbCrMatrix::Identity => {
                    let scale = |v: f32| v * range.luma_scale + range.luma_offset;
                    (scale(gv), scale(bv), scale(rv))
                },
                YCbCrMatrix::KrKb { kr, kb } => {
                    let kg = 1.0 - kr - kb;
                    let yf = kr * rv + kg * gv + kb * bv;
                    let u = (bv - yf) / (2.0 * (1.0 - kb));
                    let v = (rv - yf) / (2.0 * (1.0 - kr));
                    (
                        yf * range.luma_scale + range.luma_offset,
                        u * range.chroma_scale + range.half,
                        v * range.chroma_scale + range.half,
                    )
                },
            };
            y.set(px, py, range.clamp(yv));
            cb.set(px, py, range.clamp(u));
            cr.set(px, py, range.clamp(v));
        }
    }
    for p in [y, cb, cr] {
        work.planes.push(p);
    }
    work.colorspace = Colorspace::YCbCr;
    Ok(())
}

/// Horizontal or vertical 2x upsampling with 3/4, 1/4 weights. Output is scaled by 4.
fn upsample_axis(src: &WorkPlane, out_len: u32, horizontal: bool) -> Result<WorkPlane> {
    let (w, h) = if horizontal { (out_len, src.height) } else { (src.width, out_len) };
    let mut out = WorkPlane::new(src.channel, w, h, 0)?;
    let src_len = if horizontal { src.width } else { src.height };
    for y in 0..h {
        for x in 0..w {
            let pos = if horizontal { x } else { y };
            let i = (pos / 2).min(src_len - 1);
            let n = if pos % 2 == 0 { i.saturating_sub(1) } else { (i + 1).min(src_len - 1) };
            let (a, b) = if horizontal { (src.get(i, y), src.get(n, y)) } else { (src.get(x, i), src.get(x, n)) };
            out.set(x, y, 3 * a + b);
        }
    }
    Ok(out)
}

fn upsample_plane(src: &WorkPlane, width: u32, height: u32, algorithm: ChromaUpsampling) -> Result<WorkPlane> {
    let sx = src.width < width;
    let sy = src.height < height;
    match algorithm {
        ChromaUpsampling::NearestNeighbor => {
            let mut out = WorkPlane::new(src.channel, width, height, 0)?;
            for y in 0..height {
                for x in 0..width {
                    let from_x = if sx { x / 2 } else { x };
                    let from_y = if sy { y / 2 } else { y };
                    out.set(x, y, src.get(from_x.min(src.width - 1), from_y.min(src.height - 1)));
                }
            }
            Ok(out)
        },
        ChromaUpsampling::Bilinear => {
            let mut scale = 1;
            let mut plane = None;
            if sx {
                plane = Some(upsample_axis(src, width, true)?);
                scale *= 4;
            }
            if sy {
                plane = Some(upsample_axis(plane.as_ref().unwrap_or(src), height, false)?);
                scale *= 4;
            }
            let mut out = match plane {
                Some(p) => p,
                None => WorkPlane { channel: src.channel, width, height, data: clone_data(&src.data)? },
            };
            for v in out.data.iter_mut() {
                *v = (*v + scale / 2).div_euclid(scale);
            }
            Ok(out)
        },
    }
}

fn clone_data(data: &[i32]) -> Result<TryVec<i32>> {
    let mut out = TryVec::with_capacity(data.len())?;
    out.extend_from_slice(data)?;
    Ok(out)
}

fn downsample_plane(src: &WorkPlane, width: u32, height: u32, average: bool) -> Result<WorkPlane> {
    let sx = width < src.width;
    let sy = height < src.height;
    if !average {
        let mut out = WorkPlane::new(src.channel, width, height, 0)?;
        for y in 0..height {
            for x in 0..width {
                let from_x = if sx { x * 2 } else { x };
                let from_y = if sy { y * 2 } else { y };
                out.set(x, y, src.get(from_x, from_y));
            }
        }
        return Ok(out);
    }
    let mut horizontal = WorkPlane::new(src.channel, width, src.height, 0)?;
    for y in 0..src.height {
        for x in 0..width {
            let v = if sx {
                let a = src.get(x * 2, y);
                let b = src.get((x * 2 + 1).min(src.width - 1), y);
                (a + b + 1) >> 1
            } else {
                src.get(x, y)
            };
            horizontal.set(x, y, v);
        }
    }
    if !sy {
        return Ok(horizontal);
    }
    let mut out = WorkPlane::new(src.channel, width, height, 0)?;
    for y in 0..height {
        for x in 0..width {
            let a = horizontal.get(x, y * 2);
            let b = horizontal.get(x, (y * 2 + 1).min(src.height - 1));
            out.set(x, y, (a + b + 1) >> 1);
        }
    }
    Ok(out)
}

/// Average-downsample, then repeatedly feed back the error between the
/// full-resolution chroma and the bilinear reconstruction of the result.
fn sharp_downsample(src: &WorkPlane, width: u32, height: u32, max: i32) -> Result<WorkPlane> {
    let mut chroma = downsample_plane(src, width, height, true)?;
    for _ in 0..SHARP_ITERATIONS {
        let rebuilt = upsample_plane(&chroma, src.width, src.height, ChromaUpsampling::Bilinear)?;
        let mut error = WorkPlane::new(src.channel, src.width, src.height, 0)?;
        for (e, (s, r)) in error.data.iter_mut().zip(src.data.iter().zip(rebuilt.data.iter())) {
            *e = s - r;
        }
        let correction = downsample_plane(&error, width, height, true)?;
        for (c, d) in chroma.data.iter_mut().zip(correction.data.iter()) {
            *c = (*c + d).clamp(0, max);
        }
    }
    Ok(chroma)
}

fn resample_chroma(work: &mut Work, target: Chroma, options: &ColorConversionOptions, sharp_available: bool) -> Result<()> {
    if work.chroma == target {
        return Ok(());
    }
    let (w, h) = (work.width, work.height);
    let max = work.max();
    let mut downsampling = options.preferred_chroma_downsampling;
    if downsampling == ChromaDownsampling::Sharp && !(sharp_available && matches!(target, Chroma::C420 | Chroma::C422)) {
        if options.only_use_preferred_chroma_algorithm {
            return Err(Error::Unsupported(
                SubError::UnsupportedColorConversion,
                "sharp chroma downsampling is only available from RGB",
            ));
        }
        warn!("sharp chroma downsampling unavailable here, using nearest neighbor");
        downsampling = ChromaDownsampling::NearestNeighbor;
    }
    let (cw, ch) = target.chroma_plane_size(w, h);
    for channel in [Channel::Cb, Channel::Cr] {
        let mut plane = work.take(channel).ok_or(Error::Usage(SubError::NonexistingImageChannel, "missing chroma plane"))?;
        if work.chroma != Chroma::C444 {
            plane = upsample_plane(&plane, w, h, options.preferred_chroma_upsampling)?;
        }
        if target != Chroma::C444 {
            plane = match downsampling {
                ChromaDownsampling::NearestNeighbor => downsample_plane(&plane, cw, ch, false)?,
                ChromaDownsampling::Average => downsample_plane(&plane, cw, ch, true)?,
                ChromaDownsampling::Sharp => sharp_downsample(&plane, cw, ch, max)?,
            };
        }
        work.planes.push(plane);
    }
    work.chroma = target;
    Ok(())
}

fn mono_chroma_planes(work: &mut Work, target: Chroma) -> Result<()> {
    let (cw, ch) = target.chroma_plane_size(work.width, work.height);
    let half = 1i32 << (work.depth - 1);
    work.planes.push(WorkPlane::new(Channel::Cb, cw, ch, half)?);
    work.planes.push(WorkPlane::new(Channel::Cr, cw, ch, half)?);
    work.colorspace = Colorspace::YCbCr;
    work.chroma = target;
    Ok(())
}

/// Replicate luma into R, G and B. Matrix and range do not apply.
fn mono_to_rgb_planes(work: &mut Work) -> Result<()> {
    let y = work.take(Channel::Y).ok_or(Error::Usage(SubError::NonexistingImageChannel, "missing Y plane"))?;
    for channel in [Channel::R, Channel::G, Channel::B] {
        let mut plane = WorkPlane::new(channel, y.width, y.height, 0)?;
        plane.data.copy_from_slice(&y.data);
        work.planes.push(plane);
    }
    work.colorspace = Colorspace::Rgb;
    Ok(())
}

fn to_rgb(mut work: Work, nclx: &NclxColorProfile, options: &ColorConversionOptions) -> Result<Work> {
    match work.colorspace {
        Colorspace::Rgb => {},
        Colorspace::YCbCr => {
            resample_chroma(&mut work, Chroma::C444, options, false)?;
            ycbcr_to_rgb_planes(&mut work, nclx)?;
        },
        Colorspace::Monochrome => mono_to_rgb_planes(&mut work)?,
        Colorspace::Undefined => return Err(Error::Usage(SubError::InvalidParameter, "undefined colorspace")),
    }
    work.chroma = Chroma::C444;
    Ok(work)
}

fn to_ycbcr(mut work: Work, target: Chroma, nclx: &NclxColorProfile, options: &ColorConversionOptions) -> Result<Work> {
    if !matches!(target, Chroma::C420 | Chroma::C422 | Chroma::C444) {
        return Err(Error::Usage(SubError::InvalidParameter, "YCbCr needs a 4:2:0, 4:2:2 or 4:4:4 layout"));
    }
    match work.colorspace {
        Colorspace::YCbCr => resample_chroma(&mut work, target, options, false)?,
        Colorspace::Rgb => {
            rgb_to_ycbcr_planes(&mut work, nclx)?;
            resample_chroma(&mut work, target, options, true)?;
        },
        Colorspace::Monochrome => mono_chroma_planes(&mut work, target)?,
        Colorspace::Undefined => return Err(Error::Usage(SubError::InvalidParameter, "undefined colorspace")),
    }
    Ok(work)
}

fn to_monochrome(mut work: Work) -> Result<Work> {
    match work.colorspace {
        Colorspace::Rgb => {
            return Err(Error::Usage(SubError::UnsupportedColorConversion, "RGB to monochrome is not supported"));
        },
        Colorspace::YCbCr => {
            work.take(Channel::Cb);
            work.take(Channel::Cr);
        },
        _ => {},
    }
    work.colorspace = Colorspace::Monochrome;
    work.chroma = Chroma::Monochrome;
    Ok(work)
}

fn pack(work: Work, colorspace: Colorspace, chroma: Chroma) -> Result<DecodedImage> {
    let mut out = DecodedImage::new(work.width, work.height, colorspace, chroma)?;
    if !chroma.is_interleaved() {
        let bytes = planar_sample_bytes(work.depth);
        for src in &work.planes {
            let mut plane = Plane::alloc(src.channel, src.width, src.height, work.depth, bytes)?;
            for y in 0..src.height {
                for x in 0..src.width {
                    plane.set_sample(x, y, src.get(x, y) as u16);
                }
            }
            out.push_plane(plane)?;
        }
        return Ok(out);
    }

    let hdr = chroma.is_interleaved_hdr();
    if hdr && work.depth <= 8 {
        return Err(Error::Usage(SubError::InvalidParameter, "16-bit interleaved output needs a deeper source"));
    }
    let depth = if hdr { work.depth } else { 8 };
    let (src_max, dst_max) = (work.max(), max_value(depth));
    let opaque;
    let mut channels: ArrayVec<&WorkPlane, 4> = ArrayVec::new();
    for ch in [Channel::R, Channel::G, Channel::B] {
        channels.push(work.get(ch)?);
    }
    if chroma.has_interleaved_alpha() {
        match work.get(Channel::Alpha) {
            Ok(a) => channels.push(a),
            Err(_) => {
                opaque = WorkPlane::new(Channel::Alpha, work.width, work.height, src_max)?;
                channels.push(&opaque);
            },
        }
    }
    out.add_plane(Channel::Interleaved, work.width, work.height, depth)?;
    let be = chroma.is_big_endian();
    let count = channels.len();
    let (data, stride) = out
        .plane_mut(Channel::Interleaved)
        .ok_or(Error::Usage(SubError::NonexistingImageChannel, "missing interleaved plane"))?;
    for y in 0..work.height {
        let row = &mut data[y as usize * stride..];
        for x in 0..work.width {
            for (c, plane) in channels.iter().enumerate() {
                let v = rescale(plane.get(x, y), src_max, dst_max) as u16;
                let i = x as usize * count + c;
                if hdr {
                    let bytes = if be { v.to_be_bytes() } else { v.to_le_bytes() };
                    row[i * 2..i * 2 + 2].copy_from_slice(&bytes);
                } else {
                    row[i] = v as u8;
                }
            }
        }
    }
    Ok(out)
}
