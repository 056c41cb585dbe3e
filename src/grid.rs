// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Grid items: descriptor parsing and tile stitching.

use crate::image::{Channel, Chroma, DecodedImage, Plane};
use crate::{be_u16, be_u32, try_filled, Error, Result, SubError, TryVec, Warning};
use byteorder::ReadBytesExt;
use log::{debug, warn};

/// Layout of a `grid` item, read from the item's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageGrid {
    pub rows: u16,
    pub columns: u16,
    pub output_width: u32,
    pub output_height: u32,
}

impl ImageGrid {
    /// Parse an ImageGrid payload
    /// See ISO/IEC 23008-12:2017 § 6.6.2.3
    pub fn parse(mut src: &[u8]) -> Result<Self> {
        let version = src.read_u8()?;
        if version != 0 {
            return Err(Error::Unsupported(SubError::UnsupportedDataVersion, "grid version > 0"));
        }
        let flags = src.read_u8()?;
        let rows = u16::from(src.read_u8()?) + 1;
        let columns = u16::from(src.read_u8()?) + 1;
        // flags & 1 selects 32-bit output dimensions
        let (output_width, output_height) = if flags & 1 == 0 {
            (u32::from(be_u16(&mut src)?), u32::from(be_u16(&mut src)?))
        } else {
            (be_u32(&mut src)?, be_u32(&mut src)?)
        };
        if output_width == 0 || output_height == 0 {
            return Err(Error::InvalidData(SubError::InvalidGridData, "grid output size cannot be zero"));
        }
        Ok(Self { rows, columns, output_width, output_height })
    }

    pub fn tile_count(&self) -> u32 {
        u32::from(self.rows) * u32::from(self.columns)
    }
}

enum TileState {
    Empty,
    Placed,
    Failed(u32),
}

/// Output buffer of a grid image.
///
/// Tiles may be pasted in any order, including from several decode
/// threads feeding one collector; the result only depends on the tile
/// contents. The first pasted tile fixes the tile size and sample format.
pub struct GridCanvas {
    grid: ImageGrid,
    tile_size: Option<(u32, u32)>,
    image: Option<DecodedImage>,
    tiles: TryVec<TileState>,
}

impl GridCanvas {
    pub fn new(grid: &ImageGrid) -> Result<Self> {
        let mut tiles = TryVec::with_capacity(grid.tile_count() as usize)?;
        for _ in 0..grid.tile_count() {
            tiles.push(TileState::Empty)?;
        }
        Ok(Self { grid: *grid, tile_size: None, image: None, tiles })
    }

    pub fn grid(&self) -> &ImageGrid {
        &self.grid
    }

    fn check_index(&self, index: usize) -> Result<()> {
        match self.tiles.get(index) {
            Some(TileState::Empty) => Ok(()),
            Some(_) => Err(Error::Usage(SubError::InvalidParameter, "grid tile already placed")),
            None => Err(Error::Usage(SubError::InvalidParameter, "grid tile index out of range")),
        }
    }

    fn init(&mut self, tile: &DecodedImage) -> Result<()> {
        let (tw, th) = (tile.width(), tile.height());
        let grid = &self.grid;
        if u64::from(tw) * u64::from(grid.columns) < u64::from(grid.output_width)
            || u64::from(th) * u64::from(grid.rows) < u64::from(grid.output_height)
        {
            return Err(Error::InvalidData(SubError::InvalidGridData, "grid tiles do not cover the output size"));
        }
        if u64::from(tw) * u64::from(grid.columns.saturating_sub(1)) >= u64::from(grid.output_width)
            || u64::from(th) * u64::from(grid.rows.saturating_sub(1)) >= u64::from(grid.output_height)
        {
            return Err(Error::InvalidData(SubError::InvalidGridData, "grid tiles start outside the output size"));
        }
        let (sx, sy) = tile.chroma().subsampling();
        if tw % sx != 0 || th % sy != 0 {
            return Err(Error::InvalidData(SubError::InvalidGridData, "subsampled grid tiles need even dimensions"));
        }
        let mut canvas = DecodedImage::new(grid.output_width, grid.output_height, tile.colorspace(), tile.chroma())?;
        for plane in tile.planes() {
            let (w, h) = match plane.channel {
                Channel::Cb | Channel::Cr => tile.chroma().chroma_plane_size(grid.output_width, grid.output_height),
                _ => (grid.output_width, grid.output_height),
            };
            canvas.add_plane(plane.channel, w, h, plane.bit_depth)?;
        }
        debug!("grid {}x{} of {tw}x{th} tiles into {}x{}", grid.columns, grid.rows, grid.output_width, grid.output_height);
        self.tile_size = Some((tw, th));
        self.image = Some(canvas);
        Ok(())
    }

    /// Copy a decoded tile to its place. Parts outside the output are dropped.
    pub fn paste_tile(&mut self, index: usize, tile: &DecodedImage) -> Result<()> {
        self.check_index(index)?;
        if self.image.is_none() {
            self.init(tile)?;
        }
        let (tw, th) = self.tile_size.ok_or(Error::Usage(SubError::InvalidParameter, "grid not initialized"))?;
        let Some(canvas) = self.image.as_mut() else {
            return Err(Error::Usage(SubError::InvalidParameter, "grid not initialized"));
        };
        if (tile.width(), tile.height()) != (tw, th)
            || tile.colorspace() != canvas.colorspace()
            || tile.chroma() != canvas.chroma()
            || tile.planes().len() != canvas.planes().len()
        {
            return Err(Error::InvalidData(SubError::InvalidGridData, "grid tiles differ in size or format"));
        }
        let columns = usize::from(self.grid.columns);
        let (col, row) = ((index % columns) as u32, (index / columns) as u32);
        let (sx, sy) = canvas.chroma().subsampling();

        for src in tile.planes() {
            let dst = canvas
                .planes_mut()
                .iter_mut()
                .find(|p| p.channel == src.channel && p.bit_depth == src.bit_depth)
                .ok_or(Error::InvalidData(SubError::InvalidGridData, "grid tiles differ in size or format"))?;
            let (px, py) = match src.channel {
                Channel::Cb | Channel::Cr => (col * tw / sx, row * th / sy),
                _ => (col * tw, row * th),
            };
            copy_region(src, dst, px, py);
        }
        self.tiles[index] = TileState::Placed;
        Ok(())
    }

    /// Record a tile that could not be decoded; [`finish`](Self::finish) fills it with a flat placeholder.
    pub fn mark_failed(&mut self, index: usize, item_id: u32) -> Result<()> {
        self.check_index(index)?;
        warn!("grid tile {index} (item {item_id}) failed to decode");
        self.tiles[index] = TileState::Failed(item_id);
        Ok(())
    }

    pub fn finish(self) -> Result<DecodedImage> {
        let (mut canvas, (tw, th)) = match (self.image, self.tile_size) {
            (Some(image), Some(size)) => (image, size),
            _ => return Err(Error::InvalidData(SubError::MissingGridImages, "no grid tile could be decoded")),
        };
        let columns = usize::from(self.grid.columns);
        let chroma = canvas.chroma();
        let (sx, sy) = chroma.subsampling();
        for (index, state) in self.tiles.iter().enumerate() {
            match *state {
                TileState::Placed => {},
                TileState::Empty => return Err(Error::InvalidData(SubError::MissingGridImages, "grid tile missing")),
                TileState::Failed(item_id) => {
                    let (col, row) = ((index % columns) as u32, (index / columns) as u32);
                    for plane in canvas.planes_mut().iter_mut() {
                        let (px, py, w, h) = match plane.channel {
                            Channel::Cb | Channel::Cr => (col * tw / sx, row * th / sy, tw / sx, th / sy),
                            _ => (col * tw, row * th, tw, th),
                        };
                        fill_region(plane, chroma, px, py, w, h)?;
                    }
                    canvas.push_warning(Warning::for_item(
                        SubError::TileDecodeFailed,
                        "grid tile failed to decode, placeholder used",
                        item_id,
                    ))?;
                },
            }
        }
        Ok(canvas)
    }
}

fn copy_region(src: &Plane, dst: &mut Plane, x: u32, y: u32) {
    if x >= dst.width || y >= dst.height {
        return;
    }
    let w = src.width.min(dst.width - x) as usize * src.pixel_bytes;
    let h = src.height.min(dst.height - y);
    let offset = x as usize * dst.pixel_bytes;
    for row in 0..h {
        dst.row_mut(y + row)[offset..offset + w].copy_from_slice(&src.row(row)[..w]);
    }
}

/// Neutral gray with opaque alpha.
fn fill_region(plane: &mut Plane, chroma: Chroma, x: u32, y: u32, w: u32, h: u32) -> Result<()> {
    if x >= plane.width || y >= plane.height {
        return Ok(());
    }
    let value: u16 = match plane.channel {
        Channel::Cb | Channel::Cr => 1 << (plane.bit_depth - 1),
        Channel::Alpha => ((1u32 << plane.bit_depth) - 1) as u16,
        _ => 0,
    };
    let w = w.min(plane.width - x);
    let h = h.min(plane.height - y);
    if plane.channel == Channel::Interleaved {
        let mut fill = try_filled(w as usize * plane.pixel_bytes, 0u8)?;
        if chroma.has_interleaved_alpha() {
            let sample_bytes = plane.pixel_bytes / 4;
            let opaque = ((1u32 << plane.bit_depth) - 1) as u16;
            let bytes = if chroma.is_big_endian() { opaque.to_be_bytes() } else { opaque.to_le_bytes() };
            for pixel in fill.chunks_exact_mut(plane.pixel_bytes) {
                let alpha = &mut pixel[3 * sample_bytes..];
                match sample_bytes {
                    1 => alpha[0] = opaque as u8,
                    _ => alpha.copy_from_slice(&bytes),
                }
            }
        }
        for row in y..y + h {
            let at = x as usize * plane.pixel_bytes;
            plane.row_mut(row)[at..at + fill.len()].copy_from_slice(&fill);
        }
        return Ok(());
    }
    for row in y..y + h {
        for col in x..x + w {
            plane.set_sample(col, row, value);
        }
    }
    Ok(())
}
