// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Opened containers and the image handles derived from them.

use crate::boxes::FourCC;
use crate::color::{ColorProfileType, NclxColorProfile};
use crate::convert::{convert_colorspace, reduce_to_8bit};
use crate::decoder::{CodedItem, DecoderRegistry, DecodingOptions, NoProgress, ProgressSink, ProgressStep};
use crate::grid::{GridCanvas, ImageGrid};
use crate::image::{Channel, Chroma, Colorspace, DecodedImage};
use crate::item::{Item, ItemProperty, ItemStore};
use crate::transform::{apply_transformations, CropBorders, MirrorDirection, Orientation, PropertyType, Transform};
use crate::tree::BoxTree;
use crate::{be_u32, usize_from_u64, Error, ReadConfig, ResourceTracker, Result, SubError, TryVec, Warning};
use arrayvec::ArrayVec;
use log::{debug, warn};
use std::borrow::Cow;
use std::io::Read;
use std::sync::Arc;

/// Which auxiliary images [`ImageHandle::auxiliary_image_ids`] leaves out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuxiliaryFilter {
    pub omit_alpha: bool,
    pub omit_depth: bool,
}

struct ContextInner<'data> {
    raw: Cow<'data, [u8]>,
    store: ItemStore,
    config: ReadConfig,
    warnings: TryVec<Warning>,
}

/// A parsed HEIF container.
///
/// Cloning is cheap; clones and every [`ImageHandle`] share one parsed state.
#[derive(Clone)]
pub struct HeifContext<'data> {
    inner: Arc<ContextInner<'data>>,
}

impl std::fmt::Debug for HeifContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeifContext")
            .field("bytes", &self.inner.raw.len())
            .field("top_level_images", &self.top_level_image_ids())
            .field("warnings", &self.inner.warnings.len())
            .finish()
    }
}

impl<'data> HeifContext<'data> {
    /// Parse `data` in place with default limits.
    pub fn from_bytes(data: &'data [u8]) -> Result<Self> {
        Self::from_bytes_with_config(data, &ReadConfig::default(), &enough::Unstoppable)
    }

    /// Parse `data` in place. `stop` is polled between top-level boxes.
    pub fn from_bytes_with_config(data: &'data [u8], config: &ReadConfig, stop: &dyn enough::Stop) -> Result<Self> {
        Self::open(Cow::Borrowed(data), config, stop)
    }

    fn open(raw: Cow<'data, [u8]>, config: &ReadConfig, stop: &dyn enough::Stop) -> Result<Self> {
        let options = config.parse_options();
        let mut warnings = TryVec::new();
        let tree = BoxTree::parse(&raw, &options, stop, &mut warnings)?;
        let store = ItemStore::parse(&tree, &raw, config, &mut warnings)?;
        if !warnings.is_empty() {
            debug!("container opened with {} warnings", warnings.len());
        }
        Ok(Self { inner: Arc::new(ContextInner { raw, store, config: config.clone(), warnings }) })
    }

    pub fn top_level_image_ids(&self) -> &[u32] {
        self.inner.store.top_level_ids()
    }

    pub fn number_of_top_level_images(&self) -> usize {
        self.top_level_image_ids().len()
    }

    /// Fails with `NoOrInvalidPrimaryItem` when there is no `pitm` or it names no image.
    pub fn primary_image_id(&self) -> Result<u32> {
        self.inner.store.primary_id()
    }

    pub fn image_handle(&self, item_id: u32) -> Result<ImageHandle<'data>> {
        ImageHandle::new(&self.inner, item_id)
    }

    pub fn primary_image_handle(&self) -> Result<ImageHandle<'data>> {
        self.image_handle(self.primary_image_id()?)
    }

    /// Ids of the rotation, mirror and crop properties of `item_id`, in the order they apply.
    pub fn transformation_properties(&self, item_id: u32) -> Result<TryVec<u32>> {
        self.inner.store.transformation_property_ids(item_id)
    }

    pub fn property_type(&self, property_id: u32) -> Result<PropertyType> {
        Ok(self.inner.store.property(property_id)?.property_type())
    }

    /// Counter-clockwise rotation in degrees.
    pub fn property_rotation_ccw(&self, property_id: u32) -> Result<u32> {
        match self.inner.store.property(property_id)? {
            ItemProperty::Rotation(r) => Ok(r.degrees()),
            _ => Err(Error::Usage(SubError::InvalidParameter, "property is not a rotation")),
        }
    }

    pub fn property_mirror(&self, property_id: u32) -> Result<MirrorDirection> {
        match self.inner.store.property(property_id)? {
            ItemProperty::Mirror(m) => Ok(*m),
            _ => Err(Error::Usage(SubError::InvalidParameter, "property is not a mirror")),
        }
    }

    /// Pixel borders of a clean aperture applied to an image of the given size.
    pub fn property_crop_borders(&self, property_id: u32, width: u32, height: u32) -> Result<CropBorders> {
        match self.inner.store.property(property_id)? {
            ItemProperty::CleanAperture(clap) => clap.crop_borders(width, height),
            _ => Err(Error::Usage(SubError::InvalidParameter, "property is not a clean aperture")),
        }
    }

    /// Problems recovered from while parsing in lenient mode.
    pub fn warnings(&self) -> &[Warning] {
        &self.inner.warnings
    }
}

impl HeifContext<'static> {
    /// Take ownership of an in-memory file.
    pub fn from_owned(data: std::vec::Vec<u8>) -> Result<Self> {
        Self::from_owned_with_config(data, &ReadConfig::default(), &enough::Unstoppable)
    }

    pub fn from_owned_with_config(data: std::vec::Vec<u8>, config: &ReadConfig, stop: &dyn enough::Stop) -> Result<Self> {
        Self::open(Cow::Owned(data), config, stop)
    }

    /// Read the whole stream, then parse it.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut data = std::vec::Vec::new();
        reader.read_to_end(&mut data)?;
        Self::from_owned(data)
    }
}

/// Strip the leading TIFF header offset from an `Exif` metadata block.
///
/// Blocks are stored with a 4-byte big-endian offset to the TIFF header.
pub fn exif_tiff_payload(block: &[u8]) -> Result<&[u8]> {
    let mut src = block;
    let offset = usize_from_u64(u64::from(be_u32(&mut src)?))?;
    src.get(offset..)
        .ok_or(Error::InvalidData(SubError::EndOfData, "Exif TIFF header offset past the end of the block"))
}

/// One image item and its relations.
#[derive(Clone)]
pub struct ImageHandle<'data> {
    ctx: Arc<ContextInner<'data>>,
    item_id: u32,
    transforms: ArrayVec<Transform, 3>,
    ispe: Option<(u32, u32)>,
    width: u32,
    height: u32,
}

impl std::fmt::Debug for ImageHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageHandle")
            .field("item_id", &self.item_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("transforms", &self.transforms)
            .finish()
    }
}

impl<'data> ImageHandle<'data> {
    fn new(ctx: &Arc<ContextInner<'data>>, item_id: u32) -> Result<Self> {
        let item = ctx.store.item(item_id)?;
        if !item.is_image() {
            return Err(Error::Usage(SubError::NonexistingItem, "item is not an image"));
        }
        let mut transforms = ArrayVec::new();
        for t in ctx.store.transformations(item_id)? {
            transforms
                .try_push(t)
                .map_err(|_| Error::InvalidData(SubError::AmbiguousTransformation, "too many transformations"))?;
        }
        let ispe = ctx.store.ispe(item);
        let base = match ispe {
            Some(size) => Some(size),
            None if item.item_type == b"grid" => ctx.grid_of(item).ok().map(|g| (g.output_width, g.output_height)),
            None => None,
        };
        let (mut width, mut height) = base.unwrap_or((0, 0));
        if base.is_some() {
            for t in &transforms {
                (width, height) = t.output_size(width, height)?;
            }
        }
        Ok(Self { ctx: Arc::clone(ctx), item_id, transforms, ispe, width, height })
    }

    fn item(&self) -> Result<&Item> {
        self.ctx.store.item(self.item_id)
    }

    fn related(&self, item_id: u32, ids: &[u32]) -> Result<ImageHandle<'data>> {
        if !ids.contains(&item_id) {
            return Err(Error::Usage(SubError::NonexistingItem, "item is not related to this image"));
        }
        Self::new(&self.ctx, item_id)
    }

    pub fn item_id(&self) -> u32 {
        self.item_id
    }

    pub fn is_primary(&self) -> bool {
        self.ctx.store.primary_id().is_ok_and(|id| id == self.item_id)
    }

    /// Width after rotation and cropping.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height after rotation and cropping.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Stored width from `ispe`, or 0 if absent.
    pub fn ispe_width(&self) -> u32 {
        self.ispe.map_or(0, |(w, _)| w)
    }

    pub fn ispe_height(&self) -> u32 {
        self.ispe.map_or(0, |(_, h)| h)
    }

    /// Transformations in the order they apply.
    pub fn transformations(&self) -> &[Transform] {
        &self.transforms
    }

    /// The rotation and mirror steps as one EXIF orientation.
    pub fn orientation(&self) -> Orientation {
        Orientation::from_transformations(&self.transforms)
    }

    fn alpha_id(&self) -> Option<u32> {
        let item = self.item().ok()?;
        item.auxiliaries
            .iter()
            .copied()
            .find(|&id| self.ctx.store.item(id).is_ok_and(|aux| self.ctx.store.is_alpha(aux)))
    }

    pub fn has_alpha_channel(&self) -> bool {
        self.alpha_id().is_some()
    }

    /// Whether color samples are premultiplied by the alpha image (`prem` reference).
    pub fn is_premultiplied_alpha(&self) -> bool {
        self.item().is_ok_and(|item| item.premultiplied_with.is_some())
    }

    /// Luma bit depth from `pixi`, or else from the codec configuration.
    pub fn luma_bits_per_pixel(&self) -> Option<u8> {
        let item = self.item().ok()?;
        let item = match item.tiles.first() {
            Some(&tile) if item.item_type == b"grid" && self.ctx.store.pixi(item).is_none() => {
                self.ctx.store.item(tile).ok()?
            },
            _ => item,
        };
        if let Some(&bits) = self.ctx.store.pixi(item).and_then(|p| p.first()) {
            return Some(bits);
        }
        let (format, range) = self.ctx.store.codec_configuration(item)?;
        let config = self.ctx.raw.get(range)?;
        match &format.value {
            b"hvcC" => config.get(17).map(|b| (b & 7) + 8),
            b"av1C" => config.get(2).map(|b| match (b & 0x40 != 0, b & 0x20 != 0) {
                (true, true) => 12,
                (true, false) => 10,
                _ => 8,
            }),
            b"jpgC" => Some(8),
            _ => None,
        }
    }

    pub fn thumbnail_ids(&self) -> &[u32] {
        self.item().map_or(&[][..], |item| &item.thumbnails[..])
    }

    pub fn thumbnail_handle(&self, item_id: u32) -> Result<ImageHandle<'data>> {
        self.related(item_id, self.thumbnail_ids())
    }

    fn auxiliaries(&self) -> &[u32] {
        self.item().map_or(&[][..], |item| &item.auxiliaries[..])
    }

    pub fn depth_image_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.auxiliaries()
            .iter()
            .copied()
            .filter(move |&id| self.ctx.store.item(id).is_ok_and(|aux| self.ctx.store.is_depth(aux)))
    }

    pub fn has_depth_image(&self) -> bool {
        self.depth_image_ids().next().is_some()
    }

    pub fn depth_image_handle(&self, item_id: u32) -> Result<ImageHandle<'data>> {
        if !self.depth_image_ids().any(|id| id == item_id) {
            return Err(Error::Usage(SubError::NonexistingItem, "not a depth image of this image"));
        }
        Self::new(&self.ctx, item_id)
    }

    /// Auxiliary images in `iref` order, optionally leaving out alpha or depth.
    pub fn auxiliary_image_ids(&self, filter: AuxiliaryFilter) -> impl Iterator<Item = u32> + '_ {
        self.auxiliaries().iter().copied().filter(move |&id| {
            let Ok(aux) = self.ctx.store.item(id) else { return false };
            !(filter.omit_alpha && self.ctx.store.is_alpha(aux) || filter.omit_depth && self.ctx.store.is_depth(aux))
        })
    }

    /// The `auxC` type URN of this image, if it is an auxiliary image.
    pub fn auxiliary_type(&self) -> Option<&str> {
        self.item().ok().and_then(|item| self.ctx.store.auxiliary_type(item))
    }

    pub fn auxiliary_image_handle(&self, item_id: u32) -> Result<ImageHandle<'data>> {
        self.related(item_id, self.auxiliaries())
    }

    /// Metadata items describing this image. `filter` matches the item type, e.g. `"Exif"` or `"mime"`.
    pub fn metadata_block_ids<'a>(&'a self, filter: Option<&'a str>) -> impl Iterator<Item = u32> + 'a {
        let ids = self.item().map_or(&[][..], |item| &item.metadata[..]);
        ids.iter().copied().filter(move |&id| match filter {
            None => true,
            Some(kind) => self.ctx.store.item(id).is_ok_and(|m| m.item_type.value == kind.as_bytes()),
        })
    }

    fn metadata_item(&self, item_id: u32) -> Result<&Item> {
        let item = self.item()?;
        if !item.metadata.contains(&item_id) {
            return Err(Error::Usage(SubError::NonexistingItem, "not a metadata block of this image"));
        }
        self.ctx.store.item(item_id)
    }

    pub fn metadata_type(&self, item_id: u32) -> Result<FourCC> {
        Ok(self.metadata_item(item_id)?.item_type)
    }

    /// Content type of a `mime` block; empty for other types.
    pub fn metadata_content_type(&self, item_id: u32) -> Result<&str> {
        let item = self.metadata_item(item_id)?;
        std::str::from_utf8(&item.content_type)
            .map_err(|_| Error::InvalidData(SubError::Unspecified, "content type is not UTF-8"))
    }

    pub fn metadata_size(&self, item_id: u32) -> Result<usize> {
        Ok(self.metadata(item_id)?.len())
    }

    /// Block bytes exactly as stored. `Exif` blocks keep their leading offset; see [`exif_tiff_payload`].
    pub fn metadata(&self, item_id: u32) -> Result<Cow<'_, [u8]>> {
        self.metadata_item(item_id)?;
        self.ctx.store.item_data(&self.ctx.raw, item_id)
    }

    /// Copy a block into `out` and return the number of bytes written.
    pub fn copy_metadata(&self, item_id: u32, out: &mut [u8]) -> Result<usize> {
        let data = self.metadata(item_id)?;
        let dst = out
            .get_mut(..data.len())
            .ok_or(Error::Usage(SubError::InvalidParameter, "output buffer too small for metadata"))?;
        dst.copy_from_slice(&data);
        Ok(data.len())
    }

    /// ICC profiles win over NCLX when both are present.
    pub fn color_profile_type(&self) -> ColorProfileType {
        let Ok(item) = self.item() else { return ColorProfileType::NotPresent };
        if let Some((profile_type, _)) = self.ctx.store.icc(item) {
            profile_type
        } else if self.ctx.store.nclx(item).is_some() {
            ColorProfileType::Nclx
        } else {
            ColorProfileType::NotPresent
        }
    }

    pub fn raw_color_profile_size(&self) -> usize {
        self.raw_color_profile().map_or(0, <[u8]>::len)
    }

    /// ICC profile bytes.
    pub fn raw_color_profile(&self) -> Result<&[u8]> {
        let (_, range) = self
            .ctx
            .store
            .icc(self.item()?)
            .ok_or(Error::Usage(SubError::ColorProfileDoesNotExist, "image has no ICC profile"))?;
        self.ctx
            .raw
            .get(range)
            .ok_or(Error::InvalidData(SubError::InvalidColorProfile, "ICC profile out of bounds"))
    }

    /// The NCLX record, even when an ICC profile takes precedence.
    pub fn nclx_color_profile(&self) -> Result<NclxColorProfile> {
        self.ctx
            .store
            .nclx(self.item()?)
            .ok_or(Error::Usage(SubError::ColorProfileDoesNotExist, "image has no NCLX profile"))
    }

    /// Layout of a grid image, or `None` for other item types.
    pub fn grid(&self) -> Result<Option<ImageGrid>> {
        let item = self.item()?;
        if item.item_type != b"grid" {
            return Ok(None);
        }
        self.ctx.grid_of(item).map(Some)
    }

    /// Tile item ids of a grid image in row-major order.
    pub fn grid_tile_ids(&self) -> &[u32] {
        match self.item() {
            Ok(item) if item.item_type == b"grid" => &item.tiles[..],
            _ => &[][..],
        }
    }

    /// Decode one grid tile in the backend's native format, untransformed.
    ///
    /// Tiles can be decoded on several threads and pasted into a [`GridCanvas`] in any order.
    pub fn decode_tile(&self, registry: &DecoderRegistry, index: usize, options: &DecodingOptions) -> Result<DecodedImage> {
        let tile_id = *self
            .grid_tile_ids()
            .get(index)
            .ok_or(Error::Usage(SubError::InvalidParameter, "no grid tile with this index"))?;
        self.ctx.decode_tile_item(tile_id, registry, options)
    }

    /// Decode to `colorspace`/`chroma`. `Undefined` keeps the decoder's native layout.
    pub fn decode(
        &self,
        registry: &DecoderRegistry,
        colorspace: Colorspace,
        chroma: Chroma,
        options: &DecodingOptions,
    ) -> Result<DecodedImage> {
        self.decode_with_progress(registry, colorspace, chroma, options, &mut NoProgress)
    }

    /// Like [`decode`](Self::decode), reporting progress to `progress`.
    pub fn decode_with_progress(
        &self,
        registry: &DecoderRegistry,
        colorspace: Colorspace,
        chroma: Chroma,
        options: &DecodingOptions,
        progress: &mut dyn ProgressSink,
    ) -> Result<DecodedImage> {
        progress.start(ProgressStep::Total, 3);
        let result = self.decode_steps(registry, colorspace, chroma, options, progress);
        progress.end(ProgressStep::Total);
        result
    }

    fn decode_steps(
        &self,
        registry: &DecoderRegistry,
        colorspace: Colorspace,
        chroma: Chroma,
        options: &DecodingOptions,
        progress: &mut dyn ProgressSink,
    ) -> Result<DecodedImage> {
        if options.convert_hdr_to_8bit && chroma.is_interleaved_hdr() {
            return Err(Error::Usage(SubError::InvalidParameter, "16-bit interleaved output contradicts 8-bit reduction"));
        }
        let mut image = self.ctx.decode_item(self.item_id, registry, options, progress)?;
        self.attach_alpha(&mut image, registry, options)?;
        progress.progress(ProgressStep::Total, 1);

        let nclx = self.item().ok().and_then(|item| self.ctx.store.nclx(item)).unwrap_or_default();
        image = convert_colorspace(image, colorspace, chroma, &nclx, &options.color_conversion)?;
        progress.progress(ProgressStep::Total, 2);

        if !options.ignore_transformations {
            image = apply_transformations(image, &self.transforms)?;
        }
        if options.convert_hdr_to_8bit {
            image = reduce_to_8bit(image)?;
        }
        progress.progress(ProgressStep::Total, 3);
        Ok(image)
    }

    /// Move the luma plane of the alpha image into `image` as its alpha plane.
    fn attach_alpha(&self, image: &mut DecodedImage, registry: &DecoderRegistry, options: &DecodingOptions) -> Result<()> {
        let Some(alpha_id) = self.alpha_id() else { return Ok(()) };
        if image.has_channel(Channel::Alpha) || image.chroma().is_interleaved() {
            debug!("decoder output for item {} already carries alpha", self.item_id);
            return Ok(());
        }
        let mut alpha = match self.ctx.decode_item(alpha_id, registry, options, &mut NoProgress) {
            Ok(alpha) => alpha,
            Err(e) if options.lenient_decoding => {
                warn!("alpha image {alpha_id} failed: {e}");
                return image.push_warning(Warning::for_item(SubError::AlphaDecodeFailed, "alpha image failed to decode", alpha_id));
            },
            Err(e) => return Err(e),
        };
        let Some(mut plane) = alpha.take_plane(Channel::Y) else {
            return Err(Error::InvalidData(SubError::AlphaDecodeFailed, "alpha image has no luma plane"));
        };
        if (plane.width, plane.height) != (image.width(), image.height()) {
            if !options.lenient_decoding {
                return Err(Error::InvalidData(SubError::AlphaSizeMismatch, "alpha image size differs from the color image"));
            }
            return image.push_warning(Warning::for_item(
                SubError::AlphaSizeMismatch,
                "alpha image size differs from the color image",
                alpha_id,
            ));
        }
        plane.channel = Channel::Alpha;
        image.push_plane(plane)
    }
}

impl ContextInner<'_> {
    fn grid_of(&self, item: &Item) -> Result<ImageGrid> {
        let data = self.store.item_data(&self.raw, item.id)?;
        let grid = ImageGrid::parse(&data)?;
        if grid.tile_count() as usize != item.tiles.len() {
            return Err(Error::InvalidData(SubError::MissingGridImages, "grid tile count does not match dimg references"));
        }
        Ok(grid)
    }

    /// Decode an item in the backend's native format, stitching grids.
    fn decode_item(
        &self,
        item_id: u32,
        registry: &DecoderRegistry,
        options: &DecodingOptions,
        progress: &mut dyn ProgressSink,
    ) -> Result<DecodedImage> {
        let item = self.store.item(item_id)?;
        match &item.item_type.value {
            b"grid" => self.decode_grid(item, registry, options, progress),
            b"iden" | b"iovl" => Err(Error::Unsupported(SubError::UnsupportedImageType, "derived image type not supported")),
            _ => self.decode_coded(item, registry, options),
        }
    }

    fn decode_coded(&self, item: &Item, registry: &DecoderRegistry, options: &DecodingOptions) -> Result<DecodedImage> {
        let data = self.store.item_data(&self.raw, item.id)?;
        let configuration = self.store.codec_configuration(item).and_then(|(_, range)| self.raw.get(range));
        let coded = CodedItem { item_id: item.id, format: item.item_type, configuration, data: &data };
        registry.dispatch(&coded, options)
    }

    fn decode_tile_item(&self, tile_id: u32, registry: &DecoderRegistry, options: &DecodingOptions) -> Result<DecodedImage> {
        let tile = self.store.item(tile_id)?;
        if !tile.tiles.is_empty() || tile.item_type == b"grid" {
            return Err(Error::InvalidData(SubError::InvalidGridData, "grid tiles cannot be derived images"));
        }
        self.decode_coded(tile, registry, options)
    }

    fn decode_grid(
        &self,
        item: &Item,
        registry: &DecoderRegistry,
        options: &DecodingOptions,
        progress: &mut dyn ProgressSink,
    ) -> Result<DecodedImage> {
        let grid = self.grid_of(item)?;
        let tracker = ResourceTracker::new(&self.config);
        tracker.validate_grid_tiles(grid.tile_count())?;
        tracker.validate_total_megapixels(grid.output_width, grid.output_height)?;

        let mut canvas = GridCanvas::new(&grid)?;
        progress.start(ProgressStep::LoadTile, grid.tile_count());
        let pasted = self.paste_tiles(item, &mut canvas, registry, options, progress);
        progress.end(ProgressStep::LoadTile);
        match pasted? {
            (0, Some(first_error)) => Err(first_error),
            _ => canvas.finish(),
        }
    }

    /// Number of tiles placed and the first tile error, if any.
    fn paste_tiles(
        &self,
        item: &Item,
        canvas: &mut GridCanvas,
        registry: &DecoderRegistry,
        options: &DecodingOptions,
        progress: &mut dyn ProgressSink,
    ) -> Result<(usize, Option<Error>)> {
        let mut placed = 0;
        let mut first_error = None;
        for (index, &tile_id) in item.tiles.iter().enumerate() {
            match self.decode_tile_item(tile_id, registry, options) {
                Ok(tile) => {
                    canvas.paste_tile(index, &tile)?;
                    placed += 1;
                },
                Err(e) if options.lenient_decoding && e.category() != crate::ErrorCategory::Memory => {
                    warn!("grid tile {tile_id}: {e}");
                    canvas.mark_failed(index, tile_id)?;
                    first_error.get_or_insert(e);
                },
                Err(e) => return Err(e),
            }
            progress.progress(ProgressStep::LoadTile, (index + 1) as u32);
        }
        Ok((placed, first_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exif_offset_is_skipped() {
        let block = [0, 0, 0, 2, 0xaa, 0xbb, b'M', b'M', 0, 42];
        assert_eq!(exif_tiff_payload(&block).unwrap(), b"MM\0\x2a");
        assert!(exif_tiff_payload(&[0, 0, 0, 9, 1]).is_err());
        assert!(exif_tiff_payload(&[0, 0]).is_err());
    }

    #[test]
    fn context_is_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<HeifContext<'static>>();
        check::<ImageHandle<'static>>();
    }
}
