// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Items, properties and the references between them, resolved once per
//! container from `meta` and its children.

use crate::boxes::{BoxType, FourCC};
use crate::color::{read_colr, ColourInformation, NclxColorProfile};
use crate::transform::{read_clap, read_imir, read_irot, CleanAperture, MirrorDirection, PropertyType, Rotation, Transform};
use crate::tree::{BoxNode, BoxTree};
use crate::{
    be_u16, be_u32, is_image_brand, is_sequence_brand, read_cstr, read_fullbox_extra, read_fullbox_version_no_flags,
    usize_from_u64, Error, ErrorCategory, ParseOptions, ReadConfig, ResourceTracker, Result, SubError, ToUsize, TryString, TryVec,
    Warning,
};
use arrayvec::ArrayVec;
use bitreader::BitReader;
use byteorder::ReadBytesExt;
use log::{debug, warn};
use std::borrow::Cow;
use std::ops::{Range, RangeFrom};

/// Item types that carry an image.
const IMAGE_ITEM_TYPES: [&[u8; 4]; 10] =
    [b"hvc1", b"av01", b"avc1", b"jpeg", b"grid", b"iden", b"iovl", b"unci", b"j2k1", b"vvc1"];

pub(crate) const ALPHA_AUX_TYPES: [&str; 2] =
    ["urn:mpeg:mpegB:cicp:systems:auxiliary:alpha", "urn:mpeg:hevc:2015:auxid:1"];
pub(crate) const DEPTH_AUX_TYPES: [&str; 2] =
    ["urn:mpeg:mpegB:cicp:systems:auxiliary:depth", "urn:mpeg:hevc:2015:auxid:2"];

/// Potential sizes (in bytes) of variable-sized fields of the 'iloc' box
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug)]
enum IlocFieldSize {
    Zero,
    Four,
    Eight,
}

impl IlocFieldSize {
    const fn to_bits(&self) -> u8 {
        match self {
            Self::Zero => 0,
            Self::Four => 32,
            Self::Eight => 64,
        }
    }
}

impl TryFrom<u8> for IlocFieldSize {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            _ => Err(Error::InvalidData(SubError::InvalidIloc, "value must be in the set {0, 4, 8}")),
        }
    }
}

#[derive(PartialEq)]
enum IlocVersion {
    Zero,
    One,
    Two,
}

impl TryFrom<u8> for IlocVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            _ => Err(Error::Unsupported(SubError::UnsupportedDataVersion, "unsupported version in 'iloc' box")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ConstructionMethod {
    File,
    Idat,
    Item,
}

#[derive(Clone, Debug)]
pub(crate) enum ExtentRange {
    WithLength(Range<u64>),
    ToEnd(RangeFrom<u64>),
}

impl ExtentRange {
    const fn start(&self) -> u64 {
        match self {
            Self::WithLength(r) => r.start,
            Self::ToEnd(r) => r.start,
        }
    }
}

/// Used for 'iloc' boxes
/// `base_offset` is folded into the ranges in `extents`
#[derive(Debug)]
pub(crate) struct ItemLocation {
    item_id: u32,
    construction_method: ConstructionMethod,
    data_reference_index: u16,
    extents: TryVec<ExtentRange>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum ItemProperty {
    ImageSpatialExtents { width: u32, height: u32 },
    Rotation(Rotation),
    Mirror(MirrorDirection),
    CleanAperture(CleanAperture),
    Colour(ColourInformation),
    Channels(ArrayVec<u8, 16>),
    /// `auxC` payload: NUL-terminated URN, then optional subtype bytes
    AuxiliaryType(TryString),
    /// Payload of `hvcC`, `avcC`, `av1C` or `jpgC`
    CodecConfiguration { format: FourCC, data: Range<usize> },
    PixelAspectRatio { h_spacing: u32, v_spacing: u32 },
    Unknown { fourcc: FourCC, data: Range<usize> },
}

impl ItemProperty {
    pub fn property_type(&self) -> PropertyType {
        match self {
            Self::ImageSpatialExtents { .. } => PropertyType::ImageSpatialExtents,
            Self::Rotation(_) => PropertyType::TransformRotation,
            Self::Mirror(_) => PropertyType::TransformMirror,
            Self::CleanAperture(_) => PropertyType::TransformCrop,
            Self::Colour(_) => PropertyType::ColorProfile,
            Self::Channels(_) => PropertyType::PixelInformation,
            Self::AuxiliaryType(_) => PropertyType::AuxiliaryType,
            Self::CodecConfiguration { .. } => PropertyType::CodecConfiguration,
            Self::PixelAspectRatio { .. } => PropertyType::PixelAspectRatio,
            Self::Unknown { .. } => PropertyType::Other,
        }
    }

    fn transform(&self) -> Option<Transform> {
        match self {
            Self::Rotation(r) => Some(Transform::Rotate(*r)),
            Self::Mirror(m) => Some(Transform::Mirror(*m)),
            Self::CleanAperture(c) => Some(Transform::Crop(*c)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PropertyAssociation {
    /// 1-based position in `ipco`
    pub property_id: u32,
    #[allow(unused)]
    pub essential: bool,
}

#[derive(Debug)]
pub(crate) struct Item {
    pub id: u32,
    pub item_type: FourCC,
    pub hidden: bool,
    /// Only set for `mime` items
    pub content_type: TryString,
    pub location: Option<ItemLocation>,
    pub properties: TryVec<PropertyAssociation>,
    pub thumbnail_of: Option<u32>,
    pub auxiliary_of: Option<u32>,
    /// The grid or derived image this item is an input of
    pub derived_into: Option<u32>,
    pub premultiplied_with: Option<u32>,
    /// `dimg` targets in reference order
    pub tiles: TryVec<u32>,
    pub thumbnails: TryVec<u32>,
    pub auxiliaries: TryVec<u32>,
    pub metadata: TryVec<u32>,
}

impl Item {
    fn new(entry: ItemInfoEntry) -> Self {
        Self {
            id: entry.item_id,
            item_type: entry.item_type,
            hidden: entry.hidden,
            content_type: entry.content_type,
            location: None,
            properties: TryVec::new(),
            thumbnail_of: None,
            auxiliary_of: None,
            derived_into: None,
            premultiplied_with: None,
            tiles: TryVec::new(),
            thumbnails: TryVec::new(),
            auxiliaries: TryVec::new(),
            metadata: TryVec::new(),
        }
    }

    pub fn is_image(&self) -> bool {
        IMAGE_ITEM_TYPES.iter().any(|t| self.item_type == *t)
    }
}

struct ItemInfoEntry {
    item_id: u32,
    item_type: FourCC,
    hidden: bool,
    content_type: TryString,
}

struct ItemReference {
    kind: FourCC,
    from_item_id: u32,
    to_item_ids: TryVec<u32>,
}

struct Association {
    item_id: u32,
    essential: bool,
    property_index: u16,
}

/// Every item, property and relation of one container.
#[derive(Debug)]
pub(crate) struct ItemStore {
    /// Grown only through `try_reserve` in `link`.
    items: std::collections::HashMap<u32, Item>,
    /// `iinf` order
    order: TryVec<u32>,
    properties: TryVec<ItemProperty>,
    primary: Option<u32>,
    idat: Option<Range<usize>>,
    mdats: TryVec<Range<usize>>,
    top_level: TryVec<u32>,
}

/// The single child of `parent` of the given type, if any.
fn only_child(tree: &BoxTree, parent: usize, name: BoxType, duplicate: &'static str) -> Result<Option<usize>> {
    let mut found = tree.find_children(parent, name).map(|(i, _)| i);
    let first = found.next();
    if found.next().is_some() {
        return Err(Error::InvalidData(SubError::Unspecified, duplicate));
    }
    Ok(first)
}

fn payload<'a>(data: &'a [u8], node: &BoxNode) -> &'a [u8] {
    &data[node.payload.clone()]
}

impl ItemStore {
    pub fn parse(tree: &BoxTree, data: &[u8], config: &ReadConfig, warnings: &mut TryVec<Warning>) -> Result<Self> {
        let options = config.parse_options();
        let tracker = ResourceTracker::new(config);

        let (_, ftyp) = tree.roots().next().ok_or(Error::UnsupportedFiletype("empty file"))?;
        if ftyp.name != BoxType::FileTypeBox {
            return Err(Error::UnsupportedFiletype("ftyp box must come first"));
        }
        check_brands(payload(data, ftyp))?;

        let mut metas = tree.find_roots(BoxType::MetadataBox);
        let (meta, meta_node) = metas.next().ok_or(Error::InvalidData(SubError::NoMetaBox, "missing meta box"))?;
        if metas.next().is_some() {
            return Err(Error::InvalidData(SubError::Unspecified, "there should be zero or one meta boxes"));
        }
        let mut meta_src = payload(data, meta_node);
        if read_fullbox_version_no_flags(&mut meta_src, &options)? != 0 {
            return Err(Error::Unsupported(SubError::UnsupportedDataVersion, "unsupported meta version"));
        }

        let hdlr = only_child(tree, meta, BoxType::HandlerBox, "there should be zero or one hdlr boxes")?
            .ok_or(Error::InvalidData(SubError::NoHdlrBox, "missing hdlr box"))?;
        let handler_type = read_hdlr(payload(data, tree.node(hdlr)), &options)?;
        if handler_type != b"pict" {
            return Err(Error::InvalidData(SubError::NoPictHandler, "meta handler type must be 'pict'"));
        }

        let primary = match only_child(tree, meta, BoxType::PrimaryItemBox, "there should be zero or one pitm boxes")? {
            Some(pitm) => Some(read_pitm(payload(data, tree.node(pitm)), &options)?),
            None => None,
        };

        let iinf = only_child(tree, meta, BoxType::ItemInfoBox, "there should be zero or one iinf boxes")?
            .ok_or(Error::InvalidData(SubError::NoIinfBox, "missing iinf box"))?;
        let entries = read_iinf(tree, iinf, data, &options, &tracker, warnings)?;

        let iloc = only_child(tree, meta, BoxType::ItemLocationBox, "there should be zero or one iloc boxes")?
            .ok_or(Error::InvalidData(SubError::NoIlocBox, "missing iloc box"))?;
        let locations = read_iloc(payload(data, tree.node(iloc)), &options, warnings)?;

        let references = match only_child(tree, meta, BoxType::ImageReferenceBox, "there should be zero or one iref boxes")? {
            Some(iref) => read_iref(tree, iref, data, &options, warnings)?,
            None => TryVec::new(),
        };

        let (properties, associations) =
            match only_child(tree, meta, BoxType::ImagePropertiesBox, "there should be zero or one iprp boxes")? {
                Some(iprp) => read_iprp(tree, iprp, data, &options, warnings)?,
                None => (TryVec::new(), TryVec::new()),
            };

        let idat = only_child(tree, meta, BoxType::ItemDataBox, "there should be zero or one idat boxes")?
            .map(|i| tree.node(i).payload.clone());

        let mut mdats = TryVec::new();
        for (_, node) in tree.find_roots(BoxType::MediaDataBox) {
            mdats.push(node.payload.clone())?;
        }

        let mut store = Self {
            items: std::collections::HashMap::new(),
            order: TryVec::new(),
            properties,
            primary,
            idat,
            mdats,
            top_level: TryVec::new(),
        };
        store.link(entries, locations, associations, references, &options, warnings)?;
        debug!(
            "{} items, {} properties, {} top-level images",
            store.order.len(),
            store.properties.len(),
            store.top_level.len()
        );
        Ok(store)
    }

    fn link(
        &mut self,
        entries: TryVec<ItemInfoEntry>,
        locations: TryVec<ItemLocation>,
        associations: TryVec<Association>,
        references: TryVec<ItemReference>,
        options: &ParseOptions,
        warnings: &mut TryVec<Warning>,
    ) -> Result<()> {
        self.items.try_reserve(entries.len()).map_err(|_| Error::OutOfMemory)?;
        for entry in entries {
            let id = entry.item_id;
            if self.items.contains_key(&id) {
                return Err(Error::InvalidData(SubError::DuplicateItemId, "duplicate item id in iinf"));
            }
            self.items.insert(id, Item::new(entry));
            self.order.push(id)?;
        }

        for location in locations {
            let id = location.item_id;
            match self.items.get_mut(&id) {
                Some(item) if item.location.is_none() => item.location = Some(location),
                Some(_) => options.recover(warnings, Warning::for_item(SubError::InvalidIloc, "duplicate iloc entry", id))?,
                None => options.recover(
                    warnings,
                    Warning::for_item(SubError::NonexistingItemReferenced, "iloc entry for a missing item", id),
                )?,
            }
        }

        for a in associations {
            let index = match a.property_index {
                0 => continue,
                x => x,
            };
            if usize::from(index) > self.properties.len() {
                options.recover(
                    warnings,
                    Warning::for_item(SubError::InvalidPropertyIndex, "ipma references a missing property", a.item_id),
                )?;
                continue;
            }
            match self.items.get_mut(&a.item_id) {
                Some(item) => item.properties.push(PropertyAssociation {
                    property_id: u32::from(index),
                    essential: a.essential,
                })?,
                None => options.recover(
                    warnings,
                    Warning::for_item(SubError::NonexistingItemReferenced, "ipma entry for a missing item", a.item_id),
                )?,
            }
        }

        for r in references {
            self.link_reference(r, options, warnings)?;
        }

        for &id in self.order.iter() {
            let Some(item) = self.items.get(&id) else { continue };
            let top_level = item.is_image()
                && !item.hidden
                && item.thumbnail_of.is_none()
                && item.auxiliary_of.is_none()
                && item.derived_into.is_none();
            if top_level || (Some(id) == self.primary && item.is_image()) {
                self.top_level.push(id)?;
            }
        }
        Ok(())
    }

    fn link_reference(&mut self, r: ItemReference, options: &ParseOptions, warnings: &mut TryVec<Warning>) -> Result<()> {
        let from = r.from_item_id;
        if !self.items.contains_key(&from) {
            return options.recover(
                warnings,
                Warning::for_item(SubError::NonexistingItemReferenced, "iref from a missing item", from),
            );
        }
        for &to in r.to_item_ids.iter() {
            if !self.items.contains_key(&to) {
                options.recover(warnings, Warning::for_item(SubError::NonexistingItemReferenced, "iref to a missing item", to))?;
                continue;
            }
            match &r.kind.value {
                b"thmb" => {
                    if let Some(item) = self.items.get_mut(&from) {
                        item.thumbnail_of.get_or_insert(to);
                    }
                    if let Some(master) = self.items.get_mut(&to) {
                        master.thumbnails.push(from)?;
                    }
                },
                b"auxl" => {
                    if let Some(item) = self.items.get_mut(&from) {
                        item.auxiliary_of.get_or_insert(to);
                    }
                    if let Some(master) = self.items.get_mut(&to) {
                        master.auxiliaries.push(from)?;
                    }
                },
                b"dimg" => {
                    if let Some(item) = self.items.get_mut(&from) {
                        item.tiles.push(to)?;
                    }
                    if let Some(tile) = self.items.get_mut(&to) {
                        tile.derived_into.get_or_insert(from);
                    }
                },
                b"cdsc" => {
                    if let Some(described) = self.items.get_mut(&to) {
                        described.metadata.push(from)?;
                    }
                },
                b"prem" => {
                    if let Some(item) = self.items.get_mut(&from) {
                        item.premultiplied_with.get_or_insert(to);
                    }
                },
                _ => debug!("ignoring {} reference from item {from}", r.kind),
            }
        }
        Ok(())
    }

    pub fn item(&self, id: u32) -> Result<&Item> {
        self.items.get(&id).ok_or(Error::Usage(SubError::NonexistingItem, "no item with this id"))
    }

    pub fn top_level_ids(&self) -> &[u32] {
        &self.top_level
    }

    pub fn primary_id(&self) -> Result<u32> {
        match self.primary {
            Some(id) if self.items.get(&id).is_some_and(Item::is_image) => Ok(id),
            _ => Err(Error::InvalidData(SubError::NoOrInvalidPrimaryItem, "no or invalid primary item")),
        }
    }

    pub fn property(&self, property_id: u32) -> Result<&ItemProperty> {
        property_id
            .checked_sub(1)
            .and_then(|i| self.properties.get(i.to_usize()))
            .ok_or(Error::Usage(SubError::NonexistingProperty, "no property with this id"))
    }

    /// Associated properties in `ipma` order.
    pub fn properties_of<'a>(&'a self, item: &'a Item) -> impl Iterator<Item = (u32, &'a ItemProperty)> + 'a {
        item.properties
            .iter()
            .filter_map(move |a| self.property(a.property_id).ok().map(|p| (a.property_id, p)))
    }

    /// Ids of the rotation, mirror and crop properties, in association order.
    pub fn transformation_property_ids(&self, item_id: u32) -> Result<TryVec<u32>> {
        let item = self.item(item_id)?;
        let mut ids = TryVec::new();
        let mut seen: ArrayVec<PropertyType, 3> = ArrayVec::new();
        for (id, property) in self.properties_of(item) {
            if let Some(t) = property.transform() {
                if seen.contains(&t.kind()) {
                    return Err(Error::InvalidData(
                        SubError::AmbiguousTransformation,
                        "transformation kind declared more than once",
                    ));
                }
                seen.push(t.kind());
                ids.push(id)?;
            }
        }
        Ok(ids)
    }

    pub fn transformations(&self, item_id: u32) -> Result<TryVec<Transform>> {
        let mut out = TryVec::new();
        for id in self.transformation_property_ids(item_id)? {
            if let Some(t) = self.property(id)?.transform() {
                out.push(t)?;
            }
        }
        Ok(out)
    }

    pub fn ispe(&self, item: &Item) -> Option<(u32, u32)> {
        self.properties_of(item).find_map(|(_, p)| match p {
            ItemProperty::ImageSpatialExtents { width, height } => Some((*width, *height)),
            _ => None,
        })
    }

    pub fn nclx(&self, item: &Item) -> Option<NclxColorProfile> {
        self.properties_of(item).find_map(|(_, p)| match p {
            ItemProperty::Colour(ColourInformation::Nclx(nclx)) => Some(*nclx),
            _ => None,
        })
    }

    pub fn icc(&self, item: &Item) -> Option<(crate::ColorProfileType, Range<usize>)> {
        self.properties_of(item).find_map(|(_, p)| match p {
            ItemProperty::Colour(ColourInformation::Icc { profile_type, data }) => Some((*profile_type, data.clone())),
            _ => None,
        })
    }

    pub fn pixi<'a>(&'a self, item: &'a Item) -> Option<&'a [u8]> {
        self.properties_of(item).find_map(|(_, p)| match p {
            ItemProperty::Channels(c) => Some(&c[..]),
            _ => None,
        })
    }

    pub fn codec_configuration(&self, item: &Item) -> Option<(FourCC, Range<usize>)> {
        self.properties_of(item).find_map(|(_, p)| match p {
            ItemProperty::CodecConfiguration { format, data } => Some((*format, data.clone())),
            _ => None,
        })
    }

    /// URN of the `auxC` property, without the subtype bytes.
    pub fn auxiliary_type<'a>(&'a self, item: &'a Item) -> Option<&'a str> {
        self.properties_of(item).find_map(|(_, p)| match p {
            ItemProperty::AuxiliaryType(data) => {
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                std::str::from_utf8(&data[..end]).ok()
            },
            _ => None,
        })
    }

    pub fn is_alpha(&self, item: &Item) -> bool {
        self.auxiliary_type(item).is_some_and(|t| ALPHA_AUX_TYPES.contains(&t))
    }

    pub fn is_depth(&self, item: &Item) -> bool {
        self.auxiliary_type(item).is_some_and(|t| DEPTH_AUX_TYPES.contains(&t))
    }

    /// Item payload, borrowed when it is a single extent.
    pub fn item_data<'a>(&self, raw: &'a [u8], item_id: u32) -> Result<Cow<'a, [u8]>> {
        let item = self.item(item_id)?;
        let location = item
            .location
            .as_ref()
            .ok_or(Error::InvalidData(SubError::InvalidIloc, "item has no iloc entry"))?;
        if location.data_reference_index != 0 {
            return Err(Error::Unsupported(
                SubError::UnsupportedConstructionMethod,
                "external file references (iloc.data_reference_index != 0) are not supported",
            ));
        }
        let source: Range<usize> = match location.construction_method {
            ConstructionMethod::File => 0..raw.len(),
            ConstructionMethod::Idat => self
                .idat
                .clone()
                .ok_or(Error::InvalidData(SubError::NoIdatBox, "idat box missing but construction_method is Idat"))?,
            ConstructionMethod::Item => {
                return Err(Error::Unsupported(
                    SubError::UnsupportedConstructionMethod,
                    "construction_method 'item_offset' is not supported",
                ));
            },
        };

        let method = location.construction_method;
        if let [extent] = &location.extents[..] {
            let range = self.extent_range(extent, &source, method)?;
            return Ok(Cow::Borrowed(&raw[range]));
        }
        let mut owned = TryVec::new();
        for extent in location.extents.iter() {
            let range = self.extent_range(extent, &source, method)?;
            owned.extend_from_slice(&raw[range])?;
        }
        Ok(Cow::Owned(owned.to_vec()))
    }

    /// Absolute byte range of one extent, checked against its source.
    fn extent_range(&self, extent: &ExtentRange, source: &Range<usize>, method: ConstructionMethod) -> Result<Range<usize>> {
        let offset = usize_from_u64(extent.start())?;
        let start = match method {
            ConstructionMethod::Idat => source.start.checked_add(offset),
            _ => Some(offset),
        }
        .ok_or(Error::InvalidData(SubError::InvalidIloc, "extent offset overflow"))?;
        let end = match extent {
            ExtentRange::WithLength(range) => {
                let len = usize_from_u64(range.end - range.start)?;
                start.checked_add(len).ok_or(Error::InvalidData(SubError::InvalidIloc, "extent end overflow"))?
            },
            ExtentRange::ToEnd(_) => match method {
                ConstructionMethod::Idat => source.end,
                // the mdat that holds the extent, or the rest of the file
                _ => self
                    .mdats
                    .iter()
                    .find(|m| m.contains(&start))
                    .map_or(source.end, |m| m.end),
            },
        };
        if start > end || end > source.end {
            return Err(Error::InvalidData(SubError::InvalidIloc, "extent out of bounds"));
        }
        Ok(start..end)
    }
}

fn check_brands(mut src: &[u8]) -> Result<()> {
    let major = FourCC::from(be_u32(&mut src)?);
    let _minor = be_u32(&mut src)?;
    let mut heif = is_image_brand(&major) || is_sequence_brand(&major);
    for brand in src.chunks_exact(4) {
        let brand = FourCC::from([brand[0], brand[1], brand[2], brand[3]]);
        heif |= is_image_brand(&brand) || is_sequence_brand(&brand);
    }
    if !heif {
        return Err(Error::UnsupportedFiletype("no HEIF brand in ftyp"));
    }
    debug!("ftyp major brand {major}");
    Ok(())
}

/// Parse a Handler Reference Box
/// See ISO 14496-12:2015 § 8.4.3
fn read_hdlr(mut src: &[u8], options: &ParseOptions) -> Result<FourCC> {
    let _version = read_fullbox_version_no_flags(&mut src, options)?;
    let _pre_defined = be_u32(&mut src)?;
    Ok(FourCC::from(be_u32(&mut src)?))
}

/// Parse a Primary Item Box
/// See ISO 14496-12:2015 § 8.11.4
fn read_pitm(mut src: &[u8], options: &ParseOptions) -> Result<u32> {
    let version = read_fullbox_version_no_flags(&mut src, options)?;

    let item_id = match version {
        0 => be_u16(&mut src)?.into(),
        1 => be_u32(&mut src)?,
        _ => return Err(Error::Unsupported(SubError::UnsupportedDataVersion, "unsupported pitm version")),
    };

    Ok(item_id)
}

/// Parse an Item Information Box
/// See ISO 14496-12:2015 § 8.11.6
fn read_iinf(
    tree: &BoxTree,
    iinf: usize,
    data: &[u8],
    options: &ParseOptions,
    tracker: &ResourceTracker<'_>,
    warnings: &mut TryVec<Warning>,
) -> Result<TryVec<ItemInfoEntry>> {
    let mut src = payload(data, tree.node(iinf));
    let version = read_fullbox_version_no_flags(&mut src, options)?;
    let entry_count = match version {
        0 => u32::from(be_u16(&mut src)?),
        1 => be_u32(&mut src)?,
        _ => return Err(Error::Unsupported(SubError::UnsupportedDataVersion, "unsupported iinf version")),
    };
    tracker.validate_item_count(entry_count)?;

    let mut item_infos = TryVec::with_capacity(entry_count.to_usize())?;
    for (_, b) in tree.children(iinf) {
        if b.name != BoxType::ItemInfoEntry {
            options.recover(warnings, Warning::new(SubError::Unspecified, "iinf box should contain only infe boxes"))?;
            continue;
        }
        if let Some(entry) = read_infe(payload(data, b))? {
            item_infos.push(entry)?;
        }
    }
    tracker.validate_item_count(item_infos.len() as u32)?;
    Ok(item_infos)
}

/// Parse an Item Info Entry
/// See ISO 14496-12:2015 § 8.11.6.2
fn read_infe(mut src: &[u8]) -> Result<Option<ItemInfoEntry>> {
    let (version, flags) = read_fullbox_extra(&mut src)?;

    // mif1 brand (see ISO 23008-12:2017 § 10.2.1) only requires v2 and 3
    let item_id = match version {
        2 => be_u16(&mut src)?.into(),
        3 => be_u32(&mut src)?,
        _ => {
            debug!("skipping infe version {version}");
            return Ok(None);
        },
    };

    let item_protection_index = be_u16(&mut src)?;
    if item_protection_index != 0 {
        return Err(Error::Unsupported(
            SubError::Unspecified,
            "protected items (infe.item_protection_index != 0) are not supported",
        ));
    }

    let item_type = FourCC::from(be_u32(&mut src)?);
    let name = read_cstr(&mut src)?;
    let content_type = if item_type == b"mime" { read_cstr(&mut src)? } else { TryVec::new() };
    debug!("infe item_id {item_id} item_type: {item_type} name: {:?}", String::from_utf8_lossy(&name));

    Ok(Some(ItemInfoEntry { item_id, item_type, hidden: flags & 1 != 0, content_type }))
}

/// Parse an item location box inside a meta box
/// See ISO 14496-12:2015 § 8.11.3
fn read_iloc(mut src: &[u8], options: &ParseOptions, warnings: &mut TryVec<Warning>) -> Result<TryVec<ItemLocation>> {
    let version: IlocVersion = read_fullbox_version_no_flags(&mut src, options)?.try_into()?;
    let mut iloc = BitReader::new(src);

    let offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let length_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let base_offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;

    let index_size: Option<IlocFieldSize> = match version {
        IlocVersion::One | IlocVersion::Two => Some(iloc.read_u8(4)?.try_into()?),
        IlocVersion::Zero => {
            let _reserved = iloc.read_u8(4)?;
            None
        },
    };

    let item_count = match version {
        IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
        IlocVersion::Two => iloc.read_u32(32)?,
    };

    let mut items = TryVec::with_capacity(item_count.to_usize().min(src.len()))?;

    for _ in 0..item_count {
        let item_id = match version {
            IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
            IlocVersion::Two => iloc.read_u32(32)?,
        };

        // version 0 has no construction_method field and always means file offsets
        let construction_method = match version {
            IlocVersion::Zero => ConstructionMethod::File,
            IlocVersion::One | IlocVersion::Two => {
                let _reserved = iloc.read_u16(12)?;
                match iloc.read_u16(4)? {
                    0 => ConstructionMethod::File,
                    1 => ConstructionMethod::Idat,
                    2 => ConstructionMethod::Item,
                    _ => {
                        return Err(Error::InvalidData(
                            SubError::InvalidIloc,
                            "construction_method is taken from the set 0, 1 or 2 per ISO 14496-12:2015 § 8.11.3.3",
                        ));
                    },
                }
            },
        };

        let data_reference_index = iloc.read_u16(16)?;
        let base_offset = iloc.read_u64(base_offset_size.to_bits())?;
        let extent_count = iloc.read_u16(16)?;

        if extent_count < 1 {
            return Err(Error::InvalidData(
                SubError::InvalidIloc,
                "extent_count must have a value 1 or greater per ISO 14496-12:2015 § 8.11.3.3",
            ));
        }

        let mut extents = TryVec::with_capacity(extent_count.to_usize())?;

        for _ in 0..extent_count {
            // only used by construction method 2
            let _extent_index = match &index_size {
                None | Some(IlocFieldSize::Zero) => None,
                Some(index_size) => Some(iloc.read_u64(index_size.to_bits())?),
            };

            // A zero-width offset field reads as 0, which is the implied start.
            let extent_offset = iloc.read_u64(offset_size.to_bits())?;
            let extent_length = iloc.read_u64(length_size.to_bits())?;

            // a length of zero covers the rest of the source
            let start = base_offset
                .checked_add(extent_offset)
                .ok_or(Error::InvalidData(SubError::InvalidIloc, "offset calculation overflow"))?;
            let extent_range = if extent_length == 0 {
                ExtentRange::ToEnd(RangeFrom { start })
            } else {
                let end = start
                    .checked_add(extent_length)
                    .ok_or(Error::InvalidData(SubError::InvalidIloc, "end calculation overflow"))?;
                ExtentRange::WithLength(Range { start, end })
            };

            extents.push(extent_range)?;
        }

        items.push(ItemLocation { item_id, construction_method, data_reference_index, extents })?;
    }

    if iloc.remaining() != 0 {
        options.recover(warnings, Warning::new(SubError::InvalidIloc, "invalid iloc size"))?;
    }
    Ok(items)
}

fn read_iref(
    tree: &BoxTree,
    iref: usize,
    data: &[u8],
    options: &ParseOptions,
    warnings: &mut TryVec<Warning>,
) -> Result<TryVec<ItemReference>> {
    let mut item_references = TryVec::new();
    let version = read_fullbox_version_no_flags(&mut payload(data, tree.node(iref)), options)?;
    if version > 1 {
        return Err(Error::Unsupported(SubError::UnsupportedDataVersion, "iref version"));
    }

    for (_, b) in tree.children(iref) {
        let mut src = payload(data, b);
        let from_item_id = if version == 0 { be_u16(&mut src)?.into() } else { be_u32(&mut src)? };
        let reference_count = be_u16(&mut src)?;
        let mut to_item_ids = TryVec::with_capacity(usize::from(reference_count))?;
        for _ in 0..reference_count {
            let to_item_id = if version == 0 { be_u16(&mut src)?.into() } else { be_u32(&mut src)? };
            if from_item_id == to_item_id {
                options.recover(
                    warnings,
                    Warning::for_item(SubError::NonexistingItemReferenced, "item references itself", from_item_id),
                )?;
                continue;
            }
            to_item_ids.push(to_item_id)?;
        }
        item_references.push(ItemReference { kind: b.fourcc(), from_item_id, to_item_ids })?;
    }
    Ok(item_references)
}

fn read_iprp(
    tree: &BoxTree,
    iprp: usize,
    data: &[u8],
    options: &ParseOptions,
    warnings: &mut TryVec<Warning>,
) -> Result<(TryVec<ItemProperty>, TryVec<Association>)> {
    let mut properties = TryVec::new();
    let mut associations = TryVec::new();

    for (index, b) in tree.children(iprp) {
        match b.name {
            BoxType::ItemPropertyContainerBox => {
                properties = read_ipco(tree, index, data, options, warnings)?;
            },
            BoxType::ItemPropertyAssociationBox => {
                let mut more = read_ipma(payload(data, b))?;
                associations.append(&mut more)?;
            },
            _ => debug!("skipping {:?} in iprp", b.name),
        }
    }
    Ok((properties, associations))
}

fn read_ipma(mut src: &[u8]) -> Result<TryVec<Association>> {
    let (version, flags) = read_fullbox_extra(&mut src)?;

    let mut associations = TryVec::new();

    let entry_count = be_u32(&mut src)?;
    for _ in 0..entry_count {
        let item_id = if version == 0 { be_u16(&mut src)?.into() } else { be_u32(&mut src)? };
        let association_count = src.read_u8()?;
        for _ in 0..association_count {
            let num_association_bytes = if flags & 1 == 1 { 2 } else { 1 };
            let association = src
                .get(..num_association_bytes)
                .ok_or(Error::UnexpectedEOF)?;
            src = &src[num_association_bytes..];
            let mut association = BitReader::new(association);
            let essential = association.read_bool()?;
            let property_index = association.read_u16(association.remaining().try_into()?)?;
            associations.push(Association { item_id, essential, property_index })?;
        }
    }
    Ok(associations)
}

fn read_ipco(
    tree: &BoxTree,
    ipco: usize,
    data: &[u8],
    options: &ParseOptions,
    warnings: &mut TryVec<Warning>,
) -> Result<TryVec<ItemProperty>> {
    let mut properties = TryVec::new();
    for (_, b) in tree.children(ipco) {
        // every child takes an index, parsed or not
        let prop = match read_property(b, data, options, warnings) {
            Ok(prop) => prop,
            Err(e) if options.lenient && matches!(e.category(), ErrorCategory::Input | ErrorCategory::Unsupported) => {
                warn!("malformed {:?} property: {e}", b.name);
                warnings.push(Warning::new(e.suberror(), "malformed property ignored"))?;
                ItemProperty::Unknown { fourcc: b.fourcc(), data: b.payload.clone() }
            },
            Err(e) => return Err(e),
        };
        properties.push(prop)?;
    }
    Ok(properties)
}

fn read_property(b: &BoxNode, data: &[u8], options: &ParseOptions, warnings: &mut TryVec<Warning>) -> Result<ItemProperty> {
    let mut src = payload(data, b);
    Ok(match b.name {
        BoxType::ImageSpatialExtentsBox => {
            let _version = read_fullbox_version_no_flags(&mut src, options)?;
            let width = be_u32(&mut src)?;
            let height = be_u32(&mut src)?;
            if width == 0 || height == 0 {
                return Err(Error::InvalidData(SubError::InvalidImageSize, "ispe dimensions cannot be zero"));
            }
            ItemProperty::ImageSpatialExtents { width, height }
        },
        BoxType::ImageRotation => ItemProperty::Rotation(read_irot(src, options, warnings)?),
        BoxType::ImageMirror => ItemProperty::Mirror(read_imir(src, options, warnings)?),
        BoxType::CleanApertureBox => ItemProperty::CleanAperture(read_clap(src)?),
        BoxType::ColourInformationBox => match read_colr(src, b.payload.start)? {
            Some(colour) => ItemProperty::Colour(colour),
            None => ItemProperty::Unknown { fourcc: b.fourcc(), data: b.payload.clone() },
        },
        BoxType::PixelInformationBox => ItemProperty::Channels(read_pixi(src, options)?),
        BoxType::AuxiliaryTypeProperty => {
            let version = read_fullbox_version_no_flags(&mut src, options)?;
            if version != 0 {
                return Err(Error::Unsupported(SubError::UnsupportedDataVersion, "auxC version"));
            }
            let mut aux_data = TryVec::new();
            aux_data.extend_from_slice(src)?;
            ItemProperty::AuxiliaryType(aux_data)
        },
        BoxType::HevcConfigurationBox
        | BoxType::AvcConfigurationBox
        | BoxType::AV1CodecConfigurationBox
        | BoxType::JpegConfigurationBox => {
            ItemProperty::CodecConfiguration { format: b.fourcc(), data: b.payload.clone() }
        },
        BoxType::PixelAspectRatioBox => {
            ItemProperty::PixelAspectRatio { h_spacing: be_u32(&mut src)?, v_spacing: be_u32(&mut src)? }
        },
        _ => ItemProperty::Unknown { fourcc: b.fourcc(), data: b.payload.clone() },
    })
}

fn read_pixi(mut src: &[u8], options: &ParseOptions) -> Result<ArrayVec<u8, 16>> {
    let version = read_fullbox_version_no_flags(&mut src, options)?;
    if version != 0 {
        return Err(Error::Unsupported(SubError::UnsupportedDataVersion, "pixi version"));
    }

    let num_channels = usize::from(src.read_u8()?);
    let bits = src
        .get(..num_channels)
        .ok_or(Error::InvalidData(SubError::EndOfData, "invalid num_channels"))?;
    let mut channels = ArrayVec::new();
    channels
        .try_extend_from_slice(bits)
        .map_err(|_| Error::InvalidData(SubError::Unspecified, "too many pixi channels"))?;

    // extra bytes after the channel list are tolerated in lenient mode only
    if src.len() > num_channels && !options.lenient {
        return Err(Error::InvalidData(SubError::Unspecified, "trailing bytes in pixi"));
    }
    Ok(channels)
}
