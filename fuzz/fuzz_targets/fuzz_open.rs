// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
#![no_main]

use libfuzzer_sys::fuzz_target;
use zenheif::{AuxiliaryFilter, HeifContext};

fuzz_target!(|data: &[u8]| {
    let _ = zenheif::check_filetype(data);
    let Ok(ctx) = HeifContext::from_bytes(data) else { return };
    for &id in ctx.top_level_image_ids() {
        let Ok(handle) = ctx.image_handle(id) else { continue };
        let _ = (handle.width(), handle.height(), handle.orientation(), handle.luma_bits_per_pixel());
        let _ = handle.grid();
        let _ = handle.nclx_color_profile();
        let _ = handle.raw_color_profile();
        for aux in handle.auxiliary_image_ids(AuxiliaryFilter::default()) {
            let _ = handle.auxiliary_image_handle(aux);
        }
        let blocks: Vec<u32> = handle.metadata_block_ids(None).collect();
        for block in blocks {
            if let Ok(size) = handle.metadata_size(block) {
                let mut out = vec![0; size];
                assert_eq!(handle.copy_metadata(block, &mut out).ok(), Some(size));
            }
        }
        if let Ok(properties) = ctx.transformation_properties(id) {
            for &p in properties.iter() {
                let _ = ctx.property_crop_borders(p, handle.ispe_width(), handle.ispe_height());
            }
        }
    }
});
