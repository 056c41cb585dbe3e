// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
#![no_main]

use libfuzzer_sys::fuzz_target;
use zenheif::{HeifContext, ReadConfig};

fuzz_target!(|data: &[u8]| {
    let config = ReadConfig::default()
        .lenient(true)
        .with_max_items(256)
        .with_max_grid_tiles(64)
        .with_total_megapixels_limit(16);
    let Ok(ctx) = HeifContext::from_bytes_with_config(data, &config, &enough::Unstoppable) else { return };
    let _ = ctx.warnings().len();
    if let Ok(handle) = ctx.primary_image_handle() {
        let _ = handle.thumbnail_ids().len();
        let _ = handle.depth_image_ids().count();
        let _ = handle.color_profile_type();
    }
});
