//! Dominant color extraction
//!
//! Downscales a decoded image and buckets its pixels into a coarse RGB
//! histogram; buckets are scored by frequency weighted with saturation and
//! brightness so a vivid subject wins over a large washed-out background.
//! The winning bucket's average color is packed as 0x00RRGGBB for the
//! catalog. A pure-black result is nudged to 0x010101 so that 0 keeps
//! meaning "not computed".

use crate::types::pack_rgb;
use image::DynamicImage;

/// Edge length of the sampling grid
const SAMPLE_SIZE: u32 = 32;

/// Bits kept per channel when bucketing
const BUCKET_BITS: u32 = 4;

struct Bucket {
    count: u64,
    r_sum: u64,
    g_sum: u64,
    b_sum: u64,
}

/// Compute the prominent color of an image, packed as 0x00RRGGBB
pub fn prominent_color(image: &DynamicImage) -> u32 {
    let small = image.thumbnail(SAMPLE_SIZE, SAMPLE_SIZE).to_rgb8();

    let shift = 8 - BUCKET_BITS;
    let buckets_per_channel = 1usize << BUCKET_BITS;
    let mut buckets: Vec<Option<Bucket>> =
        (0..buckets_per_channel.pow(3)).map(|_| None).collect();

    for pixel in small.pixels() {
        let [r, g, b] = pixel.0;
        let idx = (((r >> shift) as usize) << (2 * BUCKET_BITS))
            | (((g >> shift) as usize) << BUCKET_BITS)
            | ((b >> shift) as usize);
        let bucket = buckets[idx].get_or_insert(Bucket {
            count: 0,
            r_sum: 0,
            g_sum: 0,
            b_sum: 0,
        });
        bucket.count += 1;
        bucket.r_sum += r as u64;
        bucket.g_sum += g as u64;
        bucket.b_sum += b as u64;
    }

    let mut best_score = -1.0f64;
    let mut best = (0u8, 0u8, 0u8);
    for bucket in buckets.iter().flatten() {
        let r = (bucket.r_sum / bucket.count) as u8;
        let g = (bucket.g_sum / bucket.count) as u8;
        let b = (bucket.b_sum / bucket.count) as u8;
        let score = bucket.count as f64 * (0.25 + saturation(r, g, b)) * (0.25 + value(r, g, b));
        if score > best_score {
            best_score = score;
            best = (r, g, b);
        }
    }

    let packed = pack_rgb(best.0, best.1, best.2);
    if packed == 0 {
        pack_rgb(1, 1, 1)
    } else {
        packed
    }
}

fn saturation(r: u8, g: u8, b: u8) -> f64 {
    let max = r.max(g).max(b) as f64;
    let min = r.min(g).min(b) as f64;
    if max == 0.0 {
        return 0.0;
    }
    (max - min) / max
}

fn value(r: u8, g: u8, b: u8) -> f64 {
    r.max(g).max(b) as f64 / 255.0
}
