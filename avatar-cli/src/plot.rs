//! Side-view (X/Y) plot of point traces, one colour per trace.

use glam::Vec3;
use image::{Rgb, RgbImage};

const PALETTE: [[u8; 3]; 6] = [[220, 50, 47], [38, 139, 210], [133, 153, 0], [211, 54, 130], [181, 137, 0], [42, 161, 152]];
const MARGIN: f32 = 16.0;

pub fn side_view(traces: &[Vec<Vec3>], width: u32, height: u32) -> RgbImage {
    let mut img = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    let points = traces.iter().flatten().filter(|p| p.is_finite());
    let (min, max) = points.fold((Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)), |(lo, hi), p| (lo.min(*p), hi.max(*p)));
    if min.x > max.x {
        return img;
    }

    // uniform scale so X and Y keep their proportions
    let span = (max.x - min.x).max(max.y - min.y).max(1e-3);
    let scale = ((width.min(height) as f32) - 2.0 * MARGIN) / span;
    let to_pixel = |p: Vec3| {
        let x = MARGIN + (p.x - min.x) * scale;
        let y = height as f32 - MARGIN - (p.y - min.y) * scale;
        (x as i64, y as i64)
    };

    for (i, trace) in traces.iter().enumerate() {
        let colour = Rgb(PALETTE[i % PALETTE.len()]);
        for p in trace.iter().filter(|p| p.is_finite()) {
            let (cx, cy) = to_pixel(*p);
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let (x, y) = (cx + dx, cy + dy);
                    if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
                        img.put_pixel(x as u32, y as u32, colour);
                    }
                }
            }
        }
    }
    img
}
