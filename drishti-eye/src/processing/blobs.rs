//! Zone rasterization and connected-component extraction.

use super::background::ForegroundMask;
use drishti_core::{Blob, PixelBox, Zone};

/// Pixels of one frame geometry that fall inside a zone polygon.
///
/// Built once per zone and frame size and reused until either changes.
#[derive(Debug, Clone)]
pub struct ZoneMask {
    frame_width: u32,
    frame_height: u32,
    x0: u32,
    y0: u32,
    width: u32,
    height: u32,
    inside: Vec<bool>,
    pixels: u64,
}

impl ZoneMask {
    pub fn build(zone: &Zone, frame_width: u32, frame_height: u32) -> Self {
        let Some((x0, y0, x1, y1)) = zone.bounding_box().pixel_bounds(frame_width, frame_height) else {
            return Self {
                frame_width,
                frame_height,
                x0: 0,
                y0: 0,
                width: 0,
                height: 0,
                inside: Vec::new(),
                pixels: 0,
            };
        };
        let width = x1 - x0 + 1;
        let height = y1 - y0 + 1;
        let mut inside = Vec::with_capacity((width * height) as usize);
        let mut pixels = 0u64;
        for y in y0..=y1 {
            for x in x0..=x1 {
                let hit = zone.contains(x as f64, y as f64);
                pixels += hit as u64;
                inside.push(hit);
            }
        }
        Self {
            frame_width,
            frame_height,
            x0,
            y0,
            width,
            height,
            inside,
            pixels,
        }
    }

    pub fn matches_frame(&self, frame_width: u32, frame_height: u32) -> bool {
        self.frame_width == frame_width && self.frame_height == frame_height
    }

    /// Number of frame pixels inside the polygon.
    pub fn pixel_count(&self) -> u64 {
        self.pixels
    }

    #[inline]
    fn local(&self, lx: u32, ly: u32) -> bool {
        self.inside[(ly * self.width + lx) as usize]
    }
}

/// Extract 8-connected foreground components inside `zone`, dropping any
/// smaller than `min_area` pixels.
pub fn find_blobs(mask: &ForegroundMask, zone: &ZoneMask, min_area: u32) -> Vec<Blob> {
    let mut blobs = Vec::new();
    if zone.pixels == 0 || mask.width() != zone.frame_width || mask.height() != zone.frame_height {
        return blobs;
    }

    let (w, h) = (zone.width, zone.height);
    let mut visited = vec![false; (w * h) as usize];
    let mut stack: Vec<(u32, u32)> = Vec::new();
    let is_fg = |lx: u32, ly: u32| zone.local(lx, ly) && mask.get(zone.x0 + lx, zone.y0 + ly);

    for sy in 0..h {
        for sx in 0..w {
            let idx = (sy * w + sx) as usize;
            if visited[idx] || !is_fg(sx, sy) {
                continue;
            }
            visited[idx] = true;
            stack.push((sx, sy));

            let (mut min_x, mut min_y, mut max_x, mut max_y) = (sx, sy, sx, sy);
            let mut area = 0u32;
            let (mut sum_x, mut sum_y) = (0u64, 0u64);

            while let Some((x, y)) = stack.pop() {
                area += 1;
                sum_x += x as u64;
                sum_y += y as u64;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);

                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nx = x as i64 + dx;
                        let ny = y as i64 + dy;
                        if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                            continue;
                        }
                        let (nx, ny) = (nx as u32, ny as u32);
                        let nidx = (ny * w + nx) as usize;
                        if !visited[nidx] && is_fg(nx, ny) {
                            visited[nidx] = true;
                            stack.push((nx, ny));
                        }
                    }
                }
            }

            if area < min_area {
                continue;
            }
            blobs.push(Blob {
                bbox: PixelBox {
                    x: zone.x0 + min_x,
                    y: zone.y0 + min_y,
                    w: max_x - min_x + 1,
                    h: max_y - min_y + 1,
                },
                area,
                centroid: (
                    zone.x0 as f64 + sum_x as f64 / area as f64,
                    zone.y0 as f64 + sum_y as f64 / area as f64,
                ),
            });
        }
    }
    blobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::processing::background::BackgroundModel;
    use image::{GrayImage, Luma};

    fn mask_with(width: u32, height: u32, rects: &[(u32, u32, u32, u32)]) -> ForegroundMask {
        let mut model = BackgroundModel::new(&DetectorConfig::default());
        let empty = GrayImage::from_pixel(width, height, Luma([20]));
        model.apply(&empty);
        let mut img = empty.clone();
        for &(x, y, w, h) in rects {
            for py in y..y + h {
                for px in x..x + w {
                    img.put_pixel(px, py, Luma([220]));
                }
            }
        }
        model.apply(&img).clone()
    }

    #[test]
    fn test_zone_mask_counts_rectangle_pixels() {
        let zone = Zone::rectangle("z", 0.0, 0.0, 9.0, 4.0).unwrap();
        let mask = ZoneMask::build(&zone, 20, 20);
        assert_eq!(mask.pixel_count(), 50);
    }

    #[test]
    fn test_zone_mask_clips_to_frame() {
        let zone = Zone::rectangle("z", 10.0, 10.0, 100.0, 100.0).unwrap();
        let mask = ZoneMask::build(&zone, 16, 16);
        assert_eq!(mask.pixel_count(), 36);

        let outside = Zone::rectangle("o", 50.0, 50.0, 5.0, 5.0).unwrap();
        assert_eq!(ZoneMask::build(&outside, 16, 16).pixel_count(), 0);
    }

    #[test]
    fn test_two_separate_blobs() {
        let fg = mask_with(32, 32, &[(2, 2, 4, 4), (20, 20, 5, 5)]);
        let zone = ZoneMask::build(&Zone::rectangle("z", 0.0, 0.0, 31.0, 31.0).unwrap(), 32, 32);
        let mut blobs = find_blobs(&fg, &zone, 1);
        blobs.sort_by_key(|b| b.area);
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].area, 16);
        assert_eq!(blobs[0].bbox, PixelBox { x: 2, y: 2, w: 4, h: 4 });
        assert_eq!(blobs[1].area, 25);
        assert_eq!(blobs[1].centroid, (22.0, 22.0));
    }

    #[test]
    fn test_diagonal_pixels_connect() {
        let fg = mask_with(16, 16, &[(2, 2, 2, 2), (4, 4, 2, 2)]);
        let zone = ZoneMask::build(&Zone::rectangle("z", 0.0, 0.0, 15.0, 15.0).unwrap(), 16, 16);
        let blobs = find_blobs(&fg, &zone, 1);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].area, 8);
    }

    #[test]
    fn test_min_area_filters_noise() {
        let fg = mask_with(16, 16, &[(1, 1, 1, 1), (6, 6, 4, 4)]);
        let zone = ZoneMask::build(&Zone::rectangle("z", 0.0, 0.0, 15.0, 15.0).unwrap(), 16, 16);
        let blobs = find_blobs(&fg, &zone, 4);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].area, 16);
    }

    #[test]
    fn test_blob_is_clipped_to_zone() {
        let fg = mask_with(16, 16, &[(0, 0, 8, 8)]);
        let zone = ZoneMask::build(&Zone::rectangle("z", 4.0, 4.0, 8.0, 8.0).unwrap(), 16, 16);
        let blobs = find_blobs(&fg, &zone, 1);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].area, 16);
        assert_eq!(blobs[0].bbox, PixelBox { x: 4, y: 4, w: 4, h: 4 });
    }
}
