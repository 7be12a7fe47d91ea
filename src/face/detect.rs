//! Face region detection over decoded images.
//!
//! Detection is a skin-chroma segmentation pass followed by a connected-
//! component scan. It is deliberately simple and fully deterministic: regions
//! are reported in row-major discovery order, which is the "first detected"
//! order the selection strategies are defined against.

use image::{DynamicImage, GenericImageView};

/// Minimum side length for a candidate region, in pixels.
const MIN_REGION_SIDE: u32 = 8;

/// Minimum fraction of the image area a candidate region must cover.
/// Filters out stray skin-toned pixels and compression noise.
const MIN_AREA_FRACTION: f64 = 0.0005;

/// Axis-aligned bounding box of a detected face region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// How to pick one region when an image contains several faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaceSelection {
    /// First region in detection order. Reference behavior.
    #[default]
    First,
    /// Region with the largest bounding-box area, ties broken by
    /// first-detected order.
    Largest,
}

impl FaceSelection {
    /// Apply the strategy to a non-empty candidate list.
    pub fn select<'a>(&self, regions: &'a [FaceRegion]) -> Option<&'a FaceRegion> {
        match self {
            FaceSelection::First => regions.first(),
            FaceSelection::Largest => largest_of(regions),
        }
    }
}

/// Pick the region with the maximum bounding-box area.
///
/// Ties are broken by first-detected order, so the result is deterministic
/// for a given input image.
pub fn largest_of(regions: &[FaceRegion]) -> Option<&FaceRegion> {
    regions
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.area().cmp(&b.area()).then(ib.cmp(ia)))
        .map(|(_, r)| r)
}

/// Detect candidate face regions in the image.
///
/// Returns bounding boxes in row-major discovery order. An empty list means
/// no face was found; that is an expected outcome, not an error.
pub fn detect_faces(img: &DynamicImage) -> Vec<FaceRegion> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let rgb = img.to_rgb8();
    let mask: Vec<bool> = rgb.pixels().map(|p| is_skin(p.0)).collect();

    let min_area = ((width as u64 * height as u64) as f64 * MIN_AREA_FRACTION).ceil() as u64;

    let mut visited = vec![false; mask.len()];
    let mut regions = Vec::new();
    let mut queue = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }

        // Flood fill one 4-connected component, tracking its bounding box.
        let (mut min_x, mut min_y) = (width - 1, height - 1);
        let (mut max_x, mut max_y) = (0u32, 0u32);

        visited[start] = true;
        queue.push(start);
        while let Some(idx) = queue.pop() {
            let x = (idx as u32) % width;
            let y = (idx as u32) / width;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            let mut try_push = |nx: u32, ny: u32| {
                let nidx = (ny * width + nx) as usize;
                if mask[nidx] && !visited[nidx] {
                    visited[nidx] = true;
                    queue.push(nidx);
                }
            };

            if x > 0 {
                try_push(x - 1, y);
            }
            if x + 1 < width {
                try_push(x + 1, y);
            }
            if y > 0 {
                try_push(x, y - 1);
            }
            if y + 1 < height {
                try_push(x, y + 1);
            }
        }

        let region = FaceRegion {
            x: min_x,
            y: min_y,
            width: max_x - min_x + 1,
            height: max_y - min_y + 1,
        };

        if region.width >= MIN_REGION_SIDE
            && region.height >= MIN_REGION_SIDE
            && region.area() >= min_area
        {
            regions.push(region);
        }
    }

    regions
}

/// Per-pixel skin classification (Peer et al. RGB rule).
fn is_skin([r, g, b]: [u8; 3]) -> bool {
    let (ri, gi, bi) = (r as i16, g as i16, b as i16);
    r > 95
        && g > 40
        && b > 20
        && ri - gi > 15
        && ri > bi
        && (ri.max(gi).max(bi) - ri.min(gi).min(bi)) > 15
}
