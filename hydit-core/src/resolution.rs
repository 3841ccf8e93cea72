use std::{collections::HashSet, fmt::Display};

/// An output image size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: usize,
    pub height: usize,
}

impl Resolution {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }
}

/// Renders as `HxW`, the key of the rotary table.
impl Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

const SUPPORTED: [Resolution; 11] = [
    Resolution::new(768, 768),   // 1:1
    Resolution::new(1024, 1024), // 1:1
    Resolution::new(1280, 1280), // 1:1
    Resolution::new(1024, 768),  // 4:3
    Resolution::new(1152, 864),  // 4:3
    Resolution::new(1280, 960),  // 4:3
    Resolution::new(768, 1024),  // 3:4
    Resolution::new(864, 1152),  // 3:4
    Resolution::new(960, 1280),  // 3:4
    Resolution::new(1280, 768),  // 16:9
    Resolution::new(768, 1280),  // 9:16
];

/// The aspect-ratio buckets the model was trained on.
#[derive(Debug, Clone)]
pub struct ResolutionGroup {
    data: Vec<Resolution>,
    supported_sizes: HashSet<(usize, usize)>,
}

impl Default for ResolutionGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionGroup {
    pub fn new() -> Self {
        let data = SUPPORTED.to_vec();
        let supported_sizes = data.iter().map(|r| (r.width, r.height)).collect();
        Self {
            data,
            supported_sizes,
        }
    }

    pub fn is_valid(&self, width: usize, height: usize) -> bool {
        self.supported_sizes.contains(&(width, height))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resolution> {
        self.data.iter()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
