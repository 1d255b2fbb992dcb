/// A logical image layer and its component list.
///
/// The colour plane is special-cased throughout the resolver: a node may
/// advertise a different component count for it than the caller asked for, in
/// which case the node's own layout is rendered and converted on egress.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct PlaneDesc {
    layer: String,
    channels: u8,
}

pub const COLOR_LAYER: &str = "color";

impl PlaneDesc {
    pub fn new(layer: impl Into<String>, channels: u8) -> Self {
        Self {
            layer: layer.into(),
            channels,
        }
    }

    pub fn rgba() -> Self {
        Self::new(COLOR_LAYER, 4)
    }

    pub fn rgb() -> Self {
        Self::new(COLOR_LAYER, 3)
    }

    pub fn alpha() -> Self {
        Self::new(COLOR_LAYER, 1)
    }

    pub fn motion() -> Self {
        Self::new("motion", 2)
    }

    pub fn depth() -> Self {
        Self::new("depth", 1)
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn is_color_plane(&self) -> bool {
        self.layer == COLOR_LAYER
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum BitDepth {
    Byte,
    Short,
    Float,
}

impl BitDepth {
    pub fn bytes_per_channel(self) -> usize {
        match self {
            BitDepth::Byte => 1,
            BitDepth::Short => 2,
            BitDepth::Float => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ImagePremult {
    Opaque,
    Premultiplied,
    Unpremultiplied,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FieldingOrder {
    None,
    Lower,
    Upper,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StorageMode {
    Ram,
    GlTexture,
    Disk,
}
