use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub const MAX_LAYERS: usize = 32;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Layer(pub u8);

impl Layer {
    pub const DEFAULT: Self = Self(0);
    pub const WORLD: Self = Self(1);
    pub const PROPS: Self = Self(2);
    pub const PORTAL_SURFACE: Self = Self(3);

    pub fn is_valid(self) -> bool {
        usize::from(self.0) < MAX_LAYERS
    }

    pub fn mask(self) -> LayerMask {
        if self.is_valid() {
            LayerMask::from_bits_retain(1 << self.0)
        } else {
            LayerMask::empty()
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(pub u16);

impl Tag {
    pub const NONE: Self = Self(0);
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct LayerMask: u32 {
        const DEFAULT        = 1;
        const WORLD          = 1 << 1;
        const PROPS          = 1 << 2;
        const PORTAL_SURFACE = 1 << 3;
    }
}

impl LayerMask {
    pub fn contains_layer(self, layer: Layer) -> bool {
        self.intersects(layer.mask())
    }
}

impl Default for LayerMask {
    fn default() -> Self {
        Self::all()
    }
}

/// Per-portal layer substitution table, identity unless an entry was set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRemap {
    table: [u8; MAX_LAYERS],
}

impl Default for LayerRemap {
    fn default() -> Self {
        let mut table = [0u8; MAX_LAYERS];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = i as u8;
        }
        Self { table }
    }
}

impl LayerRemap {
    pub fn set(&mut self, from: Layer, to: Layer) {
        if from.is_valid() && to.is_valid() {
            self.table[usize::from(from.0)] = to.0;
        }
    }

    pub fn remap(&self, layer: Layer) -> Layer {
        if layer.is_valid() {
            Layer(self.table[usize::from(layer.0)])
        } else {
            layer
        }
    }

    pub fn remap_mask(&self, mask: LayerMask) -> LayerMask {
        let mut out = LayerMask::empty();
        for bit in 0..MAX_LAYERS {
            let layer = Layer(bit as u8);
            if mask.contains_layer(layer) {
                out |= self.remap(layer).mask();
            }
        }
        out
    }

    pub fn is_identity(&self) -> bool {
        self.table
            .iter()
            .enumerate()
            .all(|(i, &to)| to == i as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::{Layer, LayerMask, LayerRemap};

    #[test]
    fn layer_mask_bit_mapping() {
        assert_eq!(Layer::DEFAULT.mask(), LayerMask::DEFAULT);
        assert_eq!(Layer(5).mask().bits(), 1 << 5);
        assert!(!Layer(40).is_valid());
        assert_eq!(Layer(40).mask(), LayerMask::empty());
    }

    #[test]
    fn mask_round_trips_through_toml_by_flag_name() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Doc {
            mask: LayerMask,
        }

        let doc = Doc {
            mask: LayerMask::WORLD | LayerMask::PROPS,
        };
        let text = toml::to_string(&doc).unwrap();
        assert!(text.contains("WORLD"), "{text}");

        let back: Doc = toml::from_str(&text).unwrap();
        assert_eq!(back.mask, doc.mask);
    }

    #[test]
    fn remap_defaults_to_identity() {
        let remap = LayerRemap::default();
        assert!(remap.is_identity());
        assert_eq!(remap.remap(Layer(7)), Layer(7));
        let mask = LayerMask::DEFAULT | LayerMask::PROPS;
        assert_eq!(remap.remap_mask(mask), mask);
    }

    #[test]
    fn remap_moves_mask_bits() {
        let mut remap = LayerRemap::default();
        remap.set(Layer::PROPS, Layer(9));

        assert_eq!(remap.remap(Layer::PROPS), Layer(9));
        let mapped = remap.remap_mask(LayerMask::PROPS | LayerMask::WORLD);
        assert!(mapped.contains_layer(Layer(9)));
        assert!(mapped.contains_layer(Layer::WORLD));
        assert!(!mapped.contains_layer(Layer::PROPS));
    }
}
