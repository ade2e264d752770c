//! Attention cache bank for staged decoding
//!
//! Holds `4 × num_layers` key/value tensors in a fixed flat layout:
//! layer `L` owns positions `4L..4L+4` as self-key, self-value, cross-key,
//! cross-value. Every tensor is shaped `(1, num_heads, seq_len, head_dim)`.
//!
//! The decoder stages consume and produce the cache in this layout, so the
//! bank is also the single place that knows which stage output lands in
//! which slot.

use candle_core::{DType, Device, Tensor};
use std::fmt;

use crate::error::{DecodeError, Result};

/// Which attention tensor a slot holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Decoder self-attention keys
    SelfKey,
    /// Decoder self-attention values
    SelfValue,
    /// Encoder-decoder cross-attention keys
    CrossKey,
    /// Encoder-decoder cross-attention values
    CrossValue,
}

impl SlotKind {
    /// All kinds in their within-layer order
    pub const ALL: [SlotKind; 4] = [
        SlotKind::SelfKey,
        SlotKind::SelfValue,
        SlotKind::CrossKey,
        SlotKind::CrossValue,
    ];

    /// Position of this kind inside a layer's group of slots
    pub fn offset(self) -> usize {
        match self {
            SlotKind::SelfKey => 0,
            SlotKind::SelfValue => 1,
            SlotKind::CrossKey => 2,
            SlotKind::CrossValue => 3,
        }
    }

    /// Whether the slot belongs to decoder self-attention
    pub fn is_self_attention(self) -> bool {
        matches!(self, SlotKind::SelfKey | SlotKind::SelfValue)
    }

    /// Name used by exported decoder graphs (`self.key`, `cross.value`, ...)
    pub fn name(self) -> &'static str {
        match self {
            SlotKind::SelfKey => "self.key",
            SlotKind::SelfValue => "self.value",
            SlotKind::CrossKey => "cross.key",
            SlotKind::CrossValue => "cross.value",
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mapping from `(layer, kind)` to a flat slot index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    num_layers: usize,
}

impl SlotLayout {
    /// Slots owned by every decoder layer
    pub const SLOTS_PER_LAYER: usize = SlotKind::ALL.len();

    /// Build and validate the layout for `num_layers` decoder layers
    pub fn new(num_layers: usize) -> Result<Self> {
        if num_layers == 0 {
            return Err(DecodeError::Configuration(
                "num_layers must be greater than 0".to_string(),
            ));
        }
        if num_layers.checked_mul(Self::SLOTS_PER_LAYER).is_none() {
            return Err(DecodeError::Configuration(format!(
                "num_layers={} overflows the slot index space",
                num_layers
            )));
        }

        let layout = Self { num_layers };
        layout.validate()?;
        Ok(layout)
    }

    /// Number of decoder layers
    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Total number of slots (`4 × num_layers`)
    pub fn num_slots(&self) -> usize {
        self.num_layers * Self::SLOTS_PER_LAYER
    }

    /// Number of self-attention slots (`2 × num_layers`)
    pub fn num_self_slots(&self) -> usize {
        self.num_layers * 2
    }

    /// Flat index of a slot
    pub fn index(&self, layer: usize, kind: SlotKind) -> usize {
        layer * Self::SLOTS_PER_LAYER + kind.offset()
    }

    /// Inverse of [`SlotLayout::index`]
    pub fn locate(&self, index: usize) -> (usize, SlotKind) {
        let kind = SlotKind::ALL[index % Self::SLOTS_PER_LAYER];
        (index / Self::SLOTS_PER_LAYER, kind)
    }

    /// Flat indices of the self-attention slots, in the order the
    /// incremental decoder returns them (`self.key₀, self.value₀, ...`)
    pub fn self_attention_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_layers).flat_map(move |layer| {
            [
                self.index(layer, SlotKind::SelfKey),
                self.index(layer, SlotKind::SelfValue),
            ]
        })
    }

    fn validate(&self) -> Result<()> {
        let mut seen = vec![false; self.num_slots()];
        for layer in 0..self.num_layers {
            for kind in SlotKind::ALL {
                let idx = self.index(layer, kind);
                if idx >= seen.len() || seen[idx] || self.locate(idx) != (layer, kind) {
                    return Err(DecodeError::Configuration(format!(
                        "slot layout is inconsistent at layer {} {}",
                        layer, kind
                    )));
                }
                seen[idx] = true;
            }
        }
        Ok(())
    }
}

/// Static dimensions of a cache bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of decoder layers
    pub num_layers: usize,
    /// Attention heads per layer
    pub num_heads: usize,
    /// Dimension of each head
    pub head_dim: usize,
    /// Encoder output positions (cross-attention sequence length)
    pub encoder_seq_len: usize,
    /// Element type of the cache tensors
    pub dtype: DType,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_layers: 4,
            num_heads: 6,
            head_dim: 64,
            encoder_seq_len: 1500,
            dtype: DType::F32,
        }
    }
}

impl CacheConfig {
    /// Check that every dimension is usable
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("head_dim", self.head_dim),
            ("encoder_seq_len", self.encoder_seq_len),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(DecodeError::Configuration(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Per-layer attention state owned by one decoding session
#[derive(Debug)]
pub struct CacheBank {
    config: CacheConfig,
    layout: SlotLayout,
    slots: Vec<Tensor>,
    seeded: bool,
}

impl CacheBank {
    /// Create a bank with empty self-attention slots and zero-filled
    /// cross-attention slots
    pub fn initialize(config: CacheConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let layout = SlotLayout::new(config.num_layers)?;

        let self_shape = (1, config.num_heads, 0, config.head_dim);
        let cross_shape = (1, config.num_heads, config.encoder_seq_len, config.head_dim);

        let mut slots = Vec::with_capacity(layout.num_slots());
        for idx in 0..layout.num_slots() {
            let (_, kind) = layout.locate(idx);
            let slot = if kind.is_self_attention() {
                Tensor::zeros(self_shape, config.dtype, device)?
            } else {
                Tensor::zeros(cross_shape, config.dtype, device)?
            };
            slots.push(slot);
        }

        Ok(Self {
            config,
            layout,
            slots,
            seeded: false,
        })
    }

    /// Install the full prefill cache (`4 × num_layers` tensors, self and
    /// cross) in one atomic replace
    pub fn seed(&mut self, prefill_cache: Vec<Tensor>) -> Result<()> {
        if self.seeded {
            return Err(DecodeError::CrossAttentionSealed);
        }
        check_count("prefill cache", self.layout.num_slots(), prefill_cache.len())?;

        for (idx, tensor) in prefill_cache.iter().enumerate() {
            let (layer, kind) = self.layout.locate(idx);
            self.check_slot(tensor, layer, kind)?;
        }
        self.check_self_lengths(prefill_cache.iter().enumerate().filter_map(|(idx, t)| {
            let (layer, kind) = self.layout.locate(idx);
            kind.is_self_attention().then_some((layer, kind, t))
        }))?;

        self.slots = prefill_cache;
        self.seeded = true;
        Ok(())
    }

    /// Install the first self-attention key/value pair per layer, keeping the
    /// cross-attention slots the bank already holds
    pub fn seed_self_attention(&mut self, layer_outputs: Vec<Tensor>) -> Result<()> {
        if self.seeded {
            return Err(DecodeError::CrossAttentionSealed);
        }
        self.replace_self_attention(layer_outputs)?;
        self.seeded = true;
        Ok(())
    }

    /// Replace every self-attention slot with freshly returned tensors
    ///
    /// `layer_outputs` is ordered `self.key₀, self.value₀, self.key₁, ...`.
    /// Either all slots are replaced or none are.
    pub fn replace_self_attention(&mut self, layer_outputs: Vec<Tensor>) -> Result<()> {
        check_count(
            "self-attention cache",
            self.layout.num_self_slots(),
            layer_outputs.len(),
        )?;

        let targets: Vec<usize> = self.layout.self_attention_indices().collect();
        for (&idx, tensor) in targets.iter().zip(layer_outputs.iter()) {
            let (layer, kind) = self.layout.locate(idx);
            self.check_slot(tensor, layer, kind)?;
        }
        self.check_self_lengths(targets.iter().zip(layer_outputs.iter()).map(|(&idx, t)| {
            let (layer, kind) = self.layout.locate(idx);
            (layer, kind, t)
        }))?;

        for (idx, tensor) in targets.into_iter().zip(layer_outputs) {
            self.slots[idx] = tensor;
        }
        Ok(())
    }

    /// All slots in the flat layout, ready to feed the next stage call
    pub fn snapshot(&self) -> Vec<Tensor> {
        self.slots.clone()
    }

    /// Borrow one slot
    pub fn slot(&self, layer: usize, kind: SlotKind) -> Option<&Tensor> {
        if layer >= self.layout.num_layers() {
            return None;
        }
        self.slots.get(self.layout.index(layer, kind))
    }

    /// Current decoder-side sequence length of the self-attention cache
    pub fn decoder_len(&self) -> usize {
        self.slots[self.layout.index(0, SlotKind::SelfKey)].dims()[2]
    }

    /// Number of slots held (always `4 × num_layers`)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// A bank always holds slots; provided for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether prefill output has been installed
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Static dimensions of this bank
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Slot layout of this bank
    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    fn check_slot(&self, tensor: &Tensor, layer: usize, kind: SlotKind) -> Result<()> {
        let dims = tensor.dims();
        let seq_len = if kind.is_self_attention() {
            dims.get(2).copied().unwrap_or(0)
        } else {
            self.config.encoder_seq_len
        };
        let expected = [1, self.config.num_heads, seq_len, self.config.head_dim];
        if dims != expected {
            return Err(DecodeError::ShapeMismatch {
                slot: format!("layer {} {}", layer, kind),
                expected: expected.to_vec(),
                actual: dims.to_vec(),
            });
        }
        if tensor.dtype() != self.config.dtype {
            return Err(DecodeError::DTypeMismatch {
                slot: format!("layer {} {}", layer, kind),
                expected: self.config.dtype,
                actual: tensor.dtype(),
            });
        }
        Ok(())
    }

    /// Keys and values of every layer must cover the same decoder positions
    fn check_self_lengths<'t>(
        &self,
        entries: impl Iterator<Item = (usize, SlotKind, &'t Tensor)>,
    ) -> Result<()> {
        let mut reference: Option<usize> = None;
        for (layer, kind, tensor) in entries {
            let len = tensor.dims()[2];
            match reference {
                None => reference = Some(len),
                Some(expected) if expected != len => {
                    let mut expected_dims = tensor.dims().to_vec();
                    expected_dims[2] = expected;
                    return Err(DecodeError::ShapeMismatch {
                        slot: format!("layer {} {}", layer, kind),
                        expected: expected_dims,
                        actual: tensor.dims().to_vec(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn check_count(what: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(DecodeError::ShapeMismatch {
            slot: format!("{} tensor count", what),
            expected: vec![expected],
            actual: vec![actual],
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> CacheConfig {
        CacheConfig {
            num_layers: 2,
            num_heads: 3,
            head_dim: 4,
            encoder_seq_len: 5,
            dtype: DType::F32,
        }
    }

    fn self_outputs(config: &CacheConfig, seq_len: usize, fill: f64) -> Vec<Tensor> {
        (0..config.num_layers * 2)
            .map(|i| {
                Tensor::full(
                    (fill + i as f64) as f32,
                    (1, config.num_heads, seq_len, config.head_dim),
                    &Device::Cpu,
                )
                .unwrap()
            })
            .collect()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_layout_matches_decoder_graph_order() {
        let layout = SlotLayout::new(4).unwrap();
        let self_idx: Vec<usize> = layout.self_attention_indices().collect();
        assert_eq!(self_idx, vec![0, 1, 4, 5, 8, 9, 12, 13]);
        assert_eq!(layout.index(2, SlotKind::CrossKey), 10);
        assert_eq!(layout.locate(15), (3, SlotKind::CrossValue));
        assert_eq!(layout.num_slots(), 16);
    }

    #[test]
    fn test_layout_rejects_zero_layers() {
        assert!(matches!(
            SlotLayout::new(0),
            Err(DecodeError::Configuration(_))
        ));
    }

    #[test]
    fn test_initialize_shapes() {
        for num_layers in [1, 4, 7] {
            let config = CacheConfig {
                num_layers,
                ..small_config()
            };
            let bank = CacheBank::initialize(config, &Device::Cpu).unwrap();
            assert_eq!(bank.len(), 4 * num_layers);
            assert_eq!(bank.decoder_len(), 0);
            assert!(!bank.is_seeded());

            for (idx, slot) in bank.snapshot().iter().enumerate() {
                let (_, kind) = bank.layout().locate(idx);
                let expected_seq = if kind.is_self_attention() { 0 } else { 5 };
                assert_eq!(slot.dims(), &[1, 3, expected_seq, 4]);
            }
        }
    }

    #[test]
    fn test_initialize_cross_slots_are_zero() {
        let bank = CacheBank::initialize(small_config(), &Device::Cpu).unwrap();
        let cross = bank.slot(1, SlotKind::CrossValue).unwrap();
        assert!(values(cross).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_initialize_rejects_bad_dimensions() {
        for config in [
            CacheConfig { num_layers: 0, ..small_config() },
            CacheConfig { num_heads: 0, ..small_config() },
            CacheConfig { head_dim: 0, ..small_config() },
        ] {
            let err = CacheBank::initialize(config, &Device::Cpu).unwrap_err();
            assert!(matches!(err, DecodeError::Configuration(_)));
        }
    }

    #[test]
    fn test_replace_keeps_cross_attention() {
        let config = small_config();
        let mut bank = CacheBank::initialize(config, &Device::Cpu).unwrap();
        let cross_before: Vec<Vec<f32>> = (0..2)
            .flat_map(|l| [SlotKind::CrossKey, SlotKind::CrossValue].map(|k| (l, k)))
            .map(|(l, k)| values(bank.slot(l, k).unwrap()))
            .collect();

        for step in 1..4 {
            bank.replace_self_attention(self_outputs(&config, step, step as f64))
                .unwrap();
            assert_eq!(bank.decoder_len(), step);
        }

        let cross_after: Vec<Vec<f32>> = (0..2)
            .flat_map(|l| [SlotKind::CrossKey, SlotKind::CrossValue].map(|k| (l, k)))
            .map(|(l, k)| values(bank.slot(l, k).unwrap()))
            .collect();
        assert_eq!(cross_before, cross_after);

        // layer 1 self.value is the fourth returned tensor
        let v = values(bank.slot(1, SlotKind::SelfValue).unwrap());
        assert!(v.iter().all(|&x| x == 3.0 + 3.0));
    }

    #[test]
    fn test_replace_with_wrong_heads_is_atomic() {
        let config = small_config();
        let mut bank = CacheBank::initialize(config, &Device::Cpu).unwrap();
        bank.replace_self_attention(self_outputs(&config, 2, 1.0)).unwrap();
        let before: Vec<Vec<f32>> = bank.snapshot().iter().map(values).collect();

        let mut bad = self_outputs(&config, 3, 9.0);
        bad[3] = Tensor::zeros((1, 2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let err = bank.replace_self_attention(bad).unwrap_err();
        assert!(matches!(err, DecodeError::ShapeMismatch { .. }));

        let after: Vec<Vec<f32>> = bank.snapshot().iter().map(values).collect();
        assert_eq!(before, after);
        assert_eq!(bank.decoder_len(), 2);
    }

    #[test]
    fn test_replace_with_wrong_dtype_is_atomic() {
        let config = small_config();
        let mut bank = CacheBank::initialize(config, &Device::Cpu).unwrap();
        bank.replace_self_attention(self_outputs(&config, 1, 1.0)).unwrap();
        let before: Vec<Vec<f32>> = bank.snapshot().iter().map(values).collect();

        let mut half = self_outputs(&config, 2, 5.0);
        half[2] = half[2].to_dtype(DType::F16).unwrap();
        let err = bank.replace_self_attention(half).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::DTypeMismatch {
                expected: DType::F32,
                actual: DType::F16,
                ..
            }
        ));

        let after: Vec<Vec<f32>> = bank.snapshot().iter().map(values).collect();
        assert_eq!(before, after);
        assert!(bank.snapshot().iter().all(|t| t.dtype() == DType::F32));
    }

    #[test]
    fn test_replace_rejects_wrong_count() {
        let config = small_config();
        let mut bank = CacheBank::initialize(config, &Device::Cpu).unwrap();
        let mut outputs = self_outputs(&config, 1, 0.0);
        outputs.pop();
        assert!(matches!(
            bank.replace_self_attention(outputs),
            Err(DecodeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_replace_rejects_uneven_lengths() {
        let config = small_config();
        let mut bank = CacheBank::initialize(config, &Device::Cpu).unwrap();
        let mut outputs = self_outputs(&config, 2, 0.0);
        outputs[1] = Tensor::zeros((1, 3, 1, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(bank.replace_self_attention(outputs).is_err());
        assert_eq!(bank.decoder_len(), 0);
    }

    #[test]
    fn test_seed_installs_full_cache_once() {
        let config = small_config();
        let mut bank = CacheBank::initialize(config, &Device::Cpu).unwrap();

        let prefill: Vec<Tensor> = (0..8)
            .map(|idx| {
                let (_, kind) = bank.layout().locate(idx);
                let seq = if kind.is_self_attention() { 1 } else { 5 };
                Tensor::full(idx as f32, (1, 3, seq, 4), &Device::Cpu).unwrap()
            })
            .collect();
        bank.seed(prefill.clone()).unwrap();
        assert!(bank.is_seeded());
        assert_eq!(bank.decoder_len(), 1);
        assert!(values(bank.slot(1, SlotKind::CrossKey).unwrap())
            .iter()
            .all(|&v| v == 6.0));

        assert!(matches!(
            bank.seed(prefill),
            Err(DecodeError::CrossAttentionSealed)
        ));
    }

    #[test]
    fn test_seed_rejects_wrong_cross_length() {
        let config = small_config();
        let mut bank = CacheBank::initialize(config, &Device::Cpu).unwrap();
        let prefill: Vec<Tensor> = (0..8)
            .map(|_| Tensor::zeros((1, 3, 1, 4), DType::F32, &Device::Cpu).unwrap())
            .collect();
        assert!(matches!(
            bank.seed(prefill),
            Err(DecodeError::ShapeMismatch { .. })
        ));
        assert!(!bank.is_seeded());
    }

    #[test]
    fn test_seed_self_attention_keeps_constructed_cross() {
        let config = small_config();
        let mut bank = CacheBank::initialize(config, &Device::Cpu).unwrap();
        bank.seed_self_attention(self_outputs(&config, 1, 2.0)).unwrap();
        assert!(bank.is_seeded());
        assert_eq!(bank.decoder_len(), 1);
        assert_eq!(bank.slot(0, SlotKind::CrossKey).unwrap().dims(), &[1, 3, 5, 4]);
        assert!(bank.slot(2, SlotKind::SelfKey).is_none());
    }
}
