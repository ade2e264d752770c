//! Greedy token selection

use candle_core::{DType, Tensor};

use crate::error::{DecodeError, Result};

/// Deterministic arg-max over the last position of a logits tensor
///
/// Accepts `(1, vocab)` or `(1, seq, vocab)` logits of any float dtype.
/// Ties resolve to the lowest vocabulary index and NaN entries never win.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenSelector;

impl TokenSelector {
    /// Create a greedy selector
    pub fn new() -> Self {
        Self
    }

    /// Pick the next token
    pub fn select(&self, logits: &Tensor) -> Result<u32> {
        let last = last_distribution(logits)?;
        let values: Vec<f32> = last.to_dtype(DType::F32)?.to_vec1()?;
        match argmax(&values) {
            Some(idx) => Ok(idx as u32),
            None => Err(malformed(logits, "no finite score in the distribution")),
        }
    }
}

/// Index of the largest value; the first one wins on ties
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in values.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if value <= top => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

fn last_distribution(logits: &Tensor) -> Result<Tensor> {
    let dims = logits.dims();
    let last = match *dims {
        [rows, _] => {
            if rows == 0 {
                return Err(malformed(logits, "no rows"));
            }
            logits.get(rows - 1)?
        }
        [batch, seq, _] => {
            if batch == 0 || seq == 0 {
                return Err(malformed(logits, "no sequence positions"));
            }
            logits.get(0)?.get(seq - 1)?
        }
        _ => return Err(malformed(logits, "rank must be 2 or 3")),
    };
    if last.dims()[0] == 0 {
        return Err(malformed(logits, "empty vocabulary"));
    }
    Ok(last)
}

fn malformed(logits: &Tensor, reason: &str) -> DecodeError {
    DecodeError::MalformedLogits {
        dims: logits.dims().to_vec(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::Rng;

    #[test]
    fn test_select_rank_two() {
        let logits = Tensor::new(&[[1.0f32, 5.0, 2.0, 3.0]], &Device::Cpu).unwrap();
        assert_eq!(TokenSelector::new().select(&logits).unwrap(), 1);
    }

    #[test]
    fn test_select_reads_last_position() {
        let logits = Tensor::new(
            &[[[9.0f32, 0.0, 0.0], [0.0, 0.0, 4.0]]],
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(TokenSelector::new().select(&logits).unwrap(), 2);
    }

    #[test]
    fn test_ties_pick_lowest_index() {
        let logits = Tensor::new(&[[0.5f32, 7.0, 7.0, 7.0]], &Device::Cpu).unwrap();
        let selector = TokenSelector::new();
        for _ in 0..3 {
            assert_eq!(selector.select(&logits).unwrap(), 1);
        }
    }

    #[test]
    fn test_half_precision_logits() {
        let logits = Tensor::new(&[[0.1f32, 0.2, 0.9, 0.3]], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        assert_eq!(TokenSelector::new().select(&logits).unwrap(), 2);
    }

    #[test]
    fn test_nan_never_wins() {
        assert_eq!(argmax(&[f32::NAN, 1.0, f32::NAN, 0.5]), Some(1));
        assert_eq!(argmax(&[f32::NAN]), None);
        assert_eq!(argmax(&[]), None);
        assert_eq!(argmax(&[f32::NEG_INFINITY, f32::NEG_INFINITY]), Some(0));
    }

    #[test]
    fn test_rank_one_is_malformed() {
        let logits = Tensor::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        assert!(matches!(
            TokenSelector::new().select(&logits),
            Err(DecodeError::MalformedLogits { .. })
        ));
    }

    #[test]
    fn test_empty_vocabulary_is_malformed() {
        let logits = Tensor::zeros((1, 0), DType::F32, &Device::Cpu).unwrap();
        assert!(TokenSelector::new().select(&logits).is_err());
    }

    #[test]
    fn test_random_logits_match_argmax() {
        let mut rng = rand::thread_rng();
        let selector = TokenSelector::new();
        for _ in 0..20 {
            let values: Vec<f32> = (0..64).map(|_| rng.gen_range(-10.0..10.0)).collect();
            let expected = values
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
            let logits = Tensor::from_vec(values, (1, 1, 64), &Device::Cpu).unwrap();
            assert_eq!(selector.select(&logits).unwrap() as usize, expected.0);
            assert_eq!(selector.select(&logits).unwrap() as usize, expected.0);
        }
    }
}
