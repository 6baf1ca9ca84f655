//! Tokenized, fixed-length training examples and weighted sampling
//!
//! Every record becomes a three-turn chat (system prompt, user query,
//! assistant response) rendered through the tokenizer's chat template, then
//! truncated and right-padded to `max_length`. Sampling draws `len()` indices
//! with replacement, proportionally to each record's weight, so heavy examples
//! are oversampled without duplicating them on disk.

use super::examples::TrainingRecord;
use crate::error::{Result, TrainError};
use crate::runtime::{ChatMessage, ChatTokenizer};
use candle_core::{Device, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::{debug, info};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Qwen, a helpful AI assistant.";
pub const DEFAULT_MAX_LENGTH: usize = 512;

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// One model-ready sequence; all three vectors have length `max_length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// Copy of `input_ids`; padding is excluded at collation time
    pub labels: Vec<i64>,
}

impl TokenizedExample {
    /// Truncate on the right, then right-pad with `pad_token_id`.
    pub fn from_token_ids(mut ids: Vec<u32>, max_length: usize, pad_token_id: u32) -> Self {
        ids.truncate(max_length);
        let real = ids.len();

        let mut attention_mask = vec![1u32; real];
        attention_mask.resize(max_length, 0);
        ids.resize(max_length, pad_token_id);

        let labels = ids.iter().map(|&id| id as i64).collect();
        Self {
            input_ids: ids,
            attention_mask,
            labels,
        }
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of non-padding positions.
    pub fn real_tokens(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m == 1).count()
    }
}

/// Tensors for one optimizer micro-batch, each `[batch, max_length]`.
#[derive(Debug, Clone)]
pub struct Batch {
    /// u32 token ids
    pub input_ids: Tensor,
    /// u32, 1 for real tokens
    pub attention_mask: Tensor,
    /// i64 targets, [`IGNORE_INDEX`] at padding
    pub labels: Tensor,
}

/// Draws dataset indices with replacement, proportionally to weight.
#[derive(Debug, Clone)]
pub struct WeightedSampler {
    index: WeightedIndex<f64>,
    num_samples: usize,
}

impl WeightedSampler {
    /// Weights are rescaled by their maximum so that large finite values
    /// cannot overflow the cumulative total.
    pub fn new(weights: &[f64], num_samples: usize) -> Result<Self> {
        let max = weights.iter().copied().fold(0.0_f64, f64::max);
        let scaled: Vec<f64> = if max.is_finite() && max > 0.0 {
            weights.iter().map(|w| w / max).collect()
        } else {
            weights.to_vec()
        };
        let total: f64 = scaled.iter().sum();
        if !total.is_finite() {
            return Err(TrainError::InvalidConfig(format!(
                "invalid sampling weights: total weight {} is not finite",
                total
            )));
        }

        let index = WeightedIndex::new(&scaled)
            .map_err(|e| TrainError::InvalidConfig(format!("invalid sampling weights: {}", e)))?;
        Ok(Self { index, num_samples })
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Always true; the same index may be drawn more than once.
    pub fn replacement(&self) -> bool {
        true
    }

    /// One epoch's worth of indices.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        (0..self.num_samples).map(|_| self.index.sample(rng)).collect()
    }
}

/// Tokenized examples with their sampling weights.
#[derive(Debug, Clone)]
pub struct WeightedDataset {
    examples: Vec<TokenizedExample>,
    weights: Vec<f64>,
    max_length: usize,
    truncated: usize,
}

impl WeightedDataset {
    pub fn build(
        records: &[TrainingRecord],
        tokenizer: &dyn ChatTokenizer,
        max_length: usize,
        system_prompt: &str,
    ) -> Result<Self> {
        if max_length == 0 {
            return Err(TrainError::InvalidConfig("max_length must be positive".into()));
        }
        if records.is_empty() {
            return Err(TrainError::InvalidConfig(
                "cannot build a dataset from zero records".into(),
            ));
        }

        let pad_token_id = tokenizer.pad_token_id();
        let mut examples = Vec::with_capacity(records.len());
        let mut truncated = 0;

        for record in records {
            let chat = [
                ChatMessage::system(system_prompt),
                ChatMessage::user(&record.query),
                ChatMessage::assistant(&record.response),
            ];
            let text = tokenizer.apply_chat_template(&chat, false)?;
            let ids = tokenizer.encode(&text)?;
            if ids.len() > max_length {
                truncated += 1;
            }
            examples.push(TokenizedExample::from_token_ids(ids, max_length, pad_token_id));
        }

        if truncated > 0 {
            info!(
                "{} of {} examples truncated to {} tokens",
                truncated,
                examples.len(),
                max_length
            );
        }
        debug!(
            "Built dataset of {} examples, pad token id {}",
            examples.len(),
            pad_token_id
        );

        Ok(Self {
            examples,
            weights: records.iter().map(|r| r.weight).collect(),
            max_length,
            truncated,
        })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TokenizedExample> {
        self.examples.get(index)
    }

    pub fn examples(&self) -> &[TokenizedExample] {
        &self.examples
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Examples longer than `max_length` before truncation.
    pub fn truncated(&self) -> usize {
        self.truncated
    }

    /// Sampler drawing `len()` indices with replacement.
    pub fn sampler(&self) -> Result<WeightedSampler> {
        WeightedSampler::new(&self.weights, self.len())
    }

    /// Stack the examples at `indices` into batch tensors on `device`.
    ///
    /// Label positions outside the attention mask become [`IGNORE_INDEX`], so
    /// padding never contributes to the causal LM loss.
    pub fn collate(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let batch = indices.len();
        let seq = self.max_length;
        let mut input_ids = Vec::with_capacity(batch * seq);
        let mut attention_mask = Vec::with_capacity(batch * seq);
        let mut labels = Vec::with_capacity(batch * seq);

        for &index in indices {
            let example = self.examples.get(index).ok_or_else(|| {
                TrainError::Training(format!(
                    "sample index {} out of range for {} examples",
                    index,
                    self.len()
                ))
            })?;
            input_ids.extend_from_slice(&example.input_ids);
            attention_mask.extend_from_slice(&example.attention_mask);
            labels.extend(
                example
                    .labels
                    .iter()
                    .zip(&example.attention_mask)
                    .map(|(&label, &mask)| if mask == 1 { label } else { IGNORE_INDEX }),
            );
        }

        Ok(Batch {
            input_ids: Tensor::from_vec(input_ids, (batch, seq), device)?,
            attention_mask: Tensor::from_vec(attention_mask, (batch, seq), device)?,
            labels: Tensor::from_vec(labels, (batch, seq), device)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tokenizer::tests::word_tokenizer;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn records() -> Vec<TrainingRecord> {
        vec![
            TrainingRecord::with_weight("hi", "hello", 5.0),
            TrainingRecord::normal("how is the weather", "hello"),
            TrainingRecord::critical("hi hi hi hi hi hi hi hi", "hello hello hello hello"),
        ]
    }

    #[test]
    fn test_every_example_has_max_length() {
        let tokenizer = word_tokenizer(Some("<pad>"));
        for max_length in [4, 16, 64] {
            let dataset =
                WeightedDataset::build(&records(), &tokenizer, max_length, DEFAULT_SYSTEM_PROMPT)
                    .expect("test: build");
            assert_eq!(dataset.len(), 3);
            for example in dataset.examples() {
                assert_eq!(example.input_ids.len(), max_length);
                assert_eq!(example.attention_mask.len(), max_length);
                assert_eq!(example.labels.len(), max_length);
                let labels: Vec<i64> = example.input_ids.iter().map(|&i| i as i64).collect();
                assert_eq!(example.labels, labels);
            }
        }
    }

    #[test]
    fn test_padding_and_truncation() {
        let example = TokenizedExample::from_token_ids(vec![7, 8, 9], 5, 1);
        assert_eq!(example.input_ids, vec![7, 8, 9, 1, 1]);
        assert_eq!(example.attention_mask, vec![1, 1, 1, 0, 0]);
        assert_eq!(example.real_tokens(), 3);

        let example = TokenizedExample::from_token_ids(vec![7, 8, 9], 2, 1);
        assert_eq!(example.input_ids, vec![7, 8]);
        assert_eq!(example.attention_mask, vec![1, 1]);
    }

    #[test]
    fn test_truncation_counted() {
        let tokenizer = word_tokenizer(Some("<pad>"));
        let dataset = WeightedDataset::build(&records(), &tokenizer, 8, DEFAULT_SYSTEM_PROMPT)
            .expect("test: build");
        assert_eq!(dataset.truncated(), 3);
        assert!(dataset.examples().iter().all(|e| e.real_tokens() == 8));
    }

    #[test]
    fn test_weights_follow_records() {
        let tokenizer = word_tokenizer(None);
        let dataset = WeightedDataset::build(&records(), &tokenizer, 32, DEFAULT_SYSTEM_PROMPT)
            .expect("test: build");
        assert_eq!(dataset.weights(), &[5.0, 1.0, 10.0]);
        let sampler = dataset.sampler().expect("test: sampler");
        assert_eq!(sampler.num_samples(), 3);
        assert!(sampler.replacement());
    }

    #[test]
    fn test_sampler_frequency() {
        let weights = [10.0, 1.0, 1.0];
        let sampler = WeightedSampler::new(&weights, 3).expect("test: sampler");
        let mut rng = StdRng::seed_from_u64(42);
        let trials = 20_000;
        let mut counts = [0usize; 3];
        for _ in 0..trials {
            let draw = sampler.sample(&mut rng);
            assert_eq!(draw.len(), 3);
            for i in draw {
                counts[i] += 1;
            }
        }

        let n = (trials * 3) as f64;
        let total: f64 = weights.iter().sum();
        let chi_squared: f64 = counts
            .iter()
            .zip(weights)
            .map(|(&observed, w)| {
                let expected = n * w / total;
                (observed as f64 - expected).powi(2) / expected
            })
            .sum();
        // 2 degrees of freedom, p = 0.001
        assert!(chi_squared < 13.816, "chi-squared {} for counts {:?}", chi_squared, counts);

        let freq = counts[0] as f64 / n;
        assert!((freq - 10.0 / 12.0).abs() < 0.01, "index 0 frequency {}", freq);
    }

    #[test]
    fn test_sampler_handles_huge_weights() {
        let sampler = WeightedSampler::new(&[1e308, 1e308], 2).expect("test: sampler");
        let mut rng = StdRng::seed_from_u64(7);
        let draws: Vec<usize> = (0..2_000).flat_map(|_| sampler.sample(&mut rng)).collect();
        let zeros = draws.iter().filter(|&&i| i == 0).count();
        assert!((zeros as f64 / draws.len() as f64 - 0.5).abs() < 0.05);
    }

    #[test]
    fn test_sampler_rejects_bad_weights() {
        assert!(WeightedSampler::new(&[], 0).is_err());
        assert!(WeightedSampler::new(&[0.0, 0.0], 2).is_err());
        assert!(WeightedSampler::new(&[f64::INFINITY, 1.0], 2).is_err());
        assert!(WeightedSampler::new(&[f64::NAN, 1.0], 2).is_err());
    }

    #[test]
    fn test_collate_masks_padding_labels() {
        let tokenizer = word_tokenizer(Some("<pad>"));
        let dataset = WeightedDataset::build(&records(), &tokenizer, 64, DEFAULT_SYSTEM_PROMPT)
            .expect("test: build");
        let batch = dataset.collate(&[1, 1, 0], &Device::Cpu).expect("test: collate");
        assert_eq!(batch.input_ids.dims(), &[3, 64]);
        assert_eq!(batch.labels.dims(), &[3, 64]);

        let labels: Vec<Vec<i64>> = batch.labels.to_vec2().expect("test: labels");
        let mask: Vec<Vec<u32>> = batch.attention_mask.to_vec2().expect("test: mask");
        for (row_labels, row_mask) in labels.iter().zip(&mask) {
            for (&label, &m) in row_labels.iter().zip(row_mask) {
                assert_eq!(m == 0, label == IGNORE_INDEX);
            }
        }
        assert!(dataset.collate(&[3], &Device::Cpu).is_err());
    }
}
