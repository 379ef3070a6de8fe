pub use model::{builder::TransformerModelBuilder, TransformerModel};

pub mod params {
    use anyhow::Result;
    use serde::{Deserialize, Serialize};

    use crate::ml::{AdamOptimizer, NodeValue, Optimizer, RngStrategy, Tensor};

    /// A learnable tensor paired with its own optimizer state.
    #[derive(Debug, Serialize, Deserialize)]
    pub struct Parameter {
        tensor: Tensor,
        solver: AdamOptimizer,
    }

    impl Parameter {
        /// Weight parameter: He-scaled normal initial values.
        pub fn normal(shape: &[usize], rng: &RngStrategy) -> Result<Self> {
            let mut tensor = Tensor::new(shape)?;
            tensor.init_normal(rng)?;
            Ok(Self {
                solver: AdamOptimizer::new(shape)?,
                tensor,
            })
        }

        /// Bias parameter: zero initial values.
        pub fn zeros(shape: &[usize]) -> Result<Self> {
            Ok(Self {
                tensor: Tensor::new(shape)?,
                solver: AdamOptimizer::new(shape)?,
            })
        }

        pub fn tensor(&self) -> &Tensor {
            &self.tensor
        }

        pub fn train_step(&mut self, learn_rate: NodeValue, step: u64) -> Result<()> {
            self.solver.update(&mut self.tensor, learn_rate, step)
        }
    }

}

pub mod dropout {
    use anyhow::{anyhow, Result};
    use serde::{Deserialize, Serialize};

    use crate::ml::{NodeValue, Rng, RngStrategy, Tensor};

    /// A dropout pattern over the last tensor dimension, redrawn only on an
    /// explicit refresh so that consecutive forward passes between refreshes
    /// reuse the same pattern. `true` marks a dropped position.
    #[derive(Debug, Serialize, Deserialize)]
    pub struct DropoutMask {
        pattern: Vec<bool>,
        rate: NodeValue,
    }

    impl DropoutMask {
        pub fn new(width: usize) -> Self {
            Self {
                pattern: vec![false; width],
                rate: 0.0,
            }
        }

        /// Redraws the pattern with one Bernoulli draw per position.
        pub fn refresh(&mut self, rate: NodeValue, rng: &RngStrategy) -> Result<()> {
            if !(0.0..1.0).contains(&rate) {
                Err(anyhow!("dropout rate must be >= 0 and < 1: rate={rate}"))?;
            }

            self.rate = rate;
            for dropped in self.pattern.iter_mut() {
                *dropped = rng.rand() < rate;
            }
            Ok(())
        }

        /// Applies the current pattern when `active` (training passes); a
        /// zero rate or inactive call passes the tensor through untouched.
        pub fn apply(&self, tensor: Tensor, active: bool) -> Result<Tensor> {
            if active && self.rate > 0.0 {
                tensor.dropout(&self.pattern, self.rate)
            } else {
                Ok(tensor)
            }
        }
    }

}

pub mod attention {
    use anyhow::Result;
    use serde::{Deserialize, Serialize};

    use crate::ml::{Checkpoints, NodeValue, RngStrategy, Tensor};

    use super::params::Parameter;

    /// Multi-head scaled dot-product attention with a learned output
    /// projection; the masked variant applies the causal mask to every
    /// head's attention scores before softmax.
    #[derive(Debug, Serialize, Deserialize)]
    pub struct MultiHeadAttention {
        heads: Vec<AttentionHead>,
        dense: Parameter,
        key_dim: usize,
        masked: bool,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct AttentionHead {
        queries: Parameter,
        keys: Parameter,
        values: Parameter,
    }

    impl AttentionHead {
        fn new(
            embedding_dim: usize,
            key_dim: usize,
            value_dim: usize,
            rng: &RngStrategy,
        ) -> Result<Self> {
            Ok(Self {
                queries: Parameter::normal(&[embedding_dim, key_dim], rng)?,
                keys: Parameter::normal(&[embedding_dim, key_dim], rng)?,
                values: Parameter::normal(&[embedding_dim, value_dim], rng)?,
            })
        }

        fn forward(
            &self,
            key_value_source: &Tensor,
            query_source: &Tensor,
            scale: NodeValue,
            masked: bool,
            checkpoints: &Checkpoints,
        ) -> Result<Tensor> {
            let queries = Tensor::matmul(query_source, self.queries.tensor(), checkpoints)?;
            let keys = Tensor::matmul(key_value_source, self.keys.tensor(), checkpoints)?;
            let values = Tensor::matmul(key_value_source, self.values.tensor(), checkpoints)?;

            let mut scores =
                Tensor::matmul(&queries, &keys.transpose()?, checkpoints)?.scale(scale);
            if masked {
                scores.mask_in_place()?;
            }

            Tensor::matmul(&scores.softmax(), &values, checkpoints)
        }

        fn train_step(&mut self, learn_rate: NodeValue, step: u64) -> Result<()> {
            self.queries.train_step(learn_rate, step)?;
            self.keys.train_step(learn_rate, step)?;
            self.values.train_step(learn_rate, step)
        }
    }

    impl MultiHeadAttention {
        pub fn new(
            embedding_dim: usize,
            key_dim: usize,
            value_dim: usize,
            head_count: usize,
            masked: bool,
            rng: &RngStrategy,
        ) -> Result<Self> {
            let heads = (0..head_count)
                .map(|_| AttentionHead::new(embedding_dim, key_dim, value_dim, rng))
                .collect::<Result<Vec<_>>>()?;

            Ok(Self {
                heads,
                dense: Parameter::normal(&[value_dim * head_count, embedding_dim], rng)?,
                key_dim,
                masked,
            })
        }

        /// Self-attention: queries, keys and values all derive from `input`.
        pub fn forward_self(&self, input: &Tensor, checkpoints: &Checkpoints) -> Result<Tensor> {
            self.forward(input, input, checkpoints)
        }

        /// Cross-attention: keys and values derive from the encoder output,
        /// queries from the decoder-side input.
        pub fn forward_cross(
            &self,
            encoder_output: &Tensor,
            queries: &Tensor,
            checkpoints: &Checkpoints,
        ) -> Result<Tensor> {
            self.forward(encoder_output, queries, checkpoints)
        }

        fn forward(
            &self,
            key_value_source: &Tensor,
            query_source: &Tensor,
            checkpoints: &Checkpoints,
        ) -> Result<Tensor> {
            let scale = 1.0 / (self.key_dim as NodeValue).sqrt();
            let head_outputs = self
                .heads
                .iter()
                .map(|head| {
                    head.forward(key_value_source, query_source, scale, self.masked, checkpoints)
                })
                .collect::<Result<Vec<_>>>()?;

            let joined = Tensor::concat(&head_outputs)?;
            Tensor::matmul(&joined, self.dense.tensor(), checkpoints)
        }

        pub fn train_step(&mut self, learn_rate: NodeValue, step: u64) -> Result<()> {
            for head in self.heads.iter_mut() {
                head.train_step(learn_rate, step)?;
            }
            self.dense.train_step(learn_rate, step)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn attention_forward_preserves_input_shape() {
            let rng = RngStrategy::testable(1234);
            let checkpoints = Checkpoints::new();
            let attention = MultiHeadAttention::new(8, 4, 4, 2, false, &rng).unwrap();

            let mut input = Tensor::new(&[2, 3, 8]).unwrap();
            input.init_normal(&rng).unwrap();

            let output = attention.forward_self(&input, &checkpoints).unwrap();
            assert_eq!(output.shape(), &[2, 3, 8]);
        }

        #[test]
        fn attention_cross_takes_keys_and_values_from_encoder_side() {
            let rng = RngStrategy::testable(1234);
            let checkpoints = Checkpoints::new();
            let attention = MultiHeadAttention::new(8, 4, 4, 2, false, &rng).unwrap();

            let mut encoder_output = Tensor::new(&[1, 3, 8]).unwrap();
            encoder_output.init_normal(&rng).unwrap();
            let mut queries = Tensor::new(&[1, 3, 8]).unwrap();
            queries.init_normal(&rng).unwrap();

            let output = attention
                .forward_cross(&encoder_output, &queries, &checkpoints)
                .unwrap();
            assert_eq!(output.shape(), &[1, 3, 8]);
        }

        #[test]
        fn masked_attention_ignores_future_positions() {
            let rng = RngStrategy::testable(1234);
            let attention = MultiHeadAttention::new(4, 2, 2, 2, true, &rng).unwrap();

            let mut input = Tensor::new(&[1, 3, 4]).unwrap();
            input.init_normal(&rng).unwrap();

            let mut perturbed = input.detached();
            for i in 0..4 {
                let shifted = perturbed.get(&[0, 2, i]).unwrap().value() + 10.0;
                perturbed
                    .set(&[0, 2, i], crate::ml::Scalar::new(shifted))
                    .unwrap();
            }

            let output = attention
                .forward_self(&input, &Checkpoints::new())
                .unwrap();
            let perturbed_output = attention
                .forward_self(&perturbed, &Checkpoints::new())
                .unwrap();

            // earlier positions must not see the change at the final position
            for position in 0..2 {
                for i in 0..4 {
                    assert_eq!(
                        output.get(&[0, position, i]).unwrap().value(),
                        perturbed_output.get(&[0, position, i]).unwrap().value(),
                        "position {position} leaked future information"
                    );
                }
            }
        }
    }
}

pub mod dense {
    use anyhow::Result;
    use serde::{Deserialize, Serialize};

    use crate::ml::{Checkpoints, NodeValue, RngStrategy, Tensor};

    use super::params::Parameter;

    /// Position-wise feed-forward block: `relu(x·W1 + b1)·W2 + b2`.
    #[derive(Debug, Serialize, Deserialize)]
    pub struct FeedForwardNetwork {
        hidden: Parameter,
        hidden_bias: Parameter,
        output: Parameter,
        output_bias: Parameter,
    }

    impl FeedForwardNetwork {
        pub fn new(embedding_dim: usize, hidden_dim: usize, rng: &RngStrategy) -> Result<Self> {
            Ok(Self {
                hidden: Parameter::normal(&[embedding_dim, hidden_dim], rng)?,
                hidden_bias: Parameter::zeros(&[hidden_dim])?,
                output: Parameter::normal(&[hidden_dim, embedding_dim], rng)?,
                output_bias: Parameter::zeros(&[embedding_dim])?,
            })
        }

        pub fn forward(&self, input: &Tensor, checkpoints: &Checkpoints) -> Result<Tensor> {
            let mut hidden = Tensor::matmul(input, self.hidden.tensor(), checkpoints)?
                .vec_add(self.hidden_bias.tensor())?;
            hidden.relu_in_place();

            Tensor::matmul(&hidden, self.output.tensor(), checkpoints)?
                .vec_add(self.output_bias.tensor())
        }

        pub fn train_step(&mut self, learn_rate: NodeValue, step: u64) -> Result<()> {
            self.hidden.train_step(learn_rate, step)?;
            self.hidden_bias.train_step(learn_rate, step)?;
            self.output.train_step(learn_rate, step)?;
            self.output_bias.train_step(learn_rate, step)
        }
    }

    /// Final projection: flattened decoder state to a probability
    /// distribution over the vocabulary.
    #[derive(Debug, Serialize, Deserialize)]
    pub struct OutputLayer {
        projection: Parameter,
    }

    impl OutputLayer {
        pub fn new(
            sequence_length: usize,
            embedding_dim: usize,
            vocab_size: usize,
            rng: &RngStrategy,
        ) -> Result<Self> {
            Ok(Self {
                projection: Parameter::normal(&[embedding_dim * sequence_length, vocab_size], rng)?,
            })
        }

        pub fn forward(&self, input: &Tensor, checkpoints: &Checkpoints) -> Result<Tensor> {
            let flattened = input.flatten()?;
            let projected = Tensor::matmul(&flattened, self.projection.tensor(), checkpoints)?;
            Ok(projected.softmax())
        }

        pub fn train_step(&mut self, learn_rate: NodeValue, step: u64) -> Result<()> {
            self.projection.train_step(learn_rate, step)
        }
    }

}

pub mod blocks {
    use anyhow::Result;
    use serde::{Deserialize, Serialize};

    use crate::ml::{Checkpoints, NodeValue, RngStrategy, Tensor};

    use super::{attention::MultiHeadAttention, dense::FeedForwardNetwork, dropout::DropoutMask};

    /// Encoder layer: self-attention and feed-forward sublayers, each
    /// followed by its own dropout mask and an add + normalize residual.
    #[derive(Debug, Serialize, Deserialize)]
    pub struct EncoderLayer {
        attention: MultiHeadAttention,
        feed_forward: FeedForwardNetwork,
        dropout: [DropoutMask; 2],
    }

    impl EncoderLayer {
        pub fn new(
            embedding_dim: usize,
            key_dim: usize,
            value_dim: usize,
            head_count: usize,
            hidden_dim: usize,
            rng: &RngStrategy,
        ) -> Result<Self> {
            Ok(Self {
                attention: MultiHeadAttention::new(
                    embedding_dim,
                    key_dim,
                    value_dim,
                    head_count,
                    false,
                    rng,
                )?,
                feed_forward: FeedForwardNetwork::new(embedding_dim, hidden_dim, rng)?,
                dropout: [DropoutMask::new(embedding_dim), DropoutMask::new(embedding_dim)],
            })
        }

        pub fn forward(
            &self,
            input: &Tensor,
            is_training: bool,
            checkpoints: &Checkpoints,
        ) -> Result<Tensor> {
            let attended = self.attention.forward_self(input, checkpoints)?;
            let attended = self.dropout[0].apply(attended, is_training)?;
            let attended = Tensor::add_norm(input, &attended, checkpoints)?;

            let output = self.feed_forward.forward(&attended, checkpoints)?;
            let output = self.dropout[1].apply(output, is_training)?;
            Tensor::add_norm(&attended, &output, checkpoints)
        }

        pub fn refresh_dropout(&mut self, rate: NodeValue, rng: &RngStrategy) -> Result<()> {
            for mask in self.dropout.iter_mut() {
                mask.refresh(rate, rng)?;
            }
            Ok(())
        }

        pub fn train_step(&mut self, learn_rate: NodeValue, step: u64) -> Result<()> {
            self.attention.train_step(learn_rate, step)?;
            self.feed_forward.train_step(learn_rate, step)
        }
    }

    /// Decoder layer: masked self-attention, cross-attention over the
    /// encoder output, then feed-forward, each sublayer with dropout and an
    /// add + normalize residual.
    #[derive(Debug, Serialize, Deserialize)]
    pub struct DecoderLayer {
        masked_attention: MultiHeadAttention,
        cross_attention: MultiHeadAttention,
        feed_forward: FeedForwardNetwork,
        dropout: [DropoutMask; 3],
    }

    impl DecoderLayer {
        pub fn new(
            embedding_dim: usize,
            key_dim: usize,
            value_dim: usize,
            head_count: usize,
            hidden_dim: usize,
            rng: &RngStrategy,
        ) -> Result<Self> {
            Ok(Self {
                masked_attention: MultiHeadAttention::new(
                    embedding_dim,
                    key_dim,
                    value_dim,
                    head_count,
                    true,
                    rng,
                )?,
                cross_attention: MultiHeadAttention::new(
                    embedding_dim,
                    key_dim,
                    value_dim,
                    head_count,
                    false,
                    rng,
                )?,
                feed_forward: FeedForwardNetwork::new(embedding_dim, hidden_dim, rng)?,
                dropout: [
                    DropoutMask::new(embedding_dim),
                    DropoutMask::new(embedding_dim),
                    DropoutMask::new(embedding_dim),
                ],
            })
        }

        pub fn forward(
            &self,
            encoder_output: &Tensor,
            input: &Tensor,
            is_training: bool,
            checkpoints: &Checkpoints,
        ) -> Result<Tensor> {
            let masked = self.masked_attention.forward_self(input, checkpoints)?;
            let masked = self.dropout[0].apply(masked, is_training)?;
            let masked = Tensor::add_norm(input, &masked, checkpoints)?;

            let attended = self
                .cross_attention
                .forward_cross(encoder_output, &masked, checkpoints)?;
            let attended = self.dropout[1].apply(attended, is_training)?;
            let attended = Tensor::add_norm(&masked, &attended, checkpoints)?;

            let output = self.feed_forward.forward(&attended, checkpoints)?;
            let output = self.dropout[2].apply(output, is_training)?;
            Tensor::add_norm(&attended, &output, checkpoints)
        }

        pub fn refresh_dropout(&mut self, rate: NodeValue, rng: &RngStrategy) -> Result<()> {
            for mask in self.dropout.iter_mut() {
                mask.refresh(rate, rng)?;
            }
            Ok(())
        }

        pub fn train_step(&mut self, learn_rate: NodeValue, step: u64) -> Result<()> {
            self.masked_attention.train_step(learn_rate, step)?;
            self.cross_attention.train_step(learn_rate, step)?;
            self.feed_forward.train_step(learn_rate, step)
        }
    }

}

pub mod stacks {
    use anyhow::Result;
    use serde::{Deserialize, Serialize};

    use crate::ml::{Checkpoints, NodeValue, RngStrategy, Tensor};

    use super::blocks::{DecoderLayer, EncoderLayer};

    #[derive(Debug, Serialize, Deserialize)]
    pub struct EncoderStack {
        layers: Vec<EncoderLayer>,
    }

    impl EncoderStack {
        pub fn new(
            layer_count: usize,
            embedding_dim: usize,
            key_dim: usize,
            value_dim: usize,
            head_count: usize,
            hidden_dim: usize,
            rng: &RngStrategy,
        ) -> Result<Self> {
            let layers = (0..layer_count)
                .map(|_| {
                    EncoderLayer::new(embedding_dim, key_dim, value_dim, head_count, hidden_dim, rng)
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Self { layers })
        }

        pub fn forward(
            &self,
            embeddings: &Tensor,
            is_training: bool,
            checkpoints: &Checkpoints,
        ) -> Result<Tensor> {
            let mut output = embeddings.clone();
            for layer in self.layers.iter() {
                output = layer.forward(&output, is_training, checkpoints)?;
            }
            Ok(output)
        }

        pub fn refresh_dropout(&mut self, rate: NodeValue, rng: &RngStrategy) -> Result<()> {
            for layer in self.layers.iter_mut() {
                layer.refresh_dropout(rate, rng)?;
            }
            Ok(())
        }

        pub fn train_step(&mut self, learn_rate: NodeValue, step: u64) -> Result<()> {
            for layer in self.layers.iter_mut() {
                layer.train_step(learn_rate, step)?;
            }
            Ok(())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct DecoderStack {
        layers: Vec<DecoderLayer>,
    }

    impl DecoderStack {
        pub fn new(
            layer_count: usize,
            embedding_dim: usize,
            key_dim: usize,
            value_dim: usize,
            head_count: usize,
            hidden_dim: usize,
            rng: &RngStrategy,
        ) -> Result<Self> {
            let layers = (0..layer_count)
                .map(|_| {
                    DecoderLayer::new(embedding_dim, key_dim, value_dim, head_count, hidden_dim, rng)
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Self { layers })
        }

        pub fn forward(
            &self,
            encoder_output: &Tensor,
            embeddings: &Tensor,
            is_training: bool,
            checkpoints: &Checkpoints,
        ) -> Result<Tensor> {
            let mut output = embeddings.clone();
            for layer in self.layers.iter() {
                output = layer.forward(encoder_output, &output, is_training, checkpoints)?;
            }
            Ok(output)
        }

        pub fn refresh_dropout(&mut self, rate: NodeValue, rng: &RngStrategy) -> Result<()> {
            for layer in self.layers.iter_mut() {
                layer.refresh_dropout(rate, rng)?;
            }
            Ok(())
        }

        pub fn train_step(&mut self, learn_rate: NodeValue, step: u64) -> Result<()> {
            for layer in self.layers.iter_mut() {
                layer.train_step(learn_rate, step)?;
            }
            Ok(())
        }
    }

}

pub mod embedding {
    use anyhow::{anyhow, Context, Result};
    use itertools::Itertools;
    use serde::{Deserialize, Serialize};

    use crate::ml::{NodeValue, RngStrategy, Scalar, Tensor};

    use super::{dropout::DropoutMask, params::Parameter};

    /// Learned projection from a corpus-derived vocabulary onto the
    /// embedding space, with sinusoidal positional encoding added per word
    /// position.
    #[derive(Debug, Serialize, Deserialize)]
    pub struct Embedding {
        vocab: Vec<String>,
        table: Parameter,
        dropout: DropoutMask,
        embedding_dim: usize,
        sequence_length: usize,
    }

    impl Embedding {
        /// Builds the vocabulary in first-seen order (lowercased) and
        /// initializes the projection table.
        pub fn new(
            embedding_dim: usize,
            sequence_length: usize,
            sentences: &[Vec<String>],
            rng: &RngStrategy,
        ) -> Result<Self> {
            let vocab: Vec<String> = sentences
                .iter()
                .flatten()
                .map(|word| word.to_lowercase())
                .unique()
                .collect();
            if vocab.is_empty() {
                Err(anyhow!("vocabulary requires a non-empty corpus"))?;
            }

            Ok(Self {
                table: Parameter::normal(&[vocab.len(), embedding_dim], rng)?,
                dropout: DropoutMask::new(embedding_dim),
                vocab,
                embedding_dim,
                sequence_length,
            })
        }

        pub fn vocab_size(&self) -> usize {
            self.vocab.len()
        }

        pub fn sequence_length(&self) -> usize {
            self.sequence_length
        }

        /// Embeds a batch of sentences into a `[batch, seq_len, embed]`
        /// tensor. Embedded positions share the table's scalars, keeping the
        /// table reachable from downstream gradients; positions past each
        /// sentence's end stay zero.
        pub fn embed(&self, sentences: &[Vec<String>], use_dropout: bool) -> Result<Tensor> {
            let batch_size = sentences.len();
            let mut embedded =
                Tensor::new(&[batch_size, self.sequence_length, self.embedding_dim])?;

            for (s, sentence) in sentences.iter().enumerate() {
                if sentence.len() > self.sequence_length {
                    Err(anyhow!(
                        "sentence exceeds sequence length: length={}, max={}",
                        sentence.len(),
                        self.sequence_length
                    ))?;
                }

                for (position, word) in sentence.iter().enumerate() {
                    let row = self.word_index(word)?;
                    for i in 0..self.embedding_dim {
                        let value = self.table.tensor().get(&[row, i])?;
                        let encoded = value + self.positional_encoding(position, i);
                        embedded.set(&[s, position, i], encoded)?;
                    }
                }
            }

            self.dropout.apply(embedded, use_dropout)
        }

        /// Sinusoidal encoding from "Attention is all you need":
        /// `sin(pos / 10000^(i/d))` on even components, `cos` with the
        /// preceding even exponent on odd ones.
        fn positional_encoding(&self, position: usize, i: usize) -> NodeValue {
            let d = self.embedding_dim as NodeValue;
            let position = position as NodeValue;
            if i % 2 == 0 {
                (position / (10000.0 as NodeValue).powf(i as NodeValue / d)).sin()
            } else {
                (position / (10000.0 as NodeValue).powf((i - 1) as NodeValue / d)).cos()
            }
        }

        /// Accumulates cross-entropy loss for decode position `w` against
        /// every batch sentence long enough to have a word there:
        /// `loss -= log p[s, 0, correct]`.
        pub fn accumulate_loss(
            &self,
            output: &Tensor,
            target_sentences: &[Vec<String>],
            w: usize,
            loss: &mut Scalar,
        ) -> Result<()> {
            for (s, sentence) in target_sentences.iter().enumerate() {
                let Some(word) = sentence.get(w) else {
                    continue;
                };
                let index = self.word_index(word)?;
                let probability = output.get(&[s, 0, index])?;
                *loss = &*loss - &probability.log();
            }
            Ok(())
        }

        pub fn words(&self, indices: &[usize]) -> Result<Vec<String>> {
            indices
                .iter()
                .map(|&index| {
                    self.vocab
                        .get(index)
                        .cloned()
                        .ok_or_else(|| anyhow!("no vocabulary entry at index {index}"))
                })
                .collect()
        }

        pub fn word_index(&self, word: &str) -> Result<usize> {
            let word = word.to_lowercase();
            self.vocab
                .iter()
                .position(|known| *known == word)
                .with_context(|| format!("word not in vocabulary: {word}"))
        }

        /// First word of `sentences` missing from the vocabulary, if any.
        pub fn find_unknown_word<'a>(&self, sentences: &'a [Vec<String>]) -> Option<&'a str> {
            sentences
                .iter()
                .flatten()
                .find(|word| self.word_index(word).is_err())
                .map(|word| word.as_str())
        }

        pub fn refresh_dropout(&mut self, rate: NodeValue, rng: &RngStrategy) -> Result<()> {
            self.dropout.refresh(rate, rng)
        }

        pub fn train_step(&mut self, learn_rate: NodeValue, step: u64) -> Result<()> {
            self.table.train_step(learn_rate, step)
        }
    }

}

pub mod model {
    use anyhow::{anyhow, Result};
    use serde::{Deserialize, Serialize};
    use tracing::info;

    use crate::ml::{Checkpoints, NodeValue, RngStrategy, Scalar};

    use super::{
        dense::OutputLayer,
        embedding::Embedding,
        stacks::{DecoderStack, EncoderStack},
        text,
    };

    /// Sequence-to-sequence transformer trained by greedy step-wise decoding
    /// against a parallel corpus. Owns its checkpoint registry and random
    /// source; nothing is process-global.
    #[derive(Debug, Serialize, Deserialize)]
    pub struct TransformerModel {
        source_embedding: Embedding,
        target_embedding: Embedding,
        encoder: EncoderStack,
        decoder: DecoderStack,
        output: OutputLayer,
        sequence_length: usize,
        dropout_rate: NodeValue,
        rng: RngStrategy,
        #[serde(skip)]
        checkpoints: Checkpoints,
    }

    impl TransformerModel {
        pub fn new_builder() -> builder::TransformerModelBuilder {
            builder::TransformerModelBuilder::default()
        }

        pub fn sequence_length(&self) -> usize {
            self.sequence_length
        }

        /// Trains on a parallel corpus: per batch, repeated forward +
        /// backward + optimizer cycles with the optimizer step index
        /// restarting at 1. Returns the final training loss.
        pub fn train(
            &mut self,
            source_sentences: &[Vec<String>],
            target_sentences: &[Vec<String>],
            learn_rate: NodeValue,
            epochs: usize,
            training_steps: usize,
            batch_size: usize,
        ) -> Result<NodeValue> {
            if source_sentences.len() != target_sentences.len() {
                Err(anyhow!("number of sentence pairs must be equal"))?;
            }
            if batch_size == 0 || batch_size > source_sentences.len() {
                Err(anyhow!("invalid batch size: batch_size={batch_size}"))?;
            }

            let target_sentences = text::insert_start_and_stop_tokens(target_sentences);
            let mut last_loss = 0.0;

            for epoch in 1..=epochs {
                for batch in 0..source_sentences.len() / batch_size {
                    let range = batch * batch_size..(batch + 1) * batch_size;
                    let source_batch = &source_sentences[range.clone()];
                    let target_batch = &target_sentences[range];

                    for step in 1..=training_steps as u64 {
                        self.refresh_dropout()?;
                        let (loss, _) = self.decode_batch(source_batch, Some(target_batch), true)?;

                        last_loss = loss.value();
                        loss.backward(1.0);
                        self.checkpoints.replay()?;
                        self.train_step(learn_rate, step)?;

                        info!(
                            "epoch: {epoch}, batch: {}, step: {step}, loss: {last_loss}",
                            batch + 1
                        );
                    }
                }
            }

            Ok(last_loss)
        }

        /// Greedy inference decode of a single source sentence; the start
        /// and stop tokens are stripped from the returned words.
        pub fn translate(&self, sentence: &[String]) -> Result<Vec<String>> {
            if sentence.len() > self.sequence_length {
                Err(anyhow!(
                    "sentence exceeds sequence length: length={}, max={}",
                    sentence.len(),
                    self.sequence_length
                ))?;
            }
            let batch = [sentence.to_vec()];
            if let Some(unknown) = self.source_embedding.find_unknown_word(&batch) {
                Err(anyhow!("word not in vocabulary: {unknown}"))?;
            }

            let (_, decoded) = self.decode_batch(&batch, None, false)?;
            let decoded = decoded.into_iter().next().expect("batch of one");
            Ok(text::strip_sentence_markers(decoded))
        }

        /// One greedy decode over a batch: embed and encode the source once,
        /// then generate a word per step for every sentence, embedding the
        /// growing decoded prefix each time. With a target batch, the
        /// cross-entropy loss accumulates per step and is normalized by
        /// `sequence_length * batch` at the end.
        fn decode_batch(
            &self,
            source_batch: &[Vec<String>],
            target_batch: Option<&[Vec<String>]>,
            is_training: bool,
        ) -> Result<(Scalar, Vec<Vec<String>>)> {
            self.checkpoints.clear();
            let mut loss = Scalar::new(0.0);

            let source_embeddings = self.source_embedding.embed(source_batch, is_training)?;
            let encoder_output =
                self.encoder
                    .forward(&source_embeddings, is_training, &self.checkpoints)?;

            let mut decoded = text::start_sentences(source_batch.len());
            let step_count = match target_batch {
                Some(target) => text::max_sentence_length(target),
                None => self.sequence_length,
            };

            for w in 1..step_count {
                let target_embeddings = self.target_embedding.embed(&decoded, is_training)?;
                let decoder_output = self.decoder.forward(
                    &encoder_output,
                    &target_embeddings,
                    is_training,
                    &self.checkpoints,
                )?;
                let output = self.output.forward(&decoder_output, &self.checkpoints)?;

                if let Some(target) = target_batch {
                    self.target_embedding
                        .accumulate_loss(&output, target, w, &mut loss)?;
                }

                let indices = output.max_indices()?;
                let words = self.target_embedding.words(&indices)?;
                text::append_words(&mut decoded, &words);
            }

            if target_batch.is_some() {
                let normalization = (self.sequence_length * source_batch.len()) as NodeValue;
                loss = &loss / normalization;
            }

            Ok((loss, decoded))
        }

        fn refresh_dropout(&mut self) -> Result<()> {
            self.source_embedding
                .refresh_dropout(self.dropout_rate, &self.rng)?;
            self.target_embedding
                .refresh_dropout(self.dropout_rate, &self.rng)?;
            self.encoder.refresh_dropout(self.dropout_rate, &self.rng)?;
            self.decoder.refresh_dropout(self.dropout_rate, &self.rng)
        }

        fn train_step(&mut self, learn_rate: NodeValue, step: u64) -> Result<()> {
            self.source_embedding.train_step(learn_rate, step)?;
            self.target_embedding.train_step(learn_rate, step)?;
            self.encoder.train_step(learn_rate, step)?;
            self.decoder.train_step(learn_rate, step)?;
            self.output.train_step(learn_rate, step)
        }

        pub fn to_json(&self) -> Result<String> {
            Ok(serde_json::to_string(self)?)
        }

        pub fn from_json(json: &str) -> Result<Self> {
            Ok(serde_json::from_str(json)?)
        }
    }

    pub mod builder {
        use super::*;

        pub struct TransformerModelBuilder {
            layer_count: usize,
            embedding_dim: usize,
            key_dim: usize,
            value_dim: usize,
            head_count: usize,
            hidden_dim: usize,
            dropout_rate: NodeValue,
            rng: RngStrategy,
        }

        impl Default for TransformerModelBuilder {
            fn default() -> Self {
                Self {
                    layer_count: 2,
                    embedding_dim: 8,
                    key_dim: 4,
                    value_dim: 4,
                    head_count: 2,
                    hidden_dim: 16,
                    dropout_rate: 0.0,
                    rng: RngStrategy::default(),
                }
            }
        }

        impl TransformerModelBuilder {
            pub fn with_layer_count(mut self, layer_count: usize) -> Self {
                self.layer_count = layer_count;
                self
            }

            pub fn with_embedding_dim(mut self, embedding_dim: usize) -> Self {
                self.embedding_dim = embedding_dim;
                self
            }

            pub fn with_head_dims(mut self, key_dim: usize, value_dim: usize) -> Self {
                self.key_dim = key_dim;
                self.value_dim = value_dim;
                self
            }

            pub fn with_head_count(mut self, head_count: usize) -> Self {
                self.head_count = head_count;
                self
            }

            pub fn with_hidden_dim(mut self, hidden_dim: usize) -> Self {
                self.hidden_dim = hidden_dim;
                self
            }

            pub fn with_dropout_rate(mut self, dropout_rate: NodeValue) -> Self {
                self.dropout_rate = dropout_rate;
                self
            }

            pub fn with_rng(mut self, rng: RngStrategy) -> Self {
                self.rng = rng;
                self
            }

            /// Sizes the model to the corpus: sequence length covers the
            /// longest sentence on either side (after start/stop token
            /// insertion on the target side), vocabularies come from the
            /// corpus words.
            pub fn build(
                self,
                source_sentences: &[Vec<String>],
                target_sentences: &[Vec<String>],
            ) -> Result<TransformerModel> {
                if !(0.0..1.0).contains(&self.dropout_rate) {
                    Err(anyhow!(
                        "dropout rate must be >= 0 and < 1: rate={}",
                        self.dropout_rate
                    ))?;
                }

                let target_sentences = text::insert_start_and_stop_tokens(target_sentences);
                let sequence_length =
                    text::sequence_length(source_sentences, &target_sentences);

                let source_embedding = Embedding::new(
                    self.embedding_dim,
                    sequence_length,
                    source_sentences,
                    &self.rng,
                )?;
                let target_embedding = Embedding::new(
                    self.embedding_dim,
                    sequence_length,
                    &target_sentences,
                    &self.rng,
                )?;
                let encoder = EncoderStack::new(
                    self.layer_count,
                    self.embedding_dim,
                    self.key_dim,
                    self.value_dim,
                    self.head_count,
                    self.hidden_dim,
                    &self.rng,
                )?;
                let decoder = DecoderStack::new(
                    self.layer_count,
                    self.embedding_dim,
                    self.key_dim,
                    self.value_dim,
                    self.head_count,
                    self.hidden_dim,
                    &self.rng,
                )?;
                let output = OutputLayer::new(
                    sequence_length,
                    self.embedding_dim,
                    target_embedding.vocab_size(),
                    &self.rng,
                )?;

                Ok(TransformerModel {
                    source_embedding,
                    target_embedding,
                    encoder,
                    decoder,
                    output,
                    sequence_length,
                    dropout_rate: self.dropout_rate,
                    rng: self.rng,
                    checkpoints: Checkpoints::new(),
                })
            }
        }
    }

}

pub mod text {
    pub const START_TOKEN: &str = "<";
    pub const STOP_TOKEN: &str = ">";

    /// Splits a raw sentence into lowercase word tokens; `?` and `!` become
    /// their own tokens, `.` is dropped.
    pub fn process_sentence(line: &str) -> Vec<String> {
        line.to_lowercase()
            .replace('?', " ?")
            .replace('!', " !")
            .replace('.', "")
            .split_whitespace()
            .map(|word| word.to_string())
            .collect()
    }

    /// Parses a tab-separated parallel corpus, one sentence pair per line,
    /// up to `max_sentences` pairs. A trailing `?` or `!` is kept as a word
    /// token on both sides.
    pub fn parse_corpus(
        corpus: &str,
        max_sentences: usize,
    ) -> (Vec<Vec<String>>, Vec<Vec<String>>) {
        let mut source_sentences = vec![];
        let mut target_sentences = vec![];

        for line in corpus.lines().take(max_sentences) {
            let line = line.to_lowercase();
            let is_question = line.contains('?');
            let is_exclamation = line.contains('!');

            let mut parts = line
                .split(['.', '?', '!', '\t'])
                .filter(|part| !part.trim().is_empty());
            let (Some(source), Some(target)) = (parts.next(), parts.next()) else {
                continue;
            };

            let punctuation = if is_question {
                Some("?")
            } else if is_exclamation {
                Some("!")
            } else {
                None
            };

            let tokenize = |part: &str| {
                let mut words: Vec<String> =
                    part.split_whitespace().map(|word| word.to_string()).collect();
                if let Some(token) = punctuation {
                    words.push(token.to_string());
                }
                words
            };

            source_sentences.push(tokenize(source));
            target_sentences.push(tokenize(target));
        }

        (source_sentences, target_sentences)
    }

    /// Brackets every sentence with the start/stop tokens; already-bracketed
    /// sentences pass through unchanged.
    pub fn insert_start_and_stop_tokens(sentences: &[Vec<String>]) -> Vec<Vec<String>> {
        sentences
            .iter()
            .map(|sentence| {
                let mut sentence = sentence.clone();
                if sentence.first().map(|w| w.as_str()) != Some(START_TOKEN) {
                    sentence.insert(0, START_TOKEN.to_string());
                }
                if sentence.last().map(|w| w.as_str()) != Some(STOP_TOKEN) {
                    sentence.push(STOP_TOKEN.to_string());
                }
                sentence
            })
            .collect()
    }

    /// Longest sentence length across both sides of a parallel corpus.
    pub fn sequence_length(
        source_sentences: &[Vec<String>],
        target_sentences: &[Vec<String>],
    ) -> usize {
        max_sentence_length(source_sentences).max(max_sentence_length(target_sentences))
    }

    pub fn max_sentence_length(sentences: &[Vec<String>]) -> usize {
        sentences
            .iter()
            .map(|sentence| sentence.len())
            .max()
            .unwrap_or(0)
    }

    /// Seeds a decode batch: every sentence starts as the start token alone.
    pub fn start_sentences(batch_size: usize) -> Vec<Vec<String>> {
        vec![vec![START_TOKEN.to_string()]; batch_size]
    }

    /// Appends one decoded word per sentence, skipping sentences that have
    /// already produced the stop token.
    pub fn append_words(sentences: &mut [Vec<String>], words: &[String]) {
        for (sentence, word) in sentences.iter_mut().zip(words.iter()) {
            if sentence.last().map(|w| w.as_str()) == Some(STOP_TOKEN) {
                continue;
            }
            sentence.push(word.clone());
        }
    }

    /// Drops the decode markers from a finished sentence.
    pub fn strip_sentence_markers(sentence: Vec<String>) -> Vec<String> {
        sentence
            .into_iter()
            .filter(|word| word != START_TOKEN && word != STOP_TOKEN)
            .collect()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn process_sentence_tokenizes_punctuation() {
            assert_eq!(
                process_sentence("How are You?"),
                vec!["how", "are", "you", "?"]
            );
            assert_eq!(process_sentence("Stop now!"), vec!["stop", "now", "!"]);
            assert_eq!(process_sentence("Fine."), vec!["fine"]);
        }

        #[test]
        fn parse_corpus_splits_tab_separated_pairs() {
            let corpus = "Go now.\tVe ahora.\nReally?\tEn serio?\nSkip me\n";
            let (source, target) = parse_corpus(corpus, 10);

            assert_eq!(source.len(), 2);
            assert_eq!(source[0], vec!["go", "now"]);
            assert_eq!(target[0], vec!["ve", "ahora"]);
            assert_eq!(source[1], vec!["really", "?"]);
            assert_eq!(target[1], vec!["en", "serio", "?"]);
        }

        #[test]
        fn parse_corpus_honors_sentence_limit() {
            let corpus = "a.\tb.\nc.\td.\ne.\tf.\n";
            let (source, _) = parse_corpus(corpus, 2);
            assert_eq!(source.len(), 2);
        }

        #[test]
        fn start_and_stop_token_insertion_is_idempotent() {
            let sentences = vec![vec!["hola".to_string()]];
            let bracketed = insert_start_and_stop_tokens(&sentences);
            assert_eq!(bracketed[0], vec!["<", "hola", ">"]);

            let twice = insert_start_and_stop_tokens(&bracketed);
            assert_eq!(twice, bracketed);
        }

        #[test]
        fn append_words_stops_at_the_stop_token() {
            let mut sentences = vec![
                vec!["<".to_string(), "hola".to_string()],
                vec!["<".to_string(), ">".to_string()],
            ];
            let words = vec!["mundo".to_string(), "extra".to_string()];
            append_words(&mut sentences, &words);

            assert_eq!(sentences[0], vec!["<", "hola", "mundo"]);
            assert_eq!(sentences[1], vec!["<", ">"]);
        }

        #[test]
        fn strip_sentence_markers_removes_decode_tokens() {
            let sentence = vec![
                "<".to_string(),
                "hola".to_string(),
                "mundo".to_string(),
                ">".to_string(),
            ];
            assert_eq!(strip_sentence_markers(sentence), vec!["hola", "mundo"]);
        }

        #[test]
        fn sequence_length_spans_both_corpus_sides() {
            let source = vec![vec!["a".to_string(), "b".to_string()]];
            let target = vec![vec!["x".to_string(), "y".to_string(), "z".to_string()]];
            assert_eq!(sequence_length(&source, &target), 3);
            assert_eq!(max_sentence_length(&source), 2);
        }
    }
}
