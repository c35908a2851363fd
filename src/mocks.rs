use std::{path::Path, sync::Arc};

use ndarray::prelude::*;

use crate::{
    device::Device,
    errors::{Result, TileSegError},
    model::{ModelFactory, ModelSpec, SegmentationNetwork},
};

/// Deterministic stand-in for a trained network: a per-pixel linear map
/// (a 1x1 convolution) from `C` input channels to `K` class logits.
#[derive(Debug, Clone)]
pub struct PixelwiseNetwork {
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl PixelwiseNetwork {
    /// Class `k` scores the channel mean with slope `k - (K - 1) / 2`, so in
    /// the binary case bright pixels go to the second class.
    pub fn new(num_channels: usize, num_classes: usize) -> Self {
        let mid = (num_classes as f32 - 1.0) / 2.0;
        let weights = Array2::from_shape_fn((num_classes, num_channels), |(k, _)| {
            (k as f32 - mid) / num_channels.max(1) as f32
        });
        Self {
            weights,
            bias: Array1::zeros(num_classes),
        }
    }

    /// `weights` is `(K, C)`, `bias` is `(K,)`.
    pub fn with_weights(weights: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if weights.nrows() != bias.len() {
            return Err(TileSegError::Validation {
                field: "bias".to_string(),
                reason: format!("{} classes but {} biases", weights.nrows(), bias.len()),
            });
        }
        Ok(Self { weights, bias })
    }
}

impl SegmentationNetwork for PixelwiseNetwork {
    fn forward(&self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (n, c, h, w) = images.dim();
        if c != self.num_channels() {
            return Err(TileSegError::model(
                "pixelwise forward",
                format!("expected {} channels, got {c}", self.num_channels()),
            ));
        }

        let mut logits = Array4::<f32>::zeros((n, self.num_classes(), h, w));
        for (k, mut plane) in logits.axis_iter_mut(Axis(1)).enumerate() {
            plane.fill(self.bias[k]);
            for (ci, channel) in images.axis_iter(Axis(1)).enumerate() {
                plane.scaled_add(self.weights[[k, ci]], &channel);
            }
        }
        Ok(logits)
    }

    fn num_channels(&self) -> usize {
        self.weights.ncols()
    }

    fn num_classes(&self) -> usize {
        self.weights.nrows()
    }
}

/// Factory building a [`PixelwiseNetwork`] shaped after the requested [`ModelSpec`];
/// the checkpoint contents are ignored.
pub fn pixelwise_factory() -> ModelFactory {
    Arc::new(|spec: &ModelSpec, _: &Path, _: &Device| {
        Ok(Box::new(PixelwiseNetwork::new(spec.num_channels, spec.num_classes))
            as Box<dyn SegmentationNetwork>)
    })
}
