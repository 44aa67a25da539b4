//! # Conv + Batch Norm
//!
//! Every convolution in the network is followed by a batch norm, and every
//! one is built through [`ConvNormConfig`]: the conv weights are drawn from
//! [`conv_initializer`], the norm starts as the identity (``gamma = 1``,
//! ``beta = 0``, running mean 0, running variance 1).

use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer};
use burn::prelude::{Backend, Tensor};

/// Variance-scaling conv initializer.
///
/// ``N(0, sqrt(2 / (kernel_height * kernel_width * out_channels)))``
pub fn conv_initializer(
    kernel_size: [usize; 2],
    out_channels: usize,
) -> Initializer {
    let n = kernel_size[0] * kernel_size[1] * out_channels;
    Initializer::Normal {
        mean: 0.0,
        std: (2.0 / n as f64).sqrt(),
    }
}

/// Geometry shared by [`ConvNormConfig`] and [`ConvNorm`].
pub trait ConvNormMeta {
    /// Planes read.
    fn in_channels(&self) -> usize;

    /// Planes written.
    fn out_channels(&self) -> usize;

    /// ``[stride_h, stride_w]``.
    fn stride(&self) -> &[usize; 2];

    /// ``[dilation_h, dilation_w]``.
    fn dilation(&self) -> &[usize; 2];

    /// ``[kernel_h, kernel_w]``.
    fn kernel_size(&self) -> &[usize; 2];
}

/// [`ConvNorm`] Config; a thin wrapper over the conv's own config.
#[derive(Config, Debug)]
pub struct ConvNormConfig {
    /// Convolution geometry; the norm width follows ``channels[1]``.
    pub conv: Conv2dConfig,
}

impl From<Conv2dConfig> for ConvNormConfig {
    fn from(conv: Conv2dConfig) -> Self {
        Self { conv }
    }
}

impl ConvNormMeta for ConvNormConfig {
    fn in_channels(&self) -> usize {
        self.conv.channels[0]
    }

    fn out_channels(&self) -> usize {
        self.conv.channels[1]
    }

    fn stride(&self) -> &[usize; 2] {
        &self.conv.stride
    }

    fn dilation(&self) -> &[usize; 2] {
        &self.conv.dilation
    }

    fn kernel_size(&self) -> &[usize; 2] {
        &self.conv.kernel_size
    }
}

impl ConvNormConfig {
    /// Build the layer.
    ///
    /// Any initializer already set on the conv config is replaced.
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> ConvNorm<B> {
        let planes = self.out_channels();
        let initializer = conv_initializer(self.conv.kernel_size, planes);
        let conv = self.conv.with_initializer(initializer);

        ConvNorm {
            conv: conv.init(device),
            norm: BatchNormConfig::new(planes).init(device),
        }
    }
}

/// A [`Conv2d`] whose output passes through a [`BatchNorm`].
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    /// The convolution.
    pub conv: Conv2d<B>,

    /// The batch norm over the conv's output planes.
    pub norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvNormMeta for ConvNorm<B> {
    fn in_channels(&self) -> usize {
        let [_, per_group, _, _] = self.conv.weight.dims();
        per_group * self.conv.groups
    }

    fn out_channels(&self) -> usize {
        self.conv.weight.dims()[0]
    }

    fn stride(&self) -> &[usize; 2] {
        &self.conv.stride
    }

    fn dilation(&self) -> &[usize; 2] {
        &self.conv.dilation
    }

    fn kernel_size(&self) -> &[usize; 2] {
        &self.conv.kernel_size
    }
}

impl<B: Backend> ConvNorm<B> {
    /// ``norm(conv(input))``.
    ///
    /// Only the batch and plane dims are checked; the spatial dims depend on
    /// the conv's padding mode.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [batch] = unpack_shape_contract!(
            ["batch", "planes", "height", "width"],
            &input,
            &["batch"],
            &[("planes", self.in_channels())]
        );

        let x = self.norm.forward(self.conv.forward(input));

        assert_shape_contract_periodically!(
            ["batch", "planes", "height", "width"],
            &x,
            &[("batch", batch), ("planes", self.out_channels())]
        );
        x
    }

    /// Number of trainable scalars held by this layer.
    ///
    /// Conv weight and bias, norm scale and shift; running statistics are not counted.
    pub fn num_weights(&self) -> usize {
        let bias = self
            .conv
            .bias
            .as_ref()
            .map_or(0, |bias| bias.shape().num_elements());
        self.conv.weight.shape().num_elements()
            + bias
            + self.norm.gamma.shape().num_elements()
            + self.norm.beta.shape().num_elements()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::PaddingConfig2d;

    type B = NdArray<f32>;

    fn strided_3x3(channels: [usize; 2]) -> ConvNormConfig {
        Conv2dConfig::new(channels, [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .into()
    }

    #[test]
    fn test_conv_initializer() {
        match conv_initializer([3, 3], 64) {
            Initializer::Normal { mean, std } => {
                assert_eq!(mean, 0.0);
                assert!((std - (2.0f64 / 576.0).sqrt()).abs() < 1e-12);
            }
            other => panic!("unexpected initializer {other:?}"),
        }
    }

    #[test]
    fn test_config_geometry() {
        let config = strided_3x3([2, 4]);
        assert_eq!((config.in_channels(), config.out_channels()), (2, 4));
        assert_eq!(config.stride(), &[2, 2]);
        assert_eq!(config.dilation(), &[1, 1]);
        assert_eq!(config.kernel_size(), &[3, 3]);
    }

    #[test]
    fn test_forward_and_weight_count() {
        let device = Default::default();
        let layer: ConvNorm<B> = strided_3x3([3, 6]).init(&device);

        assert_eq!((layer.in_channels(), layer.out_channels()), (3, 6));
        assert_eq!(layer.num_weights(), 6 * 3 * 3 * 3 + 2 * 6);

        let output = layer.forward(Tensor::ones([2, 3, 9, 9], &device));
        assert_eq!(output.dims(), [2, 6, 5, 5]);
    }

    #[test]
    fn test_bias_is_counted() {
        let layer: ConvNorm<B> = ConvNormConfig::from(Conv2dConfig::new([2, 3], [1, 1]))
            .init(&Default::default());
        assert_eq!(layer.num_weights(), 2 * 3 + 3 + 2 * 3);
    }

    #[test]
    fn test_norm_starts_as_identity() {
        let device = Default::default();
        let layer: ConvNorm<B> = strided_3x3([2, 5]).init(&device);

        let expect = |tensor: Tensor<B, 1>, value: f32| {
            tensor
                .to_data()
                .assert_eq(&Tensor::<B, 1>::full([5], value, &device).to_data(), true)
        };
        expect(layer.norm.gamma.val(), 1.0);
        expect(layer.norm.beta.val(), 0.0);
        expect(layer.norm.running_mean.value(), 0.0);
        expect(layer.norm.running_var.value(), 1.0);
    }
}
