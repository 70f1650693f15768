//! The boundary between the optimization loop and the feature/loss network.
//!
//! The loop only relies on [`LossNetwork`], so any network that honors the
//! weighting contract can be substituted. [`StyleNetwork`] is a CPU
//! implementation over a plain stack of convolution and pooling layers, loaded
//! through a [`NetworkLoader`].

mod file;
mod layers;
mod style;

pub use file::{FileLoader, NetworkFile};
pub use layers::Conv2d;
pub use style::StyleNetwork;

use crate::{weights::LayerWeights, Error};
use ndarray::{Array1, Array4};
use std::{fmt, str::FromStr};

/// Subsampling scheme used by the pooling layers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolMethod {
    Max,
    Avg,
}

impl Default for PoolMethod {
    fn default() -> Self {
        Self::Avg
    }
}

impl FromStr for PoolMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max" => Ok(Self::Max),
            "avg" => Ok(Self::Avg),
            other => Err(format!("pool method `{}` not one of: 'max', 'avg'", other)),
        }
    }
}

impl fmt::Display for PoolMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Max => "max",
            Self::Avg => "avg",
        })
    }
}

/// A single layer of the feature network
#[derive(Clone, Debug)]
pub enum Layer {
    /// A convolution followed by a ReLU. Every convolution is one weight
    /// slot for the content and style losses.
    Conv(Conv2d),
    /// 2x2 pooling with a stride of 2
    Pool(PoolMethod),
}

/// A loaded feature network, ie. the ordered layers and the pixel mean of
/// the images it was trained on
#[derive(Clone, Debug)]
pub struct NetworkSpec {
    layers: Vec<Layer>,
    pixel_mean: [f32; 3],
}

impl NetworkSpec {
    /// Creates a network, checking that each convolution consumes the
    /// channels the previous one produces, starting with RGB
    pub fn new(layers: Vec<Layer>, pixel_mean: [f32; 3]) -> Result<Self, Error> {
        let mut channels = 3;
        for (i, layer) in layers.iter().enumerate() {
            if let Layer::Conv(conv) = layer {
                if conv.in_channels() != channels {
                    return Err(Error::InvalidNetwork(format!(
                        "layer {} expects {} input channels, but receives {}",
                        i,
                        conv.in_channels(),
                        channels
                    )));
                }
                channels = conv.out_channels();
            }
        }

        Ok(Self { layers, pixel_mean })
    }

    #[inline]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// The mean pixel value that is subtracted from images before they are
    /// fed to the network
    #[inline]
    pub fn pixel_mean(&self) -> [f32; 3] {
        self.pixel_mean
    }

    /// The number of layers that can be weighted, ie. the length of the
    /// `LayerWeights` the network accepts
    pub fn weight_slots(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| matches!(l, Layer::Conv(_)))
            .count()
    }

    /// The pooling method used by the network, `None` if it has no pooling
    /// layers
    pub fn pool_method(&self) -> Option<PoolMethod> {
        self.layers.iter().find_map(|l| match l {
            Layer::Pool(method) => Some(*method),
            Layer::Conv(_) => None,
        })
    }
}

/// Something that can provide a feature network
pub trait NetworkLoader {
    fn load(&self, pool: PoolMethod) -> Result<NetworkSpec, Error>;
}

/// A tunable parameter and the gradient of the cost with respect to it
#[derive(Clone, Debug)]
pub struct Param {
    pub value: Array4<f32>,
    pub grad: Array4<f32>,
}

impl Param {
    /// Creates a parameter with a zeroed gradient
    pub fn new(value: Array4<f32>) -> Self {
        let grad = Array4::zeros(value.raw_dim());
        Self { value, grad }
    }
}

/// The tensors and weights a loss network is constructed from. All images
/// are in network layout with the pixel mean subtracted.
pub struct NetworkInputs {
    pub init: Array4<f32>,
    pub subject: Array4<f32>,
    pub style: Array4<f32>,
    /// Already scaled by the subject ratio
    pub subject_weights: LayerWeights,
    pub style_weights: LayerWeights,
    pub smoothness: f32,
}

/// A network that evaluates how well the current image matches the subject
/// and style.
///
/// The total cost is `content + style + smoothness * total variation`,
/// where the content and style terms are sums over the weighted layers.
pub trait LossNetwork {
    /// The current image, in network layout
    fn image(&self) -> &Array4<f32>;

    /// Replaces the current image, which must keep the same shape
    fn set_image(&mut self, image: Array4<f32>) -> Result<(), Error>;

    /// The tunable parameters, which are updated by the optimizer
    fn params_mut(&mut self) -> &mut [Param];

    /// Computes the cost of the current image, one value per batch entry,
    /// and stores the gradient of each parameter. Parameter values are
    /// not changed.
    fn update(&mut self) -> Result<Array1<f32>, Error>;
}
