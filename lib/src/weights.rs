use crate::Error;
use std::str::FromStr;

/// The weight of a single layer of the feature network
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LayerWeight {
    /// The index of the weighted (convolution) layer, not the index in the
    /// full list of network layers
    pub layer: usize,
    pub weight: f32,
}

impl LayerWeight {
    pub fn new(layer: usize, weight: f32) -> Self {
        Self { layer, weight }
    }
}

impl FromStr for LayerWeight {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidWeight(s.to_owned());

        let mut parts = s.split(',');
        let (layer, weight) = match (parts.next(), parts.next(), parts.next()) {
            (Some(layer), Some(weight), None) => (layer.trim(), weight.trim()),
            _ => return Err(invalid()),
        };

        // Accept `9.0` as well as `9`, but never a fractional or negative index
        let layer = match layer.parse::<usize>() {
            Ok(layer) => layer,
            Err(_) => {
                let fl: f64 = layer.parse().map_err(|_| invalid())?;
                if fl < 0.0 || fl.fract() != 0.0 || !fl.is_finite() {
                    return Err(invalid());
                }
                fl as usize
            }
        };

        let weight = weight.parse::<f32>().map_err(|_| invalid())?;
        if !weight.is_finite() {
            return Err(invalid());
        }

        Ok(Self { layer, weight })
    }
}

/// The layer weights used for the content loss if none are specified
pub fn default_subject_weights() -> Vec<LayerWeight> {
    vec![LayerWeight::new(9, 1.0)]
}

/// The layer weights used for the style loss if none are specified
pub fn default_style_weights() -> Vec<LayerWeight> {
    [0, 2, 4, 8, 12]
        .iter()
        .map(|&layer| LayerWeight::new(layer, 1.0))
        .collect()
}

/// A dense vector with one weight per weighted layer of the feature network.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerWeights(Vec<f32>);

impl LayerWeights {
    /// A vector where no layer contributes anything
    pub fn zeros(slots: usize) -> Self {
        Self(vec![0.0; slots])
    }

    /// Scatters the sparse `pairs` into a vector of `slots` weights, and
    /// rescales them so they sum to 1.
    ///
    /// A layer specified more than once keeps the last weight given for it.
    /// If the weights don't sum to a positive value the vector is returned
    /// as is, which for no weights at all means no layer contributes.
    pub fn normalize(pairs: &[LayerWeight], slots: usize) -> Result<Self, Error> {
        let mut weights = vec![0.0f32; slots];

        for pair in pairs {
            match weights.get_mut(pair.layer) {
                Some(w) => *w = pair.weight,
                None => {
                    return Err(Error::LayerOutOfRange {
                        index: pair.layer,
                        slots,
                    })
                }
            }
        }

        let norm: f32 = weights.iter().sum();
        if norm > 0.0 {
            for w in &mut weights {
                *w /= norm;
            }
        }

        Ok(Self(weights))
    }

    /// Multiplies every weight by `ratio`
    pub fn scaled(mut self, ratio: f32) -> Self {
        for w in &mut self.0 {
            *w *= ratio;
        }
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// The weight of the layer, layers past the end have no weight
    #[inline]
    pub fn get(&self, layer: usize) -> f32 {
        self.0.get(layer).copied().unwrap_or_default()
    }

    /// True if the layer contributes to the loss
    #[inline]
    pub fn is_active(&self, layer: usize) -> bool {
        self.get(layer) > 0.0
    }

    /// The index of the last layer that contributes to the loss
    pub fn deepest_active(&self) -> Option<usize> {
        self.0.iter().rposition(|w| *w > 0.0)
    }
}
