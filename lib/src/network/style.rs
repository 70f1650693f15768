use super::{
    layers::{pool, pool_backward, relu, relu_backward, to_map, to_matrix},
    Layer, LossNetwork, NetworkInputs, NetworkSpec, Param,
};
use crate::{errors::ShapeMismatch, weights::LayerWeights, Error};
use ndarray::{Array1, Array2, Array3, Array4, Axis};

/// The channel correlation matrix of a feature map, `channels x channels`
fn gram_matrix(feats: &Array3<f32>) -> Array2<f32> {
    let f = to_matrix(feats);
    f.dot(&f.t())
}

fn l1_norm<D: ndarray::Dimension>(a: &ndarray::Array<f32, D>) -> f32 {
    a.iter().map(|v| v.abs()).sum()
}

fn squared_sum<D: ndarray::Dimension>(a: &ndarray::Array<f32, D>) -> f32 {
    a.iter().map(|v| v * v).sum()
}

/// Strips the batch axis from a `1 x C x H x W` tensor
fn unbatch(
    name: &'static str,
    tensor: &Array4<f32>,
    channels: usize,
) -> Result<Array3<f32>, Error> {
    let (batch, c, h, w) = tensor.dim();
    if batch != 1 || c != channels {
        return Err(Error::ShapeMismatch(ShapeMismatch {
            name,
            expected: vec![1, channels, h, w],
            actual: tensor.shape().to_vec(),
        }));
    }

    Ok(tensor.index_axis(Axis(0), 0).to_owned())
}

/// Total variation of the image, as half the sum of the squared differences
/// between horizontally and vertically adjacent pixels, and its gradient
fn total_variation(img: &Array3<f32>) -> (f32, Array3<f32>) {
    let (c, h, w) = img.dim();
    let mut grad = Array3::zeros(img.raw_dim());
    let mut loss = 0.0;

    for ch in 0..c {
        for y in 0..h {
            for x in 0..w {
                let v = img[[ch, y, x]];

                if x + 1 < w {
                    let d = img[[ch, y, x + 1]] - v;
                    loss += d * d;
                    grad[[ch, y, x + 1]] += d;
                    grad[[ch, y, x]] -= d;
                }

                if y + 1 < h {
                    let d = img[[ch, y + 1, x]] - v;
                    loss += d * d;
                    grad[[ch, y + 1, x]] += d;
                    grad[[ch, y, x]] -= d;
                }
            }
        }
    }

    (loss * 0.5, grad)
}

/// A loss network over a stack of convolution and pooling layers.
///
/// The content loss of a weighted layer is the squared difference between
/// the feature maps of the current and subject images, and the style loss is
/// the squared difference of their Gram matrices. The gradient of each layer
/// is normalized by its L1 norm before being weighted, which keeps the
/// magnitudes of the layers comparable regardless of their depth.
pub struct StyleNetwork {
    /// Only the layers up to the deepest weighted one
    layers: Vec<Layer>,
    /// The weight slot of each layer, `None` for pooling layers
    slots: Vec<Option<usize>>,
    subject_weights: LayerWeights,
    style_weights: LayerWeights,
    /// Per slot, only for slots with a subject weight
    subject_feats: Vec<Option<Array3<f32>>>,
    /// Per slot, only for slots with a style weight
    style_grams: Vec<Option<Array2<f32>>>,
    smoothness: f32,
    params: Vec<Param>,
}

impl StyleNetwork {
    pub fn new(spec: &NetworkSpec, inputs: NetworkInputs) -> Result<Self, Error> {
        let slot_count = spec.weight_slots();
        for &(name, weights) in &[
            ("subject weights", &inputs.subject_weights),
            ("style weights", &inputs.style_weights),
        ] {
            if weights.len() != slot_count {
                return Err(Error::ShapeMismatch(ShapeMismatch {
                    name,
                    expected: vec![slot_count],
                    actual: vec![weights.len()],
                }));
            }
        }

        if inputs.init.shape() != inputs.subject.shape() {
            return Err(Error::ShapeMismatch(ShapeMismatch {
                name: "initial image",
                expected: inputs.subject.shape().to_vec(),
                actual: inputs.init.shape().to_vec(),
            }));
        }

        let subject = unbatch("subject image", &inputs.subject, 3)?;
        let style = unbatch("style image", &inputs.style, 3)?;
        unbatch("initial image", &inputs.init, 3)?;

        // Map each layer to its weight slot, and discard everything after
        // the deepest layer that contributes to the loss
        let deepest = match (
            inputs.subject_weights.deepest_active(),
            inputs.style_weights.deepest_active(),
        ) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let mut layers = Vec::new();
        let mut slots = Vec::new();
        if let Some(deepest) = deepest {
            let mut slot = 0;
            for layer in spec.layers() {
                match layer {
                    Layer::Conv(_) => {
                        slots.push(Some(slot));
                        slot += 1;
                    }
                    Layer::Pool(_) => slots.push(None),
                }
                layers.push(layer.clone());

                if slot > deepest {
                    break;
                }
            }
        }

        let mut net = Self {
            layers,
            slots,
            subject_feats: vec![None; slot_count],
            style_grams: vec![None; slot_count],
            subject_weights: inputs.subject_weights,
            style_weights: inputs.style_weights,
            smoothness: inputs.smoothness,
            params: vec![Param::new(inputs.init)],
        };

        // Precompute the targets the current image is compared against
        let subject_acts = net.forward(subject)?;
        let style_acts = net.forward(style)?;

        for (l, slot) in net.slots.iter().enumerate() {
            let slot = match slot {
                Some(slot) => *slot,
                None => continue,
            };

            let subject_feats = &subject_acts[l + 1];
            let style_feats = &style_acts[l + 1];

            if net.subject_weights.is_active(slot) {
                net.subject_feats[slot] = Some(subject_feats.clone());
            }

            if net.style_weights.is_active(slot) {
                // Scale the Gram matrix to compensate for differently sized
                // subject and style images
                let (_, sh, sw) = subject_feats.dim();
                let (_, th, tw) = style_feats.dim();
                let scale = (sh * sw) as f32 / (th * tw) as f32;
                net.style_grams[slot] = Some(gram_matrix(style_feats) * scale);
            }
        }

        Ok(net)
    }

    /// Runs the image through every layer, returning the input followed by
    /// the output of each layer
    fn forward(&self, input: Array3<f32>) -> Result<Vec<Array3<f32>>, Error> {
        let mut acts = Vec::with_capacity(self.layers.len() + 1);
        acts.push(input);

        for layer in &self.layers {
            let x = &acts[acts.len() - 1];
            let next = match layer {
                Layer::Conv(conv) => relu(conv.forward(x)?),
                Layer::Pool(method) => {
                    let (c, h, w) = x.dim();
                    if h < 2 || w < 2 {
                        return Err(Error::ShapeMismatch(ShapeMismatch {
                            name: "feature map, the image is too small for the network",
                            expected: vec![c, 2, 2],
                            actual: vec![c, h, w],
                        }));
                    }
                    pool(*method, x)
                }
            };
            acts.push(next);
        }

        Ok(acts)
    }
}

impl LossNetwork for StyleNetwork {
    fn image(&self) -> &Array4<f32> {
        &self.params[0].value
    }

    fn set_image(&mut self, image: Array4<f32>) -> Result<(), Error> {
        let current = &self.params[0].value;
        if image.shape() != current.shape() {
            return Err(Error::ShapeMismatch(ShapeMismatch {
                name: "image",
                expected: current.shape().to_vec(),
                actual: image.shape().to_vec(),
            }));
        }

        self.params[0] = Param::new(image);
        Ok(())
    }

    fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    fn update(&mut self) -> Result<Array1<f32>, Error> {
        let img = self.params[0].value.index_axis(Axis(0), 0).to_owned();
        let acts = self.forward(img)?;

        let mut grad = Array3::zeros(acts[acts.len() - 1].raw_dim());
        let mut loss = 0.0f32;

        for (l, layer) in self.layers.iter().enumerate().rev() {
            let feats = &acts[l + 1];

            if let Some(slot) = self.slots[l] {
                if let Some(ref target) = self.subject_feats[slot] {
                    let diff = feats - target;
                    let weight = self.subject_weights.get(slot) / (l1_norm(&diff) + 1e-8);
                    loss += 0.5 * weight * squared_sum(&diff);
                    grad.scaled_add(weight, &diff);
                }

                if let Some(ref target) = self.style_grams[slot] {
                    let diff = gram_matrix(feats) - target;
                    let style_grad = to_map(diff.dot(&to_matrix(feats)), feats.dim())?;
                    let weight = self.style_weights.get(slot) / (l1_norm(&style_grad) + 1e-8);
                    loss += 0.25 * weight * squared_sum(&diff);
                    grad.scaled_add(weight, &style_grad);
                }
            }

            grad = match layer {
                Layer::Conv(conv) => conv.backward(&relu_backward(feats, grad))?,
                Layer::Pool(method) => pool_backward(*method, &acts[l], &grad),
            };
        }

        if self.smoothness > 0.0 {
            let (tv, tv_grad) = total_variation(&acts[0]);
            loss += self.smoothness * tv;
            grad.scaled_add(self.smoothness, &tv_grad);
        }

        self.params[0].grad = grad.insert_axis(Axis(0));
        Ok(Array1::from(vec![loss]))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::{Conv2d, PoolMethod};
    use approx::assert_relative_eq;

    fn conv(i: usize, o: usize, seed: usize) -> Layer {
        let weights = Array4::from_shape_fn((o, i, 3, 3), |(a, b, y, x)| {
            (((a * 31 + b * 17 + y * 7 + x * 3 + seed) % 13) as f32 - 6.0) * 0.05
        });
        Layer::Conv(Conv2d::new(weights, Array1::from_elem(o, 0.01)).unwrap())
    }

    fn spec(method: PoolMethod) -> NetworkSpec {
        NetworkSpec::new(
            vec![
                conv(3, 4, 1),
                Layer::Pool(method),
                conv(4, 6, 2),
                conv(6, 6, 3),
            ],
            [0.0; 3],
        )
        .unwrap()
    }

    fn image(h: usize, w: usize, phase: f32) -> Array4<f32> {
        Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
            ((x as f32 * 0.7 + y as f32 * 1.3 + c as f32 + phase).sin()) * 20.0
        })
    }

    fn inputs(subject: &[(usize, f32)], style: &[(usize, f32)], smoothness: f32) -> NetworkInputs {
        use crate::weights::LayerWeight;
        let to_pairs = |p: &[(usize, f32)]| -> Vec<LayerWeight> {
            p.iter().map(|&(l, w)| LayerWeight::new(l, w)).collect()
        };

        NetworkInputs {
            init: image(6, 8, 0.5),
            subject: image(6, 8, 0.0),
            style: image(4, 4, 2.0),
            subject_weights: LayerWeights::normalize(&to_pairs(subject), 3).unwrap(),
            style_weights: LayerWeights::normalize(&to_pairs(style), 3).unwrap(),
            smoothness,
        }
    }

    #[test]
    fn truncates_unused_layers() {
        let net = StyleNetwork::new(&spec(PoolMethod::Avg), inputs(&[(0, 1.0)], &[], 0.0)).unwrap();
        assert_eq!(net.layers.len(), 1);

        let net = StyleNetwork::new(
            &spec(PoolMethod::Avg),
            inputs(&[(0, 1.0)], &[(1, 1.0)], 0.0),
        )
        .unwrap();
        assert_eq!(net.layers.len(), 3);

        let net = StyleNetwork::new(&spec(PoolMethod::Avg), inputs(&[], &[], 0.0)).unwrap();
        assert!(net.layers.is_empty());
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let mut i = inputs(&[(0, 1.0)], &[], 0.0);
        i.init = image(6, 7, 0.0);
        assert!(matches!(
            StyleNetwork::new(&spec(PoolMethod::Avg), i),
            Err(Error::ShapeMismatch(_))
        ));

        let mut i = inputs(&[(0, 1.0)], &[], 0.0);
        i.style_weights = LayerWeights::zeros(19);
        assert!(StyleNetwork::new(&spec(PoolMethod::Avg), i).is_err());

        let mut i = inputs(&[(0, 1.0)], &[], 0.0);
        i.subject = Array4::zeros((1, 1, 6, 8));
        i.init = Array4::zeros((1, 1, 6, 8));
        assert!(StyleNetwork::new(&spec(PoolMethod::Avg), i).is_err());
    }

    #[test]
    fn subject_init_has_no_content_loss() {
        let mut i = inputs(&[(2, 1.0)], &[], 0.0);
        i.init = i.subject.clone();
        let mut net = StyleNetwork::new(&spec(PoolMethod::Max), i).unwrap();

        let cost = net.update().unwrap();
        assert_eq!(cost.len(), 1);
        assert_relative_eq!(cost[0], 0.0);
        assert!(net.params_mut()[0].grad.iter().all(|g| *g == 0.0));
    }

    #[test]
    fn update_keeps_image() {
        let mut net = StyleNetwork::new(
            &spec(PoolMethod::Avg),
            inputs(&[(2, 0.02)], &[(0, 1.0), (1, 1.0)], 5e-2),
        )
        .unwrap();

        let before = net.image().clone();
        let cost = net.update().unwrap();

        assert!(cost[0] > 0.0);
        assert_eq!(net.image(), &before);

        let param = &net.params_mut()[0];
        assert_eq!(param.grad.dim(), param.value.dim());
        assert!(param.grad.iter().any(|g| *g != 0.0));
    }

    #[test]
    fn smoothness_gradient_matches_finite_difference() {
        let img = image(3, 4, 0.2).index_axis(Axis(0), 0).to_owned();
        let (tv, grad) = total_variation(&img);

        let h = 1e-2;
        let mut bumped = img.clone();
        bumped[[1, 1, 2]] += h;
        let (tv2, _) = total_variation(&bumped);

        assert_relative_eq!((tv2 - tv) / h, grad[[1, 1, 2]], max_relative = 1e-2);
    }

    #[test]
    fn content_gradient_points_downhill() {
        let mut net =
            StyleNetwork::new(&spec(PoolMethod::Avg), inputs(&[(0, 1.0)], &[], 0.0)).unwrap();

        // The unnormalized content energy, the reported gradient is a
        // positive multiple of its gradient
        let energy = |net: &StyleNetwork, img: &Array4<f32>| -> f32 {
            let acts = net.forward(img.index_axis(Axis(0), 0).to_owned()).unwrap();
            let target = net.subject_feats[0].as_ref().unwrap();
            0.5 * squared_sum(&(&acts[1] - target))
        };

        net.update().unwrap();
        let param = net.params_mut()[0].clone();
        let max_grad = param.grad.iter().fold(0.0f32, |m, g| m.max(g.abs()));
        assert!(max_grad > 0.0);

        let stepped = &param.value - &(&param.grad * (1e-2 / max_grad));
        assert!(energy(&net, &stepped) < energy(&net, &param.value));
    }

    #[test]
    fn set_image_checks_shape() {
        let mut net =
            StyleNetwork::new(&spec(PoolMethod::Avg), inputs(&[(0, 1.0)], &[], 0.0)).unwrap();
        assert!(net.set_image(image(2, 2, 0.0)).is_err());
        assert!(net.set_image(image(6, 8, 1.0)).is_ok());
    }
}
