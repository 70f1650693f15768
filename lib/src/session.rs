use crate::{
    errors::InvalidRange,
    layout::{save_tensor, to_network_layout, to_view_layout},
    network::{LossNetwork, NetworkInputs, NetworkSpec, StyleNetwork},
    optim::{Adam, AdamState},
    prepare::{add_mean, prepare, ImageSource, PrepareOptions},
    weights::{default_style_weights, default_subject_weights, LayerWeight, LayerWeights},
    Error, StyledImage,
};
use ndarray::{Array3, Array4};
use std::path::PathBuf;

/// Where and how often snapshots of the image being optimized are saved
#[derive(Clone, Debug, PartialEq)]
pub struct Animation {
    /// The directory the frames are saved to, it is created if it doesn't
    /// already exist
    pub directory: PathBuf,
    /// The number of iterations between each frame
    pub rate: u32,
}

impl Default for Animation {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("animation"),
            rate: 1,
        }
    }
}

#[derive(Clone)]
struct Parameters {
    iterations: u32,
    learn_rate: f32,
    smoothness: f32,
    init_noise: f32,
    seed: Option<u64>,
    subject_weights: Vec<LayerWeight>,
    style_weights: Vec<LayerWeight>,
    subject_ratio: f32,
    animation: Option<Animation>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            iterations: 500,
            learn_rate: 2.0,
            smoothness: 5e-8,
            init_noise: 0.0,
            seed: None,
            subject_weights: default_subject_weights(),
            style_weights: default_style_weights(),
            subject_ratio: 2e-2,
            animation: None,
        }
    }
}

/// Style transfer session.
///
/// Calling `run()` optimizes the image for the configured number of
/// iterations and returns it, consuming the session in the process. You can
/// provide a `StyleProgress` implementation to get an update with the current
/// cost after every iteration.
///
/// # Example
/// ```no_run
/// use neural_style::{network::{FileLoader, NetworkLoader, PoolMethod}, Session};
///
/// let network = FileLoader::new("vgg19.nsn")
///     .load(PoolMethod::Avg)
///     .expect("failed to load network");
///
/// let styled = Session::builder()
///     .subject(&"imgs/subject.jpg")
///     .style(&"imgs/style.jpg")
///     .iterations(100)
///     .build(&network).expect("failed to build session")
///     .run(None).expect("failed to style image");
///
/// styled.save("out.png").expect("failed to save image");
/// ```
pub struct Session<N = StyleNetwork> {
    network: N,
    learn_rule: Adam,
    states: Vec<AdamState>,
    pixel_mean: [f32; 3],
    iterations: u32,
    animation: Option<Animation>,
}

impl Session<StyleNetwork> {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }
}

impl<N: LossNetwork> Session<N> {
    /// The image being optimized, in view layout with the pixel mean added
    /// back
    pub fn current_image(&self) -> Result<Array3<f32>, Error> {
        let mut img = to_view_layout(self.network.image())?;
        add_mean(&mut img, &self.pixel_mean);
        Ok(img)
    }

    /// Runs the optimizer and outputs the styled image.
    ///
    /// There is no convergence check, the image is always stepped exactly
    /// the configured number of times.
    pub fn run(
        mut self,
        mut progress: Option<Box<dyn StyleProgress>>,
    ) -> Result<StyledImage, Error> {
        if let Some(ref animation) = self.animation {
            std::fs::create_dir_all(&animation.directory)?;
        }

        let learn_rule = self.learn_rule;

        for i in 0..self.iterations {
            if let Some(ref animation) = self.animation {
                if i % animation.rate == 0 {
                    let frame = animation.directory.join(format!("{:04}.png", i));
                    save_tensor(&frame, &self.current_image()?)?;
                }
            }

            let cost = self.network.update()?.mean().unwrap_or_default();

            for (param, state) in self
                .network
                .params_mut()
                .iter_mut()
                .zip(self.states.iter_mut())
            {
                learn_rule.step(param, state);
            }

            log::debug!("iteration: {}, cost: {:.4}", i, cost);

            if let Some(ref mut progress) = progress {
                progress.update(ProgressUpdate {
                    iteration: i,
                    total: self.iterations,
                    cost,
                    image: self.network.image(),
                });
            }
        }

        Ok(StyledImage {
            inner: self.current_image()?,
        })
    }
}

/// Builds a session by setting parameters and adding input images, calling
/// `build` loads and prepares the images and constructs the loss network.
#[derive(Default)]
pub struct SessionBuilder<'a> {
    subject: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    init: Option<ImageSource<'a>>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The image whose content is preserved
    pub fn subject<I: Into<ImageSource<'a>>>(mut self, subject: I) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// The image whose style is transferred onto the subject
    pub fn style<I: Into<ImageSource<'a>>>(mut self, style: I) -> Self {
        self.style = Some(style.into());
        self
    }

    /// The image the optimization starts from, must be the same size as the
    /// subject.
    ///
    /// Default: the subject
    pub fn init<I: Into<ImageSource<'a>>>(mut self, init: I) -> Self {
        self.init = Some(init.into());
        self
    }

    /// How much noise is blended into the initial image. Range `[0, 1]`,
    /// where 0 leaves the image untouched and 1 replaces it with noise.
    ///
    /// Default: 0.0
    pub fn init_noise(mut self, weight: f32) -> Self {
        self.params.init_noise = weight;
        self
    }

    /// Seeds the noise generator, giving identical initial images for
    /// identical inputs.
    ///
    /// Default: seeded from system entropy
    pub fn seed(mut self, value: u64) -> Self {
        self.params.seed = Some(value);
        self
    }

    /// The number of optimization steps.
    ///
    /// Default: 500
    pub fn iterations(mut self, count: u32) -> Self {
        self.params.iterations = count;
        self
    }

    /// Default: 2.0
    pub fn learn_rate(mut self, rate: f32) -> Self {
        self.params.learn_rate = rate;
        self
    }

    /// The weight of the total variation loss, higher values give a
    /// smoother image.
    ///
    /// Default: 5e-8
    pub fn smoothness(mut self, weight: f32) -> Self {
        self.params.smoothness = weight;
        self
    }

    /// The layers used for the content loss.
    ///
    /// Default: `[(9, 1.0)]`
    pub fn subject_weights<I: IntoIterator<Item = LayerWeight>>(mut self, weights: I) -> Self {
        self.params.subject_weights = weights.into_iter().collect();
        self
    }

    /// The layers used for the style loss.
    ///
    /// Default: `[(0, 1.0), (2, 1.0), (4, 1.0), (8, 1.0), (12, 1.0)]`
    pub fn style_weights<I: IntoIterator<Item = LayerWeight>>(mut self, weights: I) -> Self {
        self.params.style_weights = weights.into_iter().collect();
        self
    }

    /// The weight of the content loss relative to the style loss.
    ///
    /// Default: 0.02
    pub fn subject_ratio(mut self, ratio: f32) -> Self {
        self.params.subject_ratio = ratio;
        self
    }

    /// Saves a snapshot of the image every `animation.rate` iterations.
    ///
    /// Default: disabled
    pub fn animation(mut self, animation: Option<Animation>) -> Self {
        self.params.animation = animation;
        self
    }

    /// Creates a `Session` optimizing against the provided network, or
    /// returns an error if invalid parameters or input images were
    /// specified.
    pub fn build(self, network: &NetworkSpec) -> Result<Session<StyleNetwork>, Error> {
        self.build_with(network.pixel_mean(), network.weight_slots(), |inputs| {
            StyleNetwork::new(network, inputs)
        })
    }

    /// Creates a `Session` optimizing against the network created by
    /// `make_network`, which receives the prepared tensors and weights.
    pub fn build_with<N, F>(
        self,
        pixel_mean: [f32; 3],
        weight_slots: usize,
        make_network: F,
    ) -> Result<Session<N>, Error>
    where
        N: LossNetwork,
        F: FnOnce(NetworkInputs) -> Result<N, Error>,
    {
        self.check_parameters_validity()?;

        let params = self.params;

        let subject_weights = LayerWeights::normalize(&params.subject_weights, weight_slots)?
            .scaled(params.subject_ratio);
        let style_weights = LayerWeights::normalize(&params.style_weights, weight_slots)?;

        let prepared = prepare(PrepareOptions {
            subject: self.subject.ok_or(Error::MissingInput("subject"))?,
            style: self.style.ok_or(Error::MissingInput("style"))?,
            init: self.init,
            noise_weight: params.init_noise,
            pixel_mean,
            seed: params.seed,
        })?;

        let mut network = make_network(NetworkInputs {
            init: to_network_layout(&prepared.init),
            subject: to_network_layout(&prepared.subject),
            style: to_network_layout(&prepared.style),
            subject_weights,
            style_weights,
            smoothness: params.smoothness,
        })?;

        let learn_rule = Adam::new(params.learn_rate);
        let states = network
            .params_mut()
            .iter()
            .map(|p| learn_rule.init_state(p))
            .collect();

        Ok(Session {
            network,
            learn_rule,
            states,
            pixel_mean,
            iterations: params.iterations,
            animation: params.animation,
        })
    }

    pub(crate) fn check_parameters_validity(&self) -> Result<(), Error> {
        let params = &self.params;

        if !(params.init_noise >= 0.0 && params.init_noise <= 1.0) {
            return Err(Error::InvalidRange(InvalidRange {
                min: 0.0,
                max: 1.0,
                value: params.init_noise,
                name: "init-noise",
            }));
        }

        if !(params.learn_rate > 0.0) {
            return Err(Error::InvalidRange(InvalidRange {
                min: 0.0,
                max: f32::INFINITY,
                value: params.learn_rate,
                name: "learn-rate",
            }));
        }

        for &(name, value) in &[
            ("smoothness", params.smoothness),
            ("subject-ratio", params.subject_ratio),
        ] {
            if !(value >= 0.0) {
                return Err(Error::InvalidRange(InvalidRange {
                    min: 0.0,
                    max: f32::INFINITY,
                    value,
                    name,
                }));
            }
        }

        if let Some(ref animation) = params.animation {
            if animation.rate == 0 {
                return Err(Error::InvalidRange(InvalidRange {
                    min: 1.0,
                    max: u32::MAX as f32,
                    value: 0.0,
                    name: "animation-rate",
                }));
            }
        }

        Ok(())
    }
}

/// The state of the optimizer after an iteration
pub struct ProgressUpdate<'a> {
    /// The index of the iteration that just completed
    pub iteration: u32,
    /// The total number of iterations
    pub total: u32,
    /// The mean cost computed for the iteration
    pub cost: f32,
    /// The image after the iteration's step, in network layout with the
    /// pixel mean subtracted
    pub image: &'a Array4<f32>,
}

/// Allows the optimizer to update external callers with the current
/// progress of the style transfer
pub trait StyleProgress {
    fn update(&mut self, info: ProgressUpdate<'_>);
}

impl<G> StyleProgress for G
where
    G: FnMut(ProgressUpdate<'_>) + Send,
{
    fn update(&mut self, info: ProgressUpdate<'_>) {
        self(info)
    }
}
