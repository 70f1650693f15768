// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `neural-style` transfers the style of one image onto the content of
//! another by directly optimizing the pixels of an image against the
//! activations of a pretrained convolutional network.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the builder pattern. Calling
//! `build` on the `SessionBuilder` loads the input images, checks the parameters, and constructs
//! the loss network from a `NetworkSpec`.
//!
//! `Session` has a `run()` method which steps the optimizer for the configured number of
//! iterations and returns the result as a `StyledImage`.
//!
//! Videos are styled frame by frame, see the `video` module.
//!
//! ## Usage
//!
//! ```no_run
//! use neural_style::network::{FileLoader, NetworkLoader, PoolMethod};
//!
//! let network = FileLoader::new("vgg19.nsn")
//!     .load(PoolMethod::Avg)
//!     .expect("failed to load network");
//!
//! let session = neural_style::Session::builder()
//!     .subject(&"imgs/subject.jpg")
//!     .style(&"imgs/style.jpg")
//!     .iterations(200)
//!     .seed(10)
//!     .build(&network)
//!     .expect("failed to build session");
//!
//! let styled = session.run(None).expect("failed to style image");
//! styled.save("styled.png").expect("failed to save styled image");
//! ```
mod errors;
pub mod layout;
pub mod network;
pub mod optim;
pub mod prepare;
pub mod session;
pub mod video;
pub mod weights;

pub use image;
use ndarray::Array3;
use std::path::{Path, PathBuf};

pub use errors::{Error, InvalidRange, ShapeMismatch, TranscodeFailure, TranscodeStage};
pub use network::{NetworkSpec, PoolMethod};
pub use prepare::{load_dynamic_image, ImageSource};
pub use session::{Animation, ProgressUpdate, Session, SessionBuilder, StyleProgress};
pub use weights::LayerWeight;

/// The file extensions treated as videos, compared case-insensitively
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm"];

/// The file extensions a styled image can be saved as
pub const OUTPUT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Returns true if the path looks like a video, based solely on its extension
pub fn is_video<P: AsRef<Path>>(path: P) -> bool {
    extension(path.as_ref()).map_or(false, |ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// Checks that a styled image can be saved to the path
pub fn check_output_format<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    match extension(path.as_ref()) {
        Some(ext) if OUTPUT_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        Some(ext) => Err(Error::UnsupportedOutputFormat(ext)),
        None => Err(Error::UnsupportedOutputFormat(String::new())),
    }
}

/// An image produced by `Session::run()`
pub struct StyledImage {
    /// View layout, with the pixel mean added back
    inner: Array3<f32>,
}

impl StyledImage {
    /// Saves the styled image to the specified path, clipping the pixel
    /// values to the valid range
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        layout::save_tensor(path, &self.inner)
    }

    /// The unclipped pixel values, `height x width x 3`
    pub fn as_tensor(&self) -> &Array3<f32> {
        &self.inner
    }

    /// Returns the styled image, clipping the pixel values to the valid range
    pub fn into_image(self) -> image::RgbImage {
        layout::tensor_to_image(&self.inner)
    }
}

impl AsRef<Array3<f32>> for StyledImage {
    fn as_ref(&self) -> &Array3<f32> {
        &self.inner
    }
}

/// The configuration for styling a single image, matching the options
/// available on the command line.
///
/// The configuration is never modified during a run, the video path derives
/// a new configuration for every frame with `for_frame`.
#[derive(Clone, Debug)]
pub struct StyleConfig {
    pub subject: PathBuf,
    pub style: PathBuf,
    pub output: PathBuf,
    pub init: Option<PathBuf>,
    pub init_noise: f32,
    pub random_seed: Option<u64>,
    pub animation: Option<Animation>,
    pub iterations: u32,
    pub learn_rate: f32,
    pub smoothness: f32,
    pub subject_weights: Vec<LayerWeight>,
    pub style_weights: Vec<LayerWeight>,
    pub subject_ratio: f32,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            subject: PathBuf::new(),
            style: PathBuf::new(),
            output: PathBuf::from("out.png"),
            init: None,
            init_noise: 0.0,
            random_seed: None,
            animation: Some(Animation::default()),
            iterations: 500,
            learn_rate: 2.0,
            smoothness: 5e-8,
            subject_weights: weights::default_subject_weights(),
            style_weights: weights::default_style_weights(),
            subject_ratio: 2e-2,
        }
    }
}

impl StyleConfig {
    /// The configuration for a single video frame, which never saves
    /// animation frames
    pub fn for_frame<P: Into<PathBuf>, Q: Into<PathBuf>>(&self, frame: P, output: Q) -> Self {
        Self {
            subject: frame.into(),
            output: output.into(),
            animation: None,
            ..self.clone()
        }
    }

    /// Checks the parameter ranges and the output format without loading
    /// any images or networks. The output of a video subject is always saved
    /// as `mp4`, so its extension isn't checked.
    pub fn check_validity(&self) -> Result<(), Error> {
        if !is_video(&self.subject) {
            check_output_format(&self.output)?;
        }

        self.session_builder().check_parameters_validity()
    }

    /// A session builder with every option of this configuration applied
    pub fn session_builder(&self) -> SessionBuilder<'_> {
        let mut builder = Session::builder()
            .subject(&self.subject)
            .style(&self.style)
            .init_noise(self.init_noise)
            .iterations(self.iterations)
            .learn_rate(self.learn_rate)
            .smoothness(self.smoothness)
            .subject_weights(self.subject_weights.iter().copied())
            .style_weights(self.style_weights.iter().copied())
            .subject_ratio(self.subject_ratio)
            .animation(self.animation.clone());

        if let Some(ref init) = self.init {
            builder = builder.init(init);
        }

        if let Some(seed) = self.random_seed {
            builder = builder.seed(seed);
        }

        builder
    }
}

/// Styles the subject image of the configuration and saves the result to
/// its output path
pub fn style_image(
    config: &StyleConfig,
    network: &NetworkSpec,
    progress: Option<Box<dyn StyleProgress>>,
) -> Result<(), Error> {
    check_output_format(&config.output)?;

    log::info!(
        "styling '{}' with '{}'",
        config.subject.display(),
        config.style.display()
    );

    let styled = config.session_builder().build(network)?.run(progress)?;
    styled.save(&config.output)?;

    log::info!("saved '{}'", config.output.display());
    Ok(())
}
