mod progress;

use structopt::StructOpt;

use neural_style::{
    network::{FileLoader, NetworkLoader, PoolMethod},
    video::{Ffmpeg, FramePolicy, VideoOptions},
    weights, Animation, Error, LayerWeight, NetworkSpec, StyleConfig, StyleProgress,
};
use std::path::PathBuf;

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct AnimationOpts {
    /// Don't save snapshots of the image while it is being styled
    #[structopt(long)]
    no_animation: bool,
    /// The directory snapshots are saved to
    #[structopt(long, default_value = "animation", parse(from_os_str))]
    animation_directory: PathBuf,
    /// The number of iterations between each snapshot
    #[structopt(long, default_value = "1")]
    animation_rate: u32,
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct Tweaks {
    /// The number of optimization steps
    #[structopt(long, default_value = "500")]
    iterations: u32,
    /// The learn rate of the optimizer
    #[structopt(long, default_value = "2.0")]
    learn_rate: f32,
    /// The weight of the total variation loss, larger values give a smoother image
    #[structopt(long, default_value = "5e-8")]
    smoothness: f32,
    /// Weights of the layers used for the content loss, each in the form `layer,weight`.
    /// Defaults to `9,1`, giving the flag no values disables the content loss
    #[structopt(long, use_delimiter = false, min_values = 0)]
    subject_weights: Option<Vec<LayerWeight>>,
    /// Weights of the layers used for the style loss, each in the form `layer,weight`.
    /// Defaults to `0,1 2,1 4,1 8,1 12,1`, giving the flag no values disables
    /// the style loss
    #[structopt(long, use_delimiter = false, min_values = 0)]
    style_weights: Option<Vec<LayerWeight>>,
    /// The weight of the content loss relative to the style loss
    #[structopt(long, default_value = "0.02")]
    subject_ratio: f32,
    /// The pooling method used by the network, `max` or `avg`
    #[structopt(long, default_value = "avg")]
    pool_method: PoolMethod,
    /// The network file
    #[structopt(long, default_value = "vgg19.nsn", parse(from_os_str))]
    network: PathBuf,
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct VideoOpts {
    /// The frame rate video frames are extracted and reassembled at
    #[structopt(long, default_value = "12")]
    frame_rate: u32,
    /// The width video frames are scaled to before styling, the height keeps
    /// the aspect ratio
    #[structopt(long, default_value = "320")]
    frame_width: u32,
    /// The directory that extracted frames, styled frames, and the audio
    /// track are written to
    #[structopt(long, default_value = ".", parse(from_os_str))]
    work_dir: PathBuf,
    /// Use the unstyled frame when a frame fails to style, rather than failing
    #[structopt(long)]
    skip_failed_frames: bool,
    /// The maximum number of video frames styled at once, 0 uses every core
    #[structopt(short = "t", long, default_value = "1")]
    threads: usize,
}

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Transfers the style of an image onto another image or video",
    rename_all = "kebab-case"
)]
struct Opt {
    /// The image, or video, whose content is kept
    #[structopt(long, parse(from_os_str))]
    subject: PathBuf,
    /// The image whose style is transferred onto the subject
    #[structopt(long, parse(from_os_str))]
    style: PathBuf,
    /// The path to save the styled image to, the file extension determines the
    /// image format. Videos are always saved with an `mp4` extension
    #[structopt(long, short, default_value = "out.png", parse(from_os_str))]
    output: PathBuf,
    /// The image the optimization starts from, defaults to the subject
    #[structopt(long, parse(from_os_str))]
    init: Option<PathBuf>,
    /// How much noise is blended into the initial image. Range (0.0 - 1.0)
    #[structopt(long, default_value = "0.0")]
    init_noise: f32,
    /// A seed value for the noise generator to give deterministic results
    #[structopt(long)]
    random_seed: Option<u64>,
    /// Don't show progress bars
    #[structopt(long)]
    no_progress: bool,
    #[structopt(flatten)]
    animation: AnimationOpts,
    #[structopt(flatten)]
    tweaks: Tweaks,
    #[structopt(flatten)]
    video: VideoOpts,
}

/// An absent flag falls back to the defaults, a flag without values means no layers
fn or_default(
    given: Option<&[LayerWeight]>,
    default: fn() -> Vec<LayerWeight>,
) -> Vec<LayerWeight> {
    match given {
        Some(weights) => weights.to_vec(),
        None => default(),
    }
}

impl Opt {
    fn style_config(&self) -> StyleConfig {
        let animation = if self.animation.no_animation {
            None
        } else {
            Some(Animation {
                directory: self.animation.animation_directory.clone(),
                rate: self.animation.animation_rate,
            })
        };

        StyleConfig {
            subject: self.subject.clone(),
            style: self.style.clone(),
            output: self.output.clone(),
            init: self.init.clone(),
            init_noise: self.init_noise,
            random_seed: self.random_seed,
            animation,
            iterations: self.tweaks.iterations,
            learn_rate: self.tweaks.learn_rate,
            smoothness: self.tweaks.smoothness,
            subject_weights: or_default(
                self.tweaks.subject_weights.as_deref(),
                weights::default_subject_weights,
            ),
            style_weights: or_default(
                self.tweaks.style_weights.as_deref(),
                weights::default_style_weights,
            ),
            subject_ratio: self.tweaks.subject_ratio,
        }
    }

    fn video_options(&self) -> VideoOptions {
        VideoOptions {
            frame_rate: self.video.frame_rate,
            frame_width: self.video.frame_width,
            work_dir: self.video.work_dir.clone(),
            policy: if self.video.skip_failed_frames {
                FramePolicy::SkipAndContinue
            } else {
                FramePolicy::FailFast
            },
            max_thread_count: self.video.threads,
        }
    }
}

fn main() {
    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn real_main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Opt::from_args();
    let config = args.style_config();

    // Configuration errors are reported before the network is loaded
    config.check_validity()?;
    let video = neural_style::is_video(&config.subject);
    if video {
        args.video_options().check_validity()?;
    }

    let network = FileLoader::new(&args.tweaks.network).load(args.tweaks.pool_method)?;

    if video {
        return style_video(&args, &config, &network);
    }

    let progress: Option<Box<dyn StyleProgress>> = if !args.no_progress {
        Some(Box::new(progress::IterationProgress::new(config.iterations)))
    } else {
        None
    };

    neural_style::style_image(&config, &network, progress)
}

fn style_video(args: &Opt, config: &StyleConfig, network: &NetworkSpec) -> Result<(), Error> {
    let transcoder = Ffmpeg::locate()?;
    let frames_pb = progress::frame_counter(args.no_progress);

    let report = neural_style::video::style_video(
        config,
        network,
        &transcoder,
        &args.video_options(),
        |_| frames_pb.inc(1),
    )?;

    frames_pb.finish();

    if !report.skipped.is_empty() {
        log::warn!(
            "{} of {} frames failed and were used unstyled",
            report.skipped.len(),
            report.frames
        );
    }

    log::info!(
        "styled {} frames into '{}'",
        report.styled,
        report.output.display()
    );

    Ok(())
}
