//! Styling videos frame by frame.
//!
//! A video is split into still frames and its audio track with an external
//! transcoder, every frame is styled independently, and the styled frames
//! are muxed back together with the video's audio track.

use crate::{
    errors::{InvalidRange, TranscodeFailure, TranscodeStage},
    style_image, Error, NetworkSpec, StyleConfig,
};
use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

/// The name of extracted and styled frames, in ffmpeg's pattern syntax
pub const FRAME_PATTERN: &str = "frame-%05d.jpg";

/// Options for splitting and reassembling a video
#[derive(Clone, Debug)]
pub struct VideoOptions {
    /// The frame rate frames are extracted at, and muxed back at
    pub frame_rate: u32,
    /// Frames are scaled to this width, keeping the aspect ratio. Must be
    /// even, as the muxed video uses 4:2:0 chroma subsampling
    pub frame_width: u32,
    /// The directory the frames and audio are written to
    pub work_dir: PathBuf,
    pub policy: FramePolicy,
    /// The maximum number of frames styled at once, 0 uses every core
    pub max_thread_count: usize,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            frame_rate: 12,
            frame_width: 320,
            work_dir: PathBuf::from("."),
            policy: FramePolicy::FailFast,
            max_thread_count: 1,
        }
    }
}

impl VideoOptions {
    /// Checks the options without touching the filesystem
    pub fn check_validity(&self) -> Result<(), Error> {
        check_frame_settings(self.frame_rate, self.frame_width)
    }
}

fn check_frame_settings(frame_rate: u32, frame_width: u32) -> Result<(), Error> {
    if frame_rate == 0 {
        return Err(Error::InvalidRange(InvalidRange {
            min: 1.0,
            max: u32::MAX as f32,
            value: 0.0,
            name: "frame-rate",
        }));
    }

    if frame_width == 0 || frame_width % 2 != 0 {
        return Err(Error::InvalidFrameWidth(frame_width));
    }

    Ok(())
}

/// What happens when styling a single frame fails
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FramePolicy {
    /// The whole job fails with the first frame that fails
    FailFast,
    /// The unstyled frame is used in its place and the job continues, so
    /// the video keeps its length and stays in sync with the audio
    SkipAndContinue,
}

impl Default for FramePolicy {
    fn default() -> Self {
        Self::FailFast
    }
}

/// The paths and settings of a single video job
#[derive(Clone, Debug)]
pub struct VideoJob {
    pub video: PathBuf,
    pub work_dir: PathBuf,
    pub frame_rate: u32,
    pub frame_width: u32,
}

impl VideoJob {
    pub fn new<P: Into<PathBuf>>(video: P, options: &VideoOptions) -> Self {
        Self {
            video: video.into(),
            work_dir: options.work_dir.clone(),
            frame_rate: options.frame_rate,
            frame_width: options.frame_width,
        }
    }

    pub fn input_dir(&self) -> PathBuf {
        self.work_dir.join("input_frames")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.work_dir.join("output_frames")
    }

    pub fn audio_path(&self) -> PathBuf {
        self.work_dir.join("raw-audio.wav")
    }

    /// Removes anything left over from a previous job, and creates empty
    /// frame directories
    pub fn reset_dirs(&self) -> Result<(), Error> {
        for dir in &[self.input_dir(), self.output_dir()] {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
            std::fs::create_dir_all(dir)?;
        }

        Ok(())
    }
}

/// Splits videos into frames and audio, and joins them back together
pub trait Transcoder: Sync {
    /// Writes the frames of `job.video` into `job.input_dir()`
    fn extract_frames(&self, job: &VideoJob) -> Result<(), Error>;
    /// Writes the audio track of `job.video` to `job.audio_path()`
    fn extract_audio(&self, job: &VideoJob) -> Result<(), Error>;
    /// Joins the frames in `job.output_dir()` and the audio into `output`
    fn mux(&self, job: &VideoJob, output: &Path) -> Result<(), Error>;
}

/// Builds the argument list for an ffmpeg invocation, arguments are passed
/// in the order they are added
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    args: Vec<String>,
    output: PathBuf,
    overwrite: bool,
}

impl FfmpegCommand {
    pub fn new(output: impl AsRef<Path>) -> Self {
        Self {
            args: Vec::new(),
            output: output.as_ref().to_path_buf(),
            overwrite: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn input(self, input: impl AsRef<Path>) -> Self {
        self.arg("-i")
            .arg(input.as_ref().to_string_lossy().into_owned())
    }

    /// The rate of an image sequence input, must come before its `input`
    pub fn input_frame_rate(self, rate: u32) -> Self {
        self.arg("-framerate").arg(rate.to_string())
    }

    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.arg("-vf").arg(filter)
    }

    pub fn output_frame_rate(self, rate: u32) -> Self {
        self.arg("-r").arg(rate.to_string())
    }

    pub fn format(self, format: impl Into<String>) -> Self {
        self.arg("-f").arg(format)
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.arg("-c:v").arg(codec)
    }

    pub fn pixel_format(self, format: impl Into<String>) -> Self {
        self.arg("-pix_fmt").arg(format)
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len() + 2);

        if self.overwrite {
            args.push("-y".to_owned());
        }

        args.extend(self.args.iter().cloned());
        args.push(self.output.to_string_lossy().into_owned());
        args
    }
}

/// Transcodes with an `ffmpeg` binary
#[derive(Clone, Debug)]
pub struct Ffmpeg {
    binary: PathBuf,
}

impl Ffmpeg {
    /// Finds `ffmpeg` in `PATH`
    pub fn locate() -> Result<Self, Error> {
        match which::which("ffmpeg") {
            Ok(binary) => {
                log::debug!("using ffmpeg at '{}'", binary.display());
                Ok(Self { binary })
            }
            Err(err) => {
                log::debug!("ffmpeg lookup failed: {}", err);
                Err(Error::ToolNotFound("ffmpeg".to_owned()))
            }
        }
    }

    pub fn with_binary<P: Into<PathBuf>>(binary: P) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn extract_frames_command(job: &VideoJob) -> FfmpegCommand {
        FfmpegCommand::new(job.input_dir().join(FRAME_PATTERN))
            .input(&job.video)
            // -2 keeps the height even, which yuv420p requires
            .video_filter(format!("scale={}:-2", job.frame_width))
            .output_frame_rate(job.frame_rate)
            .format("image2")
    }

    pub fn extract_audio_command(job: &VideoJob) -> FfmpegCommand {
        FfmpegCommand::new(job.audio_path()).input(&job.video)
    }

    pub fn mux_command(job: &VideoJob, output: &Path) -> FfmpegCommand {
        FfmpegCommand::new(output)
            .input_frame_rate(job.frame_rate)
            .input(job.output_dir().join(FRAME_PATTERN))
            .input(job.audio_path())
            .video_codec("libx264")
            .pixel_format("yuv420p")
    }

    fn run(&self, stage: TranscodeStage, cmd: &FfmpegCommand) -> Result<(), Error> {
        let args = cmd.build_args();
        log::debug!("{}: {} {}", stage, self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()?;

        if output.status.success() {
            Ok(())
        } else {
            Err(TranscodeFailure {
                stage,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into())
        }
    }
}

impl Transcoder for Ffmpeg {
    fn extract_frames(&self, job: &VideoJob) -> Result<(), Error> {
        self.run(
            TranscodeStage::ExtractFrames,
            &Self::extract_frames_command(job),
        )
    }

    fn extract_audio(&self, job: &VideoJob) -> Result<(), Error> {
        self.run(TranscodeStage::ExtractAudio, &Self::extract_audio_command(job))
    }

    fn mux(&self, job: &VideoJob, output: &Path) -> Result<(), Error> {
        self.run(TranscodeStage::Mux, &Self::mux_command(job, output))
    }
}

/// The number in the last run of digits in the file stem
fn frame_number(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let end = stem.rfind(|c: char| c.is_ascii_digit())? + 1;
    let start = stem[..end]
        .rfind(|c: char| !c.is_ascii_digit())
        .map_or(0, |i| i + 1);

    stem[start..end].parse().ok()
}

/// Lists the files in the directory ordered by frame number. Files without a
/// number in their name are sorted last.
pub fn sorted_frames<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>, Error> {
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            frames.push(entry.path());
        }
    }

    frames.sort_by_cached_key(|path| {
        let number = frame_number(path);
        (number.is_none(), number, path.file_name().map(|n| n.to_owned()))
    });

    Ok(frames)
}

/// The outcome of a video job
#[derive(Debug)]
pub struct VideoReport {
    /// The muxed video
    pub output: PathBuf,
    /// The number of frames that were extracted
    pub frames: usize,
    /// The number of frames that were styled successfully
    pub styled: usize,
    /// Frames that failed and were muxed unstyled, only populated with
    /// `FramePolicy::SkipAndContinue`
    pub skipped: Vec<PathBuf>,
}

/// Runs a video job, styling every extracted frame with a caller provided
/// function
pub struct VideoStylizer<'t, T> {
    job: VideoJob,
    transcoder: &'t T,
    policy: FramePolicy,
    max_thread_count: usize,
}

impl<'t, T: Transcoder> VideoStylizer<'t, T> {
    pub fn new(job: VideoJob, transcoder: &'t T) -> Self {
        Self {
            job,
            transcoder,
            policy: FramePolicy::default(),
            max_thread_count: 1,
        }
    }

    pub fn policy(mut self, policy: FramePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The maximum number of frames styled at once, 0 uses every core
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.max_thread_count = count;
        self
    }

    pub fn job(&self) -> &VideoJob {
        &self.job
    }

    /// Splits the video, calls `style_frame(input_frame, output_frame)` for
    /// every frame, and muxes the styled frames into `output` with its
    /// extension replaced by `mp4`
    pub fn run<F>(&self, output: &Path, style_frame: F) -> Result<VideoReport, Error>
    where
        F: Fn(&Path, &Path) -> Result<(), Error> + Sync,
    {
        let job = &self.job;
        check_frame_settings(job.frame_rate, job.frame_width)?;
        job.reset_dirs()?;

        log::info!("extracting frames from '{}'", job.video.display());
        self.transcoder.extract_frames(job)?;
        self.transcoder.extract_audio(job)?;

        let frames = sorted_frames(job.input_dir())?;
        if frames.is_empty() {
            return Err(Error::NoFrames(job.input_dir()));
        }

        let outcomes = self.style_frames(&frames, &style_frame);

        let output_dir = job.output_dir();
        let mut skipped = Vec::new();
        for (frame, outcome) in frames.iter().zip(outcomes.into_iter()) {
            match outcome {
                Some(Err(err)) => match self.policy {
                    FramePolicy::FailFast => {
                        return Err(Error::Frame {
                            frame: frame.clone(),
                            source: Box::new(err),
                        });
                    }
                    FramePolicy::SkipAndContinue => {
                        log::warn!("using unstyled frame '{}': {}", frame.display(), err);

                        // The image sequence ffmpeg reads stops at the first
                        // missing number
                        if let Some(name) = frame.file_name() {
                            std::fs::copy(frame, output_dir.join(name))?;
                        }
                        skipped.push(frame.clone());
                    }
                },
                // Frames are only left unprocessed after a failure, which
                // has already been returned above
                Some(Ok(())) | None => {}
            }
        }

        let output = output.with_extension("mp4");
        log::info!("muxing {} frames into '{}'", frames.len(), output.display());
        self.transcoder.mux(job, &output)?;

        Ok(VideoReport {
            output,
            frames: frames.len(),
            styled: frames.len() - skipped.len(),
            skipped,
        })
    }

    fn worker_count(&self, frames: usize) -> usize {
        let max = match self.max_thread_count {
            0 => num_cpus::get(),
            n => n,
        };

        max.min(frames).max(1)
    }

    /// Styles the frames, returning the outcome of each frame in order. With
    /// `FramePolicy::FailFast` no new frames are started after a failure, so
    /// later frames may have no outcome.
    fn style_frames<F>(
        &self,
        frames: &[PathBuf],
        style_frame: &F,
    ) -> Vec<Option<Result<(), Error>>>
    where
        F: Fn(&Path, &Path) -> Result<(), Error> + Sync,
    {
        let output_dir = self.job.output_dir();
        let outcomes: Vec<Mutex<Option<Result<(), Error>>>> =
            frames.iter().map(|_| Mutex::new(None)).collect();

        let next_frame = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let fail_fast = self.policy == FramePolicy::FailFast;

        let worker_fn = || loop {
            if fail_fast && failed.load(Ordering::Relaxed) {
                break;
            }

            let i = next_frame.fetch_add(1, Ordering::Relaxed);
            if i >= frames.len() {
                break;
            }

            let frame = &frames[i];
            let styled = match frame.file_name() {
                Some(name) => output_dir.join(name),
                None => continue,
            };

            log::info!("styling frame {}/{}", i + 1, frames.len());
            let outcome = style_frame(frame, &styled);

            if outcome.is_err() {
                failed.store(true, Ordering::Relaxed);
            }

            let mut slot = match outcomes[i].lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = Some(outcome);
        };

        let n_workers = self.worker_count(frames.len());

        if n_workers == 1 {
            (worker_fn)();
        } else {
            let res = crossbeam_utils::thread::scope(|scope| {
                for _ in 0..n_workers {
                    scope.spawn(|_| (worker_fn)());
                }
            });

            if let Err(panic) = res {
                std::panic::resume_unwind(panic);
            }
        }

        outcomes
            .into_iter()
            .map(|slot| match slot.into_inner() {
                Ok(outcome) => outcome,
                Err(poisoned) => poisoned.into_inner(),
            })
            .collect()
    }
}

/// Styles every frame of the video in `config.subject`, writing the result
/// next to `config.output` with an `mp4` extension.
///
/// `frame_done` is called with every input frame once it has been handled,
/// whether or not styling it succeeded.
pub fn style_video<T, F>(
    config: &StyleConfig,
    network: &NetworkSpec,
    transcoder: &T,
    options: &VideoOptions,
    frame_done: F,
) -> Result<VideoReport, Error>
where
    T: Transcoder,
    F: Fn(&Path) + Sync,
{
    options.check_validity()?;

    let stylizer = VideoStylizer::new(VideoJob::new(&config.subject, options), transcoder)
        .policy(options.policy)
        .max_thread_count(options.max_thread_count);

    stylizer.run(&config.output, |frame, styled| {
        let res = style_image(&config.for_frame(frame, styled), network, None);
        frame_done(frame);
        res
    })
}
