use std::{fmt, path::PathBuf};

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct ShapeMismatch {
    pub(crate) name: &'static str,
    pub(crate) expected: Vec<usize>,
    pub(crate) actual: Vec<usize>,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} has shape {:?}, but {:?} was expected",
            self.name, self.actual, self.expected
        )
    }
}

/// The external transcoding step that was being run
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TranscodeStage {
    ExtractFrames,
    ExtractAudio,
    Mux,
}

impl fmt::Display for TranscodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExtractFrames => "extract-frames",
            Self::ExtractAudio => "extract-audio",
            Self::Mux => "mux",
        })
    }
}

#[derive(Debug)]
pub struct TranscodeFailure {
    pub(crate) stage: TranscodeStage,
    /// The exit code, `None` if the process was terminated by a signal
    pub(crate) status: Option<i32>,
    pub(crate) stderr: String,
}

impl TranscodeFailure {
    pub fn stage(&self) -> TranscodeStage {
        self.stage
    }
}

impl fmt::Display for TranscodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "{} stage exited with status {}", self.stage, code)?,
            None => write!(f, "{} stage was terminated by a signal", self.stage)?,
        }

        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            // ffmpeg is chatty, the last line is usually the one that matters
            let last = stderr.lines().last().unwrap_or(stderr);
            write!(f, ": {}", last)?;
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// A required input image was not provided
    MissingInput(&'static str),
    /// A layer weight could not be parsed from its `index,weight` form
    InvalidWeight(String),
    /// A layer weight addressed a layer the network doesn't have
    LayerOutOfRange { index: usize, slots: usize },
    /// Tensors handed to the loss network don't line up
    ShapeMismatch(ShapeMismatch),
    /// The network file was malformed
    InvalidNetwork(String),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// The user specified an image format we don't support as the output
    UnsupportedOutputFormat(String),
    /// An external tool, eg `ffmpeg`, could not be found
    ToolNotFound(String),
    /// An external transcoding step failed
    Transcode(TranscodeFailure),
    /// Styling a single video frame failed
    Frame { frame: PathBuf, source: Box<Error> },
    /// Frame extraction produced no frames to style
    NoFrames(PathBuf),
    /// Video frames must have an even, non-zero width
    InvalidFrameWidth(u32),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Frame { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::MissingInput(which) => write!(f, "no {} image was provided", which),
            Self::InvalidWeight(text) => write!(
                f,
                "layer weight '{}' must be in the form 'layer,weight', eg '9,1.0'",
                text
            ),
            Self::LayerOutOfRange { index, slots } => write!(
                f,
                "layer index {} is out of range, the network only has {} weighted layers",
                index, slots
            ),
            Self::ShapeMismatch(sm) => write!(f, "{}", sm),
            Self::InvalidNetwork(reason) => write!(f, "invalid network file: {}", reason),
            Self::Io(io) => write!(f, "{}", io),
            Self::UnsupportedOutputFormat(fmt) => {
                write!(f, "the output format '{}' is not supported", fmt)
            }
            Self::ToolNotFound(tool) => write!(f, "unable to find '{}' in PATH", tool),
            Self::Transcode(tf) => write!(f, "{}", tf),
            Self::Frame { frame, source } => {
                write!(f, "failed to style frame '{}': {}", frame.display(), source)
            }
            Self::NoFrames(dir) => write!(
                f,
                "no frames were extracted into '{}'",
                dir.display()
            ),
            Self::InvalidFrameWidth(width) => write!(
                f,
                "frame width {} must be a positive even number",
                width
            ),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

impl From<TranscodeFailure> for Error {
    fn from(tf: TranscodeFailure) -> Self {
        Self::Transcode(tf)
    }
}
