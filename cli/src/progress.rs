use indicatif::{ProgressBar, ProgressStyle};
use neural_style::{ProgressUpdate, StyleProgress};

/// Shows the optimizer's iterations and current cost
pub struct IterationProgress {
    pb: ProgressBar,
    len: u64,
}

impl IterationProgress {
    pub fn new(iterations: u32) -> Self {
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} cost {msg}")
            .progress_chars("##-");

        let len = u64::from(iterations);
        let pb = ProgressBar::new(len);
        pb.set_style(sty);

        Self { pb, len }
    }
}

impl Drop for IterationProgress {
    fn drop(&mut self) {
        self.pb.finish();
    }
}

impl StyleProgress for IterationProgress {
    fn update(&mut self, update: ProgressUpdate<'_>) {
        if u64::from(update.total) != self.len {
            self.len = u64::from(update.total);
            self.pb.set_length(self.len);
        }

        self.pb.set_position(u64::from(update.iteration) + 1);
        self.pb.set_message(&format!("{:.4e}", update.cost));
    }
}

/// A spinner counting styled video frames, the frame count isn't known
/// until the video has been split
pub fn frame_counter(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("[{elapsed_precise}] {spinner} {pos} frames styled"),
    );
    pb
}
