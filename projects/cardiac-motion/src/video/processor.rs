use crate::video::VideoReader;
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use opencv::core::Mat;
use std::time::{Duration, Instant};

pub struct ProcessingStats {
    pub processed_frames: usize,
    pub duration: Duration,
}

/// A trait for handling video frames. This separates the "what to do with a frame"
/// from the "how to read" logic.
pub trait FrameProcessor {
    fn process(&mut self, frame: Mat) -> Result<()>;
}

/// Blanket implementation so any closure with the right signature
/// automatically implements FrameProcessor.
impl<F> FrameProcessor for F
where
    F: FnMut(Mat) -> Result<()>,
{
    fn process(&mut self, frame: Mat) -> Result<()> {
        self(frame)
    }
}

/// Progress bar shared by the pipeline's long-running loops.
pub fn stage_progress_bar(len: u64, stage: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    let template = format!(
        "{{spinner:.green}} {stage:<8} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} ({{per_sec:.1.yellow}}, {{eta}})"
    );
    match ProgressStyle::default_bar().template(&template) {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => tracing::debug!("Invalid progress template: {}", e),
    }
    pb
}

/// Feed every decoded frame to `processor` until end of stream.
///
/// A decode error mid-stream is logged and treated as end of stream; errors returned
/// by the processor abort the loop.
pub fn drain_frames<P>(reader: &mut dyn VideoReader, mut processor: P) -> Result<ProcessingStats>
where
    P: FrameProcessor,
{
    let start_time = Instant::now();
    let pb = stage_progress_bar(reader.frame_count() as u64, "extract");
    let mut processed_frames = 0;

    loop {
        match reader.next_frame() {
            Ok(Some(frame)) => {
                processor.process(frame)?;
                processed_frames += 1;
                pb.inc(1);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(
                    "Decode error after {} frames, treating as end of stream: {:#}",
                    processed_frames,
                    e
                );
                break;
            }
        }
    }

    pb.finish_and_clear();

    Ok(ProcessingStats {
        processed_frames,
        duration: start_time.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::SyntheticReader;

    #[test]
    fn test_drain_frames_visits_every_frame() {
        let mut reader = SyntheticReader::new(5, 32, 24, 30.0);
        let mut seen = Vec::new();
        let stats = drain_frames(&mut reader, |frame: Mat| -> Result<()> {
            seen.push(crate::test_utils::frame_tag(&frame)?);
            Ok(())
        })
        .unwrap();

        assert_eq!(stats.processed_frames, 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_drain_frames_stops_on_decode_error() {
        let mut reader = SyntheticReader::new(6, 32, 24, 30.0).failing_at(3);
        let stats = drain_frames(&mut reader, |_frame: Mat| -> Result<()> { Ok(()) }).unwrap();
        assert_eq!(stats.processed_frames, 3);
    }

    #[test]
    fn test_drain_frames_propagates_processor_error() {
        let mut reader = SyntheticReader::new(4, 32, 24, 30.0);
        let result = drain_frames(&mut reader, |_frame: Mat| -> Result<()> {
            Err(anyhow::anyhow!("disk full"))
        });
        assert!(result.is_err());
    }
}
