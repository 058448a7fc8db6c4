//! ffmpeg stitcher: turns a directory of rendered frames into a video.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::info;

use crate::error::{NodeError, Result};

const FRAME_LIST_FILE: &str = "frames.txt";

#[derive(Debug, Clone)]
pub struct FfmpegService {
    binary: PathBuf,
}

impl FfmpegService {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        FfmpegService {
            binary: binary.into(),
        }
    }

    /// Stitch every `*.png` in `frames_dir` (ordered by numeric filename)
    /// into `output` at the given frame rate.
    pub async fn stitch(&self, frames_dir: &Path, output: &Path, fps: u32) -> Result<PathBuf> {
        if fps == 0 {
            return Err(NodeError::Stitcher("fps must be positive".into()));
        }

        let mut frames = Vec::new();
        let mut entries = tokio::fs::read_dir(frames_dir)
            .await
            .map_err(|err| NodeError::Stitcher(format!("frames dir unreadable: {err}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| NodeError::Stitcher(err.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".png") {
                frames.push(name);
            }
        }
        if frames.is_empty() {
            return Err(NodeError::Stitcher("no frames to stitch".into()));
        }
        sort_by_frame_number(&mut frames);

        let list_path = frames_dir.join(FRAME_LIST_FILE);
        tokio::fs::write(&list_path, concat_list(&frames)).await?;

        let status = Command::new(&self.binary)
            .arg("-y")
            .arg("-r")
            .arg(fps.to_string())
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(&list_path)
            .arg("-c:v")
            .arg("libx264")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg(output)
            .status()
            .await
            .map_err(|err| {
                NodeError::Stitcher(format!("failed to launch {}: {err}", self.binary.display()))
            })?;

        if !status.success() {
            return Err(NodeError::Stitcher(format!("ffmpeg exited with {status}")));
        }
        info!(output = %output.display(), frames = frames.len(), "video stitched");
        Ok(output.to_path_buf())
    }
}

/// Numeric order by filename stem; non-numeric stems sort last so a stray
/// file cannot shuffle the animation.
fn sort_by_frame_number(frames: &mut [String]) {
    frames.sort_by_key(|name| {
        name.trim_end_matches(".png")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
}

/// ffmpeg concat demuxer input list.
fn concat_list(frames: &[String]) -> String {
    let mut list = String::new();
    for frame in frames {
        list.push_str(&format!("file '{frame}'\n"));
    }
    list
}
