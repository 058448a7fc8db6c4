//! Blender invocation: the external rendering collaborator.
//!
//! The engine itself is out of scope; this module owns the two named
//! interfaces the core consumes: render one frame of a scene file, and
//! extract scene properties (frame range, fps, engine) from a scene file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{NodeError, Result};

const INFO_START: &str = "BLEND_INFO_START";
const INFO_END: &str = "BLEND_INFO_END";

/// Python expression run inside Blender to dump scene properties between
/// recognizable markers.
const ANALYZE_EXPR: &str = r#"
import bpy, json
scene = bpy.context.scene
info = {
    "frame_start": scene.frame_start,
    "frame_end": scene.frame_end,
    "fps": scene.render.fps,
    "renderer": scene.render.engine,
}
print("BLEND_INFO_START")
print(json.dumps(info))
print("BLEND_INFO_END")
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneInfo {
    pub frame_start: u32,
    pub frame_end: u32,
    pub fps: u32,
    pub renderer: String,
}

#[derive(Debug, Clone)]
pub struct BlenderService {
    binary: PathBuf,
}

impl BlenderService {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        BlenderService {
            binary: binary.into(),
        }
    }

    /// Render a single frame of `scene` into `out_dir`, returning the path
    /// of the produced image, named `<frame>.png`.
    pub async fn render_frame(&self, scene: &Path, frame: u32, out_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(out_dir).await?;
        // Blender expands #### in the output template to the zero-padded
        // frame number.
        let template = out_dir.join("####");
        debug!(scene = %scene.display(), frame, "invoking renderer");

        let output = Command::new(&self.binary)
            .arg("-b")
            .arg(scene)
            .arg("-o")
            .arg(&template)
            .arg("-F")
            .arg("PNG")
            .arg("-f")
            .arg(frame.to_string())
            .output()
            .await
            .map_err(|err| NodeError::Renderer {
                frame,
                detail: format!("failed to launch {}: {err}", self.binary.display()),
            })?;

        if !output.status.success() {
            return Err(NodeError::Renderer {
                frame,
                detail: tail(&output.stderr, 512),
            });
        }

        let padded = out_dir.join(format!("{frame:04}.png"));
        let final_path = out_dir.join(format!("{frame}.png"));
        if tokio::fs::try_exists(&padded).await.unwrap_or(false) {
            tokio::fs::rename(&padded, &final_path).await?;
        } else if !tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            return Err(NodeError::MissingArtifact(padded));
        }
        info!(frame, path = %final_path.display(), "frame rendered");
        Ok(final_path)
    }

    /// Extract scene properties from a scene file.
    pub async fn analyze(&self, scene: &Path) -> Result<SceneInfo> {
        let output = Command::new(&self.binary)
            .arg("-b")
            .arg(scene)
            .arg("--python-expr")
            .arg(ANALYZE_EXPR)
            .output()
            .await
            .map_err(|err| {
                NodeError::InvalidInput(format!(
                    "failed to launch {}: {err}",
                    self.binary.display()
                ))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_scene_info(&stdout).ok_or_else(|| {
            NodeError::InvalidInput(format!(
                "renderer produced no scene info: {}",
                tail(&output.stderr, 256)
            ))
        })
    }
}

/// Pull the JSON between the info markers out of renderer stdout.
fn parse_scene_info(stdout: &str) -> Option<SceneInfo> {
    let start = stdout.find(INFO_START)? + INFO_START.len();
    let end = stdout.find(INFO_END)?;
    serde_json::from_str(stdout.get(start..end)?.trim()).ok()
}

fn tail(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scene_info_between_markers() {
        let stdout = "Blender 4.0\nnoise\nBLEND_INFO_START\n\
                      {\"frame_start\":1,\"frame_end\":250,\"fps\":24,\"renderer\":\"CYCLES\"}\n\
                      BLEND_INFO_END\nmore noise";
        let info = parse_scene_info(stdout).unwrap();
        assert_eq!(info.frame_start, 1);
        assert_eq!(info.frame_end, 250);
        assert_eq!(info.fps, 24);
        assert_eq!(info.renderer, "CYCLES");
    }

    #[test]
    fn test_parse_scene_info_requires_both_markers() {
        assert!(parse_scene_info("no markers at all").is_none());
        assert!(parse_scene_info("BLEND_INFO_START\n{\"x\":1}").is_none());
        assert!(parse_scene_info("BLEND_INFO_START\nnot json\nBLEND_INFO_END").is_none());
    }
}
