use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;
use tracing::warn;

use crate::error::ScanError;

const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Returning `None` means no frame is ready yet; the loop waits for the next
/// tick without recording anything.
pub trait FrameSource: Send + 'static {
    fn next_frame(&mut self) -> Option<RgbImage>;

    /// Size of the surface the caller draws overlays on, if it differs from
    /// the frame size.
    fn display_size(&self) -> Option<(u32, u32)> {
        None
    }
}

pub struct StillFrameSource {
    frame: RgbImage,
    display: Option<(u32, u32)>,
}

impl StillFrameSource {
    pub fn new(frame: RgbImage) -> Self {
        Self {
            frame,
            display: None,
        }
    }

    pub fn with_display_size(mut self, width: u32, height: u32) -> Self {
        self.display = Some((width, height));
        self
    }
}

impl FrameSource for StillFrameSource {
    fn next_frame(&mut self) -> Option<RgbImage> {
        Some(self.frame.clone())
    }

    fn display_size(&self) -> Option<(u32, u32)> {
        self.display
    }
}

pub struct DirectoryFrameSource {
    paths: Vec<PathBuf>,
    index: usize,
    looping: bool,
}

impl DirectoryFrameSource {
    pub fn open(dir: &Path) -> Result<Self, ScanError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(ScanError::InputUnavailable);
        }
        Ok(Self {
            paths,
            index: 0,
            looping: false,
        })
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for DirectoryFrameSource {
    fn next_frame(&mut self) -> Option<RgbImage> {
        if self.index >= self.paths.len() {
            if !self.looping {
                return None;
            }
            self.index = 0;
        }
        let path = &self.paths[self.index];
        self.index += 1;
        match image::open(path) {
            Ok(image) => Some(image.to_rgb8()),
            Err(err) => {
                warn!("Unable to read frame {}: {}", path.display(), err);
                None
            }
        }
    }
}
