use std::sync::{Arc, OnceLock};

use crate::slot::LatestFrameSlot;
use crate::source::{StopFlag, redact_credentials};

/// Cells the landing grid always exposes, matching the 2x2 reference layout.
/// Requests for an empty cell answer 204, not 404.
pub const GRID_MIN_CELLS: usize = 4;

/// One configured camera: its source URL, the dimensions discovered at
/// stream start (fixed for the life of the slot), the shared latest-frame
/// slot, and the stop flag for its capture loop.
pub struct CameraSlot {
    index: usize,
    url: String,
    display_url: String,
    dimensions: OnceLock<(u32, u32)>,
    slot: LatestFrameSlot,
    stop: StopFlag,
}

impl CameraSlot {
    fn new(index: usize, url: String) -> Self {
        let display_url = redact_credentials(&url);
        Self {
            index,
            url,
            display_url,
            dimensions: OnceLock::new(),
            slot: LatestFrameSlot::new(),
            stop: StopFlag::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Full source URL, credentials included; only the capture side uses it.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Credential-redacted URL for logs and status reporting.
    pub fn display_url(&self) -> &str {
        &self.display_url
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions.get().copied()
    }

    /// First writer wins; dimensions never change once discovered.
    pub fn record_dimensions(&self, dimensions: (u32, u32)) {
        let _ = self.dimensions.set(dimensions);
    }

    pub fn slot(&self) -> &LatestFrameSlot {
        &self.slot
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }
}

/// Owns every camera slot for the life of the process. The HTTP layer holds
/// it behind an `Arc` and looks cameras up by index; there is no other
/// shared ingestion state.
pub struct StreamRegistry {
    cameras: Vec<Arc<CameraSlot>>,
}

impl StreamRegistry {
    pub fn new(urls: impl IntoIterator<Item = String>) -> Self {
        let cameras = urls
            .into_iter()
            .enumerate()
            .map(|(index, url)| Arc::new(CameraSlot::new(index, url)))
            .collect();
        Self { cameras }
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<CameraSlot>> {
        self.cameras.get(index)
    }

    pub fn cameras(&self) -> &[Arc<CameraSlot>] {
        &self.cameras
    }

    /// Requests termination of every capture loop.
    pub fn stop_all(&self) {
        for camera in &self.cameras {
            camera.stop_flag().stop();
        }
    }
}

/// Maps a camera index to its 1-based cell in the two-column landing grid
/// (0 -> 1x1, 1 -> 1x2, 2 -> 2x1, ...).
pub fn grid_cell(index: usize) -> (usize, usize) {
    (index / 2 + 1, index % 2 + 1)
}
