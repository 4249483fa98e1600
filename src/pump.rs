use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::registry::CameraSlot;
use crate::source::{FrameSource, FrameStream, SourceError};

/// Reconnect policy for one camera's pump.
///
/// `max_reconnects` caps consecutive failed opens; a transport failure after
/// a successful open resets the count, so a feed that keeps coming up is
/// retried forever while one that never answers eventually gives up.
#[derive(Clone, Debug)]
pub struct PumpPolicy {
    pub reopen_interval: Duration,
    pub max_reconnects: Option<u32>,
}

impl Default for PumpPolicy {
    fn default() -> Self {
        Self {
            reopen_interval: Duration::from_secs(2),
            max_reconnects: None,
        }
    }
}

/// Drives one camera in the background: opens its source, publishes every
/// decoded frame into the camera's slot, and reopens with backoff when the
/// transport dies. Each camera pumps independently; a stall here never
/// touches another camera or any HTTP client.
pub fn spawn<S: FrameSource>(
    camera: Arc<CameraSlot>,
    mut source: S,
    policy: PumpPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let index = camera.index();
        let mut failed_opens: u32 = 0;

        loop {
            if camera.stop_flag().is_stopped() {
                break;
            }

            let camera_c = camera.clone();
            let cycle = tokio::task::spawn_blocking(move || {
                let result = capture_cycle(&mut source, &camera_c);
                (source, result)
            })
            .await;

            let (returned, result) = match cycle {
                Ok(outcome) => outcome,
                Err(error) => {
                    error!(camera = index, ?error, "Capture task panicked");
                    break;
                }
            };
            source = returned;

            match result {
                Ok(()) => {
                    info!(camera = index, "Capture stopped");
                    break;
                }
                Err(failure) => {
                    if camera.stop_flag().is_stopped() {
                        break;
                    }
                    match failure {
                        SourceError::Transport { .. } => failed_opens = 0,
                        SourceError::Unavailable { .. } => failed_opens += 1,
                    }
                    if let Some(cap) = policy.max_reconnects
                        && failed_opens > cap
                    {
                        error!(
                            camera = index,
                            attempts = failed_opens,
                            "Source never became available, giving up"
                        );
                        break;
                    }
                    warn!(
                        camera = index,
                        error = %failure,
                        reopen_in = ?policy.reopen_interval,
                        "Source failed, reopening after backoff"
                    );
                    tokio::time::sleep(policy.reopen_interval).await;
                }
            }
        }
    })
}

/// One open-and-decode cycle. Runs on a blocking thread; `Ok` means the stop
/// flag ended it cleanly.
fn capture_cycle<S: FrameSource>(source: &mut S, camera: &CameraSlot) -> Result<(), SourceError> {
    let mut stream = source.open()?;
    let (width, height) = stream.dimensions();
    camera.record_dimensions((width, height));
    info!(
        camera = camera.index(),
        url = camera.display_url(),
        width,
        height,
        "Source opened"
    );

    let slot = camera.slot();
    stream.run(&mut |frame| slot.publish(frame))
}
