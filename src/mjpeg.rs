use std::convert::Infallible;

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;
use tracing::warn;

use crate::frame::RawFrame;
use crate::slot::FrameWatcher;

/// Multipart boundary literal; browsers match it against every part marker.
pub const BOUNDARY: &str = "frame";

/// Content type of the whole streaming response.
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Frames one JPEG image as a multipart section, byte for byte what
/// browsers expect for `multipart/x-mixed-replace`.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let mut part = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + 2);
    part.put_slice(PART_HEADER);
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Compresses one frame to JPEG at the given quality.
pub fn encode_jpeg(frame: &RawFrame, quality: u8) -> image::ImageResult<Vec<u8>> {
    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder.encode(
        frame.data(),
        frame.width(),
        frame.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(jpeg)
}

/// Serves one client its own unending part sequence from a camera's slot.
///
/// Each multiplexer only reads the shared slot and the body stream is
/// polled at the client's pace, so a stalled client delays nothing but its
/// own loop. A frame whose sequence number has not advanced since the last
/// part is neither re-encoded nor re-sent, and every client encodes its own
/// JPEG from the shared frame.
pub struct MjpegMultiplexer {
    watcher: FrameWatcher,
    quality: u8,
    last_seq: Option<u64>,
}

impl MjpegMultiplexer {
    pub fn new(watcher: FrameWatcher, quality: u8) -> Self {
        Self {
            watcher,
            quality,
            last_seq: None,
        }
    }

    /// Next part for this client: waits for a frame newer than the last one
    /// served, encodes it, and frames it. An encode failure skips that frame
    /// and the loop keeps going; `None` only when the camera's slot is gone.
    async fn next_part(&mut self) -> Option<Bytes> {
        loop {
            let published = self.watcher.next_newer(self.last_seq).await?;
            self.last_seq = Some(published.seq);

            let quality = self.quality;
            let encoded =
                tokio::task::spawn_blocking(move || encode_jpeg(&published.frame, quality)).await;
            match encoded {
                Ok(Ok(jpeg)) => return Some(encode_part(&jpeg)),
                Ok(Err(error)) => warn!(%error, "JPEG encode failed, skipping frame"),
                Err(error) => warn!(%error, "JPEG encode task failed, skipping frame"),
            }
        }
    }

    /// Turns the multiplexer into a response-body stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        futures::stream::unfold(self, |mut mux| async move {
            let part = mux.next_part().await?;
            Some((Ok::<_, Infallible>(part), mux))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::LatestFrameSlot;
    use futures::StreamExt;
    use std::time::Duration;

    fn gradient(width: u32, height: u32) -> RawFrame {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for y in 0..height {
            for x in 0..width {
                data.push((x * 255 / width.max(1)) as u8);
                data.push((y * 255 / height.max(1)) as u8);
                data.push(128);
            }
        }
        RawFrame::from_packed(width, height, data).unwrap()
    }

    #[test]
    fn part_layout_matches_the_wire_format() {
        let part = encode_part(b"JPEG");
        assert_eq!(
            part.as_ref(),
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n"
        );
    }

    #[test]
    fn encoded_jpeg_decodes_back_to_the_same_image() {
        let frame = gradient(16, 12);
        let jpeg = encode_jpeg(&frame, 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);

        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 12);
        for (x, y, pixel) in decoded.enumerate_pixels() {
            let offset = (y as usize * 16 + x as usize) * 3;
            for channel in 0..3 {
                let original = i16::from(frame.data()[offset + channel]);
                let roundtripped = i16::from(pixel[channel]);
                assert!(
                    (original - roundtripped).abs() <= 24,
                    "pixel ({x},{y}) channel {channel} drifted: {original} -> {roundtripped}"
                );
            }
        }
    }

    #[tokio::test]
    async fn unchanged_frame_is_not_resent() {
        let slot = LatestFrameSlot::new();
        slot.publish(gradient(8, 8));

        let mux = MjpegMultiplexer::new(slot.watch(), 80);
        let mut stream = Box::pin(mux.into_stream());

        let first = stream.next().await.unwrap().unwrap();
        assert!(first.starts_with(b"--frame\r\n"));

        // Same sequence number, so the stream must stay pending.
        let pending = tokio::time::timeout(Duration::from_millis(30), stream.next()).await;
        assert!(pending.is_err());

        slot.publish(gradient(8, 8));
        let second = tokio::time::timeout(Duration::from_millis(500), stream.next())
            .await
            .expect("new publish should produce a part")
            .unwrap()
            .unwrap();
        assert!(second.ends_with(b"\r\n"));
    }
}
