// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use {
    crate::{output::ImageNameSlot, Event},
    glib::{Error, FileError},
    std::{
        path::PathBuf,
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc,
        },
        thread,
    },
    tracing::debug,
    v4l::{
        buffer::Type, io::mmap::Stream, io::traits::CaptureStream, video::Capture, Device, FourCC,
    },
};

/// One decoded luminance frame from the media pipeline.
pub struct FrameData {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

/// The host media pipeline as the control core consumes it: a gate that
/// admits focus frames, and a trigger for the full still capture.
pub trait MediaPipeline {
    fn open_focus_valve(&mut self);
    fn close_focus_valve(&mut self);
    fn trigger_image_capture(&mut self);
}

const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 480;
const STREAM_BUFFER_COUNT: u32 = 4;

/// The bundled pipeline host over a V4L2 capture device.
///
/// The capture thread streams continuously and drops frames; opening the
/// focus valve admits exactly the next frame to the gate, and a still
/// trigger encodes the next frame to the armed image path.
pub struct V4l2Pipeline {
    device_index: usize,
    valve: Arc<AtomicBool>,
    still: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    image_name: ImageNameSlot,
    th: Option<thread::JoinHandle<()>>,
}

impl V4l2Pipeline {
    pub fn new(device_index: usize, image_name: ImageNameSlot) -> Self {
        Self {
            device_index,
            valve: Default::default(),
            still: Default::default(),
            running: Default::default(),
            image_name,
            th: None,
        }
    }

    /// Open the capture device and launch the streaming thread. Frames and
    /// failures are funneled into the runtime's event channel.
    pub fn start(&mut self, tx: mpsc::Sender<Event>) -> Result<(), Error> {
        let device = Device::new(self.device_index).map_err(|e| {
            let msg = format!("Failed to open video device {}: {}", self.device_index, e);
            Error::new(FileError::Failed, &msg)
        })?;

        let mut format = device.format().map_err(|e| {
            let msg = format!("Failed to read video format: {}", e);
            Error::new(FileError::Failed, &msg)
        })?;
        format.width = FRAME_WIDTH;
        format.height = FRAME_HEIGHT;
        format.fourcc = FourCC::new(b"YUYV");

        let format = device.set_format(&format).map_err(|e| {
            let msg = format!("Failed to set video format: {}", e);
            Error::new(FileError::Failed, &msg)
        })?;

        if &format.fourcc.repr != b"YUYV" && &format.fourcc.repr != b"GREY" {
            let msg = format!("Video device negotiated unusable format {}", format.fourcc);
            return Err(Error::new(FileError::Failed, &msg));
        }

        debug!(
            "video pipeline streaming {}x{} {}",
            format.width, format.height, format.fourcc,
        );

        let valve = self.valve.clone();
        let still = self.still.clone();
        let running = self.running.clone();
        let image_name = self.image_name.clone();

        running.store(true, Ordering::SeqCst);

        // The memory-mapped stream borrows the device, so both live on the
        // capture thread.
        let th = thread::spawn(move || {
            let width = format.width as usize;
            let height = format.height as usize;
            let grey = &format.fourcc.repr == b"GREY";

            let mut stream =
                match Stream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFER_COUNT) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let msg = format!("Failed to start capture stream: {}", e);
                        let _ = tx.send(Event::Fatal(Error::new(FileError::Failed, &msg)));
                        return;
                    }
                };

            while running.load(Ordering::SeqCst) {
                let buf = match stream.next() {
                    Ok((buf, _)) => buf,
                    Err(e) => {
                        let msg = format!("Video capture stream failed: {}", e);
                        let error = Error::new(FileError::Io, &msg);
                        let _ = tx.send(Event::Fatal(error));
                        break;
                    }
                };

                let admit = valve
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
                let capture = still
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();

                if !admit && !capture {
                    continue;
                }

                let luminance = extract_luminance(buf, width, height, grey);

                if capture {
                    if let Err(error) = write_still(&image_name, &luminance, width, height) {
                        let _ = tx.send(Event::Fatal(error));
                        break;
                    }
                }

                if admit {
                    let frame = FrameData {
                        data: luminance,
                        width,
                        height,
                    };
                    if tx.send(Event::FocusFrame(frame)).is_err() {
                        break;
                    }
                }
            }
        });

        self.th = Some(th);

        Ok(())
    }
}

impl Drop for V4l2Pipeline {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(th) = self.th.take() {
            let _ = th.join();
        }
    }
}

impl MediaPipeline for V4l2Pipeline {
    fn open_focus_valve(&mut self) {
        self.valve.store(true, Ordering::SeqCst);
    }

    fn close_focus_valve(&mut self) {
        self.valve.store(false, Ordering::SeqCst);
    }

    fn trigger_image_capture(&mut self) {
        self.still.store(true, Ordering::SeqCst);
    }
}

fn extract_luminance(buf: &[u8], width: usize, height: usize, grey: bool) -> Vec<u8> {
    if grey {
        buf.iter().take(width * height).copied().collect()
    } else {
        // YUYV carries luminance on every even byte.
        buf.iter().step_by(2).take(width * height).copied().collect()
    }
}

fn write_still(
    image_name: &ImageNameSlot,
    luminance: &[u8],
    width: usize,
    height: usize,
) -> Result<(), Error> {
    let path = image_name
        .take()
        .unwrap_or_else(|| PathBuf::from("capture.jpg"));

    debug!("writing still capture to {}", path.display());

    image::save_buffer(
        &path,
        luminance,
        width as u32,
        height as u32,
        image::ExtendedColorType::L8,
    )
    .map_err(|e| {
        let msg = format!("Failed to write still '{}': {}", path.display(), e);
        Error::new(FileError::Io, &msg)
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn luminance_extraction_from_yuyv() {
        // Two pixels: Y0 U Y1 V.
        let buf = [10u8, 128, 20, 128, 30, 128, 40, 128];
        assert_eq!(extract_luminance(&buf, 4, 1, false), vec![10, 20, 30, 40]);
    }

    #[test]
    fn luminance_passthrough_for_grey() {
        let buf = [1u8, 2, 3, 4];
        assert_eq!(extract_luminance(&buf, 2, 2, true), vec![1, 2, 3, 4]);
    }
}
