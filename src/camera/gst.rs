// libcamera capture through a GStreamer pipeline
//
//   libcamerasrc ! capsfilter ! videoflip ! textoverlay ! tee
//     tee ! queue ! videoconvert ! x264enc ! capsfilter ! h264parse ! appsink  (segments)
//     tee ! queue(leaky) ! videoscale ! videoconvert ! capsfilter ! jpegenc ! appsink  (stills)
//
// Encoded access units are appended to the open segment file from the
// appsink callback. Starting or splitting a segment requests a key unit
// upstream and swaps files on the next keyframe, so every file starts
// decodable and no frame is written twice or dropped at the boundary.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use super::{CameraDriver, CameraError, CameraSettings, ImagingModes, RecordingParams, Result, StillParams};

/// How long a split waits for the encoder to deliver the requested keyframe
const SWAP_WAIT: Duration = Duration::from_secs(1);
/// How long a capture waits for the first still after (re)start
const STILL_WAIT: Duration = Duration::from_secs(2);

fn pipeline_err(context: &str, e: impl std::fmt::Display) -> CameraError {
    CameraError::Pipeline(format!("{}: {}", context, e))
}

// ============================================================================
// Shared sink state
// ============================================================================

/// Written by the appsink callbacks, read by the driver
#[derive(Default)]
struct SinkState {
    current: Option<(PathBuf, BufWriter<File>)>,
    /// File to switch to on the next keyframe
    pending: Option<(PathBuf, BufWriter<File>)>,
    write_error: Option<String>,
    latest_still: Option<Vec<u8>>,
}

impl SinkState {
    fn push_access_unit(&mut self, data: &[u8], keyframe: bool) {
        if keyframe {
            if let Some(next) = self.pending.take() {
                if let Some((path, mut old)) = self.current.replace(next) {
                    if let Err(e) = old.flush() {
                        self.write_error = Some(format!("{}: {}", path.display(), e));
                    }
                }
            }
        }
        if let Some((path, writer)) = self.current.as_mut() {
            if let Err(e) = writer.write_all(data) {
                self.write_error = Some(format!("{}: {}", path.display(), e));
            }
        }
    }

    fn finish(&mut self) -> std::io::Result<()> {
        self.pending = None;
        match self.current.take() {
            Some((_, mut writer)) => {
                writer.flush()?;
                writer.get_ref().sync_data()
            }
            None => Ok(()),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

struct Pipeline {
    pipeline: gst::Pipeline,
    source: gst::Element,
    overlay: gst::Element,
    h264_sink: gst_app::AppSink,
}

impl Pipeline {
    fn build(settings: &CameraSettings, sink: Arc<Mutex<SinkState>>) -> Result<Self> {
        let pipeline = gst::Pipeline::with_name("trafficcam");

        let source = gst::ElementFactory::make("libcamerasrc")
            .name("camera")
            .build()
            .map_err(|e| pipeline_err("libcamerasrc", e))?;
        let raw_caps = gst::Caps::builder("video/x-raw")
            .field("width", settings.width as i32)
            .field("height", settings.height as i32)
            .field("framerate", gst::Fraction::new(settings.fps as i32, 1))
            .build();
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &raw_caps)
            .build()
            .map_err(|e| pipeline_err("capsfilter", e))?;
        let flip = gst::ElementFactory::make("videoflip")
            .property_from_str("method", flip_method(settings.rotation))
            .build()
            .map_err(|e| pipeline_err("videoflip", e))?;
        let overlay = gst::ElementFactory::make("textoverlay")
            .name("annotation")
            .property("text", "")
            .property_from_str("valignment", "top")
            .property_from_str("halignment", "left")
            .property("shaded-background", true)
            .build()
            .map_err(|e| pipeline_err("textoverlay", e))?;
        let tee = gst::ElementFactory::make("tee")
            .build()
            .map_err(|e| pipeline_err("tee", e))?;

        // Segment branch
        let video_queue = gst::ElementFactory::make("queue")
            .build()
            .map_err(|e| pipeline_err("queue", e))?;
        let video_convert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| pipeline_err("videoconvert", e))?;
        let encoder = make_encoder(settings)?;
        let h264_caps = gst::Caps::builder("video/x-h264")
            .field("profile", settings.h264_profile.as_str())
            .field("level", settings.h264_level.as_str())
            .build();
        let h264_filter = gst::ElementFactory::make("capsfilter")
            .property("caps", &h264_caps)
            .build()
            .map_err(|e| pipeline_err("capsfilter", e))?;
        let parser = gst::ElementFactory::make("h264parse")
            .property("config-interval", -1i32)
            .build()
            .map_err(|e| pipeline_err("h264parse", e))?;
        let h264_sink = gst_app::AppSink::builder()
            .name("h264_sink")
            .caps(
                &gst::Caps::builder("video/x-h264")
                    .field("stream-format", "byte-stream")
                    .field("alignment", "au")
                    .build(),
            )
            .sync(false)
            .build();

        // Still branch
        let still_queue = gst::ElementFactory::make("queue")
            .property("max-size-buffers", 1u32)
            .property_from_str("leaky", "downstream")
            .build()
            .map_err(|e| pipeline_err("queue", e))?;
        let scale = gst::ElementFactory::make("videoscale")
            .build()
            .map_err(|e| pipeline_err("videoscale", e))?;
        let still_convert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| pipeline_err("videoconvert", e))?;
        let still_caps = gst::Caps::builder("video/x-raw")
            .field("width", settings.preview_width as i32)
            .field("height", settings.preview_height as i32)
            .build();
        let still_filter = gst::ElementFactory::make("capsfilter")
            .property("caps", &still_caps)
            .build()
            .map_err(|e| pipeline_err("capsfilter", e))?;
        let jpeg = gst::ElementFactory::make("jpegenc")
            .build()
            .map_err(|e| pipeline_err("jpegenc", e))?;
        let still_sink = gst_app::AppSink::builder()
            .name("still_sink")
            .max_buffers(1)
            .drop(true)
            .sync(false)
            .build();

        pipeline
            .add_many([
                &source,
                &capsfilter,
                &flip,
                &overlay,
                &tee,
                &video_queue,
                &video_convert,
                &encoder,
                &h264_filter,
                &parser,
                h264_sink.upcast_ref(),
                &still_queue,
                &scale,
                &still_convert,
                &still_filter,
                &jpeg,
                still_sink.upcast_ref(),
            ])
            .map_err(|e| pipeline_err("failed to add elements", e))?;
        gst::Element::link_many([&source, &capsfilter, &flip, &overlay, &tee])
            .map_err(|e| pipeline_err("failed to link source", e))?;
        gst::Element::link_many([
            &tee,
            &video_queue,
            &video_convert,
            &encoder,
            &h264_filter,
            &parser,
            h264_sink.upcast_ref(),
        ])
        .map_err(|e| pipeline_err("failed to link encoder branch", e))?;
        gst::Element::link_many([
            &tee,
            &still_queue,
            &scale,
            &still_convert,
            &still_filter,
            &jpeg,
            still_sink.upcast_ref(),
        ])
        .map_err(|e| pipeline_err("failed to link still branch", e))?;

        let video_state = sink.clone();
        h264_sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    if let Some(buffer) = sample.buffer() {
                        let keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
                        if let Ok(map) = buffer.map_readable() {
                            video_state.lock().push_access_unit(map.as_slice(), keyframe);
                        }
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let still_state = sink;
        still_sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    if let Some(buffer) = sample.buffer() {
                        if let Ok(map) = buffer.map_readable() {
                            still_state.lock().latest_still = Some(map.as_slice().to_vec());
                        }
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        Ok(Self {
            pipeline,
            source,
            overlay,
            h264_sink,
        })
    }

    fn play(&self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| pipeline_err("failed to start pipeline", e))?;
        Ok(())
    }

    fn request_keyframe(&self) {
        let event = gst_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        if !self.h264_sink.send_event(event) {
            log::debug!("Key unit request was not handled upstream");
        }
    }

    /// First error or EOS on the bus within `timeout`
    fn poll_bus(&self, timeout: Duration) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Err(CameraError::Pipeline("pipeline has no bus".to_string()));
        };
        let timeout = gst::ClockTime::from_nseconds(timeout.as_nanos() as u64);
        match bus.timed_pop_filtered(timeout, &[gst::MessageType::Error, gst::MessageType::Eos]) {
            Some(msg) => match msg.view() {
                gst::MessageView::Error(err) => {
                    let src = err.src().map(|s| s.name().to_string()).unwrap_or_default();
                    Err(CameraError::Transient(format!(
                        "{}: {} ({:?})",
                        src,
                        err.error(),
                        err.debug()
                    )))
                }
                _ => Err(CameraError::Transient("pipeline reached end of stream".to_string())),
            },
            None => Ok(()),
        }
    }

    fn shutdown(&self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flip_method(rotation: u32) -> &'static str {
    match rotation {
        90 => "clockwise",
        180 => "rotate-180",
        270 => "counterclockwise",
        _ => "none",
    }
}

fn make_encoder(settings: &CameraSettings) -> Result<gst::Element> {
    let mut builder = gst::ElementFactory::make("x264enc")
        .property_from_str("tune", "zerolatency")
        .property_from_str("speed-preset", "superfast")
        .property("key-int-max", settings.fps.max(1) * 2);
    builder = if settings.bitrate > 0 {
        builder.property("bitrate", (settings.bitrate / 1000).max(1))
    } else if settings.h264_quality > 0 {
        builder
            .property_from_str("pass", "quant")
            .property("quantizer", settings.h264_quality)
    } else {
        builder
    };
    builder.build().map_err(|e| pipeline_err("x264enc", e))
}

/// libcamerasrc control properties for each imaging mode
fn imaging_controls(modes: &ImagingModes) -> [(&'static str, String); 3] {
    let exposure = match modes.exposure_mode.as_str() {
        "auto" => "normal",
        "night" | "verylong" | "long" => "long",
        "sports" | "short" => "short",
        other => other,
    };
    let metering = match modes.meter_mode.as_str() {
        "average" => "centre-weighted",
        "backlit" | "matrix" => "matrix",
        other => other,
    };
    [
        ("ae-exposure-mode", exposure.to_string()),
        ("awb-mode", modes.awb_mode.clone()),
        ("ae-metering-mode", metering.to_string()),
    ]
}

/// Set an enum property only if the element has it and knows the nick
fn set_enum_property(element: &gst::Element, name: &str, nick: &str) -> bool {
    let Some(pspec) = element.find_property(name) else {
        return false;
    };
    let known = gst::glib::EnumClass::with_type(pspec.value_type())
        .map(|class| class.value_by_nick(nick).is_some())
        .unwrap_or(false);
    if known {
        element.set_property_from_str(name, nick);
    }
    known
}

// ============================================================================
// Driver
// ============================================================================

pub struct GstCamera {
    settings: CameraSettings,
    imaging: ImagingModes,
    annotation: String,
    sink: Arc<Mutex<SinkState>>,
    pipeline: Option<Pipeline>,
    recording: bool,
}

impl GstCamera {
    pub fn new(settings: CameraSettings) -> Result<Self> {
        gst::init().map_err(|e| CameraError::Unavailable(format!("GStreamer: {}", e)))?;
        let imaging = settings.imaging.clone();
        let mut camera = Self {
            settings,
            imaging,
            annotation: String::new(),
            sink: Arc::new(Mutex::new(SinkState::default())),
            pipeline: None,
            recording: false,
        };
        camera.open_pipeline()?;
        log::info!(
            "Camera opened: {}x{} @ {} fps, {} kbit/s",
            camera.settings.width,
            camera.settings.height,
            camera.settings.fps,
            camera.settings.bitrate / 1000
        );
        Ok(camera)
    }

    fn open_pipeline(&mut self) -> Result<()> {
        *self.sink.lock() = SinkState::default();
        let pipeline = Pipeline::build(&self.settings, self.sink.clone())?;
        self.apply_controls(&pipeline.source);
        pipeline.overlay.set_property("text", self.annotation.as_str());
        pipeline.play()?;
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn apply_controls(&self, source: &gst::Element) {
        for (property, nick) in imaging_controls(&self.imaging) {
            if !set_enum_property(source, property, &nick) {
                log::warn!("Camera control {}={} not supported, ignored", property, nick);
            }
        }
        if self.imaging.drc_strength != "off" {
            log::debug!("drc_strength has no libcamerasrc control, ignored");
        }
    }

    fn pipeline(&self) -> Result<&Pipeline> {
        self.pipeline.as_ref().ok_or(CameraError::Closed)
    }

    fn take_write_error(&self) -> Result<()> {
        match self.sink.lock().write_error.take() {
            Some(e) => Err(CameraError::Transient(format!("segment write failed: {}", e))),
            None => Ok(()),
        }
    }

    /// Queue `path` as the next segment file and ask for a keyframe
    fn queue_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        self.sink.lock().pending = Some((path.to_path_buf(), BufWriter::new(file)));
        self.pipeline()?.request_keyframe();
        Ok(())
    }
}

impl CameraDriver for GstCamera {
    fn is_recording(&self) -> bool {
        self.recording
    }

    fn start_recording(&mut self, path: &Path, params: &RecordingParams) -> Result<()> {
        self.pipeline()?;
        if self.recording {
            let current = self
                .sink
                .lock()
                .current
                .as_ref()
                .map(|(p, _)| p.display().to_string())
                .unwrap_or_default();
            return Err(CameraError::AlreadyRecording(current));
        }
        if params.width != self.settings.width || params.height != self.settings.height {
            log::warn!(
                "Recording {}x{} requested but pipeline runs at {}x{}",
                params.width,
                params.height,
                self.settings.width,
                self.settings.height
            );
        }
        self.queue_file(path)?;
        self.recording = true;
        Ok(())
    }

    fn wait_recording(&mut self, timeout: Duration) -> Result<()> {
        if !self.recording {
            return Err(CameraError::NotRecording);
        }
        self.take_write_error()?;
        self.pipeline()?.poll_bus(timeout)
    }

    fn split_recording(&mut self, path: &Path) -> Result<()> {
        if !self.recording {
            return Err(CameraError::NotRecording);
        }
        self.take_write_error()?;
        self.queue_file(path)?;

        let deadline = Instant::now() + SWAP_WAIT;
        while self.sink.lock().pending.is_some() {
            if Instant::now() >= deadline {
                log::debug!("Keyframe not seen yet, {} opens on the next one", path.display());
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    fn capture(&mut self, path: &Path, _params: &StillParams) -> Result<()> {
        self.pipeline()?;
        let deadline = Instant::now() + STILL_WAIT;
        let still = loop {
            if let Some(still) = self.sink.lock().latest_still.take() {
                break still;
            }
            if Instant::now() >= deadline {
                return Err(CameraError::Transient("no still frame available".to_string()));
            }
            std::thread::sleep(Duration::from_millis(20));
        };
        std::fs::write(path, still)?;
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<()> {
        if !self.recording {
            return Err(CameraError::NotRecording);
        }
        self.recording = false;
        self.sink.lock().finish()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.recording = false;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown();
        }
        self.sink.lock().finish()?;
        Ok(())
    }

    fn reinitialize(&mut self) -> Result<()> {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown();
        }
        self.recording = false;
        self.open_pipeline()?;
        log::info!("Camera pipeline rebuilt");
        Ok(())
    }

    fn set_annotation(&mut self, text: &str) -> Result<()> {
        if self.annotation != text {
            self.annotation = text.to_string();
            self.pipeline()?.overlay.set_property("text", text);
        }
        Ok(())
    }

    fn apply_imaging(&mut self, modes: &ImagingModes) -> Result<()> {
        self.imaging = modes.clone();
        let source = self.pipeline()?.source.clone();
        self.apply_controls(&source);
        Ok(())
    }
}

impl Drop for GstCamera {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
