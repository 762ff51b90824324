//! cpal output backend
//!
//! Opens the default output device at its preferred config, reconfigures
//! the engine to match, and mixes directly in the device callback. The
//! engine chunks oversized callback buffers internally, so no extra
//! buffering happens here.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;

use crate::backend::Backend;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

pub struct CpalBackend {
    engine: Arc<Engine>,
    stream: Option<cpal::Stream>,
    device_name: String,
}

impl CpalBackend {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            stream: None,
            device_name: String::new(),
        }
    }

    /// Device the running stream was opened on
    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Backend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn start(&mut self) -> EngineResult<()> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(EngineError::NoDevices)?;
        self.device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let supported = device
            .default_output_config()
            .map_err(|e| EngineError::ConfigError(e.to_string()))?;
        let sample_rate = supported.sample_rate().0 as f32;
        let channels = supported.channels() as usize;
        if !matches!(channels, 1 | 2 | 4 | 6 | 8) {
            return Err(EngineError::UnsupportedFormat(format!(
                "device wants {channels} channels"
            )));
        }
        self.engine
            .post_init(sample_rate, self.engine.buffer_size(), channels)?;
        log::info!(
            "cpal: {} at {sample_rate} Hz, {channels} channels, {:?}",
            self.device_name,
            supported.sample_format()
        );

        let config = supported.config();
        let err_fn = |err| log::error!("output stream error: {err}");
        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let engine = Arc::clone(&self.engine);
                device
                    .build_output_stream(
                        &config,
                        move |data: &mut [f32], _| engine.mix(data),
                        err_fn,
                        None,
                    )
                    .map_err(|e| EngineError::StreamBuildError(e.to_string()))?
            }
            SampleFormat::I16 => {
                let engine = Arc::clone(&self.engine);
                device
                    .build_output_stream(
                        &config,
                        move |data: &mut [i16], _| engine.mix_signed16(data),
                        err_fn,
                        None,
                    )
                    .map_err(|e| EngineError::StreamBuildError(e.to_string()))?
            }
            other => {
                return Err(EngineError::UnsupportedFormat(format!(
                    "device sample format {other:?}"
                )))
            }
        };
        stream
            .play()
            .map_err(|e| EngineError::StreamPlayError(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        // Dropping the stream closes the device
        self.stream = None;
    }
}
