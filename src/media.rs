//! Local audio capture and remote playback over cpal. Streams are owned by
//! dedicated threads because `cpal::Stream` is not `Send`; the handles here
//! only carry a stop signal. Samples travel as raw little-endian f32 frames
//! on both sides.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use tracing::{debug, warn};
use webrtc::media::Sample as MediaSample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{MeshError, Result};

/// Microphone capture feeding the shared local track. Acquired exactly once
/// per session; `stop` (or drop) releases the device.
pub struct AudioCapture {
    stop: Sender<()>,
}

impl AudioCapture {
    pub fn start(track: Arc<TrackLocalStaticSample>) -> Result<Self> {
        let (stop_tx, stop_rx) = channel();
        let (ready_tx, ready_rx) = channel();

        thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match Self::open_input(track) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| MeshError::MediaSetup(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop: stop_tx }),
            Ok(Err(e)) => Err(MeshError::MediaSetup(e.to_string())),
            Err(_) => Err(MeshError::MediaSetup("capture thread exited".to_string())),
        }
    }

    fn open_input(track: Arc<TrackLocalStaticSample>) -> anyhow::Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("no input device available"))?;
        let config = device.default_input_config()?;
        debug!(?config, "input device opened");

        let stream = match config.sample_format() {
            SampleFormat::F32 => Self::build_input_stream::<f32>(&device, &config.into(), track)?,
            SampleFormat::I16 => Self::build_input_stream::<i16>(&device, &config.into(), track)?,
            SampleFormat::U16 => Self::build_input_stream::<u16>(&device, &config.into(), track)?,
            other => bail!("unsupported sample format: {other:?}"),
        };
        stream.play()?;
        Ok(stream)
    }

    fn build_input_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        track: Arc<TrackLocalStaticSample>,
    ) -> anyhow::Result<cpal::Stream>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let sample_rate = config.sample_rate.0 as f64;
        let channels = config.channels as f64;
        let err_fn = |err| warn!(error = %err, "input stream error");

        let stream = device.build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mut buf = Vec::with_capacity(data.len() * 4);
                for sample in data {
                    buf.extend_from_slice(&f32::from_sample(*sample).to_le_bytes());
                }
                let sample = MediaSample {
                    data: buf.into(),
                    duration: Duration::from_secs_f64(data.len() as f64 / channels / sample_rate),
                    ..Default::default()
                };
                if let Err(e) = futures::executor::block_on(track.write_sample(&sample)) {
                    debug!(error = %e, "capture frame dropped");
                }
            },
            err_fn,
            None,
        )?;
        Ok(stream)
    }

    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        let _ = self.stop.send(());
    }
}

/// Plays one remote peer's track on the default output device. Dropped when
/// the owning link closes.
pub struct AudioPlayback {
    stop: Sender<()>,
}

impl AudioPlayback {
    pub fn start(track: Arc<TrackRemote>) -> Result<Self> {
        let (sample_tx, sample_rx) = channel::<Vec<f32>>();

        // RTP depacketization stays on the runtime; the audio thread only
        // sees decoded frames.
        tokio::spawn(async move {
            while let Ok((rtp, _)) = track.read_rtp().await {
                let mut samples = Vec::with_capacity(rtp.payload.len() / 4);
                for chunk in rtp.payload.chunks_exact(4) {
                    samples.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                }
                if sample_tx.send(samples).is_err() {
                    break;
                }
            }
        });

        let (stop_tx, stop_rx) = channel();
        let (ready_tx, ready_rx) = channel();

        thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let stream = match Self::open_output(sample_rx) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| MeshError::MediaSetup(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop: stop_tx }),
            Ok(Err(e)) => Err(MeshError::MediaSetup(e.to_string())),
            Err(_) => Err(MeshError::MediaSetup("playback thread exited".to_string())),
        }
    }

    fn open_output(samples: Receiver<Vec<f32>>) -> anyhow::Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no output device available"))?;
        let config = device.default_output_config()?;
        debug!(?config, "output device opened");

        let stream = match config.sample_format() {
            SampleFormat::F32 => {
                Self::build_output_stream::<f32>(&device, &config.into(), samples)?
            }
            SampleFormat::I16 => {
                Self::build_output_stream::<i16>(&device, &config.into(), samples)?
            }
            SampleFormat::U16 => {
                Self::build_output_stream::<u16>(&device, &config.into(), samples)?
            }
            other => bail!("unsupported sample format: {other:?}"),
        };
        stream.play()?;
        Ok(stream)
    }

    fn build_output_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        samples: Receiver<Vec<f32>>,
    ) -> anyhow::Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let mut pending: VecDeque<f32> = VecDeque::new();
        let err_fn = |err| warn!(error = %err, "output stream error");

        let stream = device.build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                while pending.len() < data.len() {
                    match samples.try_recv() {
                        Ok(frame) => pending.extend(frame),
                        Err(_) => break,
                    }
                }
                for out in data.iter_mut() {
                    // Silence when the buffer runs dry.
                    *out = T::from_sample(pending.pop_front().unwrap_or(0.0));
                }
            },
            err_fn,
            None,
        )?;
        Ok(stream)
    }

    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        let _ = self.stop.send(());
    }
}
