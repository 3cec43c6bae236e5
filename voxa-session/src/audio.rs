//! Local audio capture.
//!
//! The orchestrator owns exactly one capture track per session. Gating
//! mutes the track without releasing the device, so a background session
//! stays warm and is only "opened for input" when the surrounding UI wants
//! it.
//!
//! The default source is a no-op for headless use and tests; enable the
//! `mic` feature for cpal-backed capture from the default input device.

use crate::error::SessionResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// One block of mono PCM16 samples from the capture device.
pub type AudioFrame = Vec<i16>;

/// A live capture track.
pub trait AudioTrack: Send + Sync {
    /// Mute or unmute the track. The device stays acquired either way.
    fn set_enabled(&self, enabled: bool);

    fn enabled(&self) -> bool;
}

/// An acquired device: the track handle plus its frame stream.
pub struct AcquiredTrack {
    pub track: Box<dyn AudioTrack>,
    pub frames: mpsc::Receiver<AudioFrame>,
}

/// Seam for acquiring the local audio source.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Acquire the capture device. A missing device or denied permission is
    /// fatal for the current connect attempt.
    async fn acquire(&self) -> SessionResult<AcquiredTrack>;
}

// ============================================================================
// No-op Source
// ============================================================================

/// Source for headless use and tests: no device, silent frame stream.
pub struct NoopAudioSource;

struct NoopTrack {
    enabled: AtomicBool,
    // Held so the frame receiver stays open without ever yielding.
    _frames: mpsc::Sender<AudioFrame>,
}

impl AudioTrack for NoopTrack {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AudioSource for NoopAudioSource {
    async fn acquire(&self) -> SessionResult<AcquiredTrack> {
        let (frames_tx, frames) = mpsc::channel(1);
        Ok(AcquiredTrack {
            track: Box::new(NoopTrack {
                enabled: AtomicBool::new(true),
                _frames: frames_tx,
            }),
            frames,
        })
    }
}

// ============================================================================
// Microphone Source (feature "mic")
// ============================================================================

#[cfg(feature = "mic")]
pub use mic::MicSource;

#[cfg(feature = "mic")]
mod mic {
    use super::*;
    use crate::error::SessionError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::Arc;

    /// Capture from the default input device via cpal.
    pub struct MicSource {
        sample_rate: u32,
    }

    impl MicSource {
        pub fn new(sample_rate: u32) -> Self {
            Self { sample_rate }
        }
    }

    impl Default for MicSource {
        fn default() -> Self {
            Self::new(16_000)
        }
    }

    struct MicTrack {
        enabled: Arc<AtomicBool>,
        stop: std::sync::mpsc::Sender<()>,
    }

    impl AudioTrack for MicTrack {
        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::Relaxed);
        }

        fn enabled(&self) -> bool {
            self.enabled.load(Ordering::Relaxed)
        }
    }

    impl Drop for MicTrack {
        fn drop(&mut self) {
            let _ = self.stop.send(());
        }
    }

    #[async_trait]
    impl AudioSource for MicSource {
        async fn acquire(&self) -> SessionResult<AcquiredTrack> {
            let enabled = Arc::new(AtomicBool::new(true));
            let gate = Arc::clone(&enabled);
            let (frames_tx, frames) = mpsc::channel::<AudioFrame>(32);
            let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
            let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
            let sample_rate = self.sample_rate;

            // cpal streams are not Send; a dedicated thread owns the stream
            // for the track's lifetime.
            std::thread::spawn(move || {
                let open = move || -> Result<cpal::Stream, String> {
                    let device = cpal::default_host()
                        .default_input_device()
                        .ok_or_else(|| "no input device available".to_string())?;
                    let name = device.name().unwrap_or_else(|_| "unknown".into());
                    tracing::info!(device = %name, sample_rate, "Acquired input device");

                    let config = cpal::StreamConfig {
                        channels: 1,
                        sample_rate: cpal::SampleRate(sample_rate),
                        buffer_size: cpal::BufferSize::Default,
                    };

                    let stream = device
                        .build_input_stream(
                            &config,
                            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                // Muted: keep the device open, drop the frames.
                                if !gate.load(Ordering::Relaxed) {
                                    return;
                                }
                                let frame: AudioFrame = data
                                    .iter()
                                    .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                                    .collect();
                                // Backpressure drops frames rather than blocking
                                // the audio callback.
                                let _ = frames_tx.try_send(frame);
                            },
                            |err| tracing::warn!(error = %err, "Audio stream error"),
                            None,
                        )
                        .map_err(|e| e.to_string())?;
                    stream.play().map_err(|e| e.to_string())?;
                    Ok(stream)
                };

                match open() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            });

            ready_rx
                .await
                .map_err(|_| SessionError::Device("capture thread exited".into()))?
                .map_err(SessionError::Device)?;

            Ok(AcquiredTrack {
                track: Box::new(MicTrack {
                    enabled,
                    stop: stop_tx,
                }),
                frames,
            })
        }
    }
}
