use std::marker::PhantomData;
use std::time::Duration;

use tracing::{debug, warn};

use crate::contract::{
    BufferInfo, CodecDriver, CodecError, CodecRole, CodecStatus, SurfaceHandle, TrackFormat,
    TranscodeError,
};

pub trait Role {
    const ROLE: CodecRole;
}

#[derive(Debug)]
pub struct Decoder;

#[derive(Debug)]
pub struct Encoder;

impl Role for Decoder {
    const ROLE: CodecRole = CodecRole::Decoder;
}

impl Role for Encoder {
    const ROLE: CodecRole = CodecRole::Encoder;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Configured,
    Started,
    Released,
}

/// One hardware codec instance with its lifecycle tracked and every driver
/// error tagged with the codec's role.
pub struct CodecSession<R: Role> {
    driver: Box<dyn CodecDriver>,
    lifecycle: Lifecycle,
    output_format: Option<TrackFormat>,
    _role: PhantomData<R>,
}

impl<R: Role> CodecSession<R> {
    pub fn new(driver: Box<dyn CodecDriver>) -> Self {
        Self {
            driver,
            lifecycle: Lifecycle::Created,
            output_format: None,
            _role: PhantomData,
        }
    }

    pub fn configure(
        &mut self,
        format: &TrackFormat,
        surface: Option<SurfaceHandle>,
    ) -> Result<(), TranscodeError> {
        debug!(role = %R::ROLE, %format, ?surface, "configuring codec");
        self.driver
            .configure(format, surface)
            .map_err(TranscodeError::codec(R::ROLE))?;
        self.lifecycle = Lifecycle::Configured;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), TranscodeError> {
        if self.lifecycle != Lifecycle::Configured {
            return Err(TranscodeError::Codec {
                role: R::ROLE,
                source: CodecError::IllegalState("start before configure".to_string()),
            });
        }
        self.driver.start().map_err(TranscodeError::codec(R::ROLE))?;
        self.lifecycle = Lifecycle::Started;
        Ok(())
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.lifecycle == Lifecycle::Started
    }

    /// Last format the codec announced through [`CodecStatus::OutputFormatChanged`].
    #[must_use]
    pub fn output_format(&self) -> Option<&TrackFormat> {
        self.output_format.as_ref()
    }

    /// Non-blocking output dequeue. Vendor codes outside the recognized set
    /// are hard failures.
    pub fn poll_output(&mut self, timeout: Duration) -> Result<CodecStatus, TranscodeError> {
        let status = self
            .driver
            .dequeue_output_buffer(timeout)
            .map_err(TranscodeError::codec(R::ROLE))?;
        match status {
            CodecStatus::OutputFormatChanged => {
                let format = self
                    .driver
                    .output_format()
                    .map_err(TranscodeError::codec(R::ROLE))?;
                debug!(role = %R::ROLE, %format, "output format changed");
                self.output_format = Some(format);
            }
            CodecStatus::Error(code) => {
                return Err(TranscodeError::UnexpectedStatus {
                    role: R::ROLE,
                    code,
                });
            }
            CodecStatus::TryAgainLater | CodecStatus::BuffersChanged | CodecStatus::Sample { .. } => {}
        }
        Ok(status)
    }

    pub fn output_buffer(&mut self, index: usize) -> Result<&[u8], TranscodeError> {
        self.driver
            .output_buffer(index)
            .map_err(TranscodeError::codec(R::ROLE))
    }

    pub fn release_output(&mut self, index: usize, render: bool) -> Result<(), TranscodeError> {
        self.driver
            .release_output_buffer(index, render)
            .map_err(TranscodeError::codec(R::ROLE))
    }

    /// Stops and releases the codec. Failures are logged; calling it twice is a no-op.
    pub fn shutdown(&mut self) {
        match self.lifecycle {
            Lifecycle::Released => return,
            Lifecycle::Started => {
                if let Err(err) = self.driver.stop() {
                    warn!(role = %R::ROLE, error = %err, "codec stop failed");
                }
            }
            Lifecycle::Created | Lifecycle::Configured => {}
        }
        self.driver.release();
        self.lifecycle = Lifecycle::Released;
        debug!(role = %R::ROLE, "codec released");
    }
}

impl CodecSession<Decoder> {
    pub fn dequeue_input(&mut self, timeout: Duration) -> Result<Option<usize>, TranscodeError> {
        self.driver
            .dequeue_input_buffer(timeout)
            .map_err(TranscodeError::codec(CodecRole::Decoder))
    }

    pub fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], TranscodeError> {
        self.driver
            .input_buffer(index)
            .map_err(TranscodeError::codec(CodecRole::Decoder))
    }

    pub fn queue_input(&mut self, index: usize, info: BufferInfo) -> Result<(), TranscodeError> {
        self.driver
            .queue_input_buffer(index, info)
            .map_err(TranscodeError::codec(CodecRole::Decoder))
    }

    /// Discards every queued input and pending output.
    pub fn flush(&mut self) -> Result<(), TranscodeError> {
        self.driver
            .flush()
            .map_err(TranscodeError::codec(CodecRole::Decoder))
    }
}

impl CodecSession<Encoder> {
    pub fn create_input_surface(&mut self) -> Result<SurfaceHandle, TranscodeError> {
        self.driver
            .create_input_surface()
            .map_err(TranscodeError::codec(CodecRole::Encoder))
    }

    pub fn signal_end_of_input(&mut self) -> Result<(), TranscodeError> {
        self.driver
            .signal_end_of_input_stream()
            .map_err(TranscodeError::codec(CodecRole::Encoder))
    }
}

impl<R: Role> Drop for CodecSession<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
