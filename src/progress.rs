use tracing::{info, trace};

use crate::contract::{ConvertListener, TranscodeError};

/// Cancellation probe and progress reporter for one attempt.
pub struct Progress<'a> {
    listener: Option<&'a dyn ConvertListener>,
    duration_us: i64,
    current_pts_us: i64,
}

impl<'a> Progress<'a> {
    pub fn new(listener: Option<&'a dyn ConvertListener>, duration_us: i64) -> Self {
        Self {
            listener,
            duration_us,
            current_pts_us: 0,
        }
    }

    pub fn check_canceled(&self) -> Result<(), TranscodeError> {
        match self.listener {
            Some(listener) if listener.is_canceled() => {
                info!("conversion canceled by listener");
                Err(TranscodeError::Canceled)
            }
            _ => Ok(()),
        }
    }

    /// Forwards a sink write. Writes that flushed nothing are not reported.
    pub fn on_write(&mut self, bytes_written: u64, output_pts_us: i64) {
        if bytes_written == 0 {
            return;
        }
        self.current_pts_us = self.current_pts_us.max(output_pts_us);
        let fraction = self.fraction();
        trace!(bytes_written, fraction, "progress");
        if let Some(listener) = self.listener {
            listener.did_write_data(bytes_written, fraction);
        }
    }

    #[must_use]
    pub fn fraction(&self) -> f32 {
        if self.duration_us <= 0 {
            return 0.0;
        }
        (self.current_pts_us as f64 / self.duration_us as f64).clamp(0.0, 1.0) as f32
    }
}
