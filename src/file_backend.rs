use std::cell::RefCell;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::annexb_source::ElementaryStreamSource;
use crate::contract::{
    Codec, Dimensions, MediaBackend, MuxSink, SampleSource, SinkConfig, TranscodeError,
};
use crate::file_sink::AnnexBFileSink;

/// Codec-free backend over elementary stream files. Supports the copy
/// branch only; every hardware collaborator reports `Unsupported`.
#[derive(Debug)]
pub struct FileBackend {
    codec: Codec,
    frame_rate: u32,
    dims: Dimensions,
    indexed: RefCell<Option<(PathBuf, ElementaryStreamSource)>>,
}

impl FileBackend {
    #[must_use]
    pub fn new(codec: Codec, frame_rate: u32, dims: Dimensions) -> Self {
        Self {
            codec,
            frame_rate,
            dims,
            indexed: RefCell::new(None),
        }
    }

    /// Hands out `source` on the first `open_source` of `path` instead of
    /// reading and indexing the file again. Later opens read the file.
    #[must_use]
    pub fn with_indexed_source(
        self,
        path: impl Into<PathBuf>,
        source: ElementaryStreamSource,
    ) -> Self {
        *self.indexed.borrow_mut() = Some((path.into(), source));
        self
    }
}

impl MediaBackend for FileBackend {
    fn open_source(&self, path: &Path) -> Result<Box<dyn SampleSource>, TranscodeError> {
        let reused = self
            .indexed
            .borrow_mut()
            .take_if(|(indexed_path, _)| indexed_path.as_path() == path);
        if let Some((_, source)) = reused {
            debug!(path = %path.display(), "reusing indexed elementary stream");
            return Ok(Box::new(source));
        }
        Ok(Box::new(ElementaryStreamSource::open(
            path,
            self.codec,
            self.frame_rate,
            self.dims,
        )?))
    }

    fn create_sink(&self, config: &SinkConfig) -> Result<Box<dyn MuxSink>, TranscodeError> {
        Ok(Box::new(AnnexBFileSink::create(config)?))
    }
}
