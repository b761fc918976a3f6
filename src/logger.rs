//! Buffered JSONL logging of acquired sweep points.
//!
//! Rows accumulate in memory and reach the disk in batches so slow storage
//! never throttles the measurement loop. Transient flush failures are
//! tolerated up to a limit before the run is aborted.

use std::io::Write;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::LockinError;

#[derive(Debug)]
pub struct PointLog<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    path: PathBuf,
    finalize_as_array: bool,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl<T> PointLog<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(path: P, buffer_size: usize, finalize_as_array: bool) -> Self {
        let mut path = path.into();
        path.set_extension(if finalize_as_array { "json" } else { "jsonl" });
        PointLog {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
            path,
            finalize_as_array,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, point: T) -> Result<(), LockinError> {
        self.buffer.push(point);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), LockinError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        match self.write_buffer() {
            Ok(()) => {
                self.flush_failures = 0;
                self.buffer.clear();
                info!("Flushed point log to {:?}", self.path);
                Ok(())
            }
            Err(cause) => self.tolerate_failure(cause),
        }
    }

    fn write_buffer(&self) -> Result<(), LockinError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = std::io::BufWriter::new(file);
        for point in &self.buffer {
            let line = serde_json::to_string(point)?;
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;
        Ok(())
    }

    // A transient disk hiccup keeps the buffer and retries on the next
    // flush; a persistent streak aborts the run
    fn tolerate_failure(&mut self, cause: LockinError) -> Result<(), LockinError> {
        self.flush_failures += 1;
        error!(
            "Point log flush failure {}/{}: {}",
            self.flush_failures, self.max_flush_failures, cause
        );
        if self.flush_failures % 3 == 0 {
            warn!(
                "Intermittent flush failures on {:?} ({}/{})",
                self.path, self.flush_failures, self.max_flush_failures
            );
        }
        if self.flush_failures >= self.max_flush_failures {
            return Err(LockinError::Io(std::io::Error::other(format!(
                "{} consecutive flush failures for {:?}, last: {}",
                self.flush_failures, self.path, cause
            ))));
        }
        Ok(())
    }

    /// Rewrite the JSONL stream as one pretty-printed JSON array for
    /// post-run analysis tools.
    pub fn finalize(&mut self) -> Result<(), LockinError> {
        if !self.finalize_as_array {
            return Ok(());
        }
        self.flush()?;
        let content = std::fs::read_to_string(&self.path)?;
        let mut points = Vec::new();
        for line in content.lines() {
            if !line.trim().is_empty() {
                points.push(serde_json::from_str::<T>(line)?);
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&points)?)?;
        info!("Rewrote {} logged points as a JSON array", points.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for PointLog<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    fn drop(&mut self) {
        let _ = self.flush();
        let _ = self.finalize();
    }
}
