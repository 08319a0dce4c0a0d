//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};
use stream_throttle::{Policy, StreamRateLimitLayer};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

/// In-memory writer for `tracing_subscriber::fmt` output.
#[derive(Clone, Default)]
pub struct CaptureWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CaptureWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Formatted lines written so far.
    pub fn lines(&self) -> Vec<String> {
        let buf = self.buf.lock().unwrap();
        String::from_utf8_lossy(&buf)
            .lines()
            .map(str::to_owned)
            .collect()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(needle)).count()
    }
}

impl io::Write for CaptureWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CaptureWriter {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with a fmt subscriber filtered by `layer`, returning its output.
pub fn with_rate_limit<F: FnOnce()>(layer: &StreamRateLimitLayer, f: F) -> CaptureWriter {
    let writer = CaptureWriter::new();
    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .with_writer(writer.clone())
            .with_ansi(false)
            .without_time()
            .with_filter(layer.clone()),
    );
    tracing::subscriber::with_default(subscriber, f);
    writer
}

pub fn policy_secs(period: f64) -> Policy {
    Policy::from_secs_f64(period).unwrap()
}
