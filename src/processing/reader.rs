// src/processing/reader.rs

//! Lazy line reader over plain or gzip NDJSON artifacts.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use serde_json::Value;

use crate::error::Result;

/// Forward-only iterator of JSON values, one per non-blank line.
///
/// Undecodable lines are logged and skipped. A read error (for example a
/// gzip member cut short by a crash) ends the stream with a warning.
pub struct NdjsonReader {
    path: PathBuf,
    input: Box<dyn BufRead + Send>,
    buf: Vec<u8>,
    line: u64,
    skipped: u64,
    done: bool,
}

impl NdjsonReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let input = Self::input(&path)?;
        Ok(Self {
            path,
            input,
            buf: Vec::new(),
            line: 0,
            skipped: 0,
            done: false,
        })
    }

    /// Start over from the first line.
    pub fn restart(&mut self) -> Result<()> {
        self.input = Self::input(&self.path)?;
        self.line = 0;
        self.skipped = 0;
        self.done = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines skipped because they were not valid JSON.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn input(path: &Path) -> Result<Box<dyn BufRead + Send>> {
        let file = File::open(path)?;
        let gzip = path.extension().is_some_and(|ext| ext == "gz");
        let reader: Box<dyn Read + Send> = if gzip {
            Box::new(MultiGzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(Box::new(BufReader::new(reader)))
    }
}

impl Iterator for NdjsonReader {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        while !self.done {
            self.buf.clear();
            match self.input.read_until(b'\n', &mut self.buf) {
                Ok(0) => self.done = true,
                Ok(_) => {
                    self.line += 1;
                    let text = self.buf.trim_ascii();
                    if text.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice(text) {
                        Ok(value) => return Some(value),
                        Err(e) => {
                            self.skipped += 1;
                            log::warn!(
                                "{}:{}: skipping undecodable line: {}",
                                self.path.display(),
                                self.line,
                                e
                            );
                        }
                    }
                }
                Err(e) => {
                    log::warn!(
                        "{}: stopped reading after line {}: {}",
                        self.path.display(),
                        self.line,
                        e
                    );
                    self.done = true;
                }
            }
        }
        None
    }
}
