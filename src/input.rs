//! # Input Adapters
//!
//! The seam between file parsing and the batcher inbox. The pipeline only
//! sees `DocumentSink`: one push per parsed document, then `end_wait` when
//! the input set is exhausted.

use crate::model::Document;
use crate::stats::LoadStats;
use crate::sync::WaitQueue;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Producer handle onto the batcher inbox.
#[derive(Clone)]
pub struct DocumentSink {
    inbox: Arc<WaitQueue<Document>>,
    stats: Arc<LoadStats>,
}

impl DocumentSink {
    pub fn new(inbox: Arc<WaitQueue<Document>>, stats: Arc<LoadStats>) -> Self {
        Self { inbox, stats }
    }

    /// Hand one document to the pipeline, blocking under backpressure.
    /// Returns `false` once the inbox has been closed.
    pub fn push(&self, doc: Document) -> bool {
        if self.inbox.push(doc).is_err() {
            warn!("document arrived after end of input, dropping");
            self.stats.add_rejected(1);
            return false;
        }
        true
    }

    /// Count a document the adapter could not parse.
    pub fn reject(&self) {
        self.stats.add_rejected(1);
    }

    /// Signal that the input set is exhausted.
    pub fn end_wait(&self) {
        self.inbox.end_wait();
    }
}

/// A source of parsed documents feeding the pipeline from its own threads.
pub trait InputProcessor: Send {
    fn start(&mut self, sink: DocumentSink) -> Result<()>;
    /// Block until all input is pushed, then close the sink.
    fn wait(&mut self) -> Result<()>;
}

/// Reads JSON-lines files from a directory, fanning file paths out to a
/// fixed set of reader threads.
pub struct FileInputProcessor {
    threads: usize,
    dir: PathBuf,
    pattern: Regex,
    readers: Vec<JoinHandle<u64>>,
    sink: Option<DocumentSink>,
}

impl FileInputProcessor {
    pub fn new(threads: usize, input_type: &str, dir: PathBuf, file_regex: &str) -> Result<Self> {
        if input_type != "json" {
            bail!("unknown input type: {input_type}");
        }
        let pattern = Regex::new(file_regex)
            .with_context(|| format!("invalid file regex: {file_regex}"))?;
        Ok(Self {
            threads: threads.max(1),
            dir,
            pattern,
            readers: Vec::new(),
            sink: None,
        })
    }

    fn matching_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("reading load directory {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if self.pattern.is_match(name) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

impl InputProcessor for FileInputProcessor {
    fn start(&mut self, sink: DocumentSink) -> Result<()> {
        let files = self.matching_files()?;
        if files.is_empty() {
            bail!(
                "no input files matching {} under {}",
                self.pattern.as_str(),
                self.dir.display()
            );
        }
        debug!(files = files.len(), "starting input readers");

        let (tx, rx) = crossbeam_channel::unbounded::<PathBuf>();
        for file in files {
            let _ = tx.send(file);
        }
        drop(tx);

        for _ in 0..self.threads {
            let rx = rx.clone();
            let sink = sink.clone();
            self.readers.push(std::thread::spawn(move || {
                let mut pushed = 0u64;
                for path in rx.iter() {
                    match read_json_lines(&path, &sink) {
                        Ok(count) => pushed += count,
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "failed to read input file");
                        }
                    }
                }
                pushed
            }));
        }
        self.sink = Some(sink);
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        let mut total = 0u64;
        for reader in self.readers.drain(..) {
            match reader.join() {
                Ok(count) => total += count,
                Err(_) => bail!("input reader thread panicked"),
            }
        }
        if let Some(sink) = self.sink.take() {
            sink.end_wait();
        }
        debug!(documents = total, "input exhausted");
        Ok(())
    }
}

fn read_json_lines(path: &std::path::Path, sink: &DocumentSink) -> Result<u64> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut pushed = 0u64;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(body) => {
                if !sink.push(Document::with_size(body, line.len())) {
                    break;
                }
                pushed += 1;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unparseable line");
                sink.reject();
            }
        }
    }
    Ok(pushed)
}

/// Closure-driven source used by tests and benches: the closure runs on
/// its own thread and pushes synthetic documents into the sink.
pub struct GeneratorInput<F>
where
    F: FnOnce(DocumentSink) + Send + 'static,
{
    generator: Option<F>,
    handle: Option<JoinHandle<()>>,
    sink: Option<DocumentSink>,
}

impl<F> GeneratorInput<F>
where
    F: FnOnce(DocumentSink) + Send + 'static,
{
    pub fn new(generator: F) -> Self {
        Self {
            generator: Some(generator),
            handle: None,
            sink: None,
        }
    }
}

impl<F> InputProcessor for GeneratorInput<F>
where
    F: FnOnce(DocumentSink) + Send + 'static,
{
    fn start(&mut self, sink: DocumentSink) -> Result<()> {
        let Some(generator) = self.generator.take() else {
            bail!("generator input already started");
        };
        let worker_sink = sink.clone();
        self.handle = Some(std::thread::spawn(move || generator(worker_sink)));
        self.sink = Some(sink);
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                bail!("generator thread panicked");
            }
        }
        if let Some(sink) = self.sink.take() {
            sink.end_wait();
        }
        Ok(())
    }
}
