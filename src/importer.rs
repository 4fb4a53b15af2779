use crate::{
    logging::{LogEntry, LogLevel},
    session::Session,
};
use anyhow::{bail, Context, Result};
use filetime::{set_file_mtime, FileTime};
use serde::Serialize;
use std::{
    fs,
    io::{self, Read},
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
    },
    thread::{self, JoinHandle},
    time::{SystemTime, UNIX_EPOCH},
};
use time::{Date, Month};

const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "7z", "rar"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ImportEvent {
    Progress {
        current: usize,
        total: usize,
        label: String,
    },
    Log(LogEntry),
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    Idle,
    Running,
    Finished,
}

/// Receives import events on the worker thread.
pub trait ImportObserver: Send {
    fn on_progress(&mut self, current: usize, total: usize, label: &str);
    fn on_log(&mut self, entry: &LogEntry);
    fn on_finished(&mut self);
}

struct ChannelObserver {
    tx: Sender<ImportEvent>,
}

impl ImportObserver for ChannelObserver {
    fn on_progress(&mut self, current: usize, total: usize, label: &str) {
        let _ = self.tx.send(ImportEvent::Progress {
            current,
            total,
            label: label.to_string(),
        });
    }

    fn on_log(&mut self, entry: &LogEntry) {
        let _ = self.tx.send(ImportEvent::Log(entry.clone()));
    }

    fn on_finished(&mut self) {
        let _ = self.tx.send(ImportEvent::Finished);
    }
}

/// Event stream of one submitted batch.
pub struct ImportHandle {
    rx: Receiver<ImportEvent>,
    worker: Option<JoinHandle<()>>,
    state: ImportState,
}

impl ImportHandle {
    pub fn state(&self) -> ImportState {
        self.state
    }

    fn observe(&mut self, event: &ImportEvent) {
        self.state = match event {
            ImportEvent::Finished => ImportState::Finished,
            _ => ImportState::Running,
        };
    }

    /// Blocks for the next event. `None` once the stream is exhausted.
    pub fn recv(&mut self) -> Option<ImportEvent> {
        let event = self.rx.recv().ok()?;
        self.observe(&event);
        Some(event)
    }

    pub fn try_recv(&mut self) -> Option<ImportEvent> {
        match self.rx.try_recv() {
            Ok(event) => {
                self.observe(&event);
                Some(event)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drains every remaining event and joins the worker.
    pub fn wait(mut self) -> Vec<ImportEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv() {
            let done = event == ImportEvent::Finished;
            events.push(event);
            if done {
                break;
            }
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("import worker panicked");
            }
        }
        events
    }
}

impl Iterator for ImportHandle {
    type Item = ImportEvent;

    fn next(&mut self) -> Option<ImportEvent> {
        if self.state == ImportState::Finished {
            return None;
        }
        self.recv()
    }
}

pub struct ImportQueue;

impl ImportQueue {
    pub fn submit(paths: Vec<PathBuf>, destination: PathBuf) -> ImportHandle {
        let (tx, rx) = mpsc::channel();
        let worker = Self::submit_with(paths, destination, ChannelObserver { tx });
        ImportHandle {
            rx,
            worker,
            state: ImportState::Idle,
        }
    }

    /// Runs the batch against `observer`. Returns the worker handle, or
    /// `None` when there was nothing to do and `on_finished` already fired.
    pub fn submit_with<O>(
        paths: Vec<PathBuf>,
        destination: PathBuf,
        mut observer: O,
    ) -> Option<JoinHandle<()>>
    where
        O: ImportObserver + 'static,
    {
        if paths.is_empty() {
            observer.on_finished();
            return None;
        }
        Some(thread::spawn(move || {
            run_batch(&paths, &destination, &mut observer)
        }))
    }
}

impl Session {
    /// Queues archives for extraction into the staging library.
    pub fn import(&self, paths: Vec<PathBuf>) -> ImportHandle {
        ImportQueue::submit(paths, self.paths().library_dir.clone())
    }

    /// Queues everything waiting in the pending folder.
    pub fn import_pending(&self) -> Result<ImportHandle> {
        let archives = pending_archives(&self.paths().pending_dir)?;
        Ok(self.import(archives))
    }
}

fn run_batch(paths: &[PathBuf], destination: &Path, observer: &mut dyn ImportObserver) {
    let total = paths.len();
    let opening = if total == 1 {
        format!("Import started: {}", display_label(&paths[0]))
    } else {
        format!("Batch import started: {total} archive(s)")
    };
    report(observer, LogEntry::new(LogLevel::Info, opening));

    for (idx, path) in paths.iter().enumerate() {
        let label = display_label(path);
        observer.on_progress(idx + 1, total, &label);
        let entry = match extract_archive(path, destination) {
            Ok(dir) => LogEntry::new(
                LogLevel::Success,
                format!("Extracted {label} into {}", dir.display()),
            ),
            Err(err) => LogEntry::new(LogLevel::Error, format!("Extract failed [{label}]: {err:#}")),
        };
        report(observer, entry);
    }

    observer.on_finished();
}

fn report(observer: &mut dyn ImportObserver, entry: LogEntry) {
    entry.emit();
    observer.on_log(&entry);
}

fn display_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

pub fn archive_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .filter(|stem| !stem.is_empty())
}

fn archive_extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

pub fn is_archive_file(path: &Path) -> bool {
    archive_extension(path)
        .map(|ext| ARCHIVE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Extracts one archive into `<destination>/<stem>` and returns that folder.
///
/// Entries whose names are absolute or climb out with `..` are skipped.
pub fn extract_archive(path: &Path, destination: &Path) -> Result<PathBuf> {
    let stem = archive_stem(path).context("archive has no usable name")?;
    let ext = archive_extension(path).unwrap_or_default();
    if ext != "zip" && ext != "7z" {
        bail!("unsupported archive format: .{ext}");
    }
    if !path.is_file() {
        bail!("archive not found: {}", path.display());
    }

    let final_dir = destination.join(&stem);
    if final_dir.exists() {
        bail!("destination folder {} already exists", final_dir.display());
    }
    fs::create_dir_all(destination)
        .with_context(|| format!("create {}", destination.display()))?;

    let partial = PartialDir::create(destination, &stem)?;
    if ext == "zip" {
        extract_zip(path, partial.path())?;
    } else {
        extract_7z(path, partial.path())?;
    }
    partial.commit(&final_dir)?;
    Ok(final_dir)
}

/// Archive stems whose folder already exists under `destination`.
pub fn find_name_collisions(paths: &[PathBuf], destination: &Path) -> Vec<String> {
    paths
        .iter()
        .filter_map(|path| archive_stem(path))
        .filter(|stem| destination.join(stem).exists())
        .collect()
}

/// Archives waiting in the pending folder, sorted by name.
pub fn pending_archives(pending_dir: &Path) -> Result<Vec<PathBuf>> {
    if !pending_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut archives = Vec::new();
    for entry in fs::read_dir(pending_dir)
        .with_context(|| format!("read {}", pending_dir.display()))?
    {
        let entry = entry.context("read pending entry")?;
        let path = entry.path();
        if path.is_file() && is_archive_file(&path) {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

/// Half-extracted archive folder. Removed on drop unless committed.
struct PartialDir {
    path: Option<PathBuf>,
}

static PARTIAL_COUNTER: AtomicUsize = AtomicUsize::new(0);

impl PartialDir {
    fn create(destination: &Path, stem: &str) -> Result<Self> {
        let counter = PARTIAL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = destination.join(format!(".{stem}.partial-{nanos}-{counter}"));
        fs::create_dir_all(&path)
            .with_context(|| format!("create staging dir {}", path.display()))?;
        Ok(Self { path: Some(path) })
    }

    fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Renames the folder to `final_dir`; on failure it is still cleaned up.
    fn commit(mut self, final_dir: &Path) -> Result<()> {
        if let Some(path) = &self.path {
            fs::rename(path, final_dir)
                .with_context(|| format!("move extracted files to {}", final_dir.display()))?;
        }
        self.path = None;
        Ok(())
    }
}

impl Drop for PartialDir {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = fs::remove_dir_all(path);
        }
    }
}

/// Where an archive entry lands under `root`, or `None` when its name is
/// absolute or walks up out of `root`.
fn entry_destination(root: &Path, name: &str) -> Option<PathBuf> {
    let rel = Path::new(name);
    let mut has_name = false;
    for part in rel.components() {
        match part {
            Component::Normal(_) => has_name = true,
            Component::CurDir => {}
            _ => return None,
        }
    }
    has_name.then(|| root.join(rel))
}

fn write_entry(out_path: &Path, reader: &mut dyn Read) -> io::Result<()> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = fs::File::create(out_path)?;
    io::copy(reader, &mut out)?;
    Ok(())
}

fn extract_zip(path: &Path, root: &Path) -> Result<()> {
    let archive_file =
        fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(archive_file).context("read zip directory")?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).context("read zip entry")?;
        let Some(out_path) = entry_destination(root, entry.name()) else {
            log::warn!("skip {}: resolves outside the archive folder", entry.name());
            continue;
        };
        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("create {}", out_path.display()))?;
            continue;
        }
        write_entry(&out_path, &mut entry)
            .with_context(|| format!("extract {}", entry.name()))?;
        if let Some(mtime) = entry.last_modified().and_then(zip_mtime) {
            let _ = set_file_mtime(&out_path, mtime);
        }
    }
    Ok(())
}

fn extract_7z(path: &Path, root: &Path) -> Result<()> {
    sevenz_rust::decompress_file_with_extract_fn(path, root, |entry, reader, _| {
        match entry_destination(root, entry.name()) {
            Some(out_path) => sevenz_rust::default_entry_extract_fn(entry, reader, &out_path),
            None => {
                log::warn!("skip {}: resolves outside the archive folder", entry.name());
                // Solid blocks decode in order, so the skipped bytes still
                // have to be consumed.
                io::copy(reader, &mut io::sink()).map_err(sevenz_rust::Error::io)?;
                Ok(true)
            }
        }
    })
    .with_context(|| format!("extract 7z archive {}", path.display()))
}

/// Zip timestamps carry no zone; they are taken as UTC.
fn zip_mtime(stamp: zip::DateTime) -> Option<FileTime> {
    let month = Month::try_from(stamp.month()).ok()?;
    let date = Date::from_calendar_date(i32::from(stamp.year()), month, stamp.day()).ok()?;
    let at = date
        .with_hms(stamp.hour(), stamp.minute(), stamp.second())
        .ok()?;
    Some(FileTime::from_unix_time(at.assume_utc().unix_timestamp(), 0))
}
