//! The build scheduler
//!
//! Drives a full repack of one archive: classify the index, form AVIS
//! groups, encode on a fixed pool of supervised worker threads under a
//! memory budget, then write the output archive and its manifest.
//!
//! The driver runs on the calling thread and owns every piece of mutable
//! build state (submission queue, in-flight accounting, manifest, output
//! writer). Workers read from their own archive handles, encode, and report
//! results as values over a channel; a panic inside an encoder is caught at
//! the job boundary and converted into that job's failure result.

use crate::classify::ImageClassifier;
use crate::codec::Codec;
use crate::group::{self, group_by_prefix};
use crate::memory;
use crate::progress::{Phase, ProgressEvent, ProgressSink};
use crate::{Error, Result};
use renpak_core::{Manifest, RpaEntry, RpaReader, RpaWriter, MANIFEST_NAME};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

/// Build configuration.
///
/// Encoder quality and speed live in the codec object; these options govern
/// only the pipeline itself.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Encode at most this many images (by sorted name); 0 = all.
    pub limit: usize,
    /// Worker pool width; 0 = number of logical CPUs.
    pub workers: usize,
    /// Minimum run length for an AVIS group.
    pub sequence_threshold: usize,
    /// Per-frame memory estimate used for Phase A admission.
    pub assumed_frame_bytes: u64,
    /// Phase A budget override in bytes; `None` probes system memory.
    pub memory_budget: Option<u64>,
    pub classifier: ImageClassifier,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            limit: 0,
            workers: 0,
            sequence_threshold: group::SEQUENCE_THRESHOLD,
            assumed_frame_bytes: memory::ASSUMED_FRAME_BYTES,
            memory_budget: None,
            classifier: ImageClassifier::default(),
        }
    }
}

/// Summary of one completed build.
#[derive(Debug, Default, Clone)]
pub struct BuildReport {
    /// Entries in the input index.
    pub entries: usize,
    /// Images selected for encoding (after the limit).
    pub images: usize,
    /// AVIS sequence artifacts written.
    pub sequences_written: usize,
    /// Scatter AVIF artifacts written.
    pub avif_written: usize,
    /// Group members that fell back to scatter AVIF.
    pub fallback_images: usize,
    /// Entries copied verbatim (passthrough and failed encodes).
    pub copied: usize,
    /// Total reconstructed bytes of the encoded images.
    pub original_bytes: u64,
    /// Total bytes of the encoded artifacts.
    pub compressed_bytes: u64,
}

enum Job {
    Avis {
        key: String,
        target: String,
        entries: Vec<RpaEntry>,
    },
    Avif {
        entry: RpaEntry,
        target: String,
    },
}

enum TaskResult {
    AvisOk {
        key: String,
        target: String,
        data: Vec<u8>,
        members: Vec<String>,
        original_bytes: u64,
    },
    AvisFail {
        key: String,
        members: Vec<String>,
        reason: String,
    },
    AvifOk {
        name: String,
        target: String,
        data: Vec<u8>,
        original_bytes: u64,
    },
    AvifFail {
        name: String,
        original: Vec<u8>,
        reason: String,
    },
    /// Input archive I/O failed inside a worker; aborts the build.
    Fatal {
        key: Option<String>,
        error: renpak_core::Error,
    },
}

/// Drives repacks with one codec and one set of options.
pub struct Builder {
    codec: Arc<dyn Codec>,
    options: BuildOptions,
}

impl Builder {
    pub fn new(codec: impl Codec + 'static, options: BuildOptions) -> Self {
        Self {
            codec: Arc::new(codec),
            options,
        }
    }

    /// Repacks `input` into `output`.
    ///
    /// `stop` is checked between jobs: once set, no new work is submitted,
    /// in-flight jobs drain, the partial output is removed, and the build
    /// returns [`Error::Cancelled`]. The output file is also removed on any
    /// fatal error.
    pub fn build(
        &self,
        input: &Path,
        output: &Path,
        sink: &mut dyn ProgressSink,
        stop: &AtomicBool,
    ) -> Result<BuildReport> {
        let result = self.build_inner(input, output, sink, stop);
        if result.is_err() {
            let _ = std::fs::remove_file(output);
        }
        result
    }

    fn build_inner(
        &self,
        input: &Path,
        output: &Path,
        sink: &mut dyn ProgressSink,
        stop: &AtomicBool,
    ) -> Result<BuildReport> {
        let arch = |e| Error::Archive {
            path: input.to_path_buf(),
            source: e,
        };
        let out_err = |e| Error::Output {
            path: output.to_path_buf(),
            source: e,
        };

        let mut reader = RpaReader::open(input).map_err(arch)?;
        let index = reader.read_index().map_err(arch)?;

        // Partition the index. A manifest left over from a previous repack
        // would collide with ours, so it is dropped with a warning.
        let mut image_names: Vec<String> = Vec::new();
        let mut copy_names: Vec<String> = Vec::new();
        for entry in index.iter() {
            if entry.name == MANIFEST_NAME {
                sink.event(&ProgressEvent::Warning {
                    message: format!("input already contains {MANIFEST_NAME}; dropping it"),
                });
                continue;
            }
            if self.options.classifier.should_encode(&entry.name) {
                image_names.push(entry.name.clone());
            } else {
                copy_names.push(entry.name.clone());
            }
        }
        image_names.sort();

        // The limit filters before grouping; excess images are passed through.
        if self.options.limit > 0 && image_names.len() > self.options.limit {
            let excess = image_names.split_off(self.options.limit);
            copy_names.extend(excess);
        }
        let images_selected = image_names.len();

        let (mut groups, mut ungrouped) =
            group_by_prefix(&image_names, self.options.sequence_threshold);
        if !groups.is_empty() && !self.codec.avis_available() {
            sink.event(&ProgressEvent::Warning {
                message: format!(
                    "AVIS backend unavailable; encoding all {} grouped frames as scatter AVIF",
                    groups.values().map(Vec::len).sum::<usize>()
                ),
            });
            for (_, members) in std::mem::take(&mut groups) {
                ungrouped.extend(members);
            }
        }

        // Target names written so far (or promised): passthrough entries and
        // the manifest claim theirs up front. A derived target that collides
        // diverts its source back to verbatim copy.
        let mut used_names: HashSet<String> = copy_names.iter().cloned().collect();
        used_names.insert(MANIFEST_NAME.to_string());

        let mut queue: VecDeque<(String, Vec<String>)> = {
            let mut runs: Vec<(String, Vec<String>)> = Vec::with_capacity(groups.len());
            for (key, members) in groups {
                if used_names.insert(group::avis_target_name(&key)) {
                    runs.push((key, members));
                } else {
                    sink.event(&ProgressEvent::Warning {
                        message: format!(
                            "sequence target for {key} collides with an existing entry; dissolving"
                        ),
                    });
                    ungrouped.extend(members);
                }
            }
            // Largest groups first so the budget is spent where it matters.
            runs.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
            runs.into()
        };

        let workers = if self.options.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.options.workers
        };
        let budget = self
            .options
            .memory_budget
            .unwrap_or_else(|| memory::phase_a_budget(workers));

        // Worker pool: a shared job channel and a single result channel back
        // to this thread.
        let (job_tx, job_rx) = channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = channel::<TaskResult>();
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let input = input.to_path_buf();
            let codec = Arc::clone(&self.codec);
            let jobs = Arc::clone(&job_rx);
            let results = result_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("renpak-worker-{id}"))
                .spawn(move || worker_loop(input, codec, jobs, results))?;
            handles.push(handle);
        }
        drop(result_tx);

        let mut state = DriverState::default();

        // ── Phase A: AVIS sequences ──
        state.total = queue.len();
        sink.event(&ProgressEvent::PhaseStart {
            phase: Phase::Sequences,
        });
        while !queue.is_empty() || !state.in_flight.is_empty() {
            if stop.load(Ordering::Relaxed) || state.fatal.is_some() {
                queue.clear();
                if state.in_flight.is_empty() {
                    break;
                }
            }

            // Admit from the head while the estimate fits the budget. One
            // oversize group is allowed through when nothing is in flight,
            // so progress is always possible.
            loop {
                let estimate = match queue.front() {
                    Some((_, members)) => {
                        memory::group_estimate(members.len(), self.options.assumed_frame_bytes)
                    }
                    None => break,
                };
                if !state.in_flight.is_empty() && state.mem_in_flight + estimate > budget {
                    break;
                }
                let Some((key, members)) = queue.pop_front() else {
                    break;
                };
                let entries: Vec<RpaEntry> = members
                    .iter()
                    .filter_map(|name| index.get(name).cloned())
                    .collect();
                let target = group::avis_target_name(&key);
                state.in_flight.insert(key.clone(), estimate);
                state.mem_in_flight += estimate;
                if job_tx
                    .send(Job::Avis {
                        key,
                        target,
                        entries,
                    })
                    .is_err()
                {
                    state.pool_lost();
                    break;
                }
            }

            if state.in_flight.is_empty() {
                if queue.is_empty() {
                    break;
                }
                continue;
            }

            match result_rx.recv() {
                Ok(result) => state.absorb(result, sink, input),
                Err(_) => {
                    state.pool_lost();
                    break;
                }
            }
        }
        sink.event(&ProgressEvent::PhaseEnd {
            phase: Phase::Sequences,
        });

        // ── Phase B: scatter AVIF ──
        let mut scatter: Vec<String> = ungrouped;
        scatter.append(&mut state.fallback);
        scatter.sort();

        let mut pending: VecDeque<(String, String)> = VecDeque::with_capacity(scatter.len());
        for name in scatter {
            let target = group::avif_target_name(&name);
            if used_names.insert(target.clone()) {
                pending.push_back((name, target));
            } else {
                sink.event(&ProgressEvent::Warning {
                    message: format!("{name}: AVIF target {target} collides; copying original"),
                });
                copy_names.push(name);
            }
        }

        state.done = 0;
        state.total = pending.len();
        sink.event(&ProgressEvent::PhaseStart {
            phase: Phase::Images,
        });
        // Keep a small submission window so a stop request drains quickly.
        let window = workers * 2;
        let mut in_flight = 0usize;
        while !pending.is_empty() || in_flight > 0 {
            if stop.load(Ordering::Relaxed) || state.fatal.is_some() {
                pending.clear();
                if in_flight == 0 {
                    break;
                }
            }
            while in_flight < window {
                let Some((name, target)) = pending.pop_front() else {
                    break;
                };
                let Some(entry) = index.get(&name).cloned() else {
                    continue;
                };
                if job_tx.send(Job::Avif { entry, target }).is_err() {
                    state.pool_lost();
                    break;
                }
                in_flight += 1;
            }
            if in_flight == 0 {
                if pending.is_empty() {
                    break;
                }
                continue;
            }
            match result_rx.recv() {
                Ok(result) => {
                    in_flight -= 1;
                    state.absorb(result, sink, input);
                }
                Err(_) => {
                    state.pool_lost();
                    break;
                }
            }
        }
        sink.event(&ProgressEvent::PhaseEnd {
            phase: Phase::Images,
        });

        // Close the pool before touching the output. Stray results (late
        // completions, worker-side fatals) are still absorbed here.
        drop(job_tx);
        while let Ok(result) = result_rx.recv() {
            state.absorb(result, sink, input);
        }
        for handle in handles {
            let _ = handle.join();
        }

        if let Some(error) = state.fatal.take() {
            return Err(error);
        }
        if stop.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }

        // ── Write phase ──
        sink.event(&ProgressEvent::PhaseStart { phase: Phase::Copy });
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = RpaWriter::create(output).map_err(out_err)?;

        // Sorted by target name for reproducible output.
        state.artifacts.sort_by(|a, b| a.0.cmp(&b.0));
        for (target, data) in &state.artifacts {
            writer.add_file(target, data).map_err(out_err)?;
        }
        for (name, data) in &state.verbatim {
            writer.add_file(name, data).map_err(out_err)?;
        }

        let copy_total = copy_names.len();
        for (i, name) in copy_names.iter().enumerate() {
            if stop.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            let Some(entry) = index.get(name) else {
                continue;
            };
            let data = reader.read_file(entry).map_err(arch)?;
            writer.add_file(name, &data).map_err(out_err)?;
            if (i + 1) % 500 == 0 || i + 1 == copy_total {
                sink.event(&ProgressEvent::TaskDone {
                    done: i + 1,
                    total: copy_total,
                    original_bytes: state.original_bytes,
                    compressed_bytes: state.compressed_bytes,
                    message: "copying passthrough entries".to_string(),
                });
            }
        }

        let manifest_json = state
            .manifest
            .to_json()
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        writer.add_file(MANIFEST_NAME, &manifest_json).map_err(out_err)?;
        writer.finish().map_err(out_err)?;
        sink.event(&ProgressEvent::PhaseEnd { phase: Phase::Copy });

        Ok(BuildReport {
            entries: index.len(),
            images: images_selected,
            sequences_written: state.sequences_written,
            avif_written: state.avif_written,
            fallback_images: state.fallback_images,
            copied: state.verbatim.len() + copy_names.len(),
            original_bytes: state.original_bytes,
            compressed_bytes: state.compressed_bytes,
        })
    }
}

/// Mutable build state owned by the driver thread.
#[derive(Default)]
struct DriverState {
    manifest: Manifest,
    /// Encoded artifacts, written sorted by target name.
    artifacts: Vec<(String, Vec<u8>)>,
    /// Failed AVIF jobs, copied verbatim under their original names.
    verbatim: Vec<(String, Vec<u8>)>,
    /// Members of dissolved groups, re-queued in Phase B.
    fallback: Vec<String>,
    in_flight: HashMap<String, u64>,
    mem_in_flight: u64,
    done: usize,
    total: usize,
    original_bytes: u64,
    compressed_bytes: u64,
    sequences_written: usize,
    avif_written: usize,
    fallback_images: usize,
    fatal: Option<Error>,
}

impl DriverState {
    fn release(&mut self, key: &str) {
        if let Some(estimate) = self.in_flight.remove(key) {
            self.mem_in_flight -= estimate;
        }
    }

    fn task_done(&mut self, sink: &mut dyn ProgressSink, message: String) {
        self.done += 1;
        sink.event(&ProgressEvent::TaskDone {
            done: self.done,
            total: self.total,
            original_bytes: self.original_bytes,
            compressed_bytes: self.compressed_bytes,
            message,
        });
    }

    fn absorb(&mut self, result: TaskResult, sink: &mut dyn ProgressSink, input: &Path) {
        match result {
            TaskResult::AvisOk {
                key,
                target,
                data,
                members,
                original_bytes,
            } => {
                self.release(&key);
                self.original_bytes += original_bytes;
                self.compressed_bytes += data.len() as u64;
                for (frame, member) in members.iter().enumerate() {
                    self.manifest
                        .insert_sequence_frame(member, &target, frame as u32);
                }
                let message = format!("{target} ({} frames)", members.len());
                self.artifacts.push((target, data));
                self.sequences_written += 1;
                self.task_done(sink, message);
            }
            TaskResult::AvisFail {
                key,
                members,
                reason,
            } => {
                self.release(&key);
                sink.event(&ProgressEvent::Warning {
                    message: format!(
                        "sequence {key} failed ({reason}); re-queueing {} frames as AVIF",
                        members.len()
                    ),
                });
                self.fallback_images += members.len();
                self.fallback.extend(members);
                self.task_done(sink, format!("{key} dissolved"));
            }
            TaskResult::AvifOk {
                name,
                target,
                data,
                original_bytes,
            } => {
                self.original_bytes += original_bytes;
                self.compressed_bytes += data.len() as u64;
                self.manifest.insert_avif(&name, &target);
                self.artifacts.push((target.clone(), data));
                self.avif_written += 1;
                self.task_done(sink, target);
            }
            TaskResult::AvifFail {
                name,
                original,
                reason,
            } => {
                sink.event(&ProgressEvent::Warning {
                    message: format!("{name}: encode failed ({reason}); copying original"),
                });
                self.original_bytes += original.len() as u64;
                self.compressed_bytes += original.len() as u64;
                let message = format!("{name} copied verbatim");
                self.verbatim.push((name, original));
                self.task_done(sink, message);
            }
            TaskResult::Fatal { key, error } => {
                if let Some(key) = key {
                    self.release(&key);
                }
                if self.fatal.is_none() {
                    self.fatal = Some(Error::Archive {
                        path: input.to_path_buf(),
                        source: error,
                    });
                }
            }
        }
    }

    fn pool_lost(&mut self) {
        if self.fatal.is_none() {
            self.fatal = Some(Error::Io(std::io::Error::other(
                "worker pool terminated unexpectedly",
            )));
        }
    }
}

fn worker_loop(
    input: PathBuf,
    codec: Arc<dyn Codec>,
    jobs: Arc<Mutex<Receiver<Job>>>,
    results: Sender<TaskResult>,
) {
    // Each worker owns its archive handle; only the seek position is state.
    let mut reader = match RpaReader::open(&input) {
        Ok(reader) => reader,
        Err(error) => {
            let _ = results.send(TaskResult::Fatal { key: None, error });
            return;
        }
    };
    loop {
        let job = {
            let guard = jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.recv()
        };
        let result = match job {
            Ok(Job::Avis {
                key,
                target,
                entries,
            }) => avis_job(&mut reader, codec.as_ref(), key, target, entries),
            Ok(Job::Avif { entry, target }) => avif_job(&mut reader, codec.as_ref(), entry, target),
            Err(_) => break,
        };
        if results.send(result).is_err() {
            break;
        }
    }
}

fn avis_job(
    reader: &mut RpaReader,
    codec: &dyn Codec,
    key: String,
    target: String,
    entries: Vec<RpaEntry>,
) -> TaskResult {
    let members: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();

    // Archive reads are fatal for the build; everything past them recovers.
    let mut blobs = Vec::with_capacity(entries.len());
    for entry in &entries {
        match reader.read_file(entry) {
            Ok(data) => blobs.push(data),
            Err(error) => {
                return TaskResult::Fatal {
                    key: Some(key),
                    error,
                }
            }
        }
    }
    let original_bytes: u64 = blobs.iter().map(|b| b.len() as u64).sum();

    match panic::catch_unwind(AssertUnwindSafe(|| encode_group(codec, &blobs))) {
        Ok(Ok(data)) => TaskResult::AvisOk {
            key,
            target,
            data,
            members,
            original_bytes,
        },
        Ok(Err(reason)) => TaskResult::AvisFail {
            key,
            members,
            reason,
        },
        Err(_) => TaskResult::AvisFail {
            key,
            members,
            reason: "encoder panicked".to_string(),
        },
    }
}

/// Decodes every frame, checks the shared dimensions, and encodes the
/// sequence. Errors come back as strings; the scheduler only reports them.
fn encode_group(codec: &dyn Codec, blobs: &[Vec<u8>]) -> std::result::Result<Vec<u8>, String> {
    let mut frames = Vec::with_capacity(blobs.len());
    for (i, blob) in blobs.iter().enumerate() {
        let frame =
            renpak_encoder::decode_rgba(blob).map_err(|e| format!("frame {i} decode: {e}"))?;
        frames.push(frame);
    }
    let first = frames.first().ok_or("empty group")?;
    let (width, height) = (first.width(), first.height());
    for frame in &frames {
        if frame.width() != width || frame.height() != height {
            return Err(format!(
                "resolution mismatch {}x{} vs {}x{}",
                width,
                height,
                frame.width(),
                frame.height()
            ));
        }
    }
    codec
        .encode_avis(&frames, width, height)
        .map_err(|e| e.to_string())
}

fn avif_job(
    reader: &mut RpaReader,
    codec: &dyn Codec,
    entry: RpaEntry,
    target: String,
) -> TaskResult {
    let data = match reader.read_file(&entry) {
        Ok(data) => data,
        Err(error) => {
            return TaskResult::Fatal { key: None, error };
        }
    };
    let original_bytes = data.len() as u64;

    match panic::catch_unwind(AssertUnwindSafe(|| codec.encode_avif(&data))) {
        Ok(Ok(encoded)) => TaskResult::AvifOk {
            name: entry.name,
            target,
            data: encoded,
            original_bytes,
        },
        Ok(Err(e)) => TaskResult::AvifFail {
            name: entry.name,
            original: data,
            reason: e.to_string(),
        },
        Err(_) => TaskResult::AvifFail {
            name: entry.name,
            original: data,
            reason: "encoder panicked".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullSink;
    use image::RgbaImage;
    use renpak_core::{ManifestTarget, RpaIndex};
    use renpak_encoder::Error as EncodeError;

    struct FakeCodec {
        avis: bool,
        fail_avis: bool,
    }

    impl FakeCodec {
        fn working() -> Self {
            Self {
                avis: true,
                fail_avis: false,
            }
        }
    }

    impl Codec for FakeCodec {
        fn avis_available(&self) -> bool {
            self.avis
        }

        fn encode_avif(&self, data: &[u8]) -> std::result::Result<Vec<u8>, EncodeError> {
            if data.starts_with(b"FAILME") {
                return Err(EncodeError::EncodeFailed("forced avif failure".into()));
            }
            Ok([b"AVIF:".as_slice(), &data.len().to_le_bytes()].concat())
        }

        fn encode_avis(
            &self,
            frames: &[RgbaImage],
            _width: u32,
            _height: u32,
        ) -> std::result::Result<Vec<u8>, EncodeError> {
            if self.fail_avis {
                return Err(EncodeError::EncodeFailed("forced avis failure".into()));
            }
            Ok([b"AVIS:".as_slice(), &(frames.len() as u32).to_le_bytes()].concat())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<ProgressEvent>,
    }

    impl ProgressSink for RecordingSink {
        fn event(&mut self, event: &ProgressEvent) {
            self.events.push(event.clone());
        }
    }

    impl RecordingSink {
        fn warnings(&self) -> Vec<&str> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    ProgressEvent::Warning { message } => Some(message.as_str()),
                    _ => None,
                })
                .collect()
        }
    }

    fn png_bytes(w: u32, h: u32, shade: u8) -> Vec<u8> {
        let img = RgbaImage::from_pixel(w, h, image::Rgba([shade, 64, 128, 255]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn write_input(path: &Path, files: &[(String, Vec<u8>)]) {
        let mut writer = RpaWriter::create(path).unwrap();
        for (name, data) in files {
            writer.add_file(name, data).unwrap();
        }
        writer.finish().unwrap();
    }

    fn test_options() -> BuildOptions {
        BuildOptions {
            workers: 2,
            memory_budget: Some(1 << 30),
            ..BuildOptions::default()
        }
    }

    fn read_output(path: &Path) -> (RpaIndex, Manifest, RpaReader) {
        let mut reader = RpaReader::open(path).unwrap();
        let index = reader.read_index().unwrap();
        let manifest_entry = index.get(MANIFEST_NAME).expect("manifest entry").clone();
        let manifest =
            Manifest::from_json(&reader.read_file(&manifest_entry).unwrap()).unwrap();
        (index, manifest, reader)
    }

    fn ale_frames() -> Vec<(String, Vec<u8>)> {
        (1..=5)
            .map(|i| (format!("images/01/ale {i}.jpg"), png_bytes(8, 8, i as u8 * 40)))
            .collect()
    }

    #[test]
    fn test_full_build_with_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.rpa");
        let output = dir.path().join("output.rpa");

        let mut files = ale_frames();
        files.push(("images/01/dun 1.jpg".into(), png_bytes(8, 8, 10)));
        files.push(("images/01/dun 2.jpg".into(), png_bytes(8, 8, 20)));
        files.push(("images/01/solo.jpg".into(), png_bytes(8, 8, 30)));
        files.push(("script.rpy".into(), b"label start:\n    pass\n".to_vec()));
        files.push(("gui/logo.png".into(), png_bytes(4, 4, 99)));
        write_input(&input, &files);

        let builder = Builder::new(FakeCodec::working(), test_options());
        let report = builder
            .build(&input, &output, &mut NullSink, &AtomicBool::new(false))
            .unwrap();

        let (index, manifest, mut reader) = read_output(&output);

        // One sequence, three scatter AVIFs, two passthrough entries.
        assert!(index.get("sequences/images/01/ale .jpg.avis").is_some());
        for name in [
            "images/01/dun 1.avif",
            "images/01/dun 2.avif",
            "images/01/solo.avif",
        ] {
            assert!(index.get(name).is_some(), "missing {name}");
        }
        assert_eq!(report.sequences_written, 1);
        assert_eq!(report.avif_written, 3);
        assert_eq!(report.images, 8);
        assert_eq!(report.copied, 2);

        // Frame order follows the numeric run order.
        assert_eq!(
            manifest.get("images/01/ale 3.jpg"),
            Some(&ManifestTarget::Sequence {
                avis: "sequences/images/01/ale .jpg.avis".into(),
                frame: 2
            })
        );
        assert_eq!(
            manifest.get("images/01/solo.jpg"),
            Some(&ManifestTarget::Avif("images/01/solo.avif".into()))
        );

        // Skipped and non-image entries are copied verbatim and unmanifested.
        assert!(manifest.get("gui/logo.png").is_none());
        assert!(manifest.get("script.rpy").is_none());
        let logo = index.get("gui/logo.png").unwrap().clone();
        assert_eq!(reader.read_file(&logo).unwrap(), png_bytes(4, 4, 99));

        // Every manifested target resolves in the output index.
        for (_, target) in manifest.iter() {
            let target_name = match target {
                ManifestTarget::Avif(name) => name.as_str(),
                ManifestTarget::Sequence { avis, .. } => avis.as_str(),
            };
            assert!(index.get(target_name).is_some(), "dangling {target_name}");
        }
        assert_eq!(manifest.len(), 8);
    }

    #[test]
    fn test_dimension_mismatch_dissolves_group() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.rpa");
        let output = dir.path().join("output.rpa");

        let mut files = ale_frames();
        // Frame 3 deviates.
        files[2].1 = png_bytes(16, 16, 120);
        write_input(&input, &files);

        let builder = Builder::new(FakeCodec::working(), test_options());
        let mut sink = RecordingSink::default();
        let report = builder
            .build(&input, &output, &mut sink, &AtomicBool::new(false))
            .unwrap();

        let (index, manifest, _) = read_output(&output);
        assert!(index.names().all(|n| !n.starts_with("sequences/")));
        assert_eq!(report.sequences_written, 0);
        assert_eq!(report.avif_written, 5);
        assert_eq!(report.fallback_images, 5);
        for i in 1..=5 {
            assert_eq!(
                manifest.get(&format!("images/01/ale {i}.jpg")),
                Some(&ManifestTarget::Avif(format!("images/01/ale {i}.avif")))
            );
        }
        assert!(sink
            .warnings()
            .iter()
            .any(|w| w.contains("resolution mismatch")));
    }

    #[test]
    fn test_encoder_failure_dissolves_group() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.rpa");
        let output = dir.path().join("output.rpa");
        write_input(&input, &ale_frames());

        let builder = Builder::new(
            FakeCodec {
                avis: true,
                fail_avis: true,
            },
            test_options(),
        );
        let mut sink = RecordingSink::default();
        let report = builder
            .build(&input, &output, &mut sink, &AtomicBool::new(false))
            .unwrap();

        assert_eq!(report.sequences_written, 0);
        assert_eq!(report.avif_written, 5);
        assert!(sink
            .warnings()
            .iter()
            .any(|w| w.contains("forced avis failure")));
    }

    #[test]
    fn test_capability_downgrade() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.rpa");
        let output = dir.path().join("output.rpa");
        write_input(&input, &ale_frames());

        let builder = Builder::new(
            FakeCodec {
                avis: false,
                fail_avis: false,
            },
            test_options(),
        );
        let mut sink = RecordingSink::default();
        let report = builder
            .build(&input, &output, &mut sink, &AtomicBool::new(false))
            .unwrap();

        assert_eq!(report.sequences_written, 0);
        assert_eq!(report.avif_written, 5);
        assert!(sink
            .warnings()
            .iter()
            .any(|w| w.contains("AVIS backend unavailable")));
    }

    #[test]
    fn test_limit_filters_before_grouping() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.rpa");
        let output = dir.path().join("output.rpa");
        let files = ale_frames();
        write_input(&input, &files);

        let options = BuildOptions {
            limit: 3,
            ..test_options()
        };
        let builder = Builder::new(FakeCodec::working(), options);
        let report = builder
            .build(&input, &output, &mut NullSink, &AtomicBool::new(false))
            .unwrap();

        let (index, manifest, mut reader) = read_output(&output);
        // Three images under the limit form no group and scatter to AVIF;
        // the rest pass through untouched.
        assert_eq!(report.sequences_written, 0);
        assert_eq!(report.avif_written, 3);
        assert_eq!(manifest.len(), 3);
        for i in 1..=3 {
            assert!(index.get(&format!("images/01/ale {i}.avif")).is_some());
        }
        for (i, (name, data)) in files.iter().enumerate().skip(3) {
            let entry = index.get(name).expect(name).clone();
            assert_eq!(reader.read_file(&entry).unwrap(), *data, "entry {i}");
            assert!(manifest.get(name).is_none());
        }
    }

    #[test]
    fn test_limit_larger_than_image_count() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.rpa");
        let output = dir.path().join("output.rpa");
        write_input(&input, &ale_frames());

        let options = BuildOptions {
            limit: 100,
            ..test_options()
        };
        let builder = Builder::new(FakeCodec::working(), options);
        let report = builder
            .build(&input, &output, &mut NullSink, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(report.images, 5);
        assert_eq!(report.sequences_written, 1);
    }

    #[test]
    fn test_avif_failure_copies_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.rpa");
        let output = dir.path().join("output.rpa");
        let bad = b"FAILME this is not an image".to_vec();
        write_input(
            &input,
            &[
                ("images/bad.jpg".to_string(), bad.clone()),
                ("images/good.jpg".to_string(), png_bytes(8, 8, 1)),
            ],
        );

        let builder = Builder::new(FakeCodec::working(), test_options());
        let mut sink = RecordingSink::default();
        let report = builder
            .build(&input, &output, &mut sink, &AtomicBool::new(false))
            .unwrap();

        let (index, manifest, mut reader) = read_output(&output);
        let entry = index.get("images/bad.jpg").expect("verbatim copy").clone();
        assert_eq!(reader.read_file(&entry).unwrap(), bad);
        assert!(manifest.get("images/bad.jpg").is_none());
        assert!(manifest.get("images/good.jpg").is_some());
        assert_eq!(report.avif_written, 1);
        assert_eq!(report.copied, 1);
        assert!(sink.warnings().iter().any(|w| w.contains("forced avif failure")));
    }

    #[test]
    fn test_oversize_group_is_admitted_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.rpa");
        let output = dir.path().join("output.rpa");

        let mut files = ale_frames();
        files.extend((1..=5).map(|i| (format!("images/02/bob {i}.jpg"), png_bytes(8, 8, i))));
        write_input(&input, &files);

        // Budget far below one group's estimate; the oversize exception must
        // still let both groups through, one at a time.
        let options = BuildOptions {
            assumed_frame_bytes: 1000,
            memory_budget: Some(10),
            ..test_options()
        };
        let builder = Builder::new(FakeCodec::working(), options);
        let report = builder
            .build(&input, &output, &mut NullSink, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(report.sequences_written, 2);

        let (index, _, _) = read_output(&output);
        assert!(index.get("sequences/images/01/ale .jpg.avis").is_some());
        assert!(index.get("sequences/images/02/bob .jpg.avis").is_some());
    }

    #[test]
    fn test_cancelled_build_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.rpa");
        let output = dir.path().join("output.rpa");
        write_input(&input, &ale_frames());

        let builder = Builder::new(FakeCodec::working(), test_options());
        let err = builder
            .build(&input, &output, &mut NullSink, &AtomicBool::new(true))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!output.exists());
    }

    #[test]
    fn test_missing_input_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Builder::new(FakeCodec::working(), test_options());
        let err = builder
            .build(
                &dir.path().join("nope.rpa"),
                &dir.path().join("out.rpa"),
                &mut NullSink,
                &AtomicBool::new(false),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Archive { .. }));
    }
}
