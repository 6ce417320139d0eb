use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{Error, ErrorKind, Result};
use crate::models::{build_path, Container, ConversionOutput, FileType, MediaJob, State};
use crate::plan::build_plan;

const PROGRESS_CHANNEL_CAPACITY: usize = 32;

#[derive(Serialize, Debug, Clone)]
pub struct JobSummary {
    pub id: Uuid,
    pub file_name: String,
    pub output_file_name: String,
    pub source: Container,
    pub target: Container,
    pub size: u64,
}

#[derive(Serialize, Debug, Clone)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct JobStatus {
    pub state: State,
    pub job: Option<JobSummary>,
    pub progress: u8,
    pub error: Option<Failure>,
    pub output_available: bool,
}

/// The single job slot. `generation` changes on every submit and reset, so
/// work belonging to an earlier job can tell it has been superseded.
struct Slot {
    generation: u64,
    state: State,
    job: Option<JobSummary>,
    progress: u8,
    output: Option<ConversionOutput>,
    failure: Option<Failure>,
}

impl Slot {
    fn new() -> Self {
        Slot {
            generation: 0,
            state: State::Idle,
            job: None,
            progress: 0,
            output: None,
            failure: None,
        }
    }

    fn clear(&mut self) {
        self.generation += 1;
        self.state = State::Idle;
        self.job = None;
        self.progress = 0;
        self.failure = None;

        if let Some(output) = self.output.take() {
            debug!("releasing {} ({} bytes)", output.file_name, output.data.len());
        }
    }
}

#[derive(Debug)]
pub struct Submitted {
    pub id: Uuid,
    pub task: JoinHandle<()>,
}

/// Runs one conversion at a time against a shared [`Engine`].
pub struct Processor<E> {
    engine: Arc<E>,
    slot: Arc<Mutex<Slot>>,
    // The engine is not re-entrant; a run abandoned by reset still holds this
    // until it finishes.
    engine_lock: Arc<tokio::sync::Mutex<()>>,
}

impl<E> Clone for Processor<E> {
    fn clone(&self) -> Self {
        Processor {
            engine: self.engine.clone(),
            slot: self.slot.clone(),
            engine_lock: self.engine_lock.clone(),
        }
    }
}

impl<E: Engine> Processor<E> {
    pub fn new(engine: E) -> Self {
        Processor {
            engine: Arc::new(engine),
            slot: Arc::new(Mutex::new(Slot::new())),
            engine_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    #[cfg(test)]
    pub(crate) fn engine(&self) -> &E {
        &self.engine
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A panic while holding the lock cannot leave the slot half-written.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts converting `job`. Rejected with [`Error::Busy`] while another
    /// job is loading or running.
    pub fn submit(&self, job: MediaJob) -> Result<Submitted> {
        let id = Uuid::new_v4();

        let generation = {
            let mut slot = self.lock();

            if slot.state.is_active() {
                return Err(Error::Busy);
            }

            slot.clear();
            slot.state = match self.engine.is_loaded() {
                true => State::Running,
                false => State::Loading,
            };
            slot.job = Some(JobSummary {
                id,
                file_name: job.file_name.clone(),
                output_file_name: job.output_file_name(),
                source: job.source,
                target: job.target,
                size: job.size,
            });
            slot.generation
        };

        info!(
            "[{}] processor: queued {} ({} bytes, {} -> {})",
            id, job.file_name, job.size, job.source, job.target
        );

        let processor = self.clone();
        let task = tokio::spawn(async move { processor.process_job(generation, id, job).await });

        Ok(Submitted { id, task })
    }

    /// Returns to `Idle`, dropping any held output. A job still loading or
    /// running is abandoned: it keeps running inside the engine, but its
    /// progress and result are ignored.
    pub fn reset(&self) {
        let mut slot = self.lock();

        if let Some(job) = &slot.job {
            match slot.state.is_active() {
                true => info!("[{}] processor: reset, abandoning running job", job.id),
                false => info!("[{}] processor: reset", job.id),
            }
        }

        slot.clear();
    }

    pub fn status(&self) -> JobStatus {
        let slot = self.lock();

        JobStatus {
            state: slot.state,
            job: slot.job.clone(),
            progress: slot.progress,
            error: slot.failure.clone(),
            output_available: slot.output.is_some(),
        }
    }

    pub fn output(&self) -> Option<ConversionOutput> {
        self.lock().output.clone()
    }

    /// Moves a current job into `state`. Returns false if the job was reset.
    fn advance(&self, generation: u64, state: State) -> bool {
        let mut slot = self.lock();

        if slot.generation != generation {
            return false;
        }

        slot.state = state;
        true
    }

    fn record_progress(&self, generation: u64, ratio: f64) {
        let mut slot = self.lock();

        if slot.generation != generation || slot.state != State::Running {
            return;
        }

        let percent = (ratio.clamp(0.0, 1.0) * 100.0).round() as u8;
        slot.progress = slot.progress.max(percent);
    }

    fn finish(&self, generation: u64, id: Uuid, result: Result<ConversionOutput>) {
        let mut slot = self.lock();

        if slot.generation != generation {
            debug!("[{}] processor: job was reset, discarding result", id);
            return;
        }

        match result {
            Ok(output) => {
                info!(
                    "[{}] processor: complete, {} ({} bytes)",
                    id,
                    output.file_name,
                    output.data.len()
                );
                slot.state = State::Succeeded;
                slot.progress = 100;
                slot.output = Some(output);
            }
            Err(err) => {
                error!("[{}] processor: ended with error: {}", id, err);
                slot.state = State::Failed;
                slot.progress = 0;
                slot.failure = Some(Failure {
                    kind: err.kind(),
                    message: err.to_string(),
                });
            }
        }
    }

    async fn process_job(self, generation: u64, id: Uuid, job: MediaJob) {
        let _engine = self.engine_lock.lock().await;

        if !self.engine.is_loaded() {
            info!("[{}] processor: loading conversion library", id);
        }

        if let Err(err) = self.engine.load().await {
            self.finish(generation, id, Err(err));
            return;
        }

        if !self.advance(generation, State::Running) {
            debug!("[{}] processor: job was reset before it started", id);
            return;
        }

        let input = build_path(id, FileType::Input, job.source);
        let output = build_path(id, FileType::Output, job.target);

        let result = self.transcode(generation, id, &job, &input, &output).await;

        // Nothing the engine wrote for this job outlives it.
        for name in [&input, &output] {
            if let Err(err) = self.engine.remove(name).await {
                debug!("[{}] processor: failed to remove {}: {}", id, name, err);
            }
        }

        self.finish(generation, id, result);
    }

    async fn transcode(
        &self,
        generation: u64,
        id: Uuid,
        job: &MediaJob,
        input: &str,
        output: &str,
    ) -> Result<ConversionOutput> {
        self.engine.write_input(input, &job.input).await?;

        let plan = build_plan(job.target, &job.options());
        let arguments = plan.build_arguments(input, output);

        info!("[{}] processor: starting ffmpeg", id);

        let (tx, mut rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);

        // The sender moves into the run, so the channel closes as soon as the
        // run returns and no progress from this job can arrive later.
        let run = self.engine.run(arguments, tx);
        let listen = async {
            while let Some(ratio) = rx.recv().await {
                self.record_progress(generation, ratio);
            }
        };

        let (result, ()) = tokio::join!(run, listen);
        result?;

        let data = self.engine.read_output(output).await?;

        Ok(ConversionOutput {
            data,
            mime_type: job.target.mime_type(),
            file_name: job.output_file_name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::ScriptedEngine;
    use crate::models::{ConversionOptions, Optimization};
    use bytes::Bytes;
    use std::time::Duration;

    const LIMIT: u64 = 10 * 1024 * 1024;

    fn job(name: &str, size: usize) -> MediaJob {
        MediaJob::new(name, Bytes::from(vec![7u8; size]), LIMIT).unwrap()
    }

    async fn wait_until<E: Engine>(processor: &Processor<E>, check: impl Fn(&JobStatus) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check(&processor.status()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for_run(engine: &ScriptedEngine, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.runs().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("engine run not started in time");
    }

    #[tokio::test]
    async fn mp4_converts_to_webm() {
        let processor = Processor::new(ScriptedEngine::new());
        let status = processor.status();
        assert_eq!(status.state, State::Idle);

        let submitted = processor.submit(job("clip.mp4", 2 * 1024 * 1024)).unwrap();
        submitted.task.await.unwrap();

        let status = processor.status();
        assert_eq!(status.state, State::Succeeded);
        assert_eq!(status.progress, 100);
        assert!(status.output_available);

        let output = processor.output().unwrap();
        assert_eq!(output.mime_type, "video/webm");
        assert_eq!(output.file_name, "clip.webm");
        assert_eq!(output.data.len(), 2 * 1024 * 1024);

        let runs = processor.engine.runs();
        assert_eq!(runs.len(), 1);
        let argv = runs[0].join(" ");
        assert!(argv.contains("-c:v libvpx -crf 30 -b:v 0 -c:a libvorbis"), "{argv}");
    }

    #[tokio::test]
    async fn options_are_snapshotted_into_the_plan() {
        let processor = Processor::new(ScriptedEngine::new());
        let mut job = job("clip.mp4", 16);
        job.set_options(ConversionOptions {
            include_audio: false,
            optimization: Optimization::TargetSize,
        });

        processor.submit(job).unwrap().task.await.unwrap();

        let argv = processor.engine.runs()[0].join(" ");
        assert!(argv.contains("-crf 40"), "{argv}");
        assert!(argv.contains("-fpsmax 15"), "{argv}");
        assert!(argv.contains("-an"), "{argv}");
        assert!(!argv.contains("-b:a"), "{argv}");
    }

    #[tokio::test]
    async fn webm_size_preset_targets_h264() {
        let processor = Processor::new(ScriptedEngine::new());
        let mut job = job("clip.webm", 16);
        job.set_options(ConversionOptions {
            include_audio: false,
            optimization: Optimization::TargetSize,
        });

        processor.submit(job).unwrap().task.await.unwrap();

        let argv = processor.engine.runs()[0].join(" ");
        assert!(argv.contains("-c:v libx264 -crf 35"), "{argv}");
        assert!(argv.contains("-fpsmax 15 -an"), "{argv}");
        assert_eq!(processor.output().unwrap().mime_type, "video/mp4");
    }

    #[tokio::test]
    async fn engine_files_are_removed_after_the_job() {
        let processor = Processor::new(ScriptedEngine::new());
        processor.submit(job("clip.mp4", 16)).unwrap().task.await.unwrap();
        assert!(processor.engine.file_names().is_empty());

        let processor = Processor::new(ScriptedEngine::new().failing_runs());
        processor.submit(job("clip.mp4", 16)).unwrap().task.await.unwrap();
        assert!(processor.engine.file_names().is_empty());
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_ends_at_100() {
        let processor = Processor::new(ScriptedEngine::new().holding_runs());
        let submitted = processor.submit(job("clip.mp4", 16)).unwrap();

        wait_for_run(&processor.engine, 1).await;
        let observer = {
            let processor = processor.clone();
            tokio::spawn(async move {
                let mut seen = vec![];
                loop {
                    let status = processor.status();
                    seen.push(status.progress);
                    if !status.state.is_active() {
                        return seen;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        processor.engine.release();
        submitted.task.await.unwrap();
        let seen = observer.await.unwrap();

        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "{seen:?}");
        assert_eq!(seen.last(), Some(&100));
    }

    #[tokio::test]
    async fn submission_while_running_is_rejected() {
        let processor = Processor::new(ScriptedEngine::new().holding_runs());
        let first = processor.submit(job("first.mp4", 16)).unwrap();
        wait_for_run(&processor.engine, 1).await;

        let before = processor.status();
        let err = processor.submit(job("second.webm", 16)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        let after = processor.status();
        assert_eq!(after.state, State::Running);
        assert_eq!(after.job.unwrap().id, before.job.unwrap().id);

        processor.engine.release();
        first.task.await.unwrap();
        assert_eq!(processor.engine.runs().len(), 1);
        assert_eq!(processor.output().unwrap().file_name, "first.webm");
    }

    #[tokio::test]
    async fn submission_while_loading_is_rejected() {
        let processor = Processor::new(ScriptedEngine::new());
        let first = processor.submit(job("clip.mp4", 16)).unwrap();
        assert_eq!(processor.status().state, State::Loading);

        let err = processor.submit(job("clip.mp4", 16)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        first.task.await.unwrap();
        assert_eq!(processor.engine.load_attempts(), 1);
    }

    #[tokio::test]
    async fn loaded_engine_skips_the_loading_state() {
        let processor = Processor::new(ScriptedEngine::new());
        processor.submit(job("clip.mp4", 16)).unwrap().task.await.unwrap();

        let second = processor.submit(job("clip.webm", 16)).unwrap();
        assert_eq!(processor.status().state, State::Running);
        second.task.await.unwrap();

        assert_eq!(processor.engine.load_attempts(), 1);
        assert_eq!(processor.output().unwrap().file_name, "clip.mp4");
    }

    #[tokio::test]
    async fn failed_load_is_retried_on_next_submission() {
        let processor = Processor::new(ScriptedEngine::new().failing_loads(1));
        processor.submit(job("clip.mp4", 16)).unwrap().task.await.unwrap();

        let status = processor.status();
        assert_eq!(status.state, State::Failed);
        assert_eq!(status.error.unwrap().kind, ErrorKind::EngineInitFailure);
        assert!(processor.engine.runs().is_empty());

        processor.reset();
        let second = processor.submit(job("clip.mp4", 16)).unwrap();
        assert_eq!(processor.status().state, State::Loading);
        second.task.await.unwrap();

        assert_eq!(processor.status().state, State::Succeeded);
        assert_eq!(processor.engine.load_attempts(), 2);
    }

    #[tokio::test]
    async fn run_failure_is_reported_with_a_kind() {
        let processor = Processor::new(ScriptedEngine::new().failing_runs());
        processor.submit(job("clip.webm", 16)).unwrap().task.await.unwrap();

        let status = processor.status();
        assert_eq!(status.state, State::Failed);
        assert!(!status.output_available);
        let failure = status.error.unwrap();
        assert_eq!(failure.kind, ErrorKind::EngineRunFailure);
        assert!(failure.message.contains("scripted run failure"));
        // The run reached its end marker before failing.
        assert_eq!(status.progress, 0);
    }

    #[tokio::test]
    async fn reset_releases_output_and_progress() {
        let processor = Processor::new(ScriptedEngine::new());
        processor.submit(job("clip.mp4", 16)).unwrap().task.await.unwrap();
        assert!(processor.output().is_some());

        processor.reset();

        let status = processor.status();
        assert_eq!(status.state, State::Idle);
        assert_eq!(status.progress, 0);
        assert!(status.job.is_none());
        assert!(processor.output().is_none());

        let next = processor.submit(job("clip.webm", 16)).unwrap();
        assert_eq!(processor.status().progress, 0);
        next.task.await.unwrap();
    }

    #[tokio::test]
    async fn new_submission_replaces_previous_output() {
        let processor = Processor::new(ScriptedEngine::new().holding_runs());
        processor.engine.release();
        processor.submit(job("first.mp4", 16)).unwrap().task.await.unwrap();
        assert_eq!(processor.output().unwrap().file_name, "first.webm");

        let second = processor.submit(job("second.mp4", 16)).unwrap();
        assert!(processor.output().is_none());
        assert_eq!(processor.status().progress, 0);

        processor.engine.release();
        second.task.await.unwrap();
        assert_eq!(processor.output().unwrap().file_name, "second.webm");
    }

    #[tokio::test]
    async fn no_progress_or_result_after_reset() {
        let processor = Processor::new(ScriptedEngine::new().holding_runs());
        let submitted = processor.submit(job("clip.mp4", 16)).unwrap();
        wait_for_run(&processor.engine, 1).await;

        processor.reset();
        processor.engine.release();
        submitted.task.await.unwrap();

        let status = processor.status();
        assert_eq!(status.state, State::Idle);
        assert_eq!(status.progress, 0);
        assert!(processor.output().is_none());
    }

    #[tokio::test]
    async fn abandoned_run_finishes_before_the_next_one_starts() {
        let processor = Processor::new(ScriptedEngine::new().holding_runs());
        let first = processor.submit(job("first.mp4", 16)).unwrap();
        wait_for_run(&processor.engine, 1).await;

        processor.reset();
        let second = processor.submit(job("second.mp4", 16)).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(processor.engine.runs().len(), 1);

        processor.engine.release();
        first.task.await.unwrap();
        wait_for_run(&processor.engine, 2).await;
        processor.engine.release();
        second.task.await.unwrap();

        wait_until(&processor, |status| status.state == State::Succeeded).await;
        assert_eq!(processor.output().unwrap().file_name, "second.webm");
    }
}
