//! Admission queue for user-submitted index operations
//!
//! A bounded FIFO of tasks, each carrying a completion channel. One worker
//! loop pops tasks and runs `pre_execute -> execute -> post_execute`,
//! signalling the channel with the outcome. Enqueueing fails when the queue
//! is full. Each task carries a cancellation context; a cancelled task still
//! drains its current stage, then completes with an error.

use crate::cluster::worker::DataCoord;
use crate::indexcoord::meta_table::{CreateIndexSpec, MetaTable};
use crate::types::{IndexId, SegmentInfo};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One admission operation, staged.
#[async_trait]
pub trait AdmissionTask: Send {
    fn name(&self) -> &'static str;

    async fn pre_execute(&mut self) -> Result<()>;

    async fn execute(&mut self) -> Result<()>;

    async fn post_execute(&mut self) -> Result<()>;
}

struct QueuedTask {
    task: Box<dyn AdmissionTask>,
    cancel: CancellationToken,
    done: oneshot::Sender<Result<()>>,
}

/// Bounded FIFO admission queue with a single worker loop.
pub struct TaskScheduler {
    tx: mpsc::Sender<QueuedTask>,
    rx: Mutex<Option<mpsc::Receiver<QueuedTask>>>,
}

impl TaskScheduler {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Enqueue a task, failing immediately when the queue is full. The
    /// returned channel resolves once all stages ran (or the task was
    /// cancelled between stages).
    pub fn enqueue(
        &self,
        task: Box<dyn AdmissionTask>,
        cancel: CancellationToken,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let (done, wait) = oneshot::channel();
        let name = task.name();
        self.tx
            .try_send(QueuedTask { task, cancel, done })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => Error::QueueFull,
                mpsc::error::TrySendError::Closed(_) => {
                    Error::Internal("task scheduler stopped".to_string())
                }
            })?;
        debug!(task = name, "admission task enqueued");
        Ok(wait)
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .expect("task scheduler started twice");
        info!("task scheduler started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("task scheduler stopped");
                    return;
                }
                queued = rx.recv() => match queued {
                    Some(queued) => Self::process(queued).await,
                    None => return,
                },
            }
        }
    }

    async fn process(mut queued: QueuedTask) {
        let name = queued.task.name();
        let result = Self::stages(&mut *queued.task, &queued.cancel).await;
        if let Err(err) = &result {
            warn!(task = name, %err, "admission task failed");
        }
        let _ = queued.done.send(result);
    }

    /// Cancellation is honored between stages only; a stage that has started
    /// always runs to completion.
    async fn stages(task: &mut dyn AdmissionTask, cancel: &CancellationToken) -> Result<()> {
        task.pre_execute().await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        task.execute().await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        task.post_execute().await
    }
}

/// CreateIndex admission: validate, persist the definition, then fan out one
/// AddSegmentIndex task per already-flushed segment.
pub struct CreateIndexTask {
    meta: Arc<MetaTable>,
    data_coord: Arc<dyn DataCoord>,
    scheduler: Arc<TaskScheduler>,
    spec: CreateIndexSpec,
    index_id: Option<IndexId>,
}

impl CreateIndexTask {
    pub fn new(
        meta: Arc<MetaTable>,
        data_coord: Arc<dyn DataCoord>,
        scheduler: Arc<TaskScheduler>,
        spec: CreateIndexSpec,
    ) -> Self {
        Self {
            meta,
            data_coord,
            scheduler,
            spec,
            index_id: None,
        }
    }
}

#[async_trait]
impl AdmissionTask for CreateIndexTask {
    fn name(&self) -> &'static str {
        "CreateIndex"
    }

    async fn pre_execute(&mut self) -> Result<()> {
        self.meta.can_create_index(&self.spec).await.map(|_| ())
    }

    async fn execute(&mut self) -> Result<()> {
        self.index_id = Some(self.meta.create_index(self.spec.clone()).await?);
        Ok(())
    }

    async fn post_execute(&mut self) -> Result<()> {
        let index_id = self.index_id.expect("execute ran");
        let segments = self
            .data_coord
            .get_flushed_segments(self.spec.collection_id)
            .await?;
        info!(
            index_id,
            collection_id = self.spec.collection_id,
            segments = segments.len(),
            "scheduling builds for flushed segments"
        );
        for segment in segments {
            let task = AddSegmentIndexTask::new(self.meta.clone(), segment, index_id);
            // fire and forget: the builds are tracked through MetaTable
            let _ = self
                .scheduler
                .enqueue(Box::new(task), CancellationToken::new())?;
        }
        Ok(())
    }
}

/// AddSegmentIndex admission: create one Unissued build row.
pub struct AddSegmentIndexTask {
    meta: Arc<MetaTable>,
    segment: SegmentInfo,
    index_id: IndexId,
}

impl AddSegmentIndexTask {
    pub fn new(meta: Arc<MetaTable>, segment: SegmentInfo, index_id: IndexId) -> Self {
        Self {
            meta,
            segment,
            index_id,
        }
    }
}

#[async_trait]
impl AdmissionTask for AddSegmentIndexTask {
    fn name(&self) -> &'static str {
        "AddSegmentIndex"
    }

    async fn pre_execute(&mut self) -> Result<()> {
        match self.meta.get_index(self.index_id).await {
            Some(meta) if !meta.deleted => Ok(()),
            _ => Err(Error::IndexNotFound(format!("index id {}", self.index_id))),
        }
    }

    async fn execute(&mut self) -> Result<()> {
        self.meta
            .add_segment_index(&self.segment, self.index_id)
            .await
            .map(|_| ())
    }

    async fn post_execute(&mut self) -> Result<()> {
        Ok(())
    }
}
