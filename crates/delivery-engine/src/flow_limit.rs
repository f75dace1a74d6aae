//! Producer flow control for a single queue.
//!
//! The queue stops accepting work from publishers once its depth exceeds a
//! stop threshold (message count or total bytes) and resumes once it has
//! drained below the resume thresholds. A resume threshold of zero means
//! "same as stop".

use crate::error::ValidationError;
use crate::message::QueueName;
use parking_lot::Mutex;
use tracing::info;

#[cfg(test)]
#[path = "flow_limit_tests.rs"]
mod tests;

/// Stop and resume thresholds. Zero stop values disable that dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowThresholds {
    pub stop_count: u64,
    pub resume_count: u64,
    pub stop_size: u64,
    pub resume_size: u64,
}

impl FlowThresholds {
    pub fn is_enabled(&self) -> bool {
        self.stop_count != 0 || self.stop_size != 0
    }
}

fn validate_pair(
    queue: &QueueName,
    kind: &str,
    stop: u64,
    resume: u64,
) -> Result<u64, ValidationError> {
    if resume > stop {
        return Err(ValidationError::OutOfRange {
            field: format!("flow_resume_{}", kind),
            message: format!(
                "queue \"{}\": flow_resume_{}={} must be less than flow_stop_{}={}",
                queue, kind, resume, kind, stop
            ),
        });
    }
    Ok(if resume == 0 { stop } else { resume })
}

#[derive(Debug, Default)]
struct FlowState {
    count: u64,
    size: u64,
    stopped: bool,
}

/// Change in flow state caused by one enqueue or dequeue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTransition {
    Unchanged,
    Stopped,
    Resumed,
}

pub struct QueueFlowLimit {
    queue: QueueName,
    thresholds: FlowThresholds,
    state: Mutex<FlowState>,
}

impl QueueFlowLimit {
    /// Validate the thresholds and fill in defaulted resume values
    pub fn new(queue: QueueName, thresholds: FlowThresholds) -> Result<Self, ValidationError> {
        let resume_count = validate_pair(
            &queue,
            "count",
            thresholds.stop_count,
            thresholds.resume_count,
        )?;
        let resume_size =
            validate_pair(&queue, "size", thresholds.stop_size, thresholds.resume_size)?;
        let thresholds = FlowThresholds {
            resume_count,
            resume_size,
            ..thresholds
        };

        info!(
            queue = %queue,
            flow_stop_count = thresholds.stop_count,
            flow_resume_count = thresholds.resume_count,
            flow_stop_size = thresholds.stop_size,
            flow_resume_size = thresholds.resume_size,
            "Flow limit created"
        );

        Ok(Self {
            queue,
            thresholds,
            state: Mutex::new(FlowState::default()),
        })
    }

    pub fn thresholds(&self) -> FlowThresholds {
        self.thresholds
    }

    /// Account for an enqueued message and report whether flow stopped
    pub fn enqueued(&self, size: u64) -> FlowTransition {
        let mut state = self.state.lock();
        state.count += 1;
        state.size += size;

        if state.stopped {
            return FlowTransition::Unchanged;
        }

        let t = &self.thresholds;
        if t.stop_count != 0 && state.count > t.stop_count {
            state.stopped = true;
            info!(
                queue = %self.queue,
                flow_stop_count = t.stop_count,
                "Queue has reached its enqueued message limit. Producer flow control activated."
            );
            FlowTransition::Stopped
        } else if t.stop_size != 0 && state.size > t.stop_size {
            state.stopped = true;
            info!(
                queue = %self.queue,
                flow_stop_size = t.stop_size,
                "Queue has reached its enqueued byte limit. Producer flow control activated."
            );
            FlowTransition::Stopped
        } else {
            FlowTransition::Unchanged
        }
    }

    /// Account for a dequeued message and report whether flow resumed
    pub fn dequeued(&self, size: u64) -> FlowTransition {
        let mut state = self.state.lock();
        state.count = state.count.saturating_sub(1);
        state.size = state.size.saturating_sub(size);

        let t = &self.thresholds;
        if state.stopped
            && (t.resume_size == 0 || state.size < t.resume_size)
            && (t.resume_count == 0 || state.count < t.resume_count)
        {
            state.stopped = false;
            info!(
                queue = %self.queue,
                "Queue has drained below the flow control resume level. \
                 Producer flow control deactivated."
            );
            return FlowTransition::Resumed;
        }
        FlowTransition::Unchanged
    }

    pub fn is_flow_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }
}

impl std::fmt::Debug for QueueFlowLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueFlowLimit")
            .field("queue", &self.queue)
            .field("thresholds", &self.thresholds)
            .field("stopped", &self.is_flow_stopped())
            .finish()
    }
}
