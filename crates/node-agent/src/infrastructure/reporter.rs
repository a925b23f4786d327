use tracing::info;

use crate::domain::scheduling::ReportAck;
use crate::domain::scheduling::ReportError;
use crate::domain::scheduling::TaskEvent;
use crate::domain::scheduling::TaskReporter;

/// Reporter for nodes without an upstream billing endpoint: records every event in the log
/// and accepts it, keeping the configured report interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl TaskReporter for LogReporter {
    fn report(&self, event: &TaskEvent) -> Result<ReportAck, ReportError> {
        info!(
            task_id = %event.task_id,
            status = %event.status,
            start_time = event.start_time,
            end_time = event.end_time,
            "Task report"
        );
        Ok(ReportAck {
            accepted: true,
            next_report_interval: None,
        })
    }
}
