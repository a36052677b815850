use std::time::Duration;

use cyder_tools::log::{debug, error, warn};
use tokio::sync::{mpsc, oneshot};

use crate::database::usage_log::{AppendOutcome, UsageLog};
use crate::database::{run_blocking, DbPool};
use crate::utils::billing::UsageInfo;
use crate::utils::{now_millis, ID_GENERATOR};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Final accounting of one chat attempt that obtained a reservation.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub user_id: i64,
    pub department_id: i64,
    pub reservation_id: i64,
    pub conversation_id: Option<i64>,
    pub model_name: String,
    pub provider: String,
    pub usage: UsageInfo,
    pub cost: i64,
    pub response_time_ms: i64,
    pub first_chunk_ms: Option<i64>,
    pub chunk_count: i32,
    pub success: bool,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl UsageRecord {
    fn into_log(self) -> UsageLog {
        UsageLog {
            id: ID_GENERATOR.generate_id(),
            user_id: self.user_id,
            department_id: self.department_id,
            reservation_id: Some(self.reservation_id),
            conversation_id: self.conversation_id,
            model_name: self.model_name,
            provider: self.provider,
            input_tokens: self.usage.input_tokens,
            output_tokens: self.usage.output_tokens,
            total_tokens: self.usage.total_tokens,
            cost: self.cost,
            response_time_ms: self.response_time_ms,
            first_chunk_ms: self.first_chunk_ms,
            chunk_count: self.chunk_count,
            success: self.success,
            error_kind: self.error_kind,
            error_message: self.error_message,
            created_at: now_millis(),
        }
    }
}

enum RecorderMessage {
    Record(UsageRecord),
    Flush(oneshot::Sender<()>),
}

/// Write-behind usage logger. `record` never blocks the request path; a
/// background task appends rows in arrival order.
#[derive(Clone)]
pub struct UsageRecorder {
    sender: mpsc::UnboundedSender<RecorderMessage>,
}

impl UsageRecorder {
    pub fn spawn(db: DbPool) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<RecorderMessage>();

        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    RecorderMessage::Record(record) => Self::process_record(&db, record).await,
                    RecorderMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("usage recorder stopped");
        });

        Self { sender }
    }

    pub fn record(&self, record: UsageRecord) {
        let reservation_id = record.reservation_id;
        if self.sender.send(RecorderMessage::Record(record)).is_err() {
            error!("Failed to enqueue usage record for reservation {}", reservation_id);
        }
    }

    /// Resolves once every record enqueued before this call has been written
    /// (or given up on).
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(RecorderMessage::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    async fn process_record(db: &DbPool, record: UsageRecord) {
        let reservation_id = record.reservation_id;
        let log = record.into_log();
        for attempt in 1..=MAX_ATTEMPTS {
            let row = log.clone();
            match run_blocking(db, move |conn| UsageLog::append(conn, &row)).await {
                Ok(AppendOutcome::Inserted) => return,
                Ok(AppendOutcome::Duplicate) => {
                    debug!("usage for reservation {} already recorded", reservation_id);
                    return;
                }
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!(
                        "usage log write for reservation {} failed (attempt {}): {}",
                        reservation_id, attempt, e
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => {
                    error!(
                        "dropping usage log for reservation {} after {} attempts: {}",
                        reservation_id, MAX_ATTEMPTS, e
                    );
                }
            }
        }
    }
}
