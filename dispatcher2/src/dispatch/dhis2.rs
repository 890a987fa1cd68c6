//! Response payloads of DHIS2-family destinations.

use serde::Deserialize;

/// Import statistics reported by a synchronous import.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportStats {
    pub created: i64,
    pub updated: i64,
    pub deleted: i64,
    pub ignored: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportResponse {
    pub status: String,
    pub stats: ImportStats,
}

/// The body of a 2xx response from a synchronous import endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportSummary {
    pub response: ImportResponse,
}

impl ImportSummary {
    pub fn summary_line(&self) -> String {
        format!(
            "Created: {}, Updated: {}",
            self.response.stats.created, self.response.stats.updated
        )
    }
}

/// The body of a 2xx response from an asynchronous import endpoint: the job
/// has been accepted and is identified by `(jobType, id)`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AsyncJobAccepted {
    pub status: String,
    pub response: AsyncJobRef,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AsyncJobRef {
    pub id: String,
    #[serde(rename = "jobType")]
    pub job_type: String,
}

/// One entry of `system/tasks/{jobType}/{jobId}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AsyncJobStatus {
    pub uid: String,
    pub level: String,
    pub category: String,
    pub time: String,
    pub message: String,
    pub completed: bool,
}

/// The body of `system/taskSummaries/{jobType}/{jobId}`. Older servers report
/// the counts under `importCount`, newer ones flat under `stats`; both are
/// accepted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AsyncImportCount {
    pub imported: i64,
    pub updated: i64,
    pub ignored: i64,
    pub deleted: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AsyncJobImportSummary {
    pub status: String,
    pub description: String,
    #[serde(rename = "importCount", alias = "stats")]
    pub import_count: AsyncImportCount,
    pub total: i64,
}

impl AsyncJobImportSummary {
    pub fn summary_line(&self) -> String {
        let c = &self.import_count;
        let total = if self.total > 0 {
            self.total
        } else if c.total > 0 {
            c.total
        } else {
            c.imported + c.updated + c.ignored + c.deleted
        };
        format!(
            "Imported: {}, Updated: {}, Ignored: {}, Deleted: {}, Total: {}",
            c.imported, c.updated, c.ignored, c.deleted, total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_summary_parses_and_summarizes() {
        let body = r#"{"response":{"status":"SUCCESS","stats":{"created":2,"updated":1,"total":3}}}"#;
        let summary: ImportSummary = serde_json::from_str(body).unwrap();
        assert_eq!(summary.summary_line(), "Created: 2, Updated: 1");
    }

    #[test]
    fn async_accept_parses_job_reference() {
        let body = r#"{"status":"OK","response":{"id":"job-1","jobType":"DATAVALUE_IMPORT"}}"#;
        let accepted: AsyncJobAccepted = serde_json::from_str(body).unwrap();
        assert_eq!(accepted.response.id, "job-1");
        assert_eq!(accepted.response.job_type, "DATAVALUE_IMPORT");
    }

    #[test]
    fn task_summary_counts_total_when_missing() {
        let body = r#"{"importCount":{"imported":5,"updated":0,"ignored":0,"deleted":0}}"#;
        let summary: AsyncJobImportSummary = serde_json::from_str(body).unwrap();
        assert_eq!(
            summary.summary_line(),
            "Imported: 5, Updated: 0, Ignored: 0, Deleted: 0, Total: 5"
        );
    }
}
