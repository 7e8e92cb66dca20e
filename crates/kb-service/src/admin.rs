//! Administrative operations.
//!
//! Each operation returns an [`AdminResponse`]; errors are reported in the
//! response rather than propagated, so a caller can render any outcome.

use std::sync::Arc;

use kb_scheduler::{IngestionScheduler, SchedulerStatus};
use kb_vector::IndexStats;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ServiceError;
use crate::knowledge_base::KnowledgeBase;

/// Structured result of an admin operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T> AdminResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

fn respond<T>(
    op: &str,
    result: Result<T, ServiceError>,
    message: impl FnOnce(&T) -> String,
) -> AdminResponse<T> {
    match result {
        Ok(data) => {
            let message = message(&data);
            info!(op, %message, "Admin operation succeeded");
            AdminResponse::ok(message, data)
        }
        Err(e) => {
            warn!(op, error = %e, "Admin operation failed");
            AdminResponse::failure(format!("{} failed: {}", op, e))
        }
    }
}

pub struct AdminService {
    knowledge_base: Arc<KnowledgeBase>,
    scheduler: Arc<IngestionScheduler>,
}

impl AdminService {
    pub fn new(knowledge_base: Arc<KnowledgeBase>, scheduler: Arc<IngestionScheduler>) -> Self {
        Self {
            knowledge_base,
            scheduler,
        }
    }

    /// Remove every chunk of a document.
    pub fn remove_by_id(&self, document_id: &str) -> AdminResponse<usize> {
        if document_id.trim().is_empty() {
            return AdminResponse::failure("document id is empty");
        }
        respond(
            "remove_by_id",
            self.knowledge_base.remove_by_document_id(document_id),
            |n| format!("Removed {} chunks of document {}", n, document_id),
        )
    }

    pub fn remove_by_url_pattern(&self, pattern: &str) -> AdminResponse<usize> {
        respond(
            "remove_by_url_pattern",
            self.knowledge_base.remove_by_url_pattern(pattern),
            |n| format!("Removed {} chunks with URL matching '{}'", n, pattern),
        )
    }

    pub fn remove_by_filename_pattern(&self, pattern: &str) -> AdminResponse<usize> {
        respond(
            "remove_by_filename_pattern",
            self.knowledge_base.remove_by_filename_pattern(pattern),
            |n| format!("Removed {} chunks with file path matching '{}'", n, pattern),
        )
    }

    pub fn clear_all(&self) -> AdminResponse<usize> {
        respond("clear_all", self.knowledge_base.clear_all(), |n| {
            format!("Cleared {} chunks", n)
        })
    }

    pub fn get_stats(&self) -> AdminResponse<IndexStats> {
        respond("get_stats", self.knowledge_base.stats(), |s| {
            format!("{} chunks indexed", s.total)
        })
    }

    pub fn unload(&self) -> AdminResponse<usize> {
        respond("unload", self.knowledge_base.unload(), |n| {
            format!("Unloaded {} chunks", n)
        })
    }

    pub fn reload(&self) -> AdminResponse<usize> {
        respond("reload", self.knowledge_base.reload(), |n| {
            format!("Index loaded with {} chunks", n)
        })
    }

    pub fn force_deep_sleep(&self) -> AdminResponse<SchedulerStatus> {
        self.scheduler.force_deep_sleep();
        AdminResponse::ok("Manual deep sleep engaged", self.scheduler.status())
    }

    pub fn exit_deep_sleep(&self) -> AdminResponse<SchedulerStatus> {
        self.scheduler.exit_deep_sleep();
        AdminResponse::ok("Manual deep sleep released", self.scheduler.status())
    }

    pub fn get_scheduler_status(&self) -> AdminResponse<SchedulerStatus> {
        let status = self.scheduler.status();
        AdminResponse::ok(format!("Scheduler is {}", status.phase), status)
    }
}
