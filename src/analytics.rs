//! Analytics collaborator.
//!
//! A request carrying a transaction id is measured through an
//! [`AnalyticsLog`] obtained from the configured [`AnalyticsLogger`].

use std::io;

use tracing::info;

/// Source of transaction logs.
pub trait AnalyticsLogger: Send + Sync {
    /// Attaches to a transaction the front-end already opened.
    fn continue_transaction(
        &self,
        txn_id: &str,
        group: &str,
        category: &str,
        key: Option<&str>,
    ) -> Box<dyn AnalyticsLog>;

    /// Opens a fresh transaction, used for exception reports.
    fn new_transaction(&self, group: &str, category: &str, key: Option<&str>)
        -> Box<dyn AnalyticsLog>;
}

pub trait AnalyticsLog: Send {
    fn message(&mut self, text: &str);
    fn begin_measure(&mut self, name: &str);
    fn end_measure(&mut self, name: &str, error: bool);
    /// Closes the log. With `flush` the call returns only once the collector
    /// acknowledged everything written so far.
    fn close(self: Box<Self>, flush: bool) -> io::Result<()>;
}

/// Emits analytics events as `tracing` records.
#[derive(Debug, Default)]
pub struct TracingAnalytics;

impl AnalyticsLogger for TracingAnalytics {
    fn continue_transaction(
        &self,
        txn_id: &str,
        group: &str,
        category: &str,
        _key: Option<&str>,
    ) -> Box<dyn AnalyticsLog> {
        Box::new(TracingLog {
            txn_id: txn_id.to_string(),
            group: group.to_string(),
            category: category.to_string(),
        })
    }

    fn new_transaction(&self, group: &str, category: &str, _key: Option<&str>) -> Box<dyn AnalyticsLog> {
        Box::new(TracingLog {
            txn_id: format!("{:016x}", rand::random::<u64>()),
            group: group.to_string(),
            category: category.to_string(),
        })
    }
}

struct TracingLog {
    txn_id: String,
    group: String,
    category: String,
}

impl AnalyticsLog for TracingLog {
    fn message(&mut self, text: &str) {
        info!(target: "tether::analytics", txn_id = %self.txn_id, group = %self.group, category = %self.category, "{text}");
    }

    fn begin_measure(&mut self, name: &str) {
        info!(target: "tether::analytics", txn_id = %self.txn_id, measure = name, "BEGIN");
    }

    fn end_measure(&mut self, name: &str, error: bool) {
        info!(target: "tether::analytics", txn_id = %self.txn_id, measure = name, error, "END");
    }

    fn close(self: Box<Self>, _flush: bool) -> io::Result<()> {
        Ok(())
    }
}
