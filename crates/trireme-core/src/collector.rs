//! Flow event records and the collector interface.
//!
//! The datapath reports one record per authorization decision.
//! Persistence and shipping are collaborator concerns; the core only
//! defines the record shape and a tracing-backed default sink.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::Action;

/// Kind of a flow endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// An enforced Processing Unit.
    Pu,
    /// An unauthenticated external service.
    External,
}

/// Why a flow was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropReason {
    /// The rule evaluator rejected the peer's claims.
    Policy,
    /// Token verification failed.
    InvalidToken,
    /// A token was required but absent.
    MissingToken,
    /// The packet arrived in a state that does not admit it.
    InvalidState,
    /// The packet could not be parsed.
    InvalidFormat,
}

/// One side of a reported flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEndpoint {
    /// Endpoint address.
    pub ip: Ipv4Addr,
    /// Destination port; absent on the source side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Context or service identity.
    pub id: String,
    /// Endpoint kind.
    pub kind: EndpointKind,
}

/// A flow authorization record emitted by the datapath.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Initiating endpoint.
    pub source: FlowEndpoint,
    /// Receiving endpoint.
    pub destination: FlowEndpoint,
    /// Realized action.
    pub action: Action,
    /// Set when the action dropped the flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_reason: Option<DropReason>,
    /// Identifier of the deciding policy rule.
    pub policy_id: String,
    /// Shadow policy id recorded by an observation rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_policy_id: Option<String>,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
}

/// Sink for flow records.
pub trait EventCollector: Send + Sync {
    /// Receives one flow record.
    fn collect_flow(&self, record: FlowRecord);
}

/// Collector that logs records through `tracing`.
pub struct LogCollector;

impl EventCollector for LogCollector {
    fn collect_flow(&self, record: FlowRecord) {
        tracing::info!(
            source = %record.source.ip,
            destination = %record.destination.ip,
            port = record.destination.port,
            action = ?record.action,
            drop_reason = ?record.drop_reason,
            policy_id = %record.policy_id,
            observed_policy_id = ?record.observed_policy_id,
            "flow"
        );
    }
}

/// Collector that buffers records in memory for inspection.
#[derive(Default)]
pub struct RecordingCollector {
    records: Mutex<Vec<FlowRecord>>,
}

impl RecordingCollector {
    /// Creates an empty recording collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything collected so far.
    #[must_use]
    pub fn records(&self) -> Vec<FlowRecord> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl EventCollector for RecordingCollector {
    fn collect_flow(&self, record: FlowRecord) {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(record);
    }
}
