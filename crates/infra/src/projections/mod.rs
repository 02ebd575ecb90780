//! Projection implementations (read model builders).
//!
//! Projections consume event records and build query-optimized read models.
//! All projections are:
//! - **Rebuildable**: can be reconstructed from the aggregate history
//! - **Idempotent**: safe for at-least-once delivery (see
//!   [`crate::read_model::ProjectorHandler`])

pub mod loan_summaries;

pub use loan_summaries::{LoanSummary, LoanSummaryProjector};
