//! Loan onboarding domain module (event-sourced).
//!
//! A small flow used to drive the event-sourcing core end to end: a client
//! starts a loan request, accepts the terms, then confirms their email. Pure
//! domain logic (no IO, no storage).

pub mod loan;

pub use loan::{
    AcceptTerms, EMAIL_CONFIRMED, EmailConfirmed, FLOW_STARTED, FlowStarted, Loan, LoanCommand, LoanEvent,
    LoanKind, LoanState, LoanView, StartFlow, TERMS_ACCEPTED, TermsAccepted, register_codecs,
};
