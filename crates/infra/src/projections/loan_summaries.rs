use serde::{Deserialize, Serialize};

use chronicle_core::AggregateKind;
use chronicle_events::EventRecord;
use chronicle_loans::{EMAIL_CONFIRMED, FLOW_STARTED, LoanEvent, LoanKind, LoanState, TERMS_ACCEPTED};

use crate::read_model::{ProjectionError, Projector, ReadModel};

/// Queryable loan overview: who asked for how much, and how far the flow got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanSummary {
    pub loan_id: String,
    pub version: u64,
    pub client_id: String,
    pub total_amount: u64,
    pub state: LoanState,
    /// Months, once the terms are accepted.
    pub term: Option<u32>,
    pub email_confirmed: bool,
}

impl ReadModel for LoanSummary {
    fn entity_id(&self) -> &str {
        &self.loan_id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoanSummaryProjector;

impl Projector for LoanSummaryProjector {
    type Model = LoanSummary;

    fn aggregate_type(&self) -> &str {
        LoanKind::ENTITY_TYPE
    }

    fn events(&self) -> &[&'static str] {
        &[FLOW_STARTED, TERMS_ACCEPTED, EMAIL_CONFIRMED]
    }

    fn project(&self, record: &EventRecord, current: Option<LoanSummary>) -> Result<Option<LoanSummary>, ProjectionError> {
        let event = record.data::<LoanEvent>().ok_or_else(|| {
            ProjectionError::projector(record.name(), anyhow::anyhow!("payload is not a loan event"))
        })?;
        let aggregate = record.aggregate();

        let summary = match (event, current) {
            (LoanEvent::FlowStarted(started), _) => LoanSummary {
                loan_id: aggregate.id.clone(),
                version: aggregate.version,
                client_id: started.client_id.clone(),
                total_amount: started.total_amount,
                state: LoanState::Started,
                term: None,
                email_confirmed: false,
            },
            (LoanEvent::TermsAccepted(terms), Some(summary)) => LoanSummary {
                version: aggregate.version,
                state: LoanState::Accepted,
                term: Some(terms.term),
                ..summary
            },
            (LoanEvent::EmailConfirmed(_), Some(summary)) => LoanSummary {
                version: aggregate.version,
                state: LoanState::Confirmed,
                email_confirmed: true,
                ..summary
            },
            (_, None) => {
                return Err(ProjectionError::projector(
                    record.name(),
                    anyhow::anyhow!("no summary for loan {}", aggregate.id),
                ));
            }
        };
        Ok(Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_loans::{AcceptTerms, StartFlow};

    #[test]
    fn follows_the_loan_flow() {
        let mut loan = LoanKind::create();
        LoanKind::start_flow(
            &mut loan,
            &StartFlow {
                client_id: "client-1".into(),
                transaction_id: "tx-1".into(),
                total_amount: 900,
            },
        )
        .unwrap();
        LoanKind::accept_terms(
            &mut loan,
            &AcceptTerms {
                term: 6,
                deferred_pct: 0,
                accept_conditions: true,
            },
        )
        .unwrap();
        LoanKind::confirm_email(&mut loan).unwrap();

        let summary = loan
            .events()
            .iter()
            .map(EventRecord::from_event)
            .try_fold(None, |current, record| LoanSummaryProjector.project(&record, current))
            .unwrap()
            .unwrap();

        assert_eq!(summary.loan_id, loan.entity_id().to_string());
        assert_eq!(summary.version, 3);
        assert_eq!(summary.total_amount, 900);
        assert_eq!(summary.term, Some(6));
        assert_eq!(summary.state, LoanState::Confirmed);
        assert!(summary.email_confirmed);
    }

    #[test]
    fn later_events_need_an_existing_summary() {
        let record = EventRecord::new(
            EMAIL_CONFIRMED,
            chronicle_events::AggregateRef::new("loan-1", "loans", 2),
            LoanEvent::EmailConfirmed(chronicle_loans::EmailConfirmed {}),
        );
        assert!(matches!(
            LoanSummaryProjector.project(&record, None),
            Err(ProjectionError::Projector { .. })
        ));
    }
}
