use serde::{Deserialize, Serialize};

use chronicle_core::{
    Aggregate, AggregateError, AggregateId, AggregateKind, Applyable, DomainError, DomainResult,
    Versioned,
};
use chronicle_events::{CodecError, CodecRegistryBuilder};

pub const FLOW_STARTED: &str = "loan.flow.started";
pub const TERMS_ACCEPTED: &str = "loan.terms.accepted";
pub const EMAIL_CONFIRMED: &str = "loan.email.confirmed";

/// Aggregate kind of the loan onboarding flow.
#[derive(Debug, Clone, Copy)]
pub struct LoanKind;

impl AggregateKind for LoanKind {
    const ENTITY_TYPE: &'static str = "loans";

    type Id = AggregateId;
    type Snapshot = LoanView;
    type Payload = LoanEvent;
}

pub type Loan = Aggregate<LoanKind>;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanState {
    #[default]
    New,
    Started,
    Accepted,
    Confirmed,
}

/// Snapshot of one loan flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanView {
    pub version: u64,
    pub client_id: String,
    pub transaction_id: String,
    /// Requested amount in minor currency units.
    pub total_amount: u64,
    pub state: LoanState,
    /// Term in months.
    pub term: u32,
    pub deferred_pct: u8,
    pub email_confirmed: bool,
}

impl Versioned for LoanView {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Command: StartFlow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartFlow {
    pub client_id: String,
    pub transaction_id: String,
    pub total_amount: u64,
}

/// Command: AcceptTerms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptTerms {
    pub term: u32,
    pub deferred_pct: u8,
    pub accept_conditions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanCommand {
    StartFlow(StartFlow),
    AcceptTerms(AcceptTerms),
    ConfirmEmail,
}

/// Event: FlowStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStarted {
    pub client_id: String,
    pub transaction_id: String,
    pub total_amount: u64,
}

/// Event: TermsAccepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermsAccepted {
    pub term: u32,
    pub deferred_pct: u8,
    pub accept_conditions: bool,
}

/// Event: EmailConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailConfirmed {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanEvent {
    FlowStarted(FlowStarted),
    TermsAccepted(TermsAccepted),
    EmailConfirmed(EmailConfirmed),
}

impl Applyable<LoanView> for LoanEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LoanEvent::FlowStarted(_) => FLOW_STARTED,
            LoanEvent::TermsAccepted(_) => TERMS_ACCEPTED,
            LoanEvent::EmailConfirmed(_) => EMAIL_CONFIRMED,
        }
    }

    fn apply_to(&self, view: &mut LoanView) -> DomainResult<()> {
        match self {
            LoanEvent::FlowStarted(e) => {
                view.client_id = e.client_id.clone();
                view.transaction_id = e.transaction_id.clone();
                view.total_amount = e.total_amount;
                view.state = LoanState::Started;
            }
            LoanEvent::TermsAccepted(e) => {
                view.term = e.term;
                view.deferred_pct = e.deferred_pct;
                view.state = LoanState::Accepted;
            }
            LoanEvent::EmailConfirmed(_) => {
                view.email_confirmed = true;
                view.state = LoanState::Confirmed;
            }
        }
        Ok(())
    }
}

/// Register the payload codec of every loan event name.
pub fn register_codecs(builder: CodecRegistryBuilder) -> Result<CodecRegistryBuilder, CodecError> {
    builder
        .register::<LoanEvent>(FLOW_STARTED)?
        .register::<LoanEvent>(TERMS_ACCEPTED)?
        .register::<LoanEvent>(EMAIL_CONFIRMED)
}

impl LoanKind {
    /// A brand new loan flow with a fresh id.
    pub fn create() -> Loan {
        Loan::new(AggregateId::new(), LoanView::default())
    }

    pub fn handle(loan: &mut Loan, command: &LoanCommand) -> Result<(), AggregateError> {
        match command {
            LoanCommand::StartFlow(cmd) => Self::start_flow(loan, cmd),
            LoanCommand::AcceptTerms(cmd) => Self::accept_terms(loan, cmd),
            LoanCommand::ConfirmEmail => Self::confirm_email(loan),
        }
    }

    pub fn start_flow(loan: &mut Loan, cmd: &StartFlow) -> Result<(), AggregateError> {
        if loan.snapshot().state != LoanState::New {
            return Err(DomainError::invariant("flow already started").into());
        }
        if cmd.client_id.trim().is_empty() {
            return Err(DomainError::validation("client_id cannot be empty").into());
        }
        if cmd.total_amount == 0 {
            return Err(DomainError::validation("total_amount must be positive").into());
        }

        loan.record(LoanEvent::FlowStarted(FlowStarted {
            client_id: cmd.client_id.clone(),
            transaction_id: cmd.transaction_id.clone(),
            total_amount: cmd.total_amount,
        }))?;
        Ok(())
    }

    pub fn accept_terms(loan: &mut Loan, cmd: &AcceptTerms) -> Result<(), AggregateError> {
        ensure_state(loan, LoanState::Started, "flow not started")?;
        if cmd.deferred_pct > 100 {
            return Err(DomainError::validation("deferred_pct cannot exceed 100").into());
        }

        loan.record(LoanEvent::TermsAccepted(TermsAccepted {
            term: cmd.term,
            deferred_pct: cmd.deferred_pct,
            accept_conditions: cmd.accept_conditions,
        }))?;
        Ok(())
    }

    pub fn confirm_email(loan: &mut Loan) -> Result<(), AggregateError> {
        ensure_state(loan, LoanState::Accepted, "flow not accepted")?;
        loan.record(LoanEvent::EmailConfirmed(EmailConfirmed {}))?;
        Ok(())
    }
}

fn ensure_state(loan: &Loan, expected: LoanState, message: &str) -> Result<(), DomainError> {
    if loan.snapshot().state != expected {
        return Err(DomainError::invariant(message));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_events::{Codec, CodecRegistry, EventRecord};
    use proptest::prelude::*;

    fn start() -> StartFlow {
        StartFlow {
            client_id: "client1".to_string(),
            transaction_id: "transaction1".to_string(),
            total_amount: 100,
        }
    }

    fn terms() -> AcceptTerms {
        AcceptTerms {
            term: 30,
            deferred_pct: 75,
            accept_conditions: true,
        }
    }

    #[test]
    fn new_loan_has_version_zero_and_no_events() {
        let loan = LoanKind::create();
        assert_eq!(loan.version(), 0);
        assert!(loan.get_new_events().is_empty());
        assert_eq!(loan.snapshot().state, LoanState::New);
    }

    #[test]
    fn start_flow_raises_one_event() {
        let mut loan = LoanKind::create();
        LoanKind::start_flow(&mut loan, &start()).unwrap();

        assert_eq!(loan.get_new_events().len(), 1);
        assert_eq!(loan.version(), 1);
        assert_eq!(loan.snapshot().version, 1);
        assert_eq!(loan.get_new_events()[0].event_type(), FLOW_STARTED);
        assert_eq!(loan.snapshot().client_id, "client1");
    }

    #[test]
    fn full_flow_reaches_confirmed() {
        let mut loan = LoanKind::create();
        for command in [
            LoanCommand::StartFlow(start()),
            LoanCommand::AcceptTerms(terms()),
            LoanCommand::ConfirmEmail,
        ] {
            LoanKind::handle(&mut loan, &command).unwrap();
        }

        let view = loan.snapshot();
        assert_eq!(loan.version(), 3);
        assert_eq!(view.state, LoanState::Confirmed);
        assert_eq!(view.term, 30);
        assert_eq!(view.deferred_pct, 75);
        assert!(view.email_confirmed);
    }

    #[test]
    fn commands_out_of_order_are_rejected() {
        let mut loan = LoanKind::create();
        assert!(LoanKind::accept_terms(&mut loan, &terms()).is_err());
        assert!(LoanKind::confirm_email(&mut loan).is_err());

        LoanKind::start_flow(&mut loan, &start()).unwrap();
        let err = LoanKind::start_flow(&mut loan, &start()).unwrap_err();
        assert_eq!(
            err,
            AggregateError::Domain(DomainError::invariant("flow already started"))
        );
        assert!(LoanKind::confirm_email(&mut loan).is_err());
        assert_eq!(loan.version(), 1);
    }

    #[test]
    fn invalid_input_is_rejected_without_events() {
        let mut loan = LoanKind::create();
        let mut cmd = start();
        cmd.client_id = "  ".to_string();
        assert!(matches!(
            LoanKind::start_flow(&mut loan, &cmd),
            Err(AggregateError::Domain(DomainError::Validation(_)))
        ));
        assert!(!loan.has_events_to_save());
    }

    #[test]
    fn history_rebuilds_the_same_view() {
        let mut loan = LoanKind::create();
        LoanKind::start_flow(&mut loan, &start()).unwrap();
        LoanKind::accept_terms(&mut loan, &terms()).unwrap();

        let rebuilt = Loan::reify(loan.get_new_events().to_vec(), LoanView::default).unwrap();
        assert_eq!(rebuilt.snapshot(), loan.snapshot());
        assert_eq!(rebuilt.entity_id(), loan.entity_id());
    }

    #[test]
    fn every_loan_event_has_a_codec() {
        let codec: CodecRegistry = register_codecs(CodecRegistry::builder()).unwrap().build();

        let mut loan = LoanKind::create();
        LoanKind::start_flow(&mut loan, &start()).unwrap();
        let record = EventRecord::from_event(&loan.get_new_events()[0]);

        let bytes = codec.marshal_record(&record).unwrap();
        let decoded = codec.unmarshal(FLOW_STARTED, &bytes).unwrap();
        assert_eq!(
            decoded.downcast_ref::<LoanEvent>(),
            Some(loan.get_new_events()[0].payload())
        );
        assert!(codec.contains(TERMS_ACCEPTED));
        assert!(codec.contains(EMAIL_CONFIRMED));
    }

    proptest! {
        #[test]
        fn accepted_terms_are_reflected_in_the_view(term in 1u32..480, pct in 0u8..=100) {
            let mut loan = LoanKind::create();
            LoanKind::start_flow(&mut loan, &start()).unwrap();
            LoanKind::accept_terms(
                &mut loan,
                &AcceptTerms { term, deferred_pct: pct, accept_conditions: true },
            )
            .unwrap();

            prop_assert_eq!(loan.snapshot().term, term);
            prop_assert_eq!(loan.snapshot().deferred_pct, pct);
            prop_assert_eq!(loan.version(), 2);
        }
    }
}
