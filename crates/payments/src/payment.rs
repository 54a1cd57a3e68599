use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use medcart_core::{Aggregate, AggregateId, AggregateRoot, Amount, Currency, DomainError};
use medcart_events::Event;
use medcart_orders::OrderId;

/// Payment identifier (one stream per gateway attempt).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(pub AggregateId);

impl PaymentId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for PaymentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Created,
    Verified,
    Failed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("payment not found")]
    NotFound,

    #[error("payment already exists")]
    AlreadyExists,

    #[error("payment is already verified")]
    AlreadyVerified,

    #[error("payment has failed")]
    AlreadyFailed,

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Aggregate root: Payment.
///
/// `verified` is terminal: nothing ever changes a verified payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    id: PaymentId,
    order_id: Option<OrderId>,
    gateway_order_id: String,
    gateway_payment_id: Option<String>,
    amount: Amount,
    currency: Option<Currency>,
    status: PaymentStatus,
    verified_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    version: u64,
    created: bool,
}

impl Payment {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PaymentId) -> Self {
        Self {
            id,
            order_id: None,
            gateway_order_id: String::new(),
            gateway_payment_id: None,
            amount: Amount::ZERO,
            currency: None,
            status: PaymentStatus::Created,
            verified_at: None,
            failure_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PaymentId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn order_id(&self) -> Option<OrderId> {
        self.order_id
    }

    pub fn gateway_order_id(&self) -> &str {
        &self.gateway_order_id
    }

    pub fn gateway_payment_id(&self) -> Option<&str> {
        self.gateway_payment_id.as_deref()
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn currency(&self) -> Option<&Currency> {
        self.currency.as_ref()
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn verified_at(&self) -> Option<DateTime<Utc>> {
        self.verified_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }
}

impl AggregateRoot for Payment {
    type Id = PaymentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePayment {
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub gateway_order_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkVerified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkVerified {
    pub payment_id: PaymentId,
    pub gateway_payment_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkFailed {
    pub payment_id: PaymentId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentCommand {
    CreatePayment(CreatePayment),
    MarkVerified(MarkVerified),
    MarkFailed(MarkFailed),
}

/// Event: PaymentCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCreated {
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub gateway_order_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentVerified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentVerified {
    pub payment_id: PaymentId,
    pub gateway_payment_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub payment_id: PaymentId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentEvent {
    PaymentCreated(PaymentCreated),
    PaymentVerified(PaymentVerified),
    PaymentFailed(PaymentFailed),
}

impl Event for PaymentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PaymentEvent::PaymentCreated(_) => "payments.payment.created",
            PaymentEvent::PaymentVerified(_) => "payments.payment.verified",
            PaymentEvent::PaymentFailed(_) => "payments.payment.failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PaymentEvent::PaymentCreated(e) => e.occurred_at,
            PaymentEvent::PaymentVerified(e) => e.occurred_at,
            PaymentEvent::PaymentFailed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Payment {
    type Command = PaymentCommand;
    type Event = PaymentEvent;
    type Error = PaymentError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PaymentEvent::PaymentCreated(e) => {
                self.id = e.payment_id;
                self.order_id = Some(e.order_id);
                self.gateway_order_id = e.gateway_order_id.clone();
                self.amount = e.amount;
                self.currency = Some(e.currency.clone());
                self.status = PaymentStatus::Created;
                self.created = true;
            }
            PaymentEvent::PaymentVerified(e) => {
                self.status = PaymentStatus::Verified;
                self.gateway_payment_id = Some(e.gateway_payment_id.clone());
                self.verified_at = Some(e.occurred_at);
            }
            PaymentEvent::PaymentFailed(e) => {
                self.status = PaymentStatus::Failed;
                self.failure_reason = Some(e.reason.clone());
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PaymentCommand::CreatePayment(cmd) => self.handle_create(cmd),
            PaymentCommand::MarkVerified(cmd) => self.handle_verified(cmd),
            PaymentCommand::MarkFailed(cmd) => self.handle_failed(cmd),
        }
    }
}

impl Payment {
    fn ensure_payment_id(&self, payment_id: PaymentId) -> Result<(), PaymentError> {
        if !self.created {
            return Err(PaymentError::NotFound);
        }
        if self.id != payment_id {
            return Err(DomainError::invariant("payment_id mismatch").into());
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreatePayment) -> Result<Vec<PaymentEvent>, PaymentError> {
        if self.created {
            return Err(PaymentError::AlreadyExists);
        }
        if cmd.amount == Amount::ZERO {
            return Err(DomainError::validation("payment amount must be positive").into());
        }
        if cmd.gateway_order_id.trim().is_empty() {
            return Err(DomainError::validation("gateway_order_id is required").into());
        }

        Ok(vec![PaymentEvent::PaymentCreated(PaymentCreated {
            payment_id: cmd.payment_id,
            order_id: cmd.order_id,
            gateway_order_id: cmd.gateway_order_id.clone(),
            amount: cmd.amount,
            currency: cmd.currency.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_verified(&self, cmd: &MarkVerified) -> Result<Vec<PaymentEvent>, PaymentError> {
        self.ensure_payment_id(cmd.payment_id)?;

        match self.status {
            PaymentStatus::Verified
                if self.gateway_payment_id.as_deref() == Some(cmd.gateway_payment_id.as_str()) =>
            {
                Ok(vec![])
            }
            PaymentStatus::Verified => Err(PaymentError::AlreadyVerified),
            PaymentStatus::Failed => Err(PaymentError::AlreadyFailed),
            PaymentStatus::Created => Ok(vec![PaymentEvent::PaymentVerified(PaymentVerified {
                payment_id: cmd.payment_id,
                gateway_payment_id: cmd.gateway_payment_id.clone(),
                occurred_at: cmd.occurred_at,
            })]),
        }
    }

    fn handle_failed(&self, cmd: &MarkFailed) -> Result<Vec<PaymentEvent>, PaymentError> {
        self.ensure_payment_id(cmd.payment_id)?;

        match self.status {
            PaymentStatus::Verified => Err(PaymentError::AlreadyVerified),
            PaymentStatus::Failed => Ok(vec![]),
            PaymentStatus::Created => Ok(vec![PaymentEvent::PaymentFailed(PaymentFailed {
                payment_id: cmd.payment_id,
                reason: cmd.reason.clone(),
                occurred_at: cmd.occurred_at,
            })]),
        }
    }
}
