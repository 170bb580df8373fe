//! Cart state machine.
//!
//! [`reduce`] is a pure function from a [`PosState`] and a [`CartAction`] to
//! the next state plus an optional [`CartEffect`]. It never touches the
//! store or the network: finalizing a sale is requested through the effect
//! and carried out by [`crate::checkout::Checkout`], which feeds the result
//! back in as `PaymentConfirmed` / `PaymentFailed`.
//!
//! Totals are derived. Every cart mutation ends in [`recompute`], so the
//! stored subtotal, tax and total can never drift from the line items.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    Discount, DiscountType, InvoiceRecord, InvoiceStatus, LineItemRecord, PaymentMethod,
    TaxBreakdown,
};
use crate::money;
use crate::sync::{DrainSummary, SyncStatus};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    #[default]
    Draft,
    /// Between `CompletePayment` and the checkout's confirmation.
    Processing,
    /// Terminal; only `ClearCart` leaves it.
    Completed,
}

/// The one active transaction. Not persisted until finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartState {
    pub id: String,
    pub customer_id: Option<String>,
    pub line_items: Vec<LineItemRecord>,
    pub discount: Option<Discount>,
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub discounted_subtotal: Decimal,
    pub tax: TaxBreakdown,
    pub total_amount: Decimal,
    pub payment_method: Option<PaymentMethod>,
    pub status: CartStatus,
    /// Set when the cart was restored from a held invoice, so finalizing
    /// updates that invoice instead of creating a new one.
    #[serde(default)]
    pub restored_from_hold: bool,
}

impl CartState {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            customer_id: None,
            line_items: Vec::new(),
            discount: None,
            subtotal: Decimal::ZERO,
            discount_amount: Decimal::ZERO,
            discounted_subtotal: Decimal::ZERO,
            tax: TaxBreakdown::default(),
            total_amount: Decimal::ZERO,
            payment_method: None,
            status: CartStatus::Draft,
            restored_from_hold: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.line_items.is_empty()
    }

    pub fn is_editable(&self) -> bool {
        self.status == CartStatus::Draft
    }
}

impl Default for CartState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Info,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Success,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub active_modal: Option<String>,
    pub search_query: String,
    pub notification: Option<Notification>,
}

/// Sync status as last seen by the cart layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMirror {
    pub is_offline: bool,
    pub is_syncing: bool,
    pub pending: i64,
    pub failed: i64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_drain: Option<DrainSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PosState {
    pub cart: CartState,
    pub ui: UiState,
    pub sync: SyncMirror,
}

// ---------------------------------------------------------------------------
// Actions and effects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum CartAction {
    AddLineItem(LineItemRecord),
    UpdateLineItem { id: String, quantity: Decimal },
    RemoveLineItem(String),
    ClearCart,
    SetCustomer(Option<String>),
    ApplyDiscount {
        amount: Decimal,
        kind: DiscountType,
        reason: Option<String>,
    },
    SetPaymentMethod(PaymentMethod),
    CompletePayment,
    HoldInvoice,

    OpenModal(String),
    CloseModal,
    SetSearchQuery(String),
    ShowNotification(Notification),
    DismissNotification,

    SetSyncState(SyncStatus),
    SetOffline(bool),
    RestoreDraft(InvoiceRecord),

    /// Checkout persisted and enqueued the sale.
    PaymentConfirmed,
    /// Checkout could not persist the sale; the cart goes back to draft.
    PaymentFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeKind {
    /// Persist as paid, with its payment.
    Complete,
    /// Persist as a draft invoice and start a new cart.
    Hold,
}

/// Work the reducer asks its owner to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartEffect {
    Finalize(FinalizeKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: PosState,
    pub effect: Option<CartEffect>,
}

impl Transition {
    fn state(state: PosState) -> Self {
        Self {
            state,
            effect: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

pub fn reduce(state: &PosState, action: CartAction) -> Transition {
    let mut next = state.clone();

    if is_cart_edit(&action) && !next.cart.is_editable() {
        return Transition::state(next);
    }

    match action {
        CartAction::AddLineItem(line) => {
            add_line(&mut next.cart, line);
            recompute(&mut next.cart);
        }
        CartAction::UpdateLineItem { id, quantity } => {
            if quantity <= Decimal::ZERO {
                next.cart.line_items.retain(|l| l.id != id);
            } else if let Some(line) = next.cart.line_items.iter_mut().find(|l| l.id == id) {
                line.set_quantity(quantity);
            }
            recompute(&mut next.cart);
        }
        CartAction::RemoveLineItem(id) => {
            next.cart.line_items.retain(|l| l.id != id);
            recompute(&mut next.cart);
        }
        CartAction::ClearCart => {
            next.cart = CartState::new();
        }
        CartAction::SetCustomer(customer_id) => {
            next.cart.customer_id = customer_id;
        }
        CartAction::ApplyDiscount {
            amount,
            kind,
            reason,
        } => {
            next.cart.discount = (amount > Decimal::ZERO).then_some(Discount {
                amount,
                kind,
                reason,
            });
            recompute(&mut next.cart);
        }
        CartAction::SetPaymentMethod(method) => {
            next.cart.payment_method = Some(method);
        }
        CartAction::CompletePayment => {
            if let Some(problem) = completion_problem(&next.cart) {
                next.ui.notification = Some(Notification::warning(problem));
                return Transition::state(next);
            }
            next.cart.status = CartStatus::Processing;
            return Transition {
                state: next,
                effect: Some(CartEffect::Finalize(FinalizeKind::Complete)),
            };
        }
        CartAction::HoldInvoice => {
            if next.cart.is_empty() {
                next.ui.notification = Some(Notification::warning("Cart is empty"));
                return Transition::state(next);
            }
            return Transition {
                state: next,
                effect: Some(CartEffect::Finalize(FinalizeKind::Hold)),
            };
        }

        CartAction::OpenModal(name) => next.ui.active_modal = Some(name),
        CartAction::CloseModal => next.ui.active_modal = None,
        CartAction::SetSearchQuery(query) => next.ui.search_query = query,
        CartAction::ShowNotification(n) => next.ui.notification = Some(n),
        CartAction::DismissNotification => next.ui.notification = None,

        CartAction::SetSyncState(status) => mirror_sync(&mut next, status),
        CartAction::SetOffline(offline) => next.sync.is_offline = offline,
        CartAction::RestoreDraft(invoice) => {
            if next.cart.status == CartStatus::Processing {
                return Transition::state(next);
            }
            next.cart = restore_cart(invoice);
            recompute(&mut next.cart);
        }

        CartAction::PaymentConfirmed => {
            if next.cart.status == CartStatus::Processing {
                next.cart.status = CartStatus::Completed;
                next.ui.notification = Some(Notification::success("Payment recorded"));
            }
        }
        CartAction::PaymentFailed(reason) => {
            if next.cart.status == CartStatus::Processing {
                next.cart.status = CartStatus::Draft;
            }
            next.ui.notification = Some(Notification::error(format!(
                "Could not save sale: {reason}"
            )));
        }
    }

    Transition::state(next)
}

fn is_cart_edit(action: &CartAction) -> bool {
    matches!(
        action,
        CartAction::AddLineItem(_)
            | CartAction::UpdateLineItem { .. }
            | CartAction::RemoveLineItem(_)
            | CartAction::SetCustomer(_)
            | CartAction::ApplyDiscount { .. }
            | CartAction::SetPaymentMethod(_)
            | CartAction::CompletePayment
            | CartAction::HoldInvoice
    )
}

fn completion_problem(cart: &CartState) -> Option<&'static str> {
    if cart.is_empty() {
        Some("Cart is empty")
    } else if cart.payment_method.is_none() {
        Some("Select a payment method")
    } else {
        None
    }
}

/// Same product at the same price and tax treatment merges into one line.
fn add_line(cart: &mut CartState, mut line: LineItemRecord) {
    if line.quantity <= Decimal::ZERO {
        return;
    }
    let existing = cart.line_items.iter_mut().find(|l| {
        l.product_id == line.product_id
            && l.unit_price == line.unit_price
            && l.tax_rate == line.tax_rate
            && l.cess_rate == line.cess_rate
            && l.supply_type == line.supply_type
            && l.discount.is_zero()
            && line.discount.is_zero()
    });
    match existing {
        Some(l) => l.absorb(&line),
        None => {
            line.invoice_id = cart.id.clone();
            cart.line_items.push(line);
        }
    }
}

fn mirror_sync(state: &mut PosState, status: SyncStatus) {
    let drain_changed = status.last_drain.is_some() && status.last_drain != state.sync.last_drain;
    state.sync.is_syncing = status.is_syncing;
    state.sync.pending = status.pending;
    state.sync.failed = status.failed;
    state.sync.last_sync_time = status.last_sync_time;
    state.sync.is_offline = !status.is_online;

    if drain_changed {
        if let Some(summary) = status.last_drain {
            if let Some(n) = drain_notification(&summary) {
                state.ui.notification = Some(n);
            }
        }
    }
    state.sync.last_drain = status.last_drain;
}

fn drain_notification(summary: &DrainSummary) -> Option<Notification> {
    if summary.failed > 0 {
        Some(Notification::error(format!(
            "{} operation(s) failed to sync",
            summary.failed
        )))
    } else if summary.synced > 0 {
        Some(Notification::info(format!(
            "Synced {} operation(s)",
            summary.synced
        )))
    } else {
        None
    }
}

fn restore_cart(invoice: InvoiceRecord) -> CartState {
    CartState {
        id: invoice.id,
        customer_id: invoice.customer_id,
        line_items: invoice.line_items,
        discount: invoice.discount,
        payment_method: invoice.payment_method,
        restored_from_hold: invoice.status == InvoiceStatus::Draft,
        ..CartState::new()
    }
}

/// Recompute every derived amount from the line items and discount.
///
/// Idempotent: running it twice yields the same cart. Tax is summed from
/// each line's stored split and never re-derived from its rate. The
/// cart-level discount reduces the payable amount but not the tax.
pub fn recompute(cart: &mut CartState) {
    for line in &mut cart.line_items {
        line.refresh_total();
    }

    let subtotal = money::sum(cart.line_items.iter().map(|l| l.line_total));
    let raw_discount = match &cart.discount {
        None => Decimal::ZERO,
        Some(d) => match d.kind {
            DiscountType::Percentage => money::percent_of(subtotal, d.amount),
            DiscountType::Fixed => money::round_money(d.amount),
        },
    };
    let discount_amount = money::clamp_non_negative(raw_discount, subtotal);
    let discounted_subtotal = (subtotal - discount_amount).max(Decimal::ZERO);

    let cgst = money::sum(cart.line_items.iter().map(|l| l.cgst));
    let sgst = money::sum(cart.line_items.iter().map(|l| l.sgst));
    let igst = money::sum(cart.line_items.iter().map(|l| l.igst));
    let cess = money::sum(cart.line_items.iter().map(|l| l.cess_amount));
    let total_tax = money::sum([cgst, sgst, igst, cess]);

    cart.subtotal = subtotal;
    cart.discount_amount = discount_amount;
    cart.discounted_subtotal = discounted_subtotal;
    cart.tax = TaxBreakdown {
        cgst,
        sgst,
        igst,
        cess,
        total_tax,
    };
    cart.total_amount = money::add(discounted_subtotal, total_tax);
}
