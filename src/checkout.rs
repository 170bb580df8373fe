//! Checkout: owns the live cart and carries out its effects.
//!
//! The cart reducer is pure; this is where a finalized sale touches the
//! store. Invoice, line items, payment and their queue records are written in
//! one transaction, so a sale is either fully recorded and queued or not at
//! all. The server is never called from here.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cart::{
    reduce, CartAction, CartEffect, CartState, FinalizeKind, Notification, PosState, Transition,
};
use crate::clock::Clock;
use crate::db::{IndexName, LocalStore, StoreTx};
use crate::error::{PosError, Result};
use crate::models::{
    entity_key, EntityType, InvoiceRecord, InvoiceStatus, LineItemRecord, PaymentRecord,
    PaymentStatus, ProductRecord, QueueStatus, SyncOperation, SyncPayload, SyncQueueRecord,
};
use crate::money::SupplyType;
use crate::queue::SyncQueue;
use crate::sync::SyncStatus;

pub struct Checkout {
    store: Arc<LocalStore>,
    queue: SyncQueue,
    clock: Arc<dyn Clock>,
    tenant_id: String,
    state: Mutex<PosState>,
}

impl Checkout {
    pub fn new(
        store: Arc<LocalStore>,
        queue: SyncQueue,
        clock: Arc<dyn Clock>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            tenant_id: tenant_id.into(),
            state: Mutex::new(PosState::default()),
        }
    }

    pub fn state(&self) -> Result<PosState> {
        Ok(self.state.lock()?.clone())
    }

    /// Apply one action and run any effect it requests.
    ///
    /// A failed finalize puts the cart back to draft with an error
    /// notification and returns the error.
    pub fn dispatch(&self, action: CartAction) -> Result<PosState> {
        let mut state = self.state.lock()?;
        let Transition { state: next, effect } = reduce(&state, action);
        *state = next;

        if let Some(CartEffect::Finalize(kind)) = effect {
            match self.finalize(&state.cart, kind) {
                Ok(follow_ups) => {
                    for action in follow_ups {
                        *state = reduce(&state, action).state;
                    }
                    self.queue.schedule_drain();
                }
                Err(err) => {
                    warn!(cart_id = %state.cart.id, "Finalize failed: {err}");
                    let recovery = match kind {
                        FinalizeKind::Complete => CartAction::PaymentFailed(err.to_string()),
                        FinalizeKind::Hold => CartAction::ShowNotification(Notification::error(
                            format!("Could not hold invoice: {err}"),
                        )),
                    };
                    *state = reduce(&state, recovery).state;
                    return Err(err);
                }
            }
        }

        Ok(state.clone())
    }

    /// Add a cached product by id.
    pub fn add_product(
        &self,
        product_id: &str,
        quantity: Decimal,
        supply_type: SupplyType,
    ) -> Result<PosState> {
        let product = self
            .store
            .get::<ProductRecord>(product_id)?
            .ok_or_else(|| PosError::not_found("products", product_id))?;
        self.add_cached_product(&product, quantity, supply_type)
    }

    /// Add a cached product looked up by barcode.
    pub fn add_product_by_barcode(
        &self,
        barcode: &str,
        quantity: Decimal,
        supply_type: SupplyType,
    ) -> Result<PosState> {
        let product = self
            .store
            .query_by_index::<ProductRecord>(IndexName::Barcode, barcode)?
            .into_iter()
            .find(|p| p.tenant_id == self.tenant_id)
            .ok_or_else(|| PosError::not_found("products", barcode))?;
        self.add_cached_product(&product, quantity, supply_type)
    }

    fn add_cached_product(
        &self,
        product: &ProductRecord,
        quantity: Decimal,
        supply_type: SupplyType,
    ) -> Result<PosState> {
        let cart_id = self.state.lock()?.cart.id.clone();
        let line =
            LineItemRecord::from_product(&cart_id, product, quantity, supply_type, self.clock.now());
        self.dispatch(CartAction::AddLineItem(line))
    }

    /// Held (draft) invoices for this tenant, oldest first.
    pub fn held_invoices(&self) -> Result<Vec<InvoiceRecord>> {
        let mut held: Vec<InvoiceRecord> = self
            .store
            .query_by_index::<InvoiceRecord>(IndexName::Status, InvoiceStatus::Draft.as_str())?
            .into_iter()
            .filter(|inv| inv.tenant_id == self.tenant_id)
            .collect();
        held.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(held)
    }

    /// Load a held invoice back into the cart. Refuses to discard a cart
    /// that still has items.
    pub fn restore_draft(&self, invoice_id: &str) -> Result<PosState> {
        let invoice = self
            .store
            .get::<InvoiceRecord>(invoice_id)?
            .ok_or_else(|| PosError::not_found("invoices", invoice_id))?;
        if invoice.status != InvoiceStatus::Draft {
            return Err(PosError::invalid(format!(
                "invoice {invoice_id} is {} and cannot be restored",
                invoice.status.as_str()
            )));
        }
        {
            let state = self.state.lock()?;
            if state.cart.is_editable() && !state.cart.is_empty() {
                return Err(PosError::invalid(
                    "current cart has items; hold or clear it first",
                ));
            }
        }
        self.dispatch(CartAction::RestoreDraft(invoice))
    }

    fn finalize(&self, cart: &CartState, kind: FinalizeKind) -> Result<Vec<CartAction>> {
        let device_id = self.store.device_id()?;
        let now = self.clock.now();

        match kind {
            FinalizeKind::Complete => {
                let method = cart
                    .payment_method
                    .ok_or_else(|| PosError::invalid("payment method not selected"))?;
                let (invoice, payment) = self.store.transaction(|tx| {
                    let previous = tx.get::<InvoiceRecord>(&cart.id)?;
                    let invoice = self.build_invoice(
                        cart,
                        InvoiceStatus::Paid,
                        &device_id,
                        now,
                        previous.as_ref(),
                    );
                    let payment = PaymentRecord {
                        id: Uuid::new_v4().to_string(),
                        tenant_id: self.tenant_id.clone(),
                        invoice_id: invoice.id.clone(),
                        amount: invoice.total_amount,
                        method,
                        status: PaymentStatus::Completed,
                        reference: None,
                        device_id: device_id.clone(),
                        created_at: now,
                        synced_at: None,
                    };
                    self.persist_invoice(tx, &invoice, previous.is_some(), &device_id)?;
                    tx.put(&payment)?;
                    self.queue.enqueue_in(
                        tx,
                        &self.tenant_id,
                        &device_id,
                        SyncOperation::Create,
                        SyncPayload::Payment(payment.clone()),
                    )?;
                    Ok((invoice, payment))
                })?;
                info!(
                    invoice_id = %invoice.id,
                    payment_id = %payment.id,
                    total = %invoice.total_amount,
                    "Sale recorded locally and queued for sync"
                );
                Ok(vec![CartAction::PaymentConfirmed])
            }
            FinalizeKind::Hold => {
                let invoice = self.store.transaction(|tx| {
                    let previous = tx.get::<InvoiceRecord>(&cart.id)?;
                    let invoice = self.build_invoice(
                        cart,
                        InvoiceStatus::Draft,
                        &device_id,
                        now,
                        previous.as_ref(),
                    );
                    self.persist_invoice(tx, &invoice, previous.is_some(), &device_id)?;
                    Ok(invoice)
                })?;
                info!(invoice_id = %invoice.id, "Invoice held");
                Ok(vec![
                    CartAction::ClearCart,
                    CartAction::ShowNotification(Notification::info("Invoice held")),
                ])
            }
        }
    }

    fn build_invoice(
        &self,
        cart: &CartState,
        status: InvoiceStatus,
        device_id: &str,
        now: DateTime<Utc>,
        previous: Option<&InvoiceRecord>,
    ) -> InvoiceRecord {
        let line_items = cart
            .line_items
            .iter()
            .cloned()
            .map(|mut line| {
                line.invoice_id = cart.id.clone();
                line.tenant_id = self.tenant_id.clone();
                line
            })
            .collect();

        InvoiceRecord {
            id: cart.id.clone(),
            tenant_id: self.tenant_id.clone(),
            customer_id: cart.customer_id.clone(),
            line_items,
            subtotal: cart.subtotal,
            discount: cart.discount.clone(),
            discount_amount: cart.discount_amount,
            tax: cart.tax,
            total_amount: cart.total_amount,
            payment_method: cart.payment_method,
            status,
            invoice_number: previous.and_then(|p| p.invoice_number.clone()),
            created_at: previous.map(|p| p.created_at).unwrap_or(now),
            updated_at: now,
            is_offline_only: previous.map_or(true, |p| p.synced_at.is_none()),
            device_id: device_id.to_string(),
            synced_at: None,
        }
    }

    /// Write the invoice and its lines, drop lines removed since a hold,
    /// and enqueue it.
    fn persist_invoice(
        &self,
        tx: &StoreTx<'_>,
        invoice: &InvoiceRecord,
        existed: bool,
        device_id: &str,
    ) -> Result<SyncQueueRecord> {
        if existed {
            for stale in tx.query_by_index::<LineItemRecord>(IndexName::InvoiceId, &invoice.id)? {
                if !invoice.line_items.iter().any(|l| l.id == stale.id) {
                    tx.delete::<LineItemRecord>(&stale.id)?;
                }
            }
        }
        tx.put(invoice)?;
        tx.batch_put(&invoice.line_items)?;

        let operation = if existed && !create_still_pending(tx, &invoice.id)? {
            SyncOperation::Update
        } else {
            SyncOperation::Create
        };
        debug!(invoice_id = %invoice.id, op = operation.as_str(), "Enqueueing invoice");
        self.queue.enqueue_in(
            tx,
            &self.tenant_id,
            device_id,
            operation,
            SyncPayload::Invoice(invoice.clone()),
        )
    }
}

/// An unsent create absorbs later edits instead of queueing an update.
fn create_still_pending(tx: &StoreTx<'_>, invoice_id: &str) -> Result<bool> {
    let key = entity_key(EntityType::Invoice, invoice_id, SyncOperation::Create);
    Ok(tx
        .query_by_index::<SyncQueueRecord>(IndexName::EntityKey, &key)?
        .iter()
        .any(|r| r.status == QueueStatus::Pending))
}

/// Feed published sync status into the cart's mirror until cancelled.
pub fn mirror_sync_status(
    checkout: Arc<Checkout>,
    mut status_rx: watch::Receiver<SyncStatus>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = status_rx.borrow_and_update().clone();
                    if let Err(e) = checkout.dispatch(CartAction::SetSyncState(status)) {
                        warn!("Failed to mirror sync status: {e}");
                    }
                }
            }
        }
        debug!("Sync status mirror stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::{CartStatus, NotificationKind};
    use crate::clock::ManualClock;
    use crate::models::PaymentMethod;
    use crate::network::NetworkMonitor;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Harness {
        store: Arc<LocalStore>,
        queue: SyncQueue,
        checkout: Arc<Checkout>,
    }

    fn harness() -> Harness {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let queue = SyncQueue::new(
            Arc::clone(&store),
            NetworkMonitor::new(false),
            Arc::clone(&clock),
            5,
        );
        let checkout = Arc::new(Checkout::new(
            Arc::clone(&store),
            queue.clone(),
            clock,
            "tenant-1",
        ));
        store
            .put(&ProductRecord {
                id: "prod-tea".into(),
                tenant_id: "tenant-1".into(),
                name: "Masala Tea".into(),
                barcode: Some("8901234567890".into()),
                hsn_code: Some("0902".into()),
                unit_price: dec!(45),
                tax_rate: dec!(5),
                cess_rate: Decimal::ZERO,
                is_online_only: false,
                updated_at: Utc::now(),
            })
            .unwrap();
        Harness {
            store,
            queue,
            checkout,
        }
    }

    fn invoice_queue_records(h: &Harness) -> Vec<SyncQueueRecord> {
        h.queue
            .pending()
            .unwrap()
            .into_iter()
            .filter(|r| r.entity_type() == EntityType::Invoice)
            .collect()
    }

    #[test]
    fn test_complete_payment_persists_and_queues_sale() {
        let h = harness();
        h.checkout
            .add_product("prod-tea", dec!(2), SupplyType::Intrastate)
            .unwrap();
        h.checkout
            .dispatch(CartAction::SetPaymentMethod(PaymentMethod::Cash))
            .unwrap();
        let state = h.checkout.dispatch(CartAction::CompletePayment).unwrap();

        assert_eq!(state.cart.status, CartStatus::Completed);
        let invoice = h
            .store
            .get::<InvoiceRecord>(&state.cart.id)
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.total_amount, dec!(94.50));
        assert!(invoice.is_offline_only);
        assert!(!invoice.is_authoritative());

        let lines = h
            .store
            .query_by_index::<LineItemRecord>(IndexName::InvoiceId, &invoice.id)
            .unwrap();
        assert_eq!(lines.len(), 1);

        let payments = h
            .store
            .query_by_index::<PaymentRecord>(IndexName::InvoiceId, &invoice.id)
            .unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount, dec!(94.50));

        let pending = h.queue.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending
            .iter()
            .all(|r| r.operation == SyncOperation::Create && r.retry_count == 0));
    }

    #[test]
    fn test_complete_payment_on_empty_cart_writes_nothing() {
        let h = harness();
        let state = h.checkout.dispatch(CartAction::CompletePayment).unwrap();
        assert_eq!(state.cart.status, CartStatus::Draft);
        assert!(state.ui.notification.is_some());
        assert!(h.queue.pending().unwrap().is_empty());
        assert!(h.store.get_all::<InvoiceRecord>().unwrap().is_empty());
    }

    #[test]
    fn test_hold_then_restore_then_complete_coalesces_invoice() {
        let h = harness();
        h.checkout
            .add_product("prod-tea", dec!(1), SupplyType::Intrastate)
            .unwrap();
        let held_id = h.checkout.state().unwrap().cart.id;
        let after_hold = h.checkout.dispatch(CartAction::HoldInvoice).unwrap();

        assert_ne!(after_hold.cart.id, held_id);
        assert!(after_hold.cart.is_empty());
        let held = h.checkout.held_invoices().unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].id, held_id);

        let restored = h.checkout.restore_draft(&held_id).unwrap();
        assert_eq!(restored.cart.id, held_id);
        let line_id = restored.cart.line_items[0].id.clone();
        h.checkout
            .dispatch(CartAction::UpdateLineItem {
                id: line_id,
                quantity: dec!(2),
            })
            .unwrap();
        h.checkout
            .dispatch(CartAction::SetPaymentMethod(PaymentMethod::Upi))
            .unwrap();
        h.checkout.dispatch(CartAction::CompletePayment).unwrap();

        let invoices = invoice_queue_records(&h);
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].operation, SyncOperation::Create);
        match &invoices[0].payload {
            SyncPayload::Invoice(inv) => {
                assert_eq!(inv.status, InvoiceStatus::Paid);
                assert_eq!(inv.total_amount, dec!(94.50));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(h.checkout.held_invoices().unwrap().is_empty());
    }

    #[test]
    fn test_restore_after_create_synced_queues_update() {
        let h = harness();
        h.checkout
            .add_product("prod-tea", dec!(1), SupplyType::Intrastate)
            .unwrap();
        let held_id = h.checkout.state().unwrap().cart.id;
        h.checkout.dispatch(CartAction::HoldInvoice).unwrap();

        let mut create = invoice_queue_records(&h).remove(0);
        assert!(h.queue.mark_syncing(&mut create).unwrap());
        create.complete(Utc::now());
        h.store.put(&create).unwrap();

        h.checkout.restore_draft(&held_id).unwrap();
        h.checkout
            .dispatch(CartAction::SetPaymentMethod(PaymentMethod::Card))
            .unwrap();
        h.checkout.dispatch(CartAction::CompletePayment).unwrap();

        let invoices = invoice_queue_records(&h);
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].operation, SyncOperation::Update);
    }

    #[test]
    fn test_restore_refuses_to_discard_items() {
        let h = harness();
        h.checkout
            .add_product("prod-tea", dec!(1), SupplyType::Intrastate)
            .unwrap();
        let held_id = h.checkout.state().unwrap().cart.id;
        h.checkout.dispatch(CartAction::HoldInvoice).unwrap();
        h.checkout
            .add_product("prod-tea", dec!(3), SupplyType::Intrastate)
            .unwrap();

        let err = h.checkout.restore_draft(&held_id).unwrap_err();
        assert!(matches!(err, PosError::InvalidOperation(_)));
    }

    #[test]
    fn test_add_product_by_barcode() {
        let h = harness();
        let state = h
            .checkout
            .add_product_by_barcode("8901234567890", dec!(2), SupplyType::Interstate)
            .unwrap();
        assert_eq!(state.cart.tax.igst, dec!(4.50));
        assert_eq!(state.cart.total_amount, dec!(94.50));

        let err = h
            .checkout
            .add_product_by_barcode("000", dec!(1), SupplyType::Intrastate)
            .unwrap_err();
        assert!(matches!(err, PosError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_mirror_applies_published_status() {
        let h = harness();
        let (tx, rx) = watch::channel(SyncStatus::default());
        let cancel = CancellationToken::new();
        let task = mirror_sync_status(Arc::clone(&h.checkout), rx, cancel.clone());

        tx.send(SyncStatus {
            is_online: false,
            pending: 4,
            failed: 2,
            last_drain: Some(crate::sync::DrainSummary {
                synced: 0,
                failed: 2,
                deferred: 0,
            }),
            ..SyncStatus::default()
        })
        .unwrap();

        let mut mirrored = None;
        for _ in 0..100 {
            let state = h.checkout.state().unwrap();
            if state.sync.pending == 4 {
                mirrored = Some(state);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let state = mirrored.expect("status mirrored");
        assert!(state.sync.is_offline);
        assert_eq!(
            state.ui.notification.map(|n| n.kind),
            Some(NotificationKind::Error)
        );

        cancel.cancel();
        task.await.unwrap();
    }
}
