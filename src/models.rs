//! Persisted record types.
//!
//! Field names serialize as camelCase so queue payloads match what the admin
//! dashboard endpoints expect. Monetary fields default to zero when missing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{timestamp_key, Collection, IndexName, Record};
use crate::money::{self, GstSplit, SupplyType};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Issued => "issued",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "issued" => Some(Self::Issued),
            "paid" | "completed" => Some(Self::Paid),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Upi,
    Wallet,
    Credit,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Completed,
    Voided,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Voided => "voided",
            Self::Refunded => "refunded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "completed" | "paid" => Some(Self::Completed),
            "voided" => Some(Self::Voided),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Fixed,
    Percentage,
}

/// A cart- or invoice-level discount as entered by the cashier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discount {
    #[serde(default)]
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub kind: DiscountType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Invoice-level tax totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBreakdown {
    #[serde(default)]
    pub cgst: Decimal,
    #[serde(default)]
    pub sgst: Decimal,
    #[serde(default)]
    pub igst: Decimal,
    #[serde(default)]
    pub cess: Decimal,
    #[serde(default)]
    pub total_tax: Decimal,
}

// ---------------------------------------------------------------------------
// Line items
// ---------------------------------------------------------------------------

/// One line of an invoice.
///
/// Product name, HSN code and tax rates are snapshotted when the line is
/// created so later product edits never change a historical invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemRecord {
    pub id: String,
    pub invoice_id: String,
    pub tenant_id: String,
    pub product_id: String,
    #[serde(default)]
    pub barcode: Option<String>,
    pub product_name: String,
    #[serde(default)]
    pub hsn_code: Option<String>,
    #[serde(default)]
    pub quantity: Decimal,
    #[serde(default)]
    pub unit_price: Decimal,
    /// Per-line discount amount, applied before tax.
    #[serde(default)]
    pub discount: Decimal,
    #[serde(default)]
    pub line_total: Decimal,
    #[serde(default)]
    pub tax_rate: Decimal,
    #[serde(default)]
    pub tax_amount: Decimal,
    #[serde(default)]
    pub cgst: Decimal,
    #[serde(default)]
    pub sgst: Decimal,
    #[serde(default)]
    pub igst: Decimal,
    #[serde(default)]
    pub cess_rate: Decimal,
    #[serde(default)]
    pub cess_amount: Decimal,
    #[serde(default)]
    pub supply_type: SupplyType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl LineItemRecord {
    /// Build a line from a cached product, computing totals and the GST split.
    pub fn from_product(
        invoice_id: &str,
        product: &ProductRecord,
        quantity: Decimal,
        supply_type: SupplyType,
        now: DateTime<Utc>,
    ) -> Self {
        let mut line = Self {
            id: uuid::Uuid::new_v4().to_string(),
            invoice_id: invoice_id.to_string(),
            tenant_id: product.tenant_id.clone(),
            product_id: product.id.clone(),
            barcode: product.barcode.clone(),
            product_name: product.name.clone(),
            hsn_code: product.hsn_code.clone(),
            quantity,
            unit_price: product.unit_price,
            discount: Decimal::ZERO,
            line_total: Decimal::ZERO,
            tax_rate: product.tax_rate,
            tax_amount: Decimal::ZERO,
            cgst: Decimal::ZERO,
            sgst: Decimal::ZERO,
            igst: Decimal::ZERO,
            cess_rate: product.cess_rate,
            cess_amount: Decimal::ZERO,
            supply_type,
            created_at: now,
            synced_at: None,
        };
        line.recompute();
        line
    }

    /// Recompute line total, tax and split from quantity, price, discount
    /// and the line's own snapshotted rates.
    pub fn recompute(&mut self) {
        self.line_total = money::round_money(money::mul(self.unit_price, self.quantity));
        self.discount = money::clamp_non_negative(self.discount, self.line_total);
        let taxable = self.line_total - self.discount;
        let tax = money::percent_of(taxable, self.tax_rate);
        let split = money::split_gst(tax, self.supply_type);
        self.apply_split(split);
        self.cess_amount = money::percent_of(taxable, self.cess_rate);
    }

    /// Refresh `line_total` from price and quantity. Stored tax is kept.
    pub fn refresh_total(&mut self) {
        self.line_total = money::round_money(money::mul(self.unit_price, self.quantity));
        self.discount = money::clamp_non_negative(self.discount, self.line_total);
    }

    /// Change the quantity, scaling the stored tax and cess in proportion.
    /// A line with no previous quantity has nothing to scale and is
    /// recomputed from its rates.
    pub fn set_quantity(&mut self, quantity: Decimal) {
        let previous = self.quantity;
        self.quantity = quantity;
        if previous.is_zero() {
            self.recompute();
            return;
        }
        let tax = money::scale(self.tax_amount, quantity, previous);
        let cess = money::scale(self.cess_amount, quantity, previous);
        self.resplit(tax);
        self.cess_amount = cess;
        self.refresh_total();
    }

    /// Fold another line for the same product into this one, summing the
    /// stored tax of both.
    pub fn absorb(&mut self, other: &LineItemRecord) {
        self.quantity = money::add(self.quantity, other.quantity);
        let tax = money::add(self.tax_amount, other.tax_amount);
        self.cess_amount = money::add(self.cess_amount, other.cess_amount);
        self.resplit(tax);
        self.refresh_total();
    }

    /// Split `tax` the same way the stored split was made.
    fn resplit(&mut self, tax: Decimal) {
        let supply = if !self.igst.is_zero() {
            SupplyType::Interstate
        } else if !money::add(self.cgst, self.sgst).is_zero() {
            SupplyType::Intrastate
        } else {
            self.supply_type
        };
        self.apply_split(money::split_gst(tax, supply));
    }

    fn apply_split(&mut self, split: GstSplit) {
        self.tax_amount = split.total();
        self.cgst = split.cgst;
        self.sgst = split.sgst;
        self.igst = split.igst;
    }

    pub fn split(&self) -> GstSplit {
        GstSplit {
            cgst: self.cgst,
            sgst: self.sgst,
            igst: self.igst,
        }
    }
}

// ---------------------------------------------------------------------------
// Invoices and payments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRecord {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub line_items: Vec<LineItemRecord>,
    #[serde(default)]
    pub subtotal: Decimal,
    #[serde(default)]
    pub discount: Option<Discount>,
    #[serde(default)]
    pub discount_amount: Decimal,
    #[serde(default)]
    pub tax: TaxBreakdown,
    #[serde(default)]
    pub total_amount: Decimal,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    pub status: InvoiceStatus,
    /// Assigned by the server; absent until the first successful round-trip.
    #[serde(default)]
    pub invoice_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_offline_only: bool,
    pub device_id: String,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl InvoiceRecord {
    /// Only server-confirmed invoices are authoritative.
    pub fn is_authoritative(&self) -> bool {
        self.synced_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: String,
    pub tenant_id: String,
    pub invoice_id: String,
    #[serde(default)]
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    #[serde(default)]
    pub reference: Option<String>,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Cached server entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRecord {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub gstin: Option<String>,
    #[serde(default)]
    pub state_code: Option<String>,
    /// Known to exist server-side but not guaranteed fresh.
    #[serde(default)]
    pub is_online_only: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecord {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub hsn_code: Option<String>,
    #[serde(default)]
    pub unit_price: Decimal,
    #[serde(default)]
    pub tax_rate: Decimal,
    #[serde(default)]
    pub cess_rate: Decimal,
    #[serde(default)]
    pub is_online_only: bool,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sync queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Invoice,
    Payment,
    LineItem,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Payment => "payment",
            Self::LineItem => "lineItem",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

/// Queue payload, tagged by entity type so each variant is schema-checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType", content = "data", rename_all = "camelCase")]
pub enum SyncPayload {
    Invoice(InvoiceRecord),
    Payment(PaymentRecord),
    LineItem(LineItemRecord),
}

impl SyncPayload {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Invoice(_) => EntityType::Invoice,
            Self::Payment(_) => EntityType::Payment,
            Self::LineItem(_) => EntityType::LineItem,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            Self::Invoice(r) => &r.id,
            Self::Payment(r) => &r.id,
            Self::LineItem(r) => &r.id,
        }
    }

    /// The bare entity JSON sent as the request body.
    pub fn to_body(&self) -> serde_json::Result<Value> {
        match self {
            Self::Invoice(r) => serde_json::to_value(r),
            Self::Payment(r) => serde_json::to_value(r),
            Self::LineItem(r) => serde_json::to_value(r),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueRecord {
    pub id: String,
    pub tenant_id: String,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub payload: SyncPayload,
    pub status: QueueStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_sync_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    /// Earliest time the next attempt may run (backoff).
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Field names that differed during the last merge-resolved conflict.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflict_fields: Vec<String>,
}

impl SyncQueueRecord {
    pub fn entity_type(&self) -> EntityType {
        self.payload.entity_type()
    }

    pub fn entity_key(&self) -> String {
        entity_key(self.entity_type(), &self.entity_id, self.operation)
    }
}

/// Coalescing key for queue records: one pending record per entity/operation.
pub fn entity_key(entity_type: EntityType, entity_id: &str, operation: SyncOperation) -> String {
    format!(
        "{}:{}:{}",
        entity_type.as_str(),
        entity_id,
        operation.as_str()
    )
}

// ---------------------------------------------------------------------------
// Record impls
// ---------------------------------------------------------------------------

impl Record for InvoiceRecord {
    const COLLECTION: Collection = Collection::Invoices;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, index: IndexName) -> Option<String> {
        match index {
            IndexName::TenantId => Some(self.tenant_id.clone()),
            IndexName::Status => Some(self.status.as_str().to_string()),
            IndexName::CreatedAt => Some(timestamp_key(&self.created_at)),
            _ => None,
        }
    }
}

impl Record for LineItemRecord {
    const COLLECTION: Collection = Collection::LineItems;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, index: IndexName) -> Option<String> {
        match index {
            IndexName::TenantId => Some(self.tenant_id.clone()),
            IndexName::Barcode => self.barcode.clone(),
            IndexName::InvoiceId => Some(self.invoice_id.clone()),
            _ => None,
        }
    }
}

impl Record for PaymentRecord {
    const COLLECTION: Collection = Collection::Payments;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, index: IndexName) -> Option<String> {
        match index {
            IndexName::TenantId => Some(self.tenant_id.clone()),
            IndexName::CreatedAt => Some(timestamp_key(&self.created_at)),
            IndexName::InvoiceId => Some(self.invoice_id.clone()),
            _ => None,
        }
    }
}

impl Record for CustomerRecord {
    const COLLECTION: Collection = Collection::Customers;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, index: IndexName) -> Option<String> {
        match index {
            IndexName::TenantId => Some(self.tenant_id.clone()),
            _ => None,
        }
    }
}

impl Record for ProductRecord {
    const COLLECTION: Collection = Collection::Products;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, index: IndexName) -> Option<String> {
        match index {
            IndexName::TenantId => Some(self.tenant_id.clone()),
            IndexName::Barcode => self.barcode.clone(),
            _ => None,
        }
    }
}

impl Record for SyncQueueRecord {
    const COLLECTION: Collection = Collection::SyncQueue;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, index: IndexName) -> Option<String> {
        match index {
            IndexName::TenantId => Some(self.tenant_id.clone()),
            IndexName::Status => Some(self.status.as_str().to_string()),
            IndexName::CreatedAt => Some(timestamp_key(&self.created_at)),
            IndexName::EntityKey => Some(self.entity_key()),
            _ => None,
        }
    }
}
