//! Payment record schema.
//!
//! Records cross the remote-store boundary as JSON documents. The store
//! still holds documents written by earlier releases (boolean
//! `paid`/`voided` pair instead of a status tag, `products` item arrays,
//! bare-number discounts with a separate `discountType`, delivery extras
//! at the top level), so deserialization goes through a raw mirror that
//! normalizes every legacy spelling in one place. Business logic only
//! ever sees the current schema.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SyncError;

/// Reserved prefix marking a record created offline, not yet synced.
pub const LOCAL_ID_PREFIX: &str = "offline-";

/// Generate a local id: prefix + creation epoch-millis + random suffix.
/// Locally unique and recognizable as not-yet-synced.
pub fn generate_local_id(now_ms: i64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{LOCAL_ID_PREFIX}{now_ms}-{}", &suffix[..8])
}

/// True for ids generated by `generate_local_id`.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Voided,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Voided => "voided",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    GCash,
    Card,
    Maya,
}

impl PaymentMethod {
    /// Cash discounts are a till rule: only cash sales may carry one.
    pub fn allows_discount(self) -> bool {
        matches!(self, PaymentMethod::Cash)
    }

    /// Non-cash methods settle exactly, so tender/change tracking is
    /// bypassed for them.
    pub fn bypasses_tender_tracking(self) -> bool {
        !matches!(self, PaymentMethod::Cash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SalesChannel {
    #[default]
    #[serde(alias = "in-store")]
    InStore,
    Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountKind {
    Fixed,
    Percentage,
}

// ---------------------------------------------------------------------------
// Sub-records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    #[serde(alias = "productId")]
    pub item_id: String,
    #[serde(alias = "productName")]
    pub name: String,
    #[serde(alias = "price")]
    pub unit_price: f64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryInfo {
    #[serde(default, alias = "fbName")]
    pub contact_name: String,
    #[serde(default, alias = "contactNumber")]
    pub contact_number: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub time: String,
    #[serde(default, alias = "deliveryDate", skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmark: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Discount {
    pub amount: f64,
    pub kind: DiscountKind,
}

// ---------------------------------------------------------------------------
// PaymentRecord
// ---------------------------------------------------------------------------

/// The unit of the ledger.
///
/// `price` is the persisted final total, computed once at the moment of
/// the authoritative write; receipts and reporting read it back rather
/// than recomputing from possibly-stale inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawPaymentRecord")]
pub struct PaymentRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub customer_name: String,
    /// Logical sale time, epoch millis. May be backdated by the operator.
    pub created_at: i64,
    pub line_items: Vec<LineItem>,
    pub sales_channel: SalesChannel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_fee: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount: Option<Discount>,
    pub payment_status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_tendered: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_given: Option<f64>,
    /// Final total: subtotal + delivery fee - discount, floored at zero.
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cashier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voided_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voided_at: Option<i64>,
    /// Local-cache tombstone flag; never synced while false.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl PaymentRecord {
    /// A fresh unpaid record with no id assigned yet.
    pub fn new(customer_name: impl Into<String>, line_items: Vec<LineItem>) -> Self {
        let name = customer_name.into();
        PaymentRecord {
            id: None,
            customer_name: if name.trim().is_empty() {
                "N/A".to_string()
            } else {
                name
            },
            created_at: Utc::now().timestamp_millis(),
            line_items,
            sales_channel: SalesChannel::InStore,
            delivery: None,
            delivery_fee: None,
            discount: None,
            payment_status: PaymentStatus::Unpaid,
            payment_method: None,
            amount_tendered: None,
            change_given: None,
            price: 0.0,
            cashier: None,
            voided_by: None,
            voided_at: None,
            deleted: false,
        }
    }

    pub fn has_local_id(&self) -> bool {
        self.id.as_deref().map(is_local_id).unwrap_or(false)
    }

    pub fn from_value(v: &Value) -> Result<Self, SyncError> {
        serde_json::from_value(v.clone())
            .map_err(|e| SyncError::Invalid(format!("malformed payment record: {e}")))
    }

    pub fn to_value(&self) -> Result<Value, SyncError> {
        serde_json::to_value(self)
            .map_err(|e| SyncError::Invalid(format!("serialize payment record: {e}")))
    }

    /// Last-writer-wins merge: fields present in the patch overwrite,
    /// omitted fields are retained. This is the documented update
    /// contract for both the local cache and the remote store.
    pub fn merged(&self, patch: &PaymentPatch) -> PaymentRecord {
        let mut out = self.clone();
        if let Some(v) = &patch.customer_name {
            out.customer_name = v.clone();
        }
        if let Some(v) = patch.created_at {
            out.created_at = v;
        }
        if let Some(v) = &patch.line_items {
            out.line_items = v.clone();
        }
        if let Some(v) = patch.sales_channel {
            out.sales_channel = v;
        }
        if let Some(v) = &patch.delivery {
            out.delivery = Some(v.clone());
        }
        if let Some(v) = patch.delivery_fee {
            out.delivery_fee = Some(v);
        }
        if let Some(v) = patch.discount {
            out.discount = Some(v);
        }
        if let Some(v) = patch.payment_status {
            out.payment_status = v;
        }
        if let Some(v) = patch.payment_method {
            out.payment_method = Some(v);
        }
        if let Some(v) = patch.amount_tendered {
            out.amount_tendered = Some(v);
        }
        if let Some(v) = patch.change_given {
            out.change_given = Some(v);
        }
        if let Some(v) = &patch.cashier {
            out.cashier = Some(v.clone());
        }
        if let Some(v) = &patch.voided_by {
            out.voided_by = Some(v.clone());
        }
        if let Some(v) = patch.voided_at {
            out.voided_at = Some(v);
        }
        out
    }
}

/// Partial update to a `PaymentRecord`. `None` means "retain".
///
/// The persisted total is deliberately not patchable: `price` is always
/// recomputed from the merged inputs at the authoritative write, so a
/// caller-supplied value (including a stale or negative one) can never
/// land in the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_items: Option<Vec<LineItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sales_channel: Option<SalesChannel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_fee: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount: Option<Discount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_tendered: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_given: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cashier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voided_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voided_at: Option<i64>,
}

impl PaymentPatch {
    pub fn from_value(v: &Value) -> Result<Self, SyncError> {
        serde_json::from_value(v.clone())
            .map_err(|e| SyncError::Invalid(format!("malformed payment patch: {e}")))
    }

    pub fn to_value(&self) -> Result<Value, SyncError> {
        serde_json::to_value(self)
            .map_err(|e| SyncError::Invalid(format!("serialize payment patch: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Legacy-document normalization
// ---------------------------------------------------------------------------

/// Discounts were stored as a bare number with a sibling `discountType`
/// before the tagged form existed.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDiscount {
    Tagged(Discount),
    Amount(f64),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPaymentRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    customer_name: Option<String>,
    #[serde(default)]
    created_at: i64,
    #[serde(default, alias = "products")]
    line_items: Vec<LineItem>,
    #[serde(default, alias = "salesType")]
    sales_channel: SalesChannel,
    #[serde(default)]
    delivery: Option<DeliveryInfo>,
    #[serde(default, alias = "deliveryCharge")]
    delivery_fee: Option<f64>,
    #[serde(default, alias = "deliveryLandmark")]
    delivery_landmark: Option<String>,
    #[serde(default, alias = "deliveryRemarks")]
    delivery_remarks: Option<String>,
    #[serde(default)]
    discount: Option<RawDiscount>,
    #[serde(default)]
    discount_type: Option<DiscountKind>,
    #[serde(default)]
    payment_status: Option<PaymentStatus>,
    #[serde(default)]
    paid: Option<bool>,
    #[serde(default)]
    voided: Option<bool>,
    #[serde(default)]
    payment_method: Option<PaymentMethod>,
    #[serde(default)]
    amount_tendered: Option<f64>,
    #[serde(default, alias = "change")]
    change_given: Option<f64>,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    cashier: Option<String>,
    #[serde(default)]
    voided_by: Option<String>,
    #[serde(default)]
    voided_at: Option<i64>,
    #[serde(default)]
    deleted: bool,
}

impl From<RawPaymentRecord> for PaymentRecord {
    fn from(raw: RawPaymentRecord) -> Self {
        // Status tag wins; otherwise migrate the boolean pair. Voided
        // dominates paid, matching how the old dashboard filtered.
        let payment_status = raw.payment_status.unwrap_or({
            if raw.voided == Some(true) {
                PaymentStatus::Voided
            } else if raw.paid == Some(true) {
                PaymentStatus::Paid
            } else {
                PaymentStatus::Unpaid
            }
        });

        let discount = raw.discount.map(|d| match d {
            RawDiscount::Tagged(d) => d,
            RawDiscount::Amount(amount) => Discount {
                amount,
                kind: raw.discount_type.unwrap_or(DiscountKind::Fixed),
            },
        });

        // Old documents kept landmark/remarks outside the delivery block.
        let delivery = match (raw.delivery, raw.delivery_landmark, raw.delivery_remarks) {
            (Some(mut d), landmark, remarks) => {
                if d.landmark.is_none() {
                    d.landmark = landmark;
                }
                if d.remarks.is_none() {
                    d.remarks = remarks;
                }
                Some(d)
            }
            (None, None, None) => None,
            (None, landmark, remarks) => Some(DeliveryInfo {
                landmark,
                remarks,
                ..DeliveryInfo::default()
            }),
        };

        let customer_name = raw
            .customer_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "N/A".to_string());

        PaymentRecord {
            id: raw.id,
            customer_name,
            created_at: raw.created_at,
            line_items: raw.line_items,
            sales_channel: raw.sales_channel,
            delivery,
            delivery_fee: raw.delivery_fee,
            discount,
            payment_status,
            payment_method: raw.payment_method,
            amount_tendered: raw.amount_tendered,
            change_given: raw.change_given,
            price: raw.price,
            cashier: raw.cashier,
            voided_by: raw.voided_by,
            voided_at: raw.voided_at,
            deleted: raw.deleted,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
