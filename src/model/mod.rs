//! Order events and the notification projections derived from them.
//!
//! An [`Order`] is produced by the generator and never mutated afterwards.
//! The publisher derives exactly one [`LogEntry`], [`BuyerNotice`] and
//! [`SellerNotice`] from each order; every projection carries the source
//! order's id and nothing else that identifies it.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Routing key for audit log entries.
pub const LOG_ROUTING_KEY: &str = "log.orders";
/// Routing key for buyer-facing notifications.
pub const BUYER_ROUTING_KEY: &str = "notify.users";
/// Routing key for seller-facing notifications.
pub const SELLER_ROUTING_KEY: &str = "notify.sellers";

/// Content type attached to every published projection.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A synthetic "order placed" event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub item: String,
    pub price: u32,
    pub shop: String,
    pub buyer: String,
    pub address: String,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Audit projection.
    pub fn log_entry(&self) -> LogEntry {
        LogEntry {
            order_id: self.id,
            buyer: self.buyer.clone(),
            price: self.price,
            created_at: self.created_at,
        }
    }

    /// Buyer-facing projection.
    pub fn buyer_notice(&self) -> BuyerNotice {
        BuyerNotice {
            order_id: self.id,
            item: self.item.clone(),
        }
    }

    /// Seller-facing projection.
    pub fn seller_notice(&self) -> SellerNotice {
        SellerNotice {
            order_id: self.id,
            buyer: self.buyer.clone(),
            address: self.address.clone(),
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Order ID: {}\nName: {}\nPrice: {}\nShop: {}\nBuyer: {}\nAddress: {}\nCreated At: {}",
            self.id,
            self.item,
            self.price,
            self.shop,
            self.buyer,
            self.address,
            self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
    }
}

/// Audit record published on [`LOG_ROUTING_KEY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub order_id: Uuid,
    pub buyer: String,
    pub price: u32,
    pub created_at: DateTime<Utc>,
}

/// Buyer notification published on [`BUYER_ROUTING_KEY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyerNotice {
    pub order_id: Uuid,
    pub item: String,
}

/// Seller notification published on [`SELLER_ROUTING_KEY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerNotice {
    pub order_id: Uuid,
    pub buyer: String,
    pub address: String,
}

/// The three projection kinds, one per routing key and queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Log,
    BuyerNotice,
    SellerNotice,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [
        MessageKind::Log,
        MessageKind::BuyerNotice,
        MessageKind::SellerNotice,
    ];

    /// Fixed routing key for this kind.
    pub fn routing_key(self) -> &'static str {
        match self {
            MessageKind::Log => LOG_ROUTING_KEY,
            MessageKind::BuyerNotice => BUYER_ROUTING_KEY,
            MessageKind::SellerNotice => SELLER_ROUTING_KEY,
        }
    }

    /// Short label used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Log => "log",
            MessageKind::BuyerNotice => "buyer_notice",
            MessageKind::SellerNotice => "seller_notice",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded delivery, tagged by the queue it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Log(LogEntry),
    Buyer(BuyerNotice),
    Seller(SellerNotice),
}

impl Notification {
    /// Decode a payload as the projection expected for `kind`.
    pub fn decode(kind: MessageKind, payload: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageKind::Log => Notification::Log(serde_json::from_slice(payload)?),
            MessageKind::BuyerNotice => Notification::Buyer(serde_json::from_slice(payload)?),
            MessageKind::SellerNotice => Notification::Seller(serde_json::from_slice(payload)?),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Notification::Log(_) => MessageKind::Log,
            Notification::Buyer(_) => MessageKind::BuyerNotice,
            Notification::Seller(_) => MessageKind::SellerNotice,
        }
    }

    pub fn order_id(&self) -> Uuid {
        match self {
            Notification::Log(entry) => entry.order_id,
            Notification::Buyer(notice) => notice.order_id,
            Notification::Seller(notice) => notice.order_id,
        }
    }
}
