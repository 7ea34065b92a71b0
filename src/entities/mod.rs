pub mod invoice;
pub mod invoice_item;
pub mod invoice_payment;
pub mod order;
pub mod order_detail;

pub use invoice::InvoiceStatus;
pub use invoice_payment::PaymentMethod;
pub use order::{DeliveryMethod, OrderPaymentStatus, OrderStatus};
pub use order_detail::{CylinderCondition, TransactionType};
