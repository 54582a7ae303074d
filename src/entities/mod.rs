pub mod attendee;
pub mod lead;
pub mod payment_transaction;
pub mod promo_code;
pub mod purchase;
pub mod purchase_item;
pub mod purchaser;
