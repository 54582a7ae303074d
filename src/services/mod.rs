// Pure helpers
pub mod currency;

// Lead and discount handling
pub mod leads;
pub mod promotions;

// Checkout flow
pub mod checkout;
pub mod purchases;

// Settlement
pub mod payments;
