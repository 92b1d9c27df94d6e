//! Cart entities and lifecycle.

mod model;
mod state;

pub use model::{
    Cart, CartItem, CartView, DEFAULT_CART_TIMEOUT_DAYS, REACTIVATION_WINDOW_HOURS, TimeRemaining,
};
pub use state::CartStatus;
