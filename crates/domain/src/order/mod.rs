//! Order entities and settlement state machine.

mod model;
mod state;

pub use model::{Order, OrderLine, OrderTotals, validate_lines};
pub use state::OrderStatus;
