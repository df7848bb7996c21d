mod keeper;

pub use keeper::{Keeper, DEFAULT_DEBOUNCE};
