mod router;

pub use router::{with_state, BoxedHandler, Router};
