pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod worker;
