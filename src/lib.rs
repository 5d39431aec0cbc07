pub mod coordinator;
pub mod error;
pub mod evaluate;
pub mod loss;
pub mod model;
pub mod training;
